//! Entry point for the command-line interface.
#![forbid(unsafe_code)]

use chargesync_cli::CliError;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    init_logging();
    match chargesync_cli::run() {
        Ok(()) => {}
        Err(CliError::ArgumentParsing(err)) => err.exit(),
        Err(err) => {
            eprintln!("chargesync: {}", chargesync_core::error_chain(&err));
            std::process::exit(1);
        }
    }
}

/// Log to stderr, filtered by `RUST_LOG` (default `info`). Records emitted
/// through the `log` facade are bridged into the subscriber.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
    if let Err(err) = installed {
        eprintln!("chargesync: logging disabled: {err}");
    }
}
