//! Error types emitted by the chargesync CLI.
//!
//! Keep this error type reasonably small, as many CLI helpers return
//! `Result<_, CliError>`.

use std::sync::Arc;

use camino::Utf8PathBuf;
use chargesync_data::{PipelineError, SchemaError, StoreError};
use thiserror::Error;

/// Errors emitted by the chargesync CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Provided arguments failed Clap validation.
    #[error(transparent)]
    ArgumentParsing(#[from] clap::Error),
    /// Configuration layering failed (files, env, CLI).
    #[error("failed to load configuration: {0}")]
    Configuration(#[from] Arc<ortho_config::OrthoError>),
    /// A required option is missing after configuration merging.
    #[error("missing {field} (set --{field} or {env})")]
    MissingArgument {
        field: &'static str,
        env: &'static str,
    },
    /// An option was supplied with an unusable value.
    #[error("invalid {field}: {reason}")]
    InvalidArgument {
        field: &'static str,
        reason: &'static str,
    },
    /// A configured target table name is not a plain SQL identifier.
    #[error("invalid target table configuration")]
    TargetTables(#[source] SchemaError),
    /// A referenced input path does not exist on disk or is not a file.
    #[error("{field} path {path:?} does not exist or is not a file")]
    MissingSourceFile {
        field: &'static str,
        path: Utf8PathBuf,
    },
    /// The state database has not been created yet.
    #[error("database {path:?} does not exist; run `chargesync init` first")]
    MissingDatabase { path: Utf8PathBuf },
    /// A referenced path could not be inspected due to an IO error.
    #[error("failed to inspect {field} path {path:?}")]
    InspectPath {
        field: &'static str,
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Opening or querying the state database failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Detection or application aborted.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    /// Serialising the command report failed.
    #[error("failed to serialise command output")]
    SerialiseOutput(#[source] serde_json::Error),
    /// Writing the command report failed.
    #[error("failed to write command output")]
    WriteOutput(#[source] std::io::Error),
}
