//! Operator commands on the delta queue: `queue-status` and `requeue`.

use std::io::Write;
use std::time::Duration;

use camino::Utf8PathBuf;
use chargesync_core::QueueStore;
use clap::Parser;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};

use crate::{
    ARG_DB, ARG_SOURCE, ARG_STALE_PROCESSING, CliError, open_existing_store, write_report,
};

pub(crate) const ENV_QUEUE_STATUS_DB: &str = "CHARGESYNC_CMDS_QUEUE_STATUS_DB";
pub(crate) const ENV_REQUEUE_DB: &str = "CHARGESYNC_CMDS_REQUEUE_DB";

/// CLI arguments for the `queue-status` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(name = "queue-status", about = "Report queue item counts per status")]
#[ortho_config(prefix = "CHARGESYNC")]
pub(crate) struct QueueStatusArgs {
    /// Path to the state database.
    #[arg(long = ARG_DB, value_name = "path")]
    #[serde(default)]
    pub(crate) db: Option<Utf8PathBuf>,
    /// Only count items from this source.
    #[arg(long = ARG_SOURCE, value_name = "name")]
    #[serde(default)]
    pub(crate) source: Option<String>,
}

/// CLI arguments for the `requeue` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    name = "requeue",
    long_about = "Move every station whose newest queue item FAILED back \
                 to PENDING. Attempt counts and the last error are kept. \
                 With --stale-processing, release items a crashed consumer \
                 left PROCESSING instead; only use it once that consumer is \
                 known to be gone.",
    about = "Move failed items back to pending"
)]
#[ortho_config(prefix = "CHARGESYNC")]
pub(crate) struct RequeueArgs {
    /// Path to the state database.
    #[arg(long = ARG_DB, value_name = "path")]
    #[serde(default)]
    pub(crate) db: Option<Utf8PathBuf>,
    /// Only requeue items from this source.
    #[arg(long = ARG_SOURCE, value_name = "name")]
    #[serde(default)]
    pub(crate) source: Option<String>,
    /// Release PROCESSING items untouched for at least this many seconds.
    #[arg(long = ARG_STALE_PROCESSING, value_name = "seconds")]
    #[serde(default)]
    pub(crate) stale_processing: Option<u64>,
}

/// Resolved configuration shared by the queue commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueConfig {
    pub(crate) db: Utf8PathBuf,
    pub(crate) source: Option<String>,
    /// Set when `requeue` should release stale `PROCESSING` items.
    pub(crate) stale_processing: Option<Duration>,
}

impl QueueConfig {
    fn resolve(
        db: Option<Utf8PathBuf>,
        source: Option<String>,
        env: &'static str,
    ) -> Result<Self, CliError> {
        let db = db.ok_or(CliError::MissingArgument { field: ARG_DB, env })?;
        Ok(Self {
            db,
            source,
            stale_processing: None,
        })
    }
}

impl TryFrom<QueueStatusArgs> for QueueConfig {
    type Error = CliError;

    fn try_from(args: QueueStatusArgs) -> Result<Self, Self::Error> {
        Self::resolve(args.db, args.source, ENV_QUEUE_STATUS_DB)
    }
}

impl TryFrom<RequeueArgs> for QueueConfig {
    type Error = CliError;

    fn try_from(args: RequeueArgs) -> Result<Self, Self::Error> {
        let config = Self::resolve(args.db, args.source, ENV_REQUEUE_DB)?;
        Ok(Self {
            stale_processing: args.stale_processing.map(Duration::from_secs),
            ..config
        })
    }
}

/// Outcome of `chargesync requeue`.
#[derive(Debug, Serialize)]
pub(crate) struct RequeueReport {
    requeued: u64,
}

pub(crate) fn run_queue_status(
    args: QueueStatusArgs,
    writer: &mut dyn Write,
) -> Result<(), CliError> {
    let merged = args.load_and_merge().map_err(CliError::Configuration)?;
    execute_queue_status(&QueueConfig::try_from(merged)?, writer)
}

pub(crate) fn execute_queue_status(
    config: &QueueConfig,
    writer: &mut dyn Write,
) -> Result<(), CliError> {
    let store = open_existing_store(&config.db)?;
    let counts = store.status_counts(config.source.as_deref())?;
    write_report(writer, &counts)
}

pub(crate) fn run_requeue(args: RequeueArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let merged = args.load_and_merge().map_err(CliError::Configuration)?;
    execute_requeue(&QueueConfig::try_from(merged)?, writer)
}

pub(crate) fn execute_requeue(config: &QueueConfig, writer: &mut dyn Write) -> Result<(), CliError> {
    let store = open_existing_store(&config.db)?;
    let source = config.source.as_deref();
    let requeued = match config.stale_processing {
        Some(older_than) => store.requeue_stale_processing(source, older_than)?,
        None => store.requeue_failed(source)?,
    };
    write_report(writer, &RequeueReport { requeued })
}
