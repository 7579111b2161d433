//! `detect` command: classify a feed and queue its changes.

use std::io::Write;

use camino::Utf8PathBuf;
use chargesync_core::DetectOptions;
use clap::Parser;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};

use crate::{
    ARG_DB, ARG_INPUT, ARG_LIMIT, ARG_SOURCE, ARG_SOURCE_VERSION, CliError, open_existing_store,
    require_file, write_report,
};

pub(crate) const ENV_DETECT_DB: &str = "CHARGESYNC_CMDS_DETECT_DB";
pub(crate) const ENV_DETECT_INPUT: &str = "CHARGESYNC_CMDS_DETECT_INPUT";
pub(crate) const ENV_DETECT_SOURCE: &str = "CHARGESYNC_CMDS_DETECT_SOURCE";
pub(crate) const ENV_DETECT_SOURCE_VERSION: &str = "CHARGESYNC_CMDS_DETECT_SOURCE_VERSION";

/// CLI arguments for the `detect` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    name = "detect",
    long_about = "Stream a canonical NDJSON feed (plain or bzip2), classify \
                 every station as NEW, CHANGED or UNCHANGED against the \
                 per-source index, and queue the NEW and CHANGED ones.",
    about = "Classify a feed and queue its changes"
)]
#[ortho_config(prefix = "CHARGESYNC")]
pub(crate) struct DetectArgs {
    /// Path to the state database.
    #[arg(long = ARG_DB, value_name = "path")]
    #[serde(default)]
    pub(crate) db: Option<Utf8PathBuf>,
    /// Canonical NDJSON feed, optionally bzip2-compressed.
    #[arg(long = ARG_INPUT, value_name = "path")]
    #[serde(default)]
    pub(crate) input: Option<Utf8PathBuf>,
    /// Source identifier, for example `cz-mpo`.
    #[arg(long = ARG_SOURCE, value_name = "name")]
    #[serde(default)]
    pub(crate) source: Option<String>,
    /// Version label of this import, for example the dataset date.
    #[arg(long = ARG_SOURCE_VERSION, value_name = "label")]
    #[serde(default)]
    pub(crate) source_version: Option<String>,
    /// Stop after this many rows.
    #[arg(long = ARG_LIMIT, value_name = "rows")]
    #[serde(default)]
    pub(crate) limit: Option<usize>,
}

impl DetectArgs {
    fn into_config(self) -> Result<DetectConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        DetectConfig::try_from(merged)
    }
}

/// Resolved `detect` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DetectConfig {
    pub(crate) db: Utf8PathBuf,
    pub(crate) input: Utf8PathBuf,
    pub(crate) options: DetectOptions,
}

impl TryFrom<DetectArgs> for DetectConfig {
    type Error = CliError;

    fn try_from(args: DetectArgs) -> Result<Self, Self::Error> {
        let db = args.db.ok_or(CliError::MissingArgument {
            field: ARG_DB,
            env: ENV_DETECT_DB,
        })?;
        let input = args.input.ok_or(CliError::MissingArgument {
            field: ARG_INPUT,
            env: ENV_DETECT_INPUT,
        })?;
        let source = non_blank(args.source).ok_or(CliError::MissingArgument {
            field: ARG_SOURCE,
            env: ENV_DETECT_SOURCE,
        })?;
        let source_version = non_blank(args.source_version).ok_or(CliError::MissingArgument {
            field: ARG_SOURCE_VERSION,
            env: ENV_DETECT_SOURCE_VERSION,
        })?;

        let mut options = DetectOptions::new(source, source_version);
        if let Some(limit) = args.limit {
            options = options.with_limit(limit);
        }
        Ok(Self { db, input, options })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

pub(crate) fn run_detect(args: DetectArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let config = args.into_config()?;
    execute_detect(&config, writer)
}

pub(crate) fn execute_detect(config: &DetectConfig, writer: &mut dyn Write) -> Result<(), CliError> {
    require_file(&config.input, ARG_INPUT)?;
    let store = open_existing_store(&config.db)?;
    let summary = chargesync_data::detect_file(&store, &config.input, &config.options)?;
    write_report(writer, &summary)
}

#[cfg(test)]
pub(crate) fn config_from_layers_for_test(
    layers: Vec<ortho_config::MergeLayer<'static>>,
) -> Result<DetectConfig, CliError> {
    let merged = DetectArgs::merge_from_layers(layers).map_err(CliError::from)?;
    DetectConfig::try_from(merged)
}
