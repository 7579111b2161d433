//! Test helpers for composing feeds and invoking commands in-process.

use super::*;
use camino::Utf8PathBuf;
use chargesync_core::CanonicalStation;
use chargesync_core::test_support::{connector, ndjson, station};
use serde::de::DeserializeOwned;
use std::fs;
use tempfile::TempDir;

pub(super) struct Workspace {
    _dir: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    pub(super) fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 workspace");
        Self { _dir: dir, root }
    }

    pub(super) fn db(&self) -> Utf8PathBuf {
        self.root.join("state/chargesync.db")
    }

    pub(super) fn write_feed(&self, name: &str, stations: &[CanonicalStation]) -> Utf8PathBuf {
        let path = self.root.join(name);
        let document = ndjson(&stations.iter().collect::<Vec<_>>());
        fs::write(&path, document).expect("write feed");
        path
    }
}

/// Three distinct stations; with `broken` the second one carries a negative
/// connector power that the target table rejects.
pub(super) fn sample_feed(broken: bool) -> Vec<CanonicalStation> {
    [(50.01, 22.0), (50.02, if broken { -1.0 } else { 50.0 }), (50.03, 150.0)]
        .into_iter()
        .map(|(lat, power)| {
            let mut raw = station("PRE", lat, 14.4);
            raw.connectors = vec![connector("DC", "CCS2", power)];
            raw.canonicalize().expect("canonicalize")
        })
        .collect()
}

/// Parse `args` as a command line and run it, returning stdout.
pub(super) fn invoke(args: &[&str]) -> Result<String, CliError> {
    let cli = Cli::try_parse_from(std::iter::once("chargesync").chain(args.iter().copied()))?;
    let mut output = Vec::new();
    run_command(cli.command, &mut output)?;
    Ok(String::from_utf8(output).expect("utf-8 output"))
}

pub(super) fn report<T: DeserializeOwned>(output: &str) -> T {
    serde_json::from_str(output).expect("JSON report")
}
