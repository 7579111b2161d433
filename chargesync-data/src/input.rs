//! Opening detector input files.
#![forbid(unsafe_code)]

use std::io::{self, BufRead, BufReader};

use bzip2::read::MultiBzDecoder;
use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// Leading bytes of every bzip2 stream.
const BZIP2_MAGIC: &[u8] = b"BZh";

/// Errors raised while opening an NDJSON input.
#[derive(Debug, Error)]
pub enum InputError {
    /// The file could not be opened.
    #[error("failed to open input {path}")]
    Open {
        /// Input location.
        path: Utf8PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
    /// The first bytes of the file could not be read.
    #[error("failed to read input {path}")]
    Read {
        /// Input location.
        path: Utf8PathBuf,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },
}

/// Open an NDJSON file, decompressing it when it is a bzip2 stream.
///
/// Compression is detected from the `BZh` magic bytes rather than the file
/// extension. Concatenated bzip2 streams are read back to back.
///
/// # Errors
/// Returns [`InputError::Open`] when the file is missing or unreadable.
pub fn open_ndjson(path: &Utf8Path) -> Result<Box<dyn BufRead + Send>, InputError> {
    let file = chargesync_fs::open_utf8_file(path).map_err(|source| InputError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let compressed = reader
        .fill_buf()
        .map_err(|source| InputError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .starts_with(BZIP2_MAGIC);

    if compressed {
        log::debug!("reading {path} as bzip2");
        Ok(Box::new(BufReader::new(MultiBzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bzip2::Compression;
    use bzip2::write::BzEncoder;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, bytes: &[u8]) -> Utf8PathBuf {
        let path = Utf8PathBuf::from_path_buf(dir.path().join(name)).expect("utf8 path");
        std::fs::write(&path, bytes).expect("write input");
        path
    }

    fn read_all(path: &Utf8Path) -> String {
        let mut contents = String::new();
        open_ndjson(path)
            .expect("open input")
            .read_to_string(&mut contents)
            .expect("read input");
        contents
    }

    #[test]
    fn plain_files_pass_through() {
        let dir = TempDir::new().expect("temp dir");
        let path = write_file(&dir, "feed.ndjson", b"{\"a\":1}\n{\"a\":2}\n");
        assert_eq!(read_all(&path), "{\"a\":1}\n{\"a\":2}\n");
    }

    #[test]
    fn bzip2_is_detected_by_magic_bytes() {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(b"{\"a\":1}\n").expect("compress");
        let compressed = encoder.finish().expect("finish stream");
        let dir = TempDir::new().expect("temp dir");
        let path = write_file(&dir, "feed.data", &compressed);

        assert_eq!(read_all(&path), "{\"a\":1}\n");
    }

    #[test]
    fn empty_files_are_plain() {
        let dir = TempDir::new().expect("temp dir");
        let path = write_file(&dir, "empty.ndjson", b"");
        assert_eq!(read_all(&path), "");
    }

    #[test]
    fn missing_input_is_an_error() {
        let dir = TempDir::new().expect("temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("absent.ndjson")).expect("utf8");
        let err = open_ndjson(&path).err().expect("missing file");
        assert!(matches!(err, InputError::Open { .. }));
    }
}
