//! Error taxonomy for the ingest and streaming core.
//!
//! Decode failures and duplicate scans are not errors; they surface as
//! [`IngestOutcome`](crate::ingest::IngestOutcome) values. What remains here
//! is what a caller has to act on.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TallyError {
    /// The scan device is unavailable or was disconnected.
    #[error("device {device} unavailable: {source}")]
    Device {
        device: String,
        #[source]
        source: io::Error,
    },

    /// A partition could not be read or written.
    #[error("partition storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A row in a partition file could not be parsed.
    #[error("malformed row {row} in {}: {reason}", path.display())]
    Malformed {
        path: PathBuf,
        row: usize,
        reason: String,
    },
}

impl TallyError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn device(device: impl Into<String>, source: io::Error) -> Self {
        Self::Device {
            device: device.into(),
            source,
        }
    }
}

pub type TallyResult<T> = std::result::Result<T, TallyError>;
