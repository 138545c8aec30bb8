use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("no forecast archive exists for issue date {date}")]
    MissingArchive { date: NaiveDate },

    #[error("forecast archive {} is corrupt: {reason}", path.display())]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("reach ordering of the archive issued {date} disagrees with the first archive: {reason}")]
    Alignment { date: NaiveDate, reason: String },

    #[error(
        "memory budget of {budget_bytes} bytes cannot hold a single reach ({reach_bytes} bytes required)"
    )]
    InsufficientMemory { budget_bytes: u64, reach_bytes: u64 },

    #[error("metric '{metric}' is undefined for {samples} aligned samples")]
    UndefinedMetric { metric: &'static str, samples: usize },
}

impl ValidationError {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptArchive {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
