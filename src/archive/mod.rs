//! Compact per-issue-date forecast archives.
//!
//! One SQLite file per issue date, named `YYYYMMDD.sqlite`. Reach-level arrays
//! live in the `reaches` table keyed by `reach_index`, which keeps reach order
//! stable and makes reach-range reads cheap.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::warn;

use crate::error::ValidationError;

#[cfg(test)]
pub mod fixtures;
mod reader;
mod writer;

pub use reader::{Archive, ForecastSlice};
pub use writer::{ArchiveContents, write_archive};

pub const ARCHIVE_EXTENSION: &str = "sqlite";
pub const ARCHIVE_FORMAT_VERSION: &str = "1";
const FILE_DATE_FORMAT: &str = "%Y%m%d";

pub fn archive_file_name(issue_date: NaiveDate) -> String {
    format!("{}.{ARCHIVE_EXTENSION}", issue_date.format(FILE_DATE_FORMAT))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub issue_date: NaiveDate,
    pub path: PathBuf,
}

/// The archives of one directory, sorted by file name (and therefore by
/// issue date).
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
    entries: Vec<ArchiveEntry>,
}

impl ArchiveStore {
    pub fn discover(root: &Path) -> Result<Self> {
        let dir_entries =
            fs::read_dir(root).with_context(|| format!("failed to read {}", root.display()))?;

        let mut entries = Vec::new();
        for entry in dir_entries {
            let entry =
                entry.with_context(|| format!("failed to read entry in {}", root.display()))?;
            let path = entry.path();

            if !entry
                .file_type()
                .with_context(|| format!("failed to inspect file type: {}", path.display()))?
                .is_file()
            {
                continue;
            }

            let is_archive = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION))
                .unwrap_or(false);
            if !is_archive {
                continue;
            }

            match parse_issue_date(&path) {
                Some(issue_date) => entries.push(ArchiveEntry { issue_date, path }),
                None => warn!(path = %path.display(), "skipping archive without a YYYYMMDD name"),
            }
        }

        entries.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));

        Ok(Self {
            root: root.to_path_buf(),
            entries,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn open(&self, issue_date: NaiveDate) -> Result<Archive, ValidationError> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.issue_date == issue_date)
            .ok_or(ValidationError::MissingArchive { date: issue_date })?;

        if !entry.path.is_file() {
            return Err(ValidationError::MissingArchive { date: issue_date });
        }

        Archive::open(&entry.path, issue_date)
    }

    /// Reach identifiers shared by every archive, in archive order. Any
    /// archive that lists them differently is an alignment error.
    pub fn verified_rivids(&self) -> Result<Vec<i32>, ValidationError> {
        let mut entries = self.entries.iter();
        let Some(first) = entries.next() else {
            return Ok(Vec::new());
        };
        let expected = self.open(first.issue_date)?.rivids().to_vec();

        for entry in entries {
            let archive = self.open(entry.issue_date)?;
            if let Some(reason) = describe_reach_mismatch(&expected, archive.rivids()) {
                return Err(ValidationError::Alignment {
                    date: entry.issue_date,
                    reason,
                });
            }
        }

        Ok(expected)
    }
}

pub fn describe_reach_mismatch(expected: &[i32], found: &[i32]) -> Option<String> {
    if expected.len() != found.len() {
        return Some(format!(
            "holds {} reaches, expected {}",
            found.len(),
            expected.len()
        ));
    }
    expected
        .iter()
        .zip(found)
        .position(|(a, b)| a != b)
        .map(|index| {
            format!(
                "reach index {index} is rivid {}, expected {}",
                found[index], expected[index]
            )
        })
}

fn parse_issue_date(path: &Path) -> Option<NaiveDate> {
    let stem = path.file_stem()?.to_str()?;
    if stem.len() != 8 {
        return None;
    }
    NaiveDate::parse_from_str(stem, FILE_DATE_FORMAT).ok()
}
