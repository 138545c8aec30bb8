use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use chrono::{Days, NaiveDate};
use ndarray::{Array2, Array3, s};
use rusqlite::{Connection, params};
use tracing::info;

use super::{ARCHIVE_FORMAT_VERSION, archive_file_name};
use crate::model::{ENSEMBLE_MEMBERS, HIGH_RES_LEAD_DAYS, LEAD_DAYS};
use crate::util::{ensure_directory, staging_path_for};

/// Everything one compact archive stores for one issue date.
#[derive(Debug, Clone)]
pub struct ArchiveContents {
    pub region: String,
    pub issue_date: NaiveDate,
    pub rivids: Vec<i32>,
    pub initialization_values: Vec<Option<f32>>,
    /// `[reach, lead_day, member]`
    pub ensemble: Array3<f32>,
    /// `[reach, lead_day_hr]`
    pub high_res: Array2<f32>,
}

impl ArchiveContents {
    fn check_shapes(&self) -> Result<()> {
        let reaches = self.rivids.len();
        ensure!(
            self.initialization_values.len() == reaches,
            "{} initialization values for {reaches} reaches",
            self.initialization_values.len()
        );
        ensure!(
            self.ensemble.dim() == (reaches, LEAD_DAYS, ENSEMBLE_MEMBERS),
            "Qout shape {:?} does not match ({reaches}, {LEAD_DAYS}, {ENSEMBLE_MEMBERS})",
            self.ensemble.dim()
        );
        ensure!(
            self.high_res.dim() == (reaches, HIGH_RES_LEAD_DAYS),
            "Qout_high_res shape {:?} does not match ({reaches}, {HIGH_RES_LEAD_DAYS})",
            self.high_res.dim()
        );
        Ok(())
    }
}

/// Writes `contents` to `out_dir/YYYYMMDD.sqlite`, replacing any existing
/// archive for that date only once the new one is complete.
pub fn write_archive(out_dir: &Path, contents: &ArchiveContents) -> Result<PathBuf> {
    contents.check_shapes()?;
    ensure_directory(out_dir)?;

    let path = out_dir.join(archive_file_name(contents.issue_date));
    let staging_path = staging_path_for(&path)?;
    if staging_path.exists() {
        fs::remove_file(&staging_path)
            .with_context(|| format!("failed to remove stale {}", staging_path.display()))?;
    }

    if let Err(err) = populate(&staging_path, contents) {
        let _ = fs::remove_file(&staging_path);
        return Err(err);
    }

    fs::rename(&staging_path, &path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            staging_path.display(),
            path.display()
        )
    })?;

    info!(
        path = %path.display(),
        issue_date = %contents.issue_date,
        reaches = contents.rivids.len(),
        "wrote forecast archive"
    );

    Ok(path)
}

fn populate(path: &Path, contents: &ArchiveContents) -> Result<()> {
    let mut connection =
        Connection::open(path).with_context(|| format!("failed to create {}", path.display()))?;

    connection.execute_batch(
        "
        CREATE TABLE metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE lead_dates (
          variable TEXT NOT NULL,
          lead_index INTEGER NOT NULL,
          date TEXT NOT NULL,
          PRIMARY KEY(variable, lead_index)
        );

        CREATE TABLE reaches (
          reach_index INTEGER PRIMARY KEY,
          rivid INTEGER NOT NULL,
          initialization_value REAL,
          qout BLOB NOT NULL,
          qout_high_res BLOB NOT NULL
        );
        ",
    )?;

    let tx = connection.transaction()?;
    {
        let mut metadata = tx.prepare("INSERT INTO metadata(key, value) VALUES(?1, ?2)")?;
        for (key, value) in [
            ("format_version", ARCHIVE_FORMAT_VERSION.to_string()),
            ("start_date", contents.issue_date.format("%Y-%m-%d").to_string()),
            ("region", contents.region.clone()),
            ("lead_days", LEAD_DAYS.to_string()),
            ("ensemble_members", ENSEMBLE_MEMBERS.to_string()),
            ("high_res_lead_days", HIGH_RES_LEAD_DAYS.to_string()),
        ] {
            metadata.execute(params![key, value])?;
        }

        let mut lead_dates =
            tx.prepare("INSERT INTO lead_dates(variable, lead_index, date) VALUES(?1, ?2, ?3)")?;
        for (variable, count) in [("date", LEAD_DAYS), ("date_high_res", HIGH_RES_LEAD_DAYS)] {
            for lead_index in 0..count {
                let Some(date) = contents
                    .issue_date
                    .checked_add_days(Days::new(lead_index as u64 + 1))
                else {
                    bail!("lead date overflow after {}", contents.issue_date);
                };
                lead_dates.execute(params![variable, lead_index as i64, date])?;
            }
        }

        let mut reaches = tx.prepare(
            "
            INSERT INTO reaches(reach_index, rivid, initialization_value, qout, qout_high_res)
            VALUES(?1, ?2, ?3, ?4, ?5)
            ",
        )?;
        for (reach_index, rivid) in contents.rivids.iter().enumerate() {
            let qout = encode_f32_blob(contents.ensemble.slice(s![reach_index, .., ..]).iter());
            let qout_high_res = encode_f32_blob(contents.high_res.row(reach_index).iter());
            let initialization_value = contents.initialization_values[reach_index]
                .filter(|value| value.is_finite())
                .map(f64::from);

            reaches.execute(params![
                reach_index as i64,
                rivid,
                initialization_value,
                qout,
                qout_high_res,
            ])?;
        }
    }
    tx.commit()
        .with_context(|| format!("failed to commit {}", path.display()))?;

    Ok(())
}

fn encode_f32_blob<'a>(values: impl Iterator<Item = &'a f32>) -> Vec<u8> {
    values.flat_map(|value| value.to_le_bytes()).collect()
}
