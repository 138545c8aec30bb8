use std::ops::Range;
use std::path::{Path, PathBuf};

use chrono::{Days, NaiveDate};
use ndarray::{Array2, Array3};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::debug;

use super::ARCHIVE_FORMAT_VERSION;
use crate::error::ValidationError;
use crate::model::{ENSEMBLE_MEMBERS, HIGH_RES_LEAD_DAYS, LEAD_DAYS};

/// An open, read-only forecast archive. Reach identifiers and lead dates are
/// loaded eagerly; flow arrays are read per reach range.
#[derive(Debug)]
pub struct Archive {
    path: PathBuf,
    connection: Connection,
    issue_date: NaiveDate,
    region: String,
    rivids: Vec<i32>,
    lead_day_dates: Vec<NaiveDate>,
    high_res_dates: Vec<NaiveDate>,
}

/// The ensemble forecasts and initialization values of a contiguous range of
/// reaches, copied out of one archive.
#[derive(Debug, Clone)]
pub struct ForecastSlice {
    pub issue_date: NaiveDate,
    pub reaches: Range<usize>,
    pub initialization_values: Vec<Option<f64>>,
    /// `[reach, lead_day, member]`, reach relative to `reaches.start`.
    pub ensemble: Array3<f32>,
}

impl Archive {
    pub fn open(path: &Path, issue_date: NaiveDate) -> Result<Self, ValidationError> {
        if !path.is_file() {
            return Err(ValidationError::MissingArchive { date: issue_date });
        }

        let connection = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| ValidationError::corrupt(path, format!("cannot open: {err}")))?;

        let corrupt = |reason: String| ValidationError::corrupt(path, reason);

        let format_version = read_metadata(&connection, "format_version")
            .map_err(|err| corrupt(format!("missing metadata table: {err}")))?;
        if format_version.as_deref() != Some(ARCHIVE_FORMAT_VERSION) {
            return Err(corrupt(format!(
                "unsupported format_version {format_version:?}"
            )));
        }

        expect_dimension(&connection, path, "lead_days", LEAD_DAYS)?;
        expect_dimension(&connection, path, "ensemble_members", ENSEMBLE_MEMBERS)?;
        expect_dimension(&connection, path, "high_res_lead_days", HIGH_RES_LEAD_DAYS)?;

        let start_date = read_metadata(&connection, "start_date")
            .map_err(|err| corrupt(format!("cannot read start_date: {err}")))?
            .ok_or_else(|| corrupt("start_date is absent".to_string()))?;
        let start_date = NaiveDate::parse_from_str(&start_date, "%Y-%m-%d")
            .map_err(|err| corrupt(format!("invalid start_date '{start_date}': {err}")))?;
        if start_date != issue_date {
            return Err(corrupt(format!(
                "start_date {start_date} does not match the file name date {issue_date}"
            )));
        }

        let region = read_metadata(&connection, "region")
            .map_err(|err| corrupt(format!("cannot read region: {err}")))?
            .unwrap_or_default();

        let lead_day_dates = read_lead_dates(&connection, path, "date", start_date, LEAD_DAYS)?;
        let high_res_dates = read_lead_dates(
            &connection,
            path,
            "date_high_res",
            start_date,
            HIGH_RES_LEAD_DAYS,
        )?;
        let rivids = read_rivids(&connection, path)?;

        debug!(
            path = %path.display(),
            issue_date = %issue_date,
            reaches = rivids.len(),
            "opened forecast archive"
        );

        Ok(Self {
            path: path.to_path_buf(),
            connection,
            issue_date,
            region,
            rivids,
            lead_day_dates,
            high_res_dates,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn rivids(&self) -> &[i32] {
        &self.rivids
    }

    pub fn reach_index(&self, rivid: i32) -> Option<usize> {
        self.rivids.iter().position(|candidate| *candidate == rivid)
    }

    pub fn lead_day_dates(&self) -> &[NaiveDate] {
        &self.lead_day_dates
    }

    pub fn high_res_dates(&self) -> &[NaiveDate] {
        &self.high_res_dates
    }

    pub fn read_forecasts(&self, reaches: Range<usize>) -> Result<ForecastSlice, ValidationError> {
        self.check_range(&reaches)?;

        let width = LEAD_DAYS * ENSEMBLE_MEMBERS;
        let mut initialization_values = Vec::with_capacity(reaches.len());
        let mut flat = Vec::with_capacity(reaches.len() * width);

        let rows = self.query_reach_rows(
            "
            SELECT reach_index, initialization_value, qout
            FROM reaches
            WHERE reach_index >= ?1 AND reach_index < ?2
            ORDER BY reach_index
            ",
            &reaches,
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            },
        )?;

        for (expected, (reach_index, initialization_value, qout)) in reaches.clone().zip(rows) {
            self.check_reach_index(expected, reach_index)?;
            let values = decode_f32_blob(&qout, width).ok_or_else(|| {
                ValidationError::corrupt(
                    &self.path,
                    format!(
                        "Qout of reach {expected} holds {} bytes, expected {}",
                        qout.len(),
                        width * 4
                    ),
                )
            })?;
            initialization_values.push(initialization_value.filter(|value| value.is_finite()));
            flat.extend(values);
        }

        let ensemble = Array3::from_shape_vec((reaches.len(), LEAD_DAYS, ENSEMBLE_MEMBERS), flat)
            .map_err(|err| ValidationError::corrupt(&self.path, format!("Qout shape: {err}")))?;

        Ok(ForecastSlice {
            issue_date: self.issue_date,
            reaches,
            initialization_values,
            ensemble,
        })
    }

    /// `[reach, lead_day_hr]` high-resolution forecasts of a reach range.
    pub fn read_high_res(&self, reaches: Range<usize>) -> Result<Array2<f32>, ValidationError> {
        self.check_range(&reaches)?;

        let rows = self.query_reach_rows(
            "
            SELECT reach_index, qout_high_res
            FROM reaches
            WHERE reach_index >= ?1 AND reach_index < ?2
            ORDER BY reach_index
            ",
            &reaches,
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
        )?;

        let mut flat = Vec::with_capacity(reaches.len() * HIGH_RES_LEAD_DAYS);
        for (expected, (reach_index, blob)) in reaches.clone().zip(rows) {
            self.check_reach_index(expected, reach_index)?;
            let values = decode_f32_blob(&blob, HIGH_RES_LEAD_DAYS).ok_or_else(|| {
                ValidationError::corrupt(
                    &self.path,
                    format!("Qout_high_res of reach {expected} has {} bytes", blob.len()),
                )
            })?;
            flat.extend(values);
        }

        Array2::from_shape_vec((reaches.len(), HIGH_RES_LEAD_DAYS), flat).map_err(|err| {
            ValidationError::corrupt(&self.path, format!("Qout_high_res shape: {err}"))
        })
    }

    fn check_range(&self, reaches: &Range<usize>) -> Result<(), ValidationError> {
        if reaches.start > reaches.end || reaches.end > self.rivids.len() {
            return Err(ValidationError::corrupt(
                &self.path,
                format!(
                    "requested reaches {}..{} but the archive holds {}",
                    reaches.start,
                    reaches.end,
                    self.rivids.len()
                ),
            ));
        }
        Ok(())
    }

    fn check_reach_index(&self, expected: usize, found: i64) -> Result<(), ValidationError> {
        if found != expected as i64 {
            return Err(ValidationError::corrupt(
                &self.path,
                format!("reach_index {found} found where {expected} was expected"),
            ));
        }
        Ok(())
    }

    fn query_reach_rows<T, F>(
        &self,
        sql: &str,
        reaches: &Range<usize>,
        map: F,
    ) -> Result<Vec<T>, ValidationError>
    where
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let corrupt = |err: rusqlite::Error| {
            ValidationError::corrupt(&self.path, format!("cannot read reaches: {err}"))
        };

        let mut statement = self.connection.prepare(sql).map_err(corrupt)?;
        let rows = statement
            .query_map(params![reaches.start as i64, reaches.end as i64], map)
            .map_err(corrupt)?
            .collect::<rusqlite::Result<Vec<T>>>()
            .map_err(corrupt)?;

        if rows.len() != reaches.len() {
            return Err(ValidationError::corrupt(
                &self.path,
                format!(
                    "expected {} reach rows in {}..{}, found {}",
                    reaches.len(),
                    reaches.start,
                    reaches.end,
                    rows.len()
                ),
            ));
        }
        Ok(rows)
    }
}

fn read_metadata(connection: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    connection
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()
}

fn expect_dimension(
    connection: &Connection,
    path: &Path,
    key: &str,
    expected: usize,
) -> Result<(), ValidationError> {
    let value = read_metadata(connection, key)
        .map_err(|err| ValidationError::corrupt(path, format!("cannot read {key}: {err}")))?;
    match value.as_deref().map(str::parse::<usize>) {
        Some(Ok(found)) if found == expected => Ok(()),
        _ => Err(ValidationError::corrupt(
            path,
            format!("{key} is {value:?}, expected {expected}"),
        )),
    }
}

fn read_lead_dates(
    connection: &Connection,
    path: &Path,
    variable: &str,
    start_date: NaiveDate,
    expected: usize,
) -> Result<Vec<NaiveDate>, ValidationError> {
    let corrupt = |err: rusqlite::Error| {
        ValidationError::corrupt(path, format!("cannot read {variable}: {err}"))
    };

    let mut statement = connection
        .prepare("SELECT date FROM lead_dates WHERE variable = ?1 ORDER BY lead_index")
        .map_err(corrupt)?;
    let dates = statement
        .query_map(params![variable], |row| row.get::<_, NaiveDate>(0))
        .map_err(corrupt)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(corrupt)?;

    if dates.len() != expected {
        return Err(ValidationError::corrupt(
            path,
            format!("{variable} holds {} lead days, expected {expected}", dates.len()),
        ));
    }

    for (offset, date) in (1_u64..).zip(&dates) {
        if start_date.checked_add_days(Days::new(offset)) != Some(*date) {
            return Err(ValidationError::corrupt(
                path,
                format!("{variable} lead day {offset} is {date}, not {offset} days after {start_date}"),
            ));
        }
    }

    Ok(dates)
}

fn read_rivids(connection: &Connection, path: &Path) -> Result<Vec<i32>, ValidationError> {
    let corrupt =
        |err: rusqlite::Error| ValidationError::corrupt(path, format!("cannot read rivid: {err}"));

    let mut statement = connection
        .prepare("SELECT reach_index, rivid FROM reaches ORDER BY reach_index")
        .map_err(corrupt)?;
    let rows = statement
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i32>(1)?)))
        .map_err(corrupt)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(corrupt)?;

    let mut rivids = Vec::with_capacity(rows.len());
    for (expected, (reach_index, rivid)) in rows.into_iter().enumerate() {
        if reach_index != expected as i64 {
            return Err(ValidationError::corrupt(
                path,
                format!("reach_index sequence has a gap at {expected}"),
            ));
        }
        rivids.push(rivid);
    }
    Ok(rivids)
}

pub(super) fn decode_f32_blob(bytes: &[u8], expected_len: usize) -> Option<Vec<f32>> {
    if bytes.len() != expected_len * 4 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}
