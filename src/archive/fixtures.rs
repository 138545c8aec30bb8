use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use ndarray::{Array2, Array3};

use super::{ArchiveContents, write_archive};
use crate::model::{ENSEMBLE_MEMBERS, HIGH_RES_LEAD_DAYS, LEAD_DAYS};

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

/// Builds archive contents from closures over `(reach, lead_day_index, member)`.
pub fn contents_with<E, I>(
    issue_date: NaiveDate,
    rivids: &[i32],
    ensemble: E,
    initialization: I,
) -> ArchiveContents
where
    E: Fn(usize, usize, usize) -> f32,
    I: Fn(usize) -> Option<f32>,
{
    let reaches = rivids.len();
    ArchiveContents {
        region: "test_region".to_string(),
        issue_date,
        rivids: rivids.to_vec(),
        initialization_values: (0..reaches).map(&initialization).collect(),
        ensemble: Array3::from_shape_fn((reaches, LEAD_DAYS, ENSEMBLE_MEMBERS), |(r, l, m)| {
            ensemble(r, l, m)
        }),
        high_res: Array2::from_shape_fn((reaches, HIGH_RES_LEAD_DAYS), |(r, l)| {
            ensemble(r, l, 0) + 0.5
        }),
    }
}

/// One archive per day starting at `first`, where every reach's
/// initialization value follows `flow(reach, day_offset)` and every ensemble
/// member forecasts the same flow plus `member_spread * (member - 25)`.
pub fn write_daily_archives<F>(
    dir: &Path,
    first: NaiveDate,
    days: usize,
    rivids: &[i32],
    flow: F,
    member_spread: f32,
) -> Vec<PathBuf>
where
    F: Fn(usize, usize) -> f32,
{
    (0..days)
        .map(|offset| {
            let issue_date = first + chrono::Days::new(offset as u64);
            let contents = contents_with(
                issue_date,
                rivids,
                |reach, lead, member| {
                    flow(reach, offset + lead + 1) + member_spread * (member as f32 - 25.0)
                },
                |reach| Some(flow(reach, offset)),
            );
            write_archive(dir, &contents).unwrap()
        })
        .collect()
}
