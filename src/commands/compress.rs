use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime};
use ndarray::{Array2, Array3, s};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveContents, describe_reach_mismatch, write_archive};
use crate::cli::CompressArgs;
use crate::model::{ENSEMBLE_MEMBERS, HIGH_RES_LEAD_DAYS, LEAD_DAYS};

/// Raw files number the ensemble 1..=51; the high-resolution run comes last.
const HIGH_RES_MEMBER: usize = ENSEMBLE_MEMBERS + 1;
const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

pub fn run(args: CompressArgs) -> Result<()> {
    let path = compress_region(&args.folder_path, &args.out_folder, &args.file_name)?;
    info!(
        path = %path.display(),
        region = %args.file_name,
        "compress completed"
    );
    Ok(())
}

/// Combines the 52 raw member files of `region` in `folder` into one
/// archive in `out_folder`.
pub fn compress_region(folder: &Path, out_folder: &Path, region: &str) -> Result<PathBuf> {
    let pattern = Regex::new(&format!(r"^{}_(\d+)\.csv$", regex::escape(region)))
        .context("failed to compile member filename regex")?;
    let members = discover_members(folder, &pattern)?;

    let missing: Vec<usize> = (1..=HIGH_RES_MEMBER)
        .filter(|member| !members.contains_key(member))
        .collect();
    if !missing.is_empty() {
        bail!(
            "{} has no raw files for members {missing:?} of {region}",
            folder.display()
        );
    }
    let paths: Vec<&PathBuf> = members.values().collect();

    let high_res = RawMember::read(paths[HIGH_RES_MEMBER - 1])?;
    let issue_date = high_res.issue_date();
    let reaches = high_res.rivids.len();

    info!(
        region,
        issue_date = %issue_date,
        reaches,
        "compressing raw member files"
    );

    let mut high_res_values = Array2::<f32>::from_elem((reaches, HIGH_RES_LEAD_DAYS), f32::NAN);
    for (lead, column) in high_res.daily_columns(HIGH_RES_LEAD_DAYS)?.into_iter().enumerate() {
        high_res_values
            .column_mut(lead)
            .assign(&high_res.values.column(column));
    }

    let mut ensemble =
        Array3::<f32>::from_elem((reaches, LEAD_DAYS, ENSEMBLE_MEMBERS), f32::NAN);
    for member in 1..=ENSEMBLE_MEMBERS {
        let raw = RawMember::read(paths[member - 1])?;
        raw.check_matches(&high_res)?;
        for (lead, column) in raw.daily_columns(LEAD_DAYS)?.into_iter().enumerate() {
            ensemble
                .slice_mut(s![.., lead, member - 1])
                .assign(&raw.values.column(column));
        }
        debug!(member, path = %raw.path.display(), "read raw member file");
    }

    let initialization_values = high_res
        .values
        .column(0)
        .iter()
        .map(|value| value.is_finite().then_some(*value))
        .collect();

    write_archive(
        out_folder,
        &ArchiveContents {
            region: region.to_string(),
            issue_date,
            rivids: high_res.rivids,
            initialization_values,
            ensemble,
            high_res: high_res_values,
        },
    )
}

fn discover_members(folder: &Path, pattern: &Regex) -> Result<BTreeMap<usize, PathBuf>> {
    let entries =
        fs::read_dir(folder).with_context(|| format!("failed to read {}", folder.display()))?;

    let mut members = BTreeMap::new();
    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to read entry in {}", folder.display()))?;
        let path = entry.path();

        if !entry
            .file_type()
            .with_context(|| format!("failed to inspect file type: {}", path.display()))?
            .is_file()
        {
            continue;
        }

        let Some(captures) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| pattern.captures(name))
        else {
            continue;
        };
        let member = captures
            .get(1)
            .map(|m| m.as_str())
            .context("missing member capture")?
            .parse::<usize>()
            .with_context(|| format!("invalid member number: {}", path.display()))?;

        if !(1..=HIGH_RES_MEMBER).contains(&member) {
            warn!(path = %path.display(), member, "skipping raw file outside the member range");
            continue;
        }
        if let Some(previous) = members.insert(member, path.clone()) {
            bail!(
                "member {member} has two raw files: {} and {}",
                previous.display(),
                path.display()
            );
        }
    }

    Ok(members)
}

/// One raw member file: reaches by row, timestamps by column.
#[derive(Debug)]
struct RawMember {
    path: PathBuf,
    timestamps: Vec<NaiveDateTime>,
    rivids: Vec<i32>,
    values: Array2<f32>,
}

impl RawMember {
    fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut lines = text.lines().filter(|line| !line.trim().is_empty());

        let header = lines
            .next()
            .with_context(|| format!("{} is empty", path.display()))?;
        let mut header_fields = header.split(',').map(str::trim);
        let first = header_fields.next().unwrap_or_default();
        ensure!(
            first.eq_ignore_ascii_case("rivid"),
            "{}: header starts with {first:?}, expected rivid",
            path.display()
        );
        let timestamps = header_fields
            .map(parse_timestamp)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("invalid header in {}", path.display()))?;
        ensure!(!timestamps.is_empty(), "{} has no timestamps", path.display());

        let mut rivids = Vec::new();
        let mut values = Vec::new();
        for line in lines {
            let mut fields = line.split(',').map(str::trim);
            let rivid_field = fields.next().unwrap_or_default();
            let rivid = rivid_field
                .parse::<i32>()
                .with_context(|| format!("{}: invalid rivid {rivid_field:?}", path.display()))?;

            let row_start = values.len();
            for field in fields {
                values.push(
                    parse_flow(field)
                        .with_context(|| format!("{}: rivid {rivid}", path.display()))?,
                );
            }
            ensure!(
                values.len() - row_start == timestamps.len(),
                "{}: rivid {rivid} has {} values for {} timestamps",
                path.display(),
                values.len() - row_start,
                timestamps.len()
            );
            rivids.push(rivid);
        }
        ensure!(!rivids.is_empty(), "{} lists no reaches", path.display());

        let values = Array2::from_shape_vec((rivids.len(), timestamps.len()), values)
            .with_context(|| format!("failed to shape values of {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            timestamps,
            rivids,
            values,
        })
    }

    fn issue_date(&self) -> NaiveDate {
        self.timestamps[0].date()
    }

    /// Column indices of the first `count` midnights after the first
    /// timestamp, which must fall on consecutive days.
    fn daily_columns(&self, count: usize) -> Result<Vec<usize>> {
        let issue_date = self.issue_date();
        let columns: Vec<usize> = self
            .timestamps
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, timestamp)| timestamp.time() == NaiveTime::MIN)
            .map(|(column, _)| column)
            .take(count)
            .collect();
        ensure!(
            columns.len() == count,
            "{} holds {} daily timestamps after {issue_date}, expected {count}",
            self.path.display(),
            columns.len()
        );

        for (lead, column) in columns.iter().enumerate() {
            let expected = issue_date.checked_add_days(Days::new(lead as u64 + 1));
            let found = self.timestamps[*column].date();
            ensure!(
                Some(found) == expected,
                "{}: daily timestamp {found} is not {} days after {issue_date}",
                self.path.display(),
                lead + 1
            );
        }

        Ok(columns)
    }

    fn check_matches(&self, reference: &RawMember) -> Result<()> {
        ensure!(
            self.issue_date() == reference.issue_date(),
            "{} starts on {}, but {} starts on {}",
            self.path.display(),
            self.issue_date(),
            reference.path.display(),
            reference.issue_date()
        );
        if let Some(reason) = describe_reach_mismatch(&reference.rivids, &self.rivids) {
            bail!(
                "{} does not list the reaches of {}: {reason}",
                self.path.display(),
                reference.path.display()
            );
        }
        Ok(())
    }
}

fn parse_timestamp(field: &str) -> Result<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(field, format).ok())
        .with_context(|| format!("unrecognised timestamp {field:?}"))
}

fn parse_flow(field: &str) -> Result<f32> {
    if field.is_empty() || field.eq_ignore_ascii_case("nan") {
        return Ok(f32::NAN);
    }
    field
        .parse::<f32>()
        .with_context(|| format!("invalid flow value {field:?}"))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use chrono::Duration;

    use super::*;
    use crate::archive::Archive;
    use crate::archive::fixtures::date;

    const REGION: &str = "south_america-geoglows";
    const RIVIDS: [i32; 10] = [
        192474, 192473, 192470, 192469, 192454, 192452, 192448, 192446, 192451, 192450,
    ];
    const INITIALIZATION: [f32; 10] = [
        1.9156765937805176,
        1.7540310621261597,
        1.5276174545288086,
        2.0937132835388184,
        3.4932050704956055,
        3.678524971008301,
        0.854943037033081,
        1.688418984413147,
        13.452759742736816,
        3.7613487243652344,
    ];

    /// Six-hourly steps from the 2019-01-04 issue time.
    fn timestamps(days: i64) -> Vec<NaiveDateTime> {
        let first = date(2019, 1, 4).and_time(NaiveTime::MIN);
        (0..=days * 4)
            .map(|step| first + Duration::hours(6 * step))
            .collect()
    }

    fn flow(member: usize, reach: usize, step: usize) -> f32 {
        if member == HIGH_RES_MEMBER && step == 0 {
            return INITIALIZATION[reach];
        }
        (reach * 1000 + member * 10) as f32 + step as f32 * 0.25
    }

    fn member_text(member: usize, rivids: &[i32], days: i64) -> String {
        let format = if member == HIGH_RES_MEMBER {
            "%Y-%m-%dT%H:%M:%S"
        } else {
            "%Y-%m-%d %H:%M:%S"
        };
        let steps = timestamps(days);

        let mut text = String::from("rivid");
        for timestamp in &steps {
            text.push_str(&format!(",{}", timestamp.format(format)));
        }
        text.push('\n');
        for rivid in rivids {
            let reach = RIVIDS.iter().position(|known| known == rivid).unwrap();
            text.push_str(&rivid.to_string());
            for step in 0..steps.len() {
                text.push_str(&format!(",{}", flow(member, reach, step)));
            }
            text.push('\n');
        }
        text
    }

    fn member_path(dir: &Path, member: usize) -> PathBuf {
        dir.join(format!("{REGION}_{member}.csv"))
    }

    fn write_members(dir: &Path) {
        for member in 1..=HIGH_RES_MEMBER {
            let days = if member == HIGH_RES_MEMBER { 10 } else { 15 };
            fs::write(member_path(dir, member), member_text(member, &RIVIDS, days)).unwrap();
        }
    }

    #[test]
    fn compresses_one_issue_date() {
        let raw = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_members(raw.path());
        fs::write(raw.path().join("other-region_3.csv"), "rivid\n").unwrap();
        fs::write(raw.path().join("notes.txt"), "not a member").unwrap();

        let path = compress_region(raw.path(), out.path(), REGION).unwrap();
        assert_eq!(path, out.path().join("20190104.sqlite"));

        let archive = Archive::open(&path, date(2019, 1, 4)).unwrap();
        assert_eq!(archive.rivids(), RIVIDS);
        assert_eq!(archive.region(), REGION);
        assert_eq!(
            archive.lead_day_dates(),
            (5..=19).map(|day| date(2019, 1, day)).collect::<Vec<_>>()
        );
        assert_eq!(
            archive.high_res_dates(),
            (5..=14).map(|day| date(2019, 1, day)).collect::<Vec<_>>()
        );

        let slice = archive.read_forecasts(0..RIVIDS.len()).unwrap();
        let rounded = [
            1.9157, 1.7540, 1.5276, 2.0937, 3.4932, 3.6785, 0.8549, 1.6884, 13.4528, 3.7613,
        ];
        for (reach, value) in slice.initialization_values.iter().enumerate() {
            let value = value.unwrap();
            assert_eq!(value, f64::from(INITIALIZATION[reach]));
            assert_relative_eq!(value, rounded[reach], epsilon = 1e-4);
        }
        assert_eq!(slice.ensemble[[2, 0, 0]], flow(1, 2, 4));
        assert_eq!(slice.ensemble[[9, 14, 50]], flow(51, 9, 60));

        let high_res = archive.read_high_res(0..RIVIDS.len()).unwrap();
        assert_eq!(high_res[[3, 9]], flow(HIGH_RES_MEMBER, 3, 40));
    }

    #[test]
    fn blank_initialization_is_stored_as_missing() {
        let raw = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_members(raw.path());
        let high_res_path = member_path(raw.path(), HIGH_RES_MEMBER);
        let text = fs::read_to_string(&high_res_path).unwrap().replace(
            &format!("{},{},", RIVIDS[0], INITIALIZATION[0]),
            &format!("{},,", RIVIDS[0]),
        );
        fs::write(&high_res_path, text).unwrap();

        let path = compress_region(raw.path(), out.path(), REGION).unwrap();
        let slice = Archive::open(&path, date(2019, 1, 4))
            .unwrap()
            .read_forecasts(0..2)
            .unwrap();

        assert_eq!(slice.initialization_values[0], None);
        assert!(slice.initialization_values[1].is_some());
    }

    #[test]
    fn missing_member_file_is_an_error() {
        let raw = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_members(raw.path());
        fs::remove_file(member_path(raw.path(), 17)).unwrap();

        let err = compress_region(raw.path(), out.path(), REGION).unwrap_err();

        assert!(format!("{err:#}").contains("[17]"));
        assert!(!out.path().join("20190104.sqlite").exists());
    }

    #[test]
    fn reordered_member_is_an_error() {
        let raw = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_members(raw.path());
        let mut shuffled = RIVIDS;
        shuffled.swap(4, 5);
        fs::write(member_path(raw.path(), 30), member_text(30, &shuffled, 15)).unwrap();

        let err = compress_region(raw.path(), out.path(), REGION).unwrap_err();

        assert!(format!("{err:#}").contains("reach index 4"));
        assert!(!out.path().join("20190104.sqlite").exists());
    }

    #[test]
    fn short_ensemble_member_is_an_error() {
        let raw = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_members(raw.path());
        fs::write(member_path(raw.path(), 8), member_text(8, &RIVIDS, 10)).unwrap();

        let err = compress_region(raw.path(), out.path(), REGION).unwrap_err();

        assert!(format!("{err:#}").contains("holds 10 daily timestamps"));
    }

    #[test]
    fn parses_both_timestamp_forms_and_blank_flows() {
        assert_eq!(
            parse_timestamp("2019-01-04 06:00:00").unwrap(),
            parse_timestamp("2019-01-04T06:00:00").unwrap()
        );
        assert!(parse_timestamp("04/01/2019").is_err());
        assert!(parse_flow("").unwrap().is_nan());
        assert!(parse_flow("nan").unwrap().is_nan());
        assert_eq!(parse_flow("12.5").unwrap(), 12.5);
        assert!(parse_flow("twelve").is_err());
    }
}
