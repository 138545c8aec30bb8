use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use chrono::NaiveDate;
use ndarray::s;
use tracing::{debug, info};

use crate::archive::ArchiveStore;
use crate::cli::ExtractArgs;
use crate::model::ENSEMBLE_MEMBERS;
use crate::util::{ensure_directory, write_atomically};

pub fn run(args: ExtractArgs) -> Result<()> {
    let written = extract_reaches(&args.folder_path, &args.out_folder, &args.rivids)?;
    info!(
        files = written.len(),
        out_folder = %args.out_folder.display(),
        "extract completed"
    );
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
struct ReachRow {
    lead_date: NaiveDate,
    issue_date: NaiveDate,
    forecast_day: usize,
    initialization: Option<f64>,
    ensemble: Vec<f32>,
    high_res: Option<f32>,
}

/// Writes `{out_folder}/{rivid}.csv` for every requested reach, one row per
/// issue date and lead day. Nothing is written if any rivid is unknown.
pub fn extract_reaches(folder: &Path, out_folder: &Path, rivids: &[i32]) -> Result<Vec<PathBuf>> {
    let store = ArchiveStore::discover(folder)?;
    ensure!(
        !store.is_empty(),
        "no forecast archives found in {}",
        folder.display()
    );
    let known = store
        .verified_rivids()
        .context("archives disagree on reach ordering")?;

    if let Some(unknown) = rivids.iter().find(|rivid| !known.contains(*rivid)) {
        bail!("rivid {unknown} is not in the archives of {}", folder.display());
    }

    let mut tables: Vec<Vec<ReachRow>> = vec![Vec::new(); rivids.len()];
    for entry in store.entries() {
        let archive = store.open(entry.issue_date)?;
        for (rivid, rows) in rivids.iter().zip(tables.iter_mut()) {
            let reach_index = archive.reach_index(*rivid).with_context(|| {
                format!("rivid {rivid} is missing from {}", archive.path().display())
            })?;
            let reaches = reach_index..reach_index + 1;
            let slice = archive.read_forecasts(reaches.clone())?;
            let high_res = archive.read_high_res(reaches)?;

            for (lead, lead_date) in archive.lead_day_dates().iter().enumerate() {
                rows.push(ReachRow {
                    lead_date: *lead_date,
                    issue_date: entry.issue_date,
                    forecast_day: lead + 1,
                    initialization: slice.initialization_values[0],
                    ensemble: slice.ensemble.slice(s![0, lead, ..]).to_vec(),
                    high_res: high_res.get((0, lead)).copied(),
                });
            }
        }
        debug!(issue_date = %entry.issue_date, "read reach forecasts");
    }

    ensure_directory(out_folder)?;
    let mut written = Vec::with_capacity(rivids.len());
    for (rivid, rows) in rivids.iter().zip(&tables) {
        let path = out_folder.join(format!("{rivid}.csv"));
        write_atomically(&path, |writer| {
            render_rows(writer, rows)
                .with_context(|| format!("failed to write reach file: {}", path.display()))
        })?;
        info!(rivid, rows = rows.len(), path = %path.display(), "wrote reach forecasts");
        written.push(path);
    }

    Ok(written)
}

fn render_rows<W: Write>(writer: &mut W, rows: &[ReachRow]) -> io::Result<()> {
    write!(writer, "Datetime,Issue Date,Forecast Day,Initialization")?;
    for member in 0..ENSEMBLE_MEMBERS {
        write!(writer, ",Ensemble_{member:02}")?;
    }
    writeln!(writer, ",High_Res")?;

    for row in rows {
        write!(
            writer,
            "{},{},{},",
            row.lead_date, row.issue_date, row.forecast_day
        )?;
        if let Some(value) = row.initialization {
            write!(writer, "{value}")?;
        }
        for value in &row.ensemble {
            write!(writer, ",{value}")?;
        }
        write!(writer, ",")?;
        if let Some(value) = row.high_res {
            write!(writer, "{value}")?;
        }
        writeln!(writer)?;
    }
    Ok(())
}
