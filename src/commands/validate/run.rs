use std::ops::Range;
use std::path::Path;

use anyhow::{Context, Result, ensure};
use chrono::NaiveDate;
use tracing::{debug, info};

use super::align::SeriesAligner;
use super::batch::BatchPartitioner;
use super::metrics::MetricEngine;
use super::report::ReportTable;
use crate::archive::{ArchiveStore, ForecastSlice};
use crate::cli::{AggregationRule, ValidateArgs};
use crate::model::{ENSEMBLE_MEMBERS, LEAD_DAYS, ValidationRunSummary};
use crate::util::{now_utc_string, sha256_file, write_json_pretty};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationSettings {
    pub memory_to_allocate_gb: f64,
    pub aggregation: AggregationRule,
    pub bytes_per_element: usize,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            memory_to_allocate_gb: 1.0,
            aggregation: AggregationRule::EnsembleMean,
            bytes_per_element: std::mem::size_of::<f64>(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub archive_count: usize,
    pub first_issue_date: NaiveDate,
    pub last_issue_date: NaiveDate,
    pub reach_count: usize,
    pub batch_count: usize,
    pub reaches_per_batch: usize,
    pub row_count: usize,
}

pub fn run(args: ValidateArgs) -> Result<()> {
    ensure!(
        args.memory_gb.is_finite() && args.memory_gb > 0.0,
        "--memory-gb must be a positive number, got {}",
        args.memory_gb
    );
    ensure!(
        args.bytes_per_element > 0,
        "--bytes-per-element must be at least 1"
    );

    let settings = ValidationSettings {
        memory_to_allocate_gb: args.memory_gb,
        aggregation: args.aggregation,
        bytes_per_element: args.bytes_per_element,
    };

    let outcome = compute_all(&args.archive_dir, &args.out_path, &settings)?;

    if let Some(summary_path) = &args.summary_path {
        let summary = ValidationRunSummary {
            manifest_version: 1,
            generated_at: now_utc_string(),
            archive_directory: args.archive_dir.display().to_string(),
            report_path: args.out_path.display().to_string(),
            report_sha256: sha256_file(&args.out_path)?,
            archive_count: outcome.archive_count,
            first_issue_date: outcome.first_issue_date.to_string(),
            last_issue_date: outcome.last_issue_date.to_string(),
            reach_count: outcome.reach_count,
            batch_count: outcome.batch_count,
            reaches_per_batch: outcome.reaches_per_batch,
            row_count: outcome.row_count,
            aggregation: settings.aggregation.as_str().to_string(),
            memory_budget_gb: settings.memory_to_allocate_gb,
        };
        write_json_pretty(summary_path, &summary)?;
        info!(path = %summary_path.display(), "wrote validation summary");
    }

    Ok(())
}

/// Scores every reach and lead day of the archives in `archive_directory`
/// and writes the report to `out_path`. Nothing is written unless every
/// batch succeeds.
pub fn compute_all(
    archive_directory: &Path,
    out_path: &Path,
    settings: &ValidationSettings,
) -> Result<ValidationOutcome> {
    let store = ArchiveStore::discover(archive_directory)?;
    let (Some(first), Some(last)) = (store.entries().first(), store.entries().last()) else {
        anyhow::bail!(
            "no forecast archives found in {}",
            archive_directory.display()
        );
    };
    let (first_issue_date, last_issue_date) = (first.issue_date, last.issue_date);

    info!(
        archive_dir = %store.root().display(),
        archives = store.len(),
        first_issue_date = %first_issue_date,
        last_issue_date = %last_issue_date,
        "starting forecast validation"
    );

    let rivids = store
        .verified_rivids()
        .context("archives disagree on reach ordering")?;

    let partitioner = BatchPartitioner::from_gigabytes(
        settings.memory_to_allocate_gb,
        LEAD_DAYS,
        ENSEMBLE_MEMBERS,
        settings.bytes_per_element,
    );
    let batches = partitioner
        .partition(rivids.len(), store.len())
        .with_context(|| {
            format!(
                "cannot plan reach batches for {} archives within {} GB",
                store.len(),
                settings.memory_to_allocate_gb
            )
        })?;
    let reaches_per_batch = batches.first().map(|batch| batch.len()).unwrap_or(0);

    info!(
        reaches = rivids.len(),
        batches = batches.len(),
        reaches_per_batch,
        "planned reach batches"
    );

    let scorer = settings.aggregation.scorer();
    info!(aggregation = scorer.name(), "scoring ensemble forecasts");
    let engine = MetricEngine::new(scorer.as_ref());
    let mut table = ReportTable::with_capacity(rivids.len() * LEAD_DAYS);

    for (batch_number, batch) in batches.iter().enumerate() {
        let slices = load_batch(&store, batch.clone()).with_context(|| {
            format!(
                "failed to load reach batch {} of {} (reaches {}..{})",
                batch_number + 1,
                batches.len(),
                batch.start,
                batch.end
            )
        })?;
        let aligner = SeriesAligner::new(&slices);

        let mut unsampled_rows = 0_usize;
        for (offset, reach_index) in batch.clone().enumerate() {
            let rivid = rivids[reach_index];
            for lead_day in 1..=LEAD_DAYS {
                let series = aligner.align(offset, rivid, lead_day);
                if series.is_empty() {
                    unsampled_rows += 1;
                }
                let row = engine.score(&series);
                debug!(rivid, lead_day, samples = row.sample_count, "scored series");
                table.append(reach_index, row)?;
            }
        }

        info!(
            batch = batch_number + 1,
            batches = batches.len(),
            reaches = batch.len(),
            unsampled_rows,
            "scored reach batch"
        );
    }

    table.write_csv(out_path)?;
    info!(
        path = %out_path.display(),
        rows = table.row_count(),
        "wrote validation report"
    );

    Ok(ValidationOutcome {
        archive_count: store.len(),
        first_issue_date,
        last_issue_date,
        reach_count: rivids.len(),
        batch_count: batches.len(),
        reaches_per_batch,
        row_count: table.row_count(),
    })
}

fn load_batch(store: &ArchiveStore, reaches: Range<usize>) -> Result<Vec<ForecastSlice>> {
    let mut slices = Vec::with_capacity(store.len());
    for entry in store.entries() {
        let archive = store.open(entry.issue_date)?;
        let slice = archive.read_forecasts(reaches.clone())?;
        debug!(
            issue_date = %entry.issue_date,
            path = %archive.path().display(),
            region = archive.region(),
            reaches = slice.reaches.len(),
            "loaded forecast slice"
        );
        slices.push(slice);
    }
    Ok(slices)
}
