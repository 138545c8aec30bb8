use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};
use ndarray::{Array2, s};

use crate::archive::ForecastSlice;

/// The samples of one reach at one lead day, ordered by originating issue
/// date. `reference_values` are initialization values recorded on the target
/// date; `benchmark_values` are the originating archive's own initialization
/// values carried forward unchanged.
#[derive(Debug, Clone)]
pub struct AlignedSeries {
    pub rivid: i32,
    pub lead_day: usize,
    pub issue_dates: Vec<NaiveDate>,
    pub reference_values: Vec<f64>,
    pub benchmark_values: Vec<f64>,
    /// `[sample, member]`
    pub ensemble: Array2<f64>,
}

impl AlignedSeries {
    pub fn len(&self) -> usize {
        self.issue_dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issue_dates.is_empty()
    }
}

/// Aligns forecasts of one reach batch. Every slice must cover the same reach
/// range; their order does not matter.
pub struct SeriesAligner<'a> {
    slices: &'a [ForecastSlice],
    by_issue_date: BTreeMap<NaiveDate, usize>,
}

impl<'a> SeriesAligner<'a> {
    pub fn new(slices: &'a [ForecastSlice]) -> Self {
        let by_issue_date = slices
            .iter()
            .enumerate()
            .map(|(index, slice)| (slice.issue_date, index))
            .collect();
        Self {
            slices,
            by_issue_date,
        }
    }

    /// `reach` is relative to the batch start; `lead_day` counts from 1.
    pub fn align(&self, reach: usize, rivid: i32, lead_day: usize) -> AlignedSeries {
        let lead_index = lead_day - 1;
        let mut samples = Vec::new();

        for (&issue_date, &origin) in &self.by_issue_date {
            let Some(target_date) = issue_date.checked_add_days(Days::new(lead_day as u64)) else {
                continue;
            };
            let Some(&target) = self.by_issue_date.get(&target_date) else {
                continue;
            };

            let origin_slice = &self.slices[origin];
            let (Some(benchmark), Some(reference)) = (
                origin_slice.initialization_values[reach],
                self.slices[target].initialization_values[reach],
            ) else {
                continue;
            };

            let complete = origin_slice
                .ensemble
                .slice(s![reach, lead_index, ..])
                .iter()
                .all(|value| value.is_finite());
            if !complete {
                continue;
            }

            samples.push((issue_date, origin, reference, benchmark));
        }

        let members = self
            .slices
            .first()
            .map(|slice| slice.ensemble.dim().2)
            .unwrap_or(0);
        let ensemble = Array2::from_shape_fn((samples.len(), members), |(sample, member)| {
            let origin = samples[sample].1;
            f64::from(self.slices[origin].ensemble[[reach, lead_index, member]])
        });

        AlignedSeries {
            rivid,
            lead_day,
            issue_dates: samples.iter().map(|sample| sample.0).collect(),
            reference_values: samples.iter().map(|sample| sample.2).collect(),
            benchmark_values: samples.iter().map(|sample| sample.3).collect(),
            ensemble,
        }
    }
}
