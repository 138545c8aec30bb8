//! Verification metrics of an ensemble forecast and of the persistence
//! benchmark against the reference series.
//!
//! Error metrics have a perfect score of 0 and correlation a perfect score of
//! 1; [`skill_score`] maps both onto the same scale.

use ndarray::{ArrayView1, ArrayView2, Axis};
use tracing::debug;

use super::align::AlignedSeries;
use crate::cli::AggregationRule;
use crate::error::ValidationError;
use crate::model::MetricRow;

pub const ERROR_PERFECT_SCORE: f64 = 0.0;
pub const CORRELATION_PERFECT_SCORE: f64 = 1.0;
const MIN_CORRELATION_SAMPLES: usize = 2;

/// Ensemble statistics for one aligned series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnsembleScores {
    pub crps: f64,
    pub mae: f64,
    pub mse: f64,
    pub rmse: f64,
    pub pearson_r: f64,
}

/// How an ensemble collapses into the deterministic error metrics.
pub trait EnsembleScorer {
    fn name(&self) -> &'static str;

    /// `ensemble` is `[sample, member]`, one row per reference value.
    fn score(&self, reference: &[f64], ensemble: ArrayView2<'_, f64>) -> EnsembleScores;
}

/// Error metrics of the per-sample ensemble mean.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnsembleMeanScorer;

impl EnsembleScorer for EnsembleMeanScorer {
    fn name(&self) -> &'static str {
        "ensemble-mean"
    }

    fn score(&self, reference: &[f64], ensemble: ArrayView2<'_, f64>) -> EnsembleScores {
        let means = ensemble_mean(ensemble);
        EnsembleScores {
            crps: crps(reference, ensemble),
            mae: mae(reference, &means),
            mse: mse(reference, &means),
            rmse: rmse(reference, &means),
            pearson_r: pearson_r(reference, &means),
        }
    }
}

/// Error metrics computed against every member on its own, then averaged
/// across members. Correlation still uses the ensemble mean.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemberMeanScorer;

impl EnsembleScorer for MemberMeanScorer {
    fn name(&self) -> &'static str {
        "member-mean"
    }

    fn score(&self, reference: &[f64], ensemble: ArrayView2<'_, f64>) -> EnsembleScores {
        let members: Vec<Vec<f64>> = ensemble
            .axis_iter(Axis(1))
            .map(|member| member.to_vec())
            .collect();
        let across_members = |metric: fn(&[f64], &[f64]) -> f64| {
            mean(members.iter().map(|member| metric(reference, member)))
        };

        EnsembleScores {
            crps: crps(reference, ensemble),
            mae: across_members(mae),
            mse: across_members(mse),
            rmse: across_members(rmse),
            pearson_r: pearson_r(reference, &ensemble_mean(ensemble)),
        }
    }
}

impl AggregationRule {
    pub fn scorer(self) -> Box<dyn EnsembleScorer> {
        match self {
            Self::EnsembleMean => Box::new(EnsembleMeanScorer),
            Self::MemberMean => Box::new(MemberMeanScorer),
        }
    }
}

/// Scores aligned series into report rows.
pub struct MetricEngine<'a> {
    scorer: &'a dyn EnsembleScorer,
}

impl<'a> MetricEngine<'a> {
    pub fn new(scorer: &'a dyn EnsembleScorer) -> Self {
        Self { scorer }
    }

    pub fn score(&self, series: &AlignedSeries) -> MetricRow {
        let samples = series.len();
        if samples < MIN_CORRELATION_SAMPLES {
            let undefined = ValidationError::UndefinedMetric {
                metric: "Pearson_r",
                samples,
            };
            debug!(
                rivid = series.rivid,
                forecast_day = series.lead_day,
                reason = %undefined,
                "reporting NaN"
            );
        }

        let reference = series.reference_values.as_slice();
        let benchmark = series.benchmark_values.as_slice();
        let ensemble = self.scorer.score(reference, series.ensemble.view());

        // a single-valued forecast's CRPS is its absolute error
        let crps_bench = mae(reference, benchmark);
        let mae_bench = crps_bench;
        let mse_bench = mse(reference, benchmark);
        let rmse_bench = rmse(reference, benchmark);
        let pearson_r_bench = pearson_r(reference, benchmark);

        MetricRow {
            rivid: series.rivid,
            forecast_day: series.lead_day,
            sample_count: samples,
            crps: ensemble.crps,
            crps_bench,
            crpss: skill_score(ensemble.crps, crps_bench, ERROR_PERFECT_SCORE),
            mae: ensemble.mae,
            mae_bench,
            maess: skill_score(ensemble.mae, mae_bench, ERROR_PERFECT_SCORE),
            mse: ensemble.mse,
            mse_bench,
            msess: skill_score(ensemble.mse, mse_bench, ERROR_PERFECT_SCORE),
            rmse: ensemble.rmse,
            rmse_bench,
            rmsess: skill_score(ensemble.rmse, rmse_bench, ERROR_PERFECT_SCORE),
            pearson_r: ensemble.pearson_r,
            pearson_r_bench,
            pearson_r_ss: skill_score(
                ensemble.pearson_r,
                pearson_r_bench,
                CORRELATION_PERFECT_SCORE,
            ),
        }
    }
}

/// `(metric - bench) / (perfect - bench)`: 1 is a perfect forecast, 0 is no
/// better than the benchmark, NaN when the benchmark is already perfect.
pub fn skill_score(metric: f64, metric_bench: f64, perfect_score: f64) -> f64 {
    let denominator = perfect_score - metric_bench;
    if denominator == 0.0 {
        return f64::NAN;
    }
    (metric - metric_bench) / denominator
}

/// Mean continuous ranked probability score over all samples.
pub fn crps(reference: &[f64], ensemble: ArrayView2<'_, f64>) -> f64 {
    mean(
        reference
            .iter()
            .zip(ensemble.rows())
            .map(|(value, members)| sample_crps(*value, members)),
    )
}

/// CRPS of one empirical ensemble: `E|X - y| - E|X - X'| / 2`.
pub fn sample_crps(reference: f64, members: ArrayView1<'_, f64>) -> f64 {
    let count = members.len();
    if count == 0 {
        return f64::NAN;
    }

    let mut sorted = members.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mut absolute_error = 0.0;
    let mut pairwise_spread = 0.0;
    for (rank, value) in sorted.iter().enumerate() {
        absolute_error += (value - reference).abs();
        // sum over pairs j < k of (x_k - x_j), from sorted order
        pairwise_spread += (2.0 * rank as f64 + 1.0 - count as f64) * value;
    }

    let count = count as f64;
    absolute_error / count - pairwise_spread / (count * count)
}

/// Mean Absolute Error. Range: [0, inf), 0 = perfect.
pub fn mae(reference: &[f64], forecast: &[f64]) -> f64 {
    mean(reference.iter().zip(forecast).map(|(r, f)| (f - r).abs()))
}

/// Mean Squared Error. Range: [0, inf), 0 = perfect.
pub fn mse(reference: &[f64], forecast: &[f64]) -> f64 {
    mean(reference.iter().zip(forecast).map(|(r, f)| (f - r).powi(2)))
}

/// Root Mean Square Error. Range: [0, inf), 0 = perfect.
pub fn rmse(reference: &[f64], forecast: &[f64]) -> f64 {
    mse(reference, forecast).sqrt()
}

/// Pearson correlation coefficient. Range: [-1, 1], 1 = perfect. NaN with
/// fewer than two samples or a constant series.
pub fn pearson_r(reference: &[f64], forecast: &[f64]) -> f64 {
    let n = reference.len().min(forecast.len());
    if n < MIN_CORRELATION_SAMPLES {
        return f64::NAN;
    }
    let (reference, forecast) = (&reference[..n], &forecast[..n]);

    let mean_r = reference.iter().sum::<f64>() / n as f64;
    let mean_f = forecast.iter().sum::<f64>() / n as f64;

    let covariance: f64 = reference
        .iter()
        .zip(forecast)
        .map(|(r, f)| (r - mean_r) * (f - mean_f))
        .sum();
    let spread_r = reference
        .iter()
        .map(|r| (r - mean_r).powi(2))
        .sum::<f64>()
        .sqrt();
    let spread_f = forecast
        .iter()
        .map(|f| (f - mean_f).powi(2))
        .sum::<f64>()
        .sqrt();

    let denominator = spread_r * spread_f;
    if denominator == 0.0 {
        return f64::NAN;
    }
    covariance / denominator
}

fn ensemble_mean(ensemble: ArrayView2<'_, f64>) -> Vec<f64> {
    ensemble
        .rows()
        .into_iter()
        .map(|members| members.mean().unwrap_or(f64::NAN))
        .collect()
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0_usize), |(sum, count), value| {
        (sum + value, count + 1)
    });
    if count == 0 {
        return f64::NAN;
    }
    sum / count as f64
}
