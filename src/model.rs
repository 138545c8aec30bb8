use serde::{Deserialize, Serialize};

/// Lead days carried by every ensemble forecast.
pub const LEAD_DAYS: usize = 15;
/// Stochastic members per ensemble forecast.
pub const ENSEMBLE_MEMBERS: usize = 51;
/// Lead days carried by the deterministic high-resolution member.
pub const HIGH_RES_LEAD_DAYS: usize = 10;

pub const REPORT_COLUMNS: [&str; 17] = [
    "Rivid",
    "Forecast Day",
    "CRPS",
    "CRPS_BENCH",
    "CRPSS",
    "MAE",
    "MAE_BENCH",
    "MAESS",
    "MSE",
    "MSE_BENCH",
    "MSESS",
    "RMSE",
    "RMSE_BENCH",
    "RMSESS",
    "Pearson_r",
    "Pearson_r_BENCH",
    "Pearson_r_SS",
];

/// Verification statistics of one reach at one lead day.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    pub rivid: i32,
    pub forecast_day: usize,
    pub sample_count: usize,
    pub crps: f64,
    pub crps_bench: f64,
    pub crpss: f64,
    pub mae: f64,
    pub mae_bench: f64,
    pub maess: f64,
    pub mse: f64,
    pub mse_bench: f64,
    pub msess: f64,
    pub rmse: f64,
    pub rmse_bench: f64,
    pub rmsess: f64,
    pub pearson_r: f64,
    pub pearson_r_bench: f64,
    pub pearson_r_ss: f64,
}

impl MetricRow {
    pub fn metric_values(&self) -> [f64; 15] {
        [
            self.crps,
            self.crps_bench,
            self.crpss,
            self.mae,
            self.mae_bench,
            self.maess,
            self.mse,
            self.mse_bench,
            self.msess,
            self.rmse,
            self.rmse_bench,
            self.rmsess,
            self.pearson_r,
            self.pearson_r_bench,
            self.pearson_r_ss,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRunSummary {
    pub manifest_version: u32,
    pub generated_at: String,
    pub archive_directory: String,
    pub report_path: String,
    pub report_sha256: String,
    pub archive_count: usize,
    pub first_issue_date: String,
    pub last_issue_date: String,
    pub reach_count: usize,
    pub batch_count: usize,
    pub reaches_per_batch: usize,
    pub row_count: usize,
    pub aggregation: String,
    pub memory_budget_gb: f64,
}
