use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "forecast-validation",
    version,
    about = "Ensemble streamflow forecast archiving and validation tooling"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Score every archived forecast against the persistence benchmark.
    Validate(ValidateArgs),
    /// Combine raw per-member forecast files into one archive per issue date.
    Compress(CompressArgs),
    /// Write the archived forecasts of selected reaches as CSV files.
    Extract(ExtractArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    /// Directory holding the `YYYYMMDD.sqlite` archives.
    pub archive_dir: PathBuf,

    /// Path of the CSV report to write.
    pub out_path: PathBuf,

    #[arg(long, default_value_t = 1.0)]
    pub memory_gb: f64,

    #[arg(long, value_enum, default_value_t = AggregationRule::EnsembleMean)]
    pub aggregation: AggregationRule,

    #[arg(long, default_value_t = 8)]
    pub bytes_per_element: usize,

    #[arg(long)]
    pub summary_path: Option<PathBuf>,
}

/// How ensemble members collapse into MAE, MSE and RMSE.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum AggregationRule {
    EnsembleMean,
    MemberMean,
}

impl AggregationRule {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EnsembleMean => "ensemble-mean",
            Self::MemberMean => "member-mean",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CompressArgs {
    /// Directory holding the raw `{file_name}_{member}.csv` files.
    pub folder_path: PathBuf,

    /// Directory the archive is written to.
    pub out_folder: PathBuf,

    /// Region name shared by the raw files.
    pub file_name: String,
}

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    /// Directory holding the `YYYYMMDD.sqlite` archives.
    pub folder_path: PathBuf,

    /// Directory the per-reach CSV files are written to.
    pub out_folder: PathBuf,

    #[arg(long = "rivid", required = true)]
    pub rivids: Vec<i32>,
}

#[cfg(test)]
mod tests {
    use clap::error::ErrorKind;

    use super::*;

    #[test]
    fn validate_defaults() {
        let cli = Cli::try_parse_from(["forecast-validation", "validate", "archives", "report.csv"])
            .unwrap();
        let Commands::Validate(args) = cli.command else {
            panic!("expected validate");
        };

        assert_eq!(args.archive_dir, PathBuf::from("archives"));
        assert_eq!(args.out_path, PathBuf::from("report.csv"));
        assert_eq!(args.memory_gb, 1.0);
        assert_eq!(args.aggregation, AggregationRule::EnsembleMean);
        assert_eq!(args.bytes_per_element, 8);
        assert!(args.summary_path.is_none());
    }

    #[test]
    fn validate_accepts_member_mean_aggregation() {
        let cli = Cli::try_parse_from([
            "forecast-validation",
            "validate",
            "archives",
            "report.csv",
            "--memory-gb",
            "0.25",
            "--aggregation",
            "member-mean",
        ])
        .unwrap();
        let Commands::Validate(args) = cli.command else {
            panic!("expected validate");
        };

        assert_eq!(args.memory_gb, 0.25);
        assert_eq!(args.aggregation.as_str(), "member-mean");
    }

    #[test]
    fn compress_takes_three_positionals() {
        let cli = Cli::try_parse_from([
            "forecast-validation",
            "compress",
            "raw",
            "compressed",
            "south_america-geoglows",
        ])
        .unwrap();
        let Commands::Compress(args) = cli.command else {
            panic!("expected compress");
        };

        assert_eq!(args.folder_path, PathBuf::from("raw"));
        assert_eq!(args.out_folder, PathBuf::from("compressed"));
        assert_eq!(args.file_name, "south_america-geoglows");
    }

    #[test]
    fn compress_without_file_name_is_rejected() {
        let err = Cli::try_parse_from(["forecast-validation", "compress", "raw", "compressed"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn extract_collects_repeated_rivids() {
        let cli = Cli::try_parse_from([
            "forecast-validation",
            "extract",
            "compressed",
            "by_reach",
            "--rivid",
            "192474",
            "--rivid",
            "192450",
        ])
        .unwrap();
        let Commands::Extract(args) = cli.command else {
            panic!("expected extract");
        };

        assert_eq!(args.rivids, vec![192474, 192450]);
    }

    #[test]
    fn extract_requires_a_rivid() {
        let err = Cli::try_parse_from(["forecast-validation", "extract", "compressed", "out"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }
}
