use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result, ensure};

use crate::model::{MetricRow, REPORT_COLUMNS};
use crate::util::write_atomically;

/// Append-only table of report rows, kept in (reach index, lead day) order.
#[derive(Debug, Default)]
pub struct ReportTable {
    rows: Vec<MetricRow>,
    last_key: Option<(usize, usize)>,
}

impl ReportTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rows: Vec::with_capacity(capacity),
            last_key: None,
        }
    }

    pub fn append(&mut self, reach_index: usize, row: MetricRow) -> Result<()> {
        let key = (reach_index, row.forecast_day);
        if let Some(last) = self.last_key {
            ensure!(
                key > last,
                "report row for reach {} day {} arrived after reach {} day {}",
                key.0,
                key.1,
                last.0,
                last.1
            );
        }
        self.last_key = Some(key);
        self.rows.push(row);
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn render_csv<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writeln!(writer, "{}", REPORT_COLUMNS.join(","))?;
        for row in &self.rows {
            write!(writer, "{},{}", row.rivid, row.forecast_day)?;
            for value in row.metric_values() {
                write!(writer, ",{value}")?;
            }
            writeln!(writer)?;
        }
        Ok(())
    }

    /// Writes the whole table at once; `path` only ever holds a complete report.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        write_atomically(path, |writer| {
            self.render_csv(writer)
                .with_context(|| format!("failed to write report: {}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(rivid: i32, forecast_day: usize, value: f64) -> MetricRow {
        MetricRow {
            rivid,
            forecast_day,
            sample_count: 4,
            crps: value,
            crps_bench: value,
            crpss: f64::NAN,
            mae: value,
            mae_bench: value,
            maess: 0.0,
            mse: value,
            mse_bench: value,
            msess: 0.0,
            rmse: value,
            rmse_bench: value,
            rmsess: 0.0,
            pearson_r: 1.0,
            pearson_r_bench: 0.5,
            pearson_r_ss: 1.0,
        }
    }

    #[test]
    fn renders_header_and_rows_in_append_order() {
        let mut table = ReportTable::default();
        table.append(0, row(192474, 1, 0.25)).unwrap();
        table.append(0, row(192474, 2, 1.5)).unwrap();
        table.append(1, row(192473, 1, 3.0)).unwrap();

        let mut out = Vec::new();
        table.render_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            "Rivid,Forecast Day,CRPS,CRPS_BENCH,CRPSS,MAE,MAE_BENCH,MAESS,MSE,MSE_BENCH,MSESS,\
             RMSE,RMSE_BENCH,RMSESS,Pearson_r,Pearson_r_BENCH,Pearson_r_SS"
        );
        assert_eq!(
            lines[1],
            "192474,1,0.25,0.25,NaN,0.25,0.25,0,0.25,0.25,0,0.25,0.25,0,1,0.5,1"
        );
        assert!(lines[3].starts_with("192473,1,3,"));
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn rejects_rows_out_of_order() {
        let mut table = ReportTable::default();
        table.append(1, row(192473, 1, 0.0)).unwrap();
        assert!(table.append(0, row(192474, 15, 0.0)).is_err());
        assert!(table.append(1, row(192473, 1, 0.0)).is_err());
        assert_eq!(table.row_count(), 1);
    }

    #[test]
    fn write_csv_creates_the_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Forecast_analysis.csv");
        let mut table = ReportTable::default();
        table.append(0, row(1, 1, 2.0)).unwrap();

        table.write_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }
}
