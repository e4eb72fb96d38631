//! Tabular output of the selected HQM rows.

use crate::domain::horizon::Horizon;
use crate::domain::observation::RankedRow;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Fixed column schema, in file order.
pub fn columns() -> Vec<String> {
    let mut cols = vec![
        "Ticker".to_string(),
        "Price".to_string(),
        "Number of Shares to Buy".to_string(),
    ];
    for h in Horizon::ALL {
        cols.push(format!("{} Price Return", h.label()));
        cols.push(format!("{} Return Percentile", h.label()));
    }
    cols.push("HQM Score".to_string());
    cols
}

pub fn report_file_name(as_of_date: NaiveDate) -> String {
    format!("hqm_{}.csv", as_of_date.format("%Y-%m-%d"))
}

pub fn write_report<W: Write>(writer: W, rows: &[RankedRow]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(columns())?;

    for row in rows {
        let mut record = Vec::with_capacity(12);
        record.push(row.ticker.clone());
        record.push(format!("{:.4}", row.price));
        record.push(row.shares_to_buy.to_string());
        for h in Horizon::ALL {
            record.push(format!("{:.6}", row.filled_returns[h]));
            record.push(format!("{:.6}", row.percentiles[h]));
        }
        record.push(format!("{:.6}", row.composite_score));
        wtr.write_record(&record)?;
    }

    wtr.flush().context("failed to flush CSV writer")?;
    Ok(())
}

pub fn render_report(rows: &[RankedRow]) -> Result<String> {
    let mut buf = Vec::new();
    write_report(&mut buf, rows)?;
    String::from_utf8(buf).context("CSV output is not valid UTF-8")
}

/// Writes `hqm_{date}.csv` under `dir`, creating the directory if needed.
pub fn save_report(dir: &Path, as_of_date: NaiveDate, rows: &[RankedRow]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create report dir {}", dir.display()))?;

    let path = dir.join(report_file_name(as_of_date));
    let file = std::fs::File::create(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    write_report(std::io::BufWriter::new(file), rows)
        .with_context(|| format!("failed to write {}", path.display()))?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::horizon::HorizonMap;

    fn row() -> RankedRow {
        RankedRow {
            ticker: "NVDA".to_string(),
            price: 181.5,
            filled_returns: HorizonMap::new([1.25, 0.4, 0.0, -0.05]),
            percentiles: HorizonMap::new([0.99, 0.875, 0.5, 0.125]),
            composite_score: 0.6225,
            shares_to_buy: 11,
            provenance: Default::default(),
        }
    }

    #[test]
    fn header_has_fixed_schema() {
        let cols = columns();
        assert_eq!(cols.len(), 12);
        assert_eq!(cols[0], "Ticker");
        assert_eq!(cols[3], "One-Year Price Return");
        assert_eq!(cols[10], "One-Month Return Percentile");
        assert_eq!(cols[11], "HQM Score");
    }

    #[test]
    fn renders_one_line_per_row() {
        let csv = render_report(&[row()]).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[1],
            "NVDA,181.5000,11,1.250000,0.990000,0.400000,0.875000,0.000000,0.500000,-0.050000,0.125000,0.622500"
        );
    }

    #[test]
    fn file_name_carries_the_date() {
        let d = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        assert_eq!(report_file_name(d), "hqm_2026-10-17.csv");
    }

    #[test]
    fn saves_into_created_directory() {
        let dir = std::env::temp_dir().join(format!("hqm_report_test_{}", std::process::id()));
        let d = NaiveDate::from_ymd_opt(2026, 10, 17).unwrap();
        let path = save_report(&dir, d, &[row()]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Ticker,Price,Number of Shares to Buy"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
