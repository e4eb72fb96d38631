use anyhow::Context;
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

const TICKER_COLUMNS: [&str; 2] = ["ticker", "symbol"];

pub fn load_universe(path: &Path) -> anyhow::Result<Vec<String>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open universe file {}", path.display()))?;
    parse_universe(file).with_context(|| format!("failed to read universe {}", path.display()))
}

/// Reads the `Ticker` (or `Symbol`) column. Symbols are trimmed and upper-cased; blanks and
/// repeats are dropped, first occurrence wins.
pub fn parse_universe<R: Read>(reader: R) -> anyhow::Result<Vec<String>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers = rdr.headers().context("missing CSV header")?.clone();
    let col = headers
        .iter()
        .position(|h| TICKER_COLUMNS.contains(&h.to_ascii_lowercase().as_str()))
        .context("universe CSV needs a Ticker column")?;

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = record.with_context(|| format!("bad CSV record at row {}", line + 2))?;
        let Some(raw) = record.get(col) else {
            continue;
        };
        let ticker = normalize_ticker(raw);
        if ticker.is_empty() {
            continue;
        }
        if seen.insert(ticker.clone()) {
            out.push(ticker);
        }
    }

    Ok(out)
}

/// Yahoo spells share classes with a dash (`BRK-B`), many index lists use a dot.
fn normalize_ticker(raw: &str) -> String {
    raw.trim().to_ascii_uppercase().replace('.', "-")
}
