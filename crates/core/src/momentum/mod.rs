pub mod ranker;
pub mod returns;
pub mod sizing;

use crate::domain::horizon::HorizonMap;
use crate::domain::observation::{Exclusion, RankedRow, TickerObservation};
use ranker::RankOptions;
use serde::{Deserialize, Serialize};
use sizing::SizingBasis;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOptions {
    pub capital: f64,
    pub top_n: usize,
    pub sizing_basis: SizingBasis,
    pub rank: RankOptions,
    /// Carried for provenance in reports and snapshots; retrieval already used them.
    pub horizon_days: HorizonMap<u32>,
}

impl PipelineOptions {
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        Self {
            capital: settings.capital,
            top_n: settings.top_n,
            sizing_basis: settings.sizing_basis,
            rank: RankOptions {
                percentile_kind: settings.percentile_kind,
                ..RankOptions::default()
            },
            horizon_days: settings.horizon_days,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HqmReport {
    /// Selected rows, best first, with share counts filled in.
    pub rows: Vec<RankedRow>,
    /// Tickers that received a composite score.
    pub ranked_count: usize,
    pub excluded: Vec<Exclusion>,
}

/// Observations → returns → ranking → top-N → sizing.
///
/// Fails only when nothing can be ranked; per-ticker problems become exclusions.
pub fn run_pipeline(
    observations: &[TickerObservation],
    opts: &PipelineOptions,
) -> anyhow::Result<HqmReport> {
    anyhow::ensure!(opts.top_n >= 1, "top_n must be >= 1");

    let mut excluded = Vec::new();
    let mut vectors = Vec::with_capacity(observations.len());
    for obs in observations {
        match returns::return_vector(obs) {
            Ok(v) => vectors.push(v),
            Err(err) => {
                tracing::warn!(ticker = %obs.ticker, error = %err, "malformed price; excluding ticker");
                excluded.push(Exclusion {
                    ticker: obs.ticker.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    let ranking = ranker::rank(&vectors, &opts.rank);
    excluded.extend(ranking.excluded);

    let ranked_count = ranking.rows.len();
    anyhow::ensure!(
        ranked_count > 0,
        "no tickers survived ranking ({} observations, {} excluded)",
        observations.len(),
        excluded.len()
    );

    let mut rows = ranker::select_top(ranking.rows, opts.top_n);
    let n = opts.sizing_basis.ticker_count(ranked_count, rows.len());
    sizing::size_positions(&mut rows, opts.capital, n);

    tracing::info!(
        ranked = ranked_count,
        selected = rows.len(),
        excluded = excluded.len(),
        sizing_basis = %opts.sizing_basis,
        "hqm ranking complete"
    );

    Ok(HqmReport {
        rows,
        ranked_count,
        excluded,
    })
}
