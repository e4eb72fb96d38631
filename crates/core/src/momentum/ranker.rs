//! Cross-sectional percentile ranking of per-horizon returns.
//!
//! The ranker is a pure function of its input: it never reads prices, never keeps state
//! between calls, and orders tied composite scores by input (retrieval) order.

use crate::domain::horizon::{Horizon, HorizonMap};
use crate::domain::observation::{Exclusion, RankedRow, ReturnVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Return substituted for an undefined one before ranking ("no movement").
pub const FALLBACK_RETURN: f64 = 0.0;

/// How a value tied with others in the distribution is credited.
///
/// With `less` values strictly below `v`, `equal` values equal to `v` and `m` values in
/// total:
/// - `Mean`: `(less + equal / 2) / m`
/// - `Rank`: average of the rank fractions of the tied block, `(2 * less + equal + 1) / (2m)`
/// - `Strict`: `less / m`
/// - `Weak`: `(less + equal) / m`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PercentileKind {
    #[default]
    Mean,
    Rank,
    Strict,
    Weak,
}

impl FromStr for PercentileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean" => Ok(Self::Mean),
            "rank" => Ok(Self::Rank),
            "strict" => Ok(Self::Strict),
            "weak" => Ok(Self::Weak),
            other => Err(format!(
                "unknown percentile kind {other:?} (expected mean, rank, strict or weak)"
            )),
        }
    }
}

impl fmt::Display for PercentileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Mean => "mean",
            Self::Rank => "rank",
            Self::Strict => "strict",
            Self::Weak => "weak",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RankError {
    #[error("{ticker}: {horizon} return is not finite after fallback ({value})")]
    NonFiniteReturn {
        ticker: String,
        horizon: Horizon,
        value: f64,
    },

    #[error("{ticker}: {horizon} percentile is undefined")]
    UndefinedPercentile { ticker: String, horizon: Horizon },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankOptions {
    pub fallback_return: f64,
    pub percentile_kind: PercentileKind,
}

impl Default for RankOptions {
    fn default() -> Self {
        Self {
            fallback_return: FALLBACK_RETURN,
            percentile_kind: PercentileKind::Mean,
        }
    }
}

/// All ranked tickers (composite score descending) plus the ones that could not be ranked.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Ranking {
    pub rows: Vec<RankedRow>,
    pub excluded: Vec<Exclusion>,
}

/// Replaces every undefined return with `fallback`, horizon by horizon.
pub fn apply_fallback(returns: &HorizonMap<Option<f64>>, fallback: f64) -> HorizonMap<f64> {
    returns.map(|_, r| r.unwrap_or(fallback))
}

/// The full set of one horizon's returns for the current run.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDistribution {
    sorted: Vec<f64>,
}

impl ReferenceDistribution {
    /// Non-finite values are not admitted; callers screen them out first.
    pub fn new(values: impl IntoIterator<Item = f64>) -> Self {
        let mut sorted: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        sorted.sort_by(f64::total_cmp);
        Self { sorted }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// Percentile of `v` as a fraction in `[0, 1]`; `None` for an empty distribution or a
    /// non-finite `v`.
    pub fn percentile_of(&self, v: f64, kind: PercentileKind) -> Option<f64> {
        if self.sorted.is_empty() || !v.is_finite() {
            return None;
        }

        let less = self.sorted.partition_point(|x| *x < v);
        let less_or_equal = self.sorted.partition_point(|x| *x <= v);
        let equal = less_or_equal - less;
        let m = self.sorted.len() as f64;

        let p = match kind {
            PercentileKind::Mean => (less as f64 + 0.5 * equal as f64) / m,
            PercentileKind::Rank => {
                let bump = if equal > 0 { 1.0 } else { 0.0 };
                (2.0 * less as f64 + equal as f64 + bump) / (2.0 * m)
            }
            PercentileKind::Strict => less as f64 / m,
            PercentileKind::Weak => less_or_equal as f64 / m,
        };
        Some(p)
    }
}

/// Mean of the four horizon percentiles. Any missing percentile is a data-integrity error.
pub fn composite_score(
    ticker: &str,
    percentiles: &HorizonMap<Option<f64>>,
) -> Result<(HorizonMap<f64>, f64), RankError> {
    let mut out = HorizonMap::<f64>::default();
    for (h, p) in percentiles.iter() {
        out[h] = p.ok_or_else(|| RankError::UndefinedPercentile {
            ticker: ticker.to_string(),
            horizon: h,
        })?;
    }

    let mean = out.values().sum::<f64>() / Horizon::ALL.len() as f64;
    Ok((out, mean))
}

pub fn rank(vectors: &[ReturnVector], opts: &RankOptions) -> Ranking {
    let mut excluded = Vec::new();

    let mut filled = Vec::with_capacity(vectors.len());
    for v in vectors {
        let returns = apply_fallback(&v.returns, opts.fallback_return);
        let bad = returns
            .iter()
            .find(|(_, r)| !r.is_finite())
            .map(|(h, r)| (h, *r));
        match bad {
            Some((horizon, value)) => {
                let err = RankError::NonFiniteReturn {
                    ticker: v.ticker.clone(),
                    horizon,
                    value,
                };
                tracing::warn!(ticker = %v.ticker, error = %err, "excluding ticker from ranking");
                excluded.push(Exclusion {
                    ticker: v.ticker.clone(),
                    reason: err.to_string(),
                });
            }
            None => filled.push((v, returns)),
        }
    }

    // Every percentile needs the complete distribution for its horizon.
    let distributions = HorizonMap::from_fn(|h| {
        ReferenceDistribution::new(filled.iter().map(|(_, returns)| returns[h]))
    });

    let mut rows = Vec::with_capacity(filled.len());
    for (v, returns) in filled {
        let percentiles =
            distributions.map(|h, dist| dist.percentile_of(returns[h], opts.percentile_kind));

        match composite_score(&v.ticker, &percentiles) {
            Ok((percentiles, score)) => rows.push(RankedRow {
                ticker: v.ticker.clone(),
                price: v.current_price,
                filled_returns: returns,
                percentiles,
                composite_score: score,
                shares_to_buy: 0,
                provenance: v.provenance,
            }),
            Err(err) => {
                tracing::warn!(ticker = %v.ticker, error = %err, "excluding ticker from ranking");
                excluded.push(Exclusion {
                    ticker: v.ticker.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    // `sort_by` is stable: equal scores keep retrieval order.
    rows.sort_by(|a, b| b.composite_score.total_cmp(&a.composite_score));

    Ranking { rows, excluded }
}

/// Keeps exactly the first `top_n` rows (fewer if there are not that many).
pub fn select_top(mut rows: Vec<RankedRow>, top_n: usize) -> Vec<RankedRow> {
    rows.truncate(top_n);
    rows
}
