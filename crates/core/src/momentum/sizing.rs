use crate::domain::observation::RankedRow;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which ticker count the capital is split across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingBasis {
    /// Every ranked ticker, before top-N selection.
    #[default]
    Universe,
    /// Only the selected top-N tickers.
    Selected,
}

impl SizingBasis {
    pub fn ticker_count(self, ranked: usize, selected: usize) -> usize {
        match self {
            SizingBasis::Universe => ranked,
            SizingBasis::Selected => selected,
        }
    }
}

impl FromStr for SizingBasis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "universe" => Ok(Self::Universe),
            "selected" => Ok(Self::Selected),
            other => Err(format!(
                "unknown sizing basis {other:?} (expected universe or selected)"
            )),
        }
    }
}

impl fmt::Display for SizingBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizingBasis::Universe => f.write_str("universe"),
            SizingBasis::Selected => f.write_str("selected"),
        }
    }
}

/// Equal-weight dollar allocation per ticker.
pub fn position_size(capital: f64, n_tickers: usize) -> Option<f64> {
    if n_tickers == 0 || !capital.is_finite() || capital <= 0.0 {
        return None;
    }
    Some(capital / n_tickers as f64)
}

/// Whole shares affordable with an equal-weight slice of `capital`. Unusable inputs size to 0.
pub fn shares(capital: f64, n_tickers: usize, price: f64) -> u64 {
    let Some(size) = position_size(capital, n_tickers) else {
        return 0;
    };
    if !price.is_finite() || price <= 0.0 {
        return 0;
    }

    let n = (size / price).floor();
    if n.is_finite() && n >= 0.0 {
        n as u64
    } else {
        0
    }
}

pub fn size_positions(rows: &mut [RankedRow], capital: f64, n_tickers: usize) {
    for row in rows {
        row.shares_to_buy = shares(capital, n_tickers, row.price);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_weight_floor() {
        assert_eq!(position_size(1_000_000.0, 2), Some(500_000.0));
        assert_eq!(shares(1_000_000.0, 2, 100.0), 5000);
        assert_eq!(shares(1_000_000.0, 2, 250.0), 2000);
        assert_eq!(shares(1_000_000.0, 3, 7.0), 47619);
    }

    #[test]
    fn unusable_inputs_degrade_to_zero() {
        assert_eq!(shares(1_000_000.0, 2, 0.0), 0);
        assert_eq!(shares(1_000_000.0, 2, -5.0), 0);
        assert_eq!(shares(1_000_000.0, 2, f64::NAN), 0);
        assert_eq!(shares(1_000_000.0, 0, 10.0), 0);
        assert_eq!(shares(0.0, 2, 10.0), 0);
    }

    #[test]
    fn price_above_position_buys_nothing() {
        assert_eq!(shares(1_000.0, 10, 250.0), 0);
    }

    #[test]
    fn basis_picks_denominator() {
        assert_eq!(SizingBasis::Universe.ticker_count(500, 50), 500);
        assert_eq!(SizingBasis::Selected.ticker_count(500, 50), 50);
        assert_eq!("Selected".parse::<SizingBasis>(), Ok(SizingBasis::Selected));
    }
}
