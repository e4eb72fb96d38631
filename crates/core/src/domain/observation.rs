use crate::domain::horizon::HorizonMap;
use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

/// When the prices behind a row were actually observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceProvenance {
    /// Exchange-local timestamp of the current price; earlier than the as-of day after a rollback.
    pub observed_at: Option<DateTime<FixedOffset>>,
    /// Trading date of each reference close, which may precede the target date.
    pub reference_dates: HorizonMap<Option<NaiveDate>>,
}

/// Prices retrieved for one ticker. Only tickers with a current price get one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerObservation {
    pub ticker: String,
    pub current_price: f64,
    pub reference_prices: HorizonMap<Option<f64>>,
    pub provenance: PriceProvenance,
}

impl TickerObservation {
    pub fn new(ticker: impl Into<String>, current_price: f64) -> Self {
        Self {
            ticker: ticker.into(),
            current_price,
            reference_prices: HorizonMap::default(),
            provenance: PriceProvenance::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnVector {
    pub ticker: String,
    pub current_price: f64,
    /// `None` when the return is undefined (reference missing or zero).
    pub returns: HorizonMap<Option<f64>>,
    pub provenance: PriceProvenance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedRow {
    pub ticker: String,
    pub price: f64,
    pub filled_returns: HorizonMap<f64>,
    /// Fractions in `[0, 1]`.
    pub percentiles: HorizonMap<f64>,
    pub composite_score: f64,
    pub shares_to_buy: u64,
    pub provenance: PriceProvenance,
}

/// A ticker that was dropped between retrieval and the final ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub ticker: String,
    pub reason: String,
}
