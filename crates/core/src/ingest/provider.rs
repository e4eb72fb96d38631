use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

/// Latest intraday price found for a day, after rolling back over days without data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestPrice {
    pub price: Option<f64>,
    pub observed_at: Option<DateTime<FixedOffset>>,
    /// Day the price came from, or the last day tried when nothing was found.
    pub date_used: NaiveDate,
}

impl LatestPrice {
    pub fn unavailable(date_used: NaiveDate) -> Self {
        Self {
            price: None,
            observed_at: None,
            date_used,
        }
    }
}

/// Last daily close at or before a target date.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DailyClose {
    pub price: Option<f64>,
    pub date_used: Option<NaiveDate>,
}

impl DailyClose {
    pub fn unavailable() -> Self {
        Self::default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PriceSourceError {
    #[error("{ticker}: request failed after {attempts} attempts: {message}")]
    Transport {
        ticker: String,
        attempts: u32,
        message: String,
    },

    #[error("{ticker}: HTTP {status}: {body}")]
    Http {
        ticker: String,
        status: u16,
        body: String,
    },

    #[error("{ticker}: malformed response: {detail}")]
    Malformed { ticker: String, detail: String },
}

/// Market-data collaborator. "No data" is `Ok` with an absent price; `Err` is reserved for
/// failures talking to the source.
#[async_trait::async_trait]
pub trait PriceSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    async fn latest_price_for_day(
        &self,
        ticker: &str,
        day: NaiveDate,
    ) -> Result<LatestPrice, PriceSourceError>;

    async fn close_on_or_before(
        &self,
        ticker: &str,
        target: NaiveDate,
    ) -> Result<DailyClose, PriceSourceError>;
}
