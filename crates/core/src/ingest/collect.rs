use crate::domain::horizon::{Horizon, HorizonMap};
use crate::domain::observation::TickerObservation;
use crate::ingest::provider::{PriceSource, PriceSourceError};
use chrono::{Duration, NaiveDate};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const MAX_LOGGED_FAILURES: usize = 10;

#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub batch_size: usize,
    pub concurrency: usize,
    pub horizon_days: HorizonMap<u32>,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency: 8,
            horizon_days: Horizon::default_days(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectionReport {
    /// In universe order.
    pub observations: Vec<TickerObservation>,
    pub attempted: usize,
    pub dropped_no_price: usize,
    pub failed: usize,
}

enum TickerOutcome {
    Observed(TickerObservation),
    NoPrice,
    Failed(PriceSourceError),
}

/// Successive `size`-long slices of `items` (the last may be shorter).
pub fn chunks<T>(items: &[T], size: usize) -> impl Iterator<Item = &[T]> {
    items.chunks(size.max(1))
}

/// Retrieves prices for the whole universe, one chunk at a time, with at most
/// `opts.concurrency` tickers in flight.
///
/// A ticker whose current price is unavailable or whose retrieval fails is left out; the run
/// carries on with the rest.
pub async fn collect_observations(
    source: Arc<dyn PriceSource>,
    tickers: &[String],
    as_of_date: NaiveDate,
    opts: &CollectOptions,
) -> CollectionReport {
    let total = tickers.len();
    let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let mut report = CollectionReport::default();
    let mut logged_failures: usize = 0;
    let mut offset = 0;

    for (batch_idx, batch) in chunks(tickers, opts.batch_size).enumerate() {
        let mut set = JoinSet::new();
        for (i, ticker) in batch.iter().enumerate() {
            let source = Arc::clone(&source);
            let semaphore = Arc::clone(&semaphore);
            let ticker = ticker.clone();
            let horizon_days = opts.horizon_days;

            set.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        fetch_observation(source.as_ref(), &ticker, as_of_date, &horizon_days)
                            .await
                    }
                    Err(_) => TickerOutcome::NoPrice,
                };
                (offset + i, ticker, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(batch.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(done) => outcomes.push(done),
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(error = %err, "price retrieval task aborted");
                }
            }
        }
        outcomes.sort_by_key(|(idx, _, _)| *idx);

        for (idx, ticker, outcome) in outcomes {
            match outcome {
                TickerOutcome::Observed(obs) => report.observations.push(obs),
                TickerOutcome::NoPrice => {
                    report.dropped_no_price += 1;
                    tracing::debug!(idx, %ticker, "no current price; dropping ticker");
                }
                TickerOutcome::Failed(err) => {
                    report.failed += 1;
                    if logged_failures < MAX_LOGGED_FAILURES {
                        tracing::warn!(
                            idx,
                            %ticker,
                            failure_count = report.failed,
                            error = %err,
                            "price retrieval failed; skipping ticker"
                        );
                        logged_failures += 1;
                    }
                }
            }
        }

        offset += batch.len();
        report.attempted = offset;

        tracing::info!(
            batch = batch_idx + 1,
            processed = offset,
            total,
            observations = report.observations.len(),
            dropped_no_price = report.dropped_no_price,
            failures = report.failed,
            %as_of_date,
            "price retrieval progress"
        );
    }

    report
}

async fn fetch_observation(
    source: &dyn PriceSource,
    ticker: &str,
    as_of_date: NaiveDate,
    horizon_days: &HorizonMap<u32>,
) -> TickerOutcome {
    let latest = match source.latest_price_for_day(ticker, as_of_date).await {
        Ok(latest) => latest,
        Err(err) => return TickerOutcome::Failed(err),
    };
    let Some(current_price) = latest.price.filter(|p| p.is_finite() && *p > 0.0) else {
        return TickerOutcome::NoPrice;
    };

    let mut obs = TickerObservation::new(ticker, current_price);
    obs.provenance.observed_at = latest.observed_at;
    if latest.date_used != as_of_date {
        tracing::debug!(%ticker, %as_of_date, date_used = %latest.date_used, "current price rolled back");
    }

    for (h, days) in horizon_days.iter() {
        let target = as_of_date - Duration::days(i64::from(*days));
        match source.close_on_or_before(ticker, target).await {
            Ok(close) => {
                obs.reference_prices[h] = close.price;
                obs.provenance.reference_dates[h] = close.date_used;
            }
            // A failed reference lookup only leaves that horizon undefined.
            Err(err) => {
                tracing::warn!(%ticker, horizon = %h, %target, error = %err, "reference close unavailable");
            }
        }
    }

    TickerOutcome::Observed(obs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::provider::{DailyClose, LatestPrice};
    use std::collections::HashMap;

    /// Current prices keyed by ticker; reference closes keyed by (ticker, target date).
    #[derive(Default)]
    struct FixtureSource {
        latest: HashMap<String, f64>,
        closes: HashMap<(String, NaiveDate), f64>,
        failing: Vec<String>,
    }

    #[async_trait::async_trait]
    impl PriceSource for FixtureSource {
        fn source_name(&self) -> &'static str {
            "fixture"
        }

        async fn latest_price_for_day(
            &self,
            ticker: &str,
            day: NaiveDate,
        ) -> Result<LatestPrice, PriceSourceError> {
            if self.failing.iter().any(|t| t == ticker) {
                return Err(PriceSourceError::Transport {
                    ticker: ticker.to_string(),
                    attempts: 3,
                    message: "connection reset".to_string(),
                });
            }
            Ok(match self.latest.get(ticker) {
                Some(p) => LatestPrice {
                    price: Some(*p),
                    observed_at: None,
                    date_used: day,
                },
                None => LatestPrice::unavailable(day),
            })
        }

        async fn close_on_or_before(
            &self,
            ticker: &str,
            target: NaiveDate,
        ) -> Result<DailyClose, PriceSourceError> {
            Ok(match self.closes.get(&(ticker.to_string(), target)) {
                Some(p) => DailyClose {
                    price: Some(*p),
                    date_used: Some(target),
                },
                None => DailyClose::unavailable(),
            })
        }
    }

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn tickers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn chunks_cover_everything_in_order() {
        let items: Vec<u32> = (0..7).collect();
        let sizes: Vec<usize> = chunks(&items, 3).map(|c| c.len()).collect();
        assert_eq!(sizes, [3, 3, 1]);
        assert_eq!(chunks(&items, 0).count(), 7);
    }

    #[tokio::test]
    async fn keeps_universe_order_and_drops_missing_prices() {
        let mut source = FixtureSource::default();
        for (t, p) in [("AAA", 10.0), ("CCC", 30.0), ("DDD", 40.0), ("EEE", 50.0)] {
            source.latest.insert(t.to_string(), p);
        }
        source.failing.push("DDD".to_string());

        let one_month_target = as_of() - Duration::days(30);
        source
            .closes
            .insert(("AAA".to_string(), one_month_target), 8.0);

        let opts = CollectOptions {
            batch_size: 2,
            concurrency: 3,
            ..CollectOptions::default()
        };
        let report = collect_observations(
            Arc::new(source),
            &tickers(&["AAA", "BBB", "CCC", "DDD", "EEE"]),
            as_of(),
            &opts,
        )
        .await;

        assert_eq!(report.attempted, 5);
        assert_eq!(report.dropped_no_price, 1);
        assert_eq!(report.failed, 1);

        let got: Vec<_> = report.observations.iter().map(|o| o.ticker.as_str()).collect();
        assert_eq!(got, ["AAA", "CCC", "EEE"]);

        let aaa = &report.observations[0];
        assert_eq!(aaa.current_price, 10.0);
        assert_eq!(aaa.reference_prices[Horizon::OneMonth], Some(8.0));
        assert_eq!(aaa.provenance.reference_dates[Horizon::OneMonth], Some(one_month_target));
        assert_eq!(aaa.reference_prices[Horizon::OneYear], None);
    }

    #[tokio::test]
    async fn empty_universe_yields_empty_report() {
        let report = collect_observations(
            Arc::new(FixtureSource::default()),
            &[],
            as_of(),
            &CollectOptions::default(),
        )
        .await;
        assert_eq!(report.attempted, 0);
        assert!(report.observations.is_empty());
    }
}
