use crate::config::Settings;
use crate::ingest::provider::{DailyClose, LatestPrice, PriceSource, PriceSourceError};
use crate::ingest::types::{ChartResponse, ChartResult, PriceBar};
use crate::time::us_market;
use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate};
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://query2.finance.yahoo.com";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRIES: u32 = 3;
const MAX_RETRIES: u32 = 10;
const DEFAULT_MAX_BACK_DAYS: u32 = 10;
const DEFAULT_LOOKBACK_DAYS: u32 = 10;
const USER_AGENT: &str = "Mozilla/5.0 (compatible; hqm-worker/0.1)";
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interval {
    Minute,
    Day,
}

impl Interval {
    fn as_str(self) -> &'static str {
        match self {
            Interval::Minute => "1m",
            Interval::Day => "1d",
        }
    }
}

/// Price source backed by the Yahoo Finance v8 chart endpoint.
#[derive(Debug, Clone)]
pub struct YahooChartSource {
    http: reqwest::Client,
    base_url: String,
    retries: u32,
    max_back_days: u32,
    lookback_days: u32,
}

impl YahooChartSource {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let base_url = settings
            .price_source_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let timeout_secs = std::env::var("PRICE_SOURCE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let retries = std::env::var("PRICE_SOURCE_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_RETRIES)
            .clamp(1, MAX_RETRIES);

        let max_back_days = std::env::var("PRICE_SOURCE_MAX_BACK_DAYS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_BACK_DAYS);

        let lookback_days = std::env::var("PRICE_SOURCE_LOOKBACK_DAYS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_LOOKBACK_DAYS);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build price source http client")?;

        Ok(Self {
            http,
            base_url,
            retries,
            max_back_days,
            lookback_days,
        })
    }

    fn chart_url(&self, ticker: &str) -> String {
        format!(
            "{}/v8/finance/chart/{}",
            self.base_url.trim_end_matches('/'),
            ticker
        )
    }

    /// `Ok(None)` when the source answers but has nothing for the window.
    async fn fetch_chart(
        &self,
        ticker: &str,
        period1: DateTime<chrono::Utc>,
        period2: DateTime<chrono::Utc>,
        interval: Interval,
    ) -> Result<Option<ChartResult>, PriceSourceError> {
        let url = self.chart_url(ticker);
        let params = [
            ("period1", period1.timestamp().to_string()),
            ("period2", period2.timestamp().to_string()),
            ("interval", interval.as_str().to_string()),
            ("includePrePost", "false".to_string()),
            ("includeAdjustedClose", "true".to_string()),
        ];

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let res = match self.http.get(&url).query(&params).send().await {
                Ok(r) => r,
                Err(err) => {
                    if attempt >= self.retries {
                        return Err(PriceSourceError::Transport {
                            ticker: ticker.to_string(),
                            attempts: attempt,
                            message: err.to_string(),
                        });
                    }
                    let delay = backoff(attempt);
                    tracing::warn!(attempt, ?delay, %ticker, error = %err, "price request failed; retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = res.status();
            let text = match res.text().await {
                Ok(t) => t,
                Err(err) => {
                    if attempt >= self.retries {
                        return Err(PriceSourceError::Transport {
                            ticker: ticker.to_string(),
                            attempts: attempt,
                            message: format!("failed to read response body: {err}"),
                        });
                    }
                    let delay = backoff(attempt);
                    tracing::warn!(attempt, ?delay, %ticker, error = %err, "price response read failed; retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            match classify_response(status, &text) {
                ResponseAction::Parse => {
                    let parsed = serde_json::from_str::<ChartResponse>(&text).map_err(|err| {
                        PriceSourceError::Malformed {
                            ticker: ticker.to_string(),
                            detail: err.to_string(),
                        }
                    })?;
                    return Ok(first_result(ticker, parsed));
                }
                ResponseAction::NoData => {
                    tracing::debug!(%ticker, http_status = %status, "no chart data");
                    return Ok(None);
                }
                ResponseAction::Retry if attempt < self.retries => {
                    let delay = backoff(attempt);
                    tracing::warn!(attempt, ?delay, %ticker, http_status = %status, "price HTTP error; retrying");
                    tokio::time::sleep(delay).await;
                }
                ResponseAction::Retry | ResponseAction::Fail => {
                    return Err(PriceSourceError::Http {
                        ticker: ticker.to_string(),
                        status: status.as_u16(),
                        body: truncate(&text, MAX_ERROR_BODY),
                    });
                }
            }
        }
    }
}

/// What to do with one HTTP response from the chart endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseAction {
    Parse,
    Retry,
    /// Unknown symbols and out-of-range windows come back as 4xx with a chart error.
    NoData,
    Fail,
}

fn classify_response(status: StatusCode, body: &str) -> ResponseAction {
    if status.is_success() {
        return ResponseAction::Parse;
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return ResponseAction::Retry;
    }
    if status.is_client_error() {
        let has_chart_error = serde_json::from_str::<ChartResponse>(body)
            .map(|parsed| parsed.chart.error.is_some())
            .unwrap_or(false);
        if has_chart_error {
            return ResponseAction::NoData;
        }
    }
    ResponseAction::Fail
}

/// `1s, 2s, 4s, ...` for attempts `1, 2, 3, ...`; saturates instead of overflowing.
fn backoff(attempt: u32) -> Duration {
    let secs = 1u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    Duration::from_secs(secs)
}

/// Tries `day`, then each earlier calendar day, for at most `max_back_days + 1` days.
///
/// `fetch_day` yields the last usable bar of one day, or `None` when that day had none.
/// Errors stop the walk. When every day misses, the price is unavailable as of the last
/// day tried.
pub(crate) async fn walk_back_days<F, Fut>(
    day: NaiveDate,
    max_back_days: u32,
    mut fetch_day: F,
) -> Result<LatestPrice, PriceSourceError>
where
    F: FnMut(NaiveDate) -> Fut,
    Fut: Future<Output = Result<Option<PriceBar>, PriceSourceError>>,
{
    let mut used_day = day;
    for tried in 0..=max_back_days {
        if tried != 0 {
            match used_day.pred_opt() {
                Some(d) => used_day = d,
                None => break,
            }
        }

        if let Some(bar) = fetch_day(used_day).await? {
            return Ok(LatestPrice {
                price: Some(bar.close),
                observed_at: Some(bar.at),
                date_used: used_day,
            });
        }
    }

    Ok(LatestPrice::unavailable(used_day))
}

#[async_trait::async_trait]
impl PriceSource for YahooChartSource {
    fn source_name(&self) -> &'static str {
        "yahoo_chart"
    }

    async fn latest_price_for_day(
        &self,
        ticker: &str,
        day: NaiveDate,
    ) -> Result<LatestPrice, PriceSourceError> {
        walk_back_days(day, self.max_back_days, move |used_day| async move {
            let (start, end) = us_market::eastern_day_bounds(used_day)
                .map_err(|err| window_error(ticker, used_day, err))?;
            let offset = us_market::eastern_offset_on(used_day)
                .map_err(|err| window_error(ticker, used_day, err))?;

            let Some(result) = self
                .fetch_chart(ticker, start, end, Interval::Minute)
                .await?
            else {
                return Ok(None);
            };

            let bars = bars_from_result(&result, false, offset);
            Ok::<_, PriceSourceError>(last_bar_on(&bars, used_day))
        })
        .await
    }

    async fn close_on_or_before(
        &self,
        ticker: &str,
        target: NaiveDate,
    ) -> Result<DailyClose, PriceSourceError> {
        let start_day = target - chrono::Duration::days(i64::from(self.lookback_days));
        let (start, _) = us_market::eastern_day_bounds(start_day)
            .map_err(|err| window_error(ticker, start_day, err))?;
        let (_, end) = us_market::eastern_day_bounds(target)
            .map_err(|err| window_error(ticker, target, err))?;
        let offset = us_market::eastern_offset_on(target)
            .map_err(|err| window_error(ticker, target, err))?;

        let Some(result) = self.fetch_chart(ticker, start, end, Interval::Day).await? else {
            return Ok(DailyClose::unavailable());
        };

        let bars = bars_from_result(&result, true, offset);
        Ok(match last_bar_on_or_before(&bars, target) {
            Some(bar) => DailyClose {
                price: Some(bar.close),
                date_used: Some(bar.date()),
            },
            None => DailyClose::unavailable(),
        })
    }
}

fn first_result(ticker: &str, parsed: ChartResponse) -> Option<ChartResult> {
    if let Some(err) = parsed.chart.error {
        tracing::debug!(%ticker, code = %err.code, description = %err.description, "no chart data");
        return None;
    }
    parsed.chart.result.and_then(|r| r.into_iter().next())
}

/// Usable closes in timestamp order. Bars with a missing, non-finite or non-positive close
/// are skipped. Adjusted closes are used when requested and present.
pub(crate) fn bars_from_result(
    result: &ChartResult,
    prefer_adjusted: bool,
    fallback_offset: FixedOffset,
) -> Vec<PriceBar> {
    let offset = result
        .meta
        .gmtoffset
        .and_then(FixedOffset::east_opt)
        .unwrap_or(fallback_offset);

    let adjusted = result
        .indicators
        .adjclose
        .as_ref()
        .and_then(|v| v.first())
        .map(|a| &a.adjclose)
        .filter(|closes| !closes.is_empty());
    let raw = result.indicators.quote.first().map(|q| &q.close);

    let closes = match (prefer_adjusted, adjusted, raw) {
        (true, Some(adj), _) => adj,
        (_, _, Some(raw)) => raw,
        (_, Some(adj), None) => adj,
        (_, None, None) => return Vec::new(),
    };

    let mut bars = Vec::with_capacity(result.timestamp.len());
    for (i, ts) in result.timestamp.iter().enumerate() {
        let Some(close) = closes.get(i).copied().flatten() else {
            continue;
        };
        if !close.is_finite() || close <= 0.0 {
            continue;
        }
        let Some(at) = DateTime::from_timestamp(*ts, 0) else {
            continue;
        };
        bars.push(PriceBar {
            at: at.with_timezone(&offset),
            close,
        });
    }
    bars.sort_by_key(|b| b.at);
    bars
}

pub(crate) fn last_bar_on(bars: &[PriceBar], day: NaiveDate) -> Option<PriceBar> {
    bars.iter().rev().find(|b| b.date() == day).copied()
}

pub(crate) fn last_bar_on_or_before(bars: &[PriceBar], target: NaiveDate) -> Option<PriceBar> {
    bars.iter().rev().find(|b| b.date() <= target).copied()
}

fn window_error(ticker: &str, date: NaiveDate, err: anyhow::Error) -> PriceSourceError {
    PriceSourceError::Malformed {
        ticker: ticker.to_string(),
        detail: format!("cannot build query window for {date}: {err:#}"),
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn est() -> FixedOffset {
        FixedOffset::east_opt(-5 * 3600).unwrap()
    }

    fn daily_fixture() -> ChartResponse {
        // 2026-01-05..2026-01-08 at 09:30 EST, one bar with a null close.
        let v = json!({
            "chart": {
                "result": [{
                    "meta": {
                        "symbol": "AAPL",
                        "gmtoffset": -18000,
                        "exchangeTimezoneName": "America/New_York"
                    },
                    "timestamp": [1767623400, 1767709800, 1767796200, 1767882600],
                    "indicators": {
                        "quote": [{"close": [101.0, 102.0, null, 104.0]}],
                        "adjclose": [{"adjclose": [100.5, 101.5, null, 103.5]}]
                    }
                }],
                "error": null
            }
        });
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn parses_chart_and_prefers_adjusted_closes() {
        let result = first_result("AAPL", daily_fixture()).unwrap();
        assert_eq!(result.meta.symbol.as_deref(), Some("AAPL"));

        let adjusted = bars_from_result(&result, true, est());
        assert_eq!(adjusted.len(), 3);
        assert_eq!(adjusted[0].close, 100.5);
        assert_eq!(adjusted[0].date(), NaiveDate::from_ymd_opt(2026, 1, 5).unwrap());

        let raw = bars_from_result(&result, false, est());
        assert_eq!(raw[2].close, 104.0);
    }

    #[test]
    fn picks_last_close_on_or_before_target() {
        let result = first_result("AAPL", daily_fixture()).unwrap();
        let bars = bars_from_result(&result, true, est());

        // 2026-01-07 has a null close; fall back to 2026-01-06.
        let target = NaiveDate::from_ymd_opt(2026, 1, 7).unwrap();
        let bar = last_bar_on_or_before(&bars, target).unwrap();
        assert_eq!(bar.close, 101.5);
        assert_eq!(bar.date(), NaiveDate::from_ymd_opt(2026, 1, 6).unwrap());

        let too_early = NaiveDate::from_ymd_opt(2026, 1, 4).unwrap();
        assert!(last_bar_on_or_before(&bars, too_early).is_none());
    }

    #[test]
    fn last_bar_on_day_ignores_other_days() {
        let result = first_result("AAPL", daily_fixture()).unwrap();
        let bars = bars_from_result(&result, false, est());
        let day = NaiveDate::from_ymd_opt(2026, 1, 7).unwrap();
        assert!(last_bar_on(&bars, day).is_none());
        let day = NaiveDate::from_ymd_opt(2026, 1, 8).unwrap();
        assert_eq!(last_bar_on(&bars, day).unwrap().close, 104.0);
    }

    #[test]
    fn chart_error_means_no_data() {
        let v = json!({
            "chart": {
                "result": null,
                "error": {"code": "Not Found", "description": "No data found, symbol may be delisted"}
            }
        });
        let parsed: ChartResponse = serde_json::from_value(v).unwrap();
        assert!(first_result("ZZZZ", parsed).is_none());
    }

    #[test]
    fn non_positive_closes_are_skipped() {
        let v = json!({
            "chart": {
                "result": [{
                    "timestamp": [1767623400, 1767709800],
                    "indicators": {"quote": [{"close": [0.0, -3.0]}]}
                }]
            }
        });
        let parsed: ChartResponse = serde_json::from_value(v).unwrap();
        let result = first_result("X", parsed).unwrap();
        assert!(bars_from_result(&result, true, est()).is_empty());
    }

    #[test]
    fn truncates_long_error_bodies() {
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("abc", 3), "abc");
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn bar_on(day: NaiveDate, close: f64) -> PriceBar {
        let at = day
            .and_hms_opt(15, 59, 0)
            .unwrap()
            .and_local_timezone(est())
            .single()
            .unwrap();
        PriceBar { at, close }
    }

    #[tokio::test]
    async fn rolls_back_until_a_day_has_a_bar() {
        // Monday 2026-01-12 back to Friday 2026-01-09.
        let friday = ymd(2026, 1, 9);
        let mut tried = Vec::new();
        let latest = walk_back_days(ymd(2026, 1, 12), 10, |day| {
            tried.push(day);
            let bar = (day == friday).then(|| bar_on(day, 187.25));
            async move { Ok::<_, PriceSourceError>(bar) }
        })
        .await
        .unwrap();

        assert_eq!(
            tried,
            [ymd(2026, 1, 12), ymd(2026, 1, 11), ymd(2026, 1, 10), friday]
        );
        assert_eq!(latest.price, Some(187.25));
        assert_eq!(latest.date_used, friday);
        assert_eq!(latest.observed_at, Some(bar_on(friday, 187.25).at));
    }

    #[tokio::test]
    async fn gives_up_after_max_back_days() {
        let mut tried = Vec::new();
        let latest = walk_back_days(ymd(2026, 1, 12), 3, |day| {
            tried.push(day);
            async move { Ok::<_, PriceSourceError>(None) }
        })
        .await
        .unwrap();

        assert_eq!(tried.len(), 4);
        assert_eq!(latest, LatestPrice::unavailable(ymd(2026, 1, 9)));
    }

    #[tokio::test]
    async fn error_on_a_rollback_day_stops_the_walk() {
        let first = ymd(2026, 1, 12);
        let mut tried = Vec::new();
        let result = walk_back_days(first, 10, |day| {
            tried.push(day);
            async move {
                if day == first {
                    Ok::<Option<PriceBar>, PriceSourceError>(None)
                } else {
                    Err(PriceSourceError::Transport {
                        ticker: "AAPL".to_string(),
                        attempts: 3,
                        message: "connection reset".to_string(),
                    })
                }
            }
        })
        .await;

        assert!(matches!(result, Err(PriceSourceError::Transport { .. })));
        assert_eq!(tried.len(), 2);
    }

    #[test]
    fn throttling_and_server_errors_are_retried() {
        assert_eq!(classify_response(StatusCode::OK, "{}"), ResponseAction::Parse);
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert_eq!(classify_response(status, ""), ResponseAction::Retry, "{status}");
        }
    }

    #[test]
    fn client_errors_are_not_retried() {
        let not_found = json!({
            "chart": {
                "result": null,
                "error": {"code": "Not Found", "description": "No data found, symbol may be delisted"}
            }
        })
        .to_string();

        assert_eq!(
            classify_response(StatusCode::NOT_FOUND, &not_found),
            ResponseAction::NoData
        );
        assert_eq!(
            classify_response(StatusCode::UNPROCESSABLE_ENTITY, &not_found),
            ResponseAction::NoData
        );
        assert_eq!(
            classify_response(StatusCode::NOT_FOUND, "<html>gone</html>"),
            ResponseAction::Fail
        );
        assert_eq!(
            classify_response(StatusCode::UNAUTHORIZED, r#"{"chart":{"result":null}}"#),
            ResponseAction::Fail
        );
        // A chart error on a 5xx is still a server problem.
        assert_eq!(
            classify_response(StatusCode::INTERNAL_SERVER_ERROR, &not_found),
            ResponseAction::Retry
        );
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(4), Duration::from_secs(8));
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(65), Duration::from_secs(u64::MAX));
        assert_eq!(backoff(u32::MAX), Duration::from_secs(u64::MAX));
    }
}
