pub mod domain;
pub mod ingest;
pub mod momentum;
pub mod report;
pub mod storage;
pub mod time;

pub mod config {
    use crate::domain::horizon::{Horizon, HorizonMap};
    use crate::momentum::ranker::PercentileKind;
    use crate::momentum::sizing::SizingBasis;
    use anyhow::Context;
    use std::path::PathBuf;
    use std::str::FromStr;

    const DEFAULT_CAPITAL: f64 = 1_000_000.0;
    const DEFAULT_TOP_N: usize = 50;
    const DEFAULT_BATCH_SIZE: usize = 100;
    const DEFAULT_CONCURRENCY: usize = 8;
    const DEFAULT_UNIVERSE_CSV: &str = "sp_500_stocks.csv";
    const DEFAULT_REPORT_DIR: &str = "reports";

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub price_source_base_url: Option<String>,
        pub capital: f64,
        pub top_n: usize,
        pub horizon_days: HorizonMap<u32>,
        pub batch_size: usize,
        pub concurrency: usize,
        pub sizing_basis: SizingBasis,
        pub percentile_kind: PercentileKind,
        pub universe_csv: PathBuf,
        pub report_dir: PathBuf,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Self::from_lookup(|key| std::env::var(key).ok())
        }

        /// Builds settings from an arbitrary key lookup. Unset keys fall back to defaults;
        /// set-but-unparsable keys are an error.
        pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
            let var = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());

            let horizon_days = match var("HQM_HORIZON_DAYS") {
                Some(s) => parse_horizon_days(&s).context("invalid HQM_HORIZON_DAYS")?,
                None => Horizon::default_days(),
            };

            Ok(Self {
                database_url: var("DATABASE_URL"),
                sentry_dsn: var("SENTRY_DSN"),
                price_source_base_url: var("PRICE_SOURCE_BASE_URL"),
                capital: parse_or(var("HQM_CAPITAL"), "HQM_CAPITAL", DEFAULT_CAPITAL)?,
                top_n: parse_or(var("HQM_TOP_N"), "HQM_TOP_N", DEFAULT_TOP_N)?,
                horizon_days,
                batch_size: parse_or(var("HQM_BATCH_SIZE"), "HQM_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
                concurrency: parse_or(
                    var("HQM_CONCURRENCY"),
                    "HQM_CONCURRENCY",
                    DEFAULT_CONCURRENCY,
                )?,
                sizing_basis: parse_or(
                    var("HQM_SIZING_BASIS"),
                    "HQM_SIZING_BASIS",
                    SizingBasis::default(),
                )?,
                percentile_kind: parse_or(
                    var("HQM_PERCENTILE_KIND"),
                    "HQM_PERCENTILE_KIND",
                    PercentileKind::default(),
                )?,
                universe_csv: var("HQM_UNIVERSE_CSV")
                    .unwrap_or_else(|| DEFAULT_UNIVERSE_CSV.to_string())
                    .into(),
                report_dir: var("HQM_REPORT_DIR")
                    .unwrap_or_else(|| DEFAULT_REPORT_DIR.to_string())
                    .into(),
            })
        }

        pub fn validate(&self) -> anyhow::Result<()> {
            anyhow::ensure!(
                self.capital.is_finite() && self.capital > 0.0,
                "capital must be a positive amount (got {})",
                self.capital
            );
            anyhow::ensure!(self.top_n >= 1, "top_n must be >= 1");
            anyhow::ensure!(self.batch_size >= 1, "batch_size must be >= 1");
            anyhow::ensure!(self.concurrency >= 1, "concurrency must be >= 1");
            validate_horizon_days(&self.horizon_days)
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }
    }

    fn parse_or<T>(value: Option<String>, key: &str, default: T) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match value {
            Some(s) => s
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid {key}={s:?}: {e}")),
            None => Ok(default),
        }
    }

    /// Parses `"365,182,91,30"` into 1Y, 6M, 3M, 1M lookbacks.
    pub fn parse_horizon_days(s: &str) -> anyhow::Result<HorizonMap<u32>> {
        let parts = s
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<u32>()
                    .with_context(|| format!("not a day count: {p:?}"))
            })
            .collect::<anyhow::Result<Vec<u32>>>()?;

        anyhow::ensure!(
            parts.len() == Horizon::ALL.len(),
            "expected {} comma-separated day counts (got {})",
            Horizon::ALL.len(),
            parts.len()
        );

        let days = HorizonMap::from_fn(|h| parts[h.index()]);
        validate_horizon_days(&days)?;
        Ok(days)
    }

    fn validate_horizon_days(days: &HorizonMap<u32>) -> anyhow::Result<()> {
        let values: Vec<u32> = days.values().copied().collect();
        anyhow::ensure!(
            values.iter().all(|d| *d > 0),
            "horizon lengths must be positive (got {values:?})"
        );
        anyhow::ensure!(
            values.windows(2).all(|w| w[0] > w[1]),
            "horizon lengths must be strictly decreasing from 1Y to 1M (got {values:?})"
        );
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::collections::HashMap;

        fn settings_from(pairs: &[(&str, &str)]) -> anyhow::Result<Settings> {
            let map: HashMap<String, String> = pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            Settings::from_lookup(|k| map.get(k).cloned())
        }

        #[test]
        fn defaults_match_reference_run() {
            let s = settings_from(&[]).unwrap();
            assert_eq!(s.capital, 1_000_000.0);
            assert_eq!(s.top_n, 50);
            assert_eq!(s.batch_size, 100);
            assert_eq!(s.horizon_days, Horizon::default_days());
            assert_eq!(s.sizing_basis, SizingBasis::Universe);
            assert_eq!(s.percentile_kind, PercentileKind::Mean);
            s.validate().unwrap();
        }

        #[test]
        fn overrides_are_parsed() {
            let s = settings_from(&[
                ("HQM_CAPITAL", "250000"),
                ("HQM_TOP_N", "10"),
                ("HQM_HORIZON_DAYS", "360, 180, 90, 28"),
                ("HQM_SIZING_BASIS", "selected"),
            ])
            .unwrap();
            assert_eq!(s.capital, 250_000.0);
            assert_eq!(s.top_n, 10);
            assert_eq!(s.horizon_days[Horizon::OneMonth], 28);
            assert_eq!(s.sizing_basis, SizingBasis::Selected);
        }

        #[test]
        fn unparsable_values_are_rejected() {
            assert!(settings_from(&[("HQM_TOP_N", "fifty")]).is_err());
            assert!(settings_from(&[("HQM_HORIZON_DAYS", "365,182,91")]).is_err());
            assert!(settings_from(&[("HQM_HORIZON_DAYS", "30,91,182,365")]).is_err());
        }

        #[test]
        fn validate_rejects_zero_top_n_and_capital() {
            let mut s = settings_from(&[]).unwrap();
            s.top_n = 0;
            assert!(s.validate().is_err());

            let mut s = settings_from(&[]).unwrap();
            s.capital = 0.0;
            assert!(s.validate().is_err());
        }
    }
}
