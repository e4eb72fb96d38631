use anyhow::Context;
use chrono::NaiveDate;
use clap::Parser;
use hqm_core::config::Settings;
use hqm_core::ingest::collect::{CollectOptions, CollectionReport};
use hqm_core::ingest::provider::PriceSource;
use hqm_core::momentum::ranker::PercentileKind;
use hqm_core::momentum::sizing::SizingBasis;
use hqm_core::momentum::{HqmReport, PipelineOptions};
use hqm_core::storage::snapshots::SnapshotMeta;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod universe;

#[derive(Debug, Parser)]
#[command(name = "hqm_worker", about = "Rank a ticker universe by High Quality Momentum")]
struct Args {
    /// Market as-of date (YYYY-MM-DD). Defaults to today's US Eastern date.
    #[arg(long)]
    as_of_date: Option<String>,

    /// Ticker list CSV with a Ticker column. Overrides HQM_UNIVERSE_CSV.
    #[arg(long)]
    universe: Option<PathBuf>,

    /// Directory for the CSV report. Overrides HQM_REPORT_DIR.
    #[arg(long)]
    report_dir: Option<PathBuf>,

    /// Number of tickers to select. Overrides HQM_TOP_N.
    #[arg(long)]
    top_n: Option<usize>,

    /// Portfolio size to allocate. Overrides HQM_CAPITAL.
    #[arg(long)]
    capital: Option<f64>,

    /// `universe` or `selected`. Overrides HQM_SIZING_BASIS.
    #[arg(long)]
    sizing_basis: Option<SizingBasis>,

    /// `mean`, `rank`, `strict` or `weak`. Overrides HQM_PERCENTILE_KIND.
    #[arg(long)]
    percentile_kind: Option<PercentileKind>,

    /// Store the ranking snapshot in Postgres (requires DATABASE_URL).
    #[arg(long)]
    persist: bool,

    /// Do everything except writing the report or touching the database.
    #[arg(long)]
    dry_run: bool,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(path) = &self.universe {
            settings.universe_csv = path.clone();
        }
        if let Some(dir) = &self.report_dir {
            settings.report_dir = dir.clone();
        }
        if let Some(n) = self.top_n {
            settings.top_n = n;
        }
        if let Some(c) = self.capital {
            settings.capital = c;
        }
        if let Some(b) = self.sizing_basis {
            settings.sizing_basis = b;
        }
        if let Some(k) = self.percentile_kind {
            settings.percentile_kind = k;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let mut settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();
    args.apply(&mut settings);

    if let Err(err) = run(&settings, &args).await {
        sentry_anyhow::capture_anyhow(&err);
        tracing::error!(error = %format!("{err:#}"), "hqm run failed");
        return Err(err);
    }
    Ok(())
}

async fn run(settings: &Settings, args: &Args) -> anyhow::Result<()> {
    settings.validate().context("invalid configuration")?;

    let as_of_date =
        hqm_core::time::us_market::resolve_as_of_date(args.as_of_date.as_deref(), chrono::Utc::now())?;

    let tickers = universe::load_universe(&settings.universe_csv)?;
    anyhow::ensure!(
        !tickers.is_empty(),
        "universe {} contains no tickers",
        settings.universe_csv.display()
    );
    tracing::info!(%as_of_date, universe = tickers.len(), "starting hqm run");

    if !args.persist || args.dry_run {
        return execute(settings, args, as_of_date, &tickers, None).await;
    }

    let db_url = settings.require_database_url()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context("connect DATABASE_URL failed")?;
    hqm_core::storage::migrate(&pool).await?;

    let acquired = hqm_core::storage::lock::try_acquire_as_of_date_lock(&pool, as_of_date).await?;
    if !acquired {
        tracing::warn!(%as_of_date, "as_of_date lock not acquired; another run in progress");
        return Ok(());
    }

    run_then_release(
        as_of_date,
        execute(settings, args, as_of_date, &tickers, Some(&pool)),
        hqm_core::storage::lock::release_as_of_date_lock(&pool, as_of_date),
    )
    .await
}

/// Awaits `work`, then `release` whatever the outcome. A failed release is logged, not returned.
async fn run_then_release<T>(
    as_of_date: NaiveDate,
    work: impl Future<Output = anyhow::Result<T>>,
    release: impl Future<Output = anyhow::Result<()>>,
) -> anyhow::Result<T> {
    let outcome = work.await;
    if let Err(err) = release.await {
        tracing::warn!(%as_of_date, error = %format!("{err:#}"), "failed to release as_of_date lock");
    }
    outcome
}

async fn execute(
    settings: &Settings,
    args: &Args,
    as_of_date: NaiveDate,
    tickers: &[String],
    pool: Option<&sqlx::PgPool>,
) -> anyhow::Result<()> {
    let source = Arc::new(hqm_core::ingest::yahoo::YahooChartSource::from_settings(settings)?);
    let source_name = source.source_name();
    let opts = PipelineOptions::from_settings(settings);
    let generated_at = chrono::Utc::now();

    let collected = hqm_core::ingest::collect::collect_observations(
        source,
        tickers,
        as_of_date,
        &CollectOptions {
            batch_size: settings.batch_size,
            concurrency: settings.concurrency,
            horizon_days: settings.horizon_days,
        },
    )
    .await;
    let attempted = collected.attempted;

    let outcome = rank_and_report(settings, args, as_of_date, &collected, &opts);

    if let Some(pool) = pool {
        let meta = SnapshotMeta {
            as_of_date,
            generated_at,
            source: source_name,
            options: &opts,
            attempted,
        };
        let persisted = match &outcome {
            Ok(report) => hqm_core::storage::snapshots::persist_success(pool, &meta, report).await,
            Err(err) => {
                hqm_core::storage::snapshots::persist_failure(pool, &meta, &format!("{err:#}"))
                    .await
            }
        };
        match persisted {
            Ok(snapshot_id) => tracing::info!(%as_of_date, %snapshot_id, "persisted hqm snapshot"),
            Err(err) => {
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(%as_of_date, error = %err, "failed to persist hqm snapshot");
            }
        }
    }

    outcome.map(|_| ())
}

fn rank_and_report(
    settings: &Settings,
    args: &Args,
    as_of_date: NaiveDate,
    collected: &CollectionReport,
    opts: &PipelineOptions,
) -> anyhow::Result<HqmReport> {
    tracing::info!(
        attempted = collected.attempted,
        observations = collected.observations.len(),
        dropped_no_price = collected.dropped_no_price,
        failures = collected.failed,
        "price retrieval finished"
    );

    let report = hqm_core::momentum::run_pipeline(&collected.observations, opts)?;
    for exclusion in &report.excluded {
        tracing::info!(ticker = %exclusion.ticker, reason = %exclusion.reason, "ticker excluded");
    }

    if args.dry_run {
        tracing::info!(
            %as_of_date,
            dry_run = true,
            selected = report.rows.len(),
            top = report.rows.first().map(|r| r.ticker.as_str()).unwrap_or(""),
            "hqm run complete (dry-run, no report written)"
        );
        return Ok(report);
    }

    let path = hqm_core::report::save_report(&settings.report_dir, as_of_date, &report.rows)?;
    tracing::info!(%as_of_date, path = %path.display(), selected = report.rows.len(), "saved hqm report");
    Ok(report)
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    #[tokio::test]
    async fn lock_is_released_when_the_run_fails() {
        let released = AtomicBool::new(false);
        let result: anyhow::Result<()> = run_then_release(
            as_of(),
            async { Err::<(), _>(anyhow::anyhow!("price source unavailable")) },
            async {
                released.store(true, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            },
        )
        .await;

        assert!(result.is_err());
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn release_failure_does_not_mask_the_outcome() {
        let result = run_then_release(
            as_of(),
            async { Ok::<_, anyhow::Error>(7) },
            async { Err::<(), _>(anyhow::anyhow!("connection closed")) },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
    }
}
