use crate::domain::horizon::Horizon;
use crate::domain::observation::RankedRow;
use crate::momentum::{HqmReport, PipelineOptions};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

/// Run metadata shared by successful and failed snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotMeta<'a> {
    pub as_of_date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub source: &'a str,
    pub options: &'a PipelineOptions,
    pub attempted: usize,
}

pub async fn persist_success(
    pool: &sqlx::PgPool,
    meta: &SnapshotMeta<'_>,
    report: &HqmReport,
) -> anyhow::Result<Uuid> {
    anyhow::ensure!(!report.rows.is_empty(), "snapshot must have at least one row");

    let parameters = serde_json::to_value(meta.options).context("serialize run parameters")?;
    let excluded = serde_json::to_value(&report.excluded).context("serialize exclusions")?;
    let snapshot_id = Uuid::new_v4();

    let mut tx = pool.begin().await.context("begin transaction failed")?;

    sqlx::query(
        "INSERT INTO hqm_snapshots (id, as_of_date, generated_at, source, status, error, parameters, \
         attempted_count, ranked_count, selected_count, excluded) \
         VALUES ($1, $2, $3, $4, 'success', NULL, $5, $6, $7, $8, $9)",
    )
    .persistent(false)
    .bind(snapshot_id)
    .bind(meta.as_of_date)
    .bind(meta.generated_at)
    .bind(meta.source)
    .bind(parameters)
    .bind(count(meta.attempted))
    .bind(count(report.ranked_count))
    .bind(count(report.rows.len()))
    .bind(excluded)
    .execute(&mut *tx)
    .await
    .context("insert hqm_snapshots failed")?;

    for (idx, row) in report.rows.iter().enumerate() {
        insert_row(&mut tx, snapshot_id, count(idx + 1), row).await?;
    }

    tx.commit().await.context("commit transaction failed")?;
    Ok(snapshot_id)
}

pub async fn persist_failure(
    pool: &sqlx::PgPool,
    meta: &SnapshotMeta<'_>,
    error: &str,
) -> anyhow::Result<Uuid> {
    let parameters = serde_json::to_value(meta.options).context("serialize run parameters")?;
    let snapshot_id = Uuid::new_v4();

    sqlx::query(
        "INSERT INTO hqm_snapshots (id, as_of_date, generated_at, source, status, error, parameters, attempted_count) \
         VALUES ($1, $2, $3, $4, 'error', $5, $6, $7)",
    )
    .persistent(false)
    .bind(snapshot_id)
    .bind(meta.as_of_date)
    .bind(meta.generated_at)
    .bind(meta.source)
    .bind(error)
    .bind(parameters)
    .bind(count(meta.attempted))
    .execute(pool)
    .await
    .context("insert error hqm_snapshots failed")?;

    Ok(snapshot_id)
}

async fn insert_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    snapshot_id: Uuid,
    rank: i32,
    row: &RankedRow,
) -> anyhow::Result<()> {
    let shares = i64::try_from(row.shares_to_buy).unwrap_or(i64::MAX);
    let dates = &row.provenance.reference_dates;

    sqlx::query(
        "INSERT INTO hqm_snapshot_rows (snapshot_id, rank, ticker, price, shares_to_buy, \
         return_1y, percentile_1y, return_6m, percentile_6m, return_3m, percentile_3m, \
         return_1m, percentile_1m, composite_score, observed_at, \
         reference_date_1y, reference_date_6m, reference_date_3m, reference_date_1m) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)",
    )
    .persistent(false)
    .bind(snapshot_id)
    .bind(rank)
    .bind(&row.ticker)
    .bind(row.price)
    .bind(shares)
    .bind(row.filled_returns[Horizon::OneYear])
    .bind(row.percentiles[Horizon::OneYear])
    .bind(row.filled_returns[Horizon::SixMonth])
    .bind(row.percentiles[Horizon::SixMonth])
    .bind(row.filled_returns[Horizon::ThreeMonth])
    .bind(row.percentiles[Horizon::ThreeMonth])
    .bind(row.filled_returns[Horizon::OneMonth])
    .bind(row.percentiles[Horizon::OneMonth])
    .bind(row.composite_score)
    .bind(row.provenance.observed_at)
    .bind(dates[Horizon::OneYear])
    .bind(dates[Horizon::SixMonth])
    .bind(dates[Horizon::ThreeMonth])
    .bind(dates[Horizon::OneMonth])
    .execute(&mut **tx)
    .await
    .with_context(|| format!("insert hqm_snapshot_rows failed for {}", row.ticker))?;

    Ok(())
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
