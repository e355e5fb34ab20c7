use anyhow::Context;
use nwwatch_core::{Error, PingSample, Result};
use sqlx::{Pool, Sqlite, SqliteConnection};
use tracing::instrument;

use crate::models::PingSampleRecord;

/// Insert one ping sample row
pub async fn insert_ping_sample(
    conn: &mut SqliteConnection,
    device_id: i64,
    sample: &PingSample,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO ping_samples (device_id, ts_epoch, ok, rtt_ms, error_message)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(device_id)
    .bind(sample.ts_epoch)
    .bind(sample.ok)
    .bind(sample.rtt_ms)
    .bind(&sample.error_message)
    .execute(&mut *conn)
    .await
    .map_err(|e| Error::DatabaseError(format!("Failed to insert ping sample: {}", e)))?;

    Ok(result.last_insert_rowid())
}

/// Delete a device's samples older than `cutoff_epoch`
pub async fn evict_ping_samples_before(
    conn: &mut SqliteConnection,
    device_id: i64,
    cutoff_epoch: i64,
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM ping_samples WHERE device_id = ? AND ts_epoch < ?")
        .bind(device_id)
        .bind(cutoff_epoch)
        .execute(&mut *conn)
        .await
        .map_err(|e| Error::DatabaseError(format!("Failed to evict ping samples: {}", e)))?;

    Ok(result.rows_affected())
}

/// Ping samples of a device since `since_epoch`, newest first
#[instrument(skip(pool))]
pub async fn get_ping_samples(
    pool: &Pool<Sqlite>,
    device_name: &str,
    since_epoch: i64,
) -> Result<Vec<PingSampleRecord>> {
    sqlx::query_as::<_, PingSampleRecord>(
        r#"
        SELECT p.id, p.device_id, p.ts_epoch, p.ok, p.rtt_ms, p.error_message
        FROM ping_samples p
        JOIN devices d ON p.device_id = d.id
        WHERE d.name = ? AND p.ts_epoch >= ?
        ORDER BY p.ts_epoch DESC, p.id DESC
        "#,
    )
    .bind(device_name)
    .bind(since_epoch)
    .fetch_all(pool)
    .await
    .context("Failed to get ping samples")
    .map_err(|e| Error::DatabaseError(e.to_string()))
}
