use anyhow::Context;
use nwwatch_core::{Error, Result, Run};
use sqlx::{Pool, Sqlite, SqliteConnection};
use tracing::instrument;

use crate::models::RunRecord;

/// Insert one run row
pub async fn insert_run(
    conn: &mut SqliteConnection,
    device_id: i64,
    command_id: i64,
    run: &Run,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO runs (device_id, command_id, ts_epoch, output_text, ok,
                          error_message, duration_ms, is_filtered, is_truncated,
                          original_line_count)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(device_id)
    .bind(command_id)
    .bind(run.ts_epoch)
    .bind(&run.output_text)
    .bind(run.ok)
    .bind(&run.error_message)
    .bind(run.duration_ms)
    .bind(run.is_filtered)
    .bind(run.is_truncated)
    .bind(run.original_line_count)
    .execute(&mut *conn)
    .await
    .map_err(|e| Error::DatabaseError(format!("Failed to insert run: {}", e)))?;

    Ok(result.last_insert_rowid())
}

/// Delete all but the `keep` most recent runs of a (device, command) pair
pub async fn evict_old_runs(
    conn: &mut SqliteConnection,
    device_id: i64,
    command_id: i64,
    keep: i64,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM runs
        WHERE device_id = ? AND command_id = ?
        AND id NOT IN (
            SELECT id FROM runs
            WHERE device_id = ? AND command_id = ?
            ORDER BY ts_epoch DESC, id DESC
            LIMIT ?
        )
        "#,
    )
    .bind(device_id)
    .bind(command_id)
    .bind(device_id)
    .bind(command_id)
    .bind(keep)
    .execute(&mut *conn)
    .await
    .map_err(|e| Error::DatabaseError(format!("Failed to evict old runs: {}", e)))?;

    Ok(result.rows_affected())
}

/// Latest runs for a device/command pair, newest first
///
/// Runs flagged as filtered are skipped unless `include_filtered` is set.
#[instrument(skip(pool))]
pub async fn get_latest_runs(
    pool: &Pool<Sqlite>,
    device_name: &str,
    command_text: &str,
    limit: i64,
    include_filtered: bool,
) -> Result<Vec<RunRecord>> {
    sqlx::query_as::<_, RunRecord>(
        r#"
        SELECT r.id, r.device_id, r.command_id, r.ts_epoch, r.output_text, r.ok,
               r.error_message, r.duration_ms, r.is_filtered, r.is_truncated,
               r.original_line_count
        FROM runs r
        JOIN devices d ON r.device_id = d.id
        JOIN commands c ON r.command_id = c.id
        WHERE d.name = ? AND c.command_text = ?
        AND (? OR r.is_filtered = 0)
        ORDER BY r.ts_epoch DESC, r.id DESC
        LIMIT ?
        "#,
    )
    .bind(device_name)
    .bind(command_text)
    .bind(include_filtered)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to get latest runs")
    .map_err(|e| Error::DatabaseError(e.to_string()))
}

/// Total number of stored runs
#[instrument(skip(pool))]
pub async fn count_runs(pool: &Pool<Sqlite>) -> Result<i64> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM runs")
        .fetch_one(pool)
        .await
        .context("Failed to count runs")
        .map_err(|e| Error::DatabaseError(e.to_string()))
}
