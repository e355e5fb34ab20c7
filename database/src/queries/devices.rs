use anyhow::Context;
use nwwatch_core::{Error, Result};
use sqlx::{Pool, Sqlite, SqliteConnection};
use tracing::instrument;

use crate::models::{CommandRecord, DeviceRecord};

/// Get or create a device, returning its id
pub async fn get_or_create_device(conn: &mut SqliteConnection, name: &str) -> Result<i64> {
    sqlx::query("INSERT INTO devices (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
        .bind(name)
        .execute(&mut *conn)
        .await
        .map_err(|e| Error::DatabaseError(format!("Failed to create device: {}", e)))?;

    sqlx::query_scalar::<_, i64>("SELECT id FROM devices WHERE name = ?")
        .bind(name)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| Error::DatabaseError(format!("Failed to get device id: {}", e)))
}

/// Get or create a command, returning its id
pub async fn get_or_create_command(conn: &mut SqliteConnection, command_text: &str) -> Result<i64> {
    sqlx::query("INSERT INTO commands (command_text) VALUES (?) ON CONFLICT(command_text) DO NOTHING")
        .bind(command_text)
        .execute(&mut *conn)
        .await
        .map_err(|e| Error::DatabaseError(format!("Failed to create command: {}", e)))?;

    sqlx::query_scalar::<_, i64>("SELECT id FROM commands WHERE command_text = ?")
        .bind(command_text)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| Error::DatabaseError(format!("Failed to get command id: {}", e)))
}

/// List all devices ordered by name
#[instrument(skip(pool))]
pub async fn list_devices(pool: &Pool<Sqlite>) -> Result<Vec<DeviceRecord>> {
    sqlx::query_as::<_, DeviceRecord>("SELECT id, name FROM devices ORDER BY name")
        .fetch_all(pool)
        .await
        .context("Failed to list devices")
        .map_err(|e| Error::DatabaseError(e.to_string()))
}

/// List all commands ordered by text
#[instrument(skip(pool))]
pub async fn list_commands(pool: &Pool<Sqlite>) -> Result<Vec<CommandRecord>> {
    sqlx::query_as::<_, CommandRecord>(
        "SELECT id, command_text FROM commands ORDER BY command_text",
    )
    .fetch_all(pool)
    .await
    .context("Failed to list commands")
    .map_err(|e| Error::DatabaseError(e.to_string()))
}
