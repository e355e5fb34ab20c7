use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Row of the `ping_samples` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PingSampleRecord {
    pub id: i64,
    pub device_id: i64,
    pub ts_epoch: i64,
    pub ok: bool,
    pub rtt_ms: Option<f64>,
    pub error_message: Option<String>,
}
