use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Row of the `runs` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RunRecord {
    pub id: i64,
    pub device_id: i64,
    pub command_id: i64,
    pub ts_epoch: i64,
    pub output_text: Option<String>,
    pub ok: bool,
    pub error_message: Option<String>,
    pub duration_ms: Option<f64>,
    pub is_filtered: bool,
    pub is_truncated: bool,
    pub original_line_count: Option<i64>,
}

impl RunRecord {
    /// Output text, empty for failed runs
    pub fn output(&self) -> &str {
        self.output_text.as_deref().unwrap_or_default()
    }
}
