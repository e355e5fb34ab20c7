use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Row of the `devices` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct DeviceRecord {
    pub id: i64,
    pub name: String,
}

/// Row of the `commands` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CommandRecord {
    pub id: i64,
    pub command_text: String,
}
