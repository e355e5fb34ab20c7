//! Row models for the snapshot schema

pub mod device;
pub mod ping_sample;
pub mod run;

pub use device::{CommandRecord, DeviceRecord};
pub use ping_sample::PingSampleRecord;
pub use run::RunRecord;
