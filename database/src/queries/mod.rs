//! Query modules for the snapshot schema
//!
//! Write helpers take a connection so callers can group them in one
//! transaction; read helpers take a pool.

pub mod devices;
pub mod ping_samples;
pub mod runs;

// Re-export commonly used functions for convenience
pub use devices::*;
pub use ping_samples::*;
pub use runs::*;
