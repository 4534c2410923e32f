//! Strata Core - real-time multi-track audio engine
//!
//! Tracks render in parallel on a small worker pool, are mixed with plugin
//! delay compensation into a master bus and four aux buses, and leave
//! through a master chain that never lets a non-finite or runaway sample
//! reach the device.

pub mod config;
pub mod effect;
pub mod engine;
pub mod plugin;
pub mod track;
pub mod types;

pub use types::*;
