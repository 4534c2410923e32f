//! Engine configuration
//!
//! YAML-backed settings for the real-time engine:
//!
//! - Worker pool size and maximum block size
//! - Master output stage (gain, soft clip, limiter, DC blocker)
//! - Live input monitoring defaults
//!
//! # Usage
//!
//! ```ignore
//! use strata_core::config::{load_config, EngineConfig};
//!
//! let config: EngineConfig = load_config(&path);
//! orchestrator.apply_config(&config);
//! ```

mod engine;
mod io;

pub use engine::{EngineConfig, MonitorConfig, OutputConfig};
pub use io::{load_config, save_config};
