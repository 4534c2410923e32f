//! Engine settings
//!
//! Every struct uses `#[serde(default)]` so a partial YAML file only
//! overrides the fields it names.

use serde::{Deserialize, Serialize};

use crate::engine::MAX_WORKERS;
use crate::types::{MAX_BLOCK_SIZE, MAX_LATENCY_SAMPLES};

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads used to render tracks in parallel (0-8, 0 = serial)
    pub workers: usize,
    /// Largest block the device may request; buffers are pre-sized for it
    pub max_block_size: usize,
    /// Longest plugin delay compensation per track path, in samples
    pub max_compensation_samples: usize,
    /// Master output stage
    pub output: OutputConfig,
    /// Live input monitoring defaults applied to new tracks
    pub monitor: MonitorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_block_size: 2048,
            max_compensation_samples: 16384,
            output: OutputConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Worker count clamped to what the dispatcher supports
    pub fn worker_count(&self) -> usize {
        self.workers.min(MAX_WORKERS)
    }

    /// Block size clamped to `1..=MAX_BLOCK_SIZE`
    pub fn block_size(&self) -> usize {
        self.max_block_size.clamp(1, MAX_BLOCK_SIZE)
    }

    /// Compensation line length clamped to `1..=MAX_LATENCY_SAMPLES`
    pub fn compensation_samples(&self) -> usize {
        self.max_compensation_samples.clamp(1, MAX_LATENCY_SAMPLES)
    }
}

/// Master output stage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Master gain in dB
    pub master_gain_db: f32,
    /// Time constant of the master gain dezipper in milliseconds
    pub dezipper_ms: f32,
    /// Enable the oversampled tanh soft clipper
    pub soft_clip: bool,
    /// Soft clip output bound (linear)
    pub soft_clip_bound: f32,
    /// Enable the peak limiter
    pub limiter: bool,
    /// Limiter ceiling in dBFS
    pub limiter_ceiling_db: f32,
    /// Limiter attack time in milliseconds
    pub limiter_attack_ms: f32,
    /// Limiter release time in milliseconds
    pub limiter_release_ms: f32,
    /// Enable the master DC blocker
    pub dc_block: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            master_gain_db: 0.0,
            dezipper_ms: 20.0,
            soft_clip: true,
            soft_clip_bound: 1.0,
            limiter: true,
            limiter_ceiling_db: -0.3,
            limiter_attack_ms: 0.5,
            limiter_release_ms: 80.0,
            dc_block: true,
        }
    }
}

/// Live input monitoring settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// New tracks monitor through the soft-limited, DC-blocked path
    pub safe_by_default: bool,
    /// Input peak above which the safe path is forced (linear)
    pub clip_threshold: f32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            safe_by_default: true,
            clip_threshold: 0.9,
        }
    }
}
