//! Audio engine - worker pool, track graph, latency compensation, master output
//!
//! This module ties the per-track processors into one block render:
//! - WorkDispatcher: fixed worker pool that fans per-track jobs out
//! - GraphOrchestrator: renders every track and mixes into master and aux buses
//! - Plugin delay compensation across all track paths
//! - Master output chain that keeps the device signal safe

mod dispatcher;
mod graph;
mod latency;
mod output;

pub use dispatcher::*;
pub use graph::*;
pub use latency::*;
pub use output::*;
