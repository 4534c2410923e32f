//! Render a synthetic session and report per-block timing
//!
//! Usage: graph-bench [TRACKS] [BLOCKS] [--config PATH] [--serial]

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use strata_core::config::{load_config, EngineConfig};
use strata_core::effect::EFFECT_MASK_ALL;
use strata_core::engine::{take_overflow, GraphOrchestrator, MixSnapshot};
use strata_core::plugin::MidiEvent;
use strata_core::track::{OutputTarget, SendMode};
use strata_core::{BlockContext, MAX_TRACKS, NUM_AUX_BUSES};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let serial = args.iter().any(|arg| arg == "--serial");
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .map(|i| args.get(i + 1).map(PathBuf::from))
        .map(|path| path.context("--config needs a path"))
        .transpose()?;
    let positional: Vec<&String> = args
        .iter()
        .enumerate()
        .filter(|(i, arg)| !arg.starts_with("--") && (*i == 0 || args[i - 1] != "--config"))
        .map(|(_, arg)| arg)
        .collect();

    let track_count: usize = match positional.first() {
        Some(arg) => arg.parse().with_context(|| format!("Invalid track count: {arg}"))?,
        None => 16,
    };
    let blocks: usize = match positional.get(1) {
        Some(arg) => arg.parse().with_context(|| format!("Invalid block count: {arg}"))?,
        None => 1000,
    };
    if track_count == 0 || track_count > MAX_TRACKS {
        bail!("Track count must be between 1 and {}", MAX_TRACKS);
    }
    if blocks == 0 {
        bail!("Block count must be at least 1");
    }

    let mut config: EngineConfig = match &config_path {
        Some(path) => load_config(path),
        None => EngineConfig::default(),
    };
    if serial {
        config.workers = 0;
    }

    let mut orchestrator = GraphOrchestrator::new(&config);
    let frames = orchestrator.max_block().min(512);
    let ctx = BlockContext::new(frames, orchestrator.sample_rate());

    let mut tracks = Vec::with_capacity(track_count);
    let mut handles = Vec::with_capacity(track_count);
    for index in 0..track_count {
        let (track, mut handle) = orchestrator.create_track();
        let controls = handle.controls();
        controls.set_volume(0.5);
        controls.set_pan((index as f32 / track_count as f32) * 2.0 - 1.0);
        controls.set_effect_mask(EFFECT_MASK_ALL);
        controls.set_send_enabled(true);
        controls.set_send_level(0.3);
        controls.set_send_mode(SendMode::PostFader);
        controls.set_send_target(index % NUM_AUX_BUSES);
        if index % 4 == 3 {
            controls.set_output_target(OutputTarget::Aux((index + 1) % NUM_AUX_BUSES));
        }
        handle.send_midi(MidiEvent::note_on(0, 48 + (index % 24) as u8, 100));
        tracks.push(track);
        handles.push(handle);
    }

    log::info!(
        "Rendering {} tracks, {} blocks of {} frames, {} workers",
        track_count,
        blocks,
        frames,
        orchestrator.worker_count()
    );

    let mut out = vec![0.0f32; frames * 2];
    let mut timings = Vec::with_capacity(blocks);
    for _ in 0..blocks {
        let snapshot = MixSnapshot::capture(&tracks, [0.5; NUM_AUX_BUSES]);
        let start = Instant::now();
        orchestrator.process_block(&ctx, &mut tracks, &snapshot, None, &mut out);
        timings.push(start.elapsed());
    }

    take_overflow(&orchestrator.compensation_overflow());

    timings.sort_unstable();
    let total: Duration = timings.iter().sum();
    let budget = Duration::from_secs_f64(frames as f64 / ctx.sample_rate);
    let percentile = |p: f64| timings[((timings.len() - 1) as f64 * p) as usize];

    println!("blocks:   {}", blocks);
    println!("budget:   {:?}", budget);
    println!("mean:     {:?}", total / blocks as u32);
    println!("p50:      {:?}", percentile(0.5));
    println!("p99:      {:?}", percentile(0.99));
    println!("max:      {:?}", percentile(1.0));
    println!("overruns: {}", timings.iter().filter(|t| **t > budget).count());
    println!("fault:    {}", orchestrator.fault_indicator().load(Ordering::Relaxed));

    Ok(())
}
