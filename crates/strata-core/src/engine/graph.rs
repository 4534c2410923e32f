//! GraphOrchestrator - one block of the whole track graph
//!
//! Per block:
//!
//! 1. **Fan-out.** Every active track renders into its own scratch slot.
//!    With enough tracks and a large enough block the jobs go through the
//!    [`WorkDispatcher`]; otherwise they run in order on the audio thread.
//! 2. **Reduction.** Single-threaded, in track index order, so the mix is
//!    bit-identical however the jobs were scheduled. Each track's main
//!    and send outputs are delay-compensated to the slowest path in the
//!    graph and summed into the master or one of the aux buses.
//! 3. **Output.** Aux returns are summed into master and the master chain
//!    in [`super::output`] makes the result safe for the device.

use crate::config::{EngineConfig, MonitorConfig};
use crate::track::{OutputTarget, RenderReport, TrackHandle, TrackProcessor};
use crate::types::{
    BlockContext, StereoBuffer, DEFAULT_SAMPLE_RATE, MAX_BLOCK_SIZE, MAX_TRACKS, NUM_AUX_BUSES,
};

use super::dispatcher::WorkDispatcher;
use super::latency::{take_overflow, LatencyCompensator, LatencyPath};
use super::output::{apply_output_limiting, OutputParams, OutputState};

/// Smallest block worth waking the workers for
const PARALLEL_MIN_FRAMES: usize = 256;

/// Fewest active tracks worth waking the workers for
const PARALLEL_MIN_TRACKS: usize = 4;

/// Routing of one track for one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackRouting {
    /// Rendered and mixed this block (false when soloed out)
    pub active: bool,
    pub output: OutputTarget,
    /// Aux bus fed by the send
    pub send_target: usize,
    /// Send is enabled with a non-zero level
    pub send_active: bool,
    /// Send would land on the bus the track already outputs to
    pub feedback_blocked: bool,
    /// Latency of the main path in samples
    pub main_latency: u32,
    /// Latency of the send path in samples
    pub send_latency: u32,
}

impl Default for TrackRouting {
    fn default() -> Self {
        Self {
            active: true,
            output: OutputTarget::Master,
            send_target: 0,
            send_active: false,
            feedback_blocked: false,
            main_latency: 0,
            send_latency: 0,
        }
    }
}

/// Read-only routing for one block
///
/// A plain copy, so nothing the control thread does mid-block can change
/// how the block is mixed.
#[derive(Debug, Clone, PartialEq)]
pub struct MixSnapshot {
    pub tracks: [TrackRouting; MAX_TRACKS],
    /// Number of valid entries in `tracks`
    pub track_count: usize,
    /// Linear gain of each aux bus into master
    pub aux_returns: [f32; NUM_AUX_BUSES],
}

impl MixSnapshot {
    /// Every track active and routed to master, aux returns at unity
    pub fn new(track_count: usize) -> Self {
        Self {
            tracks: [TrackRouting::default(); MAX_TRACKS],
            track_count: track_count.min(MAX_TRACKS),
            aux_returns: [1.0; NUM_AUX_BUSES],
        }
    }

    /// Build the snapshot from the tracks' control atomics
    ///
    /// Any soloed track deactivates every track that is not soloed.
    pub fn capture(tracks: &[TrackProcessor], aux_returns: [f32; NUM_AUX_BUSES]) -> Self {
        let mut snapshot = Self::new(tracks.len());
        snapshot.aux_returns = aux_returns.map(|g| if g.is_finite() { g.max(0.0) } else { 0.0 });

        let tracks = &tracks[..snapshot.track_count];
        let any_solo = tracks.iter().any(|t| t.controls().is_soloed());
        for (routing, track) in snapshot.tracks.iter_mut().zip(tracks) {
            let controls = track.controls();
            let output = controls.output_target();
            let send_target = controls.send_target();
            let latency = controls.latency();
            *routing = TrackRouting {
                active: !any_solo || controls.is_soloed(),
                output,
                send_target,
                send_active: controls.send_enabled() && controls.send_level() > 0.0,
                feedback_blocked: output == OutputTarget::Aux(send_target),
                main_latency: latency,
                send_latency: latency,
            };
        }
        snapshot
    }

    /// Slowest active path in the graph
    pub fn max_latency(&self) -> u32 {
        self.tracks[..self.track_count]
            .iter()
            .filter(|r| r.active)
            .map(|r| {
                if r.send_active {
                    r.main_latency.max(r.send_latency)
                } else {
                    r.main_latency
                }
            })
            .max()
            .unwrap_or(0)
    }
}

/// Orchestrator-owned output slot of one track
#[derive(Debug, Clone, Default)]
pub struct TrackScratch {
    pub main: StereoBuffer,
    pub send: StereoBuffer,
    pub report: RenderReport,
}

impl TrackScratch {
    fn new(max_block: usize) -> Self {
        Self {
            main: StereoBuffer::with_capacity(max_block),
            send: StereoBuffer::with_capacity(max_block),
            report: RenderReport::default(),
        }
    }
}

/// One render job: a track and the scratch slot it writes
#[derive(Clone, Copy)]
struct JobDescriptor {
    track: *mut TrackProcessor,
    scratch: *mut TrackScratch,
}

impl JobDescriptor {
    const EMPTY: Self = Self {
        track: std::ptr::null_mut(),
        scratch: std::ptr::null_mut(),
    };
}

/// Fixed-capacity job list, refilled every block
struct JobTable {
    jobs: [JobDescriptor; MAX_TRACKS],
    len: usize,
}

// SAFETY: every descriptor points at a distinct track and a distinct
// scratch slot, both exclusively borrowed for the duration of the dispatch
// in `run_track_graph`. The dispatcher hands each index to exactly one
// thread, so no two threads ever alias the same pointee.
unsafe impl Sync for JobTable {}
unsafe impl Send for JobTable {}

impl JobTable {
    fn new() -> Self {
        Self {
            jobs: [JobDescriptor::EMPTY; MAX_TRACKS],
            len: 0,
        }
    }

    fn clear(&mut self) {
        self.jobs[..self.len].fill(JobDescriptor::EMPTY);
        self.len = 0;
    }

    fn push(&mut self, track: &mut TrackProcessor, scratch: &mut TrackScratch) {
        if self.len < MAX_TRACKS {
            self.jobs[self.len] = JobDescriptor {
                track: track as *mut _,
                scratch: scratch as *mut _,
            };
            self.len += 1;
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    /// Render job `index` into its scratch slot
    fn run(&self, index: usize, ctx: &BlockContext, live_input: Option<&StereoBuffer>) {
        if index >= self.len {
            return;
        }
        let job = self.jobs[index];
        // SAFETY: see the `Sync` impl; pointers were taken from live `&mut`
        // borrows that outlast the dispatch, and index `index` runs once.
        let (track, scratch) = unsafe { (&mut *job.track, &mut *job.scratch) };
        let TrackScratch { main, send, report } = scratch;
        *report = track.render(ctx, live_input, main, send);
    }
}

/// Runs the track graph and the master chain for each block
pub struct GraphOrchestrator {
    config: EngineConfig,
    dispatcher: WorkDispatcher,
    sample_rate: f64,
    max_block: usize,
    scratch: Vec<TrackScratch>,
    jobs: JobTable,
    compensator: LatencyCompensator,
    master: StereoBuffer,
    aux: [StereoBuffer; NUM_AUX_BUSES],
    output_params: OutputParams,
    output_state: OutputState,
    /// Last block went through the worker pool
    last_parallel: bool,
    /// Compensation lines of this track may hold audio
    lines_live: [bool; MAX_TRACKS],
}

impl GraphOrchestrator {
    /// Create an orchestrator prepared at the default sample rate
    pub fn new(config: &EngineConfig) -> Self {
        let mut orchestrator = Self {
            config: config.clone(),
            dispatcher: WorkDispatcher::new(config.worker_count()),
            sample_rate: DEFAULT_SAMPLE_RATE as f64,
            max_block: config.block_size(),
            scratch: Vec::new(),
            jobs: JobTable::new(),
            compensator: LatencyCompensator::new(config.compensation_samples()),
            master: StereoBuffer::default(),
            aux: Default::default(),
            output_params: OutputParams::default(),
            output_state: OutputState::new(),
            last_parallel: false,
            lines_live: [false; MAX_TRACKS],
        };
        orchestrator.prepare(DEFAULT_SAMPLE_RATE as f64, config.block_size());
        orchestrator
    }

    /// Pre-size every scratch buffer and clear all stateful stages
    ///
    /// Tracks are prepared separately with [`Self::prepare_tracks`].
    pub fn prepare(&mut self, sample_rate: f64, max_block: usize) {
        let max_block = max_block.clamp(1, MAX_BLOCK_SIZE);
        self.sample_rate = sample_rate;
        self.max_block = max_block;

        self.scratch = (0..MAX_TRACKS).map(|_| TrackScratch::new(max_block)).collect();
        self.master = StereoBuffer::with_capacity(max_block);
        self.aux = std::array::from_fn(|_| StereoBuffer::with_capacity(max_block));
        self.jobs.clear();
        self.compensator.clear();
        self.compensator.take_overflow();
        self.lines_live = [false; MAX_TRACKS];

        self.output_params = OutputParams::from_config(&self.config.output, sample_rate);
        self.output_state.reset(&self.output_params);

        log::info!(
            "[GRAPH] Prepared for {} Hz, {} frames max, {} workers",
            sample_rate,
            max_block,
            self.dispatcher.worker_count()
        );
    }

    /// Prepare tracks to match this orchestrator (control thread)
    pub fn prepare_tracks(&self, tracks: &mut [TrackProcessor]) {
        for track in tracks {
            track.prepare(self.sample_rate, self.max_block);
        }
    }

    /// Create a track prepared for the current sample rate and block size
    pub fn create_track(&self) -> (TrackProcessor, TrackHandle) {
        TrackProcessor::new(self.sample_rate, self.max_block, &self.config.monitor)
    }

    /// Apply a new configuration (control thread, audio stopped)
    ///
    /// Rebuilds the worker pool and buffers only when their settings
    /// changed; the master gain glides to its new value.
    pub fn apply_config(&mut self, config: &EngineConfig) {
        if config.worker_count() != self.dispatcher.worker_count() {
            self.dispatcher.set_worker_count(config.worker_count());
        }
        if config.compensation_samples() != self.config.compensation_samples() {
            let overflow = self.compensator.overflow_indicator();
            self.compensator =
                LatencyCompensator::new(config.compensation_samples()).with_overflow(overflow);
        }
        self.compensator.take_overflow();
        let resize = config.block_size() != self.max_block;
        self.config = config.clone();

        if resize {
            self.prepare(self.sample_rate, config.block_size());
        } else {
            self.output_params = OutputParams::from_config(&self.config.output, self.sample_rate);
        }
        log::info!("[GRAPH] Configuration applied: {:?}", self.config);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn monitor_config(&self) -> &MonitorConfig {
        &self.config.monitor
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn max_block(&self) -> usize {
        self.max_block
    }

    pub fn worker_count(&self) -> usize {
        self.dispatcher.worker_count()
    }

    /// Whether the last block was rendered on the worker pool
    pub fn last_block_parallel(&self) -> bool {
        self.last_parallel
    }

    /// Master bus after the last block
    pub fn master(&self) -> &StereoBuffer {
        &self.master
    }

    pub fn aux_bus(&self, bus: usize) -> Option<&StereoBuffer> {
        self.aux.get(bus)
    }

    /// Output slot of track `index` after the last block
    pub fn track_scratch(&self, index: usize) -> Option<&TrackScratch> {
        self.scratch.get(index)
    }

    /// Sticky master fault flag (shared with the UI thread)
    pub fn fault_indicator(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
        self.output_state.fault_indicator()
    }

    pub fn clear_fault(&self) {
        self.output_state.clear_fault();
    }

    /// Largest delay compensation request that had to be clamped (0 = none)
    ///
    /// Written by the audio thread; poll it from the control thread with
    /// [`take_overflow`], which also logs it.
    pub fn compensation_overflow(&self) -> std::sync::Arc<std::sync::atomic::AtomicUsize> {
        self.compensator.overflow_indicator()
    }

    /// Render every active track and mix into master and aux buses
    ///
    /// Leaves the mix in [`Self::master`] and [`Self::aux_bus`] without
    /// aux returns or the master chain applied.
    pub fn run_track_graph(
        &mut self,
        ctx: &BlockContext,
        tracks: &mut [TrackProcessor],
        snapshot: &MixSnapshot,
        live_input: Option<&StereoBuffer>,
    ) {
        let ctx = BlockContext {
            frames: ctx.frames.min(self.max_block),
            ..*ctx
        };
        let frames = ctx.frames;
        let track_count = tracks.len().min(snapshot.track_count).min(MAX_TRACKS);

        self.jobs.clear();
        for (index, track) in tracks[..track_count].iter_mut().enumerate() {
            let scratch = &mut self.scratch[index];
            if snapshot.tracks[index].active {
                self.jobs.push(track, scratch);
                self.lines_live[index] = true;
            } else {
                track.clear_meters();
                scratch.report = RenderReport::default();
                // A track coming back must not replay its old tail
                if std::mem::take(&mut self.lines_live[index]) {
                    self.compensator.clear_track(index);
                }
            }
        }

        let job_count = self.jobs.len();
        let parallel = !ctx.offline
            && !ctx.low_latency
            && frames >= PARALLEL_MIN_FRAMES
            && self.dispatcher.worker_count() >= 1
            && job_count >= PARALLEL_MIN_TRACKS;
        self.last_parallel = parallel;

        let jobs = &self.jobs;
        let job = |index: usize| jobs.run(index, &ctx, live_input);
        if parallel {
            self.dispatcher.run(job_count, &job);
        } else {
            (0..job_count).for_each(job);
        }
        self.jobs.clear();

        self.reduce(frames, track_count, snapshot);
    }

    /// Sum track outputs into the buses in index order
    fn reduce(&mut self, frames: usize, track_count: usize, snapshot: &MixSnapshot) {
        self.master.set_len_from_capacity(frames);
        self.master.fill_silence();
        for bus in &mut self.aux {
            bus.set_len_from_capacity(frames);
            bus.fill_silence();
        }

        let graph_latency = snapshot.max_latency() as usize;
        for (index, routing) in snapshot.tracks[..track_count].iter().enumerate() {
            if !routing.active {
                continue;
            }
            let scratch = &mut self.scratch[index];

            if scratch.report.used_unsafe_monitor {
                scratch.send.fill_silence();
            }

            let main_delay = graph_latency.saturating_sub(routing.main_latency as usize);
            self.compensator
                .process(index, LatencyPath::Main, main_delay, &mut scratch.main);

            if routing.send_active {
                let send_delay = graph_latency.saturating_sub(routing.send_latency as usize);
                self.compensator
                    .process(index, LatencyPath::Send, send_delay, &mut scratch.send);
                if !routing.feedback_blocked {
                    let bus = routing.send_target.min(NUM_AUX_BUSES - 1);
                    self.aux[bus].add_buffer(&scratch.send);
                }
            }

            match routing.output {
                OutputTarget::Master => self.master.add_buffer(&scratch.main),
                OutputTarget::Aux(bus) => self.aux[bus.min(NUM_AUX_BUSES - 1)].add_buffer(&scratch.main),
            }
        }
    }

    /// Render a full block into interleaved stereo `out`
    ///
    /// Runs the graph, sums aux returns into master, applies the master
    /// chain and copies the result. Frames of `out` past the rendered
    /// block are silenced.
    pub fn process_block(
        &mut self,
        ctx: &BlockContext,
        tracks: &mut [TrackProcessor],
        snapshot: &MixSnapshot,
        live_input: Option<&StereoBuffer>,
        out: &mut [f32],
    ) {
        self.run_track_graph(ctx, tracks, snapshot, live_input);

        for (bus, &level) in self.aux.iter().zip(snapshot.aux_returns.iter()) {
            if level != 0.0 {
                self.master.add_scaled(bus, level);
            }
        }

        apply_output_limiting(&mut self.master, &mut self.output_state, &self.output_params);

        let rendered = self.master.as_interleaved();
        let n = rendered.len().min(out.len());
        out[..n].copy_from_slice(&rendered[..n]);
        out[n..].fill(0.0);
    }
}
