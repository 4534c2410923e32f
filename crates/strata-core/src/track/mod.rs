//! Track processing
//!
//! A track is split across threads:
//!
//! - [`TrackProcessor`] is owned by the audio thread. It holds everything
//!   that only the render path touches (ramps, meters, last-good cache,
//!   MIDI consumer) and renders one block per call.
//! - [`TrackHandle`] is owned by the control thread. It loads and unloads
//!   plugins, swaps samples and edits effect parameters.
//! - [`TrackControls`] are plain atomics shared by both.
//!
//! The two halves meet at the [`TrackEngine`] mutex. The control thread
//! locks it briefly to swap validated state in; the audio thread only
//! ever `try_lock`s it and replays the last good block when it cannot get
//! in, so a slow control operation costs at most a repeated block.

mod controls;
mod engine;
mod meter;
mod monitor;

pub use controls::{AtomicF32, MeterReading, MonitorTap, OutputTarget, SendMode, TrackControls};
pub use engine::TrackEngine;

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use crate::config::MonitorConfig;
use crate::effect::EffectBank;
use crate::plugin::midi::MAX_BLOCK_EVENTS;
use crate::plugin::{
    load_plugin, midi_channel, Fault, HostedPlugin, MidiEvent, MidiReceiver, MidiSender,
    PluginDescription, PluginLoadError, PluginLoadResult,
};
use crate::types::{BlockContext, StereoBuffer, MAX_INSERT_SLOTS};

use engine::ChainInputs;
use meter::MeterState;
use monitor::LiveMonitor;

/// `try_lock` attempts before a block is replayed
const TRY_LOCK_ATTEMPTS: usize = 3;

/// Fade-in after `prepare`
const STARTUP_RAMP_MS: f64 = 20.0;

/// How a render call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderOutcome {
    /// Full render
    #[default]
    Rendered,
    /// Engine locked by the control thread; last good block replayed
    Contended,
    /// Block larger than the prepared buffers; last good block replayed
    CapacityMismatch,
    /// A source or effect stage failed; last good block replayed
    Faulted(Fault),
    /// Track is frozen; silence
    Frozen,
    /// Track is muted; silence, meters zeroed
    Muted,
}

/// Result of [`TrackProcessor::render`], read by the reduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderReport {
    pub outcome: RenderOutcome,
    /// Live input reached the output without the safe path
    pub used_unsafe_monitor: bool,
}

impl RenderReport {
    /// Output is a copy of an earlier block
    pub fn replayed(&self) -> bool {
        matches!(
            self.outcome,
            RenderOutcome::Contended | RenderOutcome::CapacityMismatch | RenderOutcome::Faulted(_)
        )
    }
}

/// Audio-thread half of a track
pub struct TrackProcessor {
    controls: Arc<TrackControls>,
    engine: Arc<Mutex<TrackEngine>>,
    midi_rx: MidiReceiver,
    /// Events drained from the queue, waiting for the next successful render
    midi_events: Vec<MidiEvent>,
    timeline: StereoBuffer,
    timeline_queued: bool,
    monitor: LiveMonitor,
    monitor_buf: StereoBuffer,
    clip_threshold: f32,
    last_main: StereoBuffer,
    last_send: StereoBuffer,
    last_unsafe: bool,
    meter: MeterState,
    prev_volume: f32,
    prev_pan: (f32, f32),
    prev_send: f32,
    ramp_len: usize,
    ramp_remaining: usize,
    max_block: usize,
}

impl TrackProcessor {
    /// Create a track prepared for `sample_rate` and `max_block`
    pub fn new(
        sample_rate: f64,
        max_block: usize,
        monitor: &MonitorConfig,
    ) -> (TrackProcessor, TrackHandle) {
        let controls = Arc::new(TrackControls::new());
        controls.set_safe_monitoring(monitor.safe_by_default);
        let engine = Arc::new(Mutex::new(TrackEngine::new(sample_rate, max_block)));
        let (midi_tx, midi_rx) = midi_channel();

        let mut processor = TrackProcessor {
            controls: Arc::clone(&controls),
            engine: Arc::clone(&engine),
            midi_rx,
            midi_events: Vec::with_capacity(MAX_BLOCK_EVENTS),
            timeline: StereoBuffer::default(),
            timeline_queued: false,
            monitor: LiveMonitor::default(),
            monitor_buf: StereoBuffer::default(),
            clip_threshold: monitor.clip_threshold,
            last_main: StereoBuffer::default(),
            last_send: StereoBuffer::default(),
            last_unsafe: false,
            meter: MeterState::new(sample_rate as f32),
            prev_volume: 0.0,
            prev_pan: (0.0, 0.0),
            prev_send: 0.0,
            ramp_len: 1,
            ramp_remaining: 0,
            max_block,
        };
        processor.prepare(sample_rate, max_block);

        let handle = TrackHandle {
            controls,
            engine,
            midi_tx,
        };
        (processor, handle)
    }

    pub fn controls(&self) -> &Arc<TrackControls> {
        &self.controls
    }

    /// Reallocate every buffer and re-prepare the engine (control thread)
    ///
    /// Must not run concurrently with `render`; it takes the engine lock
    /// with a blocking `lock`.
    pub fn prepare(&mut self, sample_rate: f64, max_block: usize) {
        self.max_block = max_block;
        for buffer in [
            &mut self.timeline,
            &mut self.monitor_buf,
            &mut self.last_main,
            &mut self.last_send,
        ] {
            *buffer = StereoBuffer::with_capacity(max_block);
        }
        self.timeline_queued = false;
        self.last_unsafe = false;
        self.midi_events.clear();

        {
            let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
            engine.prepare(sample_rate, max_block);
            self.controls.set_latency(engine.latency_samples());
        }

        self.monitor.reset();
        self.meter.prepare(sample_rate as f32);
        self.ramp_len = ((sample_rate * STARTUP_RAMP_MS / 1000.0) as usize).max(1);
        self.ramp_remaining = self.ramp_len;

        self.prev_volume = self.controls.volume();
        self.prev_pan = pan_gains(self.controls.pan());
        self.prev_send = self.controls.send_level();
    }

    /// Queue arranged audio for the next render (copied, never allocates)
    pub fn queue_timeline(&mut self, audio: &StereoBuffer) {
        let frames = audio.len().min(self.max_block);
        self.timeline.set_len_from_capacity(frames);
        self.timeline.replay_from(audio);
        self.timeline_queued = true;
    }

    /// Zero the meters of a track that is not rendered this block
    pub fn clear_meters(&mut self) {
        self.meter.clear(&self.controls);
    }

    /// Render one block into `main_out` and `send_out`
    ///
    /// Both buffers are resized to `ctx.frames` and must have been
    /// allocated with at least that capacity. Never blocks: if the engine
    /// is busy, the block is too large, or a stage faults, the previous
    /// good block is replayed instead.
    pub fn render(
        &mut self,
        ctx: &BlockContext,
        live_input: Option<&StereoBuffer>,
        main_out: &mut StereoBuffer,
        send_out: &mut StereoBuffer,
    ) -> RenderReport {
        let frames = ctx.frames;
        main_out.set_len_from_capacity(frames);
        send_out.set_len_from_capacity(frames);
        self.drain_midi();

        let shared = Arc::clone(&self.engine);
        let Some(mut engine) = try_lock_bounded(&shared) else {
            log::trace!("[TRACK] Engine busy, replaying last block");
            return self.replay(main_out, send_out, RenderOutcome::Contended);
        };

        if self.controls.is_frozen() {
            self.midi_events.clear();
            self.timeline_queued = false;
            main_out.fill_silence();
            send_out.fill_silence();
            self.meter.clear(&self.controls);
            return RenderReport {
                outcome: RenderOutcome::Frozen,
                used_unsafe_monitor: false,
            };
        }

        if frames > self.max_block
            || !engine.fits(frames)
            || (ctx.sample_rate - engine.sample_rate()).abs() > 0.5
        {
            log::trace!("[TRACK] Block of {} frames does not fit prepared buffers", frames);
            self.midi_events.clear();
            return self.replay(main_out, send_out, RenderOutcome::CapacityMismatch);
        }

        let tap = self.controls.monitor_tap();
        let mut used_unsafe = false;
        let monitored = match live_input {
            Some(input) if self.controls.is_monitoring() => {
                let safe = self.monitor.condition(
                    input,
                    frames,
                    self.controls.safe_monitoring(),
                    self.clip_threshold,
                    &mut self.monitor_buf,
                );
                used_unsafe = !safe;
                true
            }
            _ => false,
        };

        let inputs = ChainInputs {
            timeline: self.timeline_queued.then_some(&self.timeline),
            monitor_pre: (monitored && tap == MonitorTap::Processed).then_some(&self.monitor_buf),
            monitor_post: (monitored && tap == MonitorTap::PostInsert)
                .then_some(&self.monitor_buf),
            effect_mask: self.controls.effect_mask(),
        };
        let midi = &self.midi_events[..];
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            engine.render_chain(frames, midi, &inputs)
        }))
        .unwrap_or(Err(Fault::Panicked));

        self.midi_events.clear();
        let channels = match result {
            Ok(channels) => channels,
            Err(fault) => {
                log::trace!("[TRACK] Render fault ({}), replaying last block", fault);
                return self.replay(main_out, send_out, RenderOutcome::Faulted(fault));
            }
        };
        self.timeline_queued = false;

        let eq_gains = self
            .controls
            .eq_enabled()
            .then(|| self.controls.eq_gains_db());
        engine.finish(frames, channels, eq_gains, main_out);
        self.controls.set_latency(engine.latency_samples());
        drop(engine);

        if monitored && tap == MonitorTap::Dry {
            main_out.add_buffer(&self.monitor_buf);
        }

        self.apply_startup_ramp(main_out);

        if self.controls.is_muted() {
            return self.silence_muted(main_out, send_out);
        }

        let send_enabled = self.controls.send_enabled();
        let send_mode = self.controls.send_mode();
        if send_enabled && send_mode == SendMode::PreFader {
            send_out.copy_from(main_out);
        }

        let volume = self.controls.volume();
        ramp_gain(main_out, self.prev_volume, volume);
        self.prev_volume = volume;
        if send_enabled && send_mode == SendMode::PostFader {
            send_out.copy_from(main_out);
        }

        let pan = pan_gains(self.controls.pan());
        ramp_pan(main_out, self.prev_pan, pan);
        self.prev_pan = pan;
        if send_enabled && send_mode == SendMode::PostPan {
            send_out.copy_from(main_out);
        }

        if send_enabled {
            let level = self.controls.send_level();
            ramp_gain(send_out, self.prev_send, level);
            self.prev_send = level;
        } else {
            send_out.fill_silence();
            self.prev_send = 0.0;
        }

        self.meter.update(main_out, &self.controls);
        self.store_last_good(main_out, send_out, used_unsafe);

        RenderReport {
            outcome: RenderOutcome::Rendered,
            used_unsafe_monitor: used_unsafe,
        }
    }

    fn drain_midi(&mut self) {
        while self.midi_events.len() < MAX_BLOCK_EVENTS {
            match self.midi_rx.pop() {
                Ok(event) => self.midi_events.push(event),
                Err(_) => break,
            }
        }
    }

    fn replay(
        &mut self,
        main_out: &mut StereoBuffer,
        send_out: &mut StereoBuffer,
        outcome: RenderOutcome,
    ) -> RenderReport {
        self.timeline_queued = false;
        if self.controls.is_muted() {
            return self.silence_muted(main_out, send_out);
        }
        main_out.replay_from(&self.last_main);
        send_out.replay_from(&self.last_send);
        RenderReport {
            outcome,
            used_unsafe_monitor: self.last_unsafe,
        }
    }

    /// Muted output is silence on every path, including replays
    fn silence_muted(
        &mut self,
        main_out: &mut StereoBuffer,
        send_out: &mut StereoBuffer,
    ) -> RenderReport {
        main_out.fill_silence();
        send_out.fill_silence();
        self.meter.clear(&self.controls);
        // Unmuting fades back in from silence
        self.prev_volume = 0.0;
        self.prev_send = 0.0;
        self.last_main.fill_silence();
        self.last_send.fill_silence();
        self.last_unsafe = false;
        RenderReport {
            outcome: RenderOutcome::Muted,
            used_unsafe_monitor: false,
        }
    }

    fn store_last_good(&mut self, main: &StereoBuffer, send: &StereoBuffer, used_unsafe: bool) {
        self.last_main.copy_from(main);
        self.last_send.copy_from(send);
        self.last_unsafe = used_unsafe;
    }

    fn apply_startup_ramp(&mut self, buffer: &mut StereoBuffer) {
        let len = self.ramp_len as f32;
        for s in buffer.iter_mut() {
            if self.ramp_remaining == 0 {
                break;
            }
            *s *= 1.0 - self.ramp_remaining as f32 / len;
            self.ramp_remaining -= 1;
        }
    }
}

/// Constant-power pan law: -1 hard left, 0 centre (-3 dB each side), 1 hard right
#[inline]
fn pan_gains(pan: f32) -> (f32, f32) {
    let angle = (pan.clamp(-1.0, 1.0) + 1.0) * std::f32::consts::FRAC_PI_4;
    (angle.cos(), angle.sin())
}

/// Scale by a gain ramping linearly from `from` to `to` across the buffer
fn ramp_gain(buffer: &mut StereoBuffer, from: f32, to: f32) {
    let n = buffer.len().max(1) as f32;
    if from == to {
        buffer.scale(to);
        return;
    }
    for (i, s) in buffer.iter_mut().enumerate() {
        *s *= from + (to - from) * (i + 1) as f32 / n;
    }
}

fn ramp_pan(buffer: &mut StereoBuffer, from: (f32, f32), to: (f32, f32)) {
    let n = buffer.len().max(1) as f32;
    for (i, s) in buffer.iter_mut().enumerate() {
        let t = (i + 1) as f32 / n;
        s.left *= from.0 + (to.0 - from.0) * t;
        s.right *= from.1 + (to.1 - from.1) * t;
    }
}

fn try_lock_bounded(engine: &Mutex<TrackEngine>) -> Option<MutexGuard<'_, TrackEngine>> {
    for _ in 0..TRY_LOCK_ATTEMPTS {
        match engine.try_lock() {
            Ok(guard) => return Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => std::hint::spin_loop(),
        }
    }
    None
}

/// Control-thread half of a track
///
/// Plugin loads validate on the calling thread first and take the engine
/// lock only to swap the finished instance in.
pub struct TrackHandle {
    controls: Arc<TrackControls>,
    engine: Arc<Mutex<TrackEngine>>,
    midi_tx: MidiSender,
}

impl TrackHandle {
    pub fn controls(&self) -> &Arc<TrackControls> {
        &self.controls
    }

    /// Queue a MIDI event for the next block; false if the queue is full
    pub fn send_midi(&mut self, event: MidiEvent) -> bool {
        self.midi_tx.push(event).is_ok()
    }

    /// Lock the engine (blocks; the audio thread replays while held)
    pub fn lock_engine(&self) -> MutexGuard<'_, TrackEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate `plugin` and install it in insert slot `index`
    ///
    /// Returns the instance it replaced. On error the slot is untouched.
    pub fn load_insert(
        &self,
        index: usize,
        plugin: Box<dyn HostedPlugin>,
        description: PluginDescription,
        state: Option<&[u8]>,
    ) -> PluginLoadResult<Option<Box<dyn HostedPlugin>>> {
        if index >= MAX_INSERT_SLOTS {
            return Err(PluginLoadError::SlotOutOfRange {
                index,
                max: MAX_INSERT_SLOTS,
            });
        }
        if description.is_instrument {
            return Err(PluginLoadError::KindMismatch {
                plugin: description.name,
                expected: "an insert effect",
            });
        }

        let prepared = self.validate(plugin, description, state)?;
        Ok(self.lock_engine().install_insert(index, prepared))
    }

    /// Validate `plugin` and install it as the track instrument
    pub fn load_instrument(
        &self,
        plugin: Box<dyn HostedPlugin>,
        description: PluginDescription,
        state: Option<&[u8]>,
    ) -> PluginLoadResult<Option<Box<dyn HostedPlugin>>> {
        if !description.is_instrument {
            return Err(PluginLoadError::KindMismatch {
                plugin: description.name,
                expected: "an instrument",
            });
        }

        let prepared = self.validate(plugin, description, state)?;
        Ok(self.lock_engine().install_instrument(prepared))
    }

    fn validate(
        &self,
        plugin: Box<dyn HostedPlugin>,
        description: PluginDescription,
        state: Option<&[u8]>,
    ) -> PluginLoadResult<crate::plugin::PreparedPlugin> {
        let (sample_rate, max_block) = {
            let engine = self.lock_engine();
            (engine.sample_rate(), engine.max_block())
        };
        load_plugin(plugin, description, state, sample_rate, max_block).map_err(|e| {
            log::warn!("[TRACK] Plugin load rejected: {}", e);
            e
        })
    }

    /// Remove the plugin in insert slot `index`
    pub fn unload_insert(&self, index: usize) -> Option<Box<dyn HostedPlugin>> {
        if index >= MAX_INSERT_SLOTS {
            return None;
        }
        self.lock_engine().take_insert(index)
    }

    /// Remove the hosted instrument; the built-in sources take over
    pub fn unload_instrument(&self) -> Option<Box<dyn HostedPlugin>> {
        self.lock_engine().take_instrument()
    }

    /// Bypass or re-enable an insert; false if `index` is out of range
    pub fn set_insert_bypass(&self, index: usize, bypass: bool) -> bool {
        match self.lock_engine().inserts.get_mut(index) {
            Some(slot) => {
                slot.set_bypass(bypass);
                true
            }
            None => false,
        }
    }

    pub fn set_instrument_bypass(&self, bypass: bool) {
        self.lock_engine().instrument.set_bypass(bypass);
    }

    /// Load a sample into the built-in sampler, returning the previous one
    ///
    /// An empty buffer clears the sampler.
    pub fn load_sample(
        &self,
        sample: StereoBuffer,
        source_rate: f64,
        root_note: u8,
    ) -> Option<StereoBuffer> {
        self.lock_engine()
            .sampler
            .load_sample(sample, source_rate, root_note)
    }

    /// Edit the built-in effect bank under the engine lock
    pub fn with_effects<R>(&self, edit: impl FnOnce(&mut EffectBank) -> R) -> R {
        edit(&mut self.lock_engine().effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::test_plugins::{Behavior, ScriptedPlugin};
    use crate::plugin::{ChannelLayout, PreparedPlugin};
    use crate::types::StereoSample;

    const FRAMES: usize = 512;

    fn new_track() -> (TrackProcessor, TrackHandle) {
        TrackProcessor::new(48000.0, FRAMES, &MonitorConfig::default())
    }

    fn buffers() -> (StereoBuffer, StereoBuffer) {
        (
            StereoBuffer::with_capacity(FRAMES),
            StereoBuffer::with_capacity(FRAMES),
        )
    }

    fn constant(value: f32) -> StereoBuffer {
        StereoBuffer::from_vec(vec![StereoSample::mono(value); FRAMES])
    }

    fn render(
        track: &mut TrackProcessor,
        main: &mut StereoBuffer,
        send: &mut StereoBuffer,
    ) -> RenderReport {
        track.render(&BlockContext::new(FRAMES, 48000.0), None, main, send)
    }

    /// Render with constant timeline audio until ramps have settled
    fn settle(track: &mut TrackProcessor, main: &mut StereoBuffer, send: &mut StereoBuffer) {
        for _ in 0..3 {
            track.queue_timeline(&constant(0.5));
            render(track, main, send);
        }
    }

    #[test]
    fn test_startup_ramp_fades_in() {
        let (mut track, handle) = new_track();
        handle.controls().set_pan(0.0);
        let (mut main, mut send) = buffers();
        track.queue_timeline(&constant(0.5));
        render(&mut track, &mut main, &mut send);

        assert_eq!(main[0], StereoSample::silence());
        assert!(main[FRAMES - 1].left > main[1].left);
    }

    #[test]
    fn test_contention_replays_last_block() {
        let (mut track, mut handle) = new_track();
        let (mut main, mut send) = buffers();
        handle.controls().set_send_enabled(true);
        handle.controls().set_send_level(0.5);

        settle(&mut track, &mut main, &mut send);
        handle.send_midi(MidiEvent::note_on(0, 64, 100));
        track.queue_timeline(&constant(0.5));
        assert_eq!(render(&mut track, &mut main, &mut send).outcome, RenderOutcome::Rendered);
        let expected_main = main.clone();
        let expected_send = send.clone();

        let _guard = handle.lock_engine();
        main.fill_silence();
        send.fill_silence();
        let report = render(&mut track, &mut main, &mut send);
        assert_eq!(report.outcome, RenderOutcome::Contended);
        assert!(report.replayed());
        assert_eq!(main, expected_main);
        assert_eq!(send, expected_send);
    }

    #[test]
    fn test_mute_zeroes_output_and_meters() {
        let (mut track, handle) = new_track();
        let (mut main, mut send) = buffers();
        handle.controls().set_send_enabled(true);
        handle.controls().set_send_level(1.0);
        settle(&mut track, &mut main, &mut send);
        assert!(handle.controls().meters().peak_l > 0.0);

        handle.controls().set_mute(true);
        track.queue_timeline(&constant(0.5));
        let report = render(&mut track, &mut main, &mut send);
        assert_eq!(report.outcome, RenderOutcome::Muted);
        assert!(main.iter().all(|s| *s == StereoSample::silence()));
        assert!(send.iter().all(|s| *s == StereoSample::silence()));
        assert_eq!(handle.controls().meters(), MeterReading::default());
    }

    #[test]
    fn test_mute_wins_over_replay() {
        let (mut track, handle) = new_track();
        let (mut main, mut send) = buffers();
        handle.controls().set_send_enabled(true);
        handle.controls().set_send_level(1.0);
        settle(&mut track, &mut main, &mut send);
        assert!(main.peak() > 0.0);

        handle.controls().set_mute(true);
        {
            let _guard = handle.lock_engine();
            let report = render(&mut track, &mut main, &mut send);
            assert_eq!(report.outcome, RenderOutcome::Muted);
            assert_eq!(main.peak(), 0.0);
            assert_eq!(send.peak(), 0.0);
            assert_eq!(handle.controls().meters(), MeterReading::default());
        }

        // A block too large for the prepared buffers is silent as well
        let mut big_main = StereoBuffer::with_capacity(FRAMES * 2);
        let mut big_send = StereoBuffer::with_capacity(FRAMES * 2);
        let ctx = BlockContext::new(FRAMES * 2, 48000.0);
        let report = track.render(&ctx, None, &mut big_main, &mut big_send);
        assert_eq!(report.outcome, RenderOutcome::Muted);
        assert_eq!(big_main.peak(), 0.0);

        // Once unmuted, a contended block replays silence, not the old audio
        handle.controls().set_mute(false);
        let _guard = handle.lock_engine();
        let report = render(&mut track, &mut main, &mut send);
        assert_eq!(report.outcome, RenderOutcome::Contended);
        assert_eq!(main.peak(), 0.0);
    }

    #[test]
    fn test_send_taps_during_volume_ramp() {
        let taps = [SendMode::PreFader, SendMode::PostFader, SendMode::PostPan];
        let mid = FRAMES / 2;
        let mut results = Vec::new();
        for mode in taps {
            let (mut track, handle) = new_track();
            let controls = handle.controls();
            controls.set_pan(0.0);
            controls.set_send_enabled(true);
            controls.set_send_level(1.0);
            controls.set_send_mode(mode);

            let (mut main, mut send) = buffers();
            settle(&mut track, &mut main, &mut send);
            controls.set_volume(0.2);
            track.queue_timeline(&constant(0.5));
            render(&mut track, &mut main, &mut send);
            results.push(send[mid]);
        }

        let ramped = 0.5 * (1.0 - 0.8 * (mid + 1) as f32 / FRAMES as f32);
        let panned = ramped * std::f32::consts::FRAC_1_SQRT_2;
        let [pre, post_fader, post_pan] = [results[0], results[1], results[2]];
        assert!((pre.left - 0.5).abs() < 1e-5 && (pre.right - 0.5).abs() < 1e-5);
        assert!((post_fader.left - ramped).abs() < 1e-5);
        assert!((post_fader.right - ramped).abs() < 1e-5);
        assert!((post_pan.left - panned).abs() < 1e-5);
        assert!((post_pan.right - panned).abs() < 1e-5);
    }

    #[test]
    fn test_send_taps_differ() {
        let taps = [SendMode::PreFader, SendMode::PostFader, SendMode::PostPan];
        let mut results = Vec::new();
        for mode in taps {
            let (mut track, handle) = new_track();
            let controls = handle.controls();
            controls.set_volume(0.5);
            controls.set_pan(1.0);
            controls.set_send_enabled(true);
            controls.set_send_level(1.0);
            controls.set_send_mode(mode);

            let (mut main, mut send) = buffers();
            settle(&mut track, &mut main, &mut send);
            results.push(send[FRAMES - 1]);
        }

        let [pre, post_fader, post_pan] = [results[0], results[1], results[2]];
        assert!((pre.left - 0.5).abs() < 1e-6 && (pre.right - 0.5).abs() < 1e-6);
        assert!((post_fader.left - 0.25).abs() < 1e-6);
        assert!((post_fader.right - 0.25).abs() < 1e-6);
        assert!(post_pan.left.abs() < 1e-6);
        assert!((post_pan.right - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_fault_replays_then_recovers() {
        let (mut track, mut handle) = new_track();
        let (mut main, mut send) = buffers();
        settle(&mut track, &mut main, &mut send);
        let good = main.clone();

        handle.lock_engine().install_instrument(PreparedPlugin::unchecked(
            ScriptedPlugin::new(Behavior::PanicOnNote).boxed(),
            PluginDescription::instrument("crashy synth"),
            ChannelLayout::NO_INPUT,
        ));
        handle.send_midi(MidiEvent::note_on(0, 60, 100));
        track.queue_timeline(&constant(0.5));
        let report = render(&mut track, &mut main, &mut send);
        assert_eq!(report.outcome, RenderOutcome::Faulted(Fault::Panicked));
        assert_eq!(main, good);

        // The note was dropped with the faulted block
        track.queue_timeline(&constant(0.5));
        assert_eq!(render(&mut track, &mut main, &mut send).outcome, RenderOutcome::Rendered);
    }

    #[test]
    fn test_non_finite_insert_is_a_fault() {
        let (mut track, handle) = new_track();
        let (mut main, mut send) = buffers();
        handle.lock_engine().install_insert(
            2,
            PreparedPlugin::unchecked(
                ScriptedPlugin::new(Behavior::NonFinite).boxed(),
                PluginDescription::effect("nan"),
                ChannelLayout::STEREO,
            ),
        );
        let report = render(&mut track, &mut main, &mut send);
        assert_eq!(report.outcome, RenderOutcome::Faulted(Fault::NonFiniteOutput));
        assert!(main.iter().all(|s| s.left.is_finite()));

        handle.set_insert_bypass(2, true);
        assert_eq!(render(&mut track, &mut main, &mut send).outcome, RenderOutcome::Rendered);
    }

    #[test]
    fn test_oversized_block_replays() {
        let (mut track, _handle) = new_track();
        let mut main = StereoBuffer::with_capacity(FRAMES * 2);
        let mut send = StereoBuffer::with_capacity(FRAMES * 2);
        let report = track.render(&BlockContext::new(FRAMES * 2, 48000.0), None, &mut main, &mut send);
        assert_eq!(report.outcome, RenderOutcome::CapacityMismatch);
        assert_eq!(main.len(), FRAMES * 2);
    }

    #[test]
    fn test_frozen_track_is_silent() {
        let (mut track, handle) = new_track();
        let (mut main, mut send) = buffers();
        handle.controls().set_frozen(true);
        track.queue_timeline(&constant(0.5));
        let report = render(&mut track, &mut main, &mut send);
        assert_eq!(report.outcome, RenderOutcome::Frozen);
        assert_eq!(main.peak(), 0.0);
    }

    #[test]
    fn test_monitor_safety_flag() {
        let (mut track, handle) = new_track();
        let (mut main, mut send) = buffers();
        let input = constant(0.25);
        let ctx = BlockContext::new(FRAMES, 48000.0);
        handle.controls().set_monitor(true);

        let report = track.render(&ctx, Some(&input), &mut main, &mut send);
        assert!(!report.used_unsafe_monitor);

        handle.controls().set_safe_monitoring(false);
        let report = track.render(&ctx, Some(&input), &mut main, &mut send);
        assert!(report.used_unsafe_monitor);

        // Hot input is forced through the safe path
        let report = track.render(&ctx, Some(&constant(0.95)), &mut main, &mut send);
        assert!(!report.used_unsafe_monitor);
    }

    #[test]
    fn test_dry_tap_skips_effects() {
        let (mut track, handle) = new_track();
        let (mut main, mut send) = buffers();
        let controls = handle.controls();
        controls.set_monitor(true);
        controls.set_safe_monitoring(false);
        controls.set_monitor_tap(MonitorTap::Dry);
        controls.set_pan(-1.0);
        handle.lock_engine().install_insert(
            0,
            PreparedPlugin::unchecked(
                ScriptedPlugin::new(Behavior::Gain(0.0)).boxed(),
                PluginDescription::effect("mute"),
                ChannelLayout::STEREO,
            ),
        );

        let input = constant(0.25);
        let ctx = BlockContext::new(FRAMES, 48000.0);
        for _ in 0..3 {
            track.render(&ctx, Some(&input), &mut main, &mut send);
        }
        assert!((main[FRAMES - 1].left - 0.25).abs() < 1e-6);

        controls.set_monitor_tap(MonitorTap::Processed);
        track.render(&ctx, Some(&input), &mut main, &mut send);
        assert_eq!(main[FRAMES - 1].left, 0.0);
    }

    #[test]
    fn test_load_insert_contract() {
        let (_track, handle) = new_track();

        let err = handle
            .load_insert(
                0,
                ScriptedPlugin::new(Behavior::Gain(1.0)).boxed(),
                PluginDescription::instrument("synth"),
                None,
            )
            .err().unwrap();
        assert!(matches!(err, PluginLoadError::KindMismatch { .. }));

        let err = handle
            .load_insert(
                MAX_INSERT_SLOTS,
                ScriptedPlugin::new(Behavior::Gain(1.0)).boxed(),
                PluginDescription::effect("gain"),
                None,
            )
            .err().unwrap();
        assert!(matches!(err, PluginLoadError::SlotOutOfRange { .. }));

        let previous = handle
            .load_insert(
                1,
                ScriptedPlugin::new(Behavior::Gain(1.0)).boxed(),
                PluginDescription::effect("first"),
                None,
            )
            .unwrap();
        assert!(previous.is_none());

        // A failing candidate leaves the first one in place
        let err = handle.load_insert(
            1,
            ScriptedPlugin::new(Behavior::Panic).boxed(),
            PluginDescription::effect("second"),
            None,
        );
        assert!(matches!(err, Err(PluginLoadError::SafetyCheckFailed { .. })));
        assert_eq!(
            handle.lock_engine().insert(1).and_then(|s| s.description()).map(|d| d.name.as_str()),
            Some("first")
        );

        let previous = handle
            .load_insert(
                1,
                ScriptedPlugin::new(Behavior::Gain(0.5)).boxed(),
                PluginDescription::effect("third"),
                None,
            )
            .unwrap();
        assert!(previous.is_some());
        assert!(handle.unload_insert(1).is_some());
        assert!(handle.unload_insert(1).is_none());
    }

    #[test]
    fn test_latency_is_reported() {
        let (mut track, handle) = new_track();
        let (mut main, mut send) = buffers();
        let mut plugin = ScriptedPlugin::new(Behavior::Gain(1.0));
        plugin.latency = 128;
        handle
            .load_insert(0, plugin.boxed(), PluginDescription::effect("lookahead"), None)
            .unwrap();
        render(&mut track, &mut main, &mut send);
        assert_eq!(handle.controls().latency(), 128);
    }
}
