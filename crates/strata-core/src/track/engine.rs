//! TrackEngine - the lock-guarded half of a track
//!
//! Everything the control thread may replace while audio is running
//! (plugin slots, sampler contents, effect parameters) lives here, behind
//! the track's mutex. The audio thread reaches it only through a bounded
//! `try_lock` and runs the source and effect stages of a block in one go.

use crate::effect::{EffectBank, ThreeBandEq};
use crate::plugin::{
    BasicSynth, ChannelLayout, Fault, HostedPlugin, InstrumentStage, MidiEvent, PluginSlot,
    PreparedPlugin, Sampler,
};
use crate::types::{
    PlanarBuffer, StereoBuffer, StereoSample, DEFAULT_SAMPLE_RATE, MAX_INSERT_SLOTS,
    MAX_LATENCY_SAMPLES,
};

/// Main-path samples are clamped to this range after the chain
const SANITIZE_LIMIT: f32 = 8.0;

/// Below this a channel counts as silent for the extra-output fold
const FOLD_SILENCE: f32 = 1e-6;

/// Audio mixed into the chain at fixed points this block
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ChainInputs<'a> {
    /// Arranged audio for this block, added after the instrument
    pub timeline: Option<&'a StereoBuffer>,
    /// Monitored input processed by inserts and the effect bank
    pub monitor_pre: Option<&'a StereoBuffer>,
    /// Monitored input joining after the effect bank
    pub monitor_post: Option<&'a StereoBuffer>,
    pub effect_mask: u32,
}

/// Plugin slots, built-in instruments and DSP for one track
pub struct TrackEngine {
    pub(crate) instrument: PluginSlot,
    pub(crate) inserts: [PluginSlot; MAX_INSERT_SLOTS],
    pub(crate) sampler: Sampler,
    pub(crate) synth: BasicSynth,
    pub(crate) effects: EffectBank,
    pub(crate) eq: ThreeBandEq,
    scratch: PlanarBuffer,
    sample_rate: f64,
    max_block: usize,
}

impl TrackEngine {
    pub(crate) fn new(sample_rate: f64, max_block: usize) -> Self {
        let mut engine = Self {
            instrument: PluginSlot::empty(),
            inserts: Default::default(),
            sampler: Sampler::new(),
            synth: BasicSynth::new(),
            effects: EffectBank::new(),
            eq: ThreeBandEq::default(),
            scratch: PlanarBuffer::default(),
            sample_rate: DEFAULT_SAMPLE_RATE as f64,
            max_block,
        };
        engine.prepare(sample_rate, max_block);
        engine
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn max_block(&self) -> usize {
        self.max_block
    }

    /// Re-prepare every stage and resize the scratch (control thread)
    pub(crate) fn prepare(&mut self, sample_rate: f64, max_block: usize) {
        self.sample_rate = sample_rate;
        self.max_block = max_block;

        self.instrument.prepare(sample_rate, max_block);
        for slot in &mut self.inserts {
            slot.prepare(sample_rate, max_block);
        }
        prepare_builtin(&mut self.sampler, "sampler", sample_rate, max_block);
        prepare_builtin(&mut self.synth, "synth", sample_rate, max_block);
        self.effects.prepare(sample_rate, max_block);
        self.eq.prepare(sample_rate as f32);
        self.resize_scratch();
    }

    /// Scratch channels needed by the current slot contents (at least stereo)
    pub fn required_channels(&self) -> usize {
        self.inserts
            .iter()
            .map(PluginSlot::required_channels)
            .fold(self.instrument.required_channels(), usize::max)
            .max(2)
    }

    pub fn scratch_channels(&self) -> usize {
        self.scratch.channel_count()
    }

    /// Size the scratch to exactly what the loaded plugins need
    pub(crate) fn resize_scratch(&mut self) {
        let channels = self.required_channels();
        if self.scratch.channel_count() != channels || self.scratch.frame_capacity() != self.max_block
        {
            self.scratch.resize(channels, self.max_block);
        }
    }

    /// Whether this block can run without touching the allocator
    #[inline]
    pub(crate) fn fits(&self, frames: usize) -> bool {
        self.scratch.fits(self.required_channels(), frames)
    }

    /// Total latency of the instrument stage and active inserts
    pub fn latency_samples(&mut self) -> u32 {
        let stage = InstrumentStage::select(&mut self.instrument, &mut self.sampler, &mut self.synth);
        let total = self
            .inserts
            .iter()
            .fold(stage.latency_samples(), |acc, slot| {
                acc.saturating_add(slot.latency_samples())
            });
        total.min(MAX_LATENCY_SAMPLES as u32)
    }

    pub fn instrument(&self) -> &PluginSlot {
        &self.instrument
    }

    pub fn insert(&self, index: usize) -> Option<&PluginSlot> {
        self.inserts.get(index)
    }

    pub fn effects(&self) -> &EffectBank {
        &self.effects
    }

    pub(crate) fn install_insert(
        &mut self,
        index: usize,
        prepared: PreparedPlugin,
    ) -> Option<Box<dyn HostedPlugin>> {
        let previous = self.inserts[index].install(prepared);
        self.resize_scratch();
        previous
    }

    pub(crate) fn install_instrument(
        &mut self,
        prepared: PreparedPlugin,
    ) -> Option<Box<dyn HostedPlugin>> {
        let previous = self.instrument.install(prepared);
        self.resize_scratch();
        previous
    }

    pub(crate) fn take_insert(&mut self, index: usize) -> Option<Box<dyn HostedPlugin>> {
        let previous = self.inserts[index].take();
        self.resize_scratch();
        previous
    }

    pub(crate) fn take_instrument(&mut self) -> Option<Box<dyn HostedPlugin>> {
        let previous = self.instrument.take();
        self.resize_scratch();
        previous
    }

    /// Instrument, timeline, monitor pre-tap, inserts, effect bank, monitor post-tap
    ///
    /// Leaves the result in the scratch and returns how many channels
    /// carry audio. Any fault aborts the chain immediately.
    pub(crate) fn render_chain(
        &mut self,
        frames: usize,
        midi: &[MidiEvent],
        inputs: &ChainInputs<'_>,
    ) -> Result<usize, Fault> {
        self.scratch.clear(frames);

        let mut stage =
            InstrumentStage::select(&mut self.instrument, &mut self.sampler, &mut self.synth);
        let mut channels = stage.render(&mut self.scratch, frames, midi)?.max(2);

        if let Some(timeline) = inputs.timeline {
            mix_stereo(&mut self.scratch, timeline, frames);
        }
        if let Some(monitor) = inputs.monitor_pre {
            mix_stereo(&mut self.scratch, monitor, frames);
        }

        for slot in self.inserts.iter_mut().filter(|slot| slot.is_active()) {
            channels = channels.max(slot.process(&mut self.scratch, frames, &[])?);
        }

        let (left, right) = self.scratch.stereo_mut(frames);
        self.effects.process(left, right, inputs.effect_mask);

        if let Some(monitor) = inputs.monitor_post {
            mix_stereo(&mut self.scratch, monitor, frames);
        }

        Ok(channels.min(self.scratch.channel_count()))
    }

    /// Clamp, fold extra outputs, EQ and copy the result to `out`
    pub(crate) fn finish(
        &mut self,
        frames: usize,
        channels: usize,
        eq_gains: Option<[f32; 3]>,
        out: &mut StereoBuffer,
    ) {
        for ch in 0..channels {
            for s in &mut self.scratch.channel_mut(ch)[..frames] {
                *s = if s.is_finite() {
                    s.clamp(-SANITIZE_LIMIT, SANITIZE_LIMIT)
                } else {
                    0.0
                };
            }
        }

        // Multi-out instruments sometimes leave the main pair empty
        let primary = [
            self.scratch.channel_peak(0, frames),
            self.scratch.channel_peak(1, frames),
        ];
        for extra in 2..channels {
            let dst = extra % 2;
            if primary[dst] < FOLD_SILENCE && self.scratch.channel_peak(extra, frames) > FOLD_SILENCE
            {
                self.scratch.add_channel_into(extra, dst, frames);
            }
        }

        let (left, right) = self.scratch.stereo_mut(frames);
        if let Some(gains) = eq_gains {
            self.eq.set_gains_db(gains);
            self.eq.process(left, right);
        }

        out.set_len_from_capacity(frames);
        for (dst, (l, r)) in out.iter_mut().zip(left.iter().zip(right.iter())) {
            *dst = StereoSample::new(*l, *r);
        }
    }
}

impl std::fmt::Debug for TrackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackEngine")
            .field("instrument", &self.instrument.description())
            .field("sample_rate", &self.sample_rate)
            .field("max_block", &self.max_block)
            .field("scratch_channels", &self.scratch.channel_count())
            .finish()
    }
}

fn prepare_builtin(plugin: &mut dyn HostedPlugin, name: &str, sample_rate: f64, max_block: usize) {
    if let Err(e) = plugin.prepare(sample_rate, max_block, ChannelLayout::NO_INPUT) {
        log::warn!("[TRACK] Built-in {} failed to prepare: {}", name, e);
    }
}

/// Add a stereo buffer into scratch channels 0 and 1
/// Non-finite input is dropped here, before it can reach filter state
fn mix_stereo(scratch: &mut PlanarBuffer, source: &StereoBuffer, frames: usize) {
    let finite = |x: f32| if x.is_finite() { x } else { 0.0 };
    let (left, right) = scratch.stereo_mut(frames);
    for ((l, r), s) in left.iter_mut().zip(right.iter_mut()).zip(source.iter()) {
        *l += finite(s.left);
        *r += finite(s.right);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::test_plugins::{Behavior, ScriptedPlugin};
    use crate::plugin::PluginDescription;

    fn prepared(behavior: Behavior, outputs: usize) -> PreparedPlugin {
        let mut plugin = ScriptedPlugin::new(behavior);
        plugin.outputs = outputs;
        let mut prepared = PreparedPlugin::unchecked(
            plugin.boxed(),
            PluginDescription::effect("scripted"),
            ChannelLayout::STEREO,
        );
        prepared.counts.outputs = outputs;
        prepared
    }

    #[test]
    fn test_scratch_follows_loaded_plugins() {
        let mut engine = TrackEngine::new(48000.0, 256);
        assert_eq!(engine.scratch_channels(), 2);

        engine.install_insert(1, prepared(Behavior::Gain(1.0), 6));
        assert_eq!(engine.scratch_channels(), 6);
        assert!(engine.fits(256));
        assert!(!engine.fits(257));

        engine.take_insert(1);
        assert_eq!(engine.scratch_channels(), 2);
    }

    #[test]
    fn test_synth_is_default_source() {
        let mut engine = TrackEngine::new(48000.0, 256);
        let midi = [MidiEvent::note_on(0, 69, 100)];
        let channels = engine
            .render_chain(256, &midi, &ChainInputs::default())
            .unwrap();
        assert_eq!(channels, 2);

        let mut out = StereoBuffer::with_capacity(256);
        engine.finish(256, channels, None, &mut out);
        assert!(out.peak() > 0.0);
    }

    #[test]
    fn test_insert_fault_propagates() {
        let mut engine = TrackEngine::new(48000.0, 128);
        engine.install_insert(0, prepared(Behavior::Panic, 2));
        assert_eq!(
            engine.render_chain(128, &[], &ChainInputs::default()),
            Err(Fault::Panicked)
        );

        engine.inserts[0].set_bypass(true);
        assert!(engine.render_chain(128, &[], &ChainInputs::default()).is_ok());
    }

    #[test]
    fn test_extra_outputs_fold_into_silent_main() {
        let mut engine = TrackEngine::new(48000.0, 64);
        engine.install_insert(0, prepared(Behavior::ExtraOutputsOnly, 4));
        let channels = engine
            .render_chain(64, &[], &ChainInputs::default())
            .unwrap();
        assert_eq!(channels, 4);

        let mut out = StereoBuffer::with_capacity(64);
        engine.finish(64, channels, None, &mut out);
        assert!(out.iter().all(|s| s.left == 0.25 && s.right == 0.25));
    }

    #[test]
    fn test_sanitize_clamps_timeline() {
        let mut engine = TrackEngine::new(48000.0, 32);
        let mut timeline = StereoBuffer::from_vec(vec![StereoSample::new(100.0, -100.0); 32]);
        timeline[0] = StereoSample::new(f32::INFINITY, 0.0);
        let inputs = ChainInputs {
            timeline: Some(&timeline),
            ..Default::default()
        };
        let channels = engine.render_chain(32, &[], &inputs).unwrap();

        let mut out = StereoBuffer::with_capacity(32);
        engine.finish(32, channels, None, &mut out);
        assert_eq!(out[0].left, 0.0);
        assert_eq!(out[1], StereoSample::new(8.0, -8.0));
    }

    #[test]
    fn test_nan_input_does_not_poison_effects() {
        use crate::effect::EffectKind;

        let mut engine = TrackEngine::new(48000.0, 256);
        let mask = EffectKind::Delay.bit() | EffectKind::Reverb.bit();
        let mut out = StereoBuffer::with_capacity(256);

        let mut poisoned = StereoBuffer::from_vec(vec![StereoSample::mono(0.5); 256]);
        poisoned[10] = StereoSample::new(f32::NAN, f32::INFINITY);
        let inputs = ChainInputs {
            timeline: Some(&poisoned),
            effect_mask: mask,
            ..Default::default()
        };
        let channels = engine.render_chain(256, &[], &inputs).unwrap();
        engine.finish(256, channels, None, &mut out);

        let clean = StereoBuffer::from_vec(vec![StereoSample::mono(0.5); 256]);
        for _ in 0..8 {
            let inputs = ChainInputs {
                timeline: Some(&clean),
                effect_mask: mask,
                ..Default::default()
            };
            let channels = engine.render_chain(256, &[], &inputs).unwrap();
            engine.finish(256, channels, None, &mut out);
            assert!(out.iter().all(|s| s.left.is_finite() && s.right.is_finite()));
            assert!(out.peak() > 0.1);
        }
    }

    #[test]
    fn test_latency_sums_active_slots() {
        let mut engine = TrackEngine::new(48000.0, 64);
        let mut first = prepared(Behavior::Gain(1.0), 2);
        first.latency = 64;
        let mut second = prepared(Behavior::Gain(1.0), 2);
        second.latency = 100;
        engine.install_insert(0, first);
        engine.install_insert(2, second);
        assert_eq!(engine.latency_samples(), 164);

        engine.inserts[2].set_bypass(true);
        assert_eq!(engine.latency_samples(), 64);
    }
}
