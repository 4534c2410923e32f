//! Plugin hosting - capability trait, slots and built-in instruments
//!
//! Every sound source or insert on a track is driven through one small
//! capability interface, [`HostedPlugin`]: prepare, process, release,
//! latency and channel counts. Third-party instances (whatever the
//! discovery layer instantiated) and the engine's own instruments both
//! implement it, and a track picks its instrument stage per block from
//! three tagged variants ([`InstrumentStage`]).
//!
//! Third-party code is treated as a black box that may panic or emit
//! garbage. Every real-time call goes through [`guarded`], which turns a
//! panic, an error return or non-finite output into a [`Fault`].

mod error;
pub mod midi;
mod sampler;
mod slot;
mod synth;
mod validate;

pub use error::{Fault, PluginError, PluginLoadError, PluginLoadResult, SafetyPass};
pub use midi::{midi_channel, MidiEvent, MidiMessage, MidiReceiver, MidiSender};
pub use sampler::Sampler;
pub use slot::PluginSlot;
pub use synth::BasicSynth;
pub use validate::{load_plugin, safety_check, PreparedPlugin};

use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};

use crate::types::{AudioBlock, PlanarBuffer};

/// Main-bus channel layout negotiated at load time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelLayout {
    pub inputs: usize,
    pub outputs: usize,
}

impl ChannelLayout {
    pub const STEREO: Self = Self { inputs: 2, outputs: 2 };
    pub const MONO: Self = Self { inputs: 1, outputs: 1 };
    /// Inputs disabled, stereo out (generators and most instruments)
    pub const NO_INPUT: Self = Self { inputs: 0, outputs: 2 };
}

/// Layouts offered to a plugin, most preferred first
pub const LAYOUT_PREFERENCES: [ChannelLayout; 3] = [
    ChannelLayout::STEREO,
    ChannelLayout::MONO,
    ChannelLayout::NO_INPUT,
];

/// Total channel counts a plugin actually uses, including non-main buses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelCounts {
    pub inputs: usize,
    pub outputs: usize,
}

impl ChannelCounts {
    /// Scratch channels needed to run this plugin in place
    pub fn scratch_channels(&self, layout: ChannelLayout) -> usize {
        self.inputs
            .max(self.outputs)
            .max(layout.inputs)
            .max(layout.outputs)
            .max(1)
    }
}

/// What the discovery layer knows about an instance
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PluginDescription {
    pub name: String,
    pub vendor: String,
    /// Identifier unique to the plugin type
    pub id: String,
    pub is_instrument: bool,
}

impl PluginDescription {
    pub fn effect(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn instrument(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_instrument: true,
            ..Default::default()
        }
    }
}

/// Capability interface for anything that renders audio on a track
///
/// `process` runs on the audio thread and must not allocate or block.
/// Implementations process in place: inputs arrive in the first channels
/// of the block and outputs (including extra buses) are written back.
pub trait HostedPlugin: Send {
    /// Configure for a sample rate, maximum block size and main layout
    fn prepare(
        &mut self,
        sample_rate: f64,
        max_block: usize,
        layout: ChannelLayout,
    ) -> Result<(), PluginError>;

    /// Render one block in place
    fn process(&mut self, block: &mut AudioBlock<'_>, midi: &[MidiEvent])
        -> Result<(), PluginError>;

    /// Free processing resources; `prepare` must be called again before `process`
    fn release(&mut self);

    /// Processing latency in samples
    fn latency_samples(&self) -> u32;

    /// Channel counts after `prepare`, including non-main buses
    fn channel_counts(&self) -> ChannelCounts;

    /// Whether `prepare` would accept this main layout
    fn supports_layout(&self, _layout: ChannelLayout) -> bool {
        true
    }

    /// Apply saved state
    fn restore_state(&mut self, _state: &[u8]) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Run a third-party call, containing panics and error returns
#[inline]
pub(crate) fn guarded<R>(call: impl FnOnce() -> Result<R, PluginError>) -> Result<R, Fault> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            log::trace!("[PLUGIN] process error: {}", e);
            Err(Fault::ProcessError)
        }
        Err(_) => Err(Fault::Panicked),
    }
}

/// The instrument stage chosen for one block
///
/// A loaded, non-bypassed hosted instrument wins; otherwise the built-in
/// sampler when it has a sample; otherwise the basic synth.
pub enum InstrumentStage<'a> {
    Hosted(&'a mut PluginSlot),
    Sampler(&'a mut Sampler),
    Synth(&'a mut BasicSynth),
}

impl<'a> InstrumentStage<'a> {
    /// Pick the stage for this block
    pub fn select(
        hosted: &'a mut PluginSlot,
        sampler: &'a mut Sampler,
        synth: &'a mut BasicSynth,
    ) -> Self {
        if hosted.is_active() {
            InstrumentStage::Hosted(hosted)
        } else if sampler.has_sample() {
            InstrumentStage::Sampler(sampler)
        } else {
            InstrumentStage::Synth(synth)
        }
    }

    /// Render into `scratch`, returning the number of channels written
    pub fn render(
        &mut self,
        scratch: &mut PlanarBuffer,
        frames: usize,
        midi: &[MidiEvent],
    ) -> Result<usize, Fault> {
        match self {
            InstrumentStage::Hosted(slot) => slot.process(scratch, frames, midi),
            InstrumentStage::Sampler(sampler) => {
                let mut block = scratch.block(2, frames);
                guarded(|| sampler.process(&mut block, midi))?;
                Ok(2)
            }
            InstrumentStage::Synth(synth) => {
                let mut block = scratch.block(2, frames);
                guarded(|| synth.process(&mut block, midi))?;
                Ok(2)
            }
        }
    }

    /// Latency of the chosen stage
    pub fn latency_samples(&self) -> u32 {
        match self {
            InstrumentStage::Hosted(slot) => slot.latency_samples(),
            InstrumentStage::Sampler(sampler) => sampler.latency_samples(),
            InstrumentStage::Synth(synth) => synth.latency_samples(),
        }
    }
}
