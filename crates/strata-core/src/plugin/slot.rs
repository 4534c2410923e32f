//! PluginSlot - one hosted instance on a track
//!
//! Holds at most one plugin together with everything the render path
//! needs to drive it without asking the plugin again: negotiated layout,
//! channel counts and latency. Slots live inside the track's locked
//! engine state, so every method here runs either on the control thread
//! holding the lock or on the audio thread after a successful `try_lock`.

use crate::types::PlanarBuffer;

use super::validate::PreparedPlugin;
use super::{guarded, ChannelCounts, ChannelLayout, Fault, HostedPlugin, MidiEvent, PluginDescription};

/// A single plugin position (insert slot or hosted instrument)
#[derive(Default)]
pub struct PluginSlot {
    plugin: Option<Box<dyn HostedPlugin>>,
    description: Option<PluginDescription>,
    layout: ChannelLayout,
    counts: ChannelCounts,
    latency: u32,
    bypassed: bool,
    /// Set when a re-prepare failed; cleared by the next successful one
    failed: bool,
}

impl PluginSlot {
    /// Create an empty slot
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether a plugin is installed
    pub fn is_loaded(&self) -> bool {
        self.plugin.is_some()
    }

    /// Loaded, not bypassed and not failed
    #[inline]
    pub fn is_active(&self) -> bool {
        self.plugin.is_some() && !self.bypassed && !self.failed
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn set_bypass(&mut self, bypass: bool) {
        self.bypassed = bypass;
    }

    pub fn description(&self) -> Option<&PluginDescription> {
        self.description.as_ref()
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    /// Latency contributed by this slot (0 unless active)
    #[inline]
    pub fn latency_samples(&self) -> u32 {
        if self.is_active() {
            self.latency
        } else {
            0
        }
    }

    /// Scratch channels this slot needs (0 when empty)
    pub fn required_channels(&self) -> usize {
        if self.plugin.is_some() {
            self.counts.scratch_channels(self.layout)
        } else {
            0
        }
    }

    /// Install a validated plugin, returning the previous instance
    ///
    /// The bypass flag is kept so a replaced plugin stays bypassed.
    pub fn install(&mut self, prepared: PreparedPlugin) -> Option<Box<dyn HostedPlugin>> {
        let PreparedPlugin {
            plugin,
            description,
            layout,
            counts,
            latency,
        } = prepared;

        log::info!(
            "[PLUGIN] Installed '{}' ({}in/{}out, {} samples latency)",
            description.name,
            layout.inputs,
            layout.outputs,
            latency
        );

        self.description = Some(description);
        self.layout = layout;
        self.counts = counts;
        self.latency = latency;
        self.failed = false;
        self.plugin.replace(plugin)
    }

    /// Remove the plugin, returning it to the caller
    pub fn take(&mut self) -> Option<Box<dyn HostedPlugin>> {
        self.description = None;
        self.counts = ChannelCounts::default();
        self.layout = ChannelLayout::default();
        self.latency = 0;
        self.failed = false;
        self.plugin.take()
    }

    /// Re-prepare for a new sample rate or block size (control thread)
    ///
    /// A plugin that fails here stays loaded but is skipped until the
    /// next successful prepare.
    pub fn prepare(&mut self, sample_rate: f64, max_block: usize) {
        let layout = self.layout;
        let Some(plugin) = self.plugin.as_mut() else {
            return;
        };

        plugin.release();
        match guarded(|| plugin.prepare(sample_rate, max_block, layout)) {
            Ok(()) => {
                self.failed = false;
                if let Ok(counts) = guarded(|| Ok(plugin.channel_counts())) {
                    self.counts = counts;
                }
                if let Ok(latency) = guarded(|| Ok(plugin.latency_samples())) {
                    self.latency = latency;
                }
            }
            Err(fault) => {
                self.failed = true;
                let name = self
                    .description
                    .as_ref()
                    .map(|d| d.name.as_str())
                    .unwrap_or("<unnamed>");
                log::warn!("[PLUGIN] '{}' failed to re-prepare ({}), skipping it", name, fault);
            }
        }
    }

    /// Run the plugin in place on `scratch` (audio thread)
    ///
    /// Main-bus audio is expected in channels 0 and 1. Mono plugins get a
    /// downmix in channel 0 and their output is copied back to channel 1.
    /// Returns the number of channels the plugin wrote.
    pub fn process(
        &mut self,
        scratch: &mut PlanarBuffer,
        frames: usize,
        midi: &[MidiEvent],
    ) -> Result<usize, Fault> {
        let channels = self.counts.scratch_channels(self.layout);
        let mono = self.layout.outputs == 1;
        let Some(plugin) = self.plugin.as_mut() else {
            return Ok(0);
        };

        if mono && scratch.channel_count() >= 2 {
            let (left, right) = scratch.stereo_mut(frames);
            for (l, r) in left.iter_mut().zip(right.iter()) {
                *l = 0.5 * (*l + *r);
            }
        }

        let mut block = scratch.block(channels, frames);
        guarded(|| plugin.process(&mut block, midi))?;
        if !block.is_finite() {
            return Err(Fault::NonFiniteOutput);
        }

        if mono && scratch.channel_count() >= 2 {
            let (left, right) = scratch.stereo_mut(frames);
            right.copy_from_slice(left);
        }

        Ok(channels.max(2))
    }

    /// Release the plugin's processing resources (control thread)
    pub fn release(&mut self) {
        if let Some(plugin) = self.plugin.as_mut() {
            plugin.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::load_plugin;
    use crate::plugin::test_plugins::{Behavior, ScriptedPlugin};

    fn prepared(plugin: ScriptedPlugin) -> PreparedPlugin {
        load_plugin(plugin.boxed(), PluginDescription::effect("test"), None, 48000.0, 256)
            .unwrap()
    }

    #[test]
    fn test_empty_slot_is_inactive() {
        let mut slot = PluginSlot::empty();
        let mut scratch = PlanarBuffer::new(2, 64);
        assert!(!slot.is_active());
        assert_eq!(slot.required_channels(), 0);
        assert_eq!(slot.process(&mut scratch, 64, &[]), Ok(0));
    }

    #[test]
    fn test_install_returns_previous() {
        let mut slot = PluginSlot::empty();
        assert!(slot.install(prepared(ScriptedPlugin::new(Behavior::Gain(1.0)))).is_none());
        assert!(slot.install(prepared(ScriptedPlugin::new(Behavior::Gain(0.5)))).is_some());
        assert!(slot.is_active());
        assert!(slot.take().is_some());
        assert!(!slot.is_loaded());
    }

    #[test]
    fn test_process_applies_gain() {
        let mut slot = PluginSlot::empty();
        slot.install(prepared(ScriptedPlugin::new(Behavior::Gain(0.5))));

        let mut scratch = PlanarBuffer::new(2, 64);
        scratch.channel_mut(0).fill(1.0);
        scratch.channel_mut(1).fill(1.0);
        assert_eq!(slot.process(&mut scratch, 64, &[]), Ok(2));
        assert!(scratch.channel(0).iter().all(|s| *s == 0.5));
    }

    #[test]
    fn test_mono_slot_downmixes_and_duplicates() {
        let mut plugin = ScriptedPlugin::new(Behavior::Gain(1.0));
        plugin.accepted = vec![ChannelLayout::MONO];
        plugin.outputs = 1;
        let mut slot = PluginSlot::empty();
        slot.install(prepared(plugin));
        assert_eq!(slot.layout(), ChannelLayout::MONO);

        let mut scratch = PlanarBuffer::new(2, 16);
        scratch.channel_mut(0).fill(1.0);
        scratch.channel_mut(1).fill(0.0);
        slot.process(&mut scratch, 16, &[]).unwrap();
        assert!(scratch.channel(0).iter().all(|s| *s == 0.5));
        assert!(scratch.channel(1).iter().all(|s| *s == 0.5));
    }

    #[test]
    fn test_faults_are_contained() {
        let mut scratch = PlanarBuffer::new(2, 64);

        let mut slot = PluginSlot::empty();

        // These would never pass validation, so install them unchecked
        for (behavior, fault) in [
            (Behavior::Panic, Fault::Panicked),
            (Behavior::Error, Fault::ProcessError),
            (Behavior::NonFinite, Fault::NonFiniteOutput),
        ] {
            slot.install(PreparedPlugin::unchecked(
                ScriptedPlugin::new(behavior).boxed(),
                PluginDescription::effect("bad"),
                ChannelLayout::STEREO,
            ));
            assert_eq!(slot.process(&mut scratch, 64, &[]), Err(fault));
        }
    }

    #[test]
    fn test_bypass_and_failed_zero_latency() {
        let mut plugin = ScriptedPlugin::new(Behavior::Gain(1.0));
        plugin.latency = 64;
        let mut slot = PluginSlot::empty();
        slot.install(prepared(plugin));
        assert_eq!(slot.latency_samples(), 64);

        slot.set_bypass(true);
        assert_eq!(slot.latency_samples(), 0);
        slot.set_bypass(false);

        // Re-prepare fails because the plugin no longer accepts its layout
        slot.install(PreparedPlugin::unchecked(
            {
                let mut p = ScriptedPlugin::new(Behavior::Gain(1.0));
                p.accepted = vec![ChannelLayout::MONO];
                p.boxed()
            },
            PluginDescription::effect("picky"),
            ChannelLayout::STEREO,
        ));
        slot.prepare(44100.0, 512);
        assert!(slot.is_failed());
        assert!(!slot.is_active());
    }
}
