//! Load-time plugin validation
//!
//! A plugin only reaches a track after it has:
//! 1. accepted a main layout (stereo, then mono, then input-less stereo out)
//! 2. applied its saved state, if any
//! 3. survived three synthetic blocks (note-on, note-off, silence) without
//!    panicking, returning an error or producing non-finite samples
//!
//! All of this runs on the control thread before the track lock is taken,
//! so a slow or broken plugin never stalls the audio thread.

use std::panic::{self, AssertUnwindSafe};

use crate::types::{PlanarBuffer, MAX_LATENCY_SAMPLES};

use super::{
    guarded, ChannelCounts, ChannelLayout, Fault, HostedPlugin, MidiEvent, PluginDescription,
    PluginLoadError, PluginLoadResult, SafetyPass, LAYOUT_PREFERENCES,
};

/// Largest block rendered per safety pass
const SAFETY_BLOCK_FRAMES: usize = 512;

/// A plugin that passed validation and is ready to install in a slot
pub struct PreparedPlugin {
    pub(crate) plugin: Box<dyn HostedPlugin>,
    pub description: PluginDescription,
    pub layout: ChannelLayout,
    pub counts: ChannelCounts,
    pub latency: u32,
}

impl PreparedPlugin {
    /// Scratch channels needed to run it
    pub fn required_channels(&self) -> usize {
        self.counts.scratch_channels(self.layout)
    }

    #[cfg(test)]
    pub(crate) fn unchecked(
        plugin: Box<dyn HostedPlugin>,
        description: PluginDescription,
        layout: ChannelLayout,
    ) -> Self {
        Self {
            plugin,
            description,
            layout,
            counts: ChannelCounts {
                inputs: layout.inputs,
                outputs: layout.outputs,
            },
            latency: 0,
        }
    }
}

impl std::fmt::Debug for PreparedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedPlugin")
            .field("description", &self.description)
            .field("layout", &self.layout)
            .field("counts", &self.counts)
            .field("latency", &self.latency)
            .finish()
    }
}

/// Negotiate, restore and safety-check a freshly instantiated plugin
pub fn load_plugin(
    mut plugin: Box<dyn HostedPlugin>,
    description: PluginDescription,
    state: Option<&[u8]>,
    sample_rate: f64,
    max_block: usize,
) -> PluginLoadResult<PreparedPlugin> {
    let name = description.name.clone();
    let layout = negotiate_layout(plugin.as_mut(), &name, sample_rate, max_block)?;

    if let Some(state) = state {
        guarded(|| plugin.restore_state(state)).map_err(|fault| {
            PluginLoadError::StateRestoreFailed {
                plugin: name.clone(),
                reason: fault.to_string(),
            }
        })?;
    }

    let counts = guarded(|| Ok(plugin.channel_counts())).map_err(|fault| {
        PluginLoadError::PrepareFailed {
            plugin: name.clone(),
            reason: fault.to_string(),
        }
    })?;

    safety_check(plugin.as_mut(), &name, layout, counts, max_block)?;

    let reported = guarded(|| Ok(plugin.latency_samples())).unwrap_or(0);
    let latency = if reported as usize > MAX_LATENCY_SAMPLES {
        log::warn!(
            "[PLUGIN] '{}' reports {} samples latency, clamping to {}",
            name,
            reported,
            MAX_LATENCY_SAMPLES
        );
        MAX_LATENCY_SAMPLES as u32
    } else {
        reported
    };

    Ok(PreparedPlugin {
        plugin,
        description,
        layout,
        counts,
        latency,
    })
}

/// Try each preferred layout until `prepare` succeeds
fn negotiate_layout(
    plugin: &mut dyn HostedPlugin,
    name: &str,
    sample_rate: f64,
    max_block: usize,
) -> PluginLoadResult<ChannelLayout> {
    let mut last_failure = None;

    for layout in LAYOUT_PREFERENCES {
        let supported = panic::catch_unwind(AssertUnwindSafe(|| plugin.supports_layout(layout)))
            .unwrap_or(false);
        if !supported {
            continue;
        }

        match guarded(|| plugin.prepare(sample_rate, max_block, layout)) {
            Ok(()) => {
                log::debug!("[PLUGIN] '{}' prepared with {:?}", name, layout);
                return Ok(layout);
            }
            Err(fault) => last_failure = Some(fault),
        }
    }

    match last_failure {
        Some(fault) => Err(PluginLoadError::PrepareFailed {
            plugin: name.to_string(),
            reason: fault.to_string(),
        }),
        None => Err(PluginLoadError::NoSupportedLayout {
            plugin: name.to_string(),
        }),
    }
}

/// Render the three synthetic safety blocks
///
/// Each pass feeds silence plus the pass's events and requires an `Ok`
/// return with finite samples on every channel the plugin touches. Blocks
/// never exceed the `max_block` the plugin was prepared with.
pub fn safety_check(
    plugin: &mut dyn HostedPlugin,
    name: &str,
    layout: ChannelLayout,
    counts: ChannelCounts,
    max_block: usize,
) -> PluginLoadResult<()> {
    let channels = counts.scratch_channels(layout).max(2);
    let frames = SAFETY_BLOCK_FRAMES.min(max_block).max(1);
    let mut scratch = PlanarBuffer::new(channels, frames);

    let passes = [
        (SafetyPass::NoteOn, Some(MidiEvent::note_on(0, 60, 100))),
        (SafetyPass::NoteOff, Some(MidiEvent::note_off(0, 60))),
        (SafetyPass::Silence, None),
    ];

    for (pass, event) in passes {
        scratch.clear(frames);
        let events: &[MidiEvent] = match &event {
            Some(event) => std::slice::from_ref(event),
            None => &[],
        };

        let mut block = scratch.block(channels, frames);
        let result = guarded(|| plugin.process(&mut block, events)).and_then(|()| {
            if block.is_finite() {
                Ok(())
            } else {
                Err(Fault::NonFiniteOutput)
            }
        });

        if let Err(fault) = result {
            log::warn!("[PLUGIN] '{}' rejected: {} pass {}", name, pass, fault);
            return Err(PluginLoadError::SafetyCheckFailed {
                plugin: name.to_string(),
                pass,
                reason: fault.to_string(),
            });
        }
    }

    Ok(())
}
