//! Lock-free track controls
//!
//! Every user-facing track parameter is its own atomic so the UI thread can
//! write and the audio thread can read without ever sharing a lock. There
//! is deliberately no cross-field consistency: the audio thread may see a
//! new volume with an old pan for one block, and the per-block gain ramps
//! absorb any such tear. All accesses use `Relaxed` ordering.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::effect::EFFECT_MASK_ALL;
use crate::types::NUM_AUX_BUSES;

/// `f32` stored as its bit pattern in an `AtomicU32`
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Where the send is tapped from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    /// Before volume and pan
    PreFader,
    /// After the volume ramp, before pan
    #[default]
    PostFader,
    /// After volume and pan
    PostPan,
}

impl SendMode {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SendMode::PreFader,
            2 => SendMode::PostPan,
            _ => SendMode::PostFader,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SendMode::PreFader => 0,
            SendMode::PostFader => 1,
            SendMode::PostPan => 2,
        }
    }
}

/// Where live monitored input joins the track signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorTap {
    /// Before the insert chain, processed by inserts, bank and EQ
    #[default]
    Processed,
    /// After inserts and the effect bank, before EQ
    PostInsert,
    /// After EQ, bypassing every effect
    Dry,
}

impl MonitorTap {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => MonitorTap::PostInsert,
            2 => MonitorTap::Dry,
            _ => MonitorTap::Processed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            MonitorTap::Processed => 0,
            MonitorTap::PostInsert => 1,
            MonitorTap::Dry => 2,
        }
    }
}

/// Destination of a track's main output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputTarget {
    #[default]
    Master,
    Aux(usize),
}

impl OutputTarget {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => OutputTarget::Master,
            n if (n as usize) <= NUM_AUX_BUSES => OutputTarget::Aux(n as usize - 1),
            _ => OutputTarget::Master,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            OutputTarget::Master => 0,
            OutputTarget::Aux(bus) if bus < NUM_AUX_BUSES => bus as u8 + 1,
            OutputTarget::Aux(_) => 0,
        }
    }
}

/// Per-channel meter readings
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeterReading {
    pub peak_l: f32,
    pub peak_r: f32,
    pub rms_l: f32,
    pub rms_r: f32,
}

/// Atomic state shared between the control thread and the audio thread
#[derive(Debug)]
pub struct TrackControls {
    /// Linear fader gain
    volume: AtomicF32,
    /// -1 (left) to 1 (right)
    pan: AtomicF32,
    /// Linear send gain
    send_level: AtomicF32,
    send_mode: AtomicU8,
    send_target: AtomicU8,
    send_enabled: AtomicBool,
    output_target: AtomicU8,
    mute: AtomicBool,
    solo: AtomicBool,
    arm: AtomicBool,
    monitor: AtomicBool,
    monitor_tap: AtomicU8,
    safe_monitoring: AtomicBool,
    frozen: AtomicBool,
    eq_enabled: AtomicBool,
    eq_low_db: AtomicF32,
    eq_mid_db: AtomicF32,
    eq_high_db: AtomicF32,
    effect_mask: AtomicU32,
    /// Total plugin latency reported by the audio thread
    latency: AtomicU32,
    peak_l: AtomicF32,
    peak_r: AtomicF32,
    rms_l: AtomicF32,
    rms_r: AtomicF32,
}

impl TrackControls {
    pub fn new() -> Self {
        Self {
            volume: AtomicF32::new(1.0),
            pan: AtomicF32::new(0.0),
            send_level: AtomicF32::new(0.0),
            send_mode: AtomicU8::new(SendMode::default().as_u8()),
            send_target: AtomicU8::new(0),
            send_enabled: AtomicBool::new(false),
            output_target: AtomicU8::new(0),
            mute: AtomicBool::new(false),
            solo: AtomicBool::new(false),
            arm: AtomicBool::new(false),
            monitor: AtomicBool::new(false),
            monitor_tap: AtomicU8::new(0),
            safe_monitoring: AtomicBool::new(true),
            frozen: AtomicBool::new(false),
            eq_enabled: AtomicBool::new(false),
            eq_low_db: AtomicF32::new(0.0),
            eq_mid_db: AtomicF32::new(0.0),
            eq_high_db: AtomicF32::new(0.0),
            effect_mask: AtomicU32::new(0),
            latency: AtomicU32::new(0),
            peak_l: AtomicF32::new(0.0),
            peak_r: AtomicF32::new(0.0),
            rms_l: AtomicF32::new(0.0),
            rms_r: AtomicF32::new(0.0),
        }
    }

    #[inline]
    pub fn volume(&self) -> f32 {
        self.volume.load()
    }

    /// Set the fader gain (linear, clamped to 0 - 4)
    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_finite() { volume.clamp(0.0, 4.0) } else { 0.0 };
        self.volume.store(volume);
    }

    #[inline]
    pub fn pan(&self) -> f32 {
        self.pan.load()
    }

    pub fn set_pan(&self, pan: f32) {
        let pan = if pan.is_finite() { pan.clamp(-1.0, 1.0) } else { 0.0 };
        self.pan.store(pan);
    }

    #[inline]
    pub fn send_level(&self) -> f32 {
        self.send_level.load()
    }

    pub fn set_send_level(&self, level: f32) {
        let level = if level.is_finite() { level.clamp(0.0, 4.0) } else { 0.0 };
        self.send_level.store(level);
    }

    #[inline]
    pub fn send_mode(&self) -> SendMode {
        SendMode::from_u8(self.send_mode.load(Ordering::Relaxed))
    }

    pub fn set_send_mode(&self, mode: SendMode) {
        self.send_mode.store(mode.as_u8(), Ordering::Relaxed);
    }

    /// Aux bus the send feeds (0 - 3)
    #[inline]
    pub fn send_target(&self) -> usize {
        (self.send_target.load(Ordering::Relaxed) as usize).min(NUM_AUX_BUSES - 1)
    }

    pub fn set_send_target(&self, bus: usize) {
        self.send_target
            .store(bus.min(NUM_AUX_BUSES - 1) as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn send_enabled(&self) -> bool {
        self.send_enabled.load(Ordering::Relaxed)
    }

    pub fn set_send_enabled(&self, enabled: bool) {
        self.send_enabled.store(enabled, Ordering::Relaxed);
    }

    #[inline]
    pub fn output_target(&self) -> OutputTarget {
        OutputTarget::from_u8(self.output_target.load(Ordering::Relaxed))
    }

    pub fn set_output_target(&self, target: OutputTarget) {
        self.output_target.store(target.as_u8(), Ordering::Relaxed);
    }

    #[inline]
    pub fn is_muted(&self) -> bool {
        self.mute.load(Ordering::Relaxed)
    }

    pub fn set_mute(&self, mute: bool) {
        self.mute.store(mute, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_soloed(&self) -> bool {
        self.solo.load(Ordering::Relaxed)
    }

    pub fn set_solo(&self, solo: bool) {
        self.solo.store(solo, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.arm.load(Ordering::Relaxed)
    }

    pub fn set_arm(&self, arm: bool) {
        self.arm.store(arm, Ordering::Relaxed);
    }

    /// Input monitoring switch
    #[inline]
    pub fn is_monitoring(&self) -> bool {
        self.monitor.load(Ordering::Relaxed)
    }

    pub fn set_monitor(&self, monitor: bool) {
        self.monitor.store(monitor, Ordering::Relaxed);
    }

    #[inline]
    pub fn monitor_tap(&self) -> MonitorTap {
        MonitorTap::from_u8(self.monitor_tap.load(Ordering::Relaxed))
    }

    pub fn set_monitor_tap(&self, tap: MonitorTap) {
        self.monitor_tap.store(tap.as_u8(), Ordering::Relaxed);
    }

    #[inline]
    pub fn safe_monitoring(&self) -> bool {
        self.safe_monitoring.load(Ordering::Relaxed)
    }

    pub fn set_safe_monitoring(&self, safe: bool) {
        self.safe_monitoring.store(safe, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Relaxed)
    }

    pub fn set_frozen(&self, frozen: bool) {
        self.frozen.store(frozen, Ordering::Relaxed);
    }

    #[inline]
    pub fn eq_enabled(&self) -> bool {
        self.eq_enabled.load(Ordering::Relaxed)
    }

    pub fn set_eq_enabled(&self, enabled: bool) {
        self.eq_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Low, mid and high band gains in dB
    #[inline]
    pub fn eq_gains_db(&self) -> [f32; 3] {
        [self.eq_low_db.load(), self.eq_mid_db.load(), self.eq_high_db.load()]
    }

    pub fn set_eq_gains_db(&self, low: f32, mid: f32, high: f32) {
        self.eq_low_db.store(low);
        self.eq_mid_db.store(mid);
        self.eq_high_db.store(high);
    }

    /// Enabled built-in effect stages (see [`crate::effect::EffectKind::bit`])
    #[inline]
    pub fn effect_mask(&self) -> u32 {
        self.effect_mask.load(Ordering::Relaxed)
    }

    pub fn set_effect_mask(&self, mask: u32) {
        self.effect_mask.store(mask & EFFECT_MASK_ALL, Ordering::Relaxed);
    }

    /// Turn one stage on or off without disturbing the others
    pub fn set_effect_enabled(&self, bit: u32, enabled: bool) {
        if enabled {
            self.effect_mask.fetch_or(bit & EFFECT_MASK_ALL, Ordering::Relaxed);
        } else {
            self.effect_mask.fetch_and(!bit, Ordering::Relaxed);
        }
    }

    /// Plugin latency in samples, as last reported by the audio thread
    #[inline]
    pub fn latency(&self) -> u32 {
        self.latency.load(Ordering::Relaxed)
    }

    pub(crate) fn set_latency(&self, samples: u32) {
        self.latency.store(samples, Ordering::Relaxed);
    }

    /// Current meter values
    pub fn meters(&self) -> MeterReading {
        MeterReading {
            peak_l: self.peak_l.load(),
            peak_r: self.peak_r.load(),
            rms_l: self.rms_l.load(),
            rms_r: self.rms_r.load(),
        }
    }

    pub(crate) fn store_meters(&self, peak_l: f32, peak_r: f32, rms_l: f32, rms_r: f32) {
        self.peak_l.store(peak_l);
        self.peak_r.store(peak_r);
        self.rms_l.store(rms_l);
        self.rms_r.store(rms_r);
    }
}

impl Default for TrackControls {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let controls = TrackControls::new();
        assert_eq!(controls.volume(), 1.0);
        assert_eq!(controls.pan(), 0.0);
        assert_eq!(controls.send_mode(), SendMode::PostFader);
        assert_eq!(controls.output_target(), OutputTarget::Master);
        assert_eq!(controls.monitor_tap(), MonitorTap::Processed);
        assert!(controls.safe_monitoring());
        assert!(!controls.is_muted());
    }

    #[test]
    fn test_enums_round_trip() {
        let controls = TrackControls::new();
        for mode in [SendMode::PreFader, SendMode::PostFader, SendMode::PostPan] {
            controls.set_send_mode(mode);
            assert_eq!(controls.send_mode(), mode);
        }
        for tap in [MonitorTap::Processed, MonitorTap::PostInsert, MonitorTap::Dry] {
            controls.set_monitor_tap(tap);
            assert_eq!(controls.monitor_tap(), tap);
        }
        for target in [OutputTarget::Master, OutputTarget::Aux(0), OutputTarget::Aux(3)] {
            controls.set_output_target(target);
            assert_eq!(controls.output_target(), target);
        }
        controls.set_output_target(OutputTarget::Aux(9));
        assert_eq!(controls.output_target(), OutputTarget::Master);
    }

    #[test]
    fn test_values_are_sanitized() {
        let controls = TrackControls::new();
        controls.set_volume(f32::NAN);
        assert_eq!(controls.volume(), 0.0);
        controls.set_pan(7.0);
        assert_eq!(controls.pan(), 1.0);
        controls.set_send_target(12);
        assert_eq!(controls.send_target(), NUM_AUX_BUSES - 1);
        controls.set_effect_mask(u32::MAX);
        assert_eq!(controls.effect_mask(), EFFECT_MASK_ALL);
    }

    #[test]
    fn test_effect_toggle() {
        let controls = TrackControls::new();
        controls.set_effect_enabled(1 << 6, true);
        controls.set_effect_enabled(1 << 7, true);
        controls.set_effect_enabled(1 << 6, false);
        assert_eq!(controls.effect_mask(), 1 << 7);
    }
}
