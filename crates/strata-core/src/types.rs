//! Common types for Strata
//!
//! Fundamental audio types shared by every part of the engine: stereo
//! samples and buffers for the mix path, planar multi-channel scratch for
//! hosted plugins, and the per-block context handed down from device I/O.

use std::ops::{Index, IndexMut};

/// Default sample rate (48kHz); the real rate arrives with each [`BlockContext`].
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Maximum number of tracks in one graph (also the job table capacity)
pub const MAX_TRACKS: usize = 128;

/// Number of auxiliary (send/return) buses
pub const NUM_AUX_BUSES: usize = 4;

/// Number of insert plugin slots per track
pub const MAX_INSERT_SLOTS: usize = 4;

/// Largest block size the engine will pre-allocate for
pub const MAX_BLOCK_SIZE: usize = 8192;

/// Upper bound on plugin delay compensation (1 s at 192kHz)
pub const MAX_LATENCY_SAMPLES: usize = 192_000;

/// Audio sample type
pub type Sample = f32;

/// Per-block processing context
///
/// Produced by the device layer once per callback and immutable for the
/// duration of the block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockContext {
    /// Number of frames in this block
    pub frames: usize,
    /// Sample rate in Hz
    pub sample_rate: f64,
    /// Rendering faster or slower than real time (bounce/export)
    pub offline: bool,
    /// Device asked for the lowest possible latency
    pub low_latency: bool,
}

impl BlockContext {
    /// Create a real-time context
    pub fn new(frames: usize, sample_rate: f64) -> Self {
        Self {
            frames,
            sample_rate,
            offline: false,
            low_latency: false,
        }
    }

    /// Mark the block as an offline render
    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    /// Mark the block as low-latency
    pub fn low_latency(mut self) -> Self {
        self.low_latency = true;
        self
    }
}

/// A single stereo sample (left and right channels)
///
/// `#[repr(C)]` keeps the layout `[left, right]`, so a `&[StereoSample]` can be
/// viewed as interleaved `&[f32]` through bytemuck at the device boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    /// Create a new stereo sample
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    /// Create a silent stereo sample
    #[inline]
    pub fn silence() -> Self {
        Self::default()
    }

    /// Create a mono sample (same value in both channels)
    #[inline]
    pub fn mono(value: Sample) -> Self {
        Self {
            left: value,
            right: value,
        }
    }

    /// Get the peak amplitude (max of abs(left), abs(right))
    #[inline]
    pub fn peak(&self) -> Sample {
        self.left.abs().max(self.right.abs())
    }
}

impl std::ops::Add for StereoSample {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self {
            left: self.left + other.left,
            right: self.right + other.right,
        }
    }
}

impl std::ops::AddAssign for StereoSample {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.left += other.left;
        self.right += other.right;
    }
}

impl std::ops::Mul<Sample> for StereoSample {
    type Output = Self;

    #[inline]
    fn mul(self, factor: Sample) -> Self {
        Self {
            left: self.left * factor,
            right: self.right * factor,
        }
    }
}

impl std::ops::MulAssign<Sample> for StereoSample {
    #[inline]
    fn mul_assign(&mut self, factor: Sample) {
        self.left *= factor;
        self.right *= factor;
    }
}

/// A buffer of stereo samples
///
/// The mix-path buffer type: track main/send outputs, aux buses, master.
/// Buffers are allocated once at `prepare` time with enough capacity for the
/// largest block, then resized within that capacity on the audio thread.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StereoBuffer {
    samples: Vec<StereoSample>,
}

impl StereoBuffer {
    /// Create an empty buffer with the specified capacity (in stereo samples)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    /// Create a buffer filled with silence
    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![StereoSample::silence(); len],
        }
    }

    /// Create a buffer from interleaved samples [L, R, L, R, ...]
    pub fn from_interleaved(interleaved: &[Sample]) -> Self {
        assert!(interleaved.len() % 2 == 0, "Interleaved buffer must have even length");
        let samples = interleaved
            .chunks_exact(2)
            .map(|chunk| StereoSample::new(chunk[0], chunk[1]))
            .collect();
        Self { samples }
    }

    /// Create a buffer from an existing Vec of StereoSamples
    pub fn from_vec(samples: Vec<StereoSample>) -> Self {
        Self { samples }
    }

    /// Number of stereo samples in the buffer
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if the buffer is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Allocated capacity in stereo samples
    #[inline]
    pub fn capacity(&self) -> usize {
        self.samples.capacity()
    }

    /// Grow the allocation so at least `capacity` samples fit (control thread only)
    pub fn reserve_total(&mut self, capacity: usize) {
        if capacity > self.samples.capacity() {
            self.samples.reserve_exact(capacity - self.samples.len());
        }
    }

    /// Set the working length of a pre-allocated buffer (real-time safe)
    ///
    /// Fills any newly exposed elements with silence. Callers must only
    /// grow within the capacity reserved at prepare time.
    #[inline]
    pub fn set_len_from_capacity(&mut self, new_len: usize) {
        let current_len = self.samples.len();
        if new_len > current_len {
            debug_assert!(
                new_len <= self.samples.capacity(),
                "set_len_from_capacity called with len > capacity"
            );
            self.samples.resize(new_len, StereoSample::silence());
        } else {
            self.samples.truncate(new_len);
        }
    }

    /// Fill the buffer with silence
    pub fn fill_silence(&mut self) {
        self.samples.fill(StereoSample::silence());
    }

    /// Get a slice of the samples
    #[inline]
    pub fn as_slice(&self) -> &[StereoSample] {
        &self.samples
    }

    /// Get a mutable slice of the samples
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [StereoSample] {
        &mut self.samples
    }

    /// Zero-copy view of the samples as interleaved f32 [L, R, L, R, ...]
    #[inline]
    pub fn as_interleaved(&self) -> &[Sample] {
        bytemuck::cast_slice(&self.samples)
    }

    /// Zero-copy mutable view of the samples as interleaved f32
    #[inline]
    pub fn as_interleaved_mut(&mut self) -> &mut [Sample] {
        bytemuck::cast_slice_mut(&mut self.samples)
    }

    /// Add another buffer to this one, sample by sample over the shorter length
    pub fn add_buffer(&mut self, other: &StereoBuffer) {
        for (dst, src) in self.samples.iter_mut().zip(other.samples.iter()) {
            *dst += *src;
        }
    }

    /// Add another buffer scaled by `gain`
    pub fn add_scaled(&mut self, other: &StereoBuffer, gain: Sample) {
        for (dst, src) in self.samples.iter_mut().zip(other.samples.iter()) {
            *dst += *src * gain;
        }
    }

    /// Scale all samples by a factor
    pub fn scale(&mut self, factor: Sample) {
        for sample in &mut self.samples {
            *sample *= factor;
        }
    }

    /// Copy from another buffer (real-time safe if pre-allocated)
    ///
    /// The length of `self` becomes the length of `other`. Never allocates
    /// when `self.capacity() >= other.len()`.
    pub fn copy_from(&mut self, other: &StereoBuffer) {
        let len = other.samples.len();
        debug_assert!(
            len <= self.samples.capacity(),
            "copy_from: insufficient capacity ({} < {})",
            self.samples.capacity(),
            len
        );
        if self.samples.len() > len {
            self.samples.truncate(len);
        } else if self.samples.len() < len {
            self.samples.resize(len, StereoSample::silence());
        }
        self.samples[..len].copy_from_slice(&other.samples[..len]);
    }

    /// Overwrite this buffer's contents with `other`, keeping this buffer's length
    ///
    /// Samples past the end of `other` are silenced.
    pub fn replay_from(&mut self, other: &StereoBuffer) {
        let n = self.samples.len().min(other.samples.len());
        self.samples[..n].copy_from_slice(&other.samples[..n]);
        self.samples[n..].fill(StereoSample::silence());
    }

    /// Get an iterator over the samples
    pub fn iter(&self) -> impl Iterator<Item = &StereoSample> {
        self.samples.iter()
    }

    /// Get a mutable iterator over the samples
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StereoSample> {
        self.samples.iter_mut()
    }

    /// Get the peak amplitude in the buffer
    pub fn peak(&self) -> Sample {
        self.samples.iter().map(|s| s.peak()).fold(0.0, Sample::max)
    }
}

impl Index<usize> for StereoBuffer {
    type Output = StereoSample;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.samples[index]
    }
}

impl IndexMut<usize> for StereoBuffer {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.samples[index]
    }
}

/// Planar multi-channel scratch used to drive hosted plugins
///
/// Each channel is a separately allocated `Vec<f32>` so plugins with extra
/// output buses (sidechain, multi-out instruments) get as many channels as
/// they declare. Sized on the control thread, reused on the audio thread.
#[derive(Debug, Clone, Default)]
pub struct PlanarBuffer {
    channels: Vec<Vec<Sample>>,
    frame_capacity: usize,
}

impl PlanarBuffer {
    /// Allocate `channels` × `frames` of silence
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            channels: (0..channels).map(|_| vec![0.0; frames]).collect(),
            frame_capacity: frames,
        }
    }

    /// Number of allocated channels
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Frames available in every channel
    #[inline]
    pub fn frame_capacity(&self) -> usize {
        self.frame_capacity
    }

    /// Whether a block of `channels` × `frames` fits without allocating
    #[inline]
    pub fn fits(&self, channels: usize, frames: usize) -> bool {
        channels <= self.channels.len() && frames <= self.frame_capacity
    }

    /// Reallocate to exactly `channels` × `frames` (control thread only)
    pub fn resize(&mut self, channels: usize, frames: usize) {
        self.channels.resize_with(channels, Vec::new);
        for channel in &mut self.channels {
            channel.clear();
            channel.resize(frames, 0.0);
        }
        self.frame_capacity = frames;
    }

    /// Zero the first `frames` samples of every channel
    pub fn clear(&mut self, frames: usize) {
        let frames = frames.min(self.frame_capacity);
        for channel in &mut self.channels {
            channel[..frames].fill(0.0);
        }
    }

    /// Borrow one channel
    #[inline]
    pub fn channel(&self, index: usize) -> &[Sample] {
        &self.channels[index]
    }

    /// Borrow one channel mutably
    #[inline]
    pub fn channel_mut(&mut self, index: usize) -> &mut [Sample] {
        &mut self.channels[index]
    }

    /// Borrow the first two channels mutably at the same time
    #[inline]
    pub fn stereo_mut(&mut self, frames: usize) -> (&mut [Sample], &mut [Sample]) {
        let (left, rest) = self.channels.split_at_mut(1);
        (&mut left[0][..frames], &mut rest[0][..frames])
    }

    /// Add the first `frames` of channel `src` into channel `dst`
    pub fn add_channel_into(&mut self, src: usize, dst: usize, frames: usize) {
        if src == dst {
            return;
        }
        let frames = frames.min(self.frame_capacity);
        let (src_ch, dst_ch) = if src < dst {
            let (head, tail) = self.channels.split_at_mut(dst);
            (&head[src], &mut tail[0])
        } else {
            let (head, tail) = self.channels.split_at_mut(src);
            (&tail[0], &mut head[dst])
        };
        for (d, s) in dst_ch[..frames].iter_mut().zip(src_ch[..frames].iter()) {
            *d += *s;
        }
    }

    /// Peak absolute value of the first `frames` of one channel
    pub fn channel_peak(&self, index: usize, frames: usize) -> Sample {
        let frames = frames.min(self.frame_capacity);
        self.channels[index][..frames]
            .iter()
            .fold(0.0, |peak, s| peak.max(s.abs()))
    }

    /// View `channels` × `frames` as a block for a plugin call
    #[inline]
    pub fn block(&mut self, channels: usize, frames: usize) -> AudioBlock<'_> {
        let channels = channels.min(self.channels.len());
        AudioBlock {
            channels: &mut self.channels[..channels],
            frames: frames.min(self.frame_capacity),
        }
    }
}

/// In-place planar audio handed to a plugin's `process`
///
/// Inputs occupy the first channels on entry; the plugin overwrites the
/// same channels (and any extra output channels) with its output.
pub struct AudioBlock<'a> {
    channels: &'a mut [Vec<Sample>],
    frames: usize,
}

impl<'a> AudioBlock<'a> {
    /// Frames in this block
    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Channels visible to the plugin
    #[inline]
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Read one channel
    #[inline]
    pub fn channel(&self, index: usize) -> &[Sample] {
        &self.channels[index][..self.frames]
    }

    /// Write one channel
    #[inline]
    pub fn channel_mut(&mut self, index: usize) -> &mut [Sample] {
        &mut self.channels[index][..self.frames]
    }

    /// Write the first two channels at once (block must have at least two)
    #[inline]
    pub fn stereo_mut(&mut self) -> (&mut [Sample], &mut [Sample]) {
        let frames = self.frames;
        let (left, rest) = self.channels.split_at_mut(1);
        (&mut left[0][..frames], &mut rest[0][..frames])
    }

    /// True when every visible sample is finite
    pub fn is_finite(&self) -> bool {
        self.channels
            .iter()
            .all(|ch| ch[..self.frames].iter().all(|s| s.is_finite()))
    }
}
