// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Remoterack Plugin API
//!
//! This crate defines the interface between the remoterack processing core
//! and hosted audio plugins. Format adapters (VST, VST3, AudioUnit) live
//! behind the plugin catalog and hand the core boxed [`AudioPlugin`]
//! implementations; the core never touches a plugin SDK directly.
//!
//! # Example plugin
//!
//! ```ignore
//! use remoterack_plugin_api::*;
//!
//! pub struct Gain {
//!     gain: f32,
//!     layout: BusesLayout,
//! }
//!
//! impl AudioPlugin for Gain {
//!     fn name(&self) -> &str {
//!         "Gain"
//!     }
//!
//!     fn process_f32(&mut self, buffer: &mut AudioBuffer<f32>, _midi: &mut MidiBuffer) {
//!         for ch in 0..buffer.num_channels() {
//!             for s in buffer.channel_mut(ch) {
//!                 *s *= self.gain;
//!             }
//!         }
//!     }
//!     // ... implement the remaining methods
//! }
//! ```

#![warn(missing_docs)]

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Samples & audio buffers
// ============================================================================

/// Sample type processed by the core. Implemented for `f32` and `f64`.
pub trait Sample: Copy + Default + PartialEq + Send + Sync + 'static {
    /// Silence.
    const ZERO: Self;

    /// Lossless widening to `f64` (used when bridging precisions).
    fn to_f64(self) -> f64;

    /// Narrowing from `f64`.
    fn from_f64(v: f64) -> Self;
}

impl Sample for f32 {
    const ZERO: Self = 0.0;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl Sample for f64 {
    const ZERO: Self = 0.0;

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(v: f64) -> Self {
        v
    }
}

/// A non-interleaved block of audio: `channels x samples`.
///
/// The block a worker hands the chain is shared by every plugin in turn, so
/// the buffer is plain owned storage with cheap channel views rather than a
/// borrowed slice-of-slices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioBuffer<S> {
    channels: Vec<Vec<S>>,
    num_samples: usize,
}

impl<S: Sample> AudioBuffer<S> {
    /// Create a silent buffer with the given dimensions.
    pub fn new(num_channels: usize, num_samples: usize) -> Self {
        Self {
            channels: vec![vec![S::ZERO; num_samples]; num_channels],
            num_samples,
        }
    }

    /// Build a buffer from per-channel sample vectors.
    ///
    /// Shorter channels are zero-padded to the longest one so the buffer
    /// stays rectangular.
    pub fn from_channels(mut channels: Vec<Vec<S>>) -> Self {
        let num_samples = channels.iter().map(Vec::len).max().unwrap_or(0);
        for ch in &mut channels {
            ch.resize(num_samples, S::ZERO);
        }
        Self {
            channels,
            num_samples,
        }
    }

    /// Number of channels.
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Number of samples per channel.
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Immutable view of one channel.
    pub fn channel(&self, index: usize) -> &[S] {
        &self.channels[index]
    }

    /// Mutable view of one channel.
    pub fn channel_mut(&mut self, index: usize) -> &mut [S] {
        &mut self.channels[index]
    }

    /// Zero every sample.
    pub fn clear(&mut self) {
        for ch in &mut self.channels {
            ch.fill(S::ZERO);
        }
    }

    /// Zero a single channel.
    pub fn clear_channel(&mut self, index: usize) {
        self.channels[index].fill(S::ZERO);
    }

    /// Grow or shrink to the given dimensions, zero-filling new space.
    pub fn resize(&mut self, num_channels: usize, num_samples: usize) {
        self.channels
            .resize_with(num_channels, || vec![S::ZERO; num_samples]);
        for ch in &mut self.channels {
            ch.resize(num_samples, S::ZERO);
        }
        self.num_samples = num_samples;
    }

    /// Copy one channel of `src` into one channel of `self`.
    ///
    /// Copies `min(src len, dst len)` samples.
    pub fn copy_channel_from(&mut self, dst: usize, src_buffer: &AudioBuffer<S>, src: usize) {
        let n = self.num_samples.min(src_buffer.num_samples);
        self.channels[dst][..n].copy_from_slice(&src_buffer.channels[src][..n]);
    }

    /// Convert into a buffer of another sample type, through `f64`.
    pub fn convert<T: Sample>(&self) -> AudioBuffer<T> {
        let channels = self
            .channels
            .iter()
            .map(|ch| ch.iter().map(|s| T::from_f64(s.to_f64())).collect())
            .collect();
        AudioBuffer {
            channels,
            num_samples: self.num_samples,
        }
    }

    /// Overwrite from another buffer of a possibly different sample type.
    ///
    /// Dimensions are clamped to the smaller of the two buffers.
    pub fn convert_from<T: Sample>(&mut self, other: &AudioBuffer<T>) {
        let channels = self.channels.len().min(other.channels.len());
        let samples = self.num_samples.min(other.num_samples);
        for c in 0..channels {
            for s in 0..samples {
                self.channels[c][s] = S::from_f64(other.channels[c][s].to_f64());
            }
        }
    }
}

// ============================================================================
// MIDI
// ============================================================================

/// One MIDI event with its sample offset inside the block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiEvent {
    /// Sample offset within the current block.
    pub offset: u32,
    /// Raw MIDI bytes (status + data; sysex allowed).
    pub data: Vec<u8>,
}

impl MidiEvent {
    /// Create an event from raw bytes.
    pub fn new(offset: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            offset,
            data: data.into(),
        }
    }
}

/// Ordered MIDI events for one block. Plugins may consume and emit events
/// in place; the buffer flows through the whole chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiBuffer {
    events: Vec<MidiEvent>,
}

impl MidiBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    pub fn push(&mut self, event: MidiEvent) {
        self.events.push(event);
    }

    /// Iterate events in order.
    pub fn iter(&self) -> impl Iterator<Item = &MidiEvent> {
        self.events.iter()
    }

    /// Drop all events.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the buffer holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Replace the contents with another buffer's events.
    pub fn replace_with(&mut self, other: MidiBuffer) {
        self.events = other.events;
    }
}

// ============================================================================
// Transport & play head
// ============================================================================

/// Host transport state for one block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transport {
    /// Whether the host timeline is running.
    pub playing: bool,
    /// Whether the host is recording.
    pub recording: bool,
    /// Whether the host loops the current region.
    pub looping: bool,
    /// Tempo in beats per minute.
    pub tempo_bpm: f64,
    /// Time signature numerator.
    pub time_sig_numerator: u32,
    /// Time signature denominator.
    pub time_sig_denominator: u32,
    /// Timeline position in samples.
    pub sample_position: i64,
    /// Timeline position in quarter notes.
    pub ppq_position: f64,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            playing: false,
            recording: false,
            looping: false,
            tempo_bpm: 120.0,
            time_sig_numerator: 4,
            time_sig_denominator: 4,
            sample_position: 0,
            ppq_position: 0.0,
        }
    }
}

/// Shared transport handle installed into plugins.
///
/// The session worker stores the transport of every incoming frame here
/// before dispatching the block; plugins read it during processing.
#[derive(Debug, Clone, Default)]
pub struct PlayHead {
    inner: Arc<Mutex<Transport>>,
}

impl PlayHead {
    /// Create a play head at the default (stopped) transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current transport snapshot.
    pub fn get(&self) -> Transport {
        *self.inner.lock()
    }

    /// Publish a new transport state.
    pub fn set(&self, transport: Transport) {
        *self.inner.lock() = transport;
    }
}

// ============================================================================
// Channel sets & bus layouts
// ============================================================================

/// Channel configuration of one bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelSet {
    /// Single channel.
    Mono,
    /// Two channels.
    Stereo,
    /// N discrete channels.
    Discrete(u32),
}

impl ChannelSet {
    /// Build the conventional set for a channel count (1 = mono,
    /// 2 = stereo, otherwise discrete-N).
    pub fn for_channels(count: u32) -> Self {
        match count {
            1 => Self::Mono,
            2 => Self::Stereo,
            n => Self::Discrete(n),
        }
    }

    /// Number of channels in the set.
    pub fn count(&self) -> u32 {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
            Self::Discrete(n) => *n,
        }
    }
}

/// Ordered input and output buses of a plugin or a session.
///
/// Bus 0 is the main bus; input bus 1, when present, is the sidechain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusesLayout {
    /// Input buses, main first.
    pub inputs: Vec<ChannelSet>,
    /// Output buses, main first.
    pub outputs: Vec<ChannelSet>,
}

impl BusesLayout {
    /// Main input bus, if any.
    pub fn main_input(&self) -> Option<ChannelSet> {
        self.inputs.first().copied()
    }

    /// Main output bus, if any.
    pub fn main_output(&self) -> Option<ChannelSet> {
        self.outputs.first().copied()
    }

    /// Sidechain bus (input bus 1), if any.
    pub fn sidechain(&self) -> Option<ChannelSet> {
        self.inputs.get(1).copied()
    }

    /// Channel count of the main input bus (0 when absent).
    pub fn main_input_channels(&self) -> u32 {
        self.main_input().map_or(0, |b| b.count())
    }

    /// Channel count of the main output bus (0 when absent).
    pub fn main_output_channels(&self) -> u32 {
        self.main_output().map_or(0, |b| b.count())
    }

    /// Total channels across all input buses.
    pub fn total_input_channels(&self) -> u32 {
        self.inputs.iter().map(ChannelSet::count).sum()
    }

    /// Total channels across all output buses.
    pub fn total_output_channels(&self) -> u32 {
        self.outputs.iter().map(ChannelSet::count).sum()
    }

    /// Channels of input buses past the main one.
    pub fn extra_input_channels(&self) -> u32 {
        self.inputs.iter().skip(1).map(ChannelSet::count).sum()
    }

    /// Channels of output buses past the main one.
    pub fn extra_output_channels(&self) -> u32 {
        self.outputs.iter().skip(1).map(ChannelSet::count).sum()
    }
}

// ============================================================================
// Processing precision
// ============================================================================

/// Precision a plugin is asked to process at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    /// 32-bit float samples.
    Single,
    /// 64-bit float samples.
    Double,
}

// ============================================================================
// Parameter listeners
// ============================================================================

/// Sink for parameter-change notifications from a hosted plugin.
///
/// Callbacks may arrive on arbitrary SDK threads, including after the
/// owning wrapper started unloading; implementations must not assume the
/// plugin is still present.
pub trait ParameterListener: Send + Sync {
    /// A parameter's normalized value changed.
    fn parameter_changed(&self, index: usize, value: f32);
}

// ============================================================================
// The hosted plugin
// ============================================================================

/// A loaded plugin instance as seen by the processing core.
///
/// The catalog creates these on the message thread; the core drives the
/// lifecycle (`prepare_to_play` / `release_resources` / suspension) and
/// pumps blocks through `process_f32` / `process_f64`.
pub trait AudioPlugin: Send {
    /// Human-readable plugin name.
    fn name(&self) -> &str;

    /// Allocate processing resources for the given rate and block size.
    fn prepare_to_play(&mut self, sample_rate: f64, block_size: usize);

    /// Release processing resources. The plugin may be re-prepared later.
    fn release_resources(&mut self);

    /// Enter or leave suspended (bypassed) state.
    fn suspend_processing(&mut self, _suspended: bool) {}

    /// Process one block of 32-bit audio, consuming and emitting MIDI in
    /// place.
    fn process_f32(&mut self, buffer: &mut AudioBuffer<f32>, midi: &mut MidiBuffer);

    /// Process one block of 64-bit audio.
    ///
    /// The default bridges through `process_f32` for single-precision
    /// plugins; the chain only routes f64 blocks to plugins whose
    /// [`supports_double_precision`](Self::supports_double_precision) is
    /// true, so the lossy fallback stays off the hot path.
    fn process_f64(&mut self, buffer: &mut AudioBuffer<f64>, midi: &mut MidiBuffer) {
        let mut narrowed: AudioBuffer<f32> = buffer.convert();
        self.process_f32(&mut narrowed, midi);
        buffer.convert_from(&narrowed);
    }

    /// Select the precision later `process_*` calls will use.
    fn set_processing_precision(&mut self, _precision: Precision) {}

    /// Whether the plugin can natively process 64-bit samples.
    fn supports_double_precision(&self) -> bool {
        false
    }

    /// Processing delay the plugin introduces, in samples.
    fn latency_samples(&self) -> usize {
        0
    }

    /// Trailing output the plugin keeps emitting after input stops.
    fn tail_seconds(&self) -> f64 {
        0.0
    }

    /// Whether the plugin could run with the given layout, without
    /// applying it.
    fn check_buses_layout(&self, layout: &BusesLayout) -> bool;

    /// Try to apply the given layout. Returns false and leaves the current
    /// layout untouched when unsupported.
    fn set_buses_layout(&mut self, layout: &BusesLayout) -> bool;

    /// The currently applied layout (the plugin's preferred layout before
    /// any `set_buses_layout` succeeded).
    fn buses_layout(&self) -> BusesLayout;

    /// Activate every bus of the current layout.
    fn enable_all_buses(&mut self) {}

    /// Install the shared play head the plugin reads transport from.
    fn set_play_head(&mut self, _play_head: PlayHead) {}

    /// Number of exposed parameters.
    fn parameter_count(&self) -> usize {
        0
    }

    /// Normalized value of one parameter; 0.0 for out-of-range indices.
    fn parameter_value(&self, _index: usize) -> f32 {
        0.0
    }

    /// Register a listener on every parameter.
    fn add_parameter_listener(&mut self, _listener: Arc<dyn ParameterListener>) {}

    /// Unregister a previously added listener (pointer identity).
    fn remove_parameter_listener(&mut self, _listener: &Arc<dyn ParameterListener>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_set_for_channels() {
        assert_eq!(ChannelSet::for_channels(1), ChannelSet::Mono);
        assert_eq!(ChannelSet::for_channels(2), ChannelSet::Stereo);
        assert_eq!(ChannelSet::for_channels(6), ChannelSet::Discrete(6));
        assert_eq!(ChannelSet::for_channels(6).count(), 6);
    }

    #[test]
    fn test_layout_channel_totals() {
        let layout = BusesLayout {
            inputs: vec![ChannelSet::Stereo, ChannelSet::Mono],
            outputs: vec![ChannelSet::Stereo, ChannelSet::Discrete(4)],
        };
        assert_eq!(layout.main_input_channels(), 2);
        assert_eq!(layout.sidechain(), Some(ChannelSet::Mono));
        assert_eq!(layout.total_input_channels(), 3);
        assert_eq!(layout.total_output_channels(), 6);
        assert_eq!(layout.extra_output_channels(), 4);
    }

    #[test]
    fn test_buffer_resize_zero_fills() {
        let mut buf = AudioBuffer::<f32>::new(1, 4);
        buf.channel_mut(0).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        buf.resize(2, 6);
        assert_eq!(buf.num_channels(), 2);
        assert_eq!(buf.channel(0), &[1.0, 2.0, 3.0, 4.0, 0.0, 0.0]);
        assert_eq!(buf.channel(1), &[0.0; 6]);
    }

    #[test]
    fn test_buffer_precision_conversion() {
        let mut buf = AudioBuffer::<f64>::new(1, 3);
        buf.channel_mut(0).copy_from_slice(&[0.5, -0.25, 1.0]);
        let narrowed: AudioBuffer<f32> = buf.convert();
        assert_eq!(narrowed.channel(0), &[0.5f32, -0.25, 1.0]);

        let mut widened = AudioBuffer::<f64>::new(1, 3);
        widened.convert_from(&narrowed);
        assert_eq!(widened.channel(0), &[0.5f64, -0.25, 1.0]);
    }

    struct Doubler;

    impl AudioPlugin for Doubler {
        fn name(&self) -> &str {
            "Doubler"
        }

        fn prepare_to_play(&mut self, _sample_rate: f64, _block_size: usize) {}

        fn release_resources(&mut self) {}

        fn process_f32(&mut self, buffer: &mut AudioBuffer<f32>, _midi: &mut MidiBuffer) {
            for ch in 0..buffer.num_channels() {
                for s in buffer.channel_mut(ch) {
                    *s *= 2.0;
                }
            }
        }

        fn check_buses_layout(&self, _layout: &BusesLayout) -> bool {
            true
        }

        fn set_buses_layout(&mut self, _layout: &BusesLayout) -> bool {
            true
        }

        fn buses_layout(&self) -> BusesLayout {
            BusesLayout {
                inputs: vec![ChannelSet::Stereo],
                outputs: vec![ChannelSet::Stereo],
            }
        }
    }

    #[test]
    fn test_default_f64_bridges_through_f32() {
        let mut plugin = Doubler;
        let mut buf = AudioBuffer::<f64>::new(1, 2);
        buf.channel_mut(0).copy_from_slice(&[0.25, -0.5]);
        let mut midi = MidiBuffer::new();
        plugin.process_f64(&mut buf, &mut midi);
        assert_eq!(buf.channel(0), &[0.5, -1.0]);
    }
}
