// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shared wire and session types for remoterack.
//!
//! This crate defines what flows between a client session and the server's
//! processing core: precision-tagged audio blocks with MIDI and transport,
//! the session parameters agreed during the external handshake, and the
//! [`FrameTransport`] trait the session worker drives. The byte-level codec
//! itself lives with the connection layer; the worker only ever sees typed
//! frames.

#![warn(missing_docs)]

use remoterack_plugin_api::{AudioBuffer, MidiBuffer, Transport};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors for session-parameter validation.
#[derive(Debug, Error)]
pub enum WireError {
    /// The active-channel mask claims more channels than the session
    /// declared.
    #[error("active channel mask exceeds declared channels: {active} active, {declared} declared ({side})")]
    MaskOverflow {
        /// Bits set in the mask.
        active: usize,
        /// Channels the session declared on that side.
        declared: usize,
        /// "input" or "output".
        side: &'static str,
    },
}

/// Sample precision of a frame's audio block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    /// 32-bit float samples.
    F32,
    /// 64-bit float samples.
    F64,
}

/// A precision-tagged audio block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AudioBlock {
    /// 32-bit samples.
    F32(AudioBuffer<f32>),
    /// 64-bit samples.
    F64(AudioBuffer<f64>),
}

impl AudioBlock {
    /// Precision tag of the block.
    pub fn format(&self) -> SampleFormat {
        match self {
            Self::F32(_) => SampleFormat::F32,
            Self::F64(_) => SampleFormat::F64,
        }
    }

    /// Number of channels.
    pub fn num_channels(&self) -> usize {
        match self {
            Self::F32(b) => b.num_channels(),
            Self::F64(b) => b.num_channels(),
        }
    }

    /// Number of samples per channel.
    pub fn num_samples(&self) -> usize {
        match self {
            Self::F32(b) => b.num_samples(),
            Self::F64(b) => b.num_samples(),
        }
    }
}

/// One incoming block from the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFrame {
    /// Audio samples, channels x samples, precision-tagged.
    pub audio: AudioBlock,
    /// MIDI events for this block.
    pub midi: MidiBuffer,
    /// Client transport state at the start of the block.
    pub transport: Transport,
}

/// One outgoing processed block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Processed audio.
    pub audio: AudioBlock,
    /// MIDI after the chain (plugins may mutate events in place).
    pub midi: MidiBuffer,
    /// The chain's current latency, in samples.
    pub latency_samples: usize,
    /// Channels carried in `audio`.
    pub channel_count: usize,
}

/// Bitset of the session channels that actually carry audio.
///
/// Input bits cover the declared inputs followed by the sidechain
/// channels; output bits cover the declared outputs. Sessions are capped
/// at 64 channels per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActiveChannelMask {
    /// Active bits over `channels_in + channels_sc`.
    pub inputs: u64,
    /// Active bits over `channels_out`.
    pub outputs: u64,
}

impl ActiveChannelMask {
    /// Mask with the lowest `inputs`/`outputs` bits set.
    pub fn first_n(inputs: usize, outputs: usize) -> Self {
        let bits = |n: usize| {
            if n >= 64 {
                u64::MAX
            } else {
                (1u64 << n) - 1
            }
        };
        Self {
            inputs: bits(inputs),
            outputs: bits(outputs),
        }
    }

    /// Whether input channel `index` is active.
    pub fn input_active(&self, index: usize) -> bool {
        index < 64 && self.inputs & (1 << index) != 0
    }

    /// Whether output channel `index` is active.
    pub fn output_active(&self, index: usize) -> bool {
        index < 64 && self.outputs & (1 << index) != 0
    }

    /// Number of active input channels.
    pub fn num_active_inputs(&self) -> usize {
        self.inputs.count_ones() as usize
    }

    /// Number of active output channels.
    pub fn num_active_outputs(&self) -> usize {
        self.outputs.count_ones() as usize
    }
}

/// Parameters fixed for the lifetime of one session, agreed during the
/// external handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    /// Main input channels the client declared.
    pub channels_in: usize,
    /// Output channels the client declared.
    pub channels_out: usize,
    /// Sidechain channels the client declared (0 = no sidechain).
    pub channels_sc: usize,
    /// Which declared channels carry audio this session.
    pub active_channels: ActiveChannelMask,
    /// Session sample rate.
    pub sample_rate: f64,
    /// Maximum samples per block.
    pub block_size: usize,
    /// Whether the client wants 64-bit processing.
    pub double_precision: bool,
}

impl SessionParams {
    /// Check the mask invariants: active input bits must not exceed
    /// `channels_in + channels_sc`, active output bits must not exceed
    /// `channels_out`.
    pub fn validate(&self) -> Result<(), WireError> {
        let declared_in = self.channels_in + self.channels_sc;
        let active_in = self.active_channels.num_active_inputs();
        if active_in > declared_in {
            return Err(WireError::MaskOverflow {
                active: active_in,
                declared: declared_in,
                side: "input",
            });
        }
        let active_out = self.active_channels.num_active_outputs();
        if active_out > self.channels_out {
            return Err(WireError::MaskOverflow {
                active: active_out,
                declared: self.channels_out,
                side: "output",
            });
        }
        Ok(())
    }
}

/// Blocking, typed view of one client connection.
///
/// Implemented by the external codec over the connected socket. Read and
/// write errors mean the stream is unusable; the worker closes and exits.
pub trait FrameTransport: Send {
    /// Poll for readability. `Ok(false)` on timeout.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Block until one full frame is decoded.
    fn read_frame(&mut self) -> io::Result<AudioFrame>;

    /// Encode and send one response frame.
    fn write_frame(&mut self, frame: &ResponseFrame) -> io::Result<()>;

    /// Shut the connection down. Idempotent.
    fn close(&mut self);
}

/// Byte counters the codec reports into. Implemented by the server's
/// metrics layer.
pub trait MetricsSink: Send + Sync {
    /// Bytes decoded off the socket.
    fn add_bytes_in(&self, bytes: u64);

    /// Bytes encoded onto the socket.
    fn add_bytes_out(&self, bytes: u64);
}
