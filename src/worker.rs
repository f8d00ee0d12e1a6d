// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The session worker.
//!
//! One dedicated thread per client session drives the per-block loop: poll
//! the connection, read one frame, route it through the chain (repacking
//! channels and bridging precision when needed), and write the processed
//! block back with the chain's current latency. Blocks are handled
//! strictly in order; there is no pipelining.

use crate::chain::{ChainError, ProcessorChain};
use crate::channel_map::ChannelMapper;
use crate::config::ServerConfig;
use crate::message_thread::MessageThread;
use crate::plugins::catalog::PluginCatalog;
use crate::plugins::id;
use crate::recents;
use parking_lot::Mutex;
use remoterack_plugin_api::{AudioBuffer, MidiBuffer, PlayHead};
use remoterack_wire::{
    AudioBlock, AudioFrame, FrameTransport, ResponseFrame, SessionParams, WireError,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// How long one poll for readability may block. Bounds the latency of
/// shutdown requests and control-thread chain mutations.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Error type for session setup.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The handshake delivered inconsistent session parameters.
    #[error(transparent)]
    InvalidSession(#[from] WireError),

    /// The session chain could not be configured.
    #[error(transparent)]
    Chain(#[from] ChainError),
}

enum BlockOutcome {
    Idle,
    Processed,
    Disconnect,
}

/// Drives one client session's blocks through its processor chain.
pub struct SessionWorker {
    params: SessionParams,
    config: ServerConfig,
    catalog: Arc<dyn PluginCatalog>,
    chain: ProcessorChain,
    mapper: ChannelMapper,
    play_head: PlayHead,

    /// The worker mutex: owns the transport and serializes socket I/O
    /// against chain mutation from control threads.
    io: Mutex<Option<Box<dyn FrameTransport>>>,
    shutdown_requested: AtomicBool,
    precision_warned: AtomicBool,

    work_f32: Mutex<AudioBuffer<f32>>,
    work_f64: Mutex<AudioBuffer<f64>>,
    bridge_f32: Mutex<AudioBuffer<f32>>,

    last_block_micros: AtomicU64,
    blocks_processed: AtomicU64,
}

impl SessionWorker {
    /// Take ownership of a connected transport and build the session's
    /// chain with buses matching the declared channels.
    pub fn new(
        transport: Box<dyn FrameTransport>,
        params: SessionParams,
        catalog: Arc<dyn PluginCatalog>,
        config: ServerConfig,
        message_thread: MessageThread,
    ) -> Result<Self, SessionError> {
        params.validate()?;

        let chain = ProcessorChain::new(
            Arc::clone(&catalog),
            &config,
            message_thread,
            params.sample_rate,
            params.block_size,
            params.double_precision,
        );
        chain.update_channels(params.channels_in, params.channels_out, params.channels_sc)?;
        chain.prepare_to_play(params.sample_rate, params.block_size);

        let mapper = ChannelMapper::new(&params);
        let play_head = chain.play_head();
        Ok(Self {
            params,
            config,
            catalog,
            chain,
            mapper,
            play_head,
            io: Mutex::new(Some(transport)),
            shutdown_requested: AtomicBool::new(false),
            precision_warned: AtomicBool::new(false),
            work_f32: Mutex::new(AudioBuffer::new(0, 0)),
            work_f64: Mutex::new(AudioBuffer::new(0, 0)),
            bridge_f32: Mutex::new(AudioBuffer::new(0, 0)),
            last_block_micros: AtomicU64::new(0),
            blocks_processed: AtomicU64::new(0),
        })
    }

    /// The per-block loop. Returns when the client disconnects, a fatal
    /// per-block error occurs, or shutdown was requested.
    pub fn run(&self) {
        info!(
            "Session worker started: {} in / {} out / {} sc, {} Hz, block {}",
            self.params.channels_in,
            self.params.channels_out,
            self.params.channels_sc,
            self.params.sample_rate,
            self.params.block_size
        );

        loop {
            if self.shutdown_requested.load(Ordering::Acquire) {
                break;
            }
            let mut io = self.io.lock();
            let Some(transport) = io.as_mut() else {
                break;
            };
            match self.service_block(transport.as_mut()) {
                BlockOutcome::Disconnect => {
                    transport.close();
                    *io = None;
                    break;
                }
                BlockOutcome::Idle | BlockOutcome::Processed => {}
            }
            // The guard drops here, giving control threads a quiescent
            // window between blocks.
        }

        self.terminate();
        info!("Session worker stopped");
    }

    /// Request loop termination; an in-flight block completes normally.
    pub fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    /// The session's chain.
    pub fn chain(&self) -> &ProcessorChain {
        &self.chain
    }

    /// Load a plugin and append it to the chain.
    pub fn add_plugin(&self, plugin_id: &str) -> Result<usize, ChainError> {
        let _io = self.io.lock();
        self.chain.add_plugin(plugin_id)
    }

    /// Remove a plugin from the chain.
    pub fn del_plugin(&self, index: usize) {
        let _io = self.io.lock();
        self.chain.delete_processor(index);
    }

    /// Swap two plugins in the chain.
    pub fn exchange_plugins(&self, a: usize, b: usize) {
        let _io = self.io.lock();
        self.chain.exchange_processors(a, b);
    }

    /// Toggle bypass on one plugin.
    pub fn set_plugin_suspended(&self, index: usize, suspended: bool) {
        let _io = self.io.lock();
        self.chain.set_suspended(index, suspended);
    }

    /// Record a plugin use in the per-host recents registry.
    pub fn add_to_recents(&self, plugin_id: &str, host: &str) {
        match id::find_plugin_description(self.catalog.as_ref(), plugin_id) {
            Some(description) => recents::add_recent(host, description, self.config.num_recents),
            None => warn!("Not recording unknown plugin {} in recents", plugin_id),
        }
    }

    /// Render a host's recents list, newline-terminated.
    pub fn get_recents(&self, host: &str) -> String {
        recents::recents_for_host(host)
    }

    /// Wall-clock duration of the most recent block, in microseconds.
    pub fn last_block_micros(&self) -> u64 {
        self.last_block_micros.load(Ordering::Relaxed)
    }

    /// Blocks processed so far.
    pub fn blocks_processed(&self) -> u64 {
        self.blocks_processed.load(Ordering::Relaxed)
    }

    fn service_block(&self, transport: &mut dyn FrameTransport) -> BlockOutcome {
        match transport.wait_readable(POLL_TIMEOUT) {
            Ok(true) => {}
            Ok(false) => return BlockOutcome::Idle,
            Err(e) => {
                error!("Socket poll failed: {}", e);
                return BlockOutcome::Disconnect;
            }
        }

        let frame = match transport.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                info!("Session read ended: {}", e);
                return BlockOutcome::Disconnect;
            }
        };

        let required = self.mapper.min_client_channels();
        if frame.audio.num_channels() < required {
            error!(
                "Channel mismatch: received {} channels, active mask requires {}",
                frame.audio.num_channels(),
                required
            );
            self.chain.release_resources();
            return BlockOutcome::Disconnect;
        }

        let started = Instant::now();
        self.play_head.set(frame.transport);
        let response = self.process_frame(frame);
        if let Err(e) = transport.write_frame(&response) {
            error!("Failed to write response: {}", e);
            return BlockOutcome::Disconnect;
        }

        self.last_block_micros
            .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.blocks_processed.fetch_add(1, Ordering::Relaxed);
        BlockOutcome::Processed
    }

    fn process_frame(&self, frame: AudioFrame) -> ResponseFrame {
        let mut midi = frame.midi;
        let audio = match frame.audio {
            AudioBlock::F32(mut buffer) => {
                self.process_mapped_f32(&mut buffer, &mut midi);
                AudioBlock::F32(buffer)
            }
            AudioBlock::F64(mut buffer) => {
                if self.params.double_precision && self.chain.supports_double_precision() {
                    self.process_mapped_f64(&mut buffer, &mut midi);
                } else {
                    if !self.precision_warned.swap(true, Ordering::Relaxed) {
                        warn!("Received 64-bit audio but the chain runs single precision, converting");
                    }
                    let mut bridge = self.bridge_f32.lock();
                    bridge.resize(buffer.num_channels(), buffer.num_samples());
                    bridge.convert_from(&buffer);
                    self.process_mapped_f32(&mut bridge, &mut midi);
                    buffer.convert_from(&bridge);
                }
                AudioBlock::F64(buffer)
            }
        };
        ResponseFrame {
            channel_count: audio.num_channels(),
            latency_samples: self.chain.latency_samples(),
            audio,
            midi,
        }
    }

    /// Channels the chain's working buffer needs for one block.
    fn required_channels(&self) -> usize {
        (self.params.channels_in + self.params.channels_sc).max(self.params.channels_out)
            + self.chain.extra_channels()
    }

    fn process_mapped_f32(&self, buffer: &mut AudioBuffer<f32>, midi: &mut MidiBuffer) {
        let required = self.required_channels();
        if buffer.num_channels() >= required {
            self.chain.process_block_f32(buffer, midi);
            return;
        }
        let mut working = self.work_f32.lock();
        let channels = required.max(working.num_channels());
        working.resize(channels, buffer.num_samples());
        if self.mapper.has_active_inputs() {
            self.mapper.pack(buffer, &mut working);
        } else {
            working.clear();
        }
        self.chain.process_block_f32(&mut working, midi);
        self.mapper.unpack(&working, buffer);
    }

    fn process_mapped_f64(&self, buffer: &mut AudioBuffer<f64>, midi: &mut MidiBuffer) {
        let required = self.required_channels();
        if buffer.num_channels() >= required {
            self.chain.process_block_f64(buffer, midi);
            return;
        }
        let mut working = self.work_f64.lock();
        let channels = required.max(working.num_channels());
        working.resize(channels, buffer.num_samples());
        if self.mapper.has_active_inputs() {
            self.mapper.pack(buffer, &mut working);
        } else {
            working.clear();
        }
        self.chain.process_block_f64(&mut working, midi);
        self.mapper.unpack(&working, buffer);
    }

    fn terminate(&self) {
        let mut io = self.io.lock();
        if let Some(transport) = io.as_mut() {
            transport.close();
        }
        *io = None;
        self.chain.clear();
    }
}
