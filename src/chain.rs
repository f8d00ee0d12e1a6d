// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The processor chain.
//!
//! An ordered list of plugin wrappers a session's blocks flow through.
//! The chain negotiates bus layouts against the session layout, keeps the
//! aggregate latency/tail/precision/extra-channel state current, and
//! dispatches each block through every wrapper in order, bypassed or not.

use crate::config::ServerConfig;
use crate::message_thread::MessageThread;
use crate::plugins::catalog::PluginCatalog;
use crate::plugins::instance::PluginInstance;
use crate::plugins::PluginLoadError;
use parking_lot::Mutex;
use remoterack_plugin_api::{
    AudioBuffer, BusesLayout, ChannelSet, MidiBuffer, ParameterListener, PlayHead, Precision,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Silent blocks pushed through a freshly prepared plugin to settle its
/// internal state before real audio arrives.
const WARMUP_BLOCKS: usize = 4;

/// Per-block wall-clock budget; overruns are logged, never throttled.
const BLOCK_DEADLINE: Duration = Duration::from_millis(20);

/// Error type for chain mutations.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The wrapper failed to load its plugin.
    #[error(transparent)]
    Load(#[from] PluginLoadError),

    /// No layout the plugin supports could be negotiated.
    #[error("no supported bus layout for {0}")]
    Negotiation(String),
}

struct ChainInner {
    processors: Vec<PluginInstance>,
    layout: BusesLayout,
    sample_rate: f64,
    block_size: usize,
    wants_double: bool,
    prepared: bool,
    latency_samples: usize,
    tail_seconds: f64,
    supports_double: bool,
    extra_channels: usize,
    has_sidechain: bool,
    sidechain_disabled: bool,
}

/// Ordered chain of plugin wrappers for one session.
pub struct ProcessorChain {
    catalog: Arc<dyn PluginCatalog>,
    message_thread: MessageThread,
    play_head: PlayHead,
    parallel_load: bool,
    param_sink: Option<Arc<dyn ParameterListener>>,
    inner: Mutex<ChainInner>,
}

impl ProcessorChain {
    /// Create an empty chain at the session's rate and block size.
    pub fn new(
        catalog: Arc<dyn PluginCatalog>,
        config: &ServerConfig,
        message_thread: MessageThread,
        sample_rate: f64,
        block_size: usize,
        wants_double: bool,
    ) -> Self {
        Self {
            catalog,
            message_thread,
            play_head: PlayHead::new(),
            parallel_load: config.parallel_plugin_load,
            param_sink: None,
            inner: Mutex::new(ChainInner {
                processors: Vec::new(),
                layout: BusesLayout::default(),
                sample_rate,
                block_size,
                wants_double,
                prepared: false,
                latency_samples: 0,
                tail_seconds: 0.0,
                supports_double: true,
                extra_channels: 0,
                has_sidechain: false,
                sidechain_disabled: false,
            }),
        }
    }

    /// Install a sink that receives parameter changes from every hosted
    /// plugin. Affects plugins added afterwards.
    pub fn set_parameter_sink(&mut self, sink: Arc<dyn ParameterListener>) {
        self.param_sink = Some(sink);
    }

    /// The shared play head installed into every plugin.
    pub fn play_head(&self) -> PlayHead {
        self.play_head.clone()
    }

    /// Rebuild the session layout from declared channel counts and
    /// renegotiate every processor's buses.
    pub fn update_channels(
        &self,
        channels_in: usize,
        channels_out: usize,
        channels_sc: usize,
    ) -> Result<(), ChainError> {
        let mut inner = self.inner.lock();

        let mut inputs = Vec::new();
        if channels_in > 0 {
            inputs.push(ChannelSet::for_channels(channels_in as u32));
        }
        if channels_sc > 0 {
            inputs.push(ChannelSet::for_channels(channels_sc as u32));
        }
        let mut outputs = Vec::new();
        if channels_out > 0 {
            outputs.push(ChannelSet::for_channels(channels_out as u32));
        }
        inner.layout = BusesLayout { inputs, outputs };
        inner.extra_channels = 0;
        inner.sidechain_disabled = false;
        inner.has_sidechain = channels_sc > 0;
        debug!(
            "Session layout: {} in / {} out / {} sidechain",
            channels_in, channels_out, channels_sc
        );

        let mut result = Ok(());
        let ChainInner {
            processors,
            layout,
            sidechain_disabled,
            extra_channels,
            ..
        } = &mut *inner;
        for instance in processors.iter_mut() {
            if !Self::negotiate_buses(layout, sidechain_disabled, extra_channels, instance)
                && result.is_ok()
            {
                result = Err(ChainError::Negotiation(instance.id().to_string()));
            }
        }
        Self::update_no_lock(&mut inner);
        result
    }

    /// Load a plugin, negotiate its buses, prepare it, and append it.
    ///
    /// On any failure the chain is left untouched and the error describes
    /// why admission was refused.
    pub fn add_plugin(&self, plugin_id: &str) -> Result<usize, ChainError> {
        let mut inner = self.inner.lock();
        let mut instance = PluginInstance::new(
            plugin_id,
            inner.sample_rate,
            inner.block_size,
            !self.parallel_load,
        );
        instance.load(&self.catalog, &self.message_thread)?;
        self.init_plugin_instance(&mut inner, &mut instance)?;

        let index = inner.processors.len();
        instance.set_chain_index(index);
        inner.processors.push(instance);
        Self::update_no_lock(&mut inner);
        info!("Added {} at index {}", plugin_id, index);
        Ok(index)
    }

    /// Remove one processor. Out-of-range indices are a no-op.
    pub fn delete_processor(&self, index: usize) {
        let mut inner = self.inner.lock();
        if index >= inner.processors.len() {
            debug!("delete_processor({}) out of range, ignoring", index);
            return;
        }
        let removed = inner.processors.remove(index);
        info!("Removed {} from index {}", removed.id(), index);
        drop(removed);
        for (i, instance) in inner.processors.iter_mut().enumerate() {
            instance.set_chain_index(i);
        }
        Self::update_no_lock(&mut inner);
    }

    /// Swap two processors, reassigning their chain indices. Equal or
    /// out-of-range indices are a no-op.
    pub fn exchange_processors(&self, a: usize, b: usize) {
        let mut inner = self.inner.lock();
        if a == b || a >= inner.processors.len() || b >= inner.processors.len() {
            return;
        }
        inner.processors.swap(a, b);
        inner.processors[a].set_chain_index(a);
        inner.processors[b].set_chain_index(b);
        Self::update_no_lock(&mut inner);
        debug!("Exchanged processors {} and {}", a, b);
    }

    /// Toggle bypass on one processor. Out-of-range indices are a no-op.
    pub fn set_suspended(&self, index: usize, suspended: bool) {
        let mut inner = self.inner.lock();
        if let Some(instance) = inner.processors.get_mut(index) {
            instance.set_suspended(suspended);
            Self::update_no_lock(&mut inner);
        }
    }

    /// Prepare every processor at the given rate and block size.
    pub fn prepare_to_play(&self, sample_rate: f64, block_size: usize) {
        let mut inner = self.inner.lock();
        inner.sample_rate = sample_rate;
        inner.block_size = block_size;
        for instance in inner.processors.iter_mut() {
            instance.prepare_to_play(sample_rate, block_size);
        }
        inner.prepared = true;
    }

    /// Release every processor's resources.
    pub fn release_resources(&self) {
        let mut inner = self.inner.lock();
        for instance in inner.processors.iter_mut() {
            instance.release_resources();
        }
        inner.prepared = false;
    }

    /// Release everything and drop all processors; their destructors run
    /// the unload path.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for instance in inner.processors.iter_mut() {
            instance.release_resources();
        }
        inner.processors.clear();
        Self::update_no_lock(&mut inner);
        info!("Chain cleared");
    }

    /// Process one 32-bit block through the whole chain.
    pub fn process_block_f32(&self, buffer: &mut AudioBuffer<f32>, midi: &mut MidiBuffer) {
        let started = Instant::now();
        {
            let mut inner = self.inner.lock();
            for instance in inner.processors.iter_mut() {
                if instance.is_suspended() {
                    instance.process_block_bypassed_f32(buffer);
                } else {
                    instance.process_block_f32(buffer, midi);
                }
            }
        }
        Self::check_deadline(started);
    }

    /// Process one 64-bit block through the whole chain.
    pub fn process_block_f64(&self, buffer: &mut AudioBuffer<f64>, midi: &mut MidiBuffer) {
        let started = Instant::now();
        {
            let mut inner = self.inner.lock();
            for instance in inner.processors.iter_mut() {
                if instance.is_suspended() {
                    instance.process_block_bypassed_f64(buffer);
                } else {
                    instance.process_block_f64(buffer, midi);
                }
            }
        }
        Self::check_deadline(started);
    }

    fn check_deadline(started: Instant) {
        let elapsed = started.elapsed();
        if elapsed > BLOCK_DEADLINE {
            warn!(
                "Block processing took {:?}, exceeding the {:?} budget",
                elapsed, BLOCK_DEADLINE
            );
        }
    }

    /// Normalized parameter value; 0.0 on any out-of-range access.
    pub fn get_parameter_value(&self, processor: usize, parameter: usize) -> f32 {
        let inner = self.inner.lock();
        inner
            .processors
            .get(processor)
            .map_or(0.0, |p| p.parameter_value(parameter))
    }

    /// Plugin id at a chain position.
    pub fn processor_id(&self, index: usize) -> Option<String> {
        let inner = self.inner.lock();
        inner.processors.get(index).map(|p| p.id().to_string())
    }

    /// Number of processors in the chain.
    pub fn num_processors(&self) -> usize {
        self.inner.lock().processors.len()
    }

    /// Sum of per-plugin latencies, in samples.
    pub fn latency_samples(&self) -> usize {
        self.inner.lock().latency_samples
    }

    /// Tail of the last non-suspended processor.
    pub fn tail_seconds(&self) -> f64 {
        self.inner.lock().tail_seconds
    }

    /// Whether every processor can run at 64-bit precision.
    pub fn supports_double_precision(&self) -> bool {
        self.inner.lock().supports_double
    }

    /// Widest extra-channel demand across all processors.
    pub fn extra_channels(&self) -> usize {
        self.inner.lock().extra_channels
    }

    /// Whether the session sidechain had to be disabled for some plugin.
    pub fn sidechain_disabled(&self) -> bool {
        self.inner.lock().sidechain_disabled
    }

    /// The chain's current session layout.
    pub fn layout(&self) -> BusesLayout {
        self.inner.lock().layout.clone()
    }

    /// Whether the chain currently holds processing resources.
    pub fn is_prepared(&self) -> bool {
        self.inner.lock().prepared
    }

    /// Recompute the aggregate state from the processors.
    pub fn update_aggregates(&self) {
        let mut inner = self.inner.lock();
        Self::update_no_lock(&mut inner);
    }

    /// Negotiate a processor's buses against the session layout.
    ///
    /// Fallback ladder: the session layout (sidechain already removed when
    /// the chain disabled it), then a mono sidechain, then no sidechain,
    /// then the plugin's own layout wholesale with the channel excess
    /// recorded as extra channels.
    fn negotiate_buses(
        session_layout: &BusesLayout,
        sidechain_disabled: &mut bool,
        chain_extra: &mut usize,
        instance: &mut PluginInstance,
    ) -> bool {
        // A wrapper may renegotiate after a session layout change; whatever
        // workaround the previous round needed no longer holds.
        instance.set_needs_disabled_sidechain(false);
        instance.set_extra_channels(0, 0);

        let mut layout = session_layout.clone();
        if *sidechain_disabled && layout.inputs.len() > 1 {
            layout.inputs.remove(1);
        }

        if instance
            .with_plugin(|p| p.check_buses_layout(&layout) && p.set_buses_layout(&layout))
            .unwrap_or(false)
        {
            instance.set_layout(layout);
            return true;
        }

        if let Some(sidechain) = layout.sidechain() {
            if sidechain.count() > 1 {
                let mut mono_sc = layout.clone();
                mono_sc.inputs[1] = ChannelSet::Mono;
                if instance
                    .with_plugin(|p| p.check_buses_layout(&mono_sc) && p.set_buses_layout(&mono_sc))
                    .unwrap_or(false)
                {
                    debug!("{}: sidechain reduced to mono", instance.id());
                    instance.set_layout(mono_sc);
                    return true;
                }
            }
        }

        if layout.inputs.len() > 1 {
            let mut no_sc = layout.clone();
            no_sc.inputs.remove(1);
            if instance
                .with_plugin(|p| p.check_buses_layout(&no_sc) && p.set_buses_layout(&no_sc))
                .unwrap_or(false)
            {
                debug!("{}: sidechain disabled", instance.id());
                instance.set_needs_disabled_sidechain(true);
                *sidechain_disabled = true;
                instance.set_layout(no_sc);
                return true;
            }
        }

        // Last resort: adopt the plugin's own layout and widen the working
        // buffer by whatever it demands beyond the session's channels.
        let Some(own) = instance.with_plugin(|p| p.buses_layout()) else {
            return false;
        };
        instance.set_needs_disabled_sidechain(true);
        let extra_in = own
            .main_input_channels()
            .saturating_sub(session_layout.main_input_channels())
            as usize
            + own.extra_input_channels() as usize;
        let extra_out = own
            .main_output_channels()
            .saturating_sub(session_layout.main_output_channels())
            as usize
            + own.extra_output_channels() as usize;
        warn!(
            "{}: no negotiable layout, adopting its own ({} extra in, {} extra out)",
            instance.id(),
            extra_in,
            extra_out
        );
        instance.set_extra_channels(extra_in, extra_out);
        *chain_extra = (*chain_extra).max(extra_in).max(extra_out);
        instance.set_layout(own);
        true
    }

    /// Bring a freshly loaded instance up to processing readiness.
    fn init_plugin_instance(
        &self,
        inner: &mut ChainInner,
        instance: &mut PluginInstance,
    ) -> Result<(), ChainError> {
        {
            let ChainInner {
                layout,
                sidechain_disabled,
                extra_channels,
                ..
            } = inner;
            if !Self::negotiate_buses(layout, sidechain_disabled, extra_channels, instance) {
                return Err(ChainError::Negotiation(instance.id().to_string()));
            }
        }

        let plugin_double = instance.supports_double_precision();
        let use_double = inner.wants_double && inner.supports_double && plugin_double;
        if inner.wants_double && !use_double {
            warn!(
                "{}: falling back to single precision (chain supports double: {}, plugin: {})",
                instance.id(),
                inner.supports_double,
                plugin_double
            );
        }
        instance.set_precision(if use_double {
            Precision::Double
        } else {
            Precision::Single
        });

        instance.prepare_to_play(inner.sample_rate, inner.block_size);
        instance.install_play_head(self.play_head.clone());
        instance.enable_all_buses();
        instance.refresh_latency();
        Self::pre_process_blocks(instance, inner.block_size, use_double);
        instance.register_parameter_listener(self.param_sink.clone());
        Ok(())
    }

    /// Push a handful of silent blocks through a new plugin so its warm-up
    /// transients never reach the client.
    fn pre_process_blocks(instance: &mut PluginInstance, block_size: usize, double: bool) {
        let channels = {
            let layout = instance.layout();
            layout
                .total_input_channels()
                .max(layout.total_output_channels()) as usize
        };
        let mut midi = MidiBuffer::new();
        if double {
            let mut buffer = AudioBuffer::<f64>::new(channels, block_size);
            for _ in 0..WARMUP_BLOCKS {
                buffer.clear();
                midi.clear();
                instance.process_block_f64(&mut buffer, &mut midi);
            }
        } else {
            let mut buffer = AudioBuffer::<f32>::new(channels, block_size);
            for _ in 0..WARMUP_BLOCKS {
                buffer.clear();
                midi.clear();
                instance.process_block_f32(&mut buffer, &mut midi);
            }
        }
    }

    fn update_no_lock(inner: &mut ChainInner) {
        let mut latency = 0;
        let mut supports_double = true;
        let mut extra = 0;
        let mut tail = 0.0;
        let mut any_disabled_sidechain = false;

        for instance in inner.processors.iter_mut() {
            instance.refresh_latency();
            latency += instance.latency();
            supports_double &= instance.supports_double_precision();
            let (extra_in, extra_out) = instance.extra_channels();
            extra = extra.max(extra_in).max(extra_out);
            if instance.needs_disabled_sidechain() {
                any_disabled_sidechain = true;
            }
            if !instance.is_suspended() {
                tail = instance.tail_seconds();
            }
        }

        inner.supports_double = supports_double;
        inner.extra_channels = extra;
        inner.sidechain_disabled = inner.has_sidechain && any_disabled_sidechain;
        inner.tail_seconds = tail;
        if latency != inner.latency_samples {
            inner.latency_samples = latency;
            debug!("Chain latency now {} samples", latency);
        }
    }
}

impl Drop for ProcessorChain {
    fn drop(&mut self) {
        self.clear();
    }
}
