// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The plugin instance wrapper.
//!
//! A wrapper owns one loaded plugin on behalf of the chain: it resolves the
//! textual id, instantiates the plugin on the message thread, tracks the
//! prepared/suspended lifecycle, and implements the bypass path with
//! sample-accurate latency compensation.
//!
//! Plugin handles are shared ([`SharedPlugin`]): an in-flight block or a
//! late parameter callback keeps the plugin alive even when a concurrent
//! unload already cleared the wrapper's slot, and the final reference
//! defers destruction onto the message thread as plugin SDKs require.

use super::catalog::{PluginCatalog, PluginDescription};
use super::{id, PluginLoadError, PluginResult};
use crate::message_thread::MessageThread;
use parking_lot::Mutex;
use remoterack_plugin_api::{
    AudioBuffer, AudioPlugin, BusesLayout, MidiBuffer, ParameterListener, PlayHead, Precision,
    Sample,
};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace};

struct PluginCell {
    plugin: Mutex<Option<Box<dyn AudioPlugin>>>,
    message_thread: MessageThread,
    name: String,
}

impl Drop for PluginCell {
    fn drop(&mut self) {
        // Final teardown must happen on the message thread.
        if let Some(plugin) = self.plugin.get_mut().take() {
            debug!("Deferring destruction of '{}' to the message thread", self.name);
            self.message_thread.post(move || drop(plugin));
        }
    }
}

/// Reference-counted handle to a loaded plugin.
#[derive(Clone)]
pub struct SharedPlugin {
    cell: Arc<PluginCell>,
}

impl SharedPlugin {
    fn new(plugin: Box<dyn AudioPlugin>, message_thread: MessageThread) -> Self {
        let name = plugin.name().to_string();
        Self {
            cell: Arc::new(PluginCell {
                plugin: Mutex::new(Some(plugin)),
                message_thread,
                name,
            }),
        }
    }

    /// Run a closure against the plugin. Returns `None` when the plugin is
    /// already torn down.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn AudioPlugin) -> R) -> Option<R> {
        let mut guard = self.cell.plugin.lock();
        guard.as_mut().map(|p| f(p.as_mut()))
    }

    fn downgrade(&self) -> WeakPlugin {
        WeakPlugin {
            cell: Arc::downgrade(&self.cell),
        }
    }
}

/// Weak counterpart of [`SharedPlugin`], held by parameter relays.
pub(crate) struct WeakPlugin {
    cell: Weak<PluginCell>,
}

impl WeakPlugin {
    fn upgrade(&self) -> Option<SharedPlugin> {
        self.cell.upgrade().map(|cell| SharedPlugin { cell })
    }
}

/// Listener registered on every parameter of a hosted plugin.
///
/// Notifications arrive on arbitrary SDK threads; the relay takes the
/// shared handle before doing anything so a racing unload cannot pull the
/// plugin out from under it.
struct ParameterRelay {
    plugin: WeakPlugin,
    plugin_id: String,
    sink: Option<Arc<dyn ParameterListener>>,
}

impl ParameterListener for ParameterRelay {
    fn parameter_changed(&self, index: usize, value: f32) {
        let Some(_alive) = self.plugin.upgrade() else {
            return;
        };
        match &self.sink {
            Some(sink) => sink.parameter_changed(index, value),
            None => trace!("{}: parameter {} -> {}", self.plugin_id, index, value),
        }
    }
}

/// One slot of the processor chain: a loaded (or loadable) plugin plus its
/// bypass and latency state.
pub struct PluginInstance {
    id: String,
    sample_rate: f64,
    block_size: usize,
    serialize_loads: bool,

    /// Guards the handle slot only; never held across a process call.
    plugin: Mutex<Option<SharedPlugin>>,
    relay: Option<Arc<ParameterRelay>>,
    description: Option<PluginDescription>,

    prepared: bool,
    suspended: bool,
    last_known_latency: usize,
    extra_in_channels: usize,
    extra_out_channels: usize,
    needs_disabled_sidechain: bool,
    layout: BusesLayout,
    chain_index: usize,

    bypass_f32: Vec<VecDeque<f32>>,
    bypass_f64: Vec<VecDeque<f64>>,
}

impl PluginInstance {
    /// Create an empty wrapper for the given id.
    pub fn new(id: impl Into<String>, sample_rate: f64, block_size: usize, serialize_loads: bool) -> Self {
        Self {
            id: id.into(),
            sample_rate,
            block_size,
            serialize_loads,
            plugin: Mutex::new(None),
            relay: None,
            description: None,
            prepared: false,
            suspended: false,
            last_known_latency: 0,
            extra_in_channels: 0,
            extra_out_channels: 0,
            needs_disabled_sidechain: false,
            layout: BusesLayout::default(),
            chain_index: 0,
            bypass_f32: Vec::new(),
            bypass_f64: Vec::new(),
        }
    }

    /// The wrapper's textual plugin id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Description resolved at load time.
    pub fn description(&self) -> Option<&PluginDescription> {
        self.description.as_ref()
    }

    /// Whether a plugin is currently loaded.
    pub fn is_loaded(&self) -> bool {
        self.plugin.lock().is_some()
    }

    /// Whether the plugin holds processing resources.
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Whether the wrapper is logically bypassed.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Latency last reported by the plugin, in samples.
    pub fn latency(&self) -> usize {
        self.last_known_latency
    }

    /// Position in the owning chain.
    pub fn chain_index(&self) -> usize {
        self.chain_index
    }

    pub(crate) fn set_chain_index(&mut self, index: usize) {
        self.chain_index = index;
    }

    pub(crate) fn layout(&self) -> &BusesLayout {
        &self.layout
    }

    pub(crate) fn set_layout(&mut self, layout: BusesLayout) {
        self.layout = layout;
    }

    pub(crate) fn needs_disabled_sidechain(&self) -> bool {
        self.needs_disabled_sidechain
    }

    pub(crate) fn set_needs_disabled_sidechain(&mut self, value: bool) {
        self.needs_disabled_sidechain = value;
    }

    pub(crate) fn extra_channels(&self) -> (usize, usize) {
        (self.extra_in_channels, self.extra_out_channels)
    }

    pub(crate) fn set_extra_channels(&mut self, inputs: usize, outputs: usize) {
        self.extra_in_channels = inputs;
        self.extra_out_channels = outputs;
    }

    /// Run a closure against the loaded plugin, if any.
    ///
    /// Clones the shared handle under the slot mutex and releases it before
    /// the closure runs, so an unload never waits on plugin code.
    pub fn with_plugin<R>(&self, f: impl FnOnce(&mut dyn AudioPlugin) -> R) -> Option<R> {
        let shared = self.plugin.lock().clone();
        shared.and_then(|s| s.with(f))
    }

    /// Resolve the id and instantiate the plugin on the message thread.
    ///
    /// A second call with the plugin already present is a no-op returning
    /// success. Serializes around the process-wide loader mutex when the
    /// server disallows parallel loads.
    pub fn load(
        &mut self,
        catalog: &Arc<dyn PluginCatalog>,
        message_thread: &MessageThread,
    ) -> PluginResult<()> {
        if self.plugin.lock().is_some() {
            return Ok(());
        }
        let _serial = super::loader_guard(self.serialize_loads);

        let description = id::find_plugin_description(catalog.as_ref(), &self.id)
            .ok_or_else(|| PluginLoadError::UnknownId(self.id.clone()))?;

        let catalog = Arc::clone(catalog);
        let create_desc = description.clone();
        let (sample_rate, block_size) = (self.sample_rate, self.block_size);
        let created = message_thread
            .call(move || catalog.create_instance(&create_desc, sample_rate, block_size))
            .map_err(|e| PluginLoadError::CreateFailed {
                name: description.name.clone(),
                reason: e.to_string(),
            })?;
        let plugin = created.map_err(|reason| PluginLoadError::CreateFailed {
            name: description.name.clone(),
            reason,
        })?;

        let shared = SharedPlugin::new(plugin, message_thread.clone());
        self.layout = shared.with(|p| p.buses_layout()).unwrap_or_default();
        *self.plugin.lock() = Some(shared);
        super::count_plugin_loaded();
        info!("Loaded plugin '{}' ({})", description.name, self.id);
        self.description = Some(description);
        Ok(())
    }

    /// Release and drop the plugin. The final handle defers destruction to
    /// the message thread.
    pub fn unload(&mut self) {
        let _serial = super::loader_guard(self.serialize_loads);

        let taken = {
            let mut slot = self.plugin.lock();
            let Some(shared) = slot.take() else {
                return;
            };
            if self.prepared {
                shared.with(|p| p.release_resources());
                self.prepared = false;
            }
            if let Some(relay) = self.relay.take() {
                let listener: Arc<dyn ParameterListener> = relay;
                shared.with(|p| p.remove_parameter_listener(&listener));
            }
            super::count_plugin_unloaded();
            shared
        };
        // The handle (and with it any deferred destruction) drops outside
        // the slot mutex.
        drop(taken);
        info!("Unloaded plugin {}", self.id);
    }

    /// Register the wrapper's relay as a listener on every parameter.
    pub(crate) fn register_parameter_listener(&mut self, sink: Option<Arc<dyn ParameterListener>>) {
        let shared = self.plugin.lock().clone();
        if let Some(shared) = shared {
            let relay = Arc::new(ParameterRelay {
                plugin: shared.downgrade(),
                plugin_id: self.id.clone(),
                sink,
            });
            let listener: Arc<dyn ParameterListener> = relay.clone();
            shared.with(|p| p.add_parameter_listener(listener));
            self.relay = Some(relay);
        }
    }

    /// Forward `prepare_to_play`, remembering the chain's current rate and
    /// block size.
    pub fn prepare_to_play(&mut self, sample_rate: f64, block_size: usize) {
        self.sample_rate = sample_rate;
        self.block_size = block_size;
        if self
            .with_plugin(|p| p.prepare_to_play(sample_rate, block_size))
            .is_some()
        {
            self.prepared = true;
        }
    }

    /// Forward `release_resources`.
    pub fn release_resources(&mut self) {
        self.with_plugin(|p| p.release_resources());
        self.prepared = false;
    }

    /// Toggle bypass. Suspending releases the plugin's resources; resuming
    /// re-prepares at the chain's current rate and block size.
    pub fn set_suspended(&mut self, suspended: bool) {
        if suspended == self.suspended {
            return;
        }
        if suspended {
            self.with_plugin(|p| {
                p.suspend_processing(true);
                p.release_resources();
            });
            self.prepared = false;
        } else {
            let (sample_rate, block_size) = (self.sample_rate, self.block_size);
            if self
                .with_plugin(|p| {
                    p.prepare_to_play(sample_rate, block_size);
                    p.suspend_processing(false);
                })
                .is_some()
            {
                self.prepared = true;
            }
        }
        self.suspended = suspended;
        debug!("{} {}", self.id, if suspended { "suspended" } else { "resumed" });
    }

    pub(crate) fn set_precision(&mut self, precision: Precision) {
        self.with_plugin(|p| p.set_processing_precision(precision));
    }

    pub(crate) fn install_play_head(&mut self, play_head: PlayHead) {
        self.with_plugin(|p| p.set_play_head(play_head));
    }

    pub(crate) fn enable_all_buses(&mut self) {
        self.with_plugin(|p| p.enable_all_buses());
    }

    /// Whether this slot can process 64-bit blocks natively.
    pub fn supports_double_precision(&self) -> bool {
        self.with_plugin(|p| p.supports_double_precision())
            .unwrap_or_else(|| self.description.as_ref().map_or(true, |d| d.supports_double))
    }

    /// Tail the plugin reports, in seconds.
    pub fn tail_seconds(&self) -> f64 {
        self.with_plugin(|p| p.tail_seconds()).unwrap_or(0.0)
    }

    /// Normalized parameter value; 0.0 on any out-of-range access.
    pub fn parameter_value(&self, index: usize) -> f32 {
        self.with_plugin(|p| {
            if index < p.parameter_count() {
                p.parameter_value(index)
            } else {
                0.0
            }
        })
        .unwrap_or(0.0)
    }

    /// Process one 32-bit block through the plugin.
    pub fn process_block_f32(&mut self, buffer: &mut AudioBuffer<f32>, midi: &mut MidiBuffer) {
        self.with_plugin(|p| p.process_f32(buffer, midi));
    }

    /// Process one 64-bit block through the plugin.
    pub fn process_block_f64(&mut self, buffer: &mut AudioBuffer<f64>, midi: &mut MidiBuffer) {
        self.with_plugin(|p| p.process_f64(buffer, midi));
    }

    /// Bypass one 32-bit block, delaying it by the plugin's latency so
    /// toggling bypass never jumps in time.
    pub fn process_block_bypassed_f32(&mut self, buffer: &mut AudioBuffer<f32>) {
        let (inputs, outputs) = self.io_channels();
        Self::bypass_block(&mut self.bypass_f32, buffer, inputs, outputs);
    }

    /// Bypass one 64-bit block.
    pub fn process_block_bypassed_f64(&mut self, buffer: &mut AudioBuffer<f64>) {
        let (inputs, outputs) = self.io_channels();
        Self::bypass_block(&mut self.bypass_f64, buffer, inputs, outputs);
    }

    fn io_channels(&self) -> (usize, usize) {
        (
            self.layout.total_input_channels() as usize,
            self.layout.total_output_channels() as usize,
        )
    }

    fn bypass_block<S: Sample>(
        fifos: &mut [VecDeque<S>],
        buffer: &mut AudioBuffer<S>,
        input_channels: usize,
        output_channels: usize,
    ) {
        let output_channels = output_channels.min(buffer.num_channels());
        // Output-only channels would otherwise leak the previous block.
        for c in input_channels..output_channels {
            buffer.clear_channel(c);
        }
        if fifos.len() < output_channels {
            // Stale delay state; update_latency_buffers must run before
            // bypass re-activates.
            buffer.clear();
            return;
        }
        for c in 0..output_channels {
            let fifo = &mut fifos[c];
            for sample in buffer.channel_mut(c) {
                fifo.push_back(*sample);
                if let Some(head) = fifo.pop_front() {
                    *sample = head;
                }
            }
        }
    }

    /// Re-read the plugin's latency and resize the bypass FIFOs to match.
    /// Returns true when the latency changed.
    pub(crate) fn refresh_latency(&mut self) -> bool {
        let current = self
            .with_plugin(|p| p.latency_samples())
            .unwrap_or(self.last_known_latency);
        let changed = current != self.last_known_latency;
        if changed {
            debug!("{}: latency {} -> {} samples", self.id, self.last_known_latency, current);
            self.last_known_latency = current;
        }
        self.update_latency_buffers();
        changed
    }

    /// Resize every per-channel FIFO to exactly the current latency,
    /// zero-padding on growth and dropping the oldest samples on shrink.
    pub(crate) fn update_latency_buffers(&mut self) {
        let channels = self.layout.total_output_channels() as usize;
        Self::resize_fifos(&mut self.bypass_f32, channels, self.last_known_latency);
        Self::resize_fifos(&mut self.bypass_f64, channels, self.last_known_latency);
    }

    fn resize_fifos<S: Sample>(fifos: &mut Vec<VecDeque<S>>, channels: usize, len: usize) {
        if fifos.len() < channels {
            fifos.resize_with(channels, VecDeque::new);
        }
        for fifo in fifos.iter_mut() {
            while fifo.len() < len {
                fifo.push_back(S::ZERO);
            }
            while fifo.len() > len {
                fifo.pop_front();
            }
        }
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        self.unload();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeSpec, TestCatalog};
    use remoterack_plugin_api::ChannelSet;
    use std::sync::atomic::Ordering;

    fn loaded_instance(spec: FakeSpec) -> (PluginInstance, MessageThread) {
        let plugin_id = spec.plugin_id();
        let catalog = TestCatalog::with_specs(vec![spec]).into_arc();
        let message_thread = MessageThread::spawn().unwrap();
        let mut instance = PluginInstance::new(plugin_id, 48000.0, 512, false);
        instance.load(&catalog, &message_thread).unwrap();
        (instance, message_thread)
    }

    #[test]
    fn test_load_twice_is_noop() {
        let spec = FakeSpec::new("Comp", 0x100);
        let created = spec.created_count();
        let plugin_id = spec.plugin_id();
        let catalog = TestCatalog::with_specs(vec![spec]).into_arc();
        let message_thread = MessageThread::spawn().unwrap();

        let mut instance = PluginInstance::new(plugin_id, 48000.0, 512, false);
        instance.load(&catalog, &message_thread).unwrap();
        instance.load(&catalog, &message_thread).unwrap();
        assert_eq!(created.load(Ordering::Relaxed), 1);
        assert!(instance.is_loaded());

        instance.unload();
        assert!(!instance.is_loaded());
        assert!(!instance.is_prepared());
        // A fresh load works again after unload.
        instance.load(&catalog, &message_thread).unwrap();
        assert_eq!(created.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_load_unknown_id_fails() {
        let catalog = TestCatalog::with_specs(vec![]).into_arc();
        let message_thread = MessageThread::spawn().unwrap();
        let mut instance = PluginInstance::new("VST3-Nope-1", 48000.0, 512, false);
        let err = instance.load(&catalog, &message_thread).unwrap_err();
        assert!(matches!(err, PluginLoadError::UnknownId(_)));
        assert!(!instance.is_loaded());
    }

    #[test]
    fn test_failed_create_reports_sdk_error() {
        let spec = FakeSpec::new("Broken", 0x200).fail_create("bad dsp");
        let plugin_id = spec.plugin_id();
        let catalog = TestCatalog::with_specs(vec![spec]).into_arc();
        let message_thread = MessageThread::spawn().unwrap();
        let mut instance = PluginInstance::new(plugin_id, 48000.0, 512, false);
        match instance.load(&catalog, &message_thread) {
            Err(PluginLoadError::CreateFailed { reason, .. }) => assert_eq!(reason, "bad dsp"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_plugin_destroyed_on_message_thread() {
        let spec = FakeSpec::new("Verb", 0x300);
        let drop_thread = spec.drop_thread();
        let (mut instance, message_thread) = loaded_instance(spec);
        instance.unload();
        // Round-trip through the message thread so the posted drop ran.
        message_thread.call(|| {}).unwrap();
        assert_eq!(
            drop_thread.lock().as_deref(),
            Some(crate::message_thread::MESSAGE_THREAD_NAME)
        );
    }

    #[test]
    fn test_bypass_latency_compensation() {
        let spec = FakeSpec::new("Delay", 0x400).latency(4);
        let (mut instance, _mt) = loaded_instance(spec);
        instance.prepare_to_play(48000.0, 8);
        instance.refresh_latency();
        assert_eq!(instance.latency(), 4);

        let mut buffer = AudioBuffer::<f32>::new(2, 8);
        buffer.channel_mut(0)[0] = 1.0;
        instance.process_block_bypassed_f32(&mut buffer);
        assert_eq!(buffer.channel(0), &[0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_bypass_is_identity_at_zero_latency() {
        let spec = FakeSpec::new("Gain", 0x500);
        let (mut instance, _mt) = loaded_instance(spec);
        instance.refresh_latency();

        let mut buffer = AudioBuffer::<f32>::new(2, 4);
        buffer.channel_mut(0).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        instance.process_block_bypassed_f32(&mut buffer);
        assert_eq!(buffer.channel(0), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_bypass_clears_output_only_channels() {
        let spec = FakeSpec::new("Widener", 0x600)
            .layout(vec![ChannelSet::Mono], vec![ChannelSet::Stereo]);
        let (mut instance, _mt) = loaded_instance(spec);
        instance.refresh_latency();

        let mut buffer = AudioBuffer::<f32>::new(2, 4);
        buffer.channel_mut(0).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        buffer.channel_mut(1).copy_from_slice(&[9.0, 9.0, 9.0, 9.0]);
        instance.process_block_bypassed_f32(&mut buffer);
        assert_eq!(buffer.channel(0), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(buffer.channel(1), &[0.0; 4]);
    }

    #[test]
    fn test_bypass_without_fifos_clears_buffer() {
        let spec = FakeSpec::new("Comp", 0x700).latency(2);
        let (mut instance, _mt) = loaded_instance(spec);
        // update_latency_buffers intentionally not called.

        let mut buffer = AudioBuffer::<f32>::new(2, 4);
        buffer.channel_mut(0).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        instance.process_block_bypassed_f32(&mut buffer);
        assert_eq!(buffer.channel(0), &[0.0; 4]);
        assert_eq!(buffer.channel(1), &[0.0; 4]);
    }

    #[test]
    fn test_update_latency_buffers_resizes_exactly() {
        let spec = FakeSpec::new("Comp", 0x800).latency(3);
        let (mut instance, _mt) = loaded_instance(spec);
        instance.refresh_latency();
        assert!(instance.bypass_f32.iter().all(|f| f.len() == 3));
        assert!(instance.bypass_f64.iter().all(|f| f.len() == 3));
        assert_eq!(instance.bypass_f32.len(), 2);

        // Shrink drops from the head.
        instance.bypass_f32[0].clear();
        instance.bypass_f32[0].extend([1.0, 2.0, 3.0]);
        instance.last_known_latency = 1;
        instance.update_latency_buffers();
        assert_eq!(instance.bypass_f32[0], [3.0]);
    }

    #[test]
    fn test_suspend_releases_and_resume_reprepares() {
        let spec = FakeSpec::new("Comp", 0x900);
        let prepared = spec.prepared_flag();
        let (mut instance, _mt) = loaded_instance(spec);
        instance.prepare_to_play(48000.0, 256);
        assert!(*prepared.lock());

        instance.set_suspended(true);
        assert!(instance.is_suspended());
        assert!(!instance.is_prepared());
        assert!(!*prepared.lock());

        instance.set_suspended(false);
        assert!(!instance.is_suspended());
        assert!(instance.is_prepared());
        assert!(*prepared.lock());
    }

    #[test]
    fn test_parameter_value_bounds() {
        let spec = FakeSpec::new("Eq", 0xa00).parameters(vec![0.25, 0.5]);
        let (instance, _mt) = loaded_instance(spec);
        assert_eq!(instance.parameter_value(1), 0.5);
        assert_eq!(instance.parameter_value(7), 0.0);
    }
}
