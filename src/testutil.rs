// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shared test doubles: a configurable fake plugin, an in-memory catalog,
//! and a scripted frame transport.

use crate::plugins::catalog::{PluginCatalog, PluginDescription};
use crate::plugins::PluginFormat;
use parking_lot::Mutex;
use remoterack_plugin_api::{
    AudioBuffer, AudioPlugin, BusesLayout, ChannelSet, MidiBuffer, ParameterListener, PlayHead,
    Precision,
};
use remoterack_wire::{AudioFrame, FrameTransport, ResponseFrame};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn stereo() -> BusesLayout {
    BusesLayout {
        inputs: vec![ChannelSet::Stereo],
        outputs: vec![ChannelSet::Stereo],
    }
}

/// Recipe for a [`FakePlugin`], shared with the test so its observable
/// state (prepared flag, drop thread, processed blocks) stays reachable
/// after the catalog consumed the spec.
#[derive(Clone)]
pub(crate) struct FakeSpec {
    pub name: String,
    pub uid: u32,
    pub latency: usize,
    pub tail: f64,
    pub supports_double: bool,
    pub gain: f32,
    pub parameters: Vec<f32>,
    /// Layouts `set_buses_layout` accepts; `None` accepts anything.
    pub accepted: Option<Vec<BusesLayout>>,
    /// The plugin's own layout before a host layout is applied.
    pub preferred: BusesLayout,
    pub fail_create: Option<String>,
    pub drop_thread: Arc<Mutex<Option<String>>>,
    pub prepared: Arc<Mutex<bool>>,
    pub processed: Arc<AtomicUsize>,
    pub created: Arc<AtomicUsize>,
}

impl FakeSpec {
    pub fn new(name: &str, uid: u32) -> Self {
        Self {
            name: name.to_string(),
            uid,
            latency: 0,
            tail: 0.0,
            supports_double: true,
            gain: 1.0,
            parameters: Vec::new(),
            accepted: None,
            preferred: stereo(),
            fail_create: None,
            drop_thread: Arc::new(Mutex::new(None)),
            prepared: Arc::new(Mutex::new(false)),
            processed: Arc::new(AtomicUsize::new(0)),
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn latency(mut self, samples: usize) -> Self {
        self.latency = samples;
        self
    }

    pub fn tail(mut self, seconds: f64) -> Self {
        self.tail = seconds;
        self
    }

    pub fn gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    pub fn single_precision(mut self) -> Self {
        self.supports_double = false;
        self
    }

    pub fn parameters(mut self, values: Vec<f32>) -> Self {
        self.parameters = values;
        self
    }

    pub fn layout(mut self, inputs: Vec<ChannelSet>, outputs: Vec<ChannelSet>) -> Self {
        self.preferred = BusesLayout { inputs, outputs };
        self
    }

    /// Restrict `set_buses_layout` to exactly these layouts.
    pub fn accept_only(mut self, layouts: Vec<BusesLayout>) -> Self {
        self.accepted = Some(layouts);
        self
    }

    pub fn fail_create(mut self, reason: &str) -> Self {
        self.fail_create = Some(reason.to_string());
        self
    }

    pub fn drop_thread(&self) -> Arc<Mutex<Option<String>>> {
        Arc::clone(&self.drop_thread)
    }

    pub fn prepared_flag(&self) -> Arc<Mutex<bool>> {
        Arc::clone(&self.prepared)
    }

    pub fn processed_blocks(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.processed)
    }

    pub fn created_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.created)
    }

    pub fn description(&self) -> PluginDescription {
        PluginDescription {
            format: PluginFormat::Vst3,
            name: self.name.clone(),
            uid: self.uid,
            file_or_identifier: format!("/plugins/{}.vst3", self.name),
            num_inputs: self.preferred.total_input_channels(),
            num_outputs: self.preferred.total_output_channels(),
            supports_double: self.supports_double,
        }
    }

    pub fn plugin_id(&self) -> String {
        crate::plugins::id::create_plugin_id(&self.description())
    }
}

pub(crate) struct FakePlugin {
    spec: FakeSpec,
    current_layout: BusesLayout,
    listeners: Vec<Arc<dyn ParameterListener>>,
}

impl FakePlugin {
    fn new(spec: FakeSpec) -> Self {
        let current_layout = spec.preferred.clone();
        Self {
            spec,
            current_layout,
            listeners: Vec::new(),
        }
    }

    fn accepts(&self, layout: &BusesLayout) -> bool {
        match &self.spec.accepted {
            Some(layouts) => layouts.contains(layout),
            None => true,
        }
    }
}

impl AudioPlugin for FakePlugin {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn prepare_to_play(&mut self, _sample_rate: f64, _block_size: usize) {
        *self.spec.prepared.lock() = true;
    }

    fn release_resources(&mut self) {
        *self.spec.prepared.lock() = false;
    }

    fn process_f32(&mut self, buffer: &mut AudioBuffer<f32>, _midi: &mut MidiBuffer) {
        self.spec.processed.fetch_add(1, Ordering::Relaxed);
        for ch in 0..buffer.num_channels() {
            for sample in buffer.channel_mut(ch) {
                *sample *= self.spec.gain;
            }
        }
    }

    fn process_f64(&mut self, buffer: &mut AudioBuffer<f64>, _midi: &mut MidiBuffer) {
        self.spec.processed.fetch_add(1, Ordering::Relaxed);
        for ch in 0..buffer.num_channels() {
            for sample in buffer.channel_mut(ch) {
                *sample *= self.spec.gain as f64;
            }
        }
    }

    fn set_processing_precision(&mut self, _precision: Precision) {}

    fn supports_double_precision(&self) -> bool {
        self.spec.supports_double
    }

    fn latency_samples(&self) -> usize {
        self.spec.latency
    }

    fn tail_seconds(&self) -> f64 {
        self.spec.tail
    }

    fn check_buses_layout(&self, layout: &BusesLayout) -> bool {
        self.accepts(layout)
    }

    fn set_buses_layout(&mut self, layout: &BusesLayout) -> bool {
        if self.accepts(layout) {
            self.current_layout = layout.clone();
            true
        } else {
            false
        }
    }

    fn buses_layout(&self) -> BusesLayout {
        self.current_layout.clone()
    }

    fn set_play_head(&mut self, _play_head: PlayHead) {}

    fn parameter_count(&self) -> usize {
        self.spec.parameters.len()
    }

    fn parameter_value(&self, index: usize) -> f32 {
        self.spec.parameters.get(index).copied().unwrap_or(0.0)
    }

    fn add_parameter_listener(&mut self, listener: Arc<dyn ParameterListener>) {
        self.listeners.push(listener);
    }

    fn remove_parameter_listener(&mut self, listener: &Arc<dyn ParameterListener>) {
        self.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }
}

impl Drop for FakePlugin {
    fn drop(&mut self) {
        *self.spec.drop_thread.lock() =
            std::thread::current().name().map(str::to_string);
    }
}

/// In-memory catalog of fake plugins.
pub(crate) struct TestCatalog {
    entries: Vec<(PluginDescription, FakeSpec)>,
}

impl TestCatalog {
    pub fn with_specs(specs: Vec<FakeSpec>) -> Self {
        Self {
            entries: specs.into_iter().map(|s| (s.description(), s)).collect(),
        }
    }

    pub fn with_descriptions(descriptions: Vec<PluginDescription>) -> Self {
        Self {
            entries: descriptions
                .into_iter()
                .map(|d| {
                    let spec = FakeSpec::new(&d.name, d.uid);
                    (d, spec)
                })
                .collect(),
        }
    }

    pub fn into_arc(self) -> Arc<dyn PluginCatalog> {
        Arc::new(self)
    }
}

impl PluginCatalog for TestCatalog {
    fn types(&self) -> Vec<PluginDescription> {
        self.entries.iter().map(|(d, _)| d.clone()).collect()
    }

    fn type_for_file(&self, path: &str) -> Option<PluginDescription> {
        self.entries
            .iter()
            .find(|(d, _)| d.file_or_identifier == path)
            .map(|(d, _)| d.clone())
    }

    fn create_instance(
        &self,
        description: &PluginDescription,
        _sample_rate: f64,
        _block_size: usize,
    ) -> Result<Box<dyn AudioPlugin>, String> {
        let (_, spec) = self
            .entries
            .iter()
            .find(|(d, _)| d.uid == description.uid)
            .ok_or_else(|| "not in catalog".to_string())?;
        if let Some(reason) = &spec.fail_create {
            return Err(reason.clone());
        }
        spec.created.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(FakePlugin::new(spec.clone())))
    }
}

/// Transport that feeds a fixed script of frames and records responses.
pub(crate) struct ScriptTransport {
    incoming: VecDeque<AudioFrame>,
    written: Arc<Mutex<Vec<ResponseFrame>>>,
    closed: Arc<AtomicBool>,
}

impl ScriptTransport {
    pub fn new(
        frames: Vec<AudioFrame>,
    ) -> (Self, Arc<Mutex<Vec<ResponseFrame>>>, Arc<AtomicBool>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                incoming: frames.into(),
                written: Arc::clone(&written),
                closed: Arc::clone(&closed),
            },
            written,
            closed,
        )
    }
}

impl FrameTransport for ScriptTransport {
    fn wait_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
        Ok(true)
    }

    fn read_frame(&mut self) -> io::Result<AudioFrame> {
        self.incoming
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "end of script"))
    }

    fn write_frame(&mut self, frame: &ResponseFrame) -> io::Result<()> {
        self.written.lock().push(frame.clone());
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
