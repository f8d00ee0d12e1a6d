// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Plugin identity, catalog interface, and the instance wrapper.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐
//! │ ProcessorChain │  ← owns the ordered wrappers
//! └───────┬────────┘
//!         │
//!         ▼
//! ┌────────────────┐      ┌───────────────┐
//! │ PluginInstance │ ───> │ PluginCatalog │  ← resolves ids, creates
//! │   (wrapper)    │      │  (external)   │    plugins on the message
//! └───────┬────────┘      └───────────────┘    thread
//!         │
//!         ▼
//!   Box<dyn AudioPlugin>   ← hosted third-party plugin
//! ```

pub mod catalog;
pub mod id;
pub mod instance;

pub use catalog::{PluginCatalog, PluginDescription};
pub use instance::{PluginInstance, SharedPlugin};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Plugin format tag carried by descriptions and plugin ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginFormat {
    /// Apple AudioUnit.
    AudioUnit,
    /// Steinberg VST 2.x.
    Vst,
    /// Steinberg VST 3.
    Vst3,
}

impl PluginFormat {
    /// The tag used in textual plugin ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AudioUnit => "AudioUnit",
            Self::Vst => "VST",
            Self::Vst3 => "VST3",
        }
    }
}

impl FromStr for PluginFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AudioUnit" => Ok(Self::AudioUnit),
            "VST" => Ok(Self::Vst),
            "VST3" => Ok(Self::Vst3),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for PluginFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for plugin load operations.
#[derive(Debug, thiserror::Error)]
pub enum PluginLoadError {
    /// The id resolved to nothing in the catalog.
    #[error("unknown plugin id: {0}")]
    UnknownId(String),

    /// The plugin SDK refused to instantiate the plugin.
    #[error("failed to create '{name}': {reason}")]
    CreateFailed {
        /// Plugin name from the description.
        name: String,
        /// SDK error string.
        reason: String,
    },
}

/// Result type for plugin load operations.
pub type PluginResult<T> = Result<T, PluginLoadError>;

/// Plugins currently loaded across the whole process.
static LOADED_PLUGINS: AtomicUsize = AtomicUsize::new(0);

/// Serializes load/unload when the server disallows parallel plugin loads.
static PLUGIN_LOADER_MUTEX: Mutex<()> = Mutex::new(());

/// Number of plugins currently loaded in this process.
pub fn loaded_plugin_count() -> usize {
    LOADED_PLUGINS.load(Ordering::Relaxed)
}

pub(crate) fn count_plugin_loaded() {
    LOADED_PLUGINS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_plugin_unloaded() {
    LOADED_PLUGINS.fetch_sub(1, Ordering::Relaxed);
}

/// Lock the process-wide loader mutex when `serialize` is set.
pub(crate) fn loader_guard(serialize: bool) -> Option<parking_lot::MutexGuard<'static, ()>> {
    serialize.then(|| PLUGIN_LOADER_MUTEX.lock())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_tags_round_trip() {
        for format in [PluginFormat::AudioUnit, PluginFormat::Vst, PluginFormat::Vst3] {
            assert_eq!(format.as_str().parse::<PluginFormat>(), Ok(format));
        }
        assert!("AAX".parse::<PluginFormat>().is_err());
    }
}
