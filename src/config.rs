// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Server configuration consumed by the processing core.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Default cap on the per-host recents list.
pub const DEFAULT_NUM_RECENTS: usize = 10;

/// Settings the processing core reads from the server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Allow plugins to load concurrently. When false, every load and
    /// unload serializes around a process-wide mutex; some plugin SDKs
    /// misbehave when instantiated in parallel.
    pub parallel_plugin_load: bool,
    /// Maximum entries kept per host in the recents registry.
    pub num_recents: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            parallel_plugin_load: false,
            num_recents: DEFAULT_NUM_RECENTS,
        }
    }
}

impl ServerConfig {
    /// Parse a config from TOML.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Default location of the server config file.
    pub fn default_path() -> Option<PathBuf> {
        directories::BaseDirs::new()
            .map(|d| d.config_dir().join("remoterack").join("server.toml"))
    }

    /// Load from a file, falling back to defaults when the file is absent
    /// or malformed.
    pub fn load_or_default(path: &std::path::Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match Self::from_toml(&contents) {
                Ok(config) => {
                    debug!("Loaded server config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Invalid server config {:?}: {}, using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                debug!("No server config at {:?}, using defaults", path);
                Self::default()
            }
        }
    }
}
