// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The read-only plugin catalog the core consumes.
//!
//! Discovery and scanning of installed plugins happen elsewhere; the core
//! only resolves descriptions and asks for instances. `create_instance`
//! has to run on the message thread; [`PluginInstance`](super::instance)
//! guarantees that.

use super::PluginFormat;
use remoterack_plugin_api::AudioPlugin;
use serde::{Deserialize, Serialize};

/// Description of an installed plugin, owned by the catalog and copied
/// into wrappers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescription {
    /// Plugin format.
    pub format: PluginFormat,
    /// Human-readable name.
    pub name: String,
    /// Stable unique id assigned by the plugin vendor.
    pub uid: u32,
    /// Bundle path or format-specific identifier.
    pub file_or_identifier: String,
    /// Input channels the plugin declares.
    pub num_inputs: u32,
    /// Output channels the plugin declares.
    pub num_outputs: u32,
    /// Whether the plugin can process 64-bit samples natively.
    pub supports_double: bool,
}

/// Read-only view of the installed-plugin catalog.
pub trait PluginCatalog: Send + Sync {
    /// All known plugin descriptions.
    fn types(&self) -> Vec<PluginDescription>;

    /// Resolve a filesystem path to a plugin bundle.
    fn type_for_file(&self, path: &str) -> Option<PluginDescription>;

    /// Instantiate a plugin at the given rate and block size.
    ///
    /// Must be called on the message thread. The error is the SDK's
    /// human-readable failure string.
    fn create_instance(
        &self,
        description: &PluginDescription,
        sample_rate: f64,
        block_size: usize,
    ) -> Result<Box<dyn AudioPlugin>, String>;
}
