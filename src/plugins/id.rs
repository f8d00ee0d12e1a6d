// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Textual plugin ids.
//!
//! The canonical form is `<format>-<name>-<hex-uid>`. Older clients send a
//! legacy form carrying an extra lowercase-hex file-hash segment before the
//! uid; conversion strips it. As a last resort an id may be a filesystem
//! path to a plugin bundle.

use super::catalog::{PluginCatalog, PluginDescription};
use regex::Regex;
use std::sync::OnceLock;

/// Matches the legacy id form `<format>-<name>-<filehash>-<hex-uid>`.
///
/// The name is matched greedily so hyphenated plugin names keep their
/// hyphens; only the last two segments are taken as hash and uid.
fn legacy_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(AudioUnit|VST|VST3)-(.+)-([0-9a-f]+)-([0-9a-fA-F]+)$")
            .expect("legacy id pattern is valid")
    })
}

/// Canonical id of a described plugin: `<format>-<name>-<hex-uid>`.
pub fn create_plugin_id(description: &PluginDescription) -> String {
    format!(
        "{}-{}-{:x}",
        description.format.as_str(),
        description.name,
        description.uid
    )
}

/// Convert a legacy id to canonical form.
///
/// Returns `None` unless the input matches the legacy pattern with a valid
/// format tag and a lowercase-hex file-hash segment.
pub fn convert_legacy_id(id: &str) -> Option<String> {
    let captures = legacy_pattern().captures(id)?;
    Some(format!("{}-{}-{}", &captures[1], &captures[2], &captures[4]))
}

/// Resolve an id against the catalog: by canonical id, by legacy id after
/// conversion, or as a filesystem path.
pub fn find_plugin_description(
    catalog: &dyn PluginCatalog,
    id: &str,
) -> Option<PluginDescription> {
    let types = catalog.types();
    if let Some(description) = types.iter().find(|d| create_plugin_id(d) == id) {
        return Some(description.clone());
    }
    if let Some(canonical) = convert_legacy_id(id) {
        if let Some(description) = types.iter().find(|d| create_plugin_id(d) == canonical) {
            return Some(description.clone());
        }
    }
    catalog.type_for_file(id)
}
