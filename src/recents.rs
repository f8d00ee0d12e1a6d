// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-host registry of recently used plugins.
//!
//! Lives for the whole process: hosts come and go with their sessions, but
//! their recents survive reconnects. Unbounded in hosts, bounded per host.

use crate::plugins::catalog::PluginDescription;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// Track recents per host key.
static RECENTS: Mutex<Option<HashMap<String, Vec<PluginDescription>>>> = Mutex::new(None);

/// Record a plugin use for a host: any prior equal entry is removed, the
/// description moves to the front, and the list truncates to `max`.
pub fn add_recent(host: &str, description: PluginDescription, max: usize) {
    let mut guard = RECENTS.lock();
    let map = guard.get_or_insert_with(HashMap::new);
    let list = map.entry(host.to_string()).or_default();
    list.retain(|d| d != &description);
    list.insert(0, description);
    list.truncate(max);
    debug!("Recents for {}: {} entries", host, list.len());
}

/// Render a host's recents, one JSON document per line, newline-terminated.
/// Unknown hosts render empty.
pub fn recents_for_host(host: &str) -> String {
    let guard = RECENTS.lock();
    let Some(list) = guard.as_ref().and_then(|map| map.get(host)) else {
        return String::new();
    };
    let mut rendered = String::new();
    for description in list {
        if let Ok(line) = serde_json::to_string(description) {
            rendered.push_str(&line);
            rendered.push('\n');
        }
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PluginFormat;

    fn description(name: &str, uid: u32) -> PluginDescription {
        PluginDescription {
            format: PluginFormat::Vst,
            name: name.to_string(),
            uid,
            file_or_identifier: format!("/plugins/{name}.so"),
            num_inputs: 2,
            num_outputs: 2,
            supports_double: false,
        }
    }

    #[test]
    fn test_most_recent_first_without_duplicates() {
        let host = "test-mru-host";
        add_recent(host, description("A", 1), 10);
        add_recent(host, description("B", 2), 10);
        add_recent(host, description("A", 1), 10);

        let rendered = recents_for_host(host);
        let names: Vec<_> = rendered
            .lines()
            .map(|l| serde_json::from_str::<PluginDescription>(l).unwrap().name)
            .collect();
        assert_eq!(names, ["A", "B"]);
        assert!(rendered.ends_with('\n'));
    }

    #[test]
    fn test_truncates_to_max() {
        let host = "test-truncate-host";
        for uid in 0..5 {
            add_recent(host, description(&format!("P{uid}"), uid), 3);
        }
        assert_eq!(recents_for_host(host).lines().count(), 3);
        assert!(recents_for_host(host).starts_with("{\"format\":\"Vst\",\"name\":\"P4\""));
    }

    #[test]
    fn test_unknown_host_is_empty() {
        assert_eq!(recents_for_host("never-seen"), "");
    }
}
