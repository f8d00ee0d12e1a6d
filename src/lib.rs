// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Remoterack server processing core.
//!
//! Remoterack offloads DAW plugin processing onto a server: a client
//! streams audio and MIDI blocks over the network, the server pumps them
//! through an ordered chain of hosted plugins and streams the processed
//! result back with compensated latency.
//!
//! This crate is the server's processing core. The connection handshake,
//! the byte-level frame codec, plugin discovery, and the editor bridge
//! live elsewhere; they hand this core a connected
//! [`FrameTransport`](remoterack_wire::FrameTransport), fixed
//! [`SessionParams`](remoterack_wire::SessionParams), and a read-only
//! [`PluginCatalog`](plugins::PluginCatalog).
//!
//! # Architecture
//!
//! ```text
//! socket ──> SessionWorker ──> ProcessorChain ──> PluginInstance*
//!               │   ▲               │
//!               │   └─ processed    └─ bus negotiation, aggregates,
//!               │      blocks          per-block dispatch
//!               ▼
//!          recents registry
//! ```

pub mod chain;
pub mod channel_map;
pub mod config;
pub mod message_thread;
pub mod plugins;
pub mod recents;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use chain::{ChainError, ProcessorChain};
pub use channel_map::ChannelMapper;
pub use config::ServerConfig;
pub use message_thread::{MessageThread, MessageThreadError};
pub use plugins::{PluginCatalog, PluginDescription, PluginFormat, PluginInstance};
pub use worker::{SessionError, SessionWorker};
