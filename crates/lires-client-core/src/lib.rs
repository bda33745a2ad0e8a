//! # Lires Client Core
//!
//! Network-free data layer of the Lires client: hierarchical tag algebra,
//! document records and the in-memory index, record-stream decoding and
//! ingestion, search and ordering, server event types, the handler
//! registry, and the reconnect state machine.
//!
//! This crate contains no tokio, HTTP, or WebSocket dependencies. The
//! application crate supplies transports (`reqwest`, `tokio-tungstenite`)
//! and drives these pieces.

pub mod channel;
pub mod error;
pub mod events;
pub mod index;
pub mod models;
pub mod search;
pub mod stream;
pub mod tags;

pub use error::{Error, Result};
pub use index::DocumentIndex;
pub use models::DocumentRecord;
pub use tags::{TagHierarchy, TagSet};
