//! # Lires Client
//!
//! Client-side data layer for a Lires reference library server.
//!
//! The network-free pieces (tag algebra, document index, record stream
//! decoding, search, event types, reconnect state machine) live in
//! [`lires_client_core`]. This crate adds the transports and the glue:
//!
//! ```text
//! ┌────────────┐  /filelist-stream  ┌────────────────┐   apply   ┌───────────────┐
//! │ ServerConn │───────────────────▶│ StreamIngestor │──────────▶│               │
//! │  (reqwest) │                    └────────────────┘           │    Library    │
//! └────────────┘                                                 │ DocumentIndex │
//! ┌──────────────┐   /ws frames   ┌─────────────────┐  events   │               │
//! │ EventChannel │───────────────▶│ HandlerRegistry │──────────▶│               │
//! │ (tungstenite)│                └─────────────────┘           └───────────────┘
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`conn`] | REST endpoints and the record stream |
//! | [`event_channel`] | WebSocket event channel with reconnects |
//! | [`library`] | Index ownership and load/event coordination |
//! | [`progress`] | Load progress reporting |

pub mod config;
pub mod conn;
pub mod event_channel;
pub mod library;
pub mod progress;
