//! RNet Daemon - Bridge between the RNet serial bus and TCP clients
//!
//! This crate provides the runtime pieces of the bridge:
//! - `store` - authoritative zone/source/controller state
//! - `serial` - bus link with frame reassembly and reconnection
//! - `server` - TCP sessions and broadcast fan-out
//! - `coordinator` - single ordered event flow wiring the above together
//! - `discovery` - service advertisement seam
//! - `config` - TOML configuration
//! - `bridge` - startup and shutdown ordering
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   Event::Bus    ┌──────────────────┐  broadcast  ┌──────────────┐
//! │ SerialTransport  │────────────────▶│   Coordinator    │────────────▶│  TcpServer   │
//! │ (bus link)       │◀────────────────│ (owns StateStore)│◀────────────│  (sessions)  │
//! └──────────────────┘  outbound queue └────────▲─────────┘ Event::Client└──────────────┘
//!                                               │ Event::Command
//!                                      ┌────────┴─────────┐
//!                                      │ CoordinatorHandle│  (API layer)
//!                                      └──────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod serial;
pub mod server;
pub mod store;
