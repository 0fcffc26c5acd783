//! RNet Core - Shared domain types for the RNet bridge
//!
//! This crate provides the zone, source and controller model shared
//! between the packet codec (rnet-protocol) and the daemon (rnetd).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod controller;
pub mod error;
pub mod parameter;
pub mod source;
pub mod zone;

// Re-exports for convenience
pub use controller::Controller;
pub use error::{DomainError, DomainResult};
pub use parameter::ZoneParameter;
pub use source::{Source, SourceType};
pub use zone::{normalize_volume, Zone, ZoneId, MAX_VOLUME_LIMIT};
