//! Service advertisement for zero-configuration discovery.
//!
//! The server announces itself through a [`ServicePublisher`]. The
//! publisher is injected through a [`Context`] built once at startup, so
//! the server never reaches for a global.
//!
//! Failing to advertise is never fatal: the server keeps serving and
//! clients fall back to a configured address.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

/// Service type announced when none is configured.
pub const DEFAULT_SERVICE_TYPE: &str = "rnet";

/// Protocol version advertised in the metadata.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Advertisement
// ============================================================================

/// What gets announced on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAdvertisement {
    pub name: String,
    pub service_type: String,
    pub port: u16,
    pub metadata: BTreeMap<String, String>,
}

impl ServiceAdvertisement {
    /// Advertisement for the bridge's TCP endpoint.
    pub fn for_bridge(name: impl Into<String>, service_type: impl Into<String>, port: u16) -> Self {
        let metadata = BTreeMap::from([
            ("version".to_string(), PROTOCOL_VERSION.to_string()),
            ("protocol".to_string(), "tcp".to_string()),
        ]);
        Self {
            name: name.into(),
            service_type: service_type.into(),
            port,
            metadata,
        }
    }
}

impl fmt::Display for ServiceAdvertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, port {})", self.name, self.service_type, self.port)
    }
}

/// Lifecycle notifications from a publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Up,
    Error(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Service discovery is disabled")]
    Disabled,

    #[error("Failed to publish service: {0}")]
    Publish(String),
}

// ============================================================================
// Handle
// ============================================================================

type StopFn = Box<dyn FnOnce() + Send + Sync>;

/// A live advertisement. Dropping it without calling [`stop`](Self::stop)
/// leaves the advertisement to the publisher's own cleanup.
pub struct ServiceHandle {
    advertisement: ServiceAdvertisement,
    events: Option<mpsc::Receiver<ServiceEvent>>,
    on_stop: Option<StopFn>,
}

impl ServiceHandle {
    pub fn new(
        advertisement: ServiceAdvertisement,
        events: mpsc::Receiver<ServiceEvent>,
        on_stop: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            advertisement,
            events: Some(events),
            on_stop: Some(Box::new(on_stop)),
        }
    }

    pub fn advertisement(&self) -> &ServiceAdvertisement {
        &self.advertisement
    }

    /// Takes the event stream. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ServiceEvent>> {
        self.events.take()
    }

    /// Withdraws the advertisement.
    pub fn stop(mut self) {
        if let Some(on_stop) = self.on_stop.take() {
            on_stop();
        }
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("advertisement", &self.advertisement)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Publishers
// ============================================================================

/// Announces a service on the local network.
pub trait ServicePublisher: Send + Sync {
    /// Starts advertising.
    ///
    /// # Errors
    ///
    /// `DiscoveryError` if the advertisement could not be started. Callers
    /// treat this as "no auto-discovery" and carry on.
    fn publish(&self, advertisement: &ServiceAdvertisement)
        -> Result<ServiceHandle, DiscoveryError>;
}

/// Publisher that records the advertisement in the log and reports `Up`.
///
/// Used when no multicast responder is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

impl ServicePublisher for LogPublisher {
    fn publish(
        &self,
        advertisement: &ServiceAdvertisement,
    ) -> Result<ServiceHandle, DiscoveryError> {
        info!(
            name = %advertisement.name,
            service_type = %advertisement.service_type,
            port = advertisement.port,
            metadata = ?advertisement.metadata,
            "Advertising service"
        );

        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(ServiceEvent::Up);

        let name = advertisement.name.clone();
        Ok(ServiceHandle::new(advertisement.clone(), rx, move || {
            info!(name = %name, "Withdrew service advertisement");
        }))
    }
}

/// Publisher used when discovery is turned off in the configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledPublisher;

impl ServicePublisher for DisabledPublisher {
    fn publish(&self, _: &ServiceAdvertisement) -> Result<ServiceHandle, DiscoveryError> {
        Err(DiscoveryError::Disabled)
    }
}

// ============================================================================
// Context
// ============================================================================

/// Process-wide collaborators, built once by the binary and passed down.
#[derive(Clone)]
pub struct Context {
    pub publisher: Arc<dyn ServicePublisher>,
    pub service_type: String,
}

impl Context {
    pub fn new(publisher: Arc<dyn ServicePublisher>, service_type: impl Into<String>) -> Self {
        Self {
            publisher,
            service_type: service_type.into(),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(Arc::new(LogPublisher), DEFAULT_SERVICE_TYPE)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("service_type", &self.service_type)
            .finish_non_exhaustive()
    }
}
