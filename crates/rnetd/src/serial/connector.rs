//! Ways of reaching the bus.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::BusEndpoint;

/// A byte stream to the bus.
pub trait BusStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BusStream for T {}

/// Opens a fresh link to the bus. Called again after every failure.
#[async_trait]
pub trait BusConnector: Send + Sync + fmt::Debug {
    async fn connect(&self) -> io::Result<Box<dyn BusStream>>;

    /// Human-readable endpoint for logs.
    fn describe(&self) -> String;
}

/// A serial device node such as `/dev/ttyUSB0`.
#[derive(Debug, Clone)]
pub struct DeviceConnector {
    path: PathBuf,
    baud_rate: u32,
}

impl DeviceConnector {
    pub fn new(path: impl Into<PathBuf>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }
}

#[async_trait]
impl BusConnector for DeviceConnector {
    #[cfg(unix)]
    async fn connect(&self) -> io::Result<Box<dyn BusStream>> {
        let device = super::device::SerialDevice::open(&self.path, self.baud_rate)?;
        Ok(Box::new(device))
    }

    #[cfg(not(unix))]
    async fn connect(&self) -> io::Result<Box<dyn BusStream>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "serial device nodes need a unix host, use a TCP serial bridge",
        ))
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path.display(), self.baud_rate)
    }
}

/// A serial-over-TCP bridge (`host:port`).
#[derive(Debug, Clone)]
pub struct TcpBridgeConnector {
    addr: String,
}

impl TcpBridgeConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl BusConnector for TcpBridgeConnector {
    async fn connect(&self) -> io::Result<Box<dyn BusStream>> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Connector for a configured endpoint. `baud_rate` only applies to devices.
pub fn connector_for(endpoint: &BusEndpoint, baud_rate: u32) -> Arc<dyn BusConnector> {
    match endpoint {
        BusEndpoint::Device(path) => Arc::new(DeviceConnector::new(path.clone(), baud_rate)),
        BusEndpoint::Bridge(addr) => Arc::new(TcpBridgeConnector::new(addr.clone())),
    }
}
