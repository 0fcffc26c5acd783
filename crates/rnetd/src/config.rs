//! Bridge configuration loaded from a TOML file.
//!
//! ```toml
//! name = "Living Room RNet"
//!
//! [server]
//! port = 3000
//!
//! [bus]
//! device = "/dev/ttyUSB0"
//!
//! [[sources]]
//! id = 0
//! name = "Sonos"
//! type = "airplay"
//!
//! [[controllers]]
//! id = 0
//! zones = [{ name = "Kitchen" }, { name = "Den", max_volume = 80 }]
//! ```
//!
//! Every field except the bus endpoint has a default.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rnet_core::{Controller, Source, SourceType, ZoneId, MAX_VOLUME_LIMIT};
use rnet_protocol::NO_SOURCE;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::discovery::DEFAULT_SERVICE_TYPE;
use crate::serial::{DEFAULT_BAUD_RATE, SUPPORTED_BAUD_RATES};
use crate::store::StateStore;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "rnet.toml";

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name advertised to clients
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Sessions that have not sent a handshake by then are closed
    pub handshake_timeout_secs: u64,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            handshake_timeout_secs: 30,
            max_connections: 32,
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Address to bind.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` if `host` is not an IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port).parse().map_err(|_| {
            ConfigError::invalid(format!("server.host is not an IP address: {}", self.host))
        })
    }
}

/// Where the bus is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEndpoint {
    /// A serial device node, e.g. `/dev/ttyUSB0`
    Device(PathBuf),
    /// A TCP serial bridge, `host:port`
    Bridge(String),
}

impl BusEndpoint {
    /// Interprets a command-line value: anything that looks like a path
    /// is a device, `host:port` is a bridge.
    pub fn parse(value: &str) -> Self {
        if value.starts_with('/') || !value.contains(':') {
            Self::Device(PathBuf::from(value))
        } else {
            Self::Bridge(value.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    pub device: Option<PathBuf>,
    pub bridge: Option<String>,
    /// Line speed for `device`; 8N1 is fixed
    pub baud_rate: u32,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            device: None,
            bridge: None,
            baud_rate: DEFAULT_BAUD_RATE,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

impl BusConfig {
    /// The configured endpoint.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` unless exactly one of `device` and `bridge` is set.
    pub fn endpoint(&self) -> Result<BusEndpoint, ConfigError> {
        match (&self.device, &self.bridge) {
            (Some(device), None) => Ok(BusEndpoint::Device(device.clone())),
            (None, Some(bridge)) => Ok(BusEndpoint::Bridge(bridge.clone())),
            (None, None) => Err(ConfigError::invalid("bus needs either device or bridge")),
            (Some(_), Some(_)) => Err(ConfigError::invalid(
                "bus.device and bus.bridge are mutually exclusive",
            )),
        }
    }

    pub fn set_endpoint(&mut self, endpoint: BusEndpoint) {
        match endpoint {
            BusEndpoint::Device(path) => {
                self.device = Some(path);
                self.bridge = None;
            }
            BusEndpoint::Bridge(addr) => {
                self.device = None;
                self.bridge = Some(addr);
            }
        }
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub service_type: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub id: u8,
    pub name: String,
    #[serde(rename = "type", default)]
    pub source_type: SourceType,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    pub id: u8,
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZoneConfig {
    pub name: String,
    #[serde(default = "default_max_volume")]
    pub max_volume: u8,
}

fn default_name() -> String {
    "RNet Bridge".to_string()
}

fn default_max_volume() -> u8 {
    MAX_VOLUME_LIMIT
}

// ============================================================================
// Loading and validation
// ============================================================================

impl Config {
    /// Reads and validates a configuration file.
    ///
    /// The bus endpoint is not checked here so the command line can still
    /// supply it; call [`BusConfig::endpoint`] once overrides are applied.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }

    /// Checks the invariants the store relies on.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` if controller ids are not contiguous from 0,
    /// source ids repeat, a maximum volume exceeds 100, or the server
    /// settings cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (expected, controller) in self.controllers.iter().enumerate() {
            if usize::from(controller.id) != expected {
                return Err(ConfigError::invalid(format!(
                    "controller ids must be contiguous from 0, found {} at position {}",
                    controller.id, expected
                )));
            }
            if controller.zones.len() > usize::from(u8::MAX) {
                return Err(ConfigError::invalid(format!(
                    "controller {} has too many zones",
                    controller.id
                )));
            }
            for (zone, cfg) in controller.zones.iter().enumerate() {
                if cfg.max_volume > MAX_VOLUME_LIMIT {
                    return Err(ConfigError::invalid(format!(
                        "zone {}-{} max_volume {} exceeds {}",
                        controller.id, zone, cfg.max_volume, MAX_VOLUME_LIMIT
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id == NO_SOURCE {
                return Err(ConfigError::invalid(format!(
                    "source id {NO_SOURCE} is reserved for \"no source\""
                )));
            }
            if !seen.insert(source.id) {
                return Err(ConfigError::invalid(format!(
                    "duplicate source id {}",
                    source.id
                )));
            }
        }

        if self.server.max_connections == 0 {
            return Err(ConfigError::invalid("server.max_connections must be at least 1"));
        }
        let bus = &self.bus;
        if !SUPPORTED_BAUD_RATES.contains(&bus.baud_rate) {
            return Err(ConfigError::invalid(format!(
                "bus.baud_rate {} is not one of {:?}",
                bus.baud_rate, SUPPORTED_BAUD_RATES
            )));
        }
        if bus.reconnect_initial_ms == 0 || bus.reconnect_max_ms < bus.reconnect_initial_ms {
            return Err(ConfigError::invalid(
                "bus reconnect delays must satisfy 0 < reconnect_initial_ms <= reconnect_max_ms",
            ));
        }
        self.server.bind_addr()?;
        Ok(())
    }

    /// Builds the initial store from the configured topology.
    pub fn build_store(&self) -> StateStore {
        let controllers = self
            .controllers
            .iter()
            .map(|c| Controller::new(c.id, c.zones.iter().map(|z| z.name.clone())))
            .collect();
        let sources = self
            .sources
            .iter()
            .map(|s| Source::new(s.id, s.name.clone(), s.source_type))
            .collect();

        let mut store = StateStore::new(controllers, sources);
        for controller in &self.controllers {
            for (zone, cfg) in (0u8..).zip(&controller.zones) {
                let id = ZoneId::new(controller.id, zone);
                if let Err(e) = store.set_max_volume(id, i32::from(cfg.max_volume)) {
                    warn!(zone = %id, error = %e, "Ignoring configured max volume");
                }
            }
        }
        store
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
name = "Living Room"

[server]
port = 4000

[bus]
bridge = "10.0.0.5:7000"

[[sources]]
id = 0
name = "Sonos"
type = "airplay"

[[sources]]
id = 1
name = "Radio"

[[controllers]]
id = 0
zones = [{ name = "Kitchen" }, { name = "Den", max_volume = 81 }]

[[controllers]]
id = 1
zones = [{ name = "Patio" }]
"#;

    #[test]
    fn test_parse_sample() {
        let config: Config = SAMPLE.parse().unwrap();
        assert_eq!(config.name, "Living Room");
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.max_connections, 32);
        assert_eq!(
            config.bus.endpoint().unwrap(),
            BusEndpoint::Bridge("10.0.0.5:7000".to_string())
        );
        assert_eq!(config.sources[0].source_type, SourceType::Airplay);
        assert_eq!(config.sources[1].source_type, SourceType::Generic);
        assert!(config.discovery.enabled);
    }

    #[test]
    fn test_defaults_for_empty_file() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config.name, "RNet Bridge");
        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(config.discovery.service_type, "rnet");
        assert!(config.bus.endpoint().is_err());
    }

    #[test]
    fn test_build_store_applies_max_volume() {
        let config: Config = SAMPLE.parse().unwrap();
        let store = config.build_store();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.controllers_len(), 2);
        assert_eq!(snapshot.zones_len(0), 2);
        let den = snapshot.zone(ZoneId::new(0, 1)).unwrap();
        assert_eq!(den.name, "Den");
        assert_eq!(den.max_volume, 80);
    }

    #[test]
    fn test_non_contiguous_controllers_rejected() {
        let text = "[[controllers]]\nid = 1\nzones = []\n";
        assert!(matches!(
            text.parse::<Config>(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let text = "[[sources]]\nid = 3\nname = \"a\"\n[[sources]]\nid = 3\nname = \"b\"\n";
        assert!(matches!(
            text.parse::<Config>(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_reserved_source_id_rejected() {
        let text = "[[sources]]\nid = 255\nname = \"a\"\n";
        match text.parse::<Config>() {
            Err(ConfigError::Invalid(reason)) => assert!(reason.contains("255"), "{reason}"),
            other => panic!("expected reserved id rejection, got {other:?}"),
        }
        assert!("[[sources]]\nid = 254\nname = \"a\"\n".parse::<Config>().is_ok());
    }

    #[test]
    fn test_baud_rate() {
        let config: Config = "[bus]\nbaud_rate = 9600\n".parse().unwrap();
        assert_eq!(config.bus.baud_rate, 9_600);
        assert_eq!(BusConfig::default().baud_rate, DEFAULT_BAUD_RATE);
        assert!(matches!(
            "[bus]\nbaud_rate = 1200\n".parse::<Config>(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_max_volume_above_limit_rejected() {
        let text = "[[controllers]]\nid = 0\nzones = [{ name = \"a\", max_volume = 120 }]\n";
        assert!(matches!(
            text.parse::<Config>(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            "[server]\nprot = 1\n".parse::<Config>(),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_both_bus_endpoints_rejected() {
        let bus = BusConfig {
            device: Some(PathBuf::from("/dev/ttyUSB0")),
            bridge: Some("h:1".to_string()),
            ..BusConfig::default()
        };
        assert!(bus.endpoint().is_err());
    }

    #[test]
    fn test_endpoint_override() {
        let mut bus = BusConfig::default();
        bus.set_endpoint(BusEndpoint::parse("/dev/ttyS1"));
        assert_eq!(
            bus.endpoint().unwrap(),
            BusEndpoint::Device(PathBuf::from("/dev/ttyS1"))
        );
        bus.set_endpoint(BusEndpoint::parse("serial-host:2000"));
        assert_eq!(
            bus.endpoint().unwrap(),
            BusEndpoint::Bridge("serial-host:2000".to_string())
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.controllers.len(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
