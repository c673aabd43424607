use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::assets::{
    DEFAULT_ACQUIRE_TIMEOUT_MS, DEFAULT_ADDRESS, DEFAULT_CLEANUP_FRACTION, DEFAULT_HARD_HORIZON,
    DEFAULT_IDLE_WAIT_MS, DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_POOL_CAPACITY, DEFAULT_SOFT_HORIZON,
    STANDARD_TCP_PORT,
};
use crate::error::{Error, Result};
use crate::net::VolumeCodec;
use crate::timeline::MemoryHorizon;
use crate::volume::ElementType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HorizonConfig {
    pub soft_horizon: i64,
    pub hard_horizon: i64,
    /// Fraction of the soft horizon between two eviction passes
    pub cleanup_fraction: f64,
}

impl Default for HorizonConfig {
    fn default() -> Self {
        Self {
            soft_horizon: DEFAULT_SOFT_HORIZON,
            hard_horizon: DEFAULT_HARD_HORIZON,
            cleanup_fraction: DEFAULT_CLEANUP_FRACTION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub capacity: usize,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_POOL_CAPACITY,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub address: String,
    pub port: u16,
    pub idle_wait_ms: u64,
    /// Element layout of received frames; the wire carries no type field
    pub element_type: ElementType,
    pub components: u32,
    pub max_payload_bytes: u64,
    pub health_check_interval_ms: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: STANDARD_TCP_PORT,
            idle_wait_ms: DEFAULT_IDLE_WAIT_MS,
            element_type: ElementType::default(),
            components: 1,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            health_check_interval_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub horizon: HorizonConfig,
    pub pool: PoolConfig,
    pub network: NetworkConfig,
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Reject values no component can work with.
    ///
    /// Swapped horizons are accepted; [`MemoryHorizon`] normalizes them.
    pub fn validate(&self) -> Result<()> {
        if self.horizon.soft_horizon < 0 || self.horizon.hard_horizon < 0 {
            return Err(Error::Config("horizons must not be negative".into()));
        }
        if !self.horizon.cleanup_fraction.is_finite() || self.horizon.cleanup_fraction < 0.0 {
            return Err(Error::Config(format!(
                "invalid cleanup fraction {}",
                self.horizon.cleanup_fraction
            )));
        }
        if self.pool.capacity == 0 {
            return Err(Error::Config("pool capacity must be at least 1".into()));
        }
        if self.network.components == 0 {
            return Err(Error::Config("components must be at least 1".into()));
        }
        self.network
            .address
            .parse::<IpAddr>()
            .map_err(|e| Error::Config(format!("invalid address {}: {}", self.network.address, e)))?;
        Ok(())
    }

    pub fn memory_horizon(&self) -> MemoryHorizon {
        MemoryHorizon::with_cleanup_fraction(
            self.horizon.soft_horizon,
            self.horizon.hard_horizon,
            self.horizon.cleanup_fraction,
        )
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.acquire_timeout_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.network.idle_wait_ms)
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        self.network
            .health_check_interval_ms
            .map(Duration::from_millis)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .network
            .address
            .parse()
            .map_err(|e| Error::Config(format!("invalid address {}: {}", self.network.address, e)))?;
        Ok(SocketAddr::new(ip, self.network.port))
    }

    /// Codec matching the configured element layout
    pub fn codec(&self) -> VolumeCodec {
        VolumeCodec::new(self.network.element_type, self.network.components)
            .with_max_payload(self.network.max_payload_bytes)
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.horizon.soft_horizon, 100);
        assert_eq!(config.horizon.hard_horizon, 400);
        assert_relative_eq!(config.horizon.cleanup_fraction, 0.25);
        assert_eq!(config.pool.capacity, 20);
        assert_eq!(config.network.port, STANDARD_TCP_PORT);
        assert_eq!(config.memory_horizon().cleanup_period(), 25);
        assert_eq!(
            config.socket_addr().unwrap(),
            "127.0.0.1:9140".parse().unwrap()
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = Config::from_json_str(
            r#"{ "horizon": { "soft_horizon": 25, "hard_horizon": 100 },
                 "network": { "element_type": "f32", "components": 3 } }"#,
        )
        .unwrap();

        assert_eq!(config.memory_horizon(), MemoryHorizon::new(25, 100));
        assert_eq!(config.memory_horizon().cleanup_period(), 6);
        assert_eq!(config.network.element_type, ElementType::F32);
        assert_eq!(config.network.components, 3);
        assert_eq!(config.pool, PoolConfig::default());
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            Config::from_json_str(r#"{ "pool": { "capacity": 0 } }"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_json_str(r#"{ "network": { "address": "localhost:1" } }"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_json_str("{ not json"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "pool": {{ "capacity": 8, "acquire_timeout_ms": 50 }} }}"#
        )
        .unwrap();

        let config = Config::from_json_file(file.path()).unwrap();
        assert_eq!(config.pool.capacity, 8);
        assert_eq!(config.acquire_timeout(), Duration::from_millis(50));

        let missing = file.path().with_extension("missing");
        assert!(Config::from_json_file(missing).is_err());
    }
}
