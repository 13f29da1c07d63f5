use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::{P2PError, Result};

/// Node settings. In JSON every duration is an integer number of
/// milliseconds under a `_ms` key, e.g. `"probe_timeout_ms": 3000`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Address other peers should dial. Defaults to the bound address,
    /// with an unspecified IP replaced by loopback.
    pub advertise_addr: Option<SocketAddr>,
    pub bootstrap_peer: Option<String>,
    pub node_name: String,
    pub shared_dir: PathBuf,
    pub download_dir: PathBuf,

    // Routing
    pub bucket_size: usize,
    pub lookup_parallelism: usize,
    pub max_lookup_rounds: usize,
    #[serde(rename = "lookup_timeout_ms", with = "millis")]
    pub lookup_timeout: Duration,
    #[serde(rename = "probe_timeout_ms", with = "millis")]
    pub probe_timeout: Duration,
    pub bootstrap_retries: u32,
    #[serde(rename = "bootstrap_backoff_ms", with = "millis")]
    pub bootstrap_backoff: Duration,
    #[serde(rename = "maintenance_interval_ms", with = "millis")]
    pub maintenance_interval: Duration,

    // Transport
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    #[serde(rename = "request_timeout_ms", with = "millis")]
    pub request_timeout: Duration,
    pub max_frame_size: usize,
    pub max_connections: usize,
    #[serde(rename = "idle_connection_timeout_ms", with = "millis")]
    pub idle_connection_timeout: Duration,
    #[serde(rename = "shutdown_grace_ms", with = "millis")]
    pub shutdown_grace: Duration,

    // File transfer
    pub chunk_size: usize,
    pub chunk_window: usize,
    #[serde(rename = "chunk_idle_timeout_ms", with = "millis")]
    pub chunk_idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
            advertise_addr: None,
            bootstrap_peer: None,
            node_name: "peer".to_string(),
            shared_dir: PathBuf::from("./shared"),
            download_dir: PathBuf::from("./downloads"),
            bucket_size: 20,
            lookup_parallelism: 3,
            max_lookup_rounds: 10,
            lookup_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
            bootstrap_retries: 3,
            bootstrap_backoff: Duration::from_millis(500),
            maintenance_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            max_frame_size: 10_000_000,
            max_connections: 50,
            idle_connection_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
            chunk_size: 64 * 1024,
            chunk_window: 4,
            chunk_idle_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load a JSON config file; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| P2PError::ConfigError(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| P2PError::ConfigError(format!("Invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket_size == 0 {
            return Err(P2PError::ConfigError("bucket_size must be positive".to_string()));
        }
        if self.lookup_parallelism == 0 {
            return Err(P2PError::ConfigError(
                "lookup_parallelism must be positive".to_string(),
            ));
        }
        if self.max_lookup_rounds == 0 {
            return Err(P2PError::ConfigError(
                "max_lookup_rounds must be positive".to_string(),
            ));
        }
        if self.chunk_size == 0 || self.chunk_window == 0 {
            return Err(P2PError::ConfigError(
                "chunk_size and chunk_window must be positive".to_string(),
            ));
        }
        // hex doubles the payload, plus room for the envelope
        if self.chunk_size.saturating_mul(2).saturating_add(4096) > self.max_frame_size {
            return Err(P2PError::ConfigError(format!(
                "chunk_size {} does not fit in max_frame_size {}",
                self.chunk_size, self.max_frame_size
            )));
        }
        Ok(())
    }

    /// The address advertised in our contact once the listener is bound.
    pub fn advertised(&self, bound: SocketAddr) -> SocketAddr {
        if let Some(addr) = self.advertise_addr {
            return addr;
        }
        if bound.ip().is_unspecified() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port())
        } else {
            bound
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
