use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use starry_store::DEFAULT_RW_RATIO;

use crate::error::{ServerError, ServerResult};

pub const DEFAULT_ADDRESS: &str = "/run/starrydb/address";
pub const DEFAULT_CACHE_SOCKET: &str = "/run/starrydb/cache.sock";
pub const DEFAULT_AUTHKEY: &str = "starry";

/// Server settings, usually read from a TOML file.
///
/// ```toml
/// address = "/run/starrydb/address"
/// cache_size = 67108864
///
/// [[depots]]
/// path = "/var/lib/starry/users"
/// backup = true
/// cache = true
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unix socket the server listens on.
    pub address: PathBuf,
    /// Shared secret clients authenticate with.
    pub authkey: String,
    /// Depots registered at start-up, in registry order.
    pub depots: Vec<DepotConfig>,
    /// Cache capacity in bytes. `0` runs without a cache.
    pub cache_size: u64,
    pub cache: CacheConfig,
    /// Append logs here instead of stdout.
    pub log_file: Option<PathBuf>,
    pub log_level: String,
    pub rw_ratio: usize,
    /// Connections served at once. Further clients wait in the accept queue.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: PathBuf::from(DEFAULT_ADDRESS),
            authkey: DEFAULT_AUTHKEY.to_string(),
            depots: Vec::new(),
            cache_size: 0,
            cache: CacheConfig::default(),
            log_file: None,
            log_level: "WARNING".to_string(),
            rw_ratio: DEFAULT_RW_RATIO,
            max_connections: 1024,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> ServerResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be positive".into()));
        }
        if let Some(depot) = self.depots.iter().find(|d| d.path.as_os_str().is_empty()) {
            return Err(ServerError::Config(format!("depot entry without a path: {depot:?}")));
        }
        Ok(())
    }
}

/// One depot registered at start-up.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepotConfig {
    pub path: PathBuf,
    pub backup: bool,
    pub cache: bool,
    pub fsync: bool,
}

/// Where cached documents live when `cache_size` is non-zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum CacheConfig {
    /// In-process, size-bounded cache.
    Memory,
    /// A memcached server on a Unix socket, optionally started by the server.
    Memcached {
        #[serde(default = "default_cache_socket")]
        socket: PathBuf,
        #[serde(default = "default_spawn")]
        spawn: bool,
        #[serde(default)]
        user: Option<String>,
    },
}

fn default_cache_socket() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_SOCKET)
}

fn default_spawn() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::Memcached {
            socket: default_cache_socket(),
            spawn: true,
            user: Some("root".to_string()),
        }
    }
}
