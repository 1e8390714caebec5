use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ADDRESS: &str = "/run/starrydb/address";
pub const DEFAULT_AUTHKEY: &str = "starry";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How a [`StarryClient`](crate::StarryClient) reaches its server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server socket.
    pub address: PathBuf,
    /// Depot opened when [`open`](crate::StarryClient::open) gets no path.
    pub path: Option<PathBuf>,
    /// Connections kept in the pool.
    pub workers: usize,
    pub authkey: String,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: PathBuf::from(DEFAULT_ADDRESS),
            path: None,
            workers: 1,
            authkey: DEFAULT_AUTHKEY.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn new(address: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_authkey(mut self, authkey: impl Into<String>) -> Self {
        self.authkey = authkey.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// How long `open` waits for a pooled connection before dialing a new one.
    pub fn queue_timeout(&self) -> Duration {
        if self.timeout > Duration::from_secs(3) {
            Duration::from_secs(self.timeout.as_secs() / 3)
        } else {
            Duration::from_secs(1)
        }
    }

    /// How long a single call waits for its response.
    pub fn conn_timeout(&self) -> Duration {
        self.queue_timeout() * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ClientConfig::default();
        assert_eq!(c.address, PathBuf::from("/run/starrydb/address"));
        assert_eq!(c.workers, 1);
        assert_eq!(c.authkey, "starry");
        assert_eq!(c.queue_timeout(), Duration::from_secs(20));
        assert_eq!(c.conn_timeout(), Duration::from_secs(40));
    }

    #[test]
    fn short_timeouts_floor_at_one_second() {
        for secs in [0, 1, 3] {
            let c = ClientConfig::default().with_timeout(Duration::from_secs(secs));
            assert_eq!(c.queue_timeout(), Duration::from_secs(1));
            assert_eq!(c.conn_timeout(), Duration::from_secs(2));
        }
        let c = ClientConfig::default().with_timeout(Duration::from_millis(5900));
        assert_eq!(c.queue_timeout(), Duration::from_secs(1));
        let c = ClientConfig::default().with_timeout(Duration::from_secs(10));
        assert_eq!(c.queue_timeout(), Duration::from_secs(3));
    }
}
