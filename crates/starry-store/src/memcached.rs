//! Memcached client speaking the text protocol over a Unix socket.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::traits::CacheBackend;

/// Longest key memcached accepts.
const MAX_KEY_LEN: usize = 250;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// A single connection to a memcached server, shared by all callers.
///
/// A failed exchange drops the connection; the next call reconnects.
pub struct MemcachedCache {
    socket: PathBuf,
    conn: Mutex<Option<BufReader<UnixStream>>>,
    timeout: Duration,
    /// Expiry in seconds passed with every `set`. `0` never expires.
    expiry: u32,
}

impl MemcachedCache {
    /// Connect to the server listening on `socket`.
    ///
    /// Connects eagerly so a missing server is reported at construction.
    pub fn connect(socket: impl AsRef<Path>) -> CacheResult<Self> {
        let cache = Self {
            socket: socket.as_ref().to_path_buf(),
            conn: Mutex::new(None),
            timeout: DEFAULT_TIMEOUT,
            expiry: 0,
        };
        let stream = cache.open_stream()?;
        *cache.conn.lock().expect("memcached lock poisoned") = Some(stream);
        Ok(cache)
    }

    /// Set the expiry sent with every entry.
    pub fn with_expiry(mut self, seconds: u32) -> Self {
        self.expiry = seconds;
        self
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn open_stream(&self) -> CacheResult<BufReader<UnixStream>> {
        let stream = UnixStream::connect(&self.socket)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        debug!(socket = %self.socket.display(), "connected to memcached");
        Ok(BufReader::new(stream))
    }

    /// Run one request/response exchange, reconnecting first if needed.
    fn exchange<T>(
        &self,
        f: impl FnOnce(&mut BufReader<UnixStream>) -> CacheResult<T>,
    ) -> CacheResult<T> {
        let mut guard = self.conn.lock().expect("memcached lock poisoned");
        if guard.is_none() {
            *guard = Some(self.open_stream()?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(CacheError::Protocol("no connection".into()));
        };

        let result = f(conn);
        if let Err(e) = &result {
            debug!(error = %e, "dropping memcached connection");
            *guard = None;
        }
        result
    }
}

fn check_key(key: &str) -> CacheResult<()> {
    if key.is_empty()
        || key.len() > MAX_KEY_LEN
        || key.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn read_line(conn: &mut BufReader<UnixStream>) -> CacheResult<String> {
    let mut line = String::new();
    if conn.read_line(&mut line)? == 0 {
        return Err(CacheError::Protocol("connection closed".into()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn unexpected(line: String) -> CacheError {
    if line.starts_with("SERVER_ERROR") || line.starts_with("CLIENT_ERROR") {
        CacheError::Rejected(line)
    } else {
        CacheError::Protocol(format!("unexpected reply {line:?}"))
    }
}

impl CacheBackend for MemcachedCache {
    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        check_key(key)?;
        self.exchange(|conn| {
            conn.get_mut().write_all(format!("get {key}\r\n").as_bytes())?;

            let header = read_line(conn)?;
            if header == "END" {
                return Ok(None);
            }

            // VALUE <key> <flags> <bytes>
            let parts: Vec<&str> = header.split(' ').collect();
            let len = match parts.as_slice() {
                ["VALUE", _, _, len] => len
                    .parse::<usize>()
                    .map_err(|_| CacheError::Protocol(format!("bad length in {header:?}")))?,
                _ => return Err(unexpected(header.clone())),
            };

            let mut data = vec![0u8; len + 2];
            conn.read_exact(&mut data)?;
            data.truncate(len);

            let end = read_line(conn)?;
            if end != "END" {
                return Err(unexpected(end));
            }
            Ok(Some(data))
        })
    }

    fn set(&self, key: &str, value: &[u8]) -> CacheResult<()> {
        check_key(key)?;
        self.exchange(|conn| {
            let stream = conn.get_mut();
            stream.write_all(format!("set {key} 0 {} {}\r\n", self.expiry, value.len()).as_bytes())?;
            stream.write_all(value)?;
            stream.write_all(b"\r\n")?;

            match read_line(conn)?.as_str() {
                "STORED" => Ok(()),
                "NOT_STORED" => Err(CacheError::Rejected("NOT_STORED".into())),
                other => Err(unexpected(other.to_string())),
            }
        })
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        check_key(key)?;
        self.exchange(|conn| {
            conn.get_mut().write_all(format!("delete {key}\r\n").as_bytes())?;
            match read_line(conn)?.as_str() {
                "DELETED" => Ok(true),
                "NOT_FOUND" => Ok(false),
                other => Err(unexpected(other.to_string())),
            }
        })
    }

    fn flush_all(&self) -> CacheResult<()> {
        self.exchange(|conn| {
            conn.get_mut().write_all(b"flush_all\r\n")?;
            match read_line(conn)?.as_str() {
                "OK" => Ok(()),
                other => Err(unexpected(other.to_string())),
            }
        })
    }
}

impl std::fmt::Debug for MemcachedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcachedCache")
            .field("socket", &self.socket)
            .field("expiry", &self.expiry)
            .finish()
    }
}
