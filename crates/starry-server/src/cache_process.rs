use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{ServerError, ServerResult};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(20);
const MEGABYTE: u64 = 1024 * 1024;

/// A memcached instance owned by the server, killed when dropped.
#[derive(Debug)]
pub struct CacheProcess {
    child: Child,
    socket: PathBuf,
}

/// Memory limit in the whole megabytes memcached takes, rounded up.
pub fn megabytes(bytes: u64) -> u64 {
    bytes.div_ceil(MEGABYTE).max(1)
}

/// Arguments memcached is started with.
pub fn memcached_args(socket: &Path, size_bytes: u64, user: Option<&str>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(user) = user {
        args.push("-u".to_string());
        args.push(user.to_string());
    }
    args.extend([
        "-a".to_string(),
        "0777".to_string(),
        "-C".to_string(),
        "-m".to_string(),
        megabytes(size_bytes).to_string(),
        "-s".to_string(),
        socket.display().to_string(),
    ]);
    args
}

impl CacheProcess {
    /// Start memcached on `socket` and wait until the socket appears.
    ///
    /// A previous instance bound to the same socket is killed first.
    pub fn spawn(socket: &Path, size_bytes: u64, user: Option<&str>) -> ServerResult<Self> {
        if let Some(parent) = socket.parent() {
            std::fs::create_dir_all(parent)?;
        }
        kill_stale(socket);

        let args = memcached_args(socket, size_bytes, user);
        let child = Command::new("memcached")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ServerError::Internal(format!("failed to start memcached: {e}")))?;
        let mut process = Self {
            child,
            socket: socket.to_path_buf(),
        };

        let deadline = Instant::now() + STARTUP_TIMEOUT;
        while !socket.exists() {
            if let Some(status) = process.child.try_wait()? {
                return Err(ServerError::Internal(format!("memcached exited early: {status}")));
            }
            if Instant::now() >= deadline {
                return Err(ServerError::Internal(format!(
                    "memcached did not create {} in time",
                    socket.display()
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }

        info!(socket = %socket.display(), pid = process.child.id(), "memcached started");
        Ok(process)
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

/// Best-effort removal of an instance left behind by an earlier run.
fn kill_stale(socket: &Path) {
    if !socket.exists() {
        return;
    }
    let pattern = format!("memcached.*-s {}", socket.display());
    match Command::new("pkill").args(["-9", "-f", &pattern]).status() {
        Ok(status) if status.success() => warn!(socket = %socket.display(), "killed stale memcached"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "pkill unavailable"),
    }
    let _ = std::fs::remove_file(socket);
}

impl Drop for CacheProcess {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            warn!(error = %e, "failed to stop memcached");
        }
        let _ = self.child.wait();
        let _ = std::fs::remove_file(&self.socket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_rounds_up_to_megabytes() {
        assert_eq!(megabytes(0), 1);
        assert_eq!(megabytes(1), 1);
        assert_eq!(megabytes(MEGABYTE), 1);
        assert_eq!(megabytes(MEGABYTE + 1), 2);
        assert_eq!(megabytes(64 * MEGABYTE), 64);
    }

    #[test]
    fn arguments() {
        let args = memcached_args(Path::new("/run/starrydb/cache.sock"), 64 * MEGABYTE, Some("root"));
        assert_eq!(
            args,
            ["-u", "root", "-a", "0777", "-C", "-m", "64", "-s", "/run/starrydb/cache.sock"]
        );

        let args = memcached_args(Path::new("/tmp/c.sock"), 10, None);
        assert_eq!(args[0], "-a");
        assert_eq!(args.last().map(String::as_str), Some("/tmp/c.sock"));
    }
}
