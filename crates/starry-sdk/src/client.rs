use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{SdkError, SdkResult};

/// Pool of authenticated channels to one StarryDB server.
///
/// ```no_run
/// # async fn demo() -> starry_sdk::SdkResult<()> {
/// use starry_sdk::{ClientConfig, StarryClient};
/// use std::path::Path;
///
/// let client = StarryClient::connect(ClientConfig::default().with_workers(4)).await?;
/// let mut session = client.open(Some(Path::new("/var/lib/starry/users"))).await?;
/// let alice = session.get("alice").await;
/// # let _ = alice;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct StarryClient {
    config: ClientConfig,
    idle_tx: mpsc::UnboundedSender<Channel>,
    idle_rx: Mutex<mpsc::UnboundedReceiver<Channel>>,
    /// Pool slots whose channel was discarded and not yet redialed.
    vacancies: AtomicUsize,
}

impl StarryClient {
    /// Dial `config.workers` channels up front.
    pub async fn connect(config: ClientConfig) -> SdkResult<Self> {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        for _ in 0..config.workers {
            let channel = Channel::connect(&config.address, config.authkey.as_bytes()).await?;
            let _ = idle_tx.send(channel);
        }
        let config = ClientConfig {
            path: config.path.as_deref().map(std::path::absolute).transpose()?,
            ..config
        };
        Ok(Self {
            config,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            vacancies: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Pool slots currently without a channel.
    pub fn vacancies(&self) -> usize {
        self.vacancies.load(Ordering::Acquire)
    }

    /// Borrow a channel and bind it to the depot at `path`, or at the
    /// configured default path.
    ///
    /// Waits up to the queue timeout for a pooled channel, then dials a
    /// one-off channel that is closed when the session ends.
    pub async fn open(&self, path: Option<&Path>) -> SdkResult<Session<'_>> {
        let path = self.resolve(path)?;
        let (channel, pooled) = self.checkout().await?;
        let mut session = Session {
            client: self,
            connection: Connection::new(channel, self.config.conn_timeout()),
            pooled,
        };
        session.connection.bind(&path).await?;
        Ok(session)
    }

    /// Close every idle channel. Sessions still open return theirs later.
    pub async fn close(&self) {
        let mut idle = self.idle_rx.lock().await;
        while idle.try_recv().is_ok() {}
    }

    fn resolve(&self, path: Option<&Path>) -> SdkResult<PathBuf> {
        match (path, &self.config.path) {
            (Some(path), _) => Ok(std::path::absolute(path)?),
            (None, Some(default)) => Ok(default.clone()),
            (None, None) => Err(SdkError::NoPath),
        }
    }

    async fn dial(&self) -> SdkResult<Channel> {
        Channel::connect(&self.config.address, self.config.authkey.as_bytes()).await
    }

    async fn checkout(&self) -> SdkResult<(Channel, bool)> {
        if self.claim_vacancy() {
            return match self.dial().await {
                Ok(channel) => Ok((channel, true)),
                Err(e) => {
                    self.vacancies.fetch_add(1, Ordering::AcqRel);
                    Err(e)
                }
            };
        }

        let waited = tokio::time::timeout(self.config.queue_timeout(), async {
            self.idle_rx.lock().await.recv().await
        })
        .await;
        if let Ok(Some(channel)) = waited {
            return Ok((channel, true));
        }

        debug!("pool exhausted; dialing a one-off channel");
        Ok((self.dial().await?, false))
    }

    fn claim_vacancy(&self) -> bool {
        self.vacancies
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn give_back(&self, channel: Channel) {
        if channel.is_poisoned() {
            warn!("discarding a channel that is out of sync");
            self.vacancies.fetch_add(1, Ordering::AcqRel);
            return;
        }
        let _ = self.idle_tx.send(channel);
    }
}

/// A channel bound to one depot, returned to the pool when dropped.
#[derive(Debug)]
pub struct Session<'a> {
    client: &'a StarryClient,
    connection: Connection,
    pooled: bool,
}

impl Session<'_> {
    /// Whether the channel goes back to the pool afterwards.
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }
}

impl Deref for Session<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl DerefMut for Session<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        match self.connection.take_channel() {
            Some(channel) if self.pooled => self.client.give_back(channel),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use starry_protocol::{accept_handshake, read_message, write_message, Reply, Request, StarryMessage};
    use starry_server::{CacheConfig, DepotConfig, ServerConfig, StarryServer};
    use starry_types::{Route, Value};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::net::UnixListener;

    struct Harness {
        dir: tempfile::TempDir,
        data: PathBuf,
        address: PathBuf,
        server: tokio::task::JoinHandle<()>,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.server.abort();
        }
    }

    async fn start(backup: bool, cache: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir(&data).unwrap();
        let address = dir.path().join("address");

        let config = ServerConfig {
            address: address.clone(),
            authkey: "k".into(),
            cache_size: 1 << 20,
            cache: CacheConfig::Memory,
            depots: vec![DepotConfig { path: data.clone(), backup, cache, fsync: false }],
            ..ServerConfig::default()
        };
        let server = Arc::new(StarryServer::new(config).unwrap());
        let listener = server.bind().unwrap();
        let server = tokio::spawn(async move {
            let _ = server.run(listener).await;
        });

        Harness { dir, data, address, server }
    }

    fn config(h: &Harness) -> ClientConfig {
        ClientConfig::new(&h.address)
            .with_authkey("k")
            .with_path(&h.data)
            .with_timeout(Duration::from_secs(3))
    }

    fn doc(json: serde_json::Value) -> Value {
        Value::from(json)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn document_lifecycle() {
        let h = start(true, false).await;
        let client = StarryClient::connect(config(&h).with_workers(2)).await.unwrap();
        let mut s = client.open(None).await.unwrap();

        assert_eq!(s.insert("alice", doc(json!({"name": "Alice", "tags": ["x", "y"]}))).await, Ok(true));
        assert_eq!(s.update(Route::new("alice").at("tags").at(0), "z").await, Ok(true));
        assert_eq!(s.get(Route::new("alice").at("tags")).await, Ok(doc(json!(["z", "y"]))));
        assert_eq!(s.get("bob").await, Err("No bob.".to_string()));
        assert_eq!(s.exist("alice").await, Ok(true));

        // Damage the primary; the read falls back to the backup copy.
        let primary = h.data.join("alice.blob");
        let len = std::fs::metadata(&primary).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&primary).unwrap();
        file.set_len(len / 2).unwrap();
        drop(file);

        assert_eq!(
            s.get("alice").await,
            Ok(doc(json!({"name": "Alice", "tags": ["z", "y"]})))
        );
        assert_eq!(std::fs::metadata(&primary).unwrap().len(), len);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn multi_key_calls() {
        let h = start(false, true).await;
        let client = StarryClient::connect(config(&h)).await.unwrap();
        let mut s = client.open(None).await.unwrap();

        let mut values = BTreeMap::new();
        values.insert("a".to_string(), Value::from(1));
        values.insert("b".to_string(), Value::from(2));
        s.insert_multi(values.clone()).await.unwrap();
        assert_eq!(s.get_multi(&["a", "b"]).await, Ok(values.clone()));
        assert_eq!(s.update("a", 1).await, Ok(false));

        s.rename("a", "c").await.unwrap();
        s.copy("b", "d").await.unwrap();
        assert_eq!(s.list().await, Ok(vec!["b".into(), "c".into(), "d".into()]));

        let mut only = BTreeMap::new();
        only.insert("z".to_string(), Value::from("last"));
        s.update_all(only.clone()).await.unwrap();
        assert_eq!(s.get_all().await, Ok(only));

        s.delete_multi(&["z"]).await.unwrap();
        assert_eq!(s.list().await, Ok(Vec::new()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn clone_and_clear() {
        let h = start(false, false).await;
        let target = h.dir.path().join("copy");
        std::fs::create_dir(&target).unwrap();

        let client = StarryClient::connect(config(&h)).await.unwrap();
        let mut s = client.open(None).await.unwrap();
        s.insert("k", "v").await.unwrap();
        s.clone_to(&target).await.unwrap();
        assert!(target.join("k.blob").exists());

        s.clear().await.unwrap();
        assert_eq!(s.list().await, Ok(Vec::new()));
        s.upgrade(&target).await.unwrap();
        assert_eq!(s.get("k").await, Ok(Value::from("v")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn open_errors() {
        let h = start(false, false).await;
        let client = StarryClient::connect(ClientConfig::new(&h.address).with_authkey("k"))
            .await
            .unwrap();

        assert!(matches!(client.open(None).await.unwrap_err(), SdkError::NoPath));
        let missing = h.dir.path().join("missing");
        match client.open(Some(missing.as_path())).await.unwrap_err() {
            SdkError::Open(message) => assert!(message.ends_with("doesn't exist.")),
            other => panic!("unexpected error: {other:?}"),
        }
        // The refused channel went back to the pool and still works.
        let mut s = client.open(Some(h.data.as_path())).await.unwrap();
        assert!(s.is_pooled());
        assert_eq!(s.list().await, Ok(Vec::new()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wrong_authkey_fails_to_connect() {
        let h = start(false, false).await;
        let err = StarryClient::connect(ClientConfig::new(&h.address).with_authkey("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Protocol(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exhausted_pool_dials_one_off_channel() {
        let h = start(false, false).await;
        let client = StarryClient::connect(config(&h)).await.unwrap();

        let first = client.open(None).await.unwrap();
        let started = Instant::now();
        let mut second = client.open(None).await.unwrap();
        assert!(started.elapsed() >= client.config().queue_timeout());
        assert!(first.is_pooled());
        assert!(!second.is_pooled());
        assert_eq!(second.list().await, Ok(Vec::new()));
        drop(second);
        drop(first);

        // Only the pooled channel came back; the next open does not wait.
        let started = Instant::now();
        let s = client.open(None).await.unwrap();
        assert!(s.is_pooled());
        assert!(started.elapsed() < client.config().queue_timeout());
    }

    /// Authenticates, acknowledges `open`, then never answers a call.
    async fn silent_server(address: PathBuf) -> tokio::task::JoinHandle<()> {
        let listener = UnixListener::bind(&address).unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    if accept_handshake(&mut stream, b"starry").await.is_err() {
                        return;
                    }
                    while let Ok(Some(message)) = read_message(&mut stream).await {
                        if let StarryMessage::Request(Request::Open { .. }) = message {
                            let ack = StarryMessage::Response(Ok(Reply::Opened));
                            if write_message(&mut stream, &ack).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_channel_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let address = dir.path().join("silent");
        let server = silent_server(address.clone()).await;

        let config = ClientConfig::new(&address)
            .with_path(dir.path())
            .with_timeout(Duration::from_secs(1));
        let client = StarryClient::connect(config).await.unwrap();

        let mut s = client.open(None).await.unwrap();
        assert_eq!(s.list().await, Err("list() timeout.".to_string()));
        // The channel is out of sync; later calls fail fast.
        let err = s.get("alice").await.unwrap_err();
        assert!(err.starts_with("Caught exception:"), "{err}");
        drop(s);
        assert_eq!(client.vacancies(), 1);

        // The vacancy is refilled with a fresh channel.
        let s = client.open(None).await.unwrap();
        assert!(s.is_pooled());
        assert_eq!(client.vacancies(), 0);
        drop(s);

        server.abort();
    }
}
