use std::future::Future;
use std::sync::Arc;

use starry_protocol::{
    accept_handshake, read_message, write_message, Operation, ProtocolError, Reply, Request,
    Response, StarryMessage,
};
use starry_store::{CacheAdapter, Depot, MemcachedCache, MemoryCache};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::cache_process::CacheProcess;
use crate::config::{CacheConfig, ServerConfig};
use crate::context::ServerContext;
use crate::dispatch::dispatch;
use crate::error::{ServerError, ServerResult};
use crate::logging;

/// Message sent for a call made before any depot was opened.
pub const NO_DEPOT: &str = "no depot opened.";

/// StarryDB server: a depot registry behind an authenticated Unix socket.
pub struct StarryServer {
    config: ServerConfig,
    context: Arc<ServerContext>,
    authkey: Arc<[u8]>,
    // Declared last so the cache outlives the depots using it.
    cache_process: Option<CacheProcess>,
}

impl StarryServer {
    /// Set up logging, the shared cache, and the configured depots.
    ///
    /// A cache that cannot be started is logged and skipped; the server then
    /// runs uncached.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;
        logging::init(config.log_file.as_deref(), &config.log_level)?;

        let (cache, cache_process) = match build_cache(&config) {
            Ok(built) => built,
            Err(e) => {
                error!(error = %e, "cache unavailable; running without cache");
                (None, None)
            }
        };

        let context = Arc::new(ServerContext::new(cache, config.rw_ratio));
        for depot in &config.depots {
            context.register(depot)?;
        }

        Ok(Self {
            authkey: Arc::from(config.authkey.as_bytes()),
            config,
            context,
            cache_process,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Bind the configured socket, replacing a stale socket file.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(&self) -> ServerResult<UnixListener> {
        let address = &self.config.address;
        if let Some(parent) = address.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if address.exists() {
            std::fs::remove_file(address)?;
        }
        let listener = UnixListener::bind(address)?;
        info!(address = %address.display(), "StarryDB server listening");
        Ok(listener)
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self, listener: UnixListener) -> ServerResult<()> {
        self.run_until(listener, std::future::pending::<()>()).await
    }

    /// Accept connections until `shutdown` resolves. Connections already
    /// accepted keep running.
    pub async fn run_until<F>(&self, listener: UnixListener, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()>,
    {
        let limit = Arc::new(Semaphore::new(self.config.max_connections));
        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&limit).acquire_owned() => {
                    permit.map_err(|e| ServerError::Internal(e.to_string()))?
                }
            };

            let stream = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let context = Arc::clone(&self.context);
            let authkey = Arc::clone(&self.authkey);
            tokio::spawn(async move {
                let _permit = permit;
                match handle_connection(context, stream, authkey).await {
                    Ok(()) | Err(ServerError::Protocol(ProtocolError::ConnectionClosed)) => {
                        debug!("connection closed")
                    }
                    Err(e) => warn!(error = %e, "connection ended with error"),
                }
            });
        }

        info!("StarryDB server stopped accepting connections");
        Ok(())
    }

    /// Bind and serve until interrupted.
    pub async fn serve(&self) -> ServerResult<()> {
        let listener = self.bind()?;
        self.run_until(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for interrupt");
            }
        })
        .await
    }
}

impl Drop for StarryServer {
    fn drop(&mut self) {
        self.context.close_all();
        if let Some(cache) = self.context.cache() {
            cache.flush_all();
        }
    }
}

fn build_cache(config: &ServerConfig) -> ServerResult<(Option<CacheAdapter>, Option<CacheProcess>)> {
    if config.cache_size == 0 {
        return Ok((None, None));
    }
    match &config.cache {
        CacheConfig::Memory => {
            let capacity = usize::try_from(config.cache_size).unwrap_or(usize::MAX);
            let backend = Arc::new(MemoryCache::new(capacity));
            Ok((Some(CacheAdapter::new(backend)), None))
        }
        CacheConfig::Memcached { socket, spawn, user } => {
            let process = if *spawn {
                Some(CacheProcess::spawn(socket, config.cache_size, user.as_deref())?)
            } else {
                None
            };
            let backend = Arc::new(MemcachedCache::connect(socket)?);
            Ok((Some(CacheAdapter::new(backend)), process))
        }
    }
}

async fn handle_connection(
    context: Arc<ServerContext>,
    mut stream: UnixStream,
    authkey: Arc<[u8]>,
) -> ServerResult<()> {
    accept_handshake(&mut stream, &authkey).await?;

    let mut depot: Option<Arc<Depot>> = None;
    while let Some(message) = read_message(&mut stream).await? {
        let response = match message {
            StarryMessage::Request(Request::Open { path }) => match context.open_depot(&path) {
                Ok(opened) => {
                    debug!(depot = %opened.path().display(), "connection bound");
                    depot = Some(opened);
                    Ok(Reply::Opened)
                }
                Err(e) => {
                    error!(%path, error = %e, "open failed");
                    Err(e.to_string())
                }
            },
            StarryMessage::Request(Request::Call(op)) => match &depot {
                Some(depot) => run_operation(Arc::clone(depot), op).await,
                None => Err(NO_DEPOT.to_string()),
            },
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "Request",
                    got: other.type_name(),
                }
                .into())
            }
        };
        write_message(&mut stream, &StarryMessage::Response(response)).await?;
    }
    Ok(())
}

/// Run a depot operation on the blocking pool; a panic becomes an error reply.
async fn run_operation(depot: Arc<Depot>, op: Operation) -> Response {
    let call = op.describe();
    match tokio::task::spawn_blocking(move || dispatch(&depot, op)).await {
        Ok(response) => response,
        Err(e) => {
            error!(%call, error = %e, "operation aborted");
            Err(format!("Caught exception: {call} aborted: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DepotConfig;
    use serde_json::json;
    use starry_protocol::offer_handshake;
    use starry_types::{Route, Value};

    fn config(dir: &std::path::Path) -> ServerConfig {
        ServerConfig {
            address: dir.join("run/address"),
            authkey: "secret".into(),
            cache_size: 1 << 20,
            cache: CacheConfig::Memory,
            ..ServerConfig::default()
        }
    }

    async fn request(stream: &mut UnixStream, request: Request) -> Response {
        write_message(stream, &StarryMessage::Request(request)).await.unwrap();
        match read_message(stream).await.unwrap() {
            Some(StarryMessage::Response(response)) => response,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    async fn connect(server: &StarryServer, authkey: &[u8]) -> UnixStream {
        let mut stream = UnixStream::connect(&server.config().address).await.unwrap();
        offer_handshake(&mut stream, authkey).await.unwrap();
        stream
    }

    #[test]
    fn construction_registers_configured_depots() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir(&data).unwrap();

        let mut cfg = config(dir.path());
        cfg.depots.push(DepotConfig { path: data.clone(), backup: true, cache: true, fsync: false });
        let server = StarryServer::new(cfg).unwrap();

        let depot = server.context().depot(&data).unwrap();
        assert!(depot.backup_enabled());
        assert!(depot.cache_enabled());
        assert!(server.context().cache().is_some());
    }

    #[test]
    fn missing_configured_depot_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.depots.push(DepotConfig { path: dir.path().join("nope"), ..DepotConfig::default() });
        assert!(StarryServer::new(cfg).is_err());
    }

    #[test]
    fn zero_cache_size_runs_uncached() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.cache_size = 0;
        let server = StarryServer::new(cfg).unwrap();
        assert!(server.context().cache().is_none());
    }

    #[test]
    fn unreachable_memcached_runs_uncached() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.cache = CacheConfig::Memcached {
            socket: dir.path().join("no-such.sock"),
            spawn: false,
            user: None,
        };
        let server = StarryServer::new(cfg).unwrap();
        assert!(server.context().cache().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serves_requests_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir(&data).unwrap();

        let server = Arc::new(StarryServer::new(config(dir.path())).unwrap());
        let listener = server.bind().unwrap();
        let running = Arc::clone(&server);
        let task = tokio::spawn(async move { running.run(listener).await });

        let mut stream = connect(&server, b"secret").await;
        let call = |op| Request::Call(op);

        assert_eq!(
            request(&mut stream, call(Operation::List)).await,
            Err(NO_DEPOT.to_string())
        );
        assert!(request(&mut stream, Request::Open { path: dir.path().join("missing").display().to_string() })
            .await
            .unwrap_err()
            .ends_with("doesn't exist."));
        assert_eq!(
            request(&mut stream, Request::Open { path: data.display().to_string() }).await,
            Ok(Reply::Opened)
        );

        let alice = Value::from(json!({"name": "Alice", "tags": ["x", "y"]}));
        assert_eq!(
            request(&mut stream, call(Operation::Insert { route: Route::new("alice"), value: alice.clone() })).await,
            Ok(Reply::Done)
        );
        assert_eq!(
            request(&mut stream, call(Operation::Get { route: Route::new("alice") })).await,
            Ok(Reply::Value(alice))
        );
        assert_eq!(
            request(&mut stream, call(Operation::Get { route: Route::new("bob") })).await,
            Err("No bob.".to_string())
        );

        drop(stream);
        task.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wrong_authkey_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(StarryServer::new(config(dir.path())).unwrap());
        let listener = server.bind().unwrap();
        let running = Arc::clone(&server);
        let task = tokio::spawn(async move { running.run(listener).await });

        let mut stream = UnixStream::connect(&server.config().address).await.unwrap();
        let err = offer_handshake(&mut stream, b"guess").await.unwrap_err();
        assert!(matches!(err, ProtocolError::AuthFailed(_)));

        task.abort();
    }

    #[tokio::test]
    async fn shutdown_stops_the_accept_loop() {
        let dir = tempfile::tempdir().unwrap();
        let server = StarryServer::new(config(dir.path())).unwrap();
        let listener = server.bind().unwrap();
        server.run_until(listener, async {}).await.unwrap();
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        std::fs::create_dir_all(cfg.address.parent().unwrap()).unwrap();
        std::fs::write(&cfg.address, b"stale").unwrap();

        let server = StarryServer::new(cfg).unwrap();
        let _listener = server.bind().unwrap();
    }
}
