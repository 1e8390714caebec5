use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("protocol error: {0}")]
    Protocol(#[from] starry_protocol::ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] starry_store::StoreError),

    #[error("cache error: {0}")]
    Cache(#[from] starry_store::CacheError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;
