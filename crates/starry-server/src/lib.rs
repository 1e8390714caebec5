//! StarryDB server.
//!
//! Serves file-backed depots to local clients over an authenticated Unix
//! socket. One process owns every depot it opens; each connection binds to
//! one depot and runs operations against it on the blocking pool.

pub mod cache_process;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod server;

pub use cache_process::CacheProcess;
pub use config::{CacheConfig, DepotConfig, ServerConfig};
pub use context::ServerContext;
pub use dispatch::{dispatch, execute};
pub use error::{ServerError, ServerResult};
pub use server::{StarryServer, NO_DEPOT};
