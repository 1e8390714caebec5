//! Client SDK for StarryDB.
//!
//! A [`StarryClient`] keeps a pool of authenticated channels to one server.
//! [`StarryClient::open`] binds a channel to a depot and hands out a
//! [`Session`]; its [`Connection`] methods mirror the depot operations and
//! return the server's message on failure.

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;

pub use client::{Session, StarryClient};
pub use config::ClientConfig;
pub use connection::Connection;
pub use error::{SdkError, SdkResult};

pub use starry_protocol::{Operation, Reply, Response};
pub use starry_types::{Route, Segment, Value};
