//! Wire protocol for StarryDB.
//!
//! A connection carries length-prefixed frames in both directions. The server
//! opens with an authentication challenge; after the handshake the client
//! sends one [`Request`] at a time and waits for its [`Response`]. The first
//! request binds the connection to a depot with [`Request::Open`].

pub mod auth;
pub mod codec;
pub mod error;
pub mod message;

pub use auth::{accept_handshake, derive_key, offer_handshake, prove, verify, NONCE_LEN};
pub use codec::{read_message, write_message, StarryCodec};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    Operation, Reply, Request, Response, StarryMessage, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
