//! Shared-key challenge/response authentication.
//!
//! The server sends a random nonce; the client answers with the BLAKE3 keyed
//! hash of that nonce under a key derived from the shared authkey. The
//! authkey itself never crosses the wire.

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::codec::{read_message, write_message};
use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{StarryMessage, PROTOCOL_VERSION};

pub const NONCE_LEN: usize = 32;

/// Hash key derived from the shared authkey.
pub fn derive_key(authkey: &[u8]) -> [u8; 32] {
    *blake3::hash(authkey).as_bytes()
}

/// The answer to `nonce` under `authkey`.
pub fn prove(authkey: &[u8], nonce: &[u8; NONCE_LEN]) -> [u8; 32] {
    *blake3::keyed_hash(&derive_key(authkey), nonce).as_bytes()
}

/// Check an answer in constant time.
pub fn verify(authkey: &[u8], nonce: &[u8; NONCE_LEN], digest: &[u8; 32]) -> bool {
    blake3::Hash::from(prove(authkey, nonce)) == blake3::Hash::from(*digest)
}

fn new_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Server side: challenge the peer and wait for a valid proof.
pub async fn accept_handshake<S>(stream: &mut S, authkey: &[u8]) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce = new_nonce();
    write_message(stream, &StarryMessage::Challenge { version: PROTOCOL_VERSION, nonce }).await?;

    match read_message(stream).await? {
        Some(StarryMessage::Proof { digest }) if verify(authkey, &nonce, &digest) => {
            write_message(stream, &StarryMessage::Welcome).await?;
            debug!("peer authenticated");
            Ok(())
        }
        Some(StarryMessage::Proof { .. }) => {
            warn!("peer sent an invalid proof");
            let reason = "digest mismatch".to_string();
            write_message(stream, &StarryMessage::Rejected { reason: reason.clone() }).await?;
            Err(ProtocolError::AuthFailed(reason))
        }
        Some(other) => Err(ProtocolError::UnexpectedMessage {
            expected: "Proof",
            got: other.type_name(),
        }),
        None => Err(ProtocolError::ConnectionClosed),
    }
}

/// Client side: answer the server's challenge.
pub async fn offer_handshake<S>(stream: &mut S, authkey: &[u8]) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce = match read_message(stream).await? {
        Some(StarryMessage::Challenge { version, nonce }) => {
            if version != PROTOCOL_VERSION {
                return Err(ProtocolError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote: version,
                });
            }
            nonce
        }
        Some(other) => {
            return Err(ProtocolError::UnexpectedMessage {
                expected: "Challenge",
                got: other.type_name(),
            })
        }
        None => return Err(ProtocolError::ConnectionClosed),
    };

    let digest = prove(authkey, &nonce);
    write_message(stream, &StarryMessage::Proof { digest }).await?;

    match read_message(stream).await? {
        Some(StarryMessage::Welcome) => Ok(()),
        Some(StarryMessage::Rejected { reason }) => Err(ProtocolError::AuthFailed(reason)),
        Some(other) => Err(ProtocolError::UnexpectedMessage {
            expected: "Welcome",
            got: other.type_name(),
        }),
        None => Err(ProtocolError::AuthFailed("connection closed during handshake".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_depends_on_key_and_nonce() {
        let nonce = [1u8; NONCE_LEN];
        let digest = prove(b"starry", &nonce);
        assert!(verify(b"starry", &nonce, &digest));
        assert!(!verify(b"other", &nonce, &digest));
        assert!(!verify(b"starry", &[2u8; NONCE_LEN], &digest));
    }

    #[test]
    fn nonces_differ() {
        assert_ne!(new_nonce(), new_nonce());
    }

    #[tokio::test]
    async fn handshake_with_matching_keys() {
        let (mut server, mut client) = tokio::io::duplex(4096);
        let server_side = tokio::spawn(async move { accept_handshake(&mut server, b"k").await });
        offer_handshake(&mut client, b"k").await.unwrap();
        server_side.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handshake_with_wrong_key_is_rejected() {
        let (mut server, mut client) = tokio::io::duplex(4096);
        let server_side = tokio::spawn(async move { accept_handshake(&mut server, b"right").await });

        let err = offer_handshake(&mut client, b"wrong").await.unwrap_err();
        assert!(matches!(err, ProtocolError::AuthFailed(_)));
        assert!(matches!(
            server_side.await.unwrap().unwrap_err(),
            ProtocolError::AuthFailed(_)
        ));
    }
}
