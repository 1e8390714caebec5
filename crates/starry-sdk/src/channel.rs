use std::path::Path;
use std::time::Duration;

use starry_protocol::{
    offer_handshake, read_message, write_message, ProtocolError, Request, Response, StarryMessage,
};
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::{SdkError, SdkResult};

/// One authenticated connection to the server.
///
/// Requests and responses alternate strictly. Once an exchange fails or
/// times out the channel is poisoned: a late response would otherwise be
/// read as the answer to the next request.
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
    poisoned: bool,
}

impl Channel {
    pub async fn connect(address: &Path, authkey: &[u8]) -> SdkResult<Self> {
        let mut stream = UnixStream::connect(address)
            .await
            .map_err(|e| SdkError::Connect(format!("{}: {e}", address.display())))?;
        offer_handshake(&mut stream, authkey).await?;
        debug!(address = %address.display(), "channel connected");
        Ok(Self {
            stream,
            poisoned: false,
        })
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Send `request` and wait up to `wait` for its response.
    pub async fn request(&mut self, request: Request, wait: Duration) -> SdkResult<Response> {
        if self.poisoned {
            return Err(SdkError::Poisoned);
        }
        let outcome = tokio::time::timeout(wait, exchange(&mut self.stream, request)).await;
        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.poisoned = true;
                Err(e)
            }
            Err(_) => {
                self.poisoned = true;
                Err(SdkError::Timeout(wait))
            }
        }
    }
}

async fn exchange(stream: &mut UnixStream, request: Request) -> SdkResult<Response> {
    write_message(stream, &StarryMessage::Request(request)).await?;
    match read_message(stream).await? {
        Some(StarryMessage::Response(response)) => Ok(response),
        Some(other) => Err(ProtocolError::UnexpectedMessage {
            expected: "Response",
            got: other.type_name(),
        }
        .into()),
        None => Err(ProtocolError::ConnectionClosed.into()),
    }
}
