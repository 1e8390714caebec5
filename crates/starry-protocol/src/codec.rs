use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{StarryMessage, MAX_MESSAGE_SIZE};

/// Codec for encoding/decoding StarryDB protocol messages.
pub struct StarryCodec;

impl StarryCodec {
    /// Encode a message with framing: [4 bytes len][1 byte tag][payload]
    pub fn encode(msg: &StarryMessage) -> ProtocolResult<Vec<u8>> {
        let payload = Self::encode_payload(msg)?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let len = (payload.len() + 1) as u32;
        let mut buf = Vec::with_capacity(4 + 1 + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(msg.type_tag());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode a framed message from a buffer. Returns (message, bytes_consumed).
    ///
    /// Streams go through [`read_message`] instead.
    #[cfg(test)]
    pub(crate) fn decode(data: &[u8]) -> ProtocolResult<(StarryMessage, usize)> {
        if data.len() < 5 {
            return Err(ProtocolError::FramingError("too short".into()));
        }
        let len = frame_len([data[0], data[1], data[2], data[3]])?;
        let total = 4 + len;
        if data.len() < total {
            return Err(ProtocolError::FramingError(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        let msg = decode_body(&data[4..total])?;
        Ok((msg, total))
    }

    /// Encode payload only (no framing).
    pub fn encode_payload(msg: &StarryMessage) -> ProtocolResult<Vec<u8>> {
        bincode::serialize(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode payload only (no framing).
    pub fn decode_payload(data: &[u8]) -> ProtocolResult<StarryMessage> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Validate a length prefix; the frame body is the tag byte plus payload.
fn frame_len(prefix: [u8; 4]) -> ProtocolResult<usize> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len < 1 {
        return Err(ProtocolError::FramingError("zero-length frame".into()));
    }
    if len - 1 > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len - 1,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(len)
}

/// Decode `[tag][payload]` and check the tag against the decoded message.
fn decode_body(body: &[u8]) -> ProtocolResult<StarryMessage> {
    let tag = body[0];
    let msg = StarryCodec::decode_payload(&body[1..])?;
    if msg.type_tag() != tag {
        return Err(ProtocolError::InvalidMessageType(tag));
    }
    Ok(msg)
}

/// Read one frame from `reader`.
///
/// Returns `Ok(None)` if the peer closed the stream cleanly between frames.
pub async fn read_message<R>(reader: &mut R) -> ProtocolResult<Option<StarryMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = frame_len(prefix)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_body(&body).map(Some)
}

/// Write one frame to `writer` and flush it.
pub async fn write_message<W>(writer: &mut W, msg: &StarryMessage) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = StarryCodec::encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
