use accord_types::MAX_MESSAGE_LENGTH;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Message, MessageType};

/// Codec for framing peer messages.
pub struct FrameCodec;

impl FrameCodec {
    /// Bytes before the message data: length and type.
    pub const HEADER_LENGTH: usize = 5;

    /// Encode a message with framing: [4 bytes len][1 byte type][data]
    ///
    /// The length counts the type byte and the data.
    pub fn encode(msg: &Message) -> ProtocolResult<Vec<u8>> {
        let data = msg.data();
        check_length(data.len())?;
        let len = (data.len() + 1) as u32;
        let mut buf = Vec::with_capacity(Self::HEADER_LENGTH + data.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(msg.kind().code());
        buf.extend_from_slice(data);
        Ok(buf)
    }

    /// Decode a framed message. Returns (message, bytes_consumed).
    ///
    /// Only the frame is checked here; the payload is decoded when first
    /// used.
    pub fn decode(data: &[u8]) -> ProtocolResult<(Message, usize)> {
        if data.len() < Self::HEADER_LENGTH {
            return Err(ProtocolError::FramingError("too short".into()));
        }
        let len = frame_length(&data[0..4])?;
        let total = 4 + len;
        if data.len() < total {
            return Err(ProtocolError::FramingError(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        let kind = MessageType::from_code(data[4])?;
        let body = Bytes::copy_from_slice(&data[Self::HEADER_LENGTH..total]);
        Ok((Message::from_data(kind, body), total))
    }

    /// Write one framed message to a stream.
    pub async fn write_frame<W>(writer: &mut W, msg: &Message) -> ProtocolResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = Self::encode(msg)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one framed message from a stream. Returns `None` on a clean end
    /// of stream between frames.
    pub async fn read_frame<R>(reader: &mut R) -> ProtocolResult<Option<Message>>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; Self::HEADER_LENGTH];
        match reader.read_exact(&mut header[..1]).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        reader.read_exact(&mut header[1..]).await?;
        let len = frame_length(&header[0..4])?;
        let kind = MessageType::from_code(header[4])?;
        let mut body = vec![0u8; len - 1];
        reader.read_exact(&mut body).await?;
        Ok(Some(Message::from_data(kind, Bytes::from(body))))
    }
}

fn check_length(data_len: usize) -> ProtocolResult<()> {
    if data_len > MAX_MESSAGE_LENGTH {
        return Err(ProtocolError::MessageTooLarge {
            size: data_len,
            max: MAX_MESSAGE_LENGTH,
        });
    }
    Ok(())
}

fn frame_length(prefix: &[u8]) -> ProtocolResult<usize> {
    let bytes: [u8; 4] = prefix
        .try_into()
        .map_err(|_| ProtocolError::FramingError("short length prefix".into()))?;
    let len = u32::from_be_bytes(bytes) as usize;
    if len < 1 {
        return Err(ProtocolError::FramingError("zero-length frame".into()));
    }
    check_length(len - 1)?;
    Ok(len)
}
