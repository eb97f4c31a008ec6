//! Network Module
//!
//! Handles TCP communication with replica agents.

mod protocol;
mod server;
mod client;

pub use protocol::{BlockPayload, FrameHeader, Message};
pub use server::{NetworkServer, RequestHandler};
pub use client::NetworkClient;

use crate::error::{Error, Result};

/// Largest client read or write carried by one request
pub const MAX_IO_LENGTH: usize = 64 * 1024 * 1024;

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);
    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!("Frame of {} bytes exceeds limit", header.length)));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Encode a message as header plus body.
///
/// Fails with `TooLarge` before anything reaches the wire when the body
/// does not fit in one frame.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let body = message.serialize()?;
    if body.len() > FrameHeader::MAX_LENGTH as usize {
        return Err(Error::TooLarge(format!(
            "{} message of {} bytes exceeds the {} byte frame limit",
            message.type_name(),
            body.len(),
            FrameHeader::MAX_LENGTH
        )));
    }

    let mut frame = Vec::with_capacity(FrameHeader::SIZE + body.len());
    frame.extend_from_slice(&FrameHeader::new(&body).to_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write an encoded frame to a writer
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    let frame = encode_frame(message)?;
    write_frame(writer, &frame).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_framed_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024 * 1024);
        let message = Message::Write {
            offset: 4096,
            data: vec![3u8; 4096],
        };

        write_message(&mut a, &message).await.unwrap();
        match read_message(&mut b).await.unwrap() {
            Message::Write { offset, data } => {
                assert_eq!(offset, 4096);
                assert_eq!(data, vec![3u8; 4096]);
            }
            other => panic!("Unexpected message {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_corrupt_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(1024);
        let body = Message::Ping.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 1;
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        assert!(matches!(read_message(&mut b).await, Err(Error::Network(_))));
    }
}
