//! Network Module
//!
//! Handles TCP communication between nodes.

mod client;
pub mod protocol;
mod server;

pub use client::NetworkClient;
pub use protocol::{ErrorCode, FrameHeader, Message};
pub use server::NetworkServer;

use crate::error::{Error, Result};

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    // Deserialize
    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::VoteResponse;

    #[tokio::test]
    async fn test_frame_round_trip_over_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = Message::VoteResponse(VoteResponse {
            term: 4,
            vote_granted: true,
        });

        write_message(&mut a, &msg).await.unwrap();
        assert_eq!(read_message(&mut b).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_corrupt_frame_rejected() {
        let msg = Message::Join {
            descriptor: b"node-4@10.0.0.4:7654".to_vec(),
        };
        let body = msg.serialize().unwrap();
        let mut frame = FrameHeader::new(&body).to_bytes().to_vec();
        frame.extend_from_slice(&body);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        let mut reader = frame.as_slice();
        assert!(matches!(
            read_message(&mut reader).await,
            Err(Error::Network(_))
        ));
    }
}
