//! Async framing over tokio streams, using the layout in [`swarmsync_core::protocol`]

use color_eyre::Result;
use swarmsync_core::Message;
use swarmsync_core::protocol::{self, HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one message; `None` on a clean end of stream before a header
///
/// # Errors
/// Returns an error on I/O failure, a truncated frame or an undecodable payload
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Message>> {
    let mut header = [0u8; HEADER_LEN];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let (msg_type, len) = protocol::parse_header(header)?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(Some(protocol::decode(msg_type, &payload)?))
}

/// # Errors
/// Returns an error if encoding or the write fails
pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, message: &Message) -> Result<()> {
    w.write_all(&protocol::encode(message)?).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmsync_core::ChangeKind;

    #[tokio::test]
    async fn test_duplex_exchange() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let sent = Message::ContentAvailable {
            kind: ChangeKind::Block,
            locator: "swarm:00".into(),
            publisher: "desktop".into(),
        };
        write_message(&mut client, &sent).await.unwrap();
        drop(client);

        assert_eq!(read_message(&mut server).await.unwrap(), Some(sent));
        assert_eq!(read_message(&mut server).await.unwrap(), None);
    }
}
