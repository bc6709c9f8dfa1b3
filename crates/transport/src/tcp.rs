//! TCP inbound listener and the relay that dials it

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail, eyre};
use parking_lot::RwLock;
use swarmsync_core::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::frame::{read_message, write_message};
use crate::{InboundHandler, Relay};

/// Default inbound port
pub const DEFAULT_PORT: u16 = 3125;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts framed notifications, one handler task per connection
pub struct InboundListener {
    listener: TcpListener,
}

impl InboundListener {
    /// # Errors
    /// Returns an error if the address cannot be bound
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("failed to bind inbound listener on {addr}"))?;
        Ok(Self { listener })
    }

    /// # Errors
    /// Returns an error if the socket has no local address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the returned task is aborted
    pub fn spawn(self, handler: Arc<dyn InboundHandler>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match self.listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Inbound accept failed: {e}");
                        continue;
                    }
                };
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, handler).await {
                        warn!("Inbound connection from {peer} failed: {e}");
                    }
                });
            }
        })
    }
}

async fn serve_connection(mut stream: TcpStream, handler: Arc<dyn InboundHandler>) -> Result<()> {
    while let Some(message) = read_message(&mut stream).await? {
        debug!("Inbound {}", message.name());
        let reply = match handler.handle(message).await {
            Ok(()) => Message::Ok,
            Err(e) => Message::Error(format!("{e:#}")),
        };
        write_message(&mut stream, &reply).await?;
    }
    Ok(())
}

/// Relay that dials each device's inbound listener by registered address
#[derive(Default)]
pub struct TcpRelay {
    addresses: RwLock<HashMap<String, SocketAddr>>,
}

impl TcpRelay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device_id: impl Into<String>, addr: SocketAddr) {
        self.addresses.write().insert(device_id.into(), addr);
    }

    #[must_use]
    pub fn address(&self, device_id: &str) -> Option<SocketAddr> {
        self.addresses.read().get(device_id).copied()
    }
}

#[async_trait]
impl Relay for TcpRelay {
    async fn deliver(&self, device_id: &str, message: Message) -> Result<()> {
        let addr = self
            .address(device_id)
            .ok_or_else(|| eyre!("no address registered for {device_id}"))?;

        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| eyre!("timed out connecting to {device_id} at {addr}"))?
            .wrap_err_with(|| format!("failed to connect to {device_id} at {addr}"))?;

        write_message(&mut stream, &message).await?;
        match read_message(&mut stream).await? {
            Some(Message::Ok) => Ok(()),
            Some(Message::Error(reason)) => bail!("{device_id} rejected {}: {reason}", message.name()),
            Some(other) => bail!("unexpected reply {} from {device_id}", other.name()),
            None => bail!("{device_id} closed the connection without replying"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl InboundHandler for Recorder {
        async fn handle(&self, message: Message) -> Result<()> {
            if let Message::CompleteSeeding { locator } = &message {
                if locator == "swarm:bad" {
                    bail!("unknown locator");
                }
            }
            self.seen.lock().push(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_relay_delivers_to_listener() {
        let listener = InboundListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recorder = Arc::new(Recorder::default());
        let task = listener.spawn(recorder.clone());

        let relay = TcpRelay::new();
        relay.register("laptop", addr);

        let message = Message::CompleteSeeding {
            locator: "swarm:ok".into(),
        };
        relay.deliver("laptop", message.clone()).await.unwrap();
        assert_eq!(recorder.seen.lock().clone(), vec![message]);

        let rejected = relay
            .deliver(
                "laptop",
                Message::CompleteSeeding {
                    locator: "swarm:bad".into(),
                },
            )
            .await;
        assert!(rejected.unwrap_err().to_string().contains("unknown locator"));

        task.abort();
    }

    #[tokio::test]
    async fn test_unknown_device_fails() {
        let relay = TcpRelay::new();
        assert!(relay.deliver("nobody", Message::Ok).await.is_err());
    }
}
