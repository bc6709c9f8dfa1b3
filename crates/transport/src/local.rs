//! In-process relay for testing
//!
//! Delivers straight to registered handlers without sockets. Each delivery runs on
//! its own task, like a connection accepted by [`crate::InboundListener`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use parking_lot::RwLock;
use swarmsync_core::Message;

use crate::{InboundHandler, Relay};

#[derive(Default)]
pub struct ChannelRelay {
    handlers: RwLock<HashMap<String, Arc<dyn InboundHandler>>>,
}

impl ChannelRelay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device_id: impl Into<String>, handler: Arc<dyn InboundHandler>) {
        self.handlers.write().insert(device_id.into(), handler);
    }

    /// Simulate a device dropping off the network
    pub fn unregister(&self, device_id: &str) {
        self.handlers.write().remove(device_id);
    }
}

#[async_trait]
impl Relay for ChannelRelay {
    async fn deliver(&self, device_id: &str, message: Message) -> Result<()> {
        let handler = self
            .handlers
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| eyre!("{device_id} is not reachable"))?;

        tokio::spawn(async move { handler.handle(message).await })
            .await
            .map_err(|e| eyre!("handler task for {device_id} failed: {e}"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[async_trait]
    impl InboundHandler for Counter {
        async fn handle(&self, _message: Message) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_register_deliver_unregister() {
        let relay = ChannelRelay::new();
        let counter = Arc::new(Counter::default());
        relay.register("desktop", counter.clone());

        relay.deliver("desktop", Message::Ok).await.unwrap();
        relay.deliver("desktop", Message::Ok).await.unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);

        relay.unregister("desktop");
        assert!(relay.deliver("desktop", Message::Ok).await.is_err());
    }
}
