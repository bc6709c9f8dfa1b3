//! swarmsync-coordinator: the server side of the swarm
//!
//! Tracks which devices are alive, picks the single peer a joining device reconciles
//! against, relays notifications to device listeners and releases seeding sessions
//! once every recipient has fetched the content.

pub mod registry;
pub mod sessions;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use parking_lot::{Mutex, RwLock};
use swarmsync_core::manifest::unix_now;
use swarmsync_core::{ChangeKind, Message};
use swarmsync_transport::{Coordination, DeviceInfo, HeartbeatAck, Relay, StatusUpdate};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use registry::{DeviceRecord, PING_TIMEOUT, PeerRegistry, SWEEP_INTERVAL};
pub use sessions::SeedingSessions;

pub struct Coordinator {
    registry: RwLock<PeerRegistry>,
    sessions: Mutex<SeedingSessions>,
    relay: Arc<dyn Relay>,
}

impl Coordinator {
    #[must_use]
    pub fn new(relay: Arc<dyn Relay>) -> Self {
        Self {
            registry: RwLock::new(PeerRegistry::new()),
            sessions: Mutex::new(SeedingSessions::new()),
            relay,
        }
    }

    /// Start from previously persisted device records
    #[must_use]
    pub fn with_devices(relay: Arc<dyn Relay>, records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let coordinator = Self::new(relay);
        let now = Instant::now();
        {
            let mut registry = coordinator.registry.write();
            for record in records {
                registry.register(record, now);
            }
        }
        coordinator
    }

    pub fn register_device(&self, device_id: &str, user_id: &str) {
        self.registry
            .write()
            .register(DeviceRecord::new(device_id, user_id), Instant::now());
    }

    #[must_use]
    pub fn device(&self, device_id: &str) -> Option<DeviceInfo> {
        self.registry.read().get(device_id).map(DeviceRecord::info)
    }

    /// Evict silent devices and release sessions that were only waiting on them
    pub async fn sweep(&self) -> Vec<String> {
        let evicted = self.registry.write().sweep(Instant::now(), PING_TIMEOUT);
        for device_id in &evicted {
            info!("{device_id} timed out");
            self.forget_recipient(device_id).await;
        }
        evicted
    }

    /// Run [`Coordinator::sweep`] every [`SWEEP_INTERVAL`] until aborted
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                coordinator.sweep().await;
            }
        })
    }

    async fn forget_recipient(&self, device_id: &str) {
        let closed = self.sessions.lock().drop_recipient(device_id);
        for (locator, publisher) in closed {
            self.release(&locator, &publisher).await;
        }
    }

    async fn release(&self, locator: &str, publisher: &str) {
        debug!("Releasing {locator} from {publisher}");
        let message = Message::CompleteSeeding {
            locator: locator.to_string(),
        };
        if let Err(e) = self.relay.deliver(publisher, message).await {
            warn!("Could not tell {publisher} to stop seeding {locator}: {e}");
        }
    }
}

#[async_trait]
impl Coordination for Coordinator {
    async fn heartbeat(&self, device_id: &str) -> Result<HeartbeatAck> {
        let came_online = self.registry.write().heartbeat(device_id, Instant::now())?;
        Ok(HeartbeatAck { came_online })
    }

    async fn update_status(&self, device_id: &str, update: StatusUpdate) -> Result<()> {
        match update {
            StatusUpdate::Offline => {
                self.registry.write().set_offline(device_id)?;
                info!("{device_id} signed off");
                self.forget_recipient(device_id).await;
            }
            StatusUpdate::Away(away) => self.registry.write().set_away(device_id, away)?,
        }
        Ok(())
    }

    async fn devices(&self, user_id: &str) -> Result<Vec<DeviceInfo>> {
        Ok(self.registry.read().devices_of(user_id))
    }

    async fn broadcast_targets(&self, device_id: &str) -> Result<Vec<String>> {
        Ok(self.registry.read().broadcast_targets(device_id))
    }

    async fn reconciliation_target(&self, requester: &str) -> Result<Option<String>> {
        Ok(self.registry.read().reconciliation_target(requester))
    }

    async fn submit_block_manifest(&self, requester: &str, manifest: Vec<u8>) -> Result<String> {
        let target = self
            .registry
            .read()
            .reconciliation_target(requester)
            .ok_or_else(|| eyre!("no online peer for {requester} to reconcile with"))?;

        info!("Relaying chunk manifest from {requester} to {target}");
        let message = Message::BlockManifest {
            requester: requester.to_string(),
            manifest,
        };
        self.relay.deliver(&target, message).await?;
        Ok(target)
    }

    async fn announce(
        &self,
        publisher: &str,
        locator: &str,
        kind: ChangeKind,
        recipient: Option<&str>,
    ) -> Result<usize> {
        let recipients = match recipient {
            Some(device_id) => vec![device_id.to_string()],
            None => self.registry.read().broadcast_targets(publisher),
        };
        if recipients.is_empty() {
            return Ok(0);
        }

        self.sessions.lock().open(locator, publisher, &recipients);
        debug!("Announcing {kind} {locator} from {publisher} to {recipients:?}");

        let mut delivered = 0;
        for device_id in &recipients {
            let message = Message::ContentAvailable {
                kind,
                locator: locator.to_string(),
                publisher: publisher.to_string(),
            };
            match self.relay.deliver(device_id, message).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Could not notify {device_id} of {locator}: {e}");
                    self.report_completion(device_id, locator).await?;
                }
            }
        }
        Ok(delivered)
    }

    async fn report_completion(&self, device_id: &str, locator: &str) -> Result<()> {
        let publisher = self.sessions.lock().complete(locator, device_id);
        if let Some(publisher) = publisher {
            self.release(locator, &publisher).await;
        }
        Ok(())
    }

    async fn record_synchronization(&self, device_id: &str) -> Result<()> {
        self.registry
            .write()
            .record_synchronization(device_id, unix_now())
    }
}
