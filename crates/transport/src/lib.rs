//! swarmsync-transport: the seams between a device and the outside world
//!
//! - [`Swarm`]: publish, retrieve and stop seeding manifest documents
//! - [`Coordination`]: the request channel to the coordination service
//! - [`Relay`]: how the coordination service reaches a device's inbound listener
//!
//! Each seam has a concrete implementation here: a directory-backed swarm, a TCP
//! listener plus relay, and an in-process channel relay for tests.

pub mod frame;
pub mod local;
pub mod swarm;
pub mod tcp;

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use swarmsync_core::{ChangeKind, Message};

pub use local::ChannelRelay;
pub use swarm::DirectorySwarm;
pub use tcp::{InboundListener, TcpRelay};

/// Content-distribution layer: documents in, opaque locators out
#[async_trait]
pub trait Swarm: Send + Sync {
    /// Make a document available and start seeding it
    async fn publish(&self, document: Bytes) -> Result<String>;

    async fn retrieve(&self, locator: &str) -> Result<Bytes>;

    async fn stop_seeding(&self, locator: &str) -> Result<()>;
}

/// Delivery of a notification to one device's inbound listener
#[async_trait]
pub trait Relay: Send + Sync {
    async fn deliver(&self, device_id: &str, message: Message) -> Result<()>;
}

/// Handles notifications arriving at a device
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<()>;
}

/// Reply to a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatAck {
    /// The device was offline before this heartbeat
    pub came_online: bool,
}

/// A status change requested by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Offline,
    Away(bool),
}

/// A device as the coordination service sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub user_id: String,
    pub online: bool,
    pub away: bool,
    /// Seconds since the Unix epoch
    pub last_synchronization: Option<u64>,
}

/// Request channel from a device to the coordination service
#[async_trait]
pub trait Coordination: Send + Sync {
    async fn heartbeat(&self, device_id: &str) -> Result<HeartbeatAck>;

    async fn update_status(&self, device_id: &str, update: StatusUpdate) -> Result<()>;

    /// Every device of `user_id`
    async fn devices(&self, user_id: &str) -> Result<Vec<DeviceInfo>>;

    /// Online, non-away devices of the same user other than `device_id`
    async fn broadcast_targets(&self, device_id: &str) -> Result<Vec<String>>;

    /// Online peer with the most recent synchronization, if any
    async fn reconciliation_target(&self, requester: &str) -> Result<Option<String>>;

    /// Relay a chunk manifest to the reconciliation target; returns the peer chosen
    async fn submit_block_manifest(&self, requester: &str, manifest: Vec<u8>) -> Result<String>;

    /// Tell one recipient, or all broadcast targets, that `locator` is available.
    ///
    /// Returns how many devices were notified. Zero recipients closes the session at once.
    async fn announce(
        &self,
        publisher: &str,
        locator: &str,
        kind: ChangeKind,
        recipient: Option<&str>,
    ) -> Result<usize>;

    async fn report_completion(&self, device_id: &str, locator: &str) -> Result<()>;

    async fn record_synchronization(&self, device_id: &str) -> Result<()>;
}
