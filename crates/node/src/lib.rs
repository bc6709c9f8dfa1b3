//! swarmsync-node: one device's side of the swarm
//!
//! The [`Node`] watches a root directory, broadcasts local edits as patches, joins the
//! swarm through block reconciliation when it comes online, and applies whatever its
//! peers publish.

pub mod decision;
pub mod orchestrator;
pub mod status;

pub use decision::{DecisionProvider, FixedDecision, JoinDecision};
pub use orchestrator::Node;
pub use status::{State, SyncStatus};
