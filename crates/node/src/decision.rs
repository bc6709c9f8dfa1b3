//! The Transfer/Overwrite choice made when a device joins a live swarm

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use color_eyre::eyre::{Report, eyre};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDecision {
    /// Keep local changes: pull the swarm's state, then push the local state back out
    Transfer,
    /// Discard local changes in favour of the swarm's state
    Overwrite,
}

impl fmt::Display for JoinDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transfer => f.write_str("transfer"),
            Self::Overwrite => f.write_str("overwrite"),
        }
    }
}

impl FromStr for JoinDecision {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "transfer" => Ok(Self::Transfer),
            "overwrite" => Ok(Self::Overwrite),
            other => Err(eyre!("unknown join decision {other:?}, expected transfer or overwrite")),
        }
    }
}

/// Asks whoever is in charge of this device how to join
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn decide(&self, online_peers: usize) -> JoinDecision;
}

/// Always answers the same way
#[derive(Debug, Clone, Copy)]
pub struct FixedDecision(pub JoinDecision);

#[async_trait]
impl DecisionProvider for FixedDecision {
    async fn decide(&self, _online_peers: usize) -> JoinDecision {
        self.0
    }
}
