use std::{collections::BTreeMap, fmt::Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod adapter;
mod amount;
mod cancel;
mod ibc;
mod services;

pub mod bech32m;
pub mod config;
pub mod poll;

pub use adapter::*;
pub use amount::*;
pub use cancel::*;
pub use ibc::*;
pub use services::*;

/// The height of a block on a ledger under test
pub type Height = u64;

/// Label attached to every resource created for a test run, used for cleanup
pub const CLEANUP_LABEL: &str = "ixtest";

/// Label attached to a volume naming the node that owns it
pub const NODE_OWNER_LABEL: &str = "ixtest-node-owner";

/// Maximum hostname length accepted by the container runtime
const MAX_HOSTNAME_LEN: usize = 64;

/// Identity of one node container within a test run.
///
/// The identity is immutable after construction; names and hostnames derived
/// from it are deterministic so that peers can address each other before any
/// container exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub index: usize,
    pub chain_id: String,
    pub test_name: String,
}

impl NodeIdentity {
    pub fn new(index: usize, chain_id: impl Into<String>, test_name: impl Into<String>) -> Self {
        Self {
            index,
            chain_id: chain_id.into(),
            test_name: test_name.into(),
        }
    }

    /// Labels tying a volume to the test run and to its owning node
    pub fn volume_labels(&self, owner: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (CLEANUP_LABEL.to_string(), self.test_name.clone()),
            (NODE_OWNER_LABEL.to_string(), owner.to_string()),
        ])
    }
}

/// Shortens a container name so it can be used as a hostname.
///
/// Names within the limit are returned untouched. Longer names keep their
/// first and last 30 characters joined by `_._`.
pub fn condense_host_name(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();

    if chars.len() <= MAX_HOSTNAME_LEN {
        return name.to_string();
    }

    let head: String = chars[..30].iter().collect();
    let tail: String = chars[chars.len() - 30..].iter().collect();

    format!("{head}_._{tail}")
}

/// Opaque identifier of a persistent volume bound to a single node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeHandle(pub String);

impl Display for VolumeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque identifier of a container created through the lifecycle adapter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A container image reference plus the user its processes run as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerImage {
    pub repository: String,
    pub version: String,
    pub uid_gid: String,
}

impl DockerImage {
    pub fn new(
        repository: impl Into<String>,
        version: impl Into<String>,
        uid_gid: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            version: version.into(),
            uid_gid: uid_gid.into(),
        }
    }

    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.version)
    }
}

impl From<&config::ImageConfig> for DockerImage {
    fn from(value: &config::ImageConfig) -> Self {
        Self::new(&value.repository, &value.version, &value.uid_gid)
    }
}

/// Port spec inside a container, e.g. `8080/tcp`
pub type ContainerPort = &'static str;

/// Strips the protocol suffix from a container port spec
pub fn port_number(port: ContainerPort) -> &'static str {
    port.split('/').next().unwrap_or(port)
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("no block at height {0}")]
    MissingBlock(Height),

    #[error("ledger internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl LedgerError {
    pub fn internal<T>(value: T) -> Self
    where
        T: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        LedgerError::Internal(value.into())
    }
}

/// A ledger exposing its current height
#[trait_variant::make(Send)]
pub trait ChainHeighter {
    async fn height(&self) -> Result<Height, LedgerError>;
}

/// A ledger that can list the packet acknowledgements written at a height
#[trait_variant::make(Send)]
pub trait ChainAcker: ChainHeighter {
    async fn acknowledgements(
        &self,
        height: Height,
    ) -> Result<Vec<PacketAcknowledgement>, LedgerError>;
}
