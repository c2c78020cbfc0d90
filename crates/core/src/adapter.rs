//! Contract of the container/volume substrate that hosts ledger nodes.
//!
//! The harness never talks to a container runtime directly; everything goes
//! through [`LifecycleAdapter`]. Implementations decide how volumes, one-shot
//! jobs and long-running containers are materialized.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::{ContainerId, ContainerPort, DockerImage, VolumeHandle};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("volume {0} not found")]
    VolumeNotFound(VolumeHandle),

    #[error("container {0} not found")]
    ContainerNotFound(String),

    #[error("container {0} already exists")]
    ContainerExists(String),

    #[error("file {path} not found in volume {volume}")]
    FileNotFound { volume: VolumeHandle, path: String },

    #[error("port {0} is not exposed")]
    PortNotExposed(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("adapter internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl AdapterError {
    pub fn internal<T>(value: T) -> Self
    where
        T: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        AdapterError::Internal(value.into())
    }
}

/// Everything needed to create a long-running node container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub hostname: String,
    pub image: DockerImage,
    pub exposed_ports: Vec<ContainerPort>,
    pub binds: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
}

/// A one-shot job run to completion inside an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneShot {
    pub image: DockerImage,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub binds: Vec<String>,
}

/// Captured result of a one-shot job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Provisioning substrate for node containers and their volumes.
///
/// A failing job is not an adapter error: `run_one_shot` reports the exit
/// code in [`ExecOutput`] and only fails when the job could not be run at all.
/// Stopping a container that is not running must succeed.
#[trait_variant::make(Send)]
pub trait LifecycleAdapter: Clone + Send + Sync + 'static {
    async fn create_volume(
        &self,
        labels: BTreeMap<String, String>,
    ) -> Result<VolumeHandle, AdapterError>;

    async fn set_volume_owner(
        &self,
        volume: &VolumeHandle,
        image: &DockerImage,
    ) -> Result<(), AdapterError>;

    async fn create_container(&self, spec: ContainerSpec) -> Result<ContainerId, AdapterError>;

    async fn start_container(&self, id: &ContainerId) -> Result<(), AdapterError>;

    async fn stop_container(&self, id: &ContainerId) -> Result<(), AdapterError>;

    /// Host-reachable addresses for the given container ports, in order.
    ///
    /// A port that is not published on the host yields `None`.
    async fn host_ports(
        &self,
        id: &ContainerId,
        ports: &[ContainerPort],
    ) -> Result<Vec<Option<String>>, AdapterError>;

    async fn run_one_shot(&self, job: OneShot) -> Result<ExecOutput, AdapterError>;

    async fn write_file(
        &self,
        volume: &VolumeHandle,
        rel_path: &str,
        content: &[u8],
    ) -> Result<(), AdapterError>;

    async fn read_file(&self, volume: &VolumeHandle, rel_path: &str)
        -> Result<Vec<u8>, AdapterError>;
}
