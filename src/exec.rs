//! Glue between node components and the lifecycle adapter.
//!
//! [`NodeVolume`] owns a node's persistent volume and runs one-shot jobs
//! against it; [`ContainerLifecycle`] drives the node's long-running
//! container. Both wrap every adapter failure with the operation and target
//! that produced it.

use std::sync::{PoisonError, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use ixtest_core::{
    with_cancel, ContainerId, ContainerPort, ContainerSpec, DockerImage, ExecOutput,
    LifecycleAdapter, NodeIdentity, OneShot, VolumeHandle,
};

use crate::prelude::*;

/// Stderr fragment emitted by the key tooling when a key is already on disk
pub const ALREADY_EXISTS_MARKER: &str = "already exists, refusing to overwrite it";

/// A persistent volume bound to exactly one node, plus the image and mount
/// point used to run jobs against it.
#[derive(Clone)]
pub struct NodeVolume<A> {
    adapter: A,
    handle: VolumeHandle,
    image: DockerImage,
    home_dir: &'static str,
    owner: String,
}

impl<A: LifecycleAdapter> NodeVolume<A> {
    /// Creates a labelled volume for `owner` and hands it to the image user
    #[instrument(skip_all, fields(owner))]
    pub async fn create(
        cancel: &CancellationToken,
        adapter: A,
        identity: &NodeIdentity,
        owner: &str,
        image: DockerImage,
        home_dir: &'static str,
    ) -> Result<Self, Error> {
        let labels = identity.volume_labels(owner);

        let handle = with_cancel(cancel, "create volume", adapter.create_volume(labels))
            .await?
            .map_err(Error::adapter("create volume", owner))?;

        with_cancel(
            cancel,
            "set volume owner",
            adapter.set_volume_owner(&handle, &image),
        )
        .await?
        .map_err(Error::adapter("set volume owner", owner))?;

        debug!(volume = %handle, "node volume ready");

        Ok(Self {
            adapter,
            handle,
            image,
            home_dir,
            owner: owner.to_string(),
        })
    }

    pub fn handle(&self) -> &VolumeHandle {
        &self.handle
    }

    pub fn image(&self) -> &DockerImage {
        &self.image
    }

    pub fn home_dir(&self) -> &'static str {
        self.home_dir
    }

    /// Bind spec mounting the volume at the node's home directory
    pub fn bind(&self) -> Vec<String> {
        vec![format!("{}:{}", self.handle, self.home_dir)]
    }

    /// Runs a one-shot job against the volume.
    ///
    /// A non-zero exit becomes [`Error::Command`] carrying the job's stderr.
    pub async fn exec(
        &self,
        cancel: &CancellationToken,
        op: &'static str,
        target: &str,
        cmd: Vec<String>,
    ) -> Result<ExecOutput, Error> {
        let output = self.run(cancel, op, target, cmd).await?;

        if !output.success() {
            return Err(Error::Command {
                op,
                target: target.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr_lossy().trim().to_string(),
            });
        }

        Ok(output)
    }

    /// Like [`NodeVolume::exec`], but a job that fails only because its
    /// output already exists counts as success.
    pub async fn exec_idempotent(
        &self,
        cancel: &CancellationToken,
        op: &'static str,
        target: &str,
        cmd: Vec<String>,
    ) -> Result<(), Error> {
        let output = self.run(cancel, op, target, cmd).await?;

        if output.success() {
            return Ok(());
        }

        let stderr = output.stderr_lossy();

        if stderr.contains(ALREADY_EXISTS_MARKER) {
            info!(op, target, "already exists, keeping existing");
            return Ok(());
        }

        Err(Error::Command {
            op,
            target: target.to_string(),
            exit_code: output.exit_code,
            stderr: stderr.trim().to_string(),
        })
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        op: &'static str,
        target: &str,
        cmd: Vec<String>,
    ) -> Result<ExecOutput, Error> {
        debug!(op, target, ?cmd, "running one-shot job");

        let job = OneShot {
            image: self.image.clone(),
            cmd,
            env: vec![],
            binds: self.bind(),
        };

        with_cancel(cancel, op, self.adapter.run_one_shot(job))
            .await?
            .map_err(Error::adapter(op, target))
    }

    /// Writes `content` at `rel_path`, relative to the home directory
    pub async fn write_file(
        &self,
        cancel: &CancellationToken,
        rel_path: &str,
        content: &[u8],
    ) -> Result<(), Error> {
        debug!(volume = %self.handle, rel_path, bytes = content.len(), "writing file");

        with_cancel(
            cancel,
            "write file",
            self.adapter.write_file(&self.handle, rel_path, content),
        )
        .await?
        .map_err(Error::adapter("write file", format!("{}:{rel_path}", self.owner)))
    }

    pub async fn read_file(
        &self,
        cancel: &CancellationToken,
        rel_path: &str,
    ) -> Result<Vec<u8>, Error> {
        with_cancel(
            cancel,
            "read file",
            self.adapter.read_file(&self.handle, rel_path),
        )
        .await?
        .map_err(Error::adapter("read file", format!("{}:{rel_path}", self.owner)))
    }
}

/// Long-running container of a single node
pub struct ContainerLifecycle<A> {
    adapter: A,
    name: String,
    id: RwLock<Option<ContainerId>>,
}

impl<A: LifecycleAdapter> ContainerLifecycle<A> {
    pub fn new(adapter: A, name: impl Into<String>) -> Self {
        Self {
            adapter,
            name: name.into(),
            id: RwLock::new(None),
        }
    }

    fn current_id(&self) -> Option<ContainerId> {
        self.id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn require_id(&self) -> Result<ContainerId, Error> {
        self.current_id()
            .ok_or_else(|| Error::not_found("container", &self.name))
    }

    #[instrument(skip_all, fields(container = %self.name))]
    pub async fn create_container(
        &self,
        cancel: &CancellationToken,
        spec: ContainerSpec,
    ) -> Result<(), Error> {
        let id = with_cancel(
            cancel,
            "create container",
            self.adapter.create_container(spec),
        )
        .await?
        .map_err(Error::adapter("create container", &self.name))?;

        info!(id = %id, "container created");

        *self.id.write().unwrap_or_else(PoisonError::into_inner) = Some(id);

        Ok(())
    }

    #[instrument(skip_all, fields(container = %self.name))]
    pub async fn start_container(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let id = self.require_id()?;

        with_cancel(cancel, "start container", self.adapter.start_container(&id))
            .await?
            .map_err(Error::adapter("start container", &self.name))?;

        info!("container started");

        Ok(())
    }

    /// Stops the container; a container that was never created or is
    /// already stopped is left as is.
    #[instrument(skip_all, fields(container = %self.name))]
    pub async fn stop_container(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let Some(id) = self.current_id() else {
            warn!("stop requested for a container that was never created");
            return Ok(());
        };

        with_cancel(cancel, "stop container", self.adapter.stop_container(&id))
            .await?
            .map_err(Error::adapter("stop container", &self.name))?;

        info!("container stopped");

        Ok(())
    }

    pub async fn host_ports(
        &self,
        cancel: &CancellationToken,
        ports: &[ContainerPort],
    ) -> Result<Vec<Option<String>>, Error> {
        let id = self.require_id()?;

        with_cancel(cancel, "host ports", self.adapter.host_ports(&id, ports))
            .await?
            .map_err(Error::adapter("host ports", &self.name))
    }
}
