//! In-memory container runtime.
//!
//! Volumes are file maps, containers are bookkeeping records with published
//! ports, and one-shot jobs are interpreted by the emulated toolchain against
//! the volume they bind. Every call is journaled and selected operations can
//! be made to fail.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use tracing::{debug, info};

use ixtest_core::{
    AdapterError, ContainerId, ContainerPort, ContainerSpec, DockerImage, ExecOutput,
    LifecycleAdapter, OneShot, VolumeHandle,
};

use crate::toolchain::{self, Mount};

const FIRST_HOST_PORT: u16 = 32768;

/// Operations recorded by the sandbox, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxCall {
    CreateVolume(VolumeHandle),
    SetVolumeOwner(VolumeHandle, String),
    CreateContainer(String),
    StartContainer(String),
    StopContainer(String),
    HostPorts(String),
    RunOneShot(Vec<String>),
    WriteFile(String),
    ReadFile(String),
}

/// Failures that can be injected into the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SandboxFault {
    /// Writes to this volume-relative path fail
    WriteFile(String),

    /// One-shot jobs whose command line contains this fragment exit with 1
    Command(String),

    /// Starting the container with this name fails
    StartContainer(String),
}

#[derive(Debug, Default)]
struct Volume {
    labels: BTreeMap<String, String>,
    owner: Option<String>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug)]
struct Container {
    spec: ContainerSpec,
    running: bool,
    ports: BTreeMap<ContainerPort, String>,
}

#[derive(Debug, Default)]
struct SandboxState {
    volumes: HashMap<VolumeHandle, Volume>,
    containers: HashMap<ContainerId, Container>,
    next_volume: usize,
    next_port: u16,
    journal: Vec<SandboxCall>,
    faults: HashSet<SandboxFault>,
}

#[derive(Clone, Default)]
pub struct Sandbox {
    state: Arc<RwLock<SandboxState>>,
}

impl Sandbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> RwLockWriteGuard<'_, SandboxState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn inject(&self, fault: SandboxFault) {
        self.write().faults.insert(fault);
    }

    pub fn clear_faults(&self) {
        self.write().faults.clear();
    }

    pub fn journal(&self) -> Vec<SandboxCall> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .journal
            .clone()
    }

    /// Volumes carrying `key = value` among their labels
    pub fn volumes_labelled(&self, key: &str, value: &str) -> Vec<VolumeHandle> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        let mut found: Vec<_> = state
            .volumes
            .iter()
            .filter(|(_, v)| v.labels.get(key).map(String::as_str) == Some(value))
            .map(|(handle, _)| handle.clone())
            .collect();

        found.sort();
        found
    }

    pub fn volume_owner(&self, volume: &VolumeHandle) -> Option<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.volumes.get(volume).and_then(|v| v.owner.clone())
    }

    /// Whether the container named `name` exists and is running
    pub fn is_running(&self, name: &str) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        state
            .containers
            .values()
            .any(|c| c.spec.name == name && c.running)
    }

    pub fn container_spec(&self, name: &str) -> Option<ContainerSpec> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        state
            .containers
            .values()
            .find(|c| c.spec.name == name)
            .map(|c| c.spec.clone())
    }
}

/// Splits a `volume:/mount/point` bind
fn parse_bind(bind: &str) -> Result<(VolumeHandle, &str), AdapterError> {
    bind.split_once(':')
        .map(|(volume, root)| (VolumeHandle(volume.to_string()), root))
        .ok_or_else(|| AdapterError::Runtime(format!("malformed bind {bind}")))
}

impl LifecycleAdapter for Sandbox {
    async fn create_volume(
        &self,
        labels: BTreeMap<String, String>,
    ) -> Result<VolumeHandle, AdapterError> {
        let mut state = self.write();

        state.next_volume += 1;
        let handle = VolumeHandle(format!("ixtest-vol-{}", state.next_volume));

        state.journal.push(SandboxCall::CreateVolume(handle.clone()));
        state.volumes.insert(
            handle.clone(),
            Volume {
                labels,
                ..Default::default()
            },
        );

        debug!(volume = %handle, "volume created");

        Ok(handle)
    }

    async fn set_volume_owner(
        &self,
        volume: &VolumeHandle,
        image: &DockerImage,
    ) -> Result<(), AdapterError> {
        let mut state = self.write();

        state
            .journal
            .push(SandboxCall::SetVolumeOwner(volume.clone(), image.uid_gid.clone()));

        let entry = state
            .volumes
            .get_mut(volume)
            .ok_or_else(|| AdapterError::VolumeNotFound(volume.clone()))?;

        entry.owner = Some(image.uid_gid.clone());

        Ok(())
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<ContainerId, AdapterError> {
        let mut state = self.write();

        state
            .journal
            .push(SandboxCall::CreateContainer(spec.name.clone()));

        if state.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(AdapterError::ContainerExists(spec.name));
        }

        for bind in &spec.binds {
            let (volume, _) = parse_bind(bind)?;

            if !state.volumes.contains_key(&volume) {
                return Err(AdapterError::VolumeNotFound(volume));
            }
        }

        if state.next_port == 0 {
            state.next_port = FIRST_HOST_PORT;
        }

        let mut ports = BTreeMap::new();

        for port in &spec.exposed_ports {
            ports.insert(*port, format!("127.0.0.1:{}", state.next_port));
            state.next_port += 1;
        }

        let id = ContainerId(format!("{}-{:04}", spec.name, state.containers.len()));

        info!(name = %spec.name, id = %id, "container created");

        state.containers.insert(
            id.clone(),
            Container {
                spec,
                running: false,
                ports,
            },
        );

        Ok(id)
    }

    async fn start_container(&self, id: &ContainerId) -> Result<(), AdapterError> {
        let mut state = self.write();

        let state = &mut *state;

        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| AdapterError::ContainerNotFound(id.to_string()))?;

        state
            .journal
            .push(SandboxCall::StartContainer(container.spec.name.clone()));

        if state
            .faults
            .contains(&SandboxFault::StartContainer(container.spec.name.clone()))
        {
            return Err(AdapterError::Runtime(format!(
                "container {} exited during startup",
                container.spec.name
            )));
        }

        container.running = true;

        Ok(())
    }

    async fn stop_container(&self, id: &ContainerId) -> Result<(), AdapterError> {
        let mut state = self.write();

        let state = &mut *state;

        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| AdapterError::ContainerNotFound(id.to_string()))?;

        state
            .journal
            .push(SandboxCall::StopContainer(container.spec.name.clone()));

        container.running = false;

        Ok(())
    }

    async fn host_ports(
        &self,
        id: &ContainerId,
        ports: &[ContainerPort],
    ) -> Result<Vec<Option<String>>, AdapterError> {
        let mut state = self.write();

        let state = &mut *state;

        let container = state
            .containers
            .get(id)
            .ok_or_else(|| AdapterError::ContainerNotFound(id.to_string()))?;

        state
            .journal
            .push(SandboxCall::HostPorts(container.spec.name.clone()));

        if !container.running {
            return Err(AdapterError::Runtime(format!(
                "container {} is not running",
                container.spec.name
            )));
        }

        Ok(ports
            .iter()
            .map(|port| container.ports.get(port).cloned())
            .collect())
    }

    async fn run_one_shot(&self, job: OneShot) -> Result<ExecOutput, AdapterError> {
        let mut state = self.write();

        let state = &mut *state;

        state.journal.push(SandboxCall::RunOneShot(job.cmd.clone()));

        let joined = job.cmd.join(" ");

        let injected = state.faults.iter().any(|fault| match fault {
            SandboxFault::Command(fragment) => joined.contains(fragment.as_str()),
            _ => false,
        });

        if injected {
            return Ok(ExecOutput {
                stdout: vec![],
                stderr: b"Error: injected failure\n".to_vec(),
                exit_code: 1,
            });
        }

        let bind = job
            .binds
            .first()
            .ok_or_else(|| AdapterError::Runtime("one-shot job without a volume".into()))?;

        let (handle, root) = parse_bind(bind)?;

        let volume = state
            .volumes
            .get_mut(&handle)
            .ok_or_else(|| AdapterError::VolumeNotFound(handle.clone()))?;

        let mut mount = Mount {
            root,
            files: &mut volume.files,
        };

        Ok(toolchain::run(&job.cmd, &mut mount))
    }

    async fn write_file(
        &self,
        volume: &VolumeHandle,
        rel_path: &str,
        content: &[u8],
    ) -> Result<(), AdapterError> {
        let mut state = self.write();

        let state = &mut *state;

        state.journal.push(SandboxCall::WriteFile(rel_path.to_string()));

        if state
            .faults
            .contains(&SandboxFault::WriteFile(rel_path.to_string()))
        {
            return Err(AdapterError::Runtime(format!("disk full writing {rel_path}")));
        }

        let entry = state
            .volumes
            .get_mut(volume)
            .ok_or_else(|| AdapterError::VolumeNotFound(volume.clone()))?;

        entry.files.insert(rel_path.to_string(), content.to_vec());

        Ok(())
    }

    async fn read_file(
        &self,
        volume: &VolumeHandle,
        rel_path: &str,
    ) -> Result<Vec<u8>, AdapterError> {
        let mut state = self.write();

        state.journal.push(SandboxCall::ReadFile(rel_path.to_string()));

        let entry = state
            .volumes
            .get(volume)
            .ok_or_else(|| AdapterError::VolumeNotFound(volume.clone()))?;

        entry
            .files
            .get(rel_path)
            .cloned()
            .ok_or_else(|| AdapterError::FileNotFound {
                volume: volume.clone(),
                path: rel_path.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> DockerImage {
        DockerImage::new("pd", "latest", "1025:1025")
    }

    fn spec(name: &str, binds: Vec<String>) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            hostname: name.to_string(),
            image: image(),
            exposed_ports: vec!["8080/tcp", "9000/tcp"],
            binds,
            cmd: vec!["pd".into(), "start".into()],
            env: vec![],
        }
    }

    #[tokio::test]
    async fn volumes_keep_labels_and_owner() {
        let sandbox = Sandbox::new();
        let labels = BTreeMap::from([("ixtest".to_string(), "TestA".to_string())]);

        let volume = sandbox.create_volume(labels).await.unwrap();
        sandbox.set_volume_owner(&volume, &image()).await.unwrap();

        assert_eq!(sandbox.volumes_labelled("ixtest", "TestA"), vec![volume.clone()]);
        assert_eq!(sandbox.volume_owner(&volume).as_deref(), Some("1025:1025"));
    }

    #[tokio::test]
    async fn ports_are_published_only_when_exposed() {
        let sandbox = Sandbox::new();
        let id = sandbox.create_container(spec("pd-0", vec![])).await.unwrap();

        let err = sandbox.host_ports(&id, &["8080/tcp"]).await.unwrap_err();
        assert!(matches!(err, AdapterError::Runtime(_)));

        sandbox.start_container(&id).await.unwrap();

        let ports = sandbox
            .host_ports(&id, &["26657/tcp", "8080/tcp"])
            .await
            .unwrap();

        assert_eq!(ports[0], None);
        assert!(ports[1].as_deref().unwrap().starts_with("127.0.0.1:"));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let sandbox = Sandbox::new();
        let id = sandbox.create_container(spec("pd-0", vec![])).await.unwrap();

        sandbox.start_container(&id).await.unwrap();
        sandbox.stop_container(&id).await.unwrap();
        sandbox.stop_container(&id).await.unwrap();

        assert!(!sandbox.is_running("pd-0"));
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let sandbox = Sandbox::new();
        sandbox.create_container(spec("pd-0", vec![])).await.unwrap();

        let err = sandbox.create_container(spec("pd-0", vec![])).await.unwrap_err();
        assert!(matches!(err, AdapterError::ContainerExists(_)));
    }

    #[tokio::test]
    async fn jobs_see_volume_files() {
        let sandbox = Sandbox::new();
        let volume = sandbox.create_volume(BTreeMap::new()).await.unwrap();
        let bind = format!("{volume}:/home/heighliner");

        let job = OneShot {
            image: image(),
            cmd: vec![
                "pcli".into(),
                "-d".into(),
                "/home/heighliner/keys/alice".into(),
                "keys".into(),
                "generate".into(),
            ],
            env: vec![],
            binds: vec![bind],
        };

        let out = sandbox.run_one_shot(job).await.unwrap();
        assert!(out.success());

        let custody = sandbox
            .read_file(&volume, "keys/alice/custody.json")
            .await
            .unwrap();
        assert!(!custody.is_empty());
    }

    #[tokio::test]
    async fn injected_write_failure() {
        let sandbox = Sandbox::new();
        let volume = sandbox.create_volume(BTreeMap::new()).await.unwrap();
        sandbox.inject(SandboxFault::WriteFile("validators.json".into()));

        let err = sandbox
            .write_file(&volume, "validators.json", b"[]")
            .await
            .unwrap_err();

        assert!(matches!(err, AdapterError::Runtime(_)));

        sandbox.clear_faults();
        sandbox
            .write_file(&volume, "validators.json", b"[]")
            .await
            .unwrap();
    }
}
