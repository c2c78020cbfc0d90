//! Supervisor of a single ledger node: its volume, keys, genesis and
//! long-running container.

use std::sync::{PoisonError, RwLock};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use ixtest_core::{
    bech32m, condense_host_name, port_number, ContainerPort, ContainerSpec, DockerImage,
    LifecycleAdapter, NodeIdentity,
};

use crate::exec::{ContainerLifecycle, NodeVolume};
use crate::genesis::{
    allocations_csv, validators_json, AllocationRecord, GenesisDocument, ValidatorDefinition,
};
use crate::prelude::*;

mod addresses;

pub use addresses::parse_address_list;

pub const HOME_DIR: &str = "/home/heighliner";

pub const RPC_PORT: ContainerPort = "26657/tcp";
pub const ABCI_PORT: ContainerPort = "26658/tcp";
pub const GRPC_PORT: ContainerPort = "8080/tcp";
pub const METRICS_PORT: ContainerPort = "9000/tcp";

const EXPOSED_PORTS: [ContainerPort; 3] = [ABCI_PORT, GRPC_PORT, METRICS_PORT];

const VALIDATOR_TEMPLATE_FILE: &str = "validator.toml";
const VALIDATORS_INPUT_FILE: &str = "validators.json";
const ALLOCATIONS_INPUT_FILE: &str = "allocations.csv";

/// Where the tooling leaves the generated genesis, relative to the home dir
pub const GENESIS_FILE: &str = ".penumbra/testnet_data/node0/tendermint/config/genesis.json";

/// Host-reachable addresses of a started node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPorts {
    pub rpc: Option<String>,
    pub grpc: String,
}

/// Everything known about a key held by a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub name: String,
    pub address: Vec<u8>,
    pub address_bech32m: String,
    pub full_viewing_key: String,
}

#[derive(Deserialize)]
struct CustodyFile {
    spend_key: String,
}

pub struct AppNode<A> {
    identity: NodeIdentity,
    volume: NodeVolume<A>,
    container: ContainerLifecycle<A>,
    host_ports: RwLock<Option<HostPorts>>,
}

impl<A: LifecycleAdapter> AppNode<A> {
    /// Creates the node's volume; no container exists until
    /// [`AppNode::create_container`].
    pub async fn new(
        cancel: &CancellationToken,
        adapter: A,
        identity: NodeIdentity,
        image: DockerImage,
    ) -> Result<Self, Error> {
        let name = node_name(&identity);

        let volume =
            NodeVolume::create(cancel, adapter.clone(), &identity, &name, image, HOME_DIR).await?;

        let container = ContainerLifecycle::new(adapter, &name);

        Ok(Self {
            identity,
            volume,
            container,
            host_ports: RwLock::new(None),
        })
    }

    /// Container name, `pd-{index}-{chain_id}-{test}`
    pub fn name(&self) -> String {
        node_name(&self.identity)
    }

    pub fn host_name(&self) -> String {
        condense_host_name(&self.name())
    }

    pub fn home_dir(&self) -> &'static str {
        HOME_DIR
    }

    pub fn bind(&self) -> Vec<String> {
        self.volume.bind()
    }

    fn key_dir(&self, key_name: &str) -> String {
        format!("{HOME_DIR}/keys/{key_name}")
    }

    /// Generates a key; a key already on disk is kept as is.
    #[instrument(skip(self, cancel), fields(node = %self.name()))]
    pub async fn create_key(
        &self,
        cancel: &CancellationToken,
        key_name: &str,
    ) -> Result<(), Error> {
        let cmd = vec![
            "pcli".to_string(),
            "-d".to_string(),
            self.key_dir(key_name),
            "keys".to_string(),
            "generate".to_string(),
        ];

        self.volume
            .exec_idempotent(cancel, "create key", key_name, cmd)
            .await
    }

    /// Imports a key from its seed phrase; a key already on disk is kept as
    /// is.
    #[instrument(skip(self, cancel, mnemonic), fields(node = %self.name()))]
    pub async fn recover_key(
        &self,
        cancel: &CancellationToken,
        key_name: &str,
        mnemonic: &str,
    ) -> Result<(), Error> {
        let cmd = vec![
            "pcli".to_string(),
            "-d".to_string(),
            self.key_dir(key_name),
            "keys".to_string(),
            "import".to_string(),
            "phrase".to_string(),
            mnemonic.to_string(),
        ];

        self.volume
            .exec_idempotent(cancel, "recover key", key_name, cmd)
            .await
    }

    pub async fn full_viewing_key(
        &self,
        cancel: &CancellationToken,
        key_name: &str,
    ) -> Result<String, Error> {
        let cmd = vec![
            "pcli".to_string(),
            "-d".to_string(),
            self.key_dir(key_name),
            "keys".to_string(),
            "export".to_string(),
            "full-viewing-key".to_string(),
        ];

        let output = self
            .volume
            .exec(cancel, "export full viewing key", key_name, cmd)
            .await?;

        output
            .stdout_lossy()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(str::to_string)
            .ok_or_else(|| Error::not_found("full viewing key", key_name))
    }

    /// Reads the spend key out of the key's custody file
    pub async fn spend_key(
        &self,
        cancel: &CancellationToken,
        key_name: &str,
    ) -> Result<String, Error> {
        let path = format!("keys/{key_name}/custody.json");
        let raw = self.volume.read_file(cancel, &path).await?;

        let custody: CustodyFile = serde_json::from_slice(&raw).map_err(Error::serialization)?;

        Ok(custody.spend_key)
    }

    /// Writes the validator definition template for a key that already
    /// exists.
    pub async fn init_validator_file(
        &self,
        cancel: &CancellationToken,
        key_name: &str,
    ) -> Result<(), Error> {
        let cmd = vec![
            "pcli".to_string(),
            "-d".to_string(),
            self.key_dir(key_name),
            "validator".to_string(),
            "definition".to_string(),
            "template".to_string(),
            "--file".to_string(),
            format!("{HOME_DIR}/{VALIDATOR_TEMPLATE_FILE}"),
        ];

        self.volume
            .exec(cancel, "init validator file", key_name, cmd)
            .await?;

        Ok(())
    }

    pub async fn validator_template(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ValidatorDefinition, Error> {
        let raw = self.volume.read_file(cancel, VALIDATOR_TEMPLATE_FILE).await?;
        let raw = String::from_utf8(raw).map_err(Error::serialization)?;

        toml::from_str(&raw).map_err(Error::serialization)
    }

    /// Display (bech32m) address of a key, as listed by the key tooling
    pub async fn resolve_address(
        &self,
        cancel: &CancellationToken,
        key_name: &str,
    ) -> Result<String, Error> {
        let cmd = vec![
            "pcli".to_string(),
            "-d".to_string(),
            HOME_DIR.to_string(),
            "addr".to_string(),
            "list".to_string(),
        ];

        let output = self.volume.exec(cancel, "list addresses", key_name, cmd).await?;
        let listing = output.stdout_lossy();

        parse_address_list(&listing, key_name)
            .map(str::to_string)
            .ok_or_else(|| Error::not_found("address", key_name))
    }

    /// Raw address bytes behind the display address of a key
    pub async fn address_bytes(
        &self,
        cancel: &CancellationToken,
        key_name: &str,
    ) -> Result<Vec<u8>, Error> {
        let display = self.resolve_address(cancel, key_name).await?;

        let (_, bytes) = bech32m::decode(&display).map_err(Error::serialization)?;

        Ok(bytes)
    }

    pub async fn key_material(
        &self,
        cancel: &CancellationToken,
        key_name: &str,
    ) -> Result<KeyMaterial, Error> {
        let address_bech32m = self.resolve_address(cancel, key_name).await?;
        let (_, address) = bech32m::decode(&address_bech32m).map_err(Error::serialization)?;
        let full_viewing_key = self.full_viewing_key(cancel, key_name).await?;

        Ok(KeyMaterial {
            name: key_name.to_string(),
            address,
            address_bech32m,
            full_viewing_key,
        })
    }

    /// Generates genesis from the given validators and allocations and
    /// returns the resulting document.
    ///
    /// Steps run in order and the first failure stops the rest.
    #[instrument(skip_all, fields(node = %self.name(), chain_id = %chain_id))]
    pub async fn install_genesis(
        &self,
        cancel: &CancellationToken,
        chain_id: &str,
        validators: &[ValidatorDefinition],
        allocations: &[AllocationRecord],
    ) -> Result<GenesisDocument, Error> {
        let name = self.name();

        self.volume
            .write_file(cancel, VALIDATORS_INPUT_FILE, &validators_json(validators)?)
            .await?;

        self.volume
            .write_file(cancel, ALLOCATIONS_INPUT_FILE, &allocations_csv(allocations)?)
            .await?;

        debug!(
            validators = validators.len(),
            allocations = allocations.len(),
            "genesis inputs written"
        );

        let cmd = vec![
            "pd".to_string(),
            "testnet".to_string(),
            "generate".to_string(),
            "--chain-id".to_string(),
            chain_id.to_string(),
            "--validators-input-file".to_string(),
            format!("{HOME_DIR}/{VALIDATORS_INPUT_FILE}"),
            "--allocations-input-file".to_string(),
            format!("{HOME_DIR}/{ALLOCATIONS_INPUT_FILE}"),
        ];

        self.volume
            .exec(cancel, "generate genesis", &name, cmd)
            .await?;

        let genesis = self.volume.read_file(cancel, GENESIS_FILE).await?;

        info!(bytes = genesis.len(), "genesis generated");

        Ok(GenesisDocument(genesis))
    }

    /// Installs a genesis produced elsewhere
    pub async fn write_genesis(
        &self,
        cancel: &CancellationToken,
        genesis: &GenesisDocument,
    ) -> Result<(), Error> {
        self.volume
            .write_file(cancel, GENESIS_FILE, genesis.as_bytes())
            .await
    }

    pub async fn create_container(
        &self,
        cancel: &CancellationToken,
        tendermint_addr: &str,
    ) -> Result<(), Error> {
        let cmd = vec![
            "pd".to_string(),
            "start".to_string(),
            "--abci-bind".to_string(),
            format!("0.0.0.0:{}", port_number(ABCI_PORT)),
            "--grpc-bind".to_string(),
            format!("0.0.0.0:{}", port_number(GRPC_PORT)),
            "--metrics-bind".to_string(),
            format!("0.0.0.0:{}", port_number(METRICS_PORT)),
            "--tendermint-addr".to_string(),
            format!("http://{tendermint_addr}"),
            "--home".to_string(),
            HOME_DIR.to_string(),
        ];

        let spec = ContainerSpec {
            name: self.name(),
            hostname: self.host_name(),
            image: self.volume.image().clone(),
            exposed_ports: EXPOSED_PORTS.to_vec(),
            binds: self.bind(),
            cmd,
            env: vec![],
        };

        self.container.create_container(cancel, spec).await
    }

    /// Starts the container and records where its RPC and gRPC ports landed
    /// on the host.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), Error> {
        self.container.start_container(cancel).await?;

        let ports = self
            .container
            .host_ports(cancel, &[RPC_PORT, GRPC_PORT])
            .await?;

        let mut ports = ports.into_iter();
        let name = self.name();

        // rpc is not among the exposed ports, so it may well be unpublished
        let rpc = ports.next().flatten();

        let grpc = ports
            .next()
            .flatten()
            .ok_or_else(|| Error::not_found("grpc host port", &name))?;

        debug!(?rpc, %grpc, "host ports resolved");

        *self
            .host_ports
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(HostPorts { rpc, grpc });

        Ok(())
    }

    pub fn host_ports(&self) -> Result<HostPorts, Error> {
        self.host_ports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::NotStarted(self.name()))
    }

    /// gRPC endpoint as seen from the host
    pub fn grpc_address(&self) -> Result<String, Error> {
        self.host_ports().map(|ports| format!("http://{}", ports.grpc))
    }

    /// gRPC endpoint as seen from other containers on the test network
    pub fn internal_grpc_address(&self) -> String {
        format!("http://{}:{}", self.host_name(), port_number(GRPC_PORT))
    }

    /// Stops the container; stopping twice is fine.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<(), Error> {
        self.container.stop_container(cancel).await
    }
}

fn node_name(identity: &NodeIdentity) -> String {
    format!(
        "pd-{}-{}-{}",
        identity.index, identity.chain_id, identity.test_name
    )
}
