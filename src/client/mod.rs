//! Wallet daemon node: holds a key's view and spend material and submits
//! transactions on its behalf.

use std::sync::{PoisonError, RwLock};

use futures_util::TryStreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use ixtest_core::{
    condense_host_name, port_number, with_cancel, AddressIndex, Amount, AssetId, BalanceRecord,
    BalancesRequest, ContainerPort, ContainerSpec, DenomMetadata, DockerImage, Ics20Withdrawal,
    LifecycleAdapter, NodeIdentity, PlannedOutput, PlannerRequest, QueryService,
    ServiceConnector, TransferOptions, Tx, Value, ViewService, WalletAmount, WalletId,
};

use crate::exec::{ContainerLifecycle, NodeVolume};
use crate::prelude::*;

pub mod pipeline;

pub const HOME_DIR: &str = "/home/pclientd";

pub const GRPC_PORT: ContainerPort = "8081/tcp";

const CONFIG_FILE: &str = "config.toml";

#[derive(Serialize)]
struct KmsConfig<'a> {
    spend_key: &'a str,
}

/// `config.toml` read by the daemon on start; tables go last
#[derive(Serialize)]
struct DaemonConfig<'a> {
    full_viewing_key: &'a str,
    grpc_url: &'a str,
    bind_addr: String,
    kms_config: KmsConfig<'a>,
}

pub struct ClientNode<A, C> {
    identity: NodeIdentity,
    key_name: String,
    volume: NodeVolume<A>,
    container: ContainerLifecycle<A>,
    connector: C,
    address: Vec<u8>,
    addr_string: String,
    endpoint: RwLock<Option<String>>,
}

impl<A, C> ClientNode<A, C>
where
    A: LifecycleAdapter,
    C: ServiceConnector,
{
    /// Creates the daemon's volume for `key_name`.
    ///
    /// `address` and `addr_string` are the key's raw and display addresses;
    /// the display address is required for cross-ledger transfers.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        cancel: &CancellationToken,
        adapter: A,
        connector: C,
        identity: NodeIdentity,
        key_name: impl Into<String>,
        image: DockerImage,
        address: Vec<u8>,
        addr_string: impl Into<String>,
    ) -> Result<Self, Error> {
        let key_name = key_name.into();
        let name = client_name(&identity, &key_name);

        let volume =
            NodeVolume::create(cancel, adapter.clone(), &identity, &name, image, HOME_DIR).await?;

        let container = ContainerLifecycle::new(adapter, &name);

        Ok(Self {
            identity,
            key_name,
            volume,
            container,
            connector,
            address,
            addr_string: addr_string.into(),
            endpoint: RwLock::new(None),
        })
    }

    /// Container name, `pclientd-{index}-{key}-{chain_id}-{test}`
    pub fn name(&self) -> String {
        client_name(&self.identity, &self.key_name)
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

    /// Raw address handed over at construction
    pub fn cached_address(&self) -> &[u8] {
        &self.address
    }

    /// Writes the daemon config pointing it at `pd_address` with the key's
    /// spend and view material.
    pub async fn initialize(
        &self,
        cancel: &CancellationToken,
        pd_address: &str,
        spend_key: &str,
        full_viewing_key: &str,
    ) -> Result<(), Error> {
        let config = DaemonConfig {
            full_viewing_key,
            grpc_url: pd_address,
            bind_addr: format!("0.0.0.0:{}", port_number(GRPC_PORT)),
            kms_config: KmsConfig { spend_key },
        };

        let rendered = toml::to_string(&config).map_err(Error::serialization)?;

        self.volume
            .write_file(cancel, CONFIG_FILE, rendered.as_bytes())
            .await
    }

    pub async fn create_container(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let spec = ContainerSpec {
            name: self.name(),
            hostname: self.host_name(),
            image: self.volume.image().clone(),
            exposed_ports: vec![GRPC_PORT],
            binds: self.bind(),
            cmd: vec![
                "pclientd".to_string(),
                "--home".to_string(),
                HOME_DIR.to_string(),
                "start".to_string(),
            ],
            env: vec!["RUST_LOG=debug".to_string()],
        };

        self.container.create_container(cancel, spec).await
    }

    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), Error> {
        self.container.start_container(cancel).await?;

        let endpoint = self
            .container
            .host_ports(cancel, &[GRPC_PORT])
            .await?
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| Error::not_found("grpc host port", self.name()))?;

        debug!(%endpoint, "wallet daemon reachable");

        *self.endpoint.write().unwrap_or_else(PoisonError::into_inner) = Some(endpoint);

        Ok(())
    }

    pub async fn stop(&self, cancel: &CancellationToken) -> Result<(), Error> {
        self.container.stop_container(cancel).await
    }

    /// Host address of the daemon's gRPC port
    pub fn endpoint(&self) -> Result<String, Error> {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::NotStarted(self.name()))
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<C::Channel, Error> {
        let endpoint = self.endpoint()?;

        with_cancel(cancel, "connect", self.connector.connect(&endpoint))
            .await?
            .map_err(Error::service("connect"))
    }

    /// Raw address of account 0, as reported by the daemon
    pub async fn address(&self, cancel: &CancellationToken) -> Result<Vec<u8>, Error> {
        let channel = self.connect(cancel).await?;

        let address = with_cancel(
            cancel,
            "address by index",
            channel.address_by_index(AddressIndex { account: 0 }),
        )
        .await?
        .map_err(Error::service("address by index"))?;

        Ok(address.inner)
    }

    /// Balance of `denom` held by account 0.
    ///
    /// The whole stream is drained before answering; the first record wins.
    #[instrument(skip(self, cancel), fields(client = %self.name()))]
    pub async fn balance(&self, cancel: &CancellationToken, denom: &str) -> Result<Amount, Error> {
        let channel = self.connect(cancel).await?;

        let request = BalancesRequest {
            account_filter: Some(AddressIndex { account: 0 }),
            asset_id_filter: Some(AssetId::from_denom(denom)),
        };

        let stream = with_cancel(cancel, "balances", channel.balances(request))
            .await?
            .map_err(Error::service("balances"))?;

        let records: Vec<BalanceRecord> = with_cancel(cancel, "balances", stream.try_collect())
            .await?
            .map_err(Error::service("balances"))?;

        let first = records
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("balance", denom))?;

        Ok(first.amount.into())
    }

    /// Transfers funds to an address on the same ledger
    #[instrument(skip_all, fields(client = %self.name(), denom = %amount.denom))]
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        amount: &WalletAmount,
    ) -> Result<(), Error> {
        let channel = self.connect(cancel).await?;

        let request = PlannerRequest {
            wallet_id: None,
            outputs: vec![PlannedOutput {
                value: Value {
                    amount: amount.amount.into(),
                    asset_id: AssetId::from_denom(&amount.denom),
                },
                address: amount.address.clone(),
            }],
            ics20_withdrawals: vec![],
        };

        let receipt = pipeline::execute(cancel, &channel, WalletId::default(), request).await?;

        info!(height = receipt.detection_height, "transfer landed");

        Ok(())
    }

    /// Sends funds out through `channel_id` and returns the landed
    /// transaction along with the packet it emitted.
    #[instrument(skip_all, fields(client = %self.name(), channel = channel_id))]
    pub async fn send_cross_ledger(
        &self,
        cancel: &CancellationToken,
        channel_id: &str,
        amount: &WalletAmount,
        options: &TransferOptions,
    ) -> Result<Tx, Error> {
        if self.addr_string.is_empty() {
            return Err(Error::not_found("return address", &self.key_name));
        }

        let channel = self.connect(cancel).await?;

        let (timeout_height, timeout_time) = options.resolve_timeouts();

        let withdrawal = Ics20Withdrawal {
            amount: amount.amount.into(),
            denom: amount.denom.clone(),
            destination_chain_address: amount.address.clone(),
            return_address: self.addr_string.clone(),
            timeout_height,
            timeout_time,
            source_channel: channel_id.to_string(),
        };

        let request = PlannerRequest {
            wallet_id: None,
            outputs: vec![],
            ics20_withdrawals: vec![withdrawal],
        };

        let receipt = pipeline::execute(cancel, &channel, WalletId::default(), request).await?;

        info!(
            height = receipt.detection_height,
            packets = receipt.packets.len(),
            "cross-ledger transfer landed"
        );

        Ok(Tx {
            height: receipt.detection_height,
            tx_hash: hex::encode(&receipt.id),
            gas_spent: 0,
            packet: receipt.packets.into_iter().next().unwrap_or_default(),
        })
    }

    /// Metadata of an asset known to the ledger, if any
    pub async fn denom_metadata(
        &self,
        cancel: &CancellationToken,
        asset_id: &AssetId,
    ) -> Result<Option<DenomMetadata>, Error> {
        let channel = self.connect(cancel).await?;

        with_cancel(
            cancel,
            "denom metadata",
            channel.denom_metadata_by_id(&self.identity.chain_id, asset_id),
        )
        .await?
        .map_err(Error::service("denom metadata"))
    }
}

fn client_name(identity: &NodeIdentity, key_name: &str) -> String {
    format!(
        "pclientd-{}-{}-{}-{}",
        identity.index, key_name, identity.chain_id, identity.test_name
    )
}
