//! Brings up one emulated chain: validator nodes sharing a genesis, the
//! ledger booted from it and a wallet daemon serving a funded user key.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use ixtest_core::config::{ChainConfig, EmulatorConfig, ScenarioConfig};
use ixtest_core::{port_number, DockerImage, NodeIdentity};
use ixtest_emulator::{EmulatedConnector, EmulatedLedger, EmulatedWallet, Sandbox};

use crate::client::ClientNode;
use crate::genesis::{AllocationRecord, GenesisAssembler};
use crate::node::{AppNode, RPC_PORT};
use crate::prelude::*;

pub const USER_KEY: &str = "user";

pub struct ChainNetwork {
    pub chain_id: String,
    pub denom: String,
    pub nodes: Vec<AppNode<Sandbox>>,
    pub client: ClientNode<Sandbox, EmulatedConnector>,
    pub ledger: EmulatedLedger,

    /// Display address of the funded user key
    pub user_address: String,

    producer: JoinHandle<()>,
    producer_cancel: CancellationToken,
}

impl ChainNetwork {
    #[instrument(skip_all, fields(chain_id = %chain.chain_id))]
    pub async fn launch(
        cancel: &CancellationToken,
        sandbox: &Sandbox,
        connector: &EmulatedConnector,
        chain: &ChainConfig,
        scenario: &ScenarioConfig,
        emulator: &EmulatorConfig,
        user_phrase: &str,
    ) -> Result<Self, Error> {
        let app_image = DockerImage::from(&chain.app_image);

        let mut nodes = Vec::with_capacity(chain.validators);

        for index in 0..chain.validators {
            let identity = NodeIdentity::new(index, &chain.chain_id, &scenario.test_name);
            nodes.push(AppNode::new(cancel, sandbox.clone(), identity, app_image.clone()).await?);
        }

        let first = nodes
            .first()
            .ok_or_else(|| Error::config("a chain needs at least one validator node"))?;

        first.recover_key(cancel, USER_KEY, user_phrase).await?;
        let user = first.key_material(cancel, USER_KEY).await?;
        let spend_key = first.spend_key(cancel, USER_KEY).await?;

        let assembler = GenesisAssembler::new(
            &chain.chain_id,
            &chain.denom,
            scenario.genesis_allocation,
        );

        let user_allocation = AllocationRecord {
            amount: scenario.genesis_allocation,
            denom: chain.denom.clone(),
            address: user.address_bech32m.clone(),
        };

        let genesis = assembler
            .assemble(cancel, &nodes, vec![user_allocation])
            .await?;

        let ledger = EmulatedLedger::from_genesis(genesis.as_bytes())?;

        let tendermint = format!("{}:{}", first.host_name(), port_number(RPC_PORT));

        for node in &nodes {
            node.create_container(cancel, &tendermint).await?;
            node.start(cancel).await?;
        }

        let producer_cancel = cancel.child_token();
        let producer = ledger.spawn_block_producer(
            Duration::from_millis(emulator.block_interval_ms),
            producer_cancel.clone(),
        );

        let client = ClientNode::new(
            cancel,
            sandbox.clone(),
            connector.clone(),
            NodeIdentity::new(0, &chain.chain_id, &scenario.test_name),
            USER_KEY,
            DockerImage::from(&chain.client_image),
            user.address.clone(),
            &user.address_bech32m,
        )
        .await?;

        client
            .initialize(
                cancel,
                &first.internal_grpc_address(),
                &spend_key,
                &user.full_viewing_key,
            )
            .await?;

        client.create_container(cancel).await?;
        client.start(cancel).await?;

        let wallet =
            EmulatedWallet::new(ledger.clone(), &spend_key).map_err(Error::service("open wallet"))?;
        connector.register(client.endpoint()?, wallet);

        info!(nodes = nodes.len(), user = %user.address_bech32m, "chain up");

        Ok(Self {
            chain_id: chain.chain_id.clone(),
            denom: chain.denom.clone(),
            nodes,
            client,
            ledger,
            user_address: user.address_bech32m,
            producer,
            producer_cancel,
        })
    }

    /// Stops the daemon, the nodes and block production.
    ///
    /// Every container is asked to stop even if an earlier one failed; the
    /// first failure is returned.
    pub async fn shutdown(self, cancel: &CancellationToken) -> Result<(), Error> {
        let mut first_err = None;

        if let Err(err) = self.client.stop(cancel).await {
            warn!(%err, "stopping wallet daemon failed");
            first_err.get_or_insert(err);
        }

        for node in &self.nodes {
            if let Err(err) = node.stop(cancel).await {
                warn!(%err, node = %node.name(), "stopping node failed");
                first_err.get_or_insert(err);
            }
        }

        self.producer_cancel.cancel();

        if let Err(err) = self.producer.await {
            warn!(%err, chain_id = %self.chain_id, "block producer ended abnormally");
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
