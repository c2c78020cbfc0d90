use std::time::Duration;

use miette::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ixtest::core::config::RootConfig;
use ixtest::core::poll::{poll_for_ack, PollOptions};
use ixtest::core::{Amount, TransferOptions, WalletAmount};
use ixtest::emulator::{spawn_relayer, EmulatedConnector, Sandbox};
use ixtest::network::ChainNetwork;
use ixtest::prelude::*;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Amount to send, overrides the configured one
    #[arg(long)]
    amount: Option<u128>,

    /// Don't relay packets, so the acknowledgement never shows up
    #[arg(long)]
    no_relayer: bool,
}

#[tokio::main]
pub async fn run(mut config: RootConfig, args: &Args) -> miette::Result<()> {
    crate::common::setup_tracing(&config.logging)?;

    if let Some(amount) = args.amount {
        config.scenario.transfer_amount = Amount(amount);
    }

    if args.no_relayer {
        config.scenario.disable_relayer = true;
    }

    let (chain_a, chain_b) = crate::common::chain_pair(&config)?;

    let cancel = crate::common::hook_exit_token();
    let sandbox = Sandbox::new();
    let connector = EmulatedConnector::new();

    let mut networks = Vec::with_capacity(2);

    for chain in [chain_a, chain_b] {
        let phrase = format!("{} {} user", config.scenario.test_name, chain.chain_id);

        let network = ChainNetwork::launch(
            &cancel,
            &sandbox,
            &connector,
            chain,
            &config.scenario,
            &config.emulator,
            &phrase,
        )
        .await
        .with_context(|| format!("launching {}", chain.chain_id))?;

        networks.push(network);
    }

    let relayer_cancel = cancel.child_token();

    let relayer = (!config.scenario.disable_relayer).then(|| {
        spawn_relayer(
            networks[0].ledger.clone(),
            networks[1].ledger.clone(),
            config.emulator.relay_delay_blocks,
            Duration::from_millis(config.emulator.block_interval_ms),
            relayer_cancel.clone(),
        )
    });

    let outcome = transfer(&cancel, &config, &networks[0], &networks[1]).await;

    relayer_cancel.cancel();

    if let Some(relayer) = relayer {
        if let Err(err) = relayer.await {
            warn!(%err, "relayer ended abnormally");
        }
    }

    for network in networks {
        if let Err(err) = network.shutdown(&cancel).await {
            warn!(%err, "shutdown incomplete");
        }
    }

    cancel.cancel();

    outcome?;

    Ok(())
}

async fn transfer(
    cancel: &CancellationToken,
    config: &RootConfig,
    source: &ChainNetwork,
    destination: &ChainNetwork,
) -> Result<(), Error> {
    let amount = WalletAmount {
        address: destination.user_address.clone(),
        denom: source.denom.clone(),
        amount: config.scenario.transfer_amount,
    };

    let tx = source
        .client
        .send_cross_ledger(
            cancel,
            &config.scenario.channel,
            &amount,
            &TransferOptions::default(),
        )
        .await?;

    info!(
        hash = %tx.tx_hash,
        height = tx.height,
        sequence = tx.packet.sequence,
        "transfer sent"
    );

    // the acknowledgement is written back to the sending ledger once the
    // destination has received the packet
    let ack = poll_for_ack(
        cancel,
        &source.ledger,
        tx.height,
        tx.height.saturating_add(config.poll.ack_window),
        &tx.packet,
        &PollOptions::from(&config.poll),
    )
    .await?;

    info!(height = ack.height, "acknowledgement found");

    let voucher = format!(
        "{}/{}/{}",
        tx.packet.dest_port, tx.packet.dest_channel, source.denom
    );

    let received = destination.client.balance(cancel, &voucher).await?;

    info!(%voucher, %received, "destination balance");

    Ok(())
}
