use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::{filter::Targets, prelude::*};

use ixtest::core::config::{ChainConfig, LoggingConfig, RootConfig};
use ixtest::prelude::*;

pub fn load_config(explicit_file: &Option<PathBuf>) -> Result<RootConfig, config::ConfigError> {
    let mut s = config::Config::builder();

    // the two emulated chains and the poll window ship as defaults
    s = s.add_source(config::Config::try_from(&RootConfig::default())?);

    s = s.add_source(config::File::with_name("/etc/ixtest/ixtest.toml").required(false));
    s = s.add_source(config::File::with_name("ixtest.toml").required(false));

    if let Some(explicit) = explicit_file.as_ref().and_then(|x| x.to_str()) {
        s = s.add_source(config::File::with_name(explicit).required(true));
    }

    // e.g. IXTEST_POLL_ACK_WINDOW=40
    s = s.add_source(config::Environment::with_prefix("IXTEST").separator("_"));

    s.build()?.try_deserialize()
}

/// The source and destination chains of a two-ledger scenario
pub fn chain_pair(config: &RootConfig) -> Result<(&ChainConfig, &ChainConfig), Error> {
    let [source, destination] = config.chains.as_slice() else {
        return Err(Error::config(format!(
            "a scenario needs exactly two chains, {} configured",
            config.chains.len()
        )));
    };

    if source.chain_id == destination.chain_id {
        return Err(Error::config(format!(
            "both chains are named {}",
            source.chain_id
        )));
    }

    if config.poll.ack_window == 0 {
        return Err(Error::config("poll.ack_window must be at least one block"));
    }

    Ok((source, destination))
}

pub fn setup_tracing(config: &LoggingConfig) -> miette::Result<()> {
    let level = config.max_level;

    let mut filter = Targets::new()
        .with_target("ixtest", level)
        .with_target("ixtest_core", level);

    if config.include_emulator {
        filter = filter.with_target("ixtest_emulator", level);
    }

    if config.include_tokio {
        filter = filter.with_target("tokio", level);
    }

    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .finish()
        .with(filter)
        .init();

    Ok(())
}

pub fn hook_exit_token() -> CancellationToken {
    let cancel = CancellationToken::new();

    let cancel2 = cancel.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "can't listen for exit signal");
            return;
        }

        warn!("exit signal detected, stopping the scenario");
        debug!("notifying exit");
        cancel2.cancel();
    });

    cancel
}
