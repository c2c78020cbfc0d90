use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

use crate::Amount;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ImageConfig {
    pub repository: String,
    pub version: String,

    #[serde(default = "default_uid_gid")]
    pub uid_gid: String,
}

fn default_uid_gid() -> String {
    "1025:1025".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChainConfig {
    pub chain_id: String,

    #[serde(default = "default_denom")]
    pub denom: String,

    /// Number of validator nodes to bring up
    #[serde(default = "default_validators")]
    pub validators: usize,

    pub app_image: ImageConfig,
    pub client_image: ImageConfig,
}

fn default_denom() -> String {
    "upenumbra".to_string()
}

fn default_validators() -> usize {
    1
}

impl ChainConfig {
    pub fn with_chain_id(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            denom: default_denom(),
            validators: default_validators(),
            app_image: ImageConfig {
                repository: "ghcr.io/strangelove-ventures/heighliner/penumbra".to_string(),
                version: "latest".to_string(),
                uid_gid: default_uid_gid(),
            },
            client_image: ImageConfig {
                repository: "ghcr.io/strangelove-ventures/heighliner/pclientd".to_string(),
                version: "latest".to_string(),
                uid_gid: default_uid_gid(),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,

    /// Blocks past the send height within which an acknowledgement must show up
    #[serde(default = "default_ack_window")]
    pub ack_window: u64,
}

fn default_poll_interval() -> u64 {
    100
}

fn default_ack_window() -> u64 {
    20
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            ack_window: default_ack_window(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EmulatorConfig {
    pub block_interval_ms: u64,

    /// Blocks between a packet leaving its ledger and the relayer delivering it
    #[serde(default)]
    pub relay_delay_blocks: u64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            block_interval_ms: 50,
            relay_delay_blocks: 1,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ScenarioConfig {
    pub test_name: String,
    pub channel: String,
    pub transfer_amount: Amount,
    pub genesis_allocation: Amount,

    /// Skip the relayer so the acknowledgement never shows up
    #[serde(default)]
    pub disable_relayer: bool,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            test_name: "simulate".to_string(),
            channel: "channel-0".to_string(),
            transfer_amount: Amount(100),
            genesis_allocation: Amount(1_000_000),
            disable_relayer: false,
        }
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    #[serde_as(as = "DisplayFromStr")]
    pub max_level: tracing::Level,

    #[serde(default)]
    pub include_tokio: bool,

    #[serde(default)]
    pub include_emulator: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_level: tracing::Level::INFO,
            include_tokio: Default::default(),
            include_emulator: Default::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RootConfig {
    pub chains: Vec<ChainConfig>,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub emulator: EmulatorConfig,

    #[serde(default)]
    pub scenario: ScenarioConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            chains: vec![
                ChainConfig::with_chain_id("ixtest-a"),
                ChainConfig::with_chain_id("ixtest-b"),
            ],
            poll: Default::default(),
            emulator: Default::default(),
            scenario: Default::default(),
            logging: Default::default(),
        }
    }
}
