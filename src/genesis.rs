//! Genesis inputs for a ledger and the assembly of a multi-validator genesis.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use ixtest_core::{Amount, LifecycleAdapter};

use crate::node::AppNode;
use crate::prelude::*;

/// Key name under which each node keeps its validator key
pub const VALIDATOR_KEY: &str = "validator";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusKey {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingStream {
    pub recipient: String,
    pub rate_bps: u32,
}

/// A validator as listed in `validators.json`.
///
/// The template emitted by the key tooling spells the stream list
/// `funding_stream`; both spellings are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorDefinition {
    pub identity_key: String,
    pub governance_key: String,
    pub consensus_key: ConsensusKey,
    pub name: String,

    #[serde(default)]
    pub website: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub enabled: bool,

    #[serde(default, alias = "funding_stream")]
    pub funding_streams: Vec<FundingStream>,

    #[serde(default)]
    pub sequence_number: u32,
}

/// One row of `allocations.csv`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub amount: Amount,
    pub denom: String,
    pub address: String,
}

/// Genesis file produced by the ledger tooling; carried around untouched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenesisDocument(pub Vec<u8>);

impl GenesisDocument {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

pub fn validators_json(validators: &[ValidatorDefinition]) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(validators).map_err(Error::serialization)
}

/// Renders allocations as CSV with every field quoted
pub fn allocations_csv(allocations: &[AllocationRecord]) -> Result<Vec<u8>, Error> {
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Always)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(vec![]);

    // an empty slice still gets its header
    if allocations.is_empty() {
        writer
            .write_record(["amount", "denom", "address"])
            .map_err(Error::serialization)?;
    }

    for allocation in allocations {
        writer.serialize(allocation).map_err(Error::serialization)?;
    }

    writer.into_inner().map_err(Error::serialization)
}

/// Brings a set of validator nodes to a shared genesis
pub struct GenesisAssembler {
    pub chain_id: String,
    pub denom: String,

    /// Funds granted to each validator's own address
    pub validator_allocation: Amount,
}

impl GenesisAssembler {
    pub fn new(
        chain_id: impl Into<String>,
        denom: impl Into<String>,
        validator_allocation: Amount,
    ) -> Self {
        Self {
            chain_id: chain_id.into(),
            denom: denom.into(),
            validator_allocation,
        }
    }

    /// Gives every node a validator key, generates genesis on the first node
    /// and copies the result to the others.
    ///
    /// `extra_allocations` are added after the per-validator ones.
    #[instrument(skip_all, fields(chain_id = %self.chain_id, nodes = nodes.len()))]
    pub async fn assemble<A>(
        &self,
        cancel: &CancellationToken,
        nodes: &[AppNode<A>],
        extra_allocations: Vec<AllocationRecord>,
    ) -> Result<GenesisDocument, Error>
    where
        A: LifecycleAdapter,
    {
        let Some((first, rest)) = nodes.split_first() else {
            return Err(Error::config("genesis needs at least one validator node"));
        };

        let mut validators = Vec::with_capacity(nodes.len());
        let mut allocations = Vec::with_capacity(nodes.len() + extra_allocations.len());

        for (i, node) in nodes.iter().enumerate() {
            node.create_key(cancel, VALIDATOR_KEY).await?;
            node.init_validator_file(cancel, VALIDATOR_KEY).await?;

            let mut definition = node.validator_template(cancel).await?;
            definition.name = format!("validator-{i}");
            definition.enabled = true;
            validators.push(definition);

            let address = node.resolve_address(cancel, VALIDATOR_KEY).await?;

            allocations.push(AllocationRecord {
                amount: self.validator_allocation,
                denom: self.denom.clone(),
                address,
            });
        }

        allocations.extend(extra_allocations);

        let genesis = first
            .install_genesis(cancel, &self.chain_id, &validators, &allocations)
            .await?;

        for node in rest {
            node.write_genesis(cancel, &genesis).await?;
        }

        info!(bytes = genesis.0.len(), "genesis assembled");

        Ok(genesis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> ValidatorDefinition {
        ValidatorDefinition {
            identity_key: "penumbravalid1abc".into(),
            governance_key: "penumbragovern1abc".into(),
            consensus_key: ConsensusKey {
                kind: "tendermint/PubKeyEd25519".into(),
                value: "Zm9v".into(),
            },
            name: "validator-0".into(),
            website: String::new(),
            description: String::new(),
            enabled: true,
            funding_streams: vec![FundingStream {
                recipient: "penumbrav2t1xyz".into(),
                rate_bps: 100,
            }],
            sequence_number: 0,
        }
    }

    #[test]
    fn allocations_are_fully_quoted() {
        let rows = vec![
            AllocationRecord {
                amount: Amount(1_000_000),
                denom: "upenumbra".into(),
                address: "penumbrav2t1aaa".into(),
            },
            AllocationRecord {
                amount: Amount(u128::MAX),
                denom: "gm".into(),
                address: "penumbrav2t1bbb".into(),
            },
        ];

        let csv = String::from_utf8(allocations_csv(&rows).unwrap()).unwrap();

        assert_eq!(
            csv,
            format!(
                "\"amount\",\"denom\",\"address\"\n\
                 \"1000000\",\"upenumbra\",\"penumbrav2t1aaa\"\n\
                 \"{}\",\"gm\",\"penumbrav2t1bbb\"\n",
                u128::MAX
            )
        );
    }

    #[test]
    fn empty_allocations_keep_header() {
        let csv = allocations_csv(&[]).unwrap();
        assert_eq!(csv, b"\"amount\",\"denom\",\"address\"\n");
    }

    #[test]
    fn validators_serialize_with_type_tag() {
        let json = validators_json(&[validator()]).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();

        assert_eq!(value[0]["consensus_key"]["type"], "tendermint/PubKeyEd25519");
        assert_eq!(value[0]["funding_streams"][0]["rate_bps"], 100);
        assert_eq!(value[0]["enabled"], true);
    }

    #[test]
    fn template_spelling_is_accepted() {
        let template = r#"
            sequence_number = 0
            enabled = false
            name = ""
            website = ""
            description = ""
            identity_key = "penumbravalid1abc"
            governance_key = "penumbragovern1abc"

            [consensus_key]
            type = "tendermint/PubKeyEd25519"
            value = "Zm9v"

            [[funding_stream]]
            recipient = "penumbrav2t1xyz"
            rate_bps = 100
        "#;

        let parsed: ValidatorDefinition = toml::from_str(template).unwrap();

        assert_eq!(parsed.funding_streams.len(), 1);
        assert_eq!(parsed.consensus_key.kind, "tendermint/PubKeyEd25519");
        assert!(!parsed.enabled);
    }
}
