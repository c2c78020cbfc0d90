//! Interpreter for the `pcli` and `pd` invocations a node runs as one-shot
//! jobs. Commands operate on the files of the volume mounted into the job.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ixtest_core::{Amount, ExecOutput};

use crate::keys::{CustodyFile, KeySeed};

pub const ALREADY_EXISTS: &str = "already exists, refusing to overwrite it";

/// Location of the generated genesis, relative to the job's home directory
pub const GENESIS_PATH: &str = ".penumbra/testnet_data/node0/tendermint/config/genesis.json";

const CUSTODY_FILE: &str = "custody.json";

/// Genesis written by `pd testnet generate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisFile {
    pub chain_id: String,
    pub initial_height: String,
    pub app_state: GenesisAppState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisAppState {
    pub validators: Vec<serde_json::Value>,
    pub allocations: Vec<GenesisAllocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAllocation {
    pub amount: Amount,
    pub denom: String,
    pub address: String,
}

#[derive(Deserialize)]
struct AllocationRow {
    amount: String,
    denom: String,
    address: String,
}

#[derive(Serialize)]
struct ConsensusKeyTemplate {
    #[serde(rename = "type")]
    kind: String,
    value: String,
}

#[derive(Serialize)]
struct FundingStreamTemplate {
    recipient: String,
    rate_bps: u32,
}

#[derive(Serialize)]
struct ValidatorTemplate {
    sequence_number: u32,
    enabled: bool,
    name: String,
    website: String,
    description: String,
    identity_key: String,
    governance_key: String,
    consensus_key: ConsensusKeyTemplate,
    funding_stream: Vec<FundingStreamTemplate>,
}

/// The files of one volume as seen from inside a job
pub(crate) struct Mount<'a> {
    pub root: &'a str,
    pub files: &'a mut BTreeMap<String, Vec<u8>>,
}

impl Mount<'_> {
    /// Maps an absolute path inside the job to a path relative to the volume
    fn relative(&self, path: &str) -> Result<String, String> {
        let stripped = path
            .strip_prefix(self.root)
            .ok_or_else(|| format!("{path} is outside of {}", self.root))?;

        Ok(stripped.trim_start_matches('/').to_string())
    }

    fn read(&self, path: &str) -> Result<&[u8], String> {
        let rel = self.relative(path)?;

        self.files
            .get(&rel)
            .map(Vec::as_slice)
            .ok_or_else(|| format!("{path}: no such file or directory"))
    }

    fn write(&mut self, path: &str, content: Vec<u8>) -> Result<(), String> {
        let rel = self.relative(path)?;
        self.files.insert(rel, content);
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.relative(path)
            .map(|rel| self.files.contains_key(&rel))
            .unwrap_or(false)
    }
}

type Outcome = Result<String, String>;

fn into_output(outcome: Outcome) -> ExecOutput {
    match outcome {
        Ok(stdout) => ExecOutput {
            stdout: stdout.into_bytes(),
            stderr: vec![],
            exit_code: 0,
        },
        Err(stderr) => ExecOutput {
            stdout: vec![],
            stderr: format!("Error: {stderr}\n").into_bytes(),
            exit_code: 1,
        },
    }
}

pub(crate) fn run(cmd: &[String], mount: &mut Mount) -> ExecOutput {
    debug!(?cmd, root = mount.root, "interpreting job");

    let Some((program, args)) = cmd.split_first() else {
        return into_output(Err("empty command".into()));
    };

    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match program.as_str() {
        "pcli" => into_output(pcli(&args, mount)),
        "pd" => into_output(pd(&args, mount)),
        other => {
            warn!(program = other, "unknown program");

            ExecOutput {
                stdout: vec![],
                stderr: format!("{other}: command not found\n").into_bytes(),
                exit_code: 127,
            }
        }
    }
}

fn pcli(args: &[&str], mount: &mut Mount) -> Outcome {
    let mut home = None;
    let mut rest = vec![];
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match *arg {
            "-d" | "--home" => home = iter.next().copied(),
            "-n" | "--node" => {
                iter.next();
            }
            other => rest.push(other),
        }
    }

    let home = home.ok_or("missing -d <home>")?;

    match rest.as_slice() {
        ["keys", "generate"] => create_custody(mount, home, KeySeed::random()),
        ["keys", "import", "phrase", phrase @ ..] if !phrase.is_empty() => {
            create_custody(mount, home, KeySeed::from_phrase(&phrase.join(" ")))
        }
        ["keys", "export", "full-viewing-key"] => {
            let seed = load_seed(mount, home)?;
            Ok(format!("{}\n", seed.full_viewing_key()))
        }
        ["addr", "list"] => list_addresses(mount, home),
        ["validator", "definition", "template", "--file", file] => {
            write_template(mount, home, file)
        }
        other => Err(format!("unrecognized pcli command {other:?}")),
    }
}

fn custody_path(home: &str) -> String {
    format!("{}/{CUSTODY_FILE}", home.trim_end_matches('/'))
}

fn create_custody(mount: &mut Mount, home: &str, seed: KeySeed) -> Outcome {
    let path = custody_path(home);

    if mount.exists(&path) {
        return Err(format!("{path} {ALREADY_EXISTS}"));
    }

    let custody = CustodyFile {
        spend_key: seed.spend_key(),
    };

    let content = serde_json::to_vec_pretty(&custody).map_err(|e| e.to_string())?;
    mount.write(&path, content)?;

    Ok(format!("key written to {path}\n"))
}

fn load_seed(mount: &Mount, home: &str) -> Result<KeySeed, String> {
    let raw = mount.read(&custody_path(home))?;
    let custody: CustodyFile = serde_json::from_slice(raw).map_err(|e| e.to_string())?;

    KeySeed::parse_spend_key(&custody.spend_key).map_err(|e| e.to_string())
}

/// Lists every key stored under `{home}/keys`
fn list_addresses(mount: &Mount, home: &str) -> Outcome {
    let prefix = format!("{}/keys/", mount.relative(home)?.trim_end_matches('/'));
    let prefix = prefix.trim_start_matches('/');

    let mut out = String::from(" Index  Label  Address\n");

    let names = mount.files.keys().filter_map(|path| {
        path.strip_prefix(prefix)?
            .strip_suffix(CUSTODY_FILE)?
            .strip_suffix('/')
            .filter(|name| !name.contains('/'))
    });

    for (index, name) in names.enumerate() {
        let seed = load_seed(mount, &format!("{home}/keys/{name}"))?;
        out.push_str(&format!(" {index}  {name}  {}\n", seed.address()));
    }

    Ok(out)
}

fn write_template(mount: &mut Mount, home: &str, file: &str) -> Outcome {
    let seed = load_seed(mount, home)?;

    let template = ValidatorTemplate {
        sequence_number: 0,
        enabled: false,
        name: String::new(),
        website: String::new(),
        description: String::new(),
        identity_key: seed.identity_key(),
        governance_key: seed.governance_key(),
        consensus_key: ConsensusKeyTemplate {
            kind: "tendermint/PubKeyEd25519".to_string(),
            value: seed.consensus_key(),
        },
        funding_stream: vec![FundingStreamTemplate {
            recipient: seed.address(),
            rate_bps: 100,
        }],
    };

    let rendered = toml::to_string(&template).map_err(|e| e.to_string())?;
    mount.write(file, rendered.into_bytes())?;

    Ok(String::new())
}

fn pd(args: &[&str], mount: &mut Mount) -> Outcome {
    match args {
        ["testnet", "generate", flags @ ..] => generate_genesis(flags, mount),
        ["start", ..] => Ok(String::new()),
        other => Err(format!("unrecognized pd command {other:?}")),
    }
}

fn flag<'a>(flags: &[&'a str], name: &str) -> Result<&'a str, String> {
    flags
        .iter()
        .position(|x| *x == name)
        .and_then(|i| flags.get(i + 1))
        .copied()
        .ok_or_else(|| format!("missing {name}"))
}

fn generate_genesis(flags: &[&str], mount: &mut Mount) -> Outcome {
    let chain_id = flag(flags, "--chain-id")?;
    let validators_path = flag(flags, "--validators-input-file")?;
    let allocations_path = flag(flags, "--allocations-input-file")?;

    let validators: Vec<serde_json::Value> =
        serde_json::from_slice(mount.read(validators_path)?).map_err(|e| e.to_string())?;

    if validators.is_empty() {
        return Err("at least one validator is required".into());
    }

    let rows = {
        let mut reader = csv::Reader::from_reader(mount.read(allocations_path)?);

        reader
            .deserialize::<AllocationRow>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid allocations: {e}"))?
    };

    let allocations = rows
        .into_iter()
        .map(|row| {
            let amount = row
                .amount
                .parse()
                .map_err(|_| format!("invalid amount {:?}", row.amount))?;

            Ok(GenesisAllocation {
                amount,
                denom: row.denom,
                address: row.address,
            })
        })
        .collect::<Result<Vec<_>, String>>()?;

    let genesis = GenesisFile {
        chain_id: chain_id.to_string(),
        initial_height: "0".to_string(),
        app_state: GenesisAppState {
            validators,
            allocations,
        },
    };

    let content = serde_json::to_vec_pretty(&genesis).map_err(|e| e.to_string())?;
    let target = format!("{}/{GENESIS_PATH}", mount.root);
    mount.write(&target, content)?;

    Ok(format!("testnet config written for {chain_id}\n"))
}
