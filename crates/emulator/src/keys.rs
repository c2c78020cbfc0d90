//! Deterministic stand-ins for the key hierarchy of the emulated toolchain.
//!
//! Every key is a 32-byte seed. Spend keys, viewing keys, addresses and
//! validator keys are all derived from it, so the toolchain and the wallet
//! daemon agree on the same material without sharing state.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_128_with_seed;

use ixtest_core::bech32m;

pub const ADDRESS_HRP: &str = "penumbrav2t";
pub const SPEND_KEY_HRP: &str = "penumbraspendkey";
pub const FULL_VIEWING_KEY_HRP: &str = "penumbrafullviewingkey";
pub const IDENTITY_KEY_HRP: &str = "penumbravalid";
pub const GOVERNANCE_KEY_HRP: &str = "penumbragovern";

/// Length of a raw address
pub const ADDRESS_LEN: usize = 80;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("malformed key {0}")]
    Malformed(String),

    #[error("expected prefix {expected}, found {found}")]
    WrongPrefix { expected: &'static str, found: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeySeed(pub [u8; 32]);

impl KeySeed {
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Seed recovered from a seed phrase; words are normalized on whitespace
    pub fn from_phrase(phrase: &str) -> Self {
        let normalized = phrase.split_whitespace().collect::<Vec<_>>().join(" ");

        let mut seed = [0u8; 32];
        seed[..16].copy_from_slice(&xxh3_128_with_seed(normalized.as_bytes(), 0).to_be_bytes());
        seed[16..].copy_from_slice(&xxh3_128_with_seed(normalized.as_bytes(), 1).to_be_bytes());

        Self(seed)
    }

    /// Expands the seed into `len` bytes bound to `domain`
    pub fn derive(&self, domain: &str, len: usize) -> Vec<u8> {
        let mut input = self.0.to_vec();
        input.extend_from_slice(domain.as_bytes());

        let mut out = Vec::with_capacity(len + 16);
        let mut counter = 0u64;

        while out.len() < len {
            out.extend_from_slice(&xxh3_128_with_seed(&input, counter).to_be_bytes());
            counter += 1;
        }

        out.truncate(len);
        out
    }

    pub fn spend_key(&self) -> String {
        encode(SPEND_KEY_HRP, &self.0)
    }

    pub fn full_viewing_key(&self) -> String {
        encode(FULL_VIEWING_KEY_HRP, &self.derive("fvk", 64))
    }

    pub fn address_bytes(&self) -> Vec<u8> {
        self.derive("address-0", ADDRESS_LEN)
    }

    pub fn address(&self) -> String {
        encode(ADDRESS_HRP, &self.address_bytes())
    }

    pub fn identity_key(&self) -> String {
        encode(IDENTITY_KEY_HRP, &self.derive("identity", 32))
    }

    pub fn governance_key(&self) -> String {
        encode(GOVERNANCE_KEY_HRP, &self.derive("governance", 32))
    }

    pub fn consensus_key(&self) -> String {
        hex::encode(self.derive("consensus", 32))
    }

    pub fn parse_spend_key(value: &str) -> Result<Self, KeyError> {
        let bytes = decode(SPEND_KEY_HRP, value)?;

        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::Malformed(value.to_string()))?;

        Ok(Self(seed))
    }
}

/// Contents of a key directory's `custody.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyFile {
    pub spend_key: String,
}

fn encode(hrp: &str, data: &[u8]) -> String {
    // every prefix above is a valid hrp and every payload fits the code length
    bech32m::encode(hrp, data).unwrap_or_default()
}

fn decode(expected: &'static str, value: &str) -> Result<Vec<u8>, KeyError> {
    let (hrp, data) =
        bech32m::decode(value).map_err(|_| KeyError::Malformed(value.to_string()))?;

    if hrp != expected {
        return Err(KeyError::WrongPrefix {
            expected,
            found: hrp,
        });
    }

    Ok(data)
}
