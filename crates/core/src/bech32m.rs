//! Bech32m strings past the 90 characters BIP-350 allows, as used for
//! addresses and keys on the ledgers under test.

use bech32::primitives::decode::CheckedHrpstring;
use bech32::{Checksum, Hrp};
use thiserror::Error;

/// The bech32m checksum with a code length long enough for 80-byte addresses
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Bech32mLong {}

impl Checksum for Bech32mLong {
    type MidstateRepr = u32;
    const CODE_LENGTH: usize = 1023;
    const CHECKSUM_LENGTH: usize = 6;
    const GENERATOR_SH: [u32; 5] = [
        0x3b6a57b2, 0x26508e6d, 0x1ea119fa, 0x3d4233dd, 0x2a1462b3,
    ];
    const TARGET_RESIDUE: u32 = 0x2bc830a3;
}

#[derive(Debug, Error)]
pub enum Bech32mError {
    #[error("invalid prefix {0:?}")]
    Prefix(String),

    #[error("can't encode: {0}")]
    Encode(String),

    #[error("can't decode {value:?}: {reason}")]
    Decode { value: String, reason: String },
}

pub fn encode(prefix: &str, data: &[u8]) -> Result<String, Bech32mError> {
    let hrp = Hrp::parse(prefix).map_err(|_| Bech32mError::Prefix(prefix.to_string()))?;

    bech32::encode::<Bech32mLong>(hrp, data).map_err(|e| Bech32mError::Encode(e.to_string()))
}

/// Splits a string into its prefix and payload bytes
pub fn decode(value: &str) -> Result<(String, Vec<u8>), Bech32mError> {
    let checked =
        CheckedHrpstring::new::<Bech32mLong>(value).map_err(|e| Bech32mError::Decode {
            value: value.to_string(),
            reason: e.to_string(),
        })?;

    Ok((checked.hrp().to_string(), checked.byte_iter().collect()))
}
