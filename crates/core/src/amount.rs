use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

/// An unsigned 128-bit token amount.
///
/// Remote services carry amounts as a pair of 64-bit words; the pair only
/// exists at that boundary (see [`WireAmount`]), everything else works on the
/// full-width value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(pub u128);

/// The `(hi, lo)` representation of an [`Amount`] used on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAmount {
    pub hi: u64,
    pub lo: u64,
}

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_parts(hi: u64, lo: u64) -> Self {
        Amount(((hi as u128) << 64) | lo as u128)
    }

    pub fn to_parts(self) -> (u64, u64) {
        ((self.0 >> 64) as u64, self.0 as u64)
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }
}

impl From<u128> for Amount {
    fn from(value: u128) -> Self {
        Amount(value)
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Amount(value as u128)
    }
}

impl From<Amount> for WireAmount {
    fn from(value: Amount) -> Self {
        let (hi, lo) = value.to_parts();
        WireAmount { hi, lo }
    }
}

impl From<WireAmount> for Amount {
    fn from(value: WireAmount) -> Self {
        Amount::from_parts(value.hi, value.lo)
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Amount {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u128>().map(Amount)
    }
}

// decimal string on the way out, string or u64 on the way in
impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
            Repr::Number(number) => Ok(Amount::from(number)),
        }
    }
}
