use std::{fmt::Display, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Amount, Height};

/// Default relative timeout height for an ics-20 transfer, `revision-height`
pub const DEFAULT_RELATIVE_PACKET_TIMEOUT_HEIGHT: &str = "0-1000";

/// Default relative timeout for an ics-20 transfer
pub const DEFAULT_RELATIVE_PACKET_TIMEOUT: Duration = Duration::from_secs(600);

/// A cross-ledger packet.
///
/// Two packets are the same packet when every field matches; the poller relies
/// on this structural equality to find acknowledgements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Packet {
    pub sequence: u64,
    pub source_port: String,
    pub source_channel: String,
    pub dest_port: String,
    pub dest_channel: String,
    pub data: Vec<u8>,
    pub timeout_height: String,
    pub timeout_timestamp: u64,
}

/// Proof, written by the destination ledger, that a packet was processed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketAcknowledgement {
    pub packet: Packet,
    pub acknowledgement: Vec<u8>,
    pub height: Height,
}

/// Summary of a landed transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tx {
    pub height: Height,
    pub tx_hash: String,
    pub gas_spent: i64,
    pub packet: Packet,
}

/// An amount of a denom addressed to a wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAmount {
    pub address: String,
    pub denom: String,
    pub amount: Amount,
}

/// Caller supplied timeout for a cross-ledger transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IbcTimeout {
    pub nanoseconds: u64,
    pub height: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptions {
    pub timeout: Option<IbcTimeout>,
    pub memo: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutHeight {
    pub revision_number: u64,
    pub revision_height: u64,
}

impl Display for TimeoutHeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.revision_number, self.revision_height)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid timeout height {0:?}, expected `revision-height`")]
pub struct InvalidTimeoutHeight(String);

impl FromStr for TimeoutHeight {
    type Err = InvalidTimeoutHeight;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidTimeoutHeight(s.to_string());

        let (number, height) = s.split_once('-').ok_or_else(invalid)?;

        Ok(TimeoutHeight {
            revision_number: number.parse().map_err(|_| invalid())?,
            revision_height: height.parse().map_err(|_| invalid())?,
        })
    }
}

/// Relative timeouts defined by ics-20 for transfers that don't specify any
pub fn default_transfer_timeouts() -> (TimeoutHeight, u64) {
    let height = TimeoutHeight {
        revision_number: 0,
        revision_height: 1000,
    };

    (height, DEFAULT_RELATIVE_PACKET_TIMEOUT.as_nanos() as u64)
}

impl TransferOptions {
    /// Resolves the relative timeout height and timestamp for a transfer.
    ///
    /// A missing timeout, or one where both height and nanoseconds are zero,
    /// falls back to [`default_transfer_timeouts`]. Any other timeout is passed
    /// through as given, including one where only one of the two is set.
    pub fn resolve_timeouts(&self) -> (TimeoutHeight, u64) {
        match self.timeout {
            None => default_transfer_timeouts(),
            Some(IbcTimeout {
                nanoseconds: 0,
                height: 0,
            }) => default_transfer_timeouts(),
            Some(timeout) => (
                TimeoutHeight {
                    revision_number: 0,
                    revision_height: timeout.height,
                },
                timeout.nanoseconds,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_timeout(height: u64, nanoseconds: u64) -> TransferOptions {
        TransferOptions {
            timeout: Some(IbcTimeout {
                nanoseconds,
                height,
            }),
            memo: None,
        }
    }

    #[test]
    fn default_height_matches_ics20_constant() {
        let (height, _) = default_transfer_timeouts();
        let parsed: TimeoutHeight = DEFAULT_RELATIVE_PACKET_TIMEOUT_HEIGHT.parse().unwrap();

        assert_eq!(height, parsed);
        assert_eq!(height.to_string(), DEFAULT_RELATIVE_PACKET_TIMEOUT_HEIGHT);
    }

    #[test]
    fn missing_timeout_uses_defaults() {
        let options = TransferOptions::default();
        assert_eq!(options.resolve_timeouts(), default_transfer_timeouts());
    }

    #[test]
    fn zeroed_timeout_uses_defaults() {
        let options = with_timeout(0, 0);
        let (height, nanos) = options.resolve_timeouts();

        assert_eq!(height.revision_height, 1000);
        assert_eq!(nanos, 600_000_000_000);
    }

    #[test]
    fn partial_timeout_passes_through() {
        let (height, nanos) = with_timeout(5, 0).resolve_timeouts();
        assert_eq!(height.revision_height, 5);
        assert_eq!(nanos, 0);

        let (height, nanos) = with_timeout(0, 42).resolve_timeouts();
        assert_eq!(height.revision_height, 0);
        assert_eq!(nanos, 42);
    }

    #[test]
    fn full_timeout_passes_through() {
        let (height, nanos) = with_timeout(12, 3_000).resolve_timeouts();
        assert_eq!(
            height,
            TimeoutHeight {
                revision_number: 0,
                revision_height: 12
            }
        );
        assert_eq!(nanos, 3_000);
    }

    #[test]
    fn malformed_timeout_height_is_rejected() {
        assert!("1000".parse::<TimeoutHeight>().is_err());
        assert!("a-b".parse::<TimeoutHeight>().is_err());
    }
}
