//! Bounded polling of a ledger for cross-ledger acknowledgements.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::{
    sleep_or_cancel, with_cancel, Cancelled, ChainAcker, ChainHeighter, Height, LedgerError,
    Packet, PacketAcknowledgement,
};

#[derive(Debug, Error)]
pub enum PollError {
    #[error("acknowledgement not found")]
    NotFound,

    #[error("reading ledger height: {0}")]
    Height(#[source] LedgerError),

    #[error("reading acknowledgements at height {height}: {source}")]
    Fetch {
        height: Height,
        #[source]
        source: LedgerError,
    },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

#[derive(Debug, Clone)]
pub struct PollOptions {
    /// Pause before re-reading the height while the ledger is behind the cursor
    pub interval: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
        }
    }
}

impl From<&crate::config::PollConfig> for PollOptions {
    fn from(value: &crate::config::PollConfig) -> Self {
        Self {
            interval: Duration::from_millis(value.interval_ms),
        }
    }
}

/// Looks for the acknowledgement of `packet` between `start_height` and
/// `max_height`, both inclusive.
///
/// Heights the ledger hasn't produced yet are waited for, so it is safe to
/// poll a range that lies in the future. A failed height read aborts the poll.
/// A failed acknowledgement lookup only skips that height; if nothing is found
/// the last such failure is returned instead of [`PollError::NotFound`].
/// The first matching acknowledgement in ledger order wins.
///
/// # Panics
///
/// Panics if `max_height < start_height`.
#[instrument(skip(cancel, chain, packet, options), fields(packet.sequence = packet.sequence))]
pub async fn poll_for_ack<C>(
    cancel: &CancellationToken,
    chain: &C,
    start_height: Height,
    max_height: Height,
    packet: &Packet,
    options: &PollOptions,
) -> Result<PacketAcknowledgement, PollError>
where
    C: ChainAcker + Sync,
{
    assert!(
        max_height >= start_height,
        "max_height must be greater than or equal to start_height"
    );

    let mut cursor = start_height;
    let mut last_err = None;

    while cursor <= max_height {
        if cancel.is_cancelled() {
            return Err(Cancelled("poll for ack").into());
        }

        let current = with_cancel(cancel, "poll for ack", chain.height())
            .await?
            .map_err(PollError::Height)?;

        if cursor > current {
            trace!(cursor, current, "ledger behind cursor, waiting");
            sleep_or_cancel(cancel, "poll for ack", options.interval).await?;
            continue;
        }

        let lookup = with_cancel(cancel, "poll for ack", chain.acknowledgements(cursor)).await?;

        let acks = match lookup {
            Ok(acks) => acks,
            Err(source) => {
                warn!(height = cursor, %source, "acknowledgement lookup failed, skipping height");
                last_err = Some(PollError::Fetch {
                    height: cursor,
                    source,
                });

                match cursor.checked_add(1) {
                    Some(next) => cursor = next,
                    None => break,
                }

                continue;
            }
        };

        if let Some(ack) = acks.into_iter().find(|ack| ack.packet == *packet) {
            debug!(height = cursor, "acknowledgement found");
            return Ok(ack);
        }

        match cursor.checked_add(1) {
            Some(next) => cursor = next,
            None => break,
        }
    }

    Err(last_err.unwrap_or(PollError::NotFound))
}

/// Waits until the ledger reaches `target` height and returns the height seen
#[instrument(skip(cancel, chain, options))]
pub async fn wait_for_height<C>(
    cancel: &CancellationToken,
    chain: &C,
    target: Height,
    options: &PollOptions,
) -> Result<Height, PollError>
where
    C: ChainHeighter + Sync,
{
    loop {
        let current = with_cancel(cancel, "wait for height", chain.height())
            .await?
            .map_err(PollError::Height)?;

        if current >= target {
            return Ok(current);
        }

        sleep_or_cancel(cancel, "wait for height", options.interval).await?;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Ledger whose height grows by one on every read, up to `tip`
    struct ScriptedLedger {
        height: AtomicU64,
        tip: Height,
        acks: BTreeMap<Height, Vec<PacketAcknowledgement>>,
        failing: HashSet<Height>,
        fail_height_read: bool,
        fetched: Mutex<Vec<Height>>,
    }

    impl ScriptedLedger {
        fn new(start: Height, tip: Height) -> Self {
            Self {
                height: AtomicU64::new(start),
                tip,
                acks: BTreeMap::new(),
                failing: HashSet::new(),
                fail_height_read: false,
                fetched: Mutex::new(vec![]),
            }
        }

        fn with_ack(mut self, height: Height, packet: Packet, payload: &[u8]) -> Self {
            self.acks.entry(height).or_default().push(PacketAcknowledgement {
                packet,
                acknowledgement: payload.to_vec(),
                height,
            });
            self
        }

        fn failing_at(mut self, height: Height) -> Self {
            self.failing.insert(height);
            self
        }
    }

    impl ChainHeighter for ScriptedLedger {
        async fn height(&self) -> Result<Height, LedgerError> {
            if self.fail_height_read {
                return Err(LedgerError::Unavailable("rpc down".into()));
            }

            let current = self.height.load(Ordering::SeqCst);
            if current < self.tip {
                self.height.store(current + 1, Ordering::SeqCst);
            }
            Ok(current)
        }
    }

    impl ChainAcker for ScriptedLedger {
        async fn acknowledgements(
            &self,
            height: Height,
        ) -> Result<Vec<PacketAcknowledgement>, LedgerError> {
            self.fetched.lock().unwrap().push(height);

            if self.failing.contains(&height) {
                return Err(LedgerError::MissingBlock(height));
            }

            Ok(self.acks.get(&height).cloned().unwrap_or_default())
        }
    }

    fn packet(sequence: u64) -> Packet {
        Packet {
            sequence,
            source_port: "transfer".into(),
            source_channel: "channel-0".into(),
            dest_port: "transfer".into(),
            dest_channel: "channel-0".into(),
            data: b"{\"amount\":\"100\"}".to_vec(),
            timeout_height: "0-1000".into(),
            timeout_timestamp: 0,
        }
    }

    fn fast() -> PollOptions {
        PollOptions {
            interval: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn finds_ack_in_range() {
        let chain = ScriptedLedger::new(10, 40).with_ack(15, packet(1), b"ok");
        let cancel = CancellationToken::new();

        let ack = poll_for_ack(&cancel, &chain, 10, 30, &packet(1), &fast())
            .await
            .unwrap();

        assert_eq!(ack.height, 15);
        assert_eq!(ack.acknowledgement, b"ok");
    }

    #[tokio::test]
    async fn waits_for_ledger_to_reach_start() {
        // ledger starts below the window and catches up while polling
        let chain = ScriptedLedger::new(1, 20).with_ack(12, packet(3), b"ok");
        let cancel = CancellationToken::new();

        let ack = poll_for_ack(&cancel, &chain, 10, 14, &packet(3), &fast())
            .await
            .unwrap();

        assert_eq!(ack.height, 12);
        assert_eq!(*chain.fetched.lock().unwrap(), vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn ignores_other_packets() {
        let chain = ScriptedLedger::new(5, 20)
            .with_ack(6, packet(8), b"other")
            .with_ack(7, packet(9), b"mine");
        let cancel = CancellationToken::new();

        let ack = poll_for_ack(&cancel, &chain, 5, 10, &packet(9), &fast())
            .await
            .unwrap();

        assert_eq!(ack.acknowledgement, b"mine");
    }

    #[tokio::test]
    async fn first_match_at_a_height_wins() {
        let chain = ScriptedLedger::new(3, 10)
            .with_ack(4, packet(1), b"first")
            .with_ack(4, packet(1), b"duplicate");
        let cancel = CancellationToken::new();

        let ack = poll_for_ack(&cancel, &chain, 3, 6, &packet(1), &fast())
            .await
            .unwrap();

        assert_eq!(ack.acknowledgement, b"first");
    }

    #[tokio::test]
    async fn exhausted_range_is_not_found() {
        let chain = ScriptedLedger::new(1, 50);
        let cancel = CancellationToken::new();

        let err = poll_for_ack(&cancel, &chain, 1, 21, &packet(1), &fast())
            .await
            .unwrap_err();

        assert!(matches!(err, PollError::NotFound));
        assert_eq!(chain.fetched.lock().unwrap().len(), 21);
    }

    #[tokio::test]
    async fn failed_lookup_is_skipped() {
        let chain = ScriptedLedger::new(1, 20)
            .failing_at(2)
            .with_ack(3, packet(1), b"ok");
        let cancel = CancellationToken::new();

        let ack = poll_for_ack(&cancel, &chain, 1, 5, &packet(1), &fast())
            .await
            .unwrap();

        assert_eq!(ack.height, 3);
    }

    #[tokio::test]
    async fn last_lookup_error_is_reported() {
        let chain = ScriptedLedger::new(1, 20).failing_at(2).failing_at(4);
        let cancel = CancellationToken::new();

        let err = poll_for_ack(&cancel, &chain, 1, 5, &packet(1), &fast())
            .await
            .unwrap_err();

        assert!(matches!(err, PollError::Fetch { height: 4, .. }));
    }

    #[tokio::test]
    async fn height_failure_aborts() {
        let mut chain = ScriptedLedger::new(1, 20).with_ack(1, packet(1), b"ok");
        chain.fail_height_read = true;
        let cancel = CancellationToken::new();

        let err = poll_for_ack(&cancel, &chain, 1, 5, &packet(1), &fast())
            .await
            .unwrap_err();

        assert!(matches!(err, PollError::Height(_)));
        assert!(chain.fetched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stalled_ledger_honors_cancellation() {
        // tip never reaches the window
        let chain = ScriptedLedger::new(1, 2);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = poll_for_ack(&cancel, &chain, 10, 20, &packet(1), &fast())
            .await
            .unwrap_err();

        assert!(matches!(err, PollError::Cancelled(_)));
    }

    #[tokio::test]
    #[should_panic(expected = "max_height must be greater than or equal to start_height")]
    async fn inverted_range_panics() {
        let chain = ScriptedLedger::new(1, 2);
        let cancel = CancellationToken::new();

        let _ = poll_for_ack(&cancel, &chain, 10, 9, &packet(1), &fast()).await;
    }

    #[tokio::test]
    async fn window_ending_at_the_last_height_terminates() {
        let chain = ScriptedLedger::new(Height::MAX - 2, Height::MAX);
        let cancel = CancellationToken::new();

        let err = poll_for_ack(
            &cancel,
            &chain,
            Height::MAX - 1,
            Height::MAX,
            &packet(1),
            &fast(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PollError::NotFound));
        assert_eq!(
            *chain.fetched.lock().unwrap(),
            vec![Height::MAX - 1, Height::MAX]
        );
    }

    #[tokio::test]
    async fn waits_for_target_height() {
        let chain = ScriptedLedger::new(1, 30);
        let cancel = CancellationToken::new();

        let reached = wait_for_height(&cancel, &chain, 7, &fast()).await.unwrap();

        assert_eq!(reached, 7);
    }
}
