//! In-memory ledger with balances, block production and packet relaying.
//!
//! Transactions wait in a pending queue until the next block is produced.
//! Cross-ledger withdrawals emit packets into an outbox; a relayer delivers
//! them to the counterparty and brings the acknowledgement back, which is
//! recorded on the sending ledger at its next block.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ixtest_core::{
    Amount, ChainAcker, ChainHeighter, DenomMetadata, DenomUnit, Height, LedgerError, Packet,
    PacketAcknowledgement, TimeoutHeight,
};

use crate::toolchain::GenesisFile;

pub const TRANSFER_PORT: &str = "transfer";

/// Acknowledgement written for a packet that was received successfully
pub const SUCCESS_ACK: &[u8] = br#"{"result":"AQ=="}"#;

/// Payload of an ics-20 transfer packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FungibleTokenPacketData {
    pub denom: String,
    pub amount: String,
    pub sender: String,
    pub receiver: String,

    #[serde(default)]
    pub memo: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerAction {
    Transfer {
        to: String,
        denom: String,
        amount: Amount,
    },
    Withdrawal {
        receiver: String,
        denom: String,
        amount: Amount,
        source_channel: String,
        timeout_height: TimeoutHeight,
        timeout_time: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTx {
    pub id: Vec<u8>,
    pub sender: String,
    pub actions: Vec<LedgerAction>,
}

/// Result of including a transaction in a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inclusion {
    pub height: Height,
    pub packets: Vec<Packet>,

    /// Reason the transaction was dropped during execution, if it was
    pub failure: Option<String>,
}

#[derive(Debug)]
struct LedgerState {
    chain_id: String,
    height: Height,
    balances: HashMap<(String, String), u128>,
    pending: Vec<LedgerTx>,
    included: HashMap<Vec<u8>, Inclusion>,
    sequences: HashMap<String, u64>,
    outbox: Vec<(Height, Packet)>,
    pending_acks: Vec<(Packet, Vec<u8>)>,
    acks: BTreeMap<Height, Vec<PacketAcknowledgement>>,
    failing_ack_heights: HashSet<Height>,
    metadata: HashMap<String, DenomMetadata>,
}

#[derive(Clone)]
pub struct EmulatedLedger {
    state: Arc<RwLock<LedgerState>>,
    tip: watch::Sender<Height>,
}

impl EmulatedLedger {
    pub fn new(chain_id: impl Into<String>) -> Self {
        let state = LedgerState {
            chain_id: chain_id.into(),
            height: 1,
            balances: HashMap::new(),
            pending: vec![],
            included: HashMap::new(),
            sequences: HashMap::new(),
            outbox: vec![],
            pending_acks: vec![],
            acks: BTreeMap::new(),
            failing_ack_heights: HashSet::new(),
            metadata: HashMap::new(),
        };

        let (tip, _) = watch::channel(1);

        Self {
            state: Arc::new(RwLock::new(state)),
            tip,
        }
    }

    /// Boots a ledger from a generated genesis file, funding every allocation
    pub fn from_genesis(genesis: &[u8]) -> Result<Self, LedgerError> {
        let genesis: GenesisFile = serde_json::from_slice(genesis).map_err(LedgerError::internal)?;

        let ledger = Self::new(&genesis.chain_id);

        for allocation in &genesis.app_state.allocations {
            ledger.fund(&allocation.address, &allocation.denom, allocation.amount);
            ledger.register_denom(staking_metadata(&allocation.denom));
        }

        info!(
            chain_id = %genesis.chain_id,
            validators = genesis.app_state.validators.len(),
            allocations = genesis.app_state.allocations.len(),
            "ledger booted from genesis"
        );

        Ok(ledger)
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn chain_id(&self) -> String {
        self.read().chain_id.clone()
    }

    pub fn current_height(&self) -> Height {
        self.read().height
    }

    pub fn fund(&self, address: &str, denom: &str, amount: Amount) {
        let mut state = self.write();
        let entry = state
            .balances
            .entry((address.to_string(), denom.to_string()))
            .or_default();

        *entry = entry.saturating_add(amount.0);
    }

    pub fn balance(&self, address: &str, denom: &str) -> Amount {
        let state = self.read();

        state
            .balances
            .get(&(address.to_string(), denom.to_string()))
            .copied()
            .map(Amount)
            .unwrap_or(Amount::ZERO)
    }

    /// Every non-zero balance held by `address`, ordered by denom
    pub fn balances_of(&self, address: &str) -> Vec<(String, Amount)> {
        let state = self.read();

        let mut found: Vec<_> = state
            .balances
            .iter()
            .filter(|((owner, _), amount)| owner == address && **amount > 0)
            .map(|((_, denom), amount)| (denom.clone(), Amount(*amount)))
            .collect();

        found.sort();
        found
    }

    pub fn register_denom(&self, metadata: DenomMetadata) {
        self.write()
            .metadata
            .entry(metadata.base.clone())
            .or_insert(metadata);
    }

    pub fn denom_metadata(&self, base: &str) -> Option<DenomMetadata> {
        self.read().metadata.get(base).cloned()
    }

    /// Makes acknowledgement lookups at `height` fail
    pub fn fail_ack_lookups_at(&self, height: Height) {
        self.write().failing_ack_heights.insert(height);
    }

    pub fn submit(&self, tx: LedgerTx) {
        debug!(tx = hex::encode(&tx.id), "tx received");
        self.write().pending.push(tx);
    }

    pub fn inclusion(&self, id: &[u8]) -> Option<Inclusion> {
        self.read().included.get(id).cloned()
    }

    /// Waits until the transaction `id` lands in a block
    pub async fn wait_for_inclusion(&self, id: &[u8]) -> Inclusion {
        let mut tip = self.tip.subscribe();

        loop {
            if let Some(inclusion) = self.inclusion(id) {
                return inclusion;
            }

            // the sender lives as long as self, so this only fails on shutdown
            if tip.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Seals the next block: applies pending transactions and records the
    /// acknowledgements relayed back since the previous block.
    pub fn produce_block(&self) -> Height {
        let height = {
            let mut state = self.write();
            let state = &mut *state;

            state.height += 1;
            let height = state.height;

            for tx in std::mem::take(&mut state.pending) {
                let inclusion = apply_tx(state, &tx, height);

                if let Some(reason) = &inclusion.failure {
                    warn!(tx = hex::encode(&tx.id), %reason, "tx failed");
                }

                state.included.insert(tx.id, inclusion);
            }

            let acks: Vec<_> = std::mem::take(&mut state.pending_acks)
                .into_iter()
                .map(|(packet, acknowledgement)| PacketAcknowledgement {
                    packet,
                    acknowledgement,
                    height,
                })
                .collect();

            if !acks.is_empty() {
                debug!(height, acks = acks.len(), "acknowledgements recorded");
                state.acks.entry(height).or_default().extend(acks);
            }

            height
        };

        self.tip.send_replace(height);

        height
    }

    /// Packets emitted at least `delay` blocks ago, removed from the outbox
    fn drain_outbox(&self, delay: u64) -> Vec<Packet> {
        let mut state = self.write();
        let current = state.height;

        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.outbox)
            .into_iter()
            .partition(|(emitted, _)| emitted + delay <= current);

        state.outbox = waiting;

        ready.into_iter().map(|(_, packet)| packet).collect()
    }

    /// Executes an incoming transfer packet and returns the acknowledgement
    pub fn receive_packet(&self, packet: &Packet) -> Vec<u8> {
        let data: FungibleTokenPacketData = match serde_json::from_slice(&packet.data) {
            Ok(data) => data,
            Err(err) => return error_ack(&err.to_string()),
        };

        let Ok(amount) = data.amount.parse::<u128>() else {
            return error_ack("invalid amount");
        };

        let denom = format!("{}/{}/{}", packet.dest_port, packet.dest_channel, data.denom);

        self.fund(&data.receiver, &denom, Amount(amount));
        self.register_denom(voucher_metadata(&denom));

        debug!(sequence = packet.sequence, %denom, "packet received");

        SUCCESS_ACK.to_vec()
    }

    pub fn acks_at(&self, height: Height) -> Vec<PacketAcknowledgement> {
        self.read().acks.get(&height).cloned().unwrap_or_default()
    }

    /// Queues an acknowledgement to be recorded at the next block
    pub fn record_ack(&self, packet: Packet, acknowledgement: Vec<u8>) {
        self.write().pending_acks.push((packet, acknowledgement));
    }

    /// Produces a block every `interval` until cancelled
    pub fn spawn_block_producer(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let ledger = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        ledger.produce_block();
                    }
                    _ = cancel.cancelled() => {
                        debug!(chain_id = %ledger.chain_id(), "block producer stopped");
                        break;
                    }
                }
            }
        })
    }
}

/// Moves packets from `source` to `destination` and their acknowledgements
/// back; returns how many were relayed.
pub fn relay_once(source: &EmulatedLedger, destination: &EmulatedLedger, delay: u64) -> usize {
    let packets = source.drain_outbox(delay);
    let count = packets.len();

    for packet in packets {
        let ack = destination.receive_packet(&packet);
        source.record_ack(packet, ack);
    }

    count
}

/// Relays between two ledgers in both directions until cancelled
pub fn spawn_relayer(
    a: EmulatedLedger,
    b: EmulatedLedger,
    delay: u64,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let relayed = relay_once(&a, &b, delay) + relay_once(&b, &a, delay);

                    if relayed > 0 {
                        debug!(relayed, "packets relayed");
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("relayer stopped");
                    break;
                }
            }
        }
    })
}

fn apply_tx(state: &mut LedgerState, tx: &LedgerTx, height: Height) -> Inclusion {
    let mut balances = state.balances.clone();
    let mut sequences = state.sequences.clone();
    let mut packets = vec![];

    for action in &tx.actions {
        let (denom, amount) = match action {
            LedgerAction::Transfer { denom, amount, .. } => (denom, amount),
            LedgerAction::Withdrawal { denom, amount, .. } => (denom, amount),
        };

        let key = (tx.sender.clone(), denom.clone());
        let available = Amount(balances.get(&key).copied().unwrap_or_default());

        let Some(remaining) = available.checked_sub(*amount) else {
            return Inclusion {
                height,
                packets: vec![],
                failure: Some(format!("insufficient {denom}: have {available}, need {amount}")),
            };
        };

        balances.insert(key, remaining.0);

        match action {
            LedgerAction::Transfer { to, denom, amount } => {
                let entry = balances.entry((to.clone(), denom.clone())).or_default();

                let Some(credited) = Amount(*entry).checked_add(*amount) else {
                    return Inclusion {
                        height,
                        packets: vec![],
                        failure: Some(format!("{denom} balance of {to} overflows")),
                    };
                };

                *entry = credited.0;
            }
            LedgerAction::Withdrawal {
                receiver,
                denom,
                amount,
                source_channel,
                timeout_height,
                timeout_time,
            } => {
                let sequence = sequences.entry(source_channel.clone()).or_insert(0);
                *sequence += 1;

                let data = FungibleTokenPacketData {
                    denom: denom.clone(),
                    amount: amount.to_string(),
                    sender: tx.sender.clone(),
                    receiver: receiver.clone(),
                    memo: String::new(),
                };

                packets.push(Packet {
                    sequence: *sequence,
                    source_port: TRANSFER_PORT.to_string(),
                    source_channel: source_channel.clone(),
                    dest_port: TRANSFER_PORT.to_string(),
                    dest_channel: source_channel.clone(),
                    data: serde_json::to_vec(&data).unwrap_or_default(),
                    timeout_height: timeout_height.to_string(),
                    timeout_timestamp: *timeout_time,
                });
            }
        }
    }

    state.balances = balances;
    state.sequences = sequences;
    state
        .outbox
        .extend(packets.iter().cloned().map(|packet| (height, packet)));

    Inclusion {
        height,
        packets,
        failure: None,
    }
}

fn error_ack(reason: &str) -> Vec<u8> {
    serde_json::json!({ "error": reason }).to_string().into_bytes()
}

fn staking_metadata(base: &str) -> DenomMetadata {
    let display = base.strip_prefix('u').unwrap_or(base).to_string();

    DenomMetadata {
        base: base.to_string(),
        display: display.clone(),
        denom_units: vec![
            DenomUnit {
                denom: base.to_string(),
                exponent: 0,
            },
            DenomUnit {
                denom: format!("m{display}"),
                exponent: 3,
            },
            DenomUnit {
                denom: display,
                exponent: 6,
            },
        ],
    }
}

fn voucher_metadata(denom: &str) -> DenomMetadata {
    DenomMetadata {
        base: denom.to_string(),
        display: denom.to_string(),
        denom_units: vec![DenomUnit {
            denom: denom.to_string(),
            exponent: 0,
        }],
    }
}

impl ChainHeighter for EmulatedLedger {
    async fn height(&self) -> Result<Height, LedgerError> {
        Ok(self.current_height())
    }
}

impl ChainAcker for EmulatedLedger {
    async fn acknowledgements(
        &self,
        height: Height,
    ) -> Result<Vec<PacketAcknowledgement>, LedgerError> {
        let state = self.read();

        if height > state.height {
            return Err(LedgerError::MissingBlock(height));
        }

        if state.failing_ack_heights.contains(&height) {
            return Err(LedgerError::Unavailable(format!(
                "block results at height {height} unavailable"
            )));
        }

        Ok(state.acks.get(&height).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "penumbrav2t1alice";
    const BOB: &str = "cosmos1bob";

    fn withdrawal(amount: u128) -> LedgerAction {
        LedgerAction::Withdrawal {
            receiver: BOB.to_string(),
            denom: "upenumbra".to_string(),
            amount: Amount(amount),
            source_channel: "channel-0".to_string(),
            timeout_height: TimeoutHeight {
                revision_number: 0,
                revision_height: 1000,
            },
            timeout_time: 600,
        }
    }

    fn tx(id: u8, actions: Vec<LedgerAction>) -> LedgerTx {
        LedgerTx {
            id: vec![id],
            sender: ALICE.to_string(),
            actions,
        }
    }

    #[test]
    fn transfers_apply_at_next_block() {
        let ledger = EmulatedLedger::new("a");
        ledger.fund(ALICE, "upenumbra", Amount(100));

        ledger.submit(tx(
            1,
            vec![LedgerAction::Transfer {
                to: "penumbrav2t1carol".to_string(),
                denom: "upenumbra".to_string(),
                amount: Amount(40),
            }],
        ));

        assert_eq!(ledger.balance(ALICE, "upenumbra"), Amount(100));

        let height = ledger.produce_block();

        assert_eq!(ledger.inclusion(&[1]).unwrap().height, height);
        assert_eq!(ledger.balance(ALICE, "upenumbra"), Amount(60));
        assert_eq!(ledger.balance("penumbrav2t1carol", "upenumbra"), Amount(40));
    }

    #[test]
    fn overspend_is_dropped_whole() {
        let ledger = EmulatedLedger::new("a");
        ledger.fund(ALICE, "upenumbra", Amount(10));

        ledger.submit(tx(2, vec![withdrawal(5), withdrawal(6)]));
        ledger.produce_block();

        let inclusion = ledger.inclusion(&[2]).unwrap();
        assert!(inclusion.failure.is_some());
        assert!(inclusion.packets.is_empty());
        assert_eq!(ledger.balance(ALICE, "upenumbra"), Amount(10));
    }

    #[test]
    fn overflowing_credit_is_dropped_whole() {
        let ledger = EmulatedLedger::new("a");
        ledger.fund(ALICE, "upenumbra", Amount(10));
        ledger.fund(BOB, "upenumbra", Amount(u128::MAX));

        ledger.submit(tx(
            3,
            vec![LedgerAction::Transfer {
                to: BOB.to_string(),
                denom: "upenumbra".to_string(),
                amount: Amount(1),
            }],
        ));
        ledger.produce_block();

        let inclusion = ledger.inclusion(&[3]).unwrap();
        assert!(inclusion.failure.is_some());
        assert_eq!(ledger.balance(ALICE, "upenumbra"), Amount(10));
        assert_eq!(ledger.balance(BOB, "upenumbra"), Amount(u128::MAX));
    }

    #[test]
    fn relayed_packet_is_acknowledged_on_source() {
        let a = EmulatedLedger::new("a");
        let b = EmulatedLedger::new("b");
        a.fund(ALICE, "upenumbra", Amount(100));

        a.submit(tx(3, vec![withdrawal(25)]));
        let sent_at = a.produce_block();
        let packet = a.inclusion(&[3]).unwrap().packets[0].clone();

        assert_eq!(packet.sequence, 1);
        assert_eq!(packet.timeout_height, "0-1000");

        // not old enough yet
        assert_eq!(relay_once(&a, &b, 1), 0);

        a.produce_block();
        assert_eq!(relay_once(&a, &b, 1), 1);

        assert_eq!(b.balance(BOB, "transfer/channel-0/upenumbra"), Amount(25));

        let acked_at = a.produce_block();
        let acks = a.acks_at(acked_at);

        assert!(acked_at > sent_at);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].packet, packet);
        assert_eq!(acks[0].acknowledgement, SUCCESS_ACK);
    }

    #[tokio::test]
    async fn future_heights_are_missing() {
        let ledger = EmulatedLedger::new("a");

        let err = ledger.acknowledgements(5).await.unwrap_err();
        assert!(matches!(err, LedgerError::MissingBlock(5)));
    }

    #[tokio::test]
    async fn injected_lookup_failure() {
        let ledger = EmulatedLedger::new("a");
        ledger.produce_block();
        ledger.fail_ack_lookups_at(2);

        assert!(ledger.acknowledgements(2).await.is_err());
        assert!(ledger.acknowledgements(1).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn inclusion_wait_follows_block_producer() {
        let ledger = EmulatedLedger::new("a");
        ledger.fund(ALICE, "upenumbra", Amount(5));
        ledger.submit(tx(4, vec![withdrawal(5)]));

        let cancel = CancellationToken::new();
        let producer = ledger.spawn_block_producer(Duration::from_millis(50), cancel.clone());

        let inclusion = ledger.wait_for_inclusion(&[4]).await;

        assert!(inclusion.failure.is_none());
        assert_eq!(inclusion.packets.len(), 1);

        cancel.cancel();
        producer.await.unwrap();
    }
}
