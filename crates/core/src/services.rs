//! Request/response contracts of the remote wallet daemon.
//!
//! The daemon exposes a view service (planning, building, broadcasting,
//! balances), a custody service (authorization) and a query service. Their
//! wire encoding belongs to the implementation behind [`ServiceConnector`];
//! this module only fixes the shape of the values that flow between calls.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Height, Packet, TimeoutHeight, WireAmount};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service unavailable at {endpoint}: {reason}")]
    Unavailable { endpoint: String, reason: String },

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("service internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ServiceError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        ServiceError::Rejected(reason.into())
    }

    pub fn internal<T>(value: T) -> Self
    where
        T: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        ServiceError::Internal(value.into())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressIndex {
    pub account: u32,
}

/// Identifies an asset by its base denom
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetId {
    pub alt_base_denom: String,
}

impl AssetId {
    pub fn from_denom(denom: impl Into<String>) -> Self {
        Self {
            alt_base_denom: denom.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletId(pub [u8; 32]);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub inner: Vec<u8>,
    pub alt_bech32m: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub amount: WireAmount,
    pub asset_id: AssetId,
}

/// A plain transfer to an address on the same ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedOutput {
    pub value: Value,
    pub address: String,
}

/// A transfer leaving the ledger through an ics-20 channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ics20Withdrawal {
    pub amount: WireAmount,
    pub denom: String,
    pub destination_chain_address: String,
    pub return_address: String,
    pub timeout_height: TimeoutHeight,
    pub timeout_time: u64,
    pub source_channel: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerRequest {
    pub wallet_id: Option<WalletId>,
    pub outputs: Vec<PlannedOutput>,
    pub ics20_withdrawals: Vec<Ics20Withdrawal>,
}

/// Unsigned plan returned by the planner.
///
/// A plan is a single-use capability: it is borrowed for authorization and
/// consumed by the build step, so it can't be reused for a second transaction.
#[derive(Debug, PartialEq, Eq)]
pub struct TransactionPlan(Vec<u8>);

impl TransactionPlan {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreAuthorization(pub Vec<u8>);

pub struct AuthorizeRequest<'a> {
    pub plan: &'a TransactionPlan,
    pub wallet_id: WalletId,
    pub pre_authorizations: Vec<PreAuthorization>,
}

/// Signing material bound to the plan it was produced for
#[derive(Debug, PartialEq, Eq)]
pub struct AuthorizationData(Vec<u8>);

impl AuthorizationData {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct SignedTransaction(Vec<u8>);

impl SignedTransaction {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastReceipt {
    pub id: Vec<u8>,
    pub detection_height: Height,
    pub packets: Vec<Packet>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalancesRequest {
    pub account_filter: Option<AddressIndex>,
    pub asset_id_filter: Option<AssetId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceRecord {
    pub account: AddressIndex,
    pub denom: String,
    pub amount: WireAmount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenomUnit {
    pub denom: String,
    pub exponent: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenomMetadata {
    pub base: String,
    pub display: String,
    pub denom_units: Vec<DenomUnit>,
}

#[trait_variant::make(Send)]
pub trait ViewService {
    type BalanceStream: futures_core::Stream<Item = Result<BalanceRecord, ServiceError>>
        + Send
        + Unpin;

    async fn address_by_index(&self, index: AddressIndex) -> Result<Address, ServiceError>;

    async fn transaction_planner(
        &self,
        request: PlannerRequest,
    ) -> Result<TransactionPlan, ServiceError>;

    async fn witness_and_build(
        &self,
        plan: TransactionPlan,
        authorization: AuthorizationData,
    ) -> Result<SignedTransaction, ServiceError>;

    /// Submits a transaction; with `await_detection` the call returns only
    /// once the transaction was seen on the ledger.
    async fn broadcast_transaction(
        &self,
        transaction: SignedTransaction,
        await_detection: bool,
    ) -> Result<BroadcastReceipt, ServiceError>;

    async fn balances(&self, request: BalancesRequest)
        -> Result<Self::BalanceStream, ServiceError>;
}

#[trait_variant::make(Send)]
pub trait CustodyService {
    async fn authorize(
        &self,
        request: AuthorizeRequest<'_>,
    ) -> Result<AuthorizationData, ServiceError>;
}

#[trait_variant::make(Send)]
pub trait QueryService {
    async fn denom_metadata_by_id(
        &self,
        chain_id: &str,
        asset_id: &AssetId,
    ) -> Result<Option<DenomMetadata>, ServiceError>;
}

/// Dials a wallet daemon endpoint
#[trait_variant::make(Send)]
pub trait ServiceConnector: Clone + Send + Sync + 'static {
    type Channel: ViewService + CustodyService + QueryService + Send + Sync;

    async fn connect(&self, endpoint: &str) -> Result<Self::Channel, ServiceError>;
}
