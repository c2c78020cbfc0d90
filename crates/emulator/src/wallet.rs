//! Emulated wallet daemon: view, custody and query services for one key on
//! one [`EmulatedLedger`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use xxhash_rust::xxh3::xxh3_128_with_seed;

use ixtest_core::{
    Address, AddressIndex, Amount, AssetId, AuthorizationData, AuthorizeRequest, BalanceRecord,
    BalancesRequest, BroadcastReceipt, CustodyService, DenomMetadata, Ics20Withdrawal,
    PlannedOutput, PlannerRequest, QueryService, ServiceConnector, ServiceError,
    SignedTransaction, TransactionPlan, ViewService,
};

use crate::keys::KeySeed;
use crate::ledger::{EmulatedLedger, LedgerAction, LedgerTx};

#[derive(Serialize, Deserialize)]
struct PlanBody {
    nonce: u64,
    chain_id: String,
    sender: String,
    outputs: Vec<PlannedOutput>,
    withdrawals: Vec<Ics20Withdrawal>,
}

#[derive(Serialize, Deserialize)]
struct SignedBody {
    plan: Vec<u8>,
    authorization: Vec<u8>,
}

#[derive(Clone)]
pub struct EmulatedWallet {
    ledger: EmulatedLedger,
    seed: KeySeed,
    nonce: Arc<AtomicU64>,
}

impl EmulatedWallet {
    /// Wallet holding the key behind `spend_key`
    pub fn new(ledger: EmulatedLedger, spend_key: &str) -> Result<Self, ServiceError> {
        let seed = KeySeed::parse_spend_key(spend_key).map_err(ServiceError::internal)?;

        Ok(Self {
            ledger,
            seed,
            nonce: Default::default(),
        })
    }

    pub fn address(&self) -> String {
        self.seed.address()
    }

    fn sign(&self, plan: &[u8]) -> Vec<u8> {
        let mut input = self.seed.0.to_vec();
        input.extend_from_slice(plan);

        xxh3_128_with_seed(&input, 0).to_be_bytes().to_vec()
    }

    fn decode_plan(&self, plan: &[u8]) -> Result<PlanBody, ServiceError> {
        serde_json::from_slice(plan)
            .map_err(|e| ServiceError::rejected(format!("malformed plan: {e}")))
    }
}

fn spent_by_denom(body: &PlanBody) -> HashMap<String, u128> {
    let mut totals: HashMap<String, u128> = HashMap::new();

    for output in &body.outputs {
        let amount = Amount::from(output.value.amount).0;
        let total = totals
            .entry(output.value.asset_id.alt_base_denom.clone())
            .or_default();
        *total = total.saturating_add(amount);
    }

    for withdrawal in &body.withdrawals {
        let amount = Amount::from(withdrawal.amount).0;
        let total = totals.entry(withdrawal.denom.clone()).or_default();
        *total = total.saturating_add(amount);
    }

    totals
}

impl ViewService for EmulatedWallet {
    type BalanceStream =
        futures_util::stream::Iter<std::vec::IntoIter<Result<BalanceRecord, ServiceError>>>;

    async fn address_by_index(&self, index: AddressIndex) -> Result<Address, ServiceError> {
        if index.account != 0 {
            return Err(ServiceError::rejected(format!(
                "account {} is not derived",
                index.account
            )));
        }

        Ok(Address {
            inner: self.seed.address_bytes(),
            alt_bech32m: self.seed.address(),
        })
    }

    #[instrument(skip_all)]
    async fn transaction_planner(
        &self,
        request: PlannerRequest,
    ) -> Result<TransactionPlan, ServiceError> {
        if request.outputs.is_empty() && request.ics20_withdrawals.is_empty() {
            return Err(ServiceError::rejected("nothing to plan"));
        }

        let body = PlanBody {
            nonce: self.nonce.fetch_add(1, Ordering::SeqCst),
            chain_id: self.ledger.chain_id(),
            sender: self.seed.address(),
            outputs: request.outputs,
            withdrawals: request.ics20_withdrawals,
        };

        for (denom, needed) in spent_by_denom(&body) {
            let available = self.ledger.balance(&body.sender, &denom);

            if available.0 < needed {
                return Err(ServiceError::rejected(format!(
                    "insufficient funds: {available}{denom} available, {needed}{denom} needed"
                )));
            }
        }

        let bytes = serde_json::to_vec(&body).map_err(ServiceError::internal)?;

        debug!(nonce = body.nonce, "plan ready");

        Ok(TransactionPlan::from_bytes(bytes))
    }

    async fn witness_and_build(
        &self,
        plan: TransactionPlan,
        authorization: AuthorizationData,
    ) -> Result<SignedTransaction, ServiceError> {
        if self.sign(plan.as_bytes()) != authorization.as_bytes() {
            return Err(ServiceError::rejected(
                "authorization data does not match the plan",
            ));
        }

        let body = SignedBody {
            plan: plan.into_bytes(),
            authorization: authorization.as_bytes().to_vec(),
        };

        let bytes = serde_json::to_vec(&body).map_err(ServiceError::internal)?;

        Ok(SignedTransaction::from_bytes(bytes))
    }

    #[instrument(skip_all, fields(await_detection = await_detection))]
    async fn broadcast_transaction(
        &self,
        transaction: SignedTransaction,
        await_detection: bool,
    ) -> Result<BroadcastReceipt, ServiceError> {
        let signed: SignedBody = serde_json::from_slice(transaction.as_bytes())
            .map_err(|e| ServiceError::rejected(format!("malformed transaction: {e}")))?;

        let plan = self.decode_plan(&signed.plan)?;

        if plan.chain_id != self.ledger.chain_id() {
            return Err(ServiceError::rejected(format!(
                "transaction for {} sent to {}",
                plan.chain_id,
                self.ledger.chain_id()
            )));
        }

        let id = xxh3_128_with_seed(transaction.as_bytes(), 1)
            .to_be_bytes()
            .to_vec();

        let outputs = plan.outputs.into_iter().map(|output| LedgerAction::Transfer {
            to: output.address,
            denom: output.value.asset_id.alt_base_denom,
            amount: output.value.amount.into(),
        });

        let withdrawals = plan
            .withdrawals
            .into_iter()
            .map(|withdrawal| LedgerAction::Withdrawal {
                receiver: withdrawal.destination_chain_address,
                denom: withdrawal.denom,
                amount: withdrawal.amount.into(),
                source_channel: withdrawal.source_channel,
                timeout_height: withdrawal.timeout_height,
                timeout_time: withdrawal.timeout_time,
            });

        self.ledger.submit(LedgerTx {
            id: id.clone(),
            sender: plan.sender,
            actions: outputs.chain(withdrawals).collect(),
        });

        if !await_detection {
            return Ok(BroadcastReceipt {
                id,
                detection_height: 0,
                packets: vec![],
            });
        }

        let inclusion = self.ledger.wait_for_inclusion(&id).await;

        if let Some(reason) = inclusion.failure {
            return Err(ServiceError::rejected(reason));
        }

        Ok(BroadcastReceipt {
            id,
            detection_height: inclusion.height,
            packets: inclusion.packets,
        })
    }

    async fn balances(
        &self,
        request: BalancesRequest,
    ) -> Result<Self::BalanceStream, ServiceError> {
        let account = request.account_filter.unwrap_or_default();

        let records = if account.account == 0 {
            self.ledger
                .balances_of(&self.seed.address())
                .into_iter()
                .filter(|(denom, _)| match &request.asset_id_filter {
                    Some(asset) => asset.alt_base_denom == *denom,
                    None => true,
                })
                .map(|(denom, amount)| {
                    Ok(BalanceRecord {
                        account,
                        denom,
                        amount: amount.into(),
                    })
                })
                .collect()
        } else {
            vec![]
        };

        Ok(futures_util::stream::iter(records))
    }
}

impl CustodyService for EmulatedWallet {
    async fn authorize(
        &self,
        request: AuthorizeRequest<'_>,
    ) -> Result<AuthorizationData, ServiceError> {
        let plan = self.decode_plan(request.plan.as_bytes())?;

        if plan.sender != self.seed.address() {
            return Err(ServiceError::rejected("plan was made for another key"));
        }

        Ok(AuthorizationData::from_bytes(
            self.sign(request.plan.as_bytes()),
        ))
    }
}

impl QueryService for EmulatedWallet {
    async fn denom_metadata_by_id(
        &self,
        chain_id: &str,
        asset_id: &AssetId,
    ) -> Result<Option<DenomMetadata>, ServiceError> {
        if chain_id != self.ledger.chain_id() {
            return Err(ServiceError::rejected(format!("unknown chain {chain_id}")));
        }

        Ok(self.ledger.denom_metadata(&asset_id.alt_base_denom))
    }
}

/// Resolves daemon endpoints to registered wallets
#[derive(Clone, Default)]
pub struct EmulatedConnector {
    endpoints: Arc<RwLock<HashMap<String, EmulatedWallet>>>,
}

impl EmulatedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `wallet` at `endpoint`, replacing whatever was there
    pub fn register(&self, endpoint: impl Into<String>, wallet: EmulatedWallet) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.into(), wallet);
    }
}

impl ServiceConnector for EmulatedConnector {
    type Channel = EmulatedWallet;

    async fn connect(&self, endpoint: &str) -> Result<Self::Channel, ServiceError> {
        let endpoints = self.endpoints.read().unwrap_or_else(PoisonError::into_inner);

        endpoints
            .get(endpoint)
            .cloned()
            .ok_or_else(|| ServiceError::Unavailable {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use futures_util::TryStreamExt;
    use ixtest_core::{AssetId, Value, WalletId};

    use super::*;

    fn funded_wallet(amount: u128) -> (EmulatedLedger, EmulatedWallet) {
        let ledger = EmulatedLedger::new("penumbra-test");
        let seed = KeySeed::from_phrase("alpha beta gamma");
        ledger.fund(&seed.address(), "upenumbra", Amount(amount));

        let wallet = EmulatedWallet::new(ledger.clone(), &seed.spend_key()).unwrap();
        (ledger, wallet)
    }

    fn transfer(amount: u128) -> PlannerRequest {
        PlannerRequest {
            wallet_id: None,
            outputs: vec![PlannedOutput {
                value: Value {
                    amount: Amount(amount).into(),
                    asset_id: AssetId::from_denom("upenumbra"),
                },
                address: "penumbrav2t1dest".into(),
            }],
            ics20_withdrawals: vec![],
        }
    }

    #[tokio::test]
    async fn overspending_plan_is_rejected() {
        let (_, wallet) = funded_wallet(10);

        let err = wallet.transaction_planner(transfer(11)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Rejected(_)));
    }

    #[tokio::test]
    async fn build_rejects_foreign_authorization() {
        let (_, wallet) = funded_wallet(10);

        let plan = wallet.transaction_planner(transfer(1)).await.unwrap();
        let other = wallet.transaction_planner(transfer(2)).await.unwrap();

        let auth = wallet
            .authorize(AuthorizeRequest {
                plan: &other,
                wallet_id: WalletId::default(),
                pre_authorizations: vec![],
            })
            .await
            .unwrap();

        let err = wallet.witness_and_build(plan, auth).await.unwrap_err();
        assert!(matches!(err, ServiceError::Rejected(_)));
    }

    #[tokio::test]
    async fn balances_filter_by_denom() {
        let (ledger, wallet) = funded_wallet(10);
        ledger.fund(&wallet.address(), "gm", Amount(3));

        let request = BalancesRequest {
            account_filter: Some(AddressIndex { account: 0 }),
            asset_id_filter: Some(AssetId::from_denom("gm")),
        };

        let records: Vec<_> = wallet
            .balances(request)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(Amount::from(records[0].amount), Amount(3));
    }

    #[tokio::test]
    async fn unknown_endpoint_is_unavailable() {
        let connector = EmulatedConnector::new();

        let err = connector.connect("127.0.0.1:1").await.err().unwrap();
        assert!(matches!(err, ServiceError::Unavailable { .. }));
    }
}
