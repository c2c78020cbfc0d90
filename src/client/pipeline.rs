//! The plan, authorize, build and broadcast sequence shared by every
//! outgoing transaction.

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use ixtest_core::{
    with_cancel, AuthorizeRequest, BroadcastReceipt, CustodyService, PlannerRequest, ViewService,
    WalletId,
};

use crate::prelude::*;

/// Runs the four stages in order against `services`.
///
/// The first stage that fails stops the sequence; its error is tagged with
/// the stage and nothing after it is called. Broadcast waits until the
/// transaction is detected on the ledger.
#[instrument(
    skip_all,
    fields(
        outputs = request.outputs.len(),
        withdrawals = request.ics20_withdrawals.len()
    )
)]
pub async fn execute<S>(
    cancel: &CancellationToken,
    services: &S,
    wallet_id: WalletId,
    request: PlannerRequest,
) -> Result<BroadcastReceipt, Error>
where
    S: ViewService + CustodyService + Sync,
{
    let plan = with_cancel(cancel, "plan", services.transaction_planner(request))
        .await?
        .map_err(rejected(PipelineStage::Plan))?;

    debug!(bytes = plan.as_bytes().len(), "transaction planned");

    let authorization = {
        let request = AuthorizeRequest {
            plan: &plan,
            wallet_id,
            pre_authorizations: vec![],
        };

        with_cancel(cancel, "authorize", services.authorize(request))
            .await?
            .map_err(rejected(PipelineStage::Authorize))?
    };

    let transaction = with_cancel(
        cancel,
        "witness and build",
        services.witness_and_build(plan, authorization),
    )
    .await?
    .map_err(rejected(PipelineStage::Build))?;

    let receipt = with_cancel(
        cancel,
        "broadcast",
        services.broadcast_transaction(transaction, true),
    )
    .await?
    .map_err(rejected(PipelineStage::Broadcast))?;

    debug!(
        height = receipt.detection_height,
        packets = receipt.packets.len(),
        "transaction detected"
    );

    Ok(receipt)
}

fn rejected(stage: PipelineStage) -> impl FnOnce(ServiceError) -> Error {
    move |source| Error::RemoteRejection { stage, source }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use ixtest_core::{
        Address, AddressIndex, AuthorizationData, BalanceRecord, BalancesRequest,
        SignedTransaction, TransactionPlan,
    };

    use super::*;

    #[derive(Default)]
    struct Calls {
        plan: AtomicUsize,
        authorize: AtomicUsize,
        build: AtomicUsize,
        broadcast: AtomicUsize,
    }

    /// Services that count calls and fail at a chosen stage
    #[derive(Default)]
    struct Recording {
        calls: Calls,
        fail_at: Option<PipelineStage>,
        stall_broadcast: bool,
        seen_plan: Mutex<Option<Vec<u8>>>,
        seen_wallet: Mutex<Option<WalletId>>,
        seen_await: Mutex<Option<bool>>,
    }

    impl Recording {
        fn failing_at(stage: PipelineStage) -> Self {
            Self {
                fail_at: Some(stage),
                ..Default::default()
            }
        }

        fn check(&self, stage: PipelineStage) -> Result<(), ServiceError> {
            match self.fail_at {
                Some(x) if x == stage => Err(ServiceError::rejected(format!("{stage} refused"))),
                _ => Ok(()),
            }
        }

        fn counts(&self) -> [usize; 4] {
            [
                self.calls.plan.load(Ordering::SeqCst),
                self.calls.authorize.load(Ordering::SeqCst),
                self.calls.build.load(Ordering::SeqCst),
                self.calls.broadcast.load(Ordering::SeqCst),
            ]
        }
    }

    impl ViewService for Recording {
        type BalanceStream = futures_util::stream::Iter<
            std::vec::IntoIter<Result<BalanceRecord, ServiceError>>,
        >;

        async fn address_by_index(&self, _: AddressIndex) -> Result<Address, ServiceError> {
            unimplemented!()
        }

        async fn transaction_planner(
            &self,
            _: PlannerRequest,
        ) -> Result<TransactionPlan, ServiceError> {
            self.calls.plan.fetch_add(1, Ordering::SeqCst);
            self.check(PipelineStage::Plan)?;
            Ok(TransactionPlan::from_bytes(b"plan-bytes".to_vec()))
        }

        async fn witness_and_build(
            &self,
            plan: TransactionPlan,
            _: AuthorizationData,
        ) -> Result<SignedTransaction, ServiceError> {
            self.calls.build.fetch_add(1, Ordering::SeqCst);
            self.check(PipelineStage::Build)?;
            *self.seen_plan.lock().unwrap() = Some(plan.as_bytes().to_vec());
            Ok(SignedTransaction::from_bytes(plan.into_bytes()))
        }

        async fn broadcast_transaction(
            &self,
            _: SignedTransaction,
            await_detection: bool,
        ) -> Result<BroadcastReceipt, ServiceError> {
            self.calls.broadcast.fetch_add(1, Ordering::SeqCst);
            self.check(PipelineStage::Broadcast)?;

            if self.stall_broadcast {
                // detection never happens
                std::future::pending::<()>().await;
            }

            *self.seen_await.lock().unwrap() = Some(await_detection);
            Ok(BroadcastReceipt {
                id: vec![0xab],
                detection_height: 42,
                packets: vec![],
            })
        }

        async fn balances(&self, _: BalancesRequest) -> Result<Self::BalanceStream, ServiceError> {
            unimplemented!()
        }
    }

    impl CustodyService for Recording {
        async fn authorize(
            &self,
            request: AuthorizeRequest<'_>,
        ) -> Result<AuthorizationData, ServiceError> {
            self.calls.authorize.fetch_add(1, Ordering::SeqCst);
            self.check(PipelineStage::Authorize)?;
            assert!(request.pre_authorizations.is_empty());
            *self.seen_wallet.lock().unwrap() = Some(request.wallet_id);
            Ok(AuthorizationData::from_bytes(request.plan.as_bytes().to_vec()))
        }
    }

    #[tokio::test]
    async fn runs_all_stages_in_order() {
        let services = Recording::default();
        let cancel = CancellationToken::new();

        let receipt = execute(&cancel, &services, WalletId::default(), PlannerRequest::default())
            .await
            .unwrap();

        assert_eq!(receipt.detection_height, 42);
        assert_eq!(services.counts(), [1, 1, 1, 1]);
        assert_eq!(*services.seen_wallet.lock().unwrap(), Some(WalletId([0; 32])));
        assert_eq!(*services.seen_await.lock().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn build_receives_the_planned_bytes() {
        let services = Recording::default();
        let cancel = CancellationToken::new();

        execute(&cancel, &services, WalletId::default(), PlannerRequest::default())
            .await
            .unwrap();

        assert_eq!(
            services.seen_plan.lock().unwrap().as_deref(),
            Some(&b"plan-bytes"[..])
        );
    }

    #[tokio::test]
    async fn failure_stops_later_stages() {
        let cases = [
            (PipelineStage::Plan, [1, 0, 0, 0]),
            (PipelineStage::Authorize, [1, 1, 0, 0]),
            (PipelineStage::Build, [1, 1, 1, 0]),
            (PipelineStage::Broadcast, [1, 1, 1, 1]),
        ];

        for (stage, expected) in cases {
            let services = Recording::failing_at(stage);
            let cancel = CancellationToken::new();

            let err = execute(&cancel, &services, WalletId::default(), PlannerRequest::default())
                .await
                .unwrap_err();

            assert!(
                matches!(err, Error::RemoteRejection { stage: s, .. } if s == stage),
                "unexpected error for {stage}: {err}"
            );
            assert_eq!(services.counts(), expected, "calls after {stage} failure");
        }
    }

    #[tokio::test]
    async fn cancelled_before_planning() {
        let services = Recording::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = execute(&cancel, &services, WalletId::default(), PlannerRequest::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled(_)));
        assert_eq!(services.counts(), [0, 0, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_while_awaiting_detection() {
        let services = Recording {
            stall_broadcast: true,
            ..Default::default()
        };

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();

        let err = execute(&cancel, &services, WalletId::default(), PlannerRequest::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(services.counts(), [1, 1, 1, 1]);
    }
}
