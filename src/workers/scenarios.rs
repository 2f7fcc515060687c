//! End-to-end relay flows across workers, against the in-memory store

use super::testing::*;
use super::*;
use crate::attestation::MockAttestationClient;
use crate::chain::EventSource;
use crate::error::RelayerError;
use crate::events::{PayoutRequest, RelayEvent};
use crate::job::fixtures::relay_event;
use crate::job::{CallKind, GasRole, JobStatus};
use crate::retry::RetryPolicy;
use crate::store::{GasLedger, JobRepository, MemoryStore, SampleQuery};
use crate::tx::{MockSubmitter, SubmissionOutcome, TxLookup};

use std::sync::atomic::{AtomicUsize, Ordering};

const TICK: Duration = Duration::from_millis(10);
const BOOTSTRAP: u128 = 1_000_000_000_000_000_000;

struct Relay {
    store: Arc<MemoryStore>,
    estimator: Arc<FeeEstimator>,
    rotator: Arc<AccountRotator>,
}

impl Relay {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            estimator: estimator(store.clone()),
            store,
            rotator: rotator(),
        }
    }

    fn watcher(&self, source: Arc<ScriptedSource<RelayEvent>>, attestations: MockAttestationClient) -> ChainWatcher {
        ChainWatcher::new(
            source.chain_id(),
            0,
            source,
            self.store.clone(),
            Arc::new(attestations),
            self.estimator.clone(),
            TICK,
        )
    }

    fn core_executor(&self, submitter: MockSubmitter) -> CoreExecutor {
        CoreExecutor::new(
            self.store.clone(),
            Arc::new(submitter),
            self.rotator.clone(),
            self.estimator.clone(),
            1_000,
            BOOTSTRAP,
            10,
            TICK,
        )
    }
}

#[tokio::test]
async fn test_supply_with_attestation_settles() {
    let relay = Relay::new();
    let source = Arc::new(ScriptedSource::new(POLYGON));
    source.push(142, relay_event(POLYGON, 42, 7, 0));

    relay
        .watcher(source, attestations_available())
        .run_once()
        .await
        .unwrap();
    let job = relay.store.find(POLYGON, 42).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.call_kind, CallKind::Supply);

    let mut submitter = funded_submitter(CORE);
    submitter
        .expect_submit()
        .times(1)
        .returning(|_, _| Ok(executed("0xsupply", 350_000, None)));
    relay.core_executor(submitter).run_once().await.unwrap();

    let job = relay.store.find(POLYGON, 42).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Success);
    let samples = relay
        .store
        .recent(&SampleQuery::settlement(POLYGON, CallKind::Supply), 10)
        .await
        .unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].role, GasRole::Settlement);
    assert_eq!(samples[0].nonce, 42);
}

#[tokio::test]
async fn test_withdraw_settles_then_pays_out() {
    let relay = Relay::new();
    let source = Arc::new(ScriptedSource::new(CORE));
    source.push(109, relay_event(CORE, 9, 9, 1));
    relay
        .watcher(source, attestations_available())
        .run_once()
        .await
        .unwrap();

    let mut core = funded_submitter(CORE);
    core.expect_submit()
        .times(1)
        .returning(|_, _| Ok(executed("0xwithdraw", 600_000, Some(2))));
    relay.core_executor(core).run_once().await.unwrap();
    assert_eq!(
        relay.store.find(CORE, 9).await.unwrap().unwrap().status,
        JobStatus::AwaitingPayout
    );

    let requests = Arc::new(ScriptedSource::new(CORE));
    requests.push(
        300,
        PayoutRequest {
            source_chain_id: CORE,
            source_nonce: 9,
            sequence: 77,
            call_type: 1,
            payout_chain_id: ARBITRUM,
            payout_address: "0x00000000000000000000000000000000000000b0".to_string(),
            block_number: 300,
            tx_id: "0xwithdraw".to_string(),
        },
    );
    PayoutWatcher::new(
        CORE,
        "0x00000000000000000000000000000000000000c0".to_string(),
        0,
        requests,
        relay.store.clone(),
        Arc::new(attestations_available()),
        RetryPolicy::none(),
        TICK,
    )
    .run_once()
    .await
    .unwrap();
    let job = relay.store.find(CORE, 9).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::PayoutPending);
    assert_eq!(job.payout_chain_id, Some(ARBITRUM));

    let mut payout = funded_submitter(ARBITRUM);
    payout.expect_submit().times(1).returning(|_, _| {
        Ok(SubmissionOutcome {
            tx_id: "0xpayout".to_string(),
            gas_used: 120_000,
            cost: 120_000_000_000_000,
            executed: true,
            variant: None,
        })
    });
    PayoutExecutor::new(
        relay.store.clone(),
        Arc::new(payout),
        relay.rotator.clone(),
        relay.estimator.clone(),
        1_000,
        10,
        TICK,
    )
    .run_once()
    .await
    .unwrap();

    let job = relay.store.find(CORE, 9).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.payout_tx_id.as_deref(), Some("0xpayout"));
    assert!(job.completed_at.is_some());
    assert_eq!(relay.store.sample_count().await, 2);
}

#[tokio::test]
async fn test_attestation_arrives_after_five_failed_sweeps() {
    let relay = Relay::new();
    let source = Arc::new(ScriptedSource::new(POLYGON));
    source.push(101, relay_event(POLYGON, 1, 11, 0));
    relay
        .watcher(source, attestations_pending())
        .run_once()
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let mut client = MockAttestationClient::new();
    client.expect_fetch().returning({
        let calls = calls.clone();
        move |_, chain_id, sequence| {
            if calls.fetch_add(1, Ordering::SeqCst) < 5 {
                Err(RelayerError::AttestationPending { chain_id, sequence })
            } else {
                Ok(vec![0xcc])
            }
        }
    });
    let sweep = AttestationSweep::new(
        POLYGON,
        POLYGON,
        relay.store.clone(),
        Arc::new(client),
        RetryPolicy::none(),
        10,
        TICK,
    );

    for _ in 0..5 {
        sweep.run_once().await.unwrap();
        assert_eq!(
            relay.store.find(POLYGON, 1).await.unwrap().unwrap().status,
            JobStatus::AwaitingAttestation
        );
    }

    sweep.run_once().await.unwrap();
    let job = relay.store.find(POLYGON, 1).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.attestation, Some(vec![0xcc]));
    assert_eq!(calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_business_rejection_is_terminal() {
    let relay = Relay::new();
    let source = Arc::new(ScriptedSource::new(POLYGON));
    source.push(105, relay_event(POLYGON, 5, 5, 2));
    relay
        .watcher(source, attestations_available())
        .run_once()
        .await
        .unwrap();

    let mut submitter = funded_submitter(CORE);
    submitter.expect_submit().times(1).returning(|_, _| {
        Err(RelayerError::Rejected {
            chain_id: CORE,
            reason: "ELIQUIDITY_TOO_LOW".to_string(),
        })
    });
    let executor = relay.core_executor(submitter);
    executor.run_once().await.unwrap();
    // terminal: a second cycle finds nothing to submit
    executor.run_once().await.unwrap();

    let job = relay.store.find(POLYGON, 5).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_reason.as_deref(), Some("ELIQUIDITY_TOO_LOW"));
    assert_eq!(relay.store.sample_count().await, 0);
}

#[tokio::test]
async fn test_bootstrap_only_for_first_settlement_of_a_pair() {
    let relay = Relay::new();
    let source = Arc::new(ScriptedSource::new(POLYGON));
    source.push(101, relay_event(POLYGON, 1, 1, 3));
    source.push(102, relay_event(POLYGON, 2, 2, 3));
    relay
        .watcher(source, attestations_available())
        .run_once()
        .await
        .unwrap();

    let budgets = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut submitter = funded_submitter(CORE);
    submitter.expect_submit().times(2).returning({
        let budgets = budgets.clone();
        move |request, _| {
            budgets.lock().unwrap().push(request.fee_budget);
            Ok(executed("0xrepay", 250_000, None))
        }
    });

    // one job per cycle so the first sample lands before the second job
    let executor = CoreExecutor::new(
        relay.store.clone(),
        Arc::new(submitter),
        relay.rotator.clone(),
        relay.estimator.clone(),
        1_000,
        BOOTSTRAP,
        1,
        TICK,
    );
    executor.run_once().await.unwrap();
    executor.run_once().await.unwrap();

    let budgets = budgets.lock().unwrap().clone();
    assert_eq!(budgets.len(), 2);
    assert_eq!(budgets[0], BOOTSTRAP);
    assert!(budgets[1] < BOOTSTRAP);
}

#[tokio::test]
async fn test_unconfirmed_withdraw_still_pays_out() {
    let relay = Relay::new();
    let source = Arc::new(ScriptedSource::new(POLYGON));
    source.push(120, relay_event(POLYGON, 20, 20, 1));
    relay
        .watcher(source, attestations_available())
        .run_once()
        .await
        .unwrap();

    // the first broadcast outlives the receipt wait; any replay is refused
    let submissions = Arc::new(AtomicUsize::new(0));
    let mut core = funded_submitter(CORE);
    core.expect_submit().returning({
        let submissions = submissions.clone();
        move |_, _| {
            if submissions.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RelayerError::Unconfirmed {
                    chain_id: CORE,
                    tx_id: "0xslow".to_string(),
                })
            } else {
                Err(RelayerError::Rejected {
                    chain_id: CORE,
                    reason: "already executed".to_string(),
                })
            }
        }
    });
    core.expect_lookup()
        .returning(|_| Ok(TxLookup::Mined(executed("0xslow", 600_000, None))));
    let executor = relay.core_executor(core);
    executor.run_once().await.unwrap();
    executor.run_once().await.unwrap();

    assert_eq!(submissions.load(Ordering::SeqCst), 1);
    let job = relay.store.find(POLYGON, 20).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::AwaitingPayout);
    assert_eq!(job.core_tx_id.as_deref(), Some("0xslow"));

    let requests = Arc::new(ScriptedSource::new(CORE));
    requests.push(
        310,
        PayoutRequest {
            source_chain_id: POLYGON,
            source_nonce: 20,
            sequence: 88,
            call_type: 1,
            payout_chain_id: ARBITRUM,
            payout_address: "0x00000000000000000000000000000000000000b0".to_string(),
            block_number: 310,
            tx_id: "0xslow".to_string(),
        },
    );
    PayoutWatcher::new(
        CORE,
        "0x00000000000000000000000000000000000000c0".to_string(),
        0,
        requests,
        relay.store.clone(),
        Arc::new(attestations_available()),
        RetryPolicy::none(),
        TICK,
    )
    .run_once()
    .await
    .unwrap();
    assert_eq!(
        relay.store.find(POLYGON, 20).await.unwrap().unwrap().status,
        JobStatus::PayoutPending
    );
}

#[tokio::test]
async fn test_run_worker_stops_on_shutdown() {
    let relay = Relay::new();
    let source = Arc::new(ScriptedSource::new(POLYGON));
    source.push(101, relay_event(POLYGON, 1, 1, 0));
    let watcher: Arc<dyn Worker> = Arc::new(relay.watcher(source, attestations_available()));

    let shutdown = Shutdown::new();
    let handle = tokio::spawn(run_worker(watcher, shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.trigger().await;

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker should stop")
        .unwrap();
    assert!(relay.store.find(POLYGON, 1).await.unwrap().is_some());
}
