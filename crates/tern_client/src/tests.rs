mod coordinator_tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use tern_common::config::TxnClientConfig;
    use tern_common::error::{TxnError, TxnResult};
    use tern_common::types::{IsolationLevel, TabletId, TxnStatus};

    use crate::manager::TransactionManager;
    use crate::protocol::{ChildTransactionData, InvolvedTabletEntry};
    use crate::rpc::{
        AbortTransactionRequest, AbortTransactionResponse, RemoteTablet, TransactionService,
        UpdateTransactionRequest, UpdateTransactionResponse,
    };
    use crate::transaction::{InFlightOp, PreparedMetadata, TxnState, Waiter};

    const STATUS_TABLET: TabletId = TabletId(900);

    /// In-memory transaction service with programmable failures and full
    /// request logs.
    #[derive(Default)]
    struct MockService {
        pick_calls: AtomicUsize,
        pick_delay_ms: AtomicU64,
        pick_error: Mutex<Option<TxnError>>,
        update_log: Mutex<Vec<UpdateTransactionRequest>>,
        abort_log: Mutex<Vec<AbortTransactionRequest>>,
        created_failures: Mutex<VecDeque<TxnError>>,
        heartbeat_failures: Mutex<VecDeque<TxnError>>,
        commit_failures: Mutex<VecDeque<TxnError>>,
    }

    impl MockService {
        fn count_status(&self, status: TxnStatus) -> usize {
            self.update_log
                .lock()
                .iter()
                .filter(|req| req.state.status == status)
                .count()
        }

        fn committed_requests(&self) -> Vec<UpdateTransactionRequest> {
            self.update_log
                .lock()
                .iter()
                .filter(|req| req.state.status == TxnStatus::Committed)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl TransactionService for MockService {
        async fn pick_status_tablet(&self) -> TxnResult<TabletId> {
            self.pick_calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.pick_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if let Some(e) = self.pick_error.lock().take() {
                return Err(e);
            }
            Ok(STATUS_TABLET)
        }

        async fn lookup_tablet(&self, tablet_id: TabletId) -> TxnResult<RemoteTablet> {
            Ok(RemoteTablet {
                tablet_id,
                leader_addr: format!("ts-{}.tern.local:9100", tablet_id.0),
            })
        }

        async fn update_transaction(
            &self,
            _target: &RemoteTablet,
            req: UpdateTransactionRequest,
        ) -> TxnResult<UpdateTransactionResponse> {
            let failure = match req.state.status {
                TxnStatus::Created => self.created_failures.lock().pop_front(),
                TxnStatus::Pending => self.heartbeat_failures.lock().pop_front(),
                TxnStatus::Committed => self.commit_failures.lock().pop_front(),
                TxnStatus::Aborted => None,
            };
            let propagated = req.propagated_hybrid_time.add_micros(1);
            self.update_log.lock().push(req);
            match failure {
                Some(e) => Err(e),
                None => Ok(UpdateTransactionResponse {
                    propagated_hybrid_time: propagated,
                }),
            }
        }

        async fn abort_transaction(
            &self,
            _target: &RemoteTablet,
            req: AbortTransactionRequest,
        ) -> TxnResult<AbortTransactionResponse> {
            let propagated = req.propagated_hybrid_time.add_micros(1);
            self.abort_log.lock().push(req);
            Ok(AbortTransactionResponse {
                propagated_hybrid_time: Some(propagated),
            })
        }
    }

    fn setup_with_config(config: TxnClientConfig) -> (Arc<MockService>, Arc<TransactionManager>) {
        let service = Arc::new(MockService::default());
        let manager = TransactionManager::new(
            service.clone(),
            config,
            tokio::runtime::Handle::current(),
        );
        (service, manager)
    }

    fn setup() -> (Arc<MockService>, Arc<TransactionManager>) {
        setup_with_config(TxnClientConfig {
            heartbeat_interval_us: 20_000,
            ..Default::default()
        })
    }

    fn noop_waiter() -> Waiter {
        Box::new(|_| {})
    }

    async fn wait_until(limit_ms: u64, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_millis(limit_ms);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn succeeded_op(tablet_id: TabletId) -> InFlightOp {
        let mut op = InFlightOp::new(tablet_id);
        op.succeeded = true;
        op
    }

    // ── Readiness and locator ──

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_metadata_resolves_after_created_heartbeat() {
        let (service, manager) = setup();
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);

        let metadata = txn.metadata().await.unwrap();
        assert_eq!(metadata.transaction_id, txn.id());
        assert_eq!(metadata.status_tablet, Some(STATUS_TABLET));
        assert_eq!(service.count_status(TxnStatus::Created), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_tablet_requested_once() {
        let (service, manager) = setup();
        service.pick_delay_ms.store(50, Ordering::SeqCst);
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);

        assert!(txn.prepare(&[InFlightOp::new(TabletId(1))], noop_waiter()).is_none());
        assert!(txn.prepare(&[InFlightOp::new(TabletId(1))], noop_waiter()).is_none());
        txn.metadata().await.unwrap();

        assert_eq!(service.pick_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiters_fire_in_fifo_order() {
        let (service, manager) = setup();
        service.pick_delay_ms.store(100, Ordering::SeqCst);
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            let rejected = txn.prepare(
                &[InFlightOp::new(TabletId(1))],
                Box::new(move |status| {
                    status.unwrap();
                    order.lock().push(i);
                }),
            );
            assert!(rejected.is_none());
        }

        txn.metadata().await.unwrap();
        wait_until(1_000, || order.lock().len() == 5).await;
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pick_failure_fails_deferred_commit() {
        let (service, manager) = setup();
        *service.pick_error.lock() = Some(TxnError::Network("no status tablets".into()));
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);

        let err = txn.commit_future().await.unwrap_err();
        assert_eq!(err, TxnError::Network("no status tablets".into()));
        assert_eq!(txn.state(), TxnState::Aborted);
    }

    // ── Prepare / flushed wire-economy rule ──

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_tablet_commit() {
        let (service, manager) = setup();
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);

        let ops = [InFlightOp::new(TabletId(1))];
        let (tx, rx) = tokio::sync::oneshot::channel();
        let rejected = txn.prepare(
            &ops,
            Box::new(move |status| {
                let _ = tx.send(status);
            }),
        );
        assert!(rejected.is_none());
        rx.await.unwrap().unwrap();

        let prepared = txn.prepare(&ops, noop_waiter()).unwrap();
        match prepared {
            PreparedMetadata::Full(metadata) => {
                assert_eq!(metadata.transaction_id, txn.id());
                assert_eq!(metadata.status_tablet, Some(STATUS_TABLET));
            }
            other => panic!("expected full metadata, got {other:?}"),
        }

        txn.flushed(&[succeeded_op(TabletId(1))], Ok(()));
        txn.commit_future().await.unwrap();
        assert_eq!(txn.state(), TxnState::Committed);

        let commits = service.committed_requests();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].state.tablets, vec![TabletId(1)]);
        assert_eq!(commits[0].status_tablet_id, STATUS_TABLET);
        assert!(commits[0].propagated_hybrid_time.is_valid());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_metadata_is_full_until_flushed_then_id_only() {
        let (_service, manager) = setup();
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        txn.metadata().await.unwrap();

        let ops = [InFlightOp::new(TabletId(1))];
        assert!(matches!(
            txn.prepare(&ops, noop_waiter()).unwrap(),
            PreparedMetadata::Full(_)
        ));
        // Not flushed yet: the tablet still lacks parameters.
        assert!(matches!(
            txn.prepare(&ops, noop_waiter()).unwrap(),
            PreparedMetadata::Full(_)
        ));

        txn.flushed(&[succeeded_op(TabletId(1))], Ok(()));
        assert_eq!(
            txn.prepare(&ops, noop_waiter()).unwrap(),
            PreparedMetadata::IdOnly(txn.id())
        );

        // A new tablet brings back the full parameter set.
        let mixed = [InFlightOp::new(TabletId(1)), InFlightOp::new(TabletId(2))];
        assert!(matches!(
            txn.prepare(&mixed, noop_waiter()).unwrap(),
            PreparedMetadata::Full(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flushed_failure_does_not_mark_parameters() {
        let (_service, manager) = setup();
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        txn.metadata().await.unwrap();

        let ops = [InFlightOp::new(TabletId(1))];
        txn.prepare(&ops, noop_waiter()).unwrap();
        // Batch status ok, but the op itself failed: no parameter flip.
        txn.flushed(&[InFlightOp::new(TabletId(1))], Ok(()));
        assert!(matches!(
            txn.prepare(&ops, noop_waiter()).unwrap(),
            PreparedMetadata::Full(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flushed_try_again_aborts_transaction() {
        let (_service, manager) = setup();
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        txn.metadata().await.unwrap();

        txn.prepare(&[InFlightOp::new(TabletId(1))], noop_waiter())
            .unwrap();
        txn.flushed(
            &[InFlightOp::new(TabletId(1))],
            Err(TxnError::try_again("write conflict")),
        );

        assert_eq!(txn.state(), TxnState::Aborted);
        let err = txn.commit_future().await.unwrap_err();
        assert_eq!(err, TxnError::try_again("write conflict"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flushed_other_errors_are_ignored() {
        let (_service, manager) = setup();
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        txn.metadata().await.unwrap();

        txn.prepare(&[InFlightOp::new(TabletId(1))], noop_waiter())
            .unwrap();
        txn.flushed(
            &[InFlightOp::new(TabletId(1))],
            Err(TxnError::Network("broken pipe".into())),
        );
        assert_eq!(txn.state(), TxnState::Running);
    }

    // ── Commit / abort ──

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_only_commit_sends_no_commit_rpc() {
        let (service, manager) = setup();
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);

        txn.commit_future().await.unwrap();
        assert_eq!(txn.state(), TxnState::Committed);
        assert_eq!(service.count_status(TxnStatus::Committed), 0);
        // The status record is cleaned up through an abort instead.
        wait_until(1_000, || !service.abort_log.lock().is_empty()).await;
        assert_eq!(service.abort_log.lock()[0].transaction_id, txn.id());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_commit_failure_reaches_callback() {
        let (service, manager) = setup();
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        txn.metadata().await.unwrap();

        txn.prepare(&[InFlightOp::new(TabletId(1))], noop_waiter())
            .unwrap();
        service
            .commit_failures
            .lock()
            .push_back(TxnError::TimedOut("commit".into()));

        let err = txn.commit_future().await.unwrap_err();
        assert_eq!(err, TxnError::TimedOut("commit".into()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_commit_reports_completion_error() {
        let (_service, manager) = setup();
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        txn.commit_future().await.unwrap();

        let err = txn.commit_future().await.unwrap_err();
        assert!(matches!(err, TxnError::IllegalState(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abort_is_idempotent_and_stops_heartbeat() {
        let (service, manager) = setup();
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        txn.metadata().await.unwrap();

        txn.abort();
        assert_eq!(txn.state(), TxnState::Aborted);
        txn.abort();

        wait_until(1_000, || !service.abort_log.lock().is_empty()).await;
        assert_eq!(service.abort_log.lock().len(), 1);

        // Heartbeats stop once the transaction left Running.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pending_before = service.count_status(TxnStatus::Pending);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(service.count_status(TxnStatus::Pending), pending_before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_commit_after_abort_returns_error() {
        let (_service, manager) = setup();
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        txn.metadata().await.unwrap();

        txn.abort();
        let err = txn.commit_future().await.unwrap_err();
        assert!(matches!(err, TxnError::IllegalState(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_deferred_commit_runs_after_readiness() {
        let (service, manager) = setup();
        service.pick_delay_ms.store(50, Ordering::SeqCst);
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);

        // Involve a tablet first so the commit actually sends an RPC; the
        // prepare is rejected and replayed through its waiter.
        let ops = [InFlightOp::new(TabletId(3))];
        let (tx, rx) = tokio::sync::oneshot::channel();
        assert!(txn
            .prepare(
                &ops,
                Box::new(move |status| {
                    let _ = tx.send(status);
                })
            )
            .is_none());
        rx.await.unwrap().unwrap();
        txn.prepare(&ops, noop_waiter()).unwrap();
        txn.flushed(&[succeeded_op(TabletId(3))], Ok(()));

        txn.commit_future().await.unwrap();
        let commits = service.committed_requests();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].state.tablets, vec![TabletId(3)]);
    }

    // ── Restart handling ──

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_required_blocks_commit() {
        let (service, manager) = setup();
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        txn.metadata().await.unwrap();

        let limit = {
            let point = txn.read_point();
            point.read_time().unwrap().add_micros(25)
        };
        txn.read_point().restart_at(TabletId(1), limit);
        assert!(txn.is_restart_required());

        let err = txn.commit_future().await.unwrap_err();
        assert!(matches!(err, TxnError::IllegalState(_)));
        // The failed commit does not complete the transaction.
        assert_eq!(txn.state(), TxnState::Running);

        let restarted = txn.create_restarted_transaction().unwrap();
        assert_ne!(restarted.id(), txn.id());
        assert!(!restarted.is_restart_required());
        assert_eq!(txn.state(), TxnState::Aborted);
        wait_until(1_000, || !service.abort_log.lock().is_empty()).await;
        assert_eq!(service.abort_log.lock()[0].transaction_id, txn.id());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_of_completed_transaction_fails() {
        let (_service, manager) = setup();
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        txn.commit_future().await.unwrap();

        assert!(txn.create_restarted_transaction().is_err());
    }

    // ── Child protocol ──

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_child_round_trip() {
        let (service, manager) = setup();
        let parent = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        parent.metadata().await.unwrap();

        parent
            .prepare(&[InFlightOp::new(TabletId(1))], noop_waiter())
            .unwrap();
        parent.flushed(&[succeeded_op(TabletId(1))], Ok(()));

        let data = parent.prepare_child_future().await.unwrap();
        assert_eq!(data.metadata.transaction_id, parent.id());
        assert_eq!(data.metadata.status_tablet, Some(STATUS_TABLET));
        assert_eq!(data.read_time, parent.read_point().read_time());

        // Ship the descriptor through its wire form, as a peer process would
        // receive it.
        let child = manager
            .begin_child_transaction(ChildTransactionData::from_wire(&data.to_wire().unwrap()).unwrap());
        assert!(child.is_child());
        assert_eq!(child.id(), parent.id());

        let prepared = child
            .prepare(&[InFlightOp::new(TabletId(2))], noop_waiter())
            .unwrap();
        assert!(matches!(prepared, PreparedMetadata::Full(_)));
        child.flushed(&[succeeded_op(TabletId(2))], Ok(()));

        let result = child.finish_child().unwrap();
        assert_eq!(child.state(), TxnState::Committed);
        assert_eq!(
            result.tablets,
            vec![InvolvedTabletEntry {
                tablet_id: TabletId(2),
                has_parameters: true,
            }]
        );

        parent.apply_child_result(&result).unwrap();
        parent.commit_future().await.unwrap();

        let commits = service.committed_requests();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].state.tablets, vec![TabletId(1), TabletId(2)]);
        // The child itself produced no status traffic.
        assert_eq!(service.count_status(TxnStatus::Created), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_commit_of_child_is_refused() {
        let (_service, manager) = setup();
        let parent = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        parent.metadata().await.unwrap();
        let data = parent.prepare_child_future().await.unwrap();
        let child = manager.begin_child_transaction(data);

        let err = child.commit_future().await.unwrap_err();
        assert!(matches!(err, TxnError::IllegalState(_)));
        assert_eq!(child.state(), TxnState::Running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_finish_child_on_parent_is_refused() {
        let (_service, manager) = setup();
        let parent = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        parent.metadata().await.unwrap();
        assert!(parent.finish_child().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_apply_child_result_on_child_is_refused() {
        let (_service, manager) = setup();
        let parent = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        parent.metadata().await.unwrap();
        let data = parent.prepare_child_future().await.unwrap();
        let child = manager.begin_child_transaction(data);

        assert!(child.apply_child_result(&Default::default()).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_prepare_child_with_restart_required_is_refused() {
        let (_service, manager) = setup();
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        txn.metadata().await.unwrap();

        let limit = txn.read_point().read_time().unwrap().add_micros(5);
        txn.read_point().restart_at(TabletId(1), limit);

        let err = txn.prepare_child_future().await.unwrap_err();
        assert!(matches!(err, TxnError::IllegalState(_)));
    }

    // ── Heartbeat behavior ──

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_heartbeat_keeps_running_transaction_pending() {
        let (service, manager) = setup();
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        txn.metadata().await.unwrap();

        wait_until(2_000, || service.count_status(TxnStatus::Pending) >= 3).await;
        assert_eq!(txn.state(), TxnState::Running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_heartbeat_retries_on_transient_failure() {
        let (service, manager) = setup();
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        txn.metadata().await.unwrap();

        service
            .heartbeat_failures
            .lock()
            .push_back(TxnError::Network("connection reset".into()));

        wait_until(2_000, || service.count_status(TxnStatus::Pending) >= 3).await;
        assert_eq!(txn.state(), TxnState::Running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_heartbeat_expiry_surfaces_on_commit() {
        let (service, manager) = setup();
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        txn.metadata().await.unwrap();

        service.heartbeat_failures.lock().push_back(TxnError::Expired);
        wait_until(2_000, || txn.state() == TxnState::Aborted).await;

        let err = txn.commit_future().await.unwrap_err();
        assert_eq!(err, TxnError::Expired);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disable_heartbeat_in_tests_short_circuits_pending() {
        let (service, manager) = setup_with_config(TxnClientConfig {
            heartbeat_interval_us: 5_000,
            disable_heartbeat_in_tests: true,
            ..Default::default()
        });
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        txn.metadata().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(service.count_status(TxnStatus::Created), 1);
        assert_eq!(service.count_status(TxnStatus::Pending), 0);
        assert_eq!(txn.state(), TxnState::Running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_during_heartbeat_cancels_in_flight_rpcs() {
        let (_service, manager) = setup_with_config(TxnClientConfig {
            heartbeat_interval_us: 2_000,
            ..Default::default()
        });
        let txn = manager.begin_transaction(IsolationLevel::SnapshotIsolation);
        txn.metadata().await.unwrap();

        drop(txn);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.rpcs().in_flight(), 0);
    }
}
