//! The client-side transaction state machine.
//!
//! A [`DistributedTransaction`] is a cloneable handle over the shared inner
//! state. User calls and RPC completions arrive on unrelated threads; all
//! mutable state is guarded by a single per-transaction mutex, with the
//! lifecycle state additionally exposed through an atomic so heartbeats can
//! self-cancel without contending with user traffic. Callbacks and waiters
//! are always invoked after the lock is released.
//!
//! Until the first CREATED heartbeat round-trip succeeds, user-originated
//! commit / abort / prepare-child / prepare calls are parked on a waiter
//! queue and replayed in FIFO order once the transaction becomes ready.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tokio::sync::oneshot;

use tern_common::error::{TxnError, TxnResult};
use tern_common::types::{
    HybridTime, IsolationLevel, TabletId, TransactionMetadata, TxnId, TxnStatus,
};

use crate::manager::TransactionManager;
use crate::protocol::{ChildTransactionData, ChildTransactionResult, InvolvedTabletEntry};
use crate::read_point::ConsistentReadPoint;
use crate::rpc::{
    with_deadline, AbortTransactionRequest, AbortTransactionResponse, RemoteTablet, RpcHandle,
    TxnStatePayload, UpdateTransactionRequest, UpdateTransactionResponse,
};

/// Deferred user callback waiting for readiness or a terminal transition.
pub type Waiter = Box<dyn FnOnce(TxnResult<()>) + Send>;

pub type CommitCallback = Box<dyn FnOnce(TxnResult<()>) + Send>;

pub type PrepareChildCallback = Box<dyn FnOnce(TxnResult<ChildTransactionData>) + Send>;

/// Lifecycle state. Transitions are one-way from `Running`; `Committed` and
/// `Aborted` are terminal.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Running = 0,
    Committed = 1,
    Aborted = 2,
}

struct AtomicTxnState(AtomicU8);

impl AtomicTxnState {
    fn new(state: TxnState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> TxnState {
        match self.0.load(Ordering::Acquire) {
            0 => TxnState::Running,
            1 => TxnState::Committed,
            _ => TxnState::Aborted,
        }
    }

    fn store(&self, state: TxnState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Upstream view of one buffered operation: which tablet it targets and
/// whether the server reported success for it.
#[derive(Debug, Clone, Copy)]
pub struct InFlightOp {
    pub tablet_id: TabletId,
    pub succeeded: bool,
}

impl InFlightOp {
    pub fn new(tablet_id: TabletId) -> Self {
        Self {
            tablet_id,
            succeeded: false,
        }
    }
}

/// What `prepare` hands back to the batcher. A tablet needs the full
/// parameter set only the first time it sees this transaction; afterwards
/// the id alone is enough.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedMetadata {
    Full(TransactionMetadata),
    IdOnly(TxnId),
}

/// Per-tablet registration state. `has_parameters` flips true once the
/// server holding that tablet has been told the full transaction metadata.
#[derive(Debug, Clone, Copy, Default)]
struct TabletState {
    has_parameters: bool,
}

struct MutableState {
    metadata: TransactionMetadata,
    read_point: ConsistentReadPoint,
    status_tablet: Option<RemoteTablet>,
    /// Flips true after the first successful CREATED heartbeat.
    ready: bool,
    /// Write-once: the first error wins and forces `Aborted`.
    error: Option<TxnError>,
    commit_callback: Option<CommitCallback>,
    waiters: Vec<Waiter>,
    tablets: HashMap<TabletId, TabletState>,
    heartbeat_handle: RpcHandle,
    commit_handle: RpcHandle,
    abort_handle: RpcHandle,
}

struct TransactionInner {
    manager: Arc<TransactionManager>,
    id: TxnId,
    child: bool,
    requested_status_tablet: AtomicBool,
    state: AtomicTxnState,
    mutable: Mutex<MutableState>,
}

/// Handle to a single distributed transaction. Cheap to clone; the
/// transaction lives until the last handle (and any in-flight commit or
/// abort RPC) is gone, at which point outstanding RPC tasks are cancelled.
#[derive(Clone)]
pub struct DistributedTransaction {
    inner: Arc<TransactionInner>,
}

impl DistributedTransaction {
    /// Start a new top-level transaction. Under snapshot isolation the read
    /// time is captured immediately; every other level reads at current
    /// clock time.
    pub fn new(manager: Arc<TransactionManager>, isolation: IsolationLevel) -> Self {
        let mut read_point = ConsistentReadPoint::new(manager.clock().clone());
        let metadata = if isolation == IsolationLevel::SnapshotIsolation {
            read_point.set_current_read_time();
            TransactionMetadata::new(
                isolation,
                read_point.read_time().unwrap_or(HybridTime::INVALID),
            )
        } else {
            TransactionMetadata::new(isolation, manager.now())
        };
        let txn = Self::from_parts(manager, metadata, read_point, false, false);
        tracing::debug!(txn = %txn.inner.id, "transaction started");
        txn
    }

    /// Start a child transaction from a descriptor exported by a parent.
    /// Children are born ready: they inherit the parent's identity and read
    /// point and never run the locator or heartbeat.
    pub fn new_child(manager: Arc<TransactionManager>, data: ChildTransactionData) -> Self {
        let mut read_point = ConsistentReadPoint::new(manager.clock().clone());
        read_point.set_read_time(data.read_time, data.local_limits);
        let txn = Self::from_parts(manager, data.metadata, read_point, true, true);
        tracing::debug!(txn = %txn.inner.id, "child transaction started");
        txn
    }

    fn from_parts(
        manager: Arc<TransactionManager>,
        metadata: TransactionMetadata,
        read_point: ConsistentReadPoint,
        child: bool,
        ready: bool,
    ) -> Self {
        let id = metadata.transaction_id;
        let invalid = manager.rpcs().invalid_handle();
        Self {
            inner: Arc::new(TransactionInner {
                manager,
                id,
                child,
                requested_status_tablet: AtomicBool::new(false),
                state: AtomicTxnState::new(TxnState::Running),
                mutable: Mutex::new(MutableState {
                    metadata,
                    read_point,
                    status_tablet: None,
                    ready,
                    error: None,
                    commit_callback: None,
                    waiters: Vec::new(),
                    tablets: HashMap::new(),
                    heartbeat_handle: invalid,
                    commit_handle: invalid,
                    abort_handle: invalid,
                }),
            }),
        }
    }

    pub fn id(&self) -> TxnId {
        self.inner.id
    }

    pub fn state(&self) -> TxnState {
        self.inner.state.load()
    }

    pub fn is_child(&self) -> bool {
        self.inner.child
    }

    pub fn is_restart_required(&self) -> bool {
        self.inner.mutable.lock().read_point.is_restart_required()
    }

    /// Access the consistent read point. The guard holds the transaction
    /// lock; do not call back into the transaction while holding it.
    pub fn read_point(&self) -> MappedMutexGuard<'_, ConsistentReadPoint> {
        MutexGuard::map(self.inner.mutable.lock(), |s| &mut s.read_point)
    }

    /// Register the tablets of an operation batch.
    ///
    /// Returns `None` when the transaction is not ready yet; `waiter` then
    /// fires once readiness (or a failure) is decided and the caller
    /// re-issues. Otherwise returns the metadata the batch must carry: full
    /// parameters if any involved tablet has not received them yet, id-only
    /// otherwise.
    pub fn prepare(&self, ops: &[InFlightOp], waiter: Waiter) -> Option<PreparedMetadata> {
        let inner = &self.inner;
        let mut has_tablets_without_parameters = false;
        {
            let mut s = inner.mutable.lock();
            if !s.ready {
                s.waiters.push(waiter);
                drop(s);
                inner.request_status_tablet();
                tracing::trace!(txn = %inner.id, "prepare rejected, transaction not ready");
                return None;
            }

            for op in ops {
                match s.tablets.entry(op.tablet_id) {
                    Entry::Vacant(e) => {
                        e.insert(TabletState::default());
                        has_tablets_without_parameters = true;
                    }
                    Entry::Occupied(e) => {
                        if !has_tablets_without_parameters {
                            has_tablets_without_parameters = !e.get().has_parameters;
                        }
                    }
                }
            }

            if has_tablets_without_parameters {
                Some(PreparedMetadata::Full(s.metadata.clone()))
            } else {
                Some(PreparedMetadata::IdOnly(s.metadata.transaction_id))
            }
        }
    }

    /// Batch completion notification from the upstream flush path.
    ///
    /// On success, tablets whose operations the server acknowledged are
    /// marked as holding the transaction's parameters. A retryable batch
    /// status aborts the transaction through the error slot; every other
    /// failure is reported through the operations themselves and ignored
    /// here.
    pub fn flushed(&self, ops: &[InFlightOp], status: TxnResult<()>) {
        match status {
            Ok(()) => {
                let mut s = self.inner.mutable.lock();
                for op in ops {
                    if !op.succeeded {
                        continue;
                    }
                    match s.tablets.get_mut(&op.tablet_id) {
                        Some(tablet) => tablet.has_parameters = true,
                        None => {
                            debug_assert!(false, "flushed op for unprepared tablet");
                            tracing::error!(
                                txn = %self.inner.id,
                                tablet = %op.tablet_id,
                                "flushed op for tablet that was never prepared",
                            );
                        }
                    }
                }
            }
            Err(e) if e.is_try_again() => self.inner.set_error(e),
            Err(_) => {}
        }
    }

    /// Commit the transaction. The callback fires exactly once, off the
    /// transaction lock. Commit of a child or of a transaction that
    /// requires restart is refused. A transaction with no involved tablets
    /// terminates locally: no commit RPC is sent and the callback reports
    /// success.
    pub fn commit(&self, callback: CommitCallback) {
        let inner = self.inner.clone();
        {
            let mut s = inner.mutable.lock();
            if let Err(e) = inner.check_running(&s) {
                drop(s);
                callback(Err(e));
                return;
            }
            if inner.child {
                drop(s);
                callback(Err(TxnError::illegal_state(
                    "commit of child transaction is not allowed",
                )));
                return;
            }
            if s.read_point.is_restart_required() {
                drop(s);
                callback(Err(TxnError::illegal_state(
                    "commit of transaction that requires restart is not allowed",
                )));
                return;
            }
            inner.state.store(TxnState::Committed);
            s.commit_callback = Some(callback);
            if !s.ready {
                let deferred = inner.clone();
                s.waiters.push(Box::new(move |status| deferred.do_commit(status)));
                drop(s);
                inner.request_status_tablet();
                return;
            }
        }
        inner.do_commit(Ok(()));
    }

    /// Future-shaped commit. The commit is initiated immediately.
    pub fn commit_future(&self) -> impl Future<Output = TxnResult<()>> + Send {
        let (tx, rx) = oneshot::channel();
        self.commit(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        async move {
            rx.await.unwrap_or_else(|_| {
                Err(TxnError::illegal_state(
                    "transaction dropped before commit completed",
                ))
            })
        }
    }

    /// Abort the transaction. A second abort is a no-op; abort of a
    /// committed transaction or of a child is API misuse and is logged and
    /// ignored. Abort RPC failures are not reported: the heartbeat has
    /// already stopped, so the status tablet will time the transaction out.
    pub fn abort(&self) {
        let inner = self.inner.clone();
        {
            let mut s = inner.mutable.lock();
            let state = inner.state.load();
            if state != TxnState::Running {
                if state != TxnState::Aborted {
                    tracing::error!(txn = %inner.id, "abort of committed transaction");
                }
                return;
            }
            if inner.child {
                tracing::error!(txn = %inner.id, "abort of child transaction");
                return;
            }
            inner.state.store(TxnState::Aborted);
            if !s.ready {
                let deferred = inner.clone();
                s.waiters.push(Box::new(move |status| deferred.do_abort(status)));
                drop(s);
                inner.request_status_tablet();
                return;
            }
        }
        inner.do_abort(Ok(()));
    }

    /// Export a descriptor for a child transaction to run in a peer
    /// process. Refused when the transaction is not running or its read
    /// point is tainted by a pending restart.
    pub fn prepare_child(&self, callback: PrepareChildCallback) {
        let inner = self.inner.clone();
        let mut s = inner.mutable.lock();
        if let Err(e) = inner.check_running(&s) {
            drop(s);
            callback(Err(e));
            return;
        }
        if s.read_point.is_restart_required() {
            drop(s);
            callback(Err(TxnError::illegal_state(
                "prepare child of transaction that requires restart is not allowed",
            )));
            return;
        }
        if !s.ready {
            let deferred = inner.clone();
            s.waiters
                .push(Box::new(move |status| deferred.do_prepare_child(status, callback)));
            drop(s);
            inner.request_status_tablet();
            return;
        }
        let data = inner.child_data(&s);
        drop(s);
        callback(Ok(data));
    }

    /// Future-shaped `prepare_child`.
    pub fn prepare_child_future(&self) -> impl Future<Output = TxnResult<ChildTransactionData>> + Send {
        let (tx, rx) = oneshot::channel();
        self.prepare_child(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        async move {
            rx.await.unwrap_or_else(|_| {
                Err(TxnError::illegal_state(
                    "transaction dropped before child preparation completed",
                ))
            })
        }
    }

    /// Finish a child transaction: no network traffic, the child life is
    /// purely logical. Returns the involved tablets and read-limit updates
    /// for the parent to merge, and transitions the child to `Committed`.
    pub fn finish_child(&self) -> TxnResult<ChildTransactionResult> {
        let inner = &self.inner;
        let s = inner.mutable.lock();
        inner.check_running(&s)?;
        if !inner.child {
            return Err(TxnError::illegal_state(
                "finish child of non-child transaction",
            ));
        }
        inner.state.store(TxnState::Committed);
        let mut tablets: Vec<InvolvedTabletEntry> = s
            .tablets
            .iter()
            .map(|(&tablet_id, state)| InvolvedTabletEntry {
                tablet_id,
                has_parameters: state.has_parameters,
            })
            .collect();
        tablets.sort_by_key(|entry| entry.tablet_id);
        let mut result = ChildTransactionResult {
            tablets,
            ..Default::default()
        };
        s.read_point.finish_child_result(&mut result);
        Ok(result)
    }

    /// Merge a finished child's involved tablets and read-limit updates
    /// into this (parent) transaction.
    pub fn apply_child_result(&self, result: &ChildTransactionResult) -> TxnResult<()> {
        let inner = &self.inner;
        let mut s = inner.mutable.lock();
        inner.check_running(&s)?;
        if inner.child {
            return Err(TxnError::illegal_state(
                "apply child result of child transaction",
            ));
        }
        for entry in &result.tablets {
            let tablet = s.tablets.entry(entry.tablet_id).or_default();
            tablet.has_parameters |= entry.has_parameters;
        }
        s.read_point.apply_child_result(result);
        Ok(())
    }

    /// Build a fresh transaction carrying this transaction's restarted read
    /// point, and abort this one. The read point is moved: after a restart
    /// the original must not be queried.
    pub fn create_restarted_transaction(&self) -> TxnResult<DistributedTransaction> {
        let isolation = self.inner.mutable.lock().metadata.isolation;
        let successor = DistributedTransaction::new(self.inner.manager.clone(), isolation);
        self.inner.setup_restart(&successor.inner)?;
        Ok(successor)
    }

    /// Full metadata of this transaction, resolved once the status tablet
    /// is assigned and the transaction is ready.
    pub async fn metadata(&self) -> TxnResult<TransactionMetadata> {
        let inner = self.inner.clone();
        let rx = {
            let mut s = inner.mutable.lock();
            if s.ready {
                return Ok(s.metadata.clone());
            }
            let (tx, rx) = oneshot::channel();
            let for_waiter = inner.clone();
            s.waiters.push(Box::new(move |status| {
                let result = status.map(|()| for_waiter.mutable.lock().metadata.clone());
                let _ = tx.send(result);
            }));
            rx
        };
        inner.request_status_tablet();
        rx.await.unwrap_or_else(|_| {
            Err(TxnError::illegal_state(
                "transaction dropped before metadata resolved",
            ))
        })
    }
}

impl TransactionInner {
    /// Pre-check shared by every user entry point: the transaction must
    /// still be running, otherwise the retained error (or a generic
    /// completion error) is returned.
    fn check_running(&self, s: &MutableState) -> TxnResult<()> {
        if self.state.load() != TxnState::Running {
            return Err(match &s.error {
                Some(e) => e.clone(),
                None => TxnError::illegal_state("transaction already completed"),
            });
        }
        Ok(())
    }

    /// Record the first error, force `Aborted`, and fail every parked
    /// waiter so deferred commits and aborts observe the failure.
    fn set_error(self: &Arc<Self>, error: TxnError) {
        let waiters;
        {
            let mut s = self.mutable.lock();
            if s.error.is_some() {
                return;
            }
            tracing::debug!(txn = %self.id, error = %error, "transaction failed");
            s.error = Some(error.clone());
            self.state.store(TxnState::Aborted);
            waiters = mem::take(&mut s.waiters);
        }
        for waiter in waiters {
            waiter(Err(error.clone()));
        }
    }

    /// Single-shot trigger of the status-tablet locator.
    fn request_status_tablet(self: &Arc<Self>) {
        if self
            .requested_status_tablet
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let weak = Arc::downgrade(self);
        let manager = self.manager.clone();
        let service = manager.service().clone();
        let deadline = manager.rpc_deadline();
        self.manager.spawn(async move {
            let picked =
                with_deadline(deadline, "pick status tablet", manager.pick_status_tablet()).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let tablet_id = match picked {
                Ok(tablet_id) => tablet_id,
                Err(e) => {
                    inner.set_error(e);
                    return;
                }
            };
            tracing::debug!(txn = %inner.id, status_tablet = %tablet_id, "picked status tablet");
            let resolved =
                with_deadline(deadline, "lookup status tablet", service.lookup_tablet(tablet_id))
                    .await;
            match resolved {
                Ok(remote) => inner.lookup_tablet_done(remote),
                Err(e) => inner.set_error(e),
            }
        });
    }

    fn lookup_tablet_done(self: &Arc<Self>, remote: RemoteTablet) {
        {
            let mut s = self.mutable.lock();
            s.metadata.status_tablet = Some(remote.tablet_id);
            s.status_tablet = Some(remote);
        }
        Self::send_heartbeat(TxnStatus::Created, Arc::downgrade(self));
    }

    /// Send one status update to the status tablet. Holds only a weak
    /// back-reference: a heartbeat never prolongs the transaction's life,
    /// and a destroyed transaction silently ends the chain.
    ///
    /// The CREATED update proceeds even when a deferred commit or abort has
    /// already moved the lifecycle state off `Running`: readiness must still
    /// be reached so the deferred action can run. PENDING updates stop as
    /// soon as the transaction leaves `Running`.
    fn send_heartbeat(status: TxnStatus, weak: Weak<TransactionInner>) {
        let Some(inner) = weak.upgrade() else {
            return;
        };

        if status != TxnStatus::Created {
            if inner.state.load() != TxnState::Running {
                return;
            }
            if inner.manager.config().disable_heartbeat_in_tests {
                inner.heartbeat_done(
                    Ok(UpdateTransactionResponse {
                        propagated_hybrid_time: HybridTime::INVALID,
                    }),
                    status,
                );
                return;
            }
        }

        let manager = inner.manager.clone();
        let service = manager.service().clone();
        let deadline = manager.rpc_deadline();
        let mut s = inner.mutable.lock();
        if status == TxnStatus::Created && (s.error.is_some() || s.ready) {
            return;
        }
        let Some(target) = s.status_tablet.clone() else {
            tracing::warn!(txn = %inner.id, "heartbeat without a resolved status tablet");
            return;
        };
        let req = UpdateTransactionRequest {
            status_tablet_id: target.tablet_id,
            propagated_hybrid_time: manager.now(),
            state: TxnStatePayload {
                transaction_id: inner.id,
                status,
                tablets: Vec::new(),
            },
        };
        let weak_done = weak.clone();
        s.heartbeat_handle = manager.rpcs().register_and_start(async move {
            let resp =
                with_deadline(deadline, "heartbeat", service.update_transaction(&target, req))
                    .await;
            if let Some(inner) = weak_done.upgrade() {
                inner.heartbeat_done(resp, status);
            }
        });
    }

    fn heartbeat_done(
        self: &Arc<Self>,
        resp: TxnResult<UpdateTransactionResponse>,
        sent_status: TxnStatus,
    ) {
        {
            let mut s = self.mutable.lock();
            let handle = mem::replace(&mut s.heartbeat_handle, RpcHandle::INVALID);
            self.manager.rpcs().unregister(handle);
        }

        match resp {
            Ok(resp) => {
                self.manager.update_clock(resp.propagated_hybrid_time);
                if sent_status == TxnStatus::Created {
                    let waiters;
                    {
                        let mut s = self.mutable.lock();
                        debug_assert!(!s.ready);
                        s.ready = true;
                        waiters = mem::take(&mut s.waiters);
                    }
                    tracing::debug!(
                        txn = %self.id,
                        waiters = waiters.len(),
                        "transaction ready, notifying waiters",
                    );
                    for waiter in waiters {
                        waiter(Ok(()));
                    }
                }
                let weak = Arc::downgrade(self);
                self.manager
                    .schedule(self.manager.config().heartbeat_interval(), async move {
                        TransactionInner::send_heartbeat(TxnStatus::Pending, weak);
                    });
            }
            Err(e) => {
                tracing::warn!(txn = %self.id, error = %e, "send heartbeat failed");
                if e.is_expired() {
                    self.set_error(e);
                    return;
                }
                // Other failures have assorted causes; retry with the same
                // status immediately.
                Self::send_heartbeat(sent_status, Arc::downgrade(self));
            }
        }
    }

    fn do_commit(self: &Arc<Self>, status: TxnResult<()>) {
        if let Err(e) = status {
            self.complete_commit(Err(e));
            return;
        }

        let mut s = self.mutable.lock();
        tracing::debug!(txn = %self.id, tablets = s.tablets.len(), "committing");

        // No involved tablets means the transaction has no writes: abort the
        // status record, but report success so the read-only case is
        // transparent to the caller.
        if s.tablets.is_empty() {
            drop(s);
            self.do_abort(Ok(()));
            self.complete_commit(Ok(()));
            return;
        }

        let Some(target) = s.status_tablet.clone() else {
            drop(s);
            self.complete_commit(Err(TxnError::illegal_state(
                "commit without a resolved status tablet",
            )));
            return;
        };
        let mut tablets: Vec<TabletId> = s.tablets.keys().copied().collect();
        tablets.sort();
        let req = UpdateTransactionRequest {
            status_tablet_id: target.tablet_id,
            propagated_hybrid_time: self.manager.now(),
            state: TxnStatePayload {
                transaction_id: self.id,
                status: TxnStatus::Committed,
                tablets,
            },
        };
        let me = self.clone();
        let service = self.manager.service().clone();
        let deadline = self.manager.rpc_deadline();
        s.commit_handle = self.manager.rpcs().register_and_start(async move {
            let resp =
                with_deadline(deadline, "commit", service.update_transaction(&target, req)).await;
            me.commit_done(resp);
        });
    }

    fn commit_done(self: &Arc<Self>, resp: TxnResult<UpdateTransactionResponse>) {
        {
            let mut s = self.mutable.lock();
            let handle = mem::replace(&mut s.commit_handle, RpcHandle::INVALID);
            self.manager.rpcs().unregister(handle);
        }
        let result = match resp {
            Ok(resp) => {
                self.manager.update_clock(resp.propagated_hybrid_time);
                Ok(())
            }
            Err(e) => Err(e),
        };
        tracing::debug!(txn = %self.id, ok = result.is_ok(), "commit finished");
        self.complete_commit(result);
    }

    fn complete_commit(&self, result: TxnResult<()>) {
        let callback = self.mutable.lock().commit_callback.take();
        match callback {
            Some(callback) => callback(result),
            None => tracing::debug!(txn = %self.id, "commit completion without a callback"),
        }
    }

    fn do_abort(self: &Arc<Self>, status: TxnResult<()>) {
        if let Err(e) = status {
            // Heartbeats have already stopped, so the status tablet will
            // time the transaction out regardless.
            tracing::warn!(txn = %self.id, error = %e, "failed to abort transaction");
            return;
        }

        let mut s = self.mutable.lock();
        let Some(target) = s.status_tablet.clone() else {
            tracing::debug!(txn = %self.id, "abort without a resolved status tablet");
            return;
        };
        let req = AbortTransactionRequest {
            status_tablet_id: target.tablet_id,
            propagated_hybrid_time: self.manager.now(),
            transaction_id: self.id,
        };
        let me = self.clone();
        let service = self.manager.service().clone();
        let deadline = self.manager.rpc_deadline();
        s.abort_handle = self.manager.rpcs().register_and_start(async move {
            let resp =
                with_deadline(deadline, "abort", service.abort_transaction(&target, req)).await;
            me.abort_done(resp);
        });
    }

    fn abort_done(self: &Arc<Self>, resp: TxnResult<AbortTransactionResponse>) {
        match resp {
            Ok(resp) => {
                if let Some(ht) = resp.propagated_hybrid_time {
                    self.manager.update_clock(ht);
                }
                tracing::debug!(txn = %self.id, "aborted");
            }
            Err(e) => tracing::warn!(txn = %self.id, error = %e, "abort rpc failed"),
        }
        let mut s = self.mutable.lock();
        let handle = mem::replace(&mut s.abort_handle, RpcHandle::INVALID);
        self.manager.rpcs().unregister(handle);
    }

    fn do_prepare_child(self: &Arc<Self>, status: TxnResult<()>, callback: PrepareChildCallback) {
        if let Err(e) = status {
            callback(Err(e));
            return;
        }
        let s = self.mutable.lock();
        let data = self.child_data(&s);
        drop(s);
        callback(Ok(data));
    }

    fn child_data(&self, s: &MutableState) -> ChildTransactionData {
        let mut data = ChildTransactionData {
            metadata: s.metadata.clone(),
            read_time: None,
            local_limits: HashMap::new(),
        };
        s.read_point.prepare_child_data(&mut data);
        data
    }

    /// Move this transaction's read point into `successor` (restarted) and
    /// abort this transaction.
    fn setup_restart(self: &Arc<Self>, successor: &Arc<TransactionInner>) -> TxnResult<()> {
        {
            let mut s = self.mutable.lock();
            if self.state.load() != TxnState::Running {
                tracing::error!(txn = %self.id, "restart of completed transaction");
                return Err(TxnError::illegal_state("restart of completed transaction"));
            }
            debug_assert!(s.read_point.is_restart_required());
            tracing::debug!(txn = %self.id, successor = %successor.id, "restarting transaction");

            let fresh = ConsistentReadPoint::new(self.manager.clock().clone());
            let mut moved = mem::replace(&mut s.read_point, fresh);
            moved.restart();
            successor.mutable.lock().read_point = moved;

            self.state.store(TxnState::Aborted);
        }
        self.do_abort(Ok(()));
        Ok(())
    }
}

impl Drop for TransactionInner {
    fn drop(&mut self) {
        let s = self.mutable.get_mut();
        self.manager
            .rpcs()
            .abort_all([s.heartbeat_handle, s.commit_handle, s.abort_handle]);
    }
}
