//! Transaction RPC surface: wire request/response shapes, the narrow
//! service trait behind which the messenger and tablet-lookup cache live,
//! and the shared registry of in-flight RPC tasks.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;

use tern_common::error::{TxnError, TxnResult};
use tern_common::types::{HybridTime, TabletId, TxnId, TxnStatus};

/// Routing handle for a resolved tablet, produced by the lookup cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTablet {
    pub tablet_id: TabletId,
    /// Address of the current leader replica.
    pub leader_addr: String,
}

/// Status payload of an update-transaction request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnStatePayload {
    pub transaction_id: TxnId,
    pub status: TxnStatus,
    /// Involved tablet ids; populated for COMMITTED so the status holder can
    /// drive server-side apply, empty for heartbeats.
    pub tablets: Vec<TabletId>,
}

/// Request driving a status transition (CREATED / PENDING / COMMITTED) on
/// the status tablet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTransactionRequest {
    pub status_tablet_id: TabletId,
    pub propagated_hybrid_time: HybridTime,
    pub state: TxnStatePayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTransactionResponse {
    pub propagated_hybrid_time: HybridTime,
}

/// Request recording an ABORTED status on the status tablet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortTransactionRequest {
    pub status_tablet_id: TabletId,
    pub propagated_hybrid_time: HybridTime,
    pub transaction_id: TxnId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortTransactionResponse {
    pub propagated_hybrid_time: Option<HybridTime>,
}

/// Narrow interface to the process-shared RPC world: status-tablet choice,
/// tablet-id resolution, and the two status-transition RPCs. Implementations
/// are internally thread-safe.
#[async_trait]
pub trait TransactionService: Send + Sync {
    /// Pick a status tablet for a new transaction, free choice among the
    /// replicated pool.
    async fn pick_status_tablet(&self) -> TxnResult<TabletId>;

    /// Resolve a tablet id to its routing handle.
    async fn lookup_tablet(&self, tablet_id: TabletId) -> TxnResult<RemoteTablet>;

    async fn update_transaction(
        &self,
        target: &RemoteTablet,
        req: UpdateTransactionRequest,
    ) -> TxnResult<UpdateTransactionResponse>;

    async fn abort_transaction(
        &self,
        target: &RemoteTablet,
        req: AbortTransactionRequest,
    ) -> TxnResult<AbortTransactionResponse>;
}

/// Apply an RPC deadline to a service call.
pub async fn with_deadline<T>(
    deadline: Duration,
    what: &'static str,
    fut: impl Future<Output = TxnResult<T>>,
) -> TxnResult<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(TxnError::TimedOut(what.into())),
    }
}

/// Slot identifier of an in-flight RPC task registered in [`Rpcs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcHandle(u64);

impl RpcHandle {
    pub const INVALID: RpcHandle = RpcHandle(0);

    pub fn is_valid(&self) -> bool {
        *self != RpcHandle::INVALID
    }
}

/// Registry of in-flight RPC tasks, shared by every transaction of a
/// manager. Tracks the abort handle of each spawned task so that a dropped
/// transaction can cancel its outstanding RPCs without touching its own
/// lock.
pub struct Rpcs {
    runtime: tokio::runtime::Handle,
    in_flight: DashMap<u64, AbortHandle>,
    next_id: AtomicU64,
}

impl Rpcs {
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self {
            runtime,
            in_flight: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn invalid_handle(&self) -> RpcHandle {
        RpcHandle::INVALID
    }

    /// Spawn `fut` on the runtime and track it. The returned handle stays
    /// valid until `unregister` or `abort`.
    pub fn register_and_start<F>(&self, fut: F) -> RpcHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = self.runtime.spawn(fut);
        self.in_flight.insert(id, task.abort_handle());
        RpcHandle(id)
    }

    /// Forget a completed task. Does not cancel it.
    pub fn unregister(&self, handle: RpcHandle) {
        if handle.is_valid() {
            self.in_flight.remove(&handle.0);
        }
    }

    /// Cancel an in-flight task and forget it.
    pub fn abort(&self, handle: RpcHandle) {
        if !handle.is_valid() {
            return;
        }
        if let Some((_, task)) = self.in_flight.remove(&handle.0) {
            task.abort();
        }
    }

    pub fn abort_all<I: IntoIterator<Item = RpcHandle>>(&self, handles: I) {
        for handle in handles {
            self.abort(handle);
        }
    }

    /// Number of currently tracked tasks.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn runtime(&self) -> &tokio::runtime::Handle {
        &self.runtime
    }
}
