//! Transaction manager: the per-process factory and shared environment for
//! client transactions. Owns the hybrid clock, the coordinator
//! configuration, the RPC registry, and the service boundary to the
//! messenger / tablet-lookup world.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tern_common::clock::HybridClock;
use tern_common::config::TxnClientConfig;
use tern_common::error::TxnResult;
use tern_common::types::{HybridTime, IsolationLevel, TabletId};

use crate::protocol::ChildTransactionData;
use crate::rpc::{Rpcs, TransactionService};
use crate::transaction::DistributedTransaction;

/// Created once per client process and shared by every transaction.
pub struct TransactionManager {
    service: Arc<dyn TransactionService>,
    clock: Arc<HybridClock>,
    config: TxnClientConfig,
    rpcs: Rpcs,
}

impl TransactionManager {
    pub fn new(
        service: Arc<dyn TransactionService>,
        config: TxnClientConfig,
        runtime: tokio::runtime::Handle,
    ) -> Arc<Self> {
        let clock = Arc::new(HybridClock::new(config.max_clock_skew_us));
        Arc::new(Self {
            service,
            clock,
            config,
            rpcs: Rpcs::new(runtime),
        })
    }

    /// Start a new top-level transaction.
    pub fn begin_transaction(
        self: &Arc<Self>,
        isolation: IsolationLevel,
    ) -> DistributedTransaction {
        DistributedTransaction::new(self.clone(), isolation)
    }

    /// Start a child transaction from a descriptor exported by a parent in
    /// a peer process.
    pub fn begin_child_transaction(
        self: &Arc<Self>,
        data: ChildTransactionData,
    ) -> DistributedTransaction {
        DistributedTransaction::new_child(self.clone(), data)
    }

    pub fn now(&self) -> HybridTime {
        self.clock.now()
    }

    /// Fold a server-propagated clock reading into the local clock.
    pub fn update_clock(&self, ht: HybridTime) {
        self.clock.observe(ht);
    }

    pub fn clock(&self) -> &Arc<HybridClock> {
        &self.clock
    }

    pub fn service(&self) -> &Arc<dyn TransactionService> {
        &self.service
    }

    pub fn config(&self) -> &TxnClientConfig {
        &self.config
    }

    pub fn rpcs(&self) -> &Rpcs {
        &self.rpcs
    }

    pub fn rpc_deadline(&self) -> Duration {
        self.config.rpc_deadline()
    }

    /// Pick a status tablet for a new transaction, free choice among the
    /// replicated pool. Delegates to the service layer.
    pub async fn pick_status_tablet(&self) -> TxnResult<TabletId> {
        self.service.pick_status_tablet().await
    }

    /// Run a future on the shared runtime, untracked.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.rpcs.runtime().spawn(fut);
    }

    /// Run a future on the shared runtime after `delay`.
    pub fn schedule<F>(&self, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.rpcs.runtime().spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        });
    }
}
