//! Client-side coordinator for distributed TernDB transactions.
//!
//! Drives the lifecycle of a single multi-tablet transaction from the client
//! process: issues its identity, registers involved tablets as operation
//! batches touch them, keeps a liveness heartbeat running against a chosen
//! status tablet, performs commit/abort, and supports a parent/child split
//! for transactions spanning multiple client processes.
//!
//! The RPC transport, tablet-lookup cache and server-side status manager are
//! consumed only through the [`rpc::TransactionService`] trait.

pub mod manager;
pub mod protocol;
pub mod read_point;
pub mod rpc;
pub mod transaction;

#[cfg(test)]
mod tests;

pub use manager::TransactionManager;
pub use protocol::{ChildTransactionData, ChildTransactionResult, InvolvedTabletEntry};
pub use read_point::ConsistentReadPoint;
pub use rpc::{
    AbortTransactionRequest, AbortTransactionResponse, RemoteTablet, RpcHandle, Rpcs,
    TransactionService, TxnStatePayload, UpdateTransactionRequest, UpdateTransactionResponse,
};
pub use transaction::{
    CommitCallback, DistributedTransaction, InFlightOp, PrepareChildCallback, PreparedMetadata,
    TxnState, Waiter,
};

// Re-export from tern_common for convenience
pub use tern_common::types::{
    HybridTime, IsolationLevel, TabletId, TransactionMetadata, TxnId, TxnStatus,
};
