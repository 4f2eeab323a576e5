//! Wire descriptors for the parent/child transaction split.
//!
//! A parent exports [`ChildTransactionData`] to a peer process, the peer runs
//! its part of the transaction against the same logical identity, and ships
//! back a [`ChildTransactionResult`] for the parent to merge. Both are serde
//! structs carried in a JSON envelope; the Rust types are the source of truth.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use tern_common::error::{TxnError, TxnResult};
use tern_common::types::{HybridTime, TabletId, TransactionMetadata};

/// Everything a peer process needs to run a child of an existing
/// transaction: the parent's full metadata plus its consistent read point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildTransactionData {
    pub metadata: TransactionMetadata,
    pub read_time: Option<HybridTime>,
    pub local_limits: HashMap<TabletId, HybridTime>,
}

impl ChildTransactionData {
    pub fn to_wire(&self) -> TxnResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| TxnError::Network(format!("child data serialization error: {e}")))
    }

    pub fn from_wire(payload: &[u8]) -> TxnResult<Self> {
        let data: ChildTransactionData = serde_json::from_slice(payload)
            .map_err(|e| TxnError::Network(format!("child data deserialization error: {e}")))?;
        if data.metadata.transaction_id.is_nil() {
            return Err(TxnError::illegal_state(
                "child transaction data carries a nil transaction id",
            ));
        }
        if data.metadata.status_tablet.is_none() {
            return Err(TxnError::illegal_state(
                "child transaction data carries no status tablet",
            ));
        }
        Ok(data)
    }
}

/// Per-tablet entry of a child result: which tablets the child touched and
/// whether each already holds the transaction's full parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvolvedTabletEntry {
    pub tablet_id: TabletId,
    pub has_parameters: bool,
}

/// What a finished child hands back to its parent: the tablets it involved,
/// the read-limit updates it accumulated, and whether it hit snapshot skew.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChildTransactionResult {
    pub tablets: Vec<InvolvedTabletEntry>,
    pub local_limits: HashMap<TabletId, HybridTime>,
    pub restart_required: bool,
}

impl ChildTransactionResult {
    pub fn to_wire(&self) -> TxnResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| TxnError::Network(format!("child result serialization error: {e}")))
    }

    pub fn from_wire(payload: &[u8]) -> TxnResult<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| TxnError::Network(format!("child result deserialization error: {e}")))
    }
}
