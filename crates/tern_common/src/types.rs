use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a tablet (data shard or status shard).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabletId(pub u64);

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tablet:{}", self.0)
    }
}

/// Globally unique transaction identifier.
///
/// Generated uniformly at random at transaction creation; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub Uuid);

impl TxnId {
    pub const NIL: TxnId = TxnId(Uuid::nil());

    pub fn generate() -> Self {
        TxnId(Uuid::new_v4())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Number of low bits reserved for the logical component of a hybrid time.
const HYBRID_TIME_LOGICAL_BITS: u32 = 12;
const HYBRID_TIME_LOGICAL_MASK: u64 = (1 << HYBRID_TIME_LOGICAL_BITS) - 1;

/// 64-bit hybrid timestamp: physical microseconds in the upper bits, a
/// logical counter in the low 12 bits.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct HybridTime(pub u64);

impl HybridTime {
    pub const MIN: HybridTime = HybridTime(0);
    pub const MAX: HybridTime = HybridTime(u64::MAX - 1);
    /// Sentinel for "no clock reading attached".
    pub const INVALID: HybridTime = HybridTime(u64::MAX);

    pub fn from_micros(physical_us: u64) -> Self {
        HybridTime(physical_us << HYBRID_TIME_LOGICAL_BITS)
    }

    pub fn from_parts(physical_us: u64, logical: u16) -> Self {
        HybridTime((physical_us << HYBRID_TIME_LOGICAL_BITS) | u64::from(logical))
    }

    pub fn physical_micros(&self) -> u64 {
        self.0 >> HYBRID_TIME_LOGICAL_BITS
    }

    pub fn logical(&self) -> u16 {
        (self.0 & HYBRID_TIME_LOGICAL_MASK) as u16
    }

    pub fn is_valid(&self) -> bool {
        *self != HybridTime::INVALID
    }

    /// Advance the physical component, preserving the logical component.
    pub fn add_micros(&self, us: u64) -> HybridTime {
        HybridTime(self.0 + (us << HYBRID_TIME_LOGICAL_BITS))
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "ht:{}.{}", self.physical_micros(), self.logical())
        } else {
            write!(f, "ht:<invalid>")
        }
    }
}

/// Transaction isolation level.
///
/// Only `SnapshotIsolation` captures a consistent read point at transaction
/// construction; every other level reads at the coordinator's current clock
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadCommitted,
    SnapshotIsolation,
    Serializable,
}

/// Transaction status values exchanged with the status tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnStatus {
    Created,
    Pending,
    Committed,
    Aborted,
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnStatus::Created => write!(f, "CREATED"),
            TxnStatus::Pending => write!(f, "PENDING"),
            TxnStatus::Committed => write!(f, "COMMITTED"),
            TxnStatus::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Full parameter set a data tablet needs the first time it sees an
/// operation of this transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub transaction_id: TxnId,
    pub isolation: IsolationLevel,
    /// Assigned once the status-tablet locator completes.
    pub status_tablet: Option<TabletId>,
    /// Uniform random priority used for conflict resolution.
    pub priority: u64,
    pub start_time: HybridTime,
}

impl TransactionMetadata {
    pub fn new(isolation: IsolationLevel, start_time: HybridTime) -> Self {
        Self {
            transaction_id: TxnId::generate(),
            isolation,
            status_tablet: None,
            priority: rand::random::<u64>(),
            start_time,
        }
    }
}

impl fmt::Display for TransactionMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ {} isolation: {:?} status_tablet: {:?} priority: {} start: {} }}",
            self.transaction_id, self.isolation, self.status_tablet, self.priority, self.start_time
        )
    }
}
