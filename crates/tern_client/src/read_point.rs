//! Consistent read point of a transaction.
//!
//! Tracks the chosen read time and per-tablet local limits on the read-time
//! uncertainty window, and carries the restart signal raised when a server
//! response shows the chosen read time crossed uncertainty for some tablet.

use std::collections::HashMap;
use std::sync::Arc;

use tern_common::clock::HybridClock;
use tern_common::types::{HybridTime, TabletId};

use crate::protocol::{ChildTransactionData, ChildTransactionResult};

pub struct ConsistentReadPoint {
    clock: Arc<HybridClock>,
    read_time: Option<HybridTime>,
    /// Per-tablet upper bound on the uncertainty window. Always >= read_time.
    local_limits: HashMap<TabletId, HybridTime>,
    restart_required: bool,
}

impl ConsistentReadPoint {
    pub fn new(clock: Arc<HybridClock>) -> Self {
        Self {
            clock,
            read_time: None,
            local_limits: HashMap::new(),
            restart_required: false,
        }
    }

    /// Sample the clock and pin the read time to it.
    pub fn set_current_read_time(&mut self) {
        self.read_time = Some(self.clock.now());
    }

    /// Install an explicit read time and limits, used when importing a
    /// child descriptor.
    pub fn set_read_time(
        &mut self,
        read_time: Option<HybridTime>,
        local_limits: HashMap<TabletId, HybridTime>,
    ) {
        self.read_time = read_time;
        self.local_limits = local_limits;
        self.restart_required = false;
    }

    pub fn read_time(&self) -> Option<HybridTime> {
        self.read_time
    }

    pub fn local_limit(&self, tablet_id: TabletId) -> Option<HybridTime> {
        self.local_limits.get(&tablet_id).copied()
    }

    pub fn is_restart_required(&self) -> bool {
        self.restart_required
    }

    /// A server reported that the chosen read time crossed uncertainty for
    /// `tablet_id`. Raises the restart signal and that tablet's local limit.
    pub fn restart_at(&mut self, tablet_id: TabletId, limit: HybridTime) {
        self.restart_required = true;
        let entry = self.local_limits.entry(tablet_id).or_insert(limit);
        *entry = (*entry).max(limit);
        if let Some(read_time) = self.read_time {
            debug_assert!(*entry >= read_time);
        }
    }

    /// Resample the read time, clearing the restart signal and every
    /// per-tablet limit.
    pub fn restart(&mut self) {
        self.read_time = Some(self.clock.now());
        self.local_limits.clear();
        self.restart_required = false;
    }

    /// Write the read time and limits into a child descriptor.
    pub fn prepare_child_data(&self, out: &mut ChildTransactionData) {
        out.read_time = self.read_time;
        out.local_limits = self.local_limits.clone();
    }

    /// Write the accumulated limit updates and restart signal into a child
    /// result descriptor.
    pub fn finish_child_result(&self, out: &mut ChildTransactionResult) {
        out.local_limits = self.local_limits.clone();
        out.restart_required = self.restart_required;
    }

    /// Fold a child's limit updates and restart signal back into this
    /// (parent) read point: element-wise max over limits, OR over restart.
    pub fn apply_child_result(&mut self, result: &ChildTransactionResult) {
        for (&tablet_id, &limit) in &result.local_limits {
            let entry = self.local_limits.entry(tablet_id).or_insert(limit);
            *entry = (*entry).max(limit);
        }
        self.restart_required |= result.restart_required;
    }
}
