//! In-memory traffic accounting, keyed by forward id.
//!
//! Pair-pipes feed counters through a [`MeterHandle`]; a single flusher
//! drains the map on a fixed interval and appends nonzero rows to the
//! catalog. The map mutex is plain `std::sync` and is never held across an
//! await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::catalog::TrafficRecord;
use crate::forward::ForwardId;

#[derive(Debug, Default, Clone, Copy)]
struct Delta {
    bytes_in: u64,
    bytes_out: u64,
}

/// Shared per-forward byte counters.
#[derive(Debug, Clone, Default)]
pub struct TrafficCounters {
    inner: Arc<Mutex<HashMap<ForwardId, Delta>>>,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// A counting handle bound to one forward.
    pub fn handle(&self, forward_id: ForwardId) -> MeterHandle {
        MeterHandle {
            counters: self.clone(),
            forward_id,
        }
    }

    /// Add bytes flowing user → destination.
    pub fn add_in(&self, forward_id: ForwardId, bytes: u64) {
        let mut map = self.inner.lock().expect("meter mutex poisoned");
        let delta = map.entry(forward_id).or_default();
        delta.bytes_in = delta.bytes_in.saturating_add(bytes);
    }

    /// Add bytes flowing destination → user.
    pub fn add_out(&self, forward_id: ForwardId, bytes: u64) {
        let mut map = self.inner.lock().expect("meter mutex poisoned");
        let delta = map.entry(forward_id).or_default();
        delta.bytes_out = delta.bytes_out.saturating_add(bytes);
    }

    /// Snapshot and clear, returning one record per forward with nonzero
    /// deltas, stamped with the current time.
    pub fn drain(&self) -> Vec<TrafficRecord> {
        let snapshot: HashMap<ForwardId, Delta> = {
            let mut map = self.inner.lock().expect("meter mutex poisoned");
            std::mem::take(&mut *map)
        };

        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut records: Vec<TrafficRecord> = snapshot
            .into_iter()
            .filter(|(_, d)| d.bytes_in > 0 || d.bytes_out > 0)
            .map(|(forward_id, d)| TrafficRecord {
                forward_id,
                bytes_in: d.bytes_in,
                bytes_out: d.bytes_out,
                timestamp_ms,
            })
            .collect();
        records.sort_by_key(|r| r.forward_id);
        records
    }
}

/// Counting handle installed on a pair-pipe.
#[derive(Debug, Clone)]
pub struct MeterHandle {
    counters: TrafficCounters,
    forward_id: ForwardId,
}

impl MeterHandle {
    pub fn count_in(&self, bytes: usize) {
        self.counters.add_in(self.forward_id, bytes as u64);
    }

    pub fn count_out(&self, bytes: usize) {
        self.counters.add_out(self.forward_id, bytes as u64);
    }
}
