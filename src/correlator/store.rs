//! The correlation store: the SYN table and the connection table.
//!
//! Each table sits behind its own `Mutex`; there is no global lock. Any code
//! path holding both takes the connection table first, then the SYN table
//! (see [`CorrelationStore::with_tables`]). Moving a matched pair out of both
//! tables happens under both locks, so a flow is never missing from both
//! tables without having been emitted, and the scan detector cannot evict a
//! SYN the matcher is about to join.

use crate::correlator::flow::{FlowId, RelaxedKey};
use crate::correlator::types::{ConnectionRecord, SynRecord};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Condvar, LockResult, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Connections waiting for their SYN, keyed by (possibly corrected) flow ID.
pub type ConTable = HashMap<FlowId, ConnectionRecord>;

/// SYNs waiting for their connection.
///
/// Alongside the primary map it keeps a relaxed index
/// (`srcIP_destPort` → flow IDs) so best-guess matching is a hash lookup
/// instead of a scan over every pending SYN.
#[derive(Default)]
pub struct SynTable {
    records: HashMap<FlowId, SynRecord>,
    relaxed: HashMap<RelaxedKey, BTreeSet<FlowId>>,
}

impl SynTable {
    /// Inserts or overwrites a SYN. Returns `true` if an earlier record with
    /// the same flow ID was replaced (last write wins).
    pub fn insert(&mut self, id: FlowId, record: SynRecord) -> bool {
        self.relaxed.entry(id.relaxed()).or_default().insert(id.clone());
        self.records.insert(id, record).is_some()
    }

    /// Removes and returns the SYN with exactly this flow ID.
    pub fn take(&mut self, id: &FlowId) -> Option<SynRecord> {
        let record = self.records.remove(id)?;
        let key = id.relaxed();
        if let Some(ids) = self.relaxed.get_mut(&key) {
            ids.remove(id);
            if ids.is_empty() {
                self.relaxed.remove(&key);
            }
        }
        Some(record)
    }

    /// Removes and returns the oldest SYN sharing source IP and destination
    /// port with `key`, whatever its source port.
    pub fn take_relaxed(&mut self, key: &RelaxedKey) -> Option<(FlowId, SynRecord)> {
        let oldest = self
            .relaxed
            .get(key)?
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| (id, r.unixtime)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id.clone())?;
        let record = self.take(&oldest)?;
        Some((oldest, record))
    }

    pub fn get(&self, id: &FlowId) -> Option<&SynRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &FlowId) -> Option<&mut SynRecord> {
        self.records.get_mut(id)
    }

    pub fn contains(&self, id: &FlowId) -> bool {
        self.records.contains_key(id)
    }

    /// Snapshot of the current keys, safe to iterate while removing.
    pub fn keys(&self) -> Vec<FlowId> {
        self.records.keys().cloned().collect()
    }

    /// `unixtime` of the most recent pending SYN.
    pub fn newest_unixtime(&self) -> Option<f64> {
        self.records.values().map(|r| r.unixtime).max_by(f64::total_cmp)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Owned state shared by the ingest workers, the matcher and the scan detector.
#[derive(Default)]
pub struct CorrelationStore {
    syns:          Mutex<SynTable>,
    cons:          Mutex<ConTable>,
    /// Signalled whenever a connection is inserted. Paired with `cons`.
    con_ready:     Condvar,
    first_pass:    Mutex<bool>,
    first_pass_cv: Condvar,
}

fn relock<'a, T>(result: LockResult<MutexGuard<'a, T>>) -> MutexGuard<'a, T> {
    // A worker that panicked mid-update leaves the maps structurally valid;
    // keep correlating rather than cascading the panic.
    result.unwrap_or_else(PoisonError::into_inner)
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a SYN. Returns `true` when it replaced one with the same ID.
    pub fn insert_syn(&self, id: FlowId, record: SynRecord) -> bool {
        relock(self.syns.lock()).insert(id, record)
    }

    /// Inserts a connection and wakes the matcher. Returns `true` when it
    /// replaced one with the same ID.
    pub fn insert_connection(&self, id: FlowId, record: ConnectionRecord) -> bool {
        let replaced = relock(self.cons.lock()).insert(id, record).is_some();
        self.con_ready.notify_all();
        replaced
    }

    /// Blocks until the connection table is non-empty or `timeout` elapses.
    /// Returns whether connections are waiting.
    pub fn wait_for_connections(&self, timeout: Duration) -> bool {
        let guard = relock(self.cons.lock());
        let (guard, _) = self
            .con_ready
            .wait_timeout_while(guard, timeout, |cons| cons.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        !guard.is_empty()
    }

    /// Runs `f` with both tables locked, connection table first.
    pub fn with_tables<R>(&self, f: impl FnOnce(&mut ConTable, &mut SynTable) -> R) -> R {
        let mut cons = relock(self.cons.lock());
        let mut syns = relock(self.syns.lock());
        f(&mut cons, &mut syns)
    }

    /// Runs `f` with only the SYN table locked.
    pub fn with_syns<R>(&self, f: impl FnOnce(&mut SynTable) -> R) -> R {
        let mut syns = relock(self.syns.lock());
        f(&mut syns)
    }

    pub fn syn_count(&self) -> usize {
        relock(self.syns.lock()).len()
    }

    pub fn con_count(&self) -> usize {
        relock(self.cons.lock()).len()
    }

    /// Called by the matcher after its first completed pass.
    pub fn mark_first_pass(&self) {
        let mut done = relock(self.first_pass.lock());
        if !*done {
            *done = true;
            self.first_pass_cv.notify_all();
        }
    }

    /// Waits up to `timeout` for the matcher's first pass. Returns whether it
    /// happened.
    pub fn wait_first_pass(&self, timeout: Duration) -> bool {
        let guard = relock(self.first_pass.lock());
        let (guard, _) = self
            .first_pass_cv
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::fixtures::{con, syn};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn duplicate_syn_is_last_write_wins() {
        let mut table = SynTable::default();
        let first  = syn("1.2.3.4", 5555, 80, 1.0);
        let second = syn("1.2.3.4", 5555, 80, 9.0);
        let id     = first.flow_id();

        assert!(!table.insert(id.clone(), first));
        assert!(table.insert(id.clone(), second));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&id).unwrap().unixtime, 9.0);
    }

    #[test]
    fn take_keeps_relaxed_index_in_sync() {
        let mut table = SynTable::default();
        let a = syn("1.2.3.4", 1000, 80, 1.0);
        let b = syn("1.2.3.4", 1001, 80, 2.0);
        let (ida, idb) = (a.flow_id(), b.flow_id());
        table.insert(ida.clone(), a);
        table.insert(idb.clone(), b);

        assert!(table.take(&ida).is_some());
        let (id, rec) = table.take_relaxed(&ida.relaxed()).unwrap();
        assert_eq!(id, idb);
        assert_eq!(rec.tcp.src_port, 1001);
        assert!(table.take_relaxed(&ida.relaxed()).is_none());
        assert!(table.is_empty());
        assert!(table.relaxed.is_empty());
    }

    #[test]
    fn relaxed_take_prefers_oldest_syn() {
        let mut table = SynTable::default();
        for (port, t) in [(2000u16, 5.0), (2001, 3.0), (2002, 4.0)] {
            let s = syn("9.9.9.9", port, 443, t);
            table.insert(s.flow_id(), s);
        }
        let (_, rec) = table.take_relaxed(&FlowId::new("9.9.9.9", 443, 0).relaxed()).unwrap();
        assert_eq!(rec.tcp.src_port, 2001);
        assert!(table.take_relaxed(&FlowId::new("9.9.9.9", 22, 0).relaxed()).is_none());
    }

    #[test]
    fn connection_insert_wakes_waiter() {
        let store = Arc::new(CorrelationStore::new());
        assert!(!store.wait_for_connections(Duration::from_millis(10)));

        let waiter = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.wait_for_connections(Duration::from_secs(5)))
        };
        let c = con("1.2.3.4", 5555, 80, 0.0);
        store.insert_connection(c.flow_id(), c);
        assert!(waiter.join().unwrap());
        assert_eq!(store.con_count(), 1);
    }

    #[test]
    fn first_pass_latch() {
        let store = CorrelationStore::new();
        assert!(!store.wait_first_pass(Duration::from_millis(10)));
        store.mark_first_pass();
        assert!(store.wait_first_pass(Duration::from_millis(10)));
    }
}
