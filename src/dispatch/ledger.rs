//! Position ledger
//!
//! Append-only map from frame sequence number to [`PositionSample`]. Writes
//! take a short lock; the "most recent entry" read used by the probe goes
//! through an `ArcSwap` pointer and never blocks the writer.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use tracing::warn;

use super::frame::PositionSample;

#[derive(Default)]
pub struct PositionLedger {
    entries: RwLock<BTreeMap<u64, PositionSample>>,
    /// Entry with the highest sequence number
    latest: ArcSwapOption<PositionSample>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample. Entries are immutable: a second write for the same
    /// sequence number is refused and `false` is returned.
    pub fn record(&self, sample: PositionSample) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(&sample.sequence) {
            warn!(
                "Ledger entry #{} already written, ignoring {}",
                sample.sequence, sample
            );
            return false;
        }
        entries.insert(sample.sequence, sample);

        // Updated under the write lock so the pointer never goes backwards
        let newer = self
            .latest
            .load()
            .as_ref()
            .map_or(true, |current| sample.sequence > current.sequence);
        if newer {
            self.latest.store(Some(Arc::new(sample)));
        }
        true
    }

    pub fn get(&self, sequence: u64) -> Option<PositionSample> {
        self.entries.read().get(&sequence).copied()
    }

    /// Sample of the highest sequence number recorded so far
    pub fn latest(&self) -> Option<PositionSample> {
        self.latest.load().as_deref().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All entries ordered by sequence number
    pub fn snapshot(&self) -> Vec<PositionSample> {
        self.entries.read().values().copied().collect()
    }

    /// Drop everything. Only called on session teardown.
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        entries.clear();
        self.latest.store(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_lookup() {
        let ledger = PositionLedger::new();
        assert!(ledger.is_empty());
        assert!(ledger.latest().is_none());

        assert!(ledger.record(PositionSample::found(1, (10, 20))));
        assert!(ledger.record(PositionSample::absent(2)));

        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.get(1), Some(PositionSample::found(1, (10, 20))));
        assert_eq!(ledger.get(2), Some(PositionSample::absent(2)));
        assert_eq!(ledger.get(3), None);
        assert_eq!(ledger.latest(), Some(PositionSample::absent(2)));
    }

    #[test]
    fn test_entries_are_immutable() {
        let ledger = PositionLedger::new();
        assert!(ledger.record(PositionSample::found(7, (120, 240))));
        assert!(!ledger.record(PositionSample::found(7, (0, 0))));
        assert_eq!(ledger.get(7), Some(PositionSample::found(7, (120, 240))));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_latest_tracks_highest_sequence() {
        let ledger = PositionLedger::new();
        ledger.record(PositionSample::found(5, (1, 1)));
        ledger.record(PositionSample::found(3, (2, 2)));
        assert_eq!(ledger.latest().map(|s| s.sequence), Some(5));

        let order: Vec<u64> = ledger.snapshot().iter().map(|s| s.sequence).collect();
        assert_eq!(order, vec![3, 5]);
    }

    #[test]
    fn test_clear() {
        let ledger = PositionLedger::new();
        ledger.record(PositionSample::found(1, (1, 1)));
        ledger.clear();
        assert!(ledger.is_empty());
        assert!(ledger.latest().is_none());
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_latest() {
        let ledger = Arc::new(PositionLedger::new());
        let writer = {
            let ledger = ledger.clone();
            std::thread::spawn(move || {
                for seq in 1..=2000u64 {
                    ledger.record(PositionSample::found(seq, (seq as i32, -(seq as i32))));
                }
            })
        };

        let mut last = 0;
        while !writer.is_finished() {
            if let Some(sample) = ledger.latest() {
                let p = sample.position.unwrap();
                assert_eq!(p.x, sample.sequence as i32);
                assert_eq!(p.y, -(sample.sequence as i32));
                assert!(sample.sequence >= last);
                last = sample.sequence;
            }
        }
        writer.join().unwrap();
        assert_eq!(ledger.len(), 2000);
    }
}
