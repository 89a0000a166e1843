//! Coupled buffer records
//!
//! One record per pool slot tracks which consumers must hand a delivered
//! buffer back before it can be requeued. The record completes exactly once
//! per delivery: the last required return yields the handle, and any later
//! return for the same delivery is ignored.

use crate::capture::frame::BufferHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerKind {
    Preview,
    Recording,
    Snapshot,
}

impl ConsumerKind {
    fn bit(self) -> u8 {
        match self {
            ConsumerKind::Preview => 0b001,
            ConsumerKind::Recording => 0b010,
            ConsumerKind::Snapshot => 0b100,
        }
    }
}

/// Small set of consumer kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerSet(u8);

impl ConsumerSet {
    pub const EMPTY: ConsumerSet = ConsumerSet(0);

    pub fn of(kinds: &[ConsumerKind]) -> Self {
        kinds.iter().fold(Self::EMPTY, |set, k| set.with(*k))
    }

    pub fn with(self, kind: ConsumerKind) -> Self {
        ConsumerSet(self.0 | kind.bit())
    }

    pub fn contains(self, kind: ConsumerKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_superset(self, other: ConsumerSet) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Still waiting on other consumers.
    Pending,
    /// Every required consumer is done; requeue this handle.
    Complete(BufferHandle),
    /// Not a return for a delivery in flight.
    Ignored,
}

#[derive(Debug, Default, Clone)]
struct CoupledRecord {
    in_flight: Option<BufferHandle>,
    required: ConsumerSet,
    returned: ConsumerSet,
}

#[derive(Debug)]
pub struct CouplingTable {
    records: Vec<CoupledRecord>,
}

impl CouplingTable {
    pub fn new(slots: usize) -> Self {
        Self {
            records: vec![CoupledRecord::default(); slots],
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    /// Start tracking a fresh delivery. Returns false if the slot is outside
    /// the table.
    pub fn stamp(&mut self, handle: BufferHandle, required: ConsumerSet) -> bool {
        let Some(record) = self.records.get_mut(handle.slot) else {
            return false;
        };
        *record = CoupledRecord {
            in_flight: Some(handle),
            required,
            returned: ConsumerSet::EMPTY,
        };
        true
    }

    pub fn mark_returned(&mut self, handle: BufferHandle, kind: ConsumerKind) -> Completion {
        let Some(record) = self.records.get_mut(handle.slot) else {
            return Completion::Ignored;
        };
        if record.in_flight != Some(handle) || !record.required.contains(kind) {
            return Completion::Ignored;
        }
        if record.returned.contains(kind) {
            return Completion::Ignored;
        }

        record.returned = record.returned.with(kind);
        if record.returned.is_superset(record.required) {
            record.in_flight = None;
            Completion::Complete(handle)
        } else {
            Completion::Pending
        }
    }

    /// Add `kind` to the consumers an in-flight delivery waits on. False if
    /// the delivery already completed.
    pub fn require(&mut self, handle: BufferHandle, kind: ConsumerKind) -> bool {
        match self.records.get_mut(handle.slot) {
            Some(record) if record.in_flight == Some(handle) => {
                record.required = record.required.with(kind);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::Epoch;

    fn handle(slot: usize, sequence: u64) -> BufferHandle {
        BufferHandle {
            slot,
            epoch: Epoch(1),
            sequence,
        }
    }

    #[test]
    fn completes_once_after_every_required_consumer() {
        let mut table = CouplingTable::new(4);
        let h = handle(2, 10);
        let both = ConsumerSet::of(&[ConsumerKind::Preview, ConsumerKind::Recording]);
        assert!(table.stamp(h, both));

        assert_eq!(
            table.mark_returned(h, ConsumerKind::Recording),
            Completion::Pending
        );
        assert_eq!(
            table.mark_returned(h, ConsumerKind::Recording),
            Completion::Ignored
        );
        assert_eq!(
            table.mark_returned(h, ConsumerKind::Preview),
            Completion::Complete(h)
        );
        assert_eq!(
            table.mark_returned(h, ConsumerKind::Preview),
            Completion::Ignored
        );
        assert!(!table.require(h, ConsumerKind::Snapshot));
    }

    #[test]
    fn a_late_return_from_a_previous_delivery_is_ignored() {
        let mut table = CouplingTable::new(2);
        let old = handle(0, 1);
        let new = handle(0, 5);
        table.stamp(old, ConsumerSet::of(&[ConsumerKind::Preview]));
        table.stamp(new, ConsumerSet::of(&[ConsumerKind::Preview]));

        assert_eq!(
            table.mark_returned(old, ConsumerKind::Preview),
            Completion::Ignored
        );
        assert_eq!(
            table.mark_returned(new, ConsumerKind::Preview),
            Completion::Complete(new)
        );
    }

    #[test]
    fn out_of_range_slots_are_rejected() {
        let mut table = CouplingTable::new(1);
        assert!(!table.stamp(handle(3, 1), ConsumerSet::EMPTY));
        assert_eq!(
            table.mark_returned(handle(3, 1), ConsumerKind::Preview),
            Completion::Ignored
        );
    }

    #[test]
    fn snapshot_can_join_an_in_flight_recording_frame() {
        let mut table = CouplingTable::new(2);
        let h = handle(1, 3);
        table.stamp(
            h,
            ConsumerSet::of(&[ConsumerKind::Preview, ConsumerKind::Recording]),
        );
        assert!(table.require(h, ConsumerKind::Snapshot));

        table.mark_returned(h, ConsumerKind::Preview);
        assert_eq!(
            table.mark_returned(h, ConsumerKind::Recording),
            Completion::Pending
        );
        assert_eq!(
            table.mark_returned(h, ConsumerKind::Snapshot),
            Completion::Complete(h)
        );
        assert!(!table.require(h, ConsumerKind::Snapshot));
    }
}
