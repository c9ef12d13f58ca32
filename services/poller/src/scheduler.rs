//! Bucket scheduler over the meter roster.
//!
//! Each `(meter, kind)` slot fires when the wall clock crosses into a new
//! interval bucket: `bucket = now / interval`, due iff `bucket >
//! last_bucket`. A meter that just appeared in the roster is due
//! immediately and records the current bucket, so a slot dispatches at most
//! once per bucket — calling `tick` twice inside the same bucket never
//! double-dispatches.
//!
//! The scheduler is deliberately pure (the clock is a parameter) so the
//! dispatch law is unit-testable without waiting on real time.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use tracing::debug;

use meter_core::{DataKind, MeterDescriptor};

/// A `(meter, kind)` pair that is due for a session.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub meter: MeterDescriptor,
    pub kind: DataKind,
}

/// Per-slot schedule state.
#[derive(Debug, Clone, Copy)]
struct Slot {
    last_bucket: i64,
}

pub struct Scheduler {
    /// Roster per kind, in snapshot order.
    roster: HashMap<DataKind, Vec<MeterDescriptor>>,
    slots: HashMap<(String, DataKind), Slot>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            roster: HashMap::new(),
            slots: HashMap::new(),
        }
    }

    /// Replace the roster for one kind, preserving schedule state.
    ///
    /// Surviving meters keep their `last_bucket`; meters that disappeared
    /// from the snapshot lose their slot; new meters have no slot yet and
    /// will dispatch on the next tick.
    pub fn merge_roster(&mut self, kind: DataKind, meters: Vec<MeterDescriptor>) {
        self.slots.retain(|(meter_id, slot_kind), _| {
            *slot_kind != kind || meters.iter().any(|m| m.meter_id == *meter_id)
        });
        debug!(kind = %kind, meters = meters.len(), "roster merged");
        self.roster.insert(kind, meters);
    }

    /// Number of meters currently scheduled for a kind.
    pub fn roster_len(&self, kind: DataKind) -> usize {
        self.roster.get(&kind).map_or(0, Vec::len)
    }

    /// Drop every kind not in `kinds` (config reload removed it).
    pub fn retain_kinds(&mut self, kinds: &[DataKind]) {
        self.roster.retain(|kind, _| kinds.contains(kind));
        self.slots.retain(|(_, kind), _| kinds.contains(kind));
    }

    /// Collect every slot that is due at `now` (unix seconds), advancing
    /// their buckets. Meters are visited in snapshot order; disabled kinds
    /// (interval 0) and inactive meters are skipped.
    pub fn tick(&mut self, now: i64) -> Vec<Dispatch> {
        let mut due = Vec::new();
        for (&kind, meters) in &self.roster {
            for meter in meters {
                if !meter.is_active {
                    continue;
                }
                let interval = i64::from(meter.interval(kind));
                if interval <= 0 {
                    continue;
                }
                let bucket = now.div_euclid(interval);
                let key = (meter.meter_id.clone(), kind);
                match self.slots.entry(key) {
                    Entry::Occupied(mut slot) => {
                        if bucket > slot.get().last_bucket {
                            slot.get_mut().last_bucket = bucket;
                            due.push(Dispatch {
                                meter: meter.clone(),
                                kind,
                            });
                        }
                    }
                    Entry::Vacant(slot) => {
                        // First sighting: dispatch once, remember the bucket.
                        slot.insert(Slot { last_bucket: bucket });
                        due.push(Dispatch {
                            meter: meter.clone(),
                            kind,
                        });
                    }
                }
            }
        }
        due
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}
