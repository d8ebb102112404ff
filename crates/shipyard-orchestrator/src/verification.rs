use parking_lot::Mutex;
use std::collections::HashMap;

/// Failed verifications of one deliverable before a human is asked.
pub const DEFAULT_VERIFICATION_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
enum GateSlot {
    Empty,
    /// A gate is being created; concurrent failures must not create another.
    Reserved,
    Open(String),
}

#[derive(Debug)]
struct Record {
    failures: u32,
    gate: GateSlot,
}

/// What the caller should do after a recorded failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationVerdict {
    /// Keep retrying; `failures` so far.
    Continue { failures: u32 },
    /// Threshold reached. The caller must create a gate and report it back
    /// with [`VerificationTracker::attach_gate`] or [`VerificationTracker::release`].
    Escalate { failures: u32 },
    /// A gate was created earlier. The caller checks whether it is still pending.
    GateOpen { gate_id: String, failures: u32 },
    /// Another caller is creating the gate right now. Neither retry nor escalate.
    Pending { failures: u32 },
}

/// Counts verification failures per deliverable and remembers the gate
/// raised for each, so repeated failures produce one gate at a time.
pub struct VerificationTracker {
    threshold: u32,
    records: Mutex<HashMap<String, Record>>,
}

impl VerificationTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn record_failure(&self, deliverable_id: &str) -> VerificationVerdict {
        let mut records = self.records.lock();
        let record = records
            .entry(deliverable_id.to_string())
            .or_insert(Record {
                failures: 0,
                gate: GateSlot::Empty,
            });
        record.failures += 1;
        let failures = record.failures;
        match &record.gate {
            GateSlot::Open(gate_id) => VerificationVerdict::GateOpen {
                gate_id: gate_id.clone(),
                failures,
            },
            GateSlot::Reserved => VerificationVerdict::Pending { failures },
            GateSlot::Empty if failures >= self.threshold => {
                record.gate = GateSlot::Reserved;
                VerificationVerdict::Escalate { failures }
            }
            GateSlot::Empty => VerificationVerdict::Continue { failures },
        }
    }

    /// Record the gate created after an `Escalate` verdict.
    pub fn attach_gate(&self, deliverable_id: &str, gate_id: impl Into<String>) {
        if let Some(record) = self.records.lock().get_mut(deliverable_id) {
            record.gate = GateSlot::Open(gate_id.into());
        }
    }

    /// Undo a reservation whose gate could not be created.
    pub fn release(&self, deliverable_id: &str) {
        if let Some(record) = self.records.lock().get_mut(deliverable_id) {
            if record.gate == GateSlot::Reserved {
                record.gate = GateSlot::Empty;
            }
        }
    }

    /// The gate was resolved by a human. Counting restarts from the failure
    /// that discovered it.
    pub fn gate_resolved(&self, deliverable_id: &str) {
        if let Some(record) = self.records.lock().get_mut(deliverable_id) {
            record.failures = 1;
            record.gate = GateSlot::Empty;
        }
    }

    /// Forget a deliverable after it verified successfully.
    pub fn record_success(&self, deliverable_id: &str) {
        self.records.lock().remove(deliverable_id);
    }

    pub fn failures(&self, deliverable_id: &str) -> u32 {
        self.records
            .lock()
            .get(deliverable_id)
            .map_or(0, |r| r.failures)
    }

    pub fn gate_for(&self, deliverable_id: &str) -> Option<String> {
        match self.records.lock().get(deliverable_id).map(|r| &r.gate) {
            Some(GateSlot::Open(id)) => Some(id.clone()),
            _ => None,
        }
    }
}

impl Default for VerificationTracker {
    fn default() -> Self {
        Self::new(DEFAULT_VERIFICATION_THRESHOLD)
    }
}
