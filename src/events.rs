//! Event/audit sink for protocol milestones.
//!
//! Milestones (leader init, site done, global end, profiler reports) are
//! appended fire-and-forget; the sink makes no delivery promises. The
//! production file writer lives in the embedding process.

use parking_lot::Mutex;

/// Append-only notification sink for protocol milestones.
pub trait EventLog: Send + Sync {
    fn append(&self, event: &str);
}

/// Sink that discards every event.
#[derive(Debug, Default)]
pub struct NullEventLog;

impl EventLog for NullEventLog {
    fn append(&self, _event: &str) {}
}

/// In-memory sink, used by tests to assert milestone ordering.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<String>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events appended so far, in order.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Whether any event starts with the given prefix.
    pub fn contains_prefix(&self, prefix: &str) -> bool {
        self.events.lock().iter().any(|e| e.starts_with(prefix))
    }

    /// Number of events starting with the given prefix.
    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

impl EventLog for MemoryEventLog {
    fn append(&self, event: &str) {
        self.events.lock().push(event.to_string());
    }
}
