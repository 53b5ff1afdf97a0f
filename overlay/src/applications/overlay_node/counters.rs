use overlay_core::{
    wire::{TrafficSummary, MAX_COUNT},
    NodeId,
};
use std::{
    fmt::{self, Display, Formatter},
    sync::Mutex,
};

/// A copy of a node's traffic counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub sent: u32,
    pub received: u32,
    pub relayed: u32,
    pub sent_sum: i64,
    pub received_sum: i64,
}

impl CounterSnapshot {
    pub fn summary(self, id: NodeId) -> TrafficSummary {
        TrafficSummary {
            id,
            sent: self.sent,
            relayed: self.relayed,
            sent_sum: self.sent_sum,
            received: self.received,
            received_sum: self.received_sum,
        }
    }
}

impl Display for CounterSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<24}{}", "Packets sent:", self.sent)?;
        writeln!(f, "{:<24}{}", "Packets received:", self.received)?;
        writeln!(f, "{:<24}{}", "Packets relayed:", self.relayed)?;
        writeln!(f, "{:<24}{}", "Sum of values sent:", self.sent_sum)?;
        write!(f, "{:<24}{}", "Sum of values received:", self.received_sum)
    }
}

/// A node's traffic counters. Every update takes the one lock, so packets
/// arriving on different connections at once are all counted.
///
/// Packet counts stop at [`MAX_COUNT`], the most a summary can report.
#[derive(Debug, Default)]
pub struct Counters(Mutex<CounterSnapshot>);

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, payload: i32) {
        let mut counters = self.0.lock().unwrap();
        counters.sent = bump(counters.sent);
        counters.sent_sum += i64::from(payload);
    }

    pub fn record_received(&self, payload: i32) {
        let mut counters = self.0.lock().unwrap();
        counters.received = bump(counters.received);
        counters.received_sum += i64::from(payload);
    }

    pub fn record_relayed(&self) {
        let mut counters = self.0.lock().unwrap();
        counters.relayed = bump(counters.relayed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        *self.0.lock().unwrap()
    }

    /// Returns the counters and zeroes them in the same step.
    pub fn take(&self) -> CounterSnapshot {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

fn bump(count: u32) -> u32 {
    (count + 1).min(MAX_COUNT)
}
