use overlay_core::{wire::TrafficSummary, NodeId};
use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

/// Gathers the traffic summaries of one run.
#[derive(Debug, Default)]
pub struct StatisticsCollector {
    summaries: BTreeMap<NodeId, TrafficSummary>,
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a node's summary. A second summary from the same node replaces
    /// the first.
    pub fn add(&mut self, summary: TrafficSummary) {
        self.summaries.insert(summary.id, summary);
    }

    /// The number of distinct nodes that have reported.
    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }

    pub fn clear(&mut self) {
        self.summaries.clear();
    }

    /// Folds the collected summaries into a report and starts over.
    pub fn take_report(&mut self) -> TrafficReport {
        let rows: Vec<TrafficSummary> =
            std::mem::take(&mut self.summaries).into_values().collect();
        let mut totals = Totals::default();
        for row in rows.iter() {
            totals.sent += u64::from(row.sent);
            totals.received += u64::from(row.received);
            totals.relayed += u64::from(row.relayed);
            totals.sent_sum += row.sent_sum;
            totals.received_sum += row.received_sum;
        }
        TrafficReport { rows, totals }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub sent: u64,
    pub received: u64,
    pub relayed: u64,
    pub sent_sum: i64,
    pub received_sum: i64,
}

/// The outcome of one run: a row per node, ordered by ID, and the totals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficReport {
    pub rows: Vec<TrafficSummary>,
    pub totals: Totals,
}

const WIDTH: usize = 20;

impl Display for TrafficReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<w$} {:<w$} {:<w$} {:<w$} {:<w$} {:<w$}",
            "Node",
            "Packets Sent",
            "Packets Received",
            "Packets Relayed",
            "Sum Values Sent",
            "Sum Values Received",
            w = WIDTH
        )?;
        for row in self.rows.iter() {
            writeln!(
                f,
                "{:<w$} {:<w$} {:<w$} {:<w$} {:<w$} {:<w$}",
                format!("Node {}", row.id),
                row.sent,
                row.received,
                row.relayed,
                row.sent_sum,
                row.received_sum,
                w = WIDTH
            )?;
        }
        let totals = &self.totals;
        write!(
            f,
            "{:<w$} {:<w$} {:<w$} {:<w$} {:<w$} {:<w$}",
            "Sum",
            totals.sent,
            totals.received,
            totals.relayed,
            totals.sent_sum,
            totals.received_sum,
            w = WIDTH
        )
    }
}
