//! Submission breadcrumbs for device-loss reports.

use std::collections::VecDeque;
use std::fmt::Write as _;

use tracing::error;

use inflight_rhi::gpu::QueueKind;

/// One executed command list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub frame: u64,
    pub slot: usize,
    pub queue: QueueKind,
    pub name: String,
}

/// Ring of the most recently executed command lists.
#[derive(Debug)]
pub struct CommandHistory {
    records: VecDeque<SubmissionRecord>,
    capacity: usize,
}

impl CommandHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, record: SubmissionRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Oldest first.
    pub fn records(&self) -> impl Iterator<Item = &SubmissionRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Human-readable dump, most recent last.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, record) in self.records.iter().enumerate() {
            let _ = writeln!(
                out,
                "  #{:<3} frame {:<6} slot {} {:<6} {}",
                i,
                record.frame,
                record.slot,
                record.queue.name(),
                record.name
            );
        }
        out
    }
}

/// Logs everything known about a lost device.
pub fn report_device_lost(reason: &str, device_report: Option<String>, history: &CommandHistory) {
    error!("GPU device lost: {}", reason);
    match device_report {
        Some(report) => error!("Device report: {}", report),
        None => error!("Device report unavailable"),
    }
    if history.is_empty() {
        error!("No command lists were executed before the loss");
    } else {
        error!(
            "Last {} executed command list(s):\n{}",
            history.len(),
            history.dump()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(frame: u64, name: &str) -> SubmissionRecord {
        SubmissionRecord {
            frame,
            slot: (frame % 2) as usize,
            queue: QueueKind::Direct,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_history_keeps_most_recent() {
        let mut history = CommandHistory::new(2);
        history.record(record(1, "shadow"));
        history.record(record(2, "gbuffer"));
        history.record(record(3, "lighting"));

        let names: Vec<&str> = history.records().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["gbuffer", "lighting"]);
    }

    #[test]
    fn test_dump_lists_every_record() {
        let mut history = CommandHistory::new(8);
        history.record(record(7, "upload"));
        history.record(record(7, "present"));
        let dump = history.dump();
        assert_eq!(dump.lines().count(), 2);
        assert!(dump.contains("upload"));
        assert!(dump.contains("direct"));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut history = CommandHistory::new(0);
        history.record(record(1, "a"));
        assert_eq!(history.len(), 1);
    }
}
