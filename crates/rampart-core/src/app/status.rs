//! Status - キュー横断のステータス集計

use serde::{Deserialize, Serialize};

use crate::ports::QueueCounts;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queue: String,
    pub counts: QueueCounts,
}

/// Counts by state for every queue, plus the sum.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub queues: Vec<QueueStatus>,
    pub totals: QueueCounts,
}

impl StatusReport {
    pub fn from_counts(by_queue: Vec<(String, QueueCounts)>) -> Self {
        let mut totals = QueueCounts::default();
        let queues = by_queue
            .into_iter()
            .map(|(queue, counts)| {
                totals.merge(&counts);
                QueueStatus { queue, counts }
            })
            .collect();
        Self { queues, totals }
    }

    pub fn queue(&self, name: &str) -> Option<&QueueCounts> {
        self.queues.iter().find(|q| q.queue == name).map(|q| &q.counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_sum_all_queues() {
        let report = StatusReport::from_counts(vec![
            (
                "enrichment".into(),
                QueueCounts {
                    pending: 2,
                    completed: 1,
                    ..Default::default()
                },
            ),
            (
                "outreach".into(),
                QueueCounts {
                    pending: 1,
                    failed: 3,
                    ..Default::default()
                },
            ),
        ]);

        assert_eq!(report.totals.pending, 3);
        assert_eq!(report.totals.failed, 3);
        assert_eq!(report.totals.total(), 7);
        assert_eq!(report.queue("outreach").map(|c| c.failed), Some(3));
        assert!(report.queue("missing").is_none());
    }
}
