use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Events emitted while the fleet runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    /// An issue pipeline was spawned.
    Started { issue: u64 },
    /// An issue finished; `report` says how.
    Finished { issue: u64, report: IssueReport },
    /// An issue can no longer run because a dependency failed.
    Blocked { issue: u64 },
    /// Cancellation was requested; no new issues will start.
    Interrupted { in_flight: Vec<u64> },
    /// The control loop exited.
    FleetCompleted { summary: FleetSummary },
}

/// Final disposition of one issue in a fleet run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IssueReport {
    Completed,
    CompletedWithFailures { failed_phases: Vec<u32> },
    Failed { error: String },
    Blocked,
    Cancelled,
    /// Completed in an earlier run and not executed again
    AlreadyCompleted,
}

/// Counts and per-issue results of a fleet run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetSummary {
    pub total_issues: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub cancelled: usize,
    pub skipped: usize,
    /// Total run time in milliseconds
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    #[serde(default)]
    pub issues: BTreeMap<u64, IssueReport>,
}

impl FleetSummary {
    pub fn new(total_issues: usize) -> Self {
        Self {
            total_issues,
            ..Default::default()
        }
    }

    /// Record the report for `issue`, replacing any earlier one.
    pub fn add(&mut self, issue: u64, report: IssueReport) {
        if let Some(previous) = self.issues.insert(issue, report.clone()) {
            self.adjust(&previous, -1);
        }
        self.adjust(&report, 1);
    }

    fn adjust(&mut self, report: &IssueReport, delta: isize) {
        let counter = match report {
            IssueReport::Completed => &mut self.completed,
            IssueReport::CompletedWithFailures { .. } | IssueReport::Failed { .. } => {
                &mut self.failed
            }
            IssueReport::Blocked => &mut self.blocked,
            IssueReport::Cancelled => &mut self.cancelled,
            IssueReport::AlreadyCompleted => &mut self.skipped,
        };
        *counter = counter.saturating_add_signed(delta);
    }

    /// Whether every issue completed, now or in an earlier run.
    pub fn all_success(&self) -> bool {
        self.completed + self.skipped == self.total_issues
    }

    /// Whether the run stopped early on an interrupt.
    pub fn interrupted(&self) -> bool {
        self.cancelled > 0
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.total_issues == 0 {
            return 100.0;
        }
        ((self.completed + self.skipped) as f64 / self.total_issues as f64) * 100.0
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
