//! Run report and its human-readable summary.

use serde::Serialize;
use uuid::Uuid;

use crate::throughput::PairOutcome;

/// How one scheduled phase ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Cancelled before its start delay elapsed; nothing was launched.
    Skipped,
    Finished(PairOutcome),
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub device: String,
    pub phase: u8,
    #[serde(flatten)]
    pub status: PhaseStatus,
}

/// A device section that never got as far as a scheduled phase.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceFailure {
    pub section: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub interrupted: bool,
    pub phases: Vec<PhaseReport>,
    pub failures: Vec<DeviceFailure>,
}

impl RunReport {
    /// Phases that failed plus devices that were never scheduled.
    pub fn failed_count(&self) -> usize {
        self.phases
            .iter()
            .filter(|p| matches!(p.status, PhaseStatus::Failed(_)))
            .count()
            + self.failures.len()
    }

    pub fn format_summary(&self) -> String {
        let mut summary = format!(
            "Load test {} {} ({} phase{}, {} failure{})\n",
            self.run_id,
            if self.interrupted { "interrupted" } else { "finished" },
            self.phases.len(),
            if self.phases.len() == 1 { "" } else { "s" },
            self.failed_count(),
            if self.failed_count() == 1 { "" } else { "s" },
        );

        for p in &self.phases {
            let status = match &p.status {
                PhaseStatus::Skipped => "skipped".to_string(),
                PhaseStatus::Finished(PairOutcome::Completed) => "completed".to_string(),
                PhaseStatus::Finished(PairOutcome::Cancelled) => "cancelled".to_string(),
                PhaseStatus::Finished(PairOutcome::DurationExpired) => {
                    "completed (client killed at end of phase)".to_string()
                }
                PhaseStatus::Failed(e) => format!("FAILED: {}", e),
            };
            summary.push_str(&format!("  {:<16} phase {}  {}\n", p.device, p.phase, status));
        }

        for f in &self.failures {
            summary.push_str(&format!("  [{}] not run: {}\n", f.section, f.error));
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> RunReport {
        RunReport {
            run_id: Uuid::nil(),
            interrupted: true,
            phases: vec![
                PhaseReport {
                    device: "eth0".into(),
                    phase: 0,
                    status: PhaseStatus::Finished(PairOutcome::Cancelled),
                },
                PhaseReport {
                    device: "eth0".into(),
                    phase: 1,
                    status: PhaseStatus::Skipped,
                },
                PhaseReport {
                    device: "wwan0".into(),
                    phase: 0,
                    status: PhaseStatus::Failed("failed to connect to 10.0.0.2: refused".into()),
                },
            ],
            failures: vec![DeviceFailure {
                section: "ue3".into(),
                error: "missing required key 't1'".into(),
            }],
        }
    }

    #[test]
    fn test_format_summary() {
        let summary = report().format_summary();
        assert!(summary.contains("interrupted (3 phases, 2 failures)"));
        assert!(summary.contains("phase 0  cancelled"));
        assert!(summary.contains("phase 1  skipped"));
        assert!(summary.contains("FAILED: failed to connect"));
        assert!(summary.contains("[ue3] not run"));
    }

    #[test]
    fn test_report_serializes_status_inline() {
        let json = serde_json::to_value(report()).unwrap();
        assert_eq!(json["phases"][0]["status"], "finished");
        assert_eq!(json["phases"][0]["detail"], "cancelled");
        assert_eq!(json["phases"][1]["status"], "skipped");
        assert_eq!(json["failures"][0]["section"], "ue3");
    }
}
