use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use uuid::Uuid;

use crate::plan::Operation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum StepOutcome {
    Ok,
    Failed(String),
    Skipped(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: String,
    pub host: String,
    pub outcome: StepOutcome,
}

/// Resultado por (paso, host) de una ejecución.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub operation: Operation,
    pub controller: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub records: Vec<StepRecord>,
}

impl RunReport {
    pub fn start(operation: Operation) -> Self {
        let controller = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "desconocido".to_string());
        Self {
            run_id: Uuid::new_v4().to_string(),
            operation,
            controller,
            started_at: Utc::now(),
            finished_at: None,
            records: Vec::new(),
        }
    }

    pub fn record(&mut self, step: &str, host: &str, outcome: StepOutcome) {
        self.records.push(StepRecord {
            step: step.to_string(),
            host: host.to_string(),
            outcome,
        });
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r.outcome, StepOutcome::Failed(_)))
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }

    pub fn exit_code(&self) -> i32 {
        if self.has_failures() {
            1
        } else {
            0
        }
    }

    /// Hosts en los que `step` terminó bien.
    pub fn ok_hosts(&self, step: &str) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.step == step && r.outcome == StepOutcome::Ok)
            .map(|r| r.host.as_str())
            .collect()
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        self.records.iter().fold((0, 0, 0), |(ok, failed, skipped), r| match r.outcome {
            StepOutcome::Ok => (ok + 1, failed, skipped),
            StepOutcome::Failed(_) => (ok, failed + 1, skipped),
            StepOutcome::Skipped(_) => (ok, failed, skipped + 1),
        })
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let (ok, failed, skipped) = self.counts();
        let _ = writeln!(
            out,
            "{} [{}] desde {}: {} ok, {} fallidos, {} saltados",
            self.operation, self.run_id, self.controller, ok, failed, skipped
        );
        for r in &self.records {
            let status = match &r.outcome {
                StepOutcome::Ok => "ok".to_string(),
                StepOutcome::Failed(reason) => format!("FALLO: {}", reason),
                StepOutcome::Skipped(reason) => format!("saltado: {}", reason),
            };
            let _ = writeln!(out, "  {:<28} {:<20} {}", r.step, r.host, status);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_reflects_failures_only() {
        let mut report = RunReport::start(Operation::Start);
        report.record("start namenode", "a", StepOutcome::Ok);
        report.record("start datanode", "b", StepOutcome::Skipped("bloqueado".into()));
        assert_eq!(report.exit_code(), 0);

        report.record("start datanode", "c", StepOutcome::Failed("exit 1".into()));
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.counts(), (1, 1, 1));
        assert_eq!(report.failures().count(), 1);
    }

    #[test]
    fn json_carries_status_and_reason() {
        let mut report = RunReport::start(Operation::Stop { force: true });
        report.record("stop zkfc", "a", StepOutcome::Failed("timeout".into()));
        report.finish();

        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["operation"]["operation"], "stop");
        assert_eq!(v["operation"]["force"], true);
        assert_eq!(v["records"][0]["outcome"]["status"], "failed");
        assert_eq!(v["records"][0]["outcome"]["reason"], "timeout");
        assert!(v["finished_at"].is_string());
    }

    #[test]
    fn text_summary_lists_every_record() {
        let mut report = RunReport::start(Operation::Format);
        report.record("format namenode", "a", StepOutcome::Ok);
        report.record("bootstrap standby", "b", StepOutcome::Failed("exit 2".into()));
        let text = report.render_text();
        assert!(text.starts_with("format ["));
        assert!(text.contains("FALLO: exit 2"));
        assert_eq!(text.lines().count(), 3);
    }
}
