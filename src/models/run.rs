use crate::models::{Fields, Record};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Complete | RunStatus::Failed)
    }

    /// Status only moves forward and never leaves a terminal state.
    pub fn can_advance_to(self, next: RunStatus) -> bool {
        match self {
            RunStatus::Pending => next != RunStatus::Pending,
            RunStatus::Running => next.is_terminal(),
            RunStatus::Complete | RunStatus::Failed => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Complete => "complete",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "complete" => Some(RunStatus::Complete),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What grading produced, stored on the run once it is terminal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub score: f64,
    pub retcode: i32,
    pub output: String,
}

pub fn status_of(record: &Record) -> Option<RunStatus> {
    record.field_str("status").and_then(RunStatus::parse)
}

fn now() -> Value {
    Value::from(Utc::now().to_rfc3339())
}

/// Fields of a freshly queued run.
pub fn pending_fields(submission: Uuid, test: Uuid) -> Fields {
    let mut fields = Fields::new();
    fields.insert("submission".into(), Value::from(submission.to_string()));
    fields.insert("test".into(), Value::from(test.to_string()));
    fields.insert("status".into(), Value::from(RunStatus::Pending.as_str()));
    fields.insert("result".into(), Value::Null);
    fields.insert("created".into(), now());
    fields.insert("started".into(), Value::Null);
    fields.insert("finished".into(), Value::Null);
    fields
}

/// Moves the run to `next`, attaching `result` when `next` is terminal.
///
/// Returns false and leaves the record alone when the move would go backwards.
pub fn advance(record: &mut Record, next: RunStatus, result: Option<&RunResult>) -> bool {
    let current = status_of(record).unwrap_or(RunStatus::Pending);
    if !current.can_advance_to(next) {
        return false;
    }
    record
        .fields
        .insert("status".into(), Value::from(next.as_str()));
    if next == RunStatus::Running {
        record.fields.insert("started".into(), now());
    }
    if next.is_terminal() {
        record.fields.insert("finished".into(), now());
        let result = match result {
            Some(result) => json!(result),
            None => Value::Null,
        };
        record.fields.insert("result".into(), result);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_of(record: &Record) -> Option<RunResult> {
        record
            .fields
            .get("result")
            .filter(|value| !value.is_null())
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    fn pending() -> Record {
        Record::new(None, pending_fields(Uuid::new_v4(), Uuid::new_v4()))
    }

    #[test]
    fn status_never_goes_back() {
        use RunStatus::*;
        assert!(Pending.can_advance_to(Running));
        assert!(Pending.can_advance_to(Failed));
        assert!(Running.can_advance_to(Complete));
        assert!(!Running.can_advance_to(Pending));
        assert!(!Running.can_advance_to(Running));
        assert!(!Complete.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Running));
    }

    #[test]
    fn result_only_appears_on_terminal_transition() {
        let mut run = pending();
        assert_eq!(result_of(&run), None);

        let result = RunResult {
            score: 10.0,
            retcode: 0,
            output: "ok".into(),
        };
        assert!(advance(&mut run, RunStatus::Running, Some(&result)));
        assert_eq!(result_of(&run), None);
        assert!(!run.fields["started"].is_null());

        assert!(advance(&mut run, RunStatus::Complete, Some(&result)));
        assert_eq!(status_of(&run), Some(RunStatus::Complete));
        assert_eq!(result_of(&run), Some(result));

        assert!(!advance(&mut run, RunStatus::Failed, None));
        assert_eq!(status_of(&run), Some(RunStatus::Complete));
    }
}
