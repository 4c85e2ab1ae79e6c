//! Bulk job status as reported by the read and write endpoints

use std::fmt;

use serde_json::{Map, Value};

use crate::{Error, Result};

/// Lifecycle state of a bulk job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Added,
    InProgress,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
    /// Missing or unrecognized state string.
    Unknown,
}

impl JobState {
    /// Case-insensitive; spaces, hyphens and underscores are equivalent,
    /// so `"IN PROGRESS"` and `"in_progress"` both parse.
    pub fn parse(raw: &str) -> Self {
        let normalized: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        match normalized.as_str() {
            "ADDED" => JobState::Added,
            "IN_PROGRESS" => JobState::InProgress,
            "COMPLETED" => JobState::Completed,
            "COMPLETED_WITH_ERRORS" => JobState::CompletedWithErrors,
            "FAILED" => JobState::Failed,
            "CANCELLED" => JobState::Cancelled,
            _ => JobState::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::CompletedWithErrors
                | JobState::Failed
                | JobState::Cancelled
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(self, JobState::Failed | JobState::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Added => "ADDED",
            JobState::InProgress => "IN_PROGRESS",
            JobState::Completed => "COMPLETED",
            JobState::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
            JobState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed view of a bulk job response. `raw` keeps the full object.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub id: Option<String>,
    pub state: JobState,
    pub more_records: bool,
    pub download_url: Option<String>,
    pub page: Option<u64>,
    pub raw: Value,
}

impl JobStatus {
    /// Accepts a bare job object or a `{"data": [job, ...]}` envelope.
    pub fn from_value(payload: Value) -> Result<Self> {
        let job = match payload {
            Value::Object(mut map) => match map.remove("data") {
                Some(Value::Array(items)) if !items.is_empty() => {
                    items.into_iter().next().unwrap_or(Value::Null)
                }
                Some(other) => {
                    map.insert("data".into(), other);
                    Value::Object(map)
                }
                None => Value::Object(map),
            },
            _ => Value::Null,
        };
        let Value::Object(fields) = &job else {
            return Err(Error::request(
                "bulk job response was empty",
                Some(500),
                Some("INVALID_BULK_RESPONSE"),
            ));
        };

        let id = ["id", "job_id"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(scalar_string));
        let state = ["state", "status"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_str))
            .map(JobState::parse)
            .unwrap_or(JobState::Unknown);
        let result = fields.get("result").and_then(Value::as_object);

        Ok(Self {
            id,
            state,
            more_records: more_records(result, fields),
            download_url: result
                .and_then(|r| r.get("download_url"))
                .and_then(Value::as_str)
                .map(str::to_string),
            page: result.and_then(|r| r.get("page")).and_then(Value::as_u64),
            raw: job,
        })
    }

    /// Job id, or an error when the server omitted it.
    pub fn job_id(&self) -> Result<&str> {
        self.id.as_deref().ok_or_else(|| {
            Error::request(
                "bulk job response did not include a job id",
                Some(500),
                Some("MISSING_JOB_ID"),
            )
        })
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn more_records(result: Option<&Map<String, Value>>, top: &Map<String, Value>) -> bool {
    const KEYS: [&str; 2] = ["more_records", "moreRecords"];
    result
        .into_iter()
        .chain(std::iter::once(top))
        .flat_map(|scope| KEYS.into_iter().filter_map(move |key| scope.get(key)))
        .find_map(Value::as_bool)
        .unwrap_or(false)
}
