//! Execution event value type.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use pressflow_core::RunId;

/// Discriminated tag of an [`ExecutionEvent`].
///
/// The kebab-case name is also the SSE `event:` name seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionEventType {
    RunUpdated,
    RunCompleted,
    RunFailed,
    StepUpdated,
    StepCompleted,
    StepFailed,
    LogAppended,
}

impl ExecutionEventType {
    pub const ALL: [ExecutionEventType; 7] = [
        Self::RunUpdated,
        Self::RunCompleted,
        Self::RunFailed,
        Self::StepUpdated,
        Self::StepCompleted,
        Self::StepFailed,
        Self::LogAppended,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunUpdated => "run-updated",
            Self::RunCompleted => "run-completed",
            Self::RunFailed => "run-failed",
            Self::StepUpdated => "step-updated",
            Self::StepCompleted => "step-completed",
            Self::StepFailed => "step-failed",
            Self::LogAppended => "log-appended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl core::fmt::Display for ExecutionEventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state-change notification scoped to one execution run.
///
/// Immutable once built: publishers construct it, the bus hands out shared
/// references, nobody mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    event_type: ExecutionEventType,
    run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    step_key: Option<String>,
    #[serde(with = "iso8601")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    payload: serde_json::Value,
}

impl ExecutionEvent {
    /// Create an event stamped with the current time and an empty object payload.
    pub fn new(event_type: ExecutionEventType, run_id: RunId) -> Self {
        Self {
            event_type,
            run_id,
            step_key: None,
            timestamp: Utc::now(),
            payload: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_step(mut self, step_key: impl Into<String>) -> Self {
        self.step_key = Some(step_key.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn event_type(&self) -> ExecutionEventType {
        self.event_type
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn step_key(&self) -> Option<&str> {
        self.step_key.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

/// RFC 3339 / ISO-8601 with millisecond precision and a `Z` suffix.
mod iso8601 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
