use serde::Deserialize;
use serde_json::Value as JsonValue;

use pressflow_core::RunId;
use pressflow_events::{ExecutionEvent, ExecutionEventType};
use pressflow_infra::jobs::JobStatus;

/// Attempts granted to a job when the request does not say.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Page size for `GET /jobs` when `limit` is omitted.
pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: JsonValue,
    pub max_attempts: Option<u32>,
    pub run_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

impl ListJobsQuery {
    pub fn status(&self) -> Result<Option<JobStatus>, String> {
        match self.status.as_deref() {
            None | Some("") => Ok(None),
            Some(s) => JobStatus::parse(s).map(Some).ok_or_else(|| {
                let known: Vec<_> = JobStatus::ALL.iter().map(|s| s.as_str()).collect();
                format!("unknown status '{}'; expected one of: {}", s, known.join(", "))
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)
    }
}

/// Body of `POST /runs/:run_id/events`, and the payload of a `run.event` job.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishEventRequest {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, alias = "stepKey")]
    pub step_key: Option<String>,
    #[serde(default)]
    pub payload: JsonValue,
}

impl PublishEventRequest {
    pub fn into_event(self, run_id: RunId) -> Result<ExecutionEvent, String> {
        let event_type = ExecutionEventType::parse(&self.event_type)
            .ok_or_else(|| format!("unknown event type: {}", self.event_type))?;

        let mut event = ExecutionEvent::new(event_type, run_id).with_payload(self.payload);
        if let Some(step_key) = self.step_key {
            event = event.with_step(step_key);
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_query_defaults_and_caps() {
        let q = ListJobsQuery::default();
        assert_eq!(q.limit(), DEFAULT_LIST_LIMIT);
        assert_eq!(q.status().unwrap(), None);

        let q = ListJobsQuery {
            status: Some("dead".into()),
            limit: Some(50_000),
        };
        assert_eq!(q.limit(), MAX_LIST_LIMIT);
        assert_eq!(q.status().unwrap(), Some(JobStatus::Dead));

        let q = ListJobsQuery {
            status: Some("zombie".into()),
            limit: None,
        };
        assert!(q.status().unwrap_err().contains("zombie"));
    }

    #[test]
    fn publish_request_builds_event() {
        let req: PublishEventRequest = serde_json::from_value(serde_json::json!({
            "type": "step-completed",
            "stepKey": "score",
            "payload": {"score": 87}
        }))
        .unwrap();

        let event = req.into_event(RunId::new("run-1").unwrap()).unwrap();
        assert_eq!(event.event_type(), ExecutionEventType::StepCompleted);
        assert_eq!(event.step_key(), Some("score"));
        assert_eq!(event.payload()["score"], 87);
    }

    #[test]
    fn publish_request_rejects_unknown_type() {
        let req = PublishEventRequest {
            event_type: "run-exploded".into(),
            step_key: None,
            payload: JsonValue::Null,
        };
        assert!(req.into_event(RunId::new("run-1").unwrap()).is_err());
    }
}
