//! GitHub webhook payload shapes for every allow-listed event. C1 only
//! derives Jobs from `workflow_job`, but every declared event still gets a
//! typed shape so step 5 ("validate payload schema for declared event")
//! rejects a malformed `push` or `deployment` body the same way it rejects
//! a malformed `workflow_job` one, instead of letting anything with
//! matching JSON syntax through unchecked.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Owner {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Repository {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    pub owner: Owner,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowJobAction {
    Queued,
    InProgress,
    Completed,
    Waiting,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowJobPayload {
    pub id: u64,
    pub run_id: u64,
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
    pub labels: Vec<String>,
    pub runner_id: Option<u64>,
    pub runner_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowJobEvent {
    pub action: WorkflowJobAction,
    pub repository: Repository,
    pub workflow_job: WorkflowJobPayload,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowRunEvent {
    pub action: String,
    pub repository: Repository,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub repository: Repository,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub number: u64,
    pub repository: Repository,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeploymentEvent {
    pub action: String,
    pub repository: Repository,
}

/// `security_advisory` is an org-level event with no `repository` field.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityAdvisoryEvent {
    pub action: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PingEvent {
    pub zen: String,
    pub hook_id: u64,
}

/// The event kinds C1 accepts; anything else is acknowledged but ignored
/// (`spec.md` §4.1 step 3). Every one of these has a matching typed shape
/// above that `validate_schema` deserializes into.
pub const ALLOWED_EVENTS: &[&str] = &[
    "workflow_job",
    "workflow_run",
    "push",
    "pull_request",
    "deployment",
    "security_advisory",
    "ping",
];

/// Step 5 of `spec.md` §4.1: reject a declared event whose body doesn't
/// match that event's schema, before it reaches dedup/derivation.
pub fn validate_schema(event_type: &str, body: &[u8]) -> Result<(), serde_json::Error> {
    match event_type {
        "workflow_job" => serde_json::from_slice::<WorkflowJobEvent>(body).map(|_| ()),
        "workflow_run" => serde_json::from_slice::<WorkflowRunEvent>(body).map(|_| ()),
        "push" => serde_json::from_slice::<PushEvent>(body).map(|_| ()),
        "pull_request" => serde_json::from_slice::<PullRequestEvent>(body).map(|_| ()),
        "deployment" => serde_json::from_slice::<DeploymentEvent>(body).map(|_| ()),
        "security_advisory" => serde_json::from_slice::<SecurityAdvisoryEvent>(body).map(|_| ()),
        "ping" => serde_json::from_slice::<PingEvent>(body).map(|_| ()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_event_requires_ref_and_repository() {
        let valid = serde_json::json!({
            "ref": "refs/heads/main",
            "repository": {"id": 1, "name": "svc", "full_name": "acme/svc", "owner": {"login": "acme"}},
        });
        assert!(validate_schema("push", &serde_json::to_vec(&valid).unwrap()).is_ok());

        let missing_ref = serde_json::json!({
            "repository": {"id": 1, "name": "svc", "full_name": "acme/svc", "owner": {"login": "acme"}},
        });
        assert!(validate_schema("push", &serde_json::to_vec(&missing_ref).unwrap()).is_err());
    }

    #[test]
    fn security_advisory_needs_no_repository() {
        let valid = serde_json::json!({"action": "published"});
        assert!(validate_schema("security_advisory", &serde_json::to_vec(&valid).unwrap()).is_ok());
    }

    #[test]
    fn ping_requires_zen_and_hook_id() {
        let valid = serde_json::json!({"zen": "Non-blocking is better than blocking.", "hook_id": 42});
        assert!(validate_schema("ping", &serde_json::to_vec(&valid).unwrap()).is_ok());

        let malformed = serde_json::json!({"zen": "missing hook id"});
        assert!(validate_schema("ping", &serde_json::to_vec(&malformed).unwrap()).is_err());
    }

    #[test]
    fn unmodelled_event_type_passes_through() {
        assert!(validate_schema("some_future_event", b"not even json").is_ok());
    }
}
