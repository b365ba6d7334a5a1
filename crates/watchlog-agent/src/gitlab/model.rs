// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! GitLab API items and the summaries/events built from them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A project as configured: numeric id or `group/name` path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProjectRef {
    Id(u64),
    Path(String),
}

impl fmt::Display for ProjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectRef::Id(id) => write!(f, "{id}"),
            ProjectRef::Path(path) => f.write_str(path),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pipelines,
    Jobs,
    Mrs,
    Deployments,
    Runners,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Pipelines => "pipelines",
            ResourceKind::Jobs => "jobs",
            ResourceKind::Mrs => "mrs",
            ResourceKind::Deployments => "deployments",
            ResourceKind::Runners => "runners",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Common view over the incrementally collected items.
pub trait Tracked {
    fn key(&self) -> Option<u64>;
    fn updated_at(&self) -> Option<&str>;
    fn created_at(&self) -> Option<&str>;

    /// `updated_at`, falling back to `created_at`.
    fn touched_at(&self) -> Option<&str> {
        self.updated_at().or(self.created_at())
    }
}

macro_rules! tracked {
    ($item:ty, $key:ident) => {
        impl Tracked for $item {
            fn key(&self) -> Option<u64> {
                self.$key
            }
            fn updated_at(&self) -> Option<&str> {
                self.updated_at.as_deref()
            }
            fn created_at(&self) -> Option<&str> {
                self.created_at.as_deref()
            }
        }
    };
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pipeline {
    pub id: Option<u64>,
    pub status: Option<String>,
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub duration: Option<f64>,
    pub queued_duration: Option<f64>,
    pub web_url: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}
tracked!(Pipeline, id);

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub stage: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub duration: Option<f64>,
    pub queued_duration: Option<f64>,
    pub web_url: Option<String>,
    pub created_at: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub updated_at: Option<String>,
}
tracked!(Job, id);

#[derive(Debug, Clone, Deserialize)]
pub struct MergeRequest {
    pub id: Option<u64>,
    pub iid: Option<u64>,
    pub source_branch: Option<String>,
    pub target_branch: Option<String>,
    pub state: Option<String>,
    pub merged_at: Option<String>,
    pub closed_at: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub web_url: Option<String>,
}
tracked!(MergeRequest, iid);

#[derive(Debug, Clone, Deserialize)]
pub struct Deployment {
    pub id: Option<u64>,
    pub iid: Option<u64>,
    pub status: Option<String>,
    pub environment: Option<Value>,
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub sha: Option<String>,
    pub user: Option<Value>,
    pub web_url: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}
tracked!(Deployment, id);

impl Deployment {
    /// `environment.name`, or the environment itself when it is a plain string.
    pub fn environment_name(&self) -> Option<String> {
        match &self.environment {
            Some(Value::String(name)) => Some(name.clone()),
            Some(env) => env.get("name").and_then(Value::as_str).map(str::to_string),
            None => None,
        }
    }

    pub fn username(&self) -> Option<String> {
        self.user
            .as_ref()
            .and_then(|user| user.get("username"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Runner {
    pub id: Option<u64>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub is_shared: Option<bool>,
    pub locked: Option<bool>,
    pub contacted_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Commit {
    pub created_at: Option<String>,
}

/// `{kind, action}` block of an event document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventMeta {
    pub kind: &'static str,
    pub action: &'static str,
}

impl EventMeta {
    pub fn event(action: &'static str) -> Self {
        Self {
            kind: "event",
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub ts: String,
    #[serde(rename = "projectId")]
    pub project_id: ProjectRef,
    pub kind: ResourceKind,
    pub total: u64,
    /// `status_<status>` counters.
    #[serde(flatten)]
    pub statuses: BTreeMap<String, u64>,
    pub duration_avg: f64,
    pub duration_max: f64,
    pub queue_duration_avg: f64,
    pub queue_duration_max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeRequestSummary {
    pub ts: String,
    #[serde(rename = "projectId")]
    pub project_id: ProjectRef,
    pub kind: ResourceKind,
    pub total: u64,
    pub merged: u64,
    pub lead_time_avg: f64,
    pub stale_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentSummary {
    pub ts: String,
    #[serde(rename = "projectId")]
    pub project_id: ProjectRef,
    pub kind: ResourceKind,
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    /// Change failure rate, null without finished deployments.
    pub cfr: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunnerSummary {
    pub ts: String,
    #[serde(rename = "projectId")]
    pub project_id: ProjectRef,
    pub kind: ResourceKind,
    pub total: u64,
    pub online: u64,
    pub offline: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GitlabSummary {
    Run(RunSummary),
    MergeRequests(MergeRequestSummary),
    Deployments(DeploymentSummary),
    Runners(RunnerSummary),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineEvent {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub event: EventMeta,
    #[serde(rename = "type")]
    pub event_type: &'static str,
    #[serde(rename = "projectId")]
    pub project_id: ProjectRef,
    pub id: u64,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub duration: Option<f64>,
    pub queued_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub event: EventMeta,
    #[serde(rename = "type")]
    pub event_type: &'static str,
    #[serde(rename = "projectId")]
    pub project_id: ProjectRef,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub duration: Option<f64>,
    pub queued_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeRequestEvent {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub event: EventMeta,
    #[serde(rename = "type")]
    pub event_type: &'static str,
    #[serde(rename = "projectId")]
    pub project_id: ProjectRef,
    pub iid: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub merged_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    pub lead_time_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentEvent {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub event: EventMeta,
    #[serde(rename = "type")]
    pub event_type: &'static str,
    #[serde(rename = "projectId")]
    pub project_id: ProjectRef,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iid: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunnerEvent {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub event: EventMeta,
    #[serde(rename = "type")]
    pub event_type: &'static str,
    #[serde(rename = "projectId")]
    pub project_id: ProjectRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub is_shared: bool,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contacted_at: Option<String>,
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GitlabEvent {
    Pipeline(PipelineEvent),
    Job(JobEvent),
    MergeRequest(MergeRequestEvent),
    Deployment(DeploymentEvent),
    Runner(RunnerEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn project_refs_keep_their_json_type() {
        let projects: Vec<ProjectRef> = serde_json::from_value(json!([42, "group/app"])).unwrap();
        assert_eq!(
            projects,
            vec![ProjectRef::Id(42), ProjectRef::Path("group/app".into())]
        );
        assert_eq!(serde_json::to_value(&projects).unwrap(), json!([42, "group/app"]));
        assert_eq!(projects[1].to_string(), "group/app");
    }

    #[test]
    fn run_summary_flattens_status_counters() {
        let summary = GitlabSummary::Run(RunSummary {
            ts: "2024-05-01T10:00:00Z".into(),
            project_id: ProjectRef::Id(7),
            kind: ResourceKind::Pipelines,
            total: 2,
            statuses: BTreeMap::from([("status_success".to_string(), 2)]),
            duration_avg: 1.5,
            duration_max: 2.0,
            queue_duration_avg: 0.0,
            queue_duration_max: 0.0,
        });
        let value = serde_json::to_value(summary).unwrap();
        assert_eq!(value["kind"], "pipelines");
        assert_eq!(value["projectId"], 7);
        assert_eq!(value["status_success"], 2);
        assert!(value.get("statuses").is_none());
    }

    #[test]
    fn deployment_environment_accepts_object_or_string() {
        let deployment: Deployment = serde_json::from_value(json!({
            "id": 1,
            "environment": {"name": "production"},
            "user": {"username": "dev"}
        }))
        .unwrap();
        assert_eq!(deployment.environment_name().as_deref(), Some("production"));
        assert_eq!(deployment.username().as_deref(), Some("dev"));

        let deployment: Deployment =
            serde_json::from_value(json!({"id": 2, "environment": "staging"})).unwrap();
        assert_eq!(deployment.environment_name().as_deref(), Some("staging"));
        assert_eq!(deployment.username(), None);
    }

    #[test]
    fn touched_at_falls_back_to_created_at() {
        let pipeline: Pipeline =
            serde_json::from_value(json!({"id": 3, "created_at": "2024-05-01T10:00:00Z"})).unwrap();
        assert_eq!(pipeline.touched_at(), Some("2024-05-01T10:00:00Z"));
        assert!(parse_timestamp("2024-05-01T10:00:00.000Z").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
