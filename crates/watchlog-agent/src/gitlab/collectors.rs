// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One collector per resource kind. Each fetches what changed since the
//! watermark, keeps the unseen updates, summarizes them and emits.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::event::{Event, EventSink};
use crate::gitlab::api::{ApiError, GitlabApi, PAGE_CAP};
use crate::gitlab::gate::KindGates;
use crate::gitlab::model::{
    parse_timestamp, Commit, Deployment, DeploymentEvent, DeploymentSummary, EventMeta,
    GitlabEvent, GitlabSummary, Job, JobEvent, MergeRequest, MergeRequestEvent,
    MergeRequestSummary, Pipeline, PipelineEvent, ProjectRef, ResourceKind, RunSummary, Runner,
    RunnerEvent, RunnerSummary, Tracked,
};
use crate::gitlab::state::KindState;

const STALE_AFTER: ChronoDuration = ChronoDuration::hours(48);
const JOB_SCOPES: [&str; 7] = [
    "created", "pending", "running", "failed", "success", "canceled", "skipped",
];

/// Everything a collector needs besides its own state and gates.
pub struct CollectContext<'a> {
    pub api: &'a dyn GitlabApi,
    pub sink: &'a dyn EventSink,
    pub project: &'a ProjectRef,
    pub monitor_logs: bool,
    pub now: DateTime<Utc>,
}

impl CollectContext<'_> {
    fn segments(&self, tail: &[&str]) -> Vec<String> {
        let mut segments = vec!["projects".to_string(), self.project.to_string()];
        segments.extend(tail.iter().map(|segment| segment.to_string()));
        segments
    }

    fn gate_key(&self, kind: ResourceKind) -> String {
        format!("{}:{kind}", self.project)
    }

    /// Event batch first, then the summary; each only when it changed.
    fn emit(
        &self,
        kind: ResourceKind,
        gates: &mut KindGates,
        events: Option<Vec<GitlabEvent>>,
        summary: GitlabSummary,
    ) {
        let key = self.gate_key(kind);
        if let Some(events) = events {
            if gates.batch.admit(&key, &events) {
                self.sink.emit(Event::GitlabEvents(events));
            }
        }
        if gates.summary.admit(&key, &summary) {
            self.sink.emit(Event::GitlabSummary(summary));
        }
    }
}

struct Fresh<T> {
    item: T,
    key: u64,
    /// `updated_at` (or `created_at`) as sent by GitLab.
    touched: String,
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn maximum(values: &[f64]) -> f64 {
    values.iter().copied().fold(0.0, f64::max)
}

/// Keeps items with an id and a timestamp not older than `since` whose
/// update is new to `state`. Returns them with the newest timestamp seen.
fn select_fresh<T: Tracked + DeserializeOwned>(
    raw: Vec<Value>,
    since: DateTime<Utc>,
    state: &mut KindState,
) -> (Vec<Fresh<T>>, Option<DateTime<Utc>>) {
    let mut fresh = Vec::new();
    let mut newest = None;
    for value in raw {
        let Ok(item) = serde_json::from_value::<T>(value) else {
            continue;
        };
        let Some(key) = item.key() else {
            continue;
        };
        let Some(touched) = item.touched_at().map(str::to_string) else {
            continue;
        };
        let Some(touched_at) = parse_timestamp(&touched) else {
            continue;
        };
        if touched_at < since || !state.seen.accept(&key.to_string(), touched_at) {
            continue;
        }
        newest = newest.max(Some(touched_at));
        fresh.push(Fresh {
            item,
            key,
            touched,
        });
    }
    (fresh, newest)
}

fn incremental_query(since: DateTime<Utc>) -> Vec<(&'static str, String)> {
    vec![
        ("updated_after", iso(since)),
        ("order_by", "updated_at".to_string()),
        ("sort", "asc".to_string()),
    ]
}

fn status_histogram<'a>(statuses: impl Iterator<Item = Option<&'a str>>) -> BTreeMap<String, u64> {
    let mut histogram = BTreeMap::new();
    for status in statuses {
        let status = status.unwrap_or("unknown").to_lowercase();
        *histogram.entry(format!("status_{status}")).or_insert(0) += 1;
    }
    histogram
}

fn run_summary(
    ctx: &CollectContext<'_>,
    kind: ResourceKind,
    newest: Option<DateTime<Utc>>,
    statuses: BTreeMap<String, u64>,
    durations: &[f64],
    queued: &[f64],
) -> GitlabSummary {
    GitlabSummary::Run(RunSummary {
        ts: iso(newest.unwrap_or(ctx.now)),
        project_id: ctx.project.clone(),
        kind,
        total: statuses.values().sum(),
        statuses,
        duration_avg: round3(average(durations)),
        duration_max: maximum(durations),
        queue_duration_avg: round3(average(queued)),
        queue_duration_max: maximum(queued),
    })
}

fn finish(listing_error: Option<ApiError>, fresh: usize) -> Result<usize, ApiError> {
    match listing_error {
        Some(e) => Err(e),
        None => Ok(fresh),
    }
}

pub async fn collect_pipelines(
    ctx: &CollectContext<'_>,
    state: &mut KindState,
    gates: &mut KindGates,
) -> Result<usize, ApiError> {
    let since = state.since(ctx.now);
    let mut query = incremental_query(since);
    query.push(("with_stats", "true".to_string()));
    let listing = ctx
        .api
        .list(&ctx.segments(&["pipelines"]), &query, PAGE_CAP)
        .await;

    let (fresh, newest) = select_fresh::<Pipeline>(listing.items, since, state);
    if !fresh.is_empty() {
        let durations: Vec<f64> = fresh.iter().filter_map(|f| f.item.duration).collect();
        let queued: Vec<f64> = fresh.iter().filter_map(|f| f.item.queued_duration).collect();
        let statuses = status_histogram(fresh.iter().map(|f| f.item.status.as_deref()));
        let summary = run_summary(ctx, ResourceKind::Pipelines, newest, statuses, &durations, &queued);

        let events = ctx.monitor_logs.then(|| {
            fresh
                .iter()
                .map(|Fresh { item, key, touched }| {
                    GitlabEvent::Pipeline(PipelineEvent {
                        timestamp: touched.clone(),
                        event: EventMeta::event("pipeline"),
                        event_type: "pipeline",
                        project_id: ctx.project.clone(),
                        id: *key,
                        git_ref: item.git_ref.clone(),
                        status: item.status.clone(),
                        duration: item.duration,
                        queued_duration: item.queued_duration,
                        web_url: item.web_url.clone(),
                        created_at: item.created_at.clone(),
                        updated_at: item.updated_at.clone(),
                        event_id: format!("{}:pipeline:{key}:{touched}", ctx.project),
                    })
                })
                .collect()
        });
        ctx.emit(ResourceKind::Pipelines, gates, events, summary);
    }
    if let Some(newest) = newest {
        state.advance(newest);
    }
    finish(listing.error, fresh.len())
}

pub async fn collect_jobs(
    ctx: &CollectContext<'_>,
    state: &mut KindState,
    gates: &mut KindGates,
) -> Result<usize, ApiError> {
    let since = state.since(ctx.now);
    let mut query = incremental_query(since);
    query.extend(JOB_SCOPES.iter().map(|scope| ("scope[]", scope.to_string())));
    let listing = ctx
        .api
        .list(&ctx.segments(&["jobs"]), &query, PAGE_CAP)
        .await;

    let (fresh, newest) = select_fresh::<Job>(listing.items, since, state);
    if !fresh.is_empty() {
        let durations: Vec<f64> = fresh.iter().filter_map(|f| f.item.duration).collect();
        let queued: Vec<f64> = fresh.iter().filter_map(|f| f.item.queued_duration).collect();
        let statuses = status_histogram(fresh.iter().map(|f| f.item.status.as_deref()));
        let summary = run_summary(ctx, ResourceKind::Jobs, newest, statuses, &durations, &queued);

        let events = ctx.monitor_logs.then(|| {
            fresh
                .iter()
                .map(|Fresh { item, key, touched }| {
                    GitlabEvent::Job(JobEvent {
                        timestamp: touched.clone(),
                        event: EventMeta::event("job"),
                        event_type: "job",
                        project_id: ctx.project.clone(),
                        id: *key,
                        name: item.name.clone(),
                        stage: item.stage.clone(),
                        git_ref: item.git_ref.clone(),
                        status: item.status.clone(),
                        duration: item.duration,
                        queued_duration: item.queued_duration,
                        web_url: item.web_url.clone(),
                        created_at: item.created_at.clone(),
                        started_at: item.started_at.clone(),
                        finished_at: item.finished_at.clone(),
                        updated_at: item.updated_at.clone(),
                        event_id: format!("{}:job:{key}:{touched}", ctx.project),
                    })
                })
                .collect()
        });
        ctx.emit(ResourceKind::Jobs, gates, events, summary);
    }
    if let Some(newest) = newest {
        state.advance(newest);
    }
    finish(listing.error, fresh.len())
}

/// Creation time of the first commit of a merge request, if GitLab returns one.
async fn first_commit_at(ctx: &CollectContext<'_>, iid: u64) -> Option<String> {
    let listing = ctx
        .api
        .list(
            &ctx.segments(&["merge_requests", &iid.to_string(), "commits"]),
            &[("per_page", "1".to_string())],
            1,
        )
        .await;
    if let Some(e) = &listing.error {
        debug!("GITLAB | No commits for {} !{iid}: {e}", ctx.project);
    }
    listing
        .items
        .into_iter()
        .next()
        .and_then(|value| serde_json::from_value::<Commit>(value).ok())
        .and_then(|commit| commit.created_at)
}

pub async fn collect_merge_requests(
    ctx: &CollectContext<'_>,
    state: &mut KindState,
    gates: &mut KindGates,
) -> Result<usize, ApiError> {
    let since = state.since(ctx.now);
    let mut query = incremental_query(since);
    query.push(("state", "all".to_string()));
    let listing = ctx
        .api
        .list(&ctx.segments(&["merge_requests"]), &query, PAGE_CAP)
        .await;

    let (fresh, newest) = select_fresh::<MergeRequest>(listing.items, since, state);
    if !fresh.is_empty() {
        let mut leads = Vec::with_capacity(fresh.len());
        let mut lead_by_iid = Vec::with_capacity(fresh.len());
        let mut stale_count = 0;
        for Fresh { item, .. } in &fresh {
            let first_commit = match item.iid {
                Some(iid) => first_commit_at(ctx, iid).await,
                None => None,
            }
            .or_else(|| item.created_at.clone());

            let lead = match (item.merged_at.as_deref(), first_commit.as_deref()) {
                (Some(merged), Some(first)) => parse_timestamp(merged)
                    .zip(parse_timestamp(first))
                    .map(|(merged, first)| (merged - first).num_milliseconds() as f64 / 1000.0),
                _ => None,
            };
            if let Some(lead) = lead {
                leads.push(lead);
            }
            lead_by_iid.push(lead);

            let open = item.merged_at.is_none() && item.closed_at.is_none();
            let created = item.created_at.as_deref().and_then(parse_timestamp);
            if open && created.is_some_and(|created| ctx.now - created > STALE_AFTER) {
                stale_count += 1;
            }
        }

        let summary = GitlabSummary::MergeRequests(MergeRequestSummary {
            ts: iso(newest.unwrap_or(ctx.now)),
            project_id: ctx.project.clone(),
            kind: ResourceKind::Mrs,
            total: fresh.len() as u64,
            merged: fresh.iter().filter(|f| f.item.merged_at.is_some()).count() as u64,
            lead_time_avg: round3(average(&leads)),
            stale_count,
        });

        let events = ctx.monitor_logs.then(|| {
            fresh
                .iter()
                .zip(&lead_by_iid)
                .map(|(Fresh { item, key, touched }, lead)| {
                    GitlabEvent::MergeRequest(MergeRequestEvent {
                        timestamp: touched.clone(),
                        event: EventMeta::event("merge_request"),
                        event_type: "mr",
                        project_id: ctx.project.clone(),
                        iid: *key,
                        id: item.id,
                        source_branch: item.source_branch.clone(),
                        target_branch: item.target_branch.clone(),
                        state: item.state.clone(),
                        merged_at: item.merged_at.clone(),
                        created_at: item.created_at.clone(),
                        updated_at: item.updated_at.clone(),
                        lead_time_sec: *lead,
                        web_url: item.web_url.clone(),
                        event_id: format!("{}:mr:{key}:{touched}", ctx.project),
                    })
                })
                .collect()
        });
        ctx.emit(ResourceKind::Mrs, gates, events, summary);
    }
    if let Some(newest) = newest {
        state.advance(newest);
    }
    finish(listing.error, fresh.len())
}

pub async fn collect_deployments(
    ctx: &CollectContext<'_>,
    state: &mut KindState,
    gates: &mut KindGates,
) -> Result<usize, ApiError> {
    let since = state.since(ctx.now);
    let query = incremental_query(since);
    let listing = ctx
        .api
        .list(&ctx.segments(&["deployments"]), &query, PAGE_CAP)
        .await;

    let (fresh, newest) = select_fresh::<Deployment>(listing.items, since, state);
    if !fresh.is_empty() {
        let success = fresh
            .iter()
            .filter(|f| f.item.status.as_deref() == Some("success"))
            .count() as u64;
        let failed = fresh
            .iter()
            .filter(|f| f.item.status.as_deref() == Some("failed"))
            .count() as u64;
        let finished = success + failed;
        let summary = GitlabSummary::Deployments(DeploymentSummary {
            ts: iso(newest.unwrap_or(ctx.now)),
            project_id: ctx.project.clone(),
            kind: ResourceKind::Deployments,
            total: fresh.len() as u64,
            success,
            failed,
            cfr: (finished > 0).then(|| round3(failed as f64 / finished as f64)),
        });

        let events = ctx.monitor_logs.then(|| {
            fresh
                .iter()
                .map(|Fresh { item, key, touched }| {
                    GitlabEvent::Deployment(DeploymentEvent {
                        timestamp: touched.clone(),
                        event: EventMeta::event("deployment"),
                        event_type: "deployment",
                        project_id: ctx.project.clone(),
                        id: *key,
                        iid: item.iid,
                        status: item.status.clone(),
                        environment: item.environment_name(),
                        created_at: item.created_at.clone(),
                        updated_at: item.updated_at.clone(),
                        git_ref: item.git_ref.clone(),
                        sha: item.sha.clone(),
                        user: item.username(),
                        web_url: item.web_url.clone(),
                        event_id: format!("{}:deployment:{key}:{touched}", ctx.project),
                    })
                })
                .collect()
        });
        ctx.emit(ResourceKind::Deployments, gates, events, summary);
    }
    if let Some(newest) = newest {
        state.advance(newest);
    }
    finish(listing.error, fresh.len())
}

/// Runners are a snapshot, so a failed page emits nothing rather than a
/// partial picture.
pub async fn collect_runners(
    ctx: &CollectContext<'_>,
    gates: &mut KindGates,
) -> Result<usize, ApiError> {
    let listing = ctx
        .api
        .list(&ctx.segments(&["runners"]), &[], PAGE_CAP)
        .await;
    if let Some(e) = listing.error {
        return Err(e);
    }

    let runners: Vec<Runner> = listing
        .items
        .into_iter()
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect();
    let ts = iso(ctx.now);
    let total = runners.len() as u64;
    let online = runners
        .iter()
        .filter(|runner| runner.status.as_deref() == Some("online"))
        .count() as u64;
    let summary = GitlabSummary::Runners(RunnerSummary {
        ts: ts.clone(),
        project_id: ctx.project.clone(),
        kind: ResourceKind::Runners,
        total,
        online,
        offline: total.saturating_sub(online),
    });

    let events = (ctx.monitor_logs && !runners.is_empty()).then(|| {
        runners
            .iter()
            .map(|runner| {
                let seen = runner.contacted_at.clone().unwrap_or_else(|| ts.clone());
                let id = runner.id.map(|id| id.to_string()).unwrap_or_default();
                GitlabEvent::Runner(RunnerEvent {
                    timestamp: seen.clone(),
                    event: EventMeta {
                        kind: "metric",
                        action: "runner",
                    },
                    event_type: "runner",
                    project_id: ctx.project.clone(),
                    id: runner.id,
                    description: runner.description.clone(),
                    status: runner.status.clone(),
                    is_shared: runner.is_shared.unwrap_or(false),
                    locked: runner.locked.unwrap_or(false),
                    contacted_at: runner.contacted_at.clone(),
                    event_id: format!("{}:runner:{id}:{seen}", ctx.project),
                })
            })
            .collect()
    });
    ctx.emit(ResourceKind::Runners, gates, events, summary);
    Ok(runners.len())
}
