// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Incremental GitLab CI collection: pipelines, jobs, merge requests,
//! deployments and runners for every configured project.

pub mod api;
pub mod collectors;
pub mod gate;
pub mod model;
pub mod state;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, IntegrationDescriptor};
use crate::event::EventSink;
use api::{ApiError, GitlabApi};
use collectors::{
    collect_deployments, collect_jobs, collect_merge_requests, collect_pipelines, collect_runners,
    CollectContext,
};
use gate::ProjectGates;
use model::{ProjectRef, ResourceKind};
use state::{CollectorState, ProjectState};

pub const DEFAULT_BASE_URL: &str = "https://gitlab.com";
const DEFAULT_INTERVAL_SECS: f64 = 60.0;
const MIN_INTERVAL_SECS: f64 = 10.0;
const MAX_START_JITTER_MS: u64 = 2000;

fn enabled() -> bool {
    true
}

/// Which resource kinds are collected.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KindToggles {
    #[serde(default = "enabled")]
    pub pipelines: bool,
    #[serde(default = "enabled")]
    pub jobs: bool,
    #[serde(default = "enabled")]
    pub runners: bool,
    #[serde(default = "enabled")]
    pub mrs: bool,
    #[serde(default = "enabled")]
    pub deployments: bool,
}

impl Default for KindToggles {
    fn default() -> Self {
        Self {
            pipelines: true,
            jobs: true,
            runners: true,
            mrs: true,
            deployments: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GitlabSettings {
    base_url: Option<String>,
    token: Option<String>,
    #[serde(default)]
    projects: Vec<ProjectRef>,
    interval: Option<Value>,
    #[serde(default)]
    metrics: KindToggles,
    #[serde(default)]
    monitor_logs: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GitlabConfig {
    pub base_url: String,
    pub token: String,
    pub projects: Vec<ProjectRef>,
    pub interval: Duration,
    pub metrics: KindToggles,
    pub monitor_logs: bool,
}

impl GitlabConfig {
    /// Reads the `gitlab` entry of the integrations file. An entry without
    /// projects is rejected.
    pub fn from_descriptor(descriptor: &IntegrationDescriptor) -> Result<Self, ConfigError> {
        let settings: GitlabSettings =
            descriptor
                .settings_as()
                .map_err(|e| ConfigError::Integration {
                    service: "gitlab",
                    reason: e.to_string(),
                })?;
        if settings.projects.is_empty() {
            return Err(ConfigError::Integration {
                service: "gitlab",
                reason: "no projects configured".to_string(),
            });
        }

        let base_url = settings
            .base_url
            .as_deref()
            .map(|url| url.trim().trim_end_matches('/'))
            .filter(|url| !url.is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
            .to_string();

        let interval = settings
            .interval
            .as_ref()
            .and_then(|value| match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .unwrap_or(DEFAULT_INTERVAL_SECS)
            .max(MIN_INTERVAL_SECS);
        let interval =
            Duration::try_from_secs_f64(interval).map_err(|e| ConfigError::Integration {
                service: "gitlab",
                reason: format!("interval {interval}: {e}"),
            })?;

        Ok(Self {
            base_url,
            token: settings.token.unwrap_or_default(),
            projects: settings.projects,
            interval,
            metrics: settings.metrics,
            monitor_logs: settings.monitor_logs,
        })
    }
}

async fn when<F, T>(wanted: bool, collect: F) -> Option<T>
where
    F: Future<Output = T>,
{
    if wanted {
        Some(collect.await)
    } else {
        None
    }
}

fn report(project: &ProjectRef, kind: ResourceKind, outcome: Option<Result<usize, ApiError>>) {
    match outcome {
        None => {}
        Some(Ok(fresh)) => debug!("GITLAB | {project} {kind}: {fresh} fresh"),
        Some(Err(e)) => warn!("GITLAB | {project} {kind} failed: {e}"),
    }
}

/// Drives the collectors on a fixed period and persists their state.
pub struct GitlabMonitor {
    config: GitlabConfig,
    api: Arc<dyn GitlabApi>,
    sink: Arc<dyn EventSink>,
    state: CollectorState,
    state_path: PathBuf,
    gates: HashMap<String, ProjectGates>,
}

impl GitlabMonitor {
    /// Loads persisted state from `state_path`; an unreadable file starts fresh.
    pub async fn new(
        config: GitlabConfig,
        api: Arc<dyn GitlabApi>,
        sink: Arc<dyn EventSink>,
        state_path: PathBuf,
    ) -> Self {
        let state = match CollectorState::load(&state_path).await {
            Ok(state) => state,
            Err(e) => {
                warn!("GITLAB | Starting with empty state: {e}");
                CollectorState::default()
            }
        };
        Self {
            config,
            api,
            sink,
            state,
            state_path,
            gates: HashMap::new(),
        }
    }

    pub fn state(&self) -> &CollectorState {
        &self.state
    }

    /// One pass over every project. Projects run one after another, the
    /// kinds of a project run concurrently.
    pub async fn tick(&mut self) {
        let Self {
            config,
            api,
            sink,
            state,
            gates,
            ..
        } = self;

        for project in &config.projects {
            let key = project.to_string();
            let ProjectState {
                pipelines,
                jobs,
                mrs,
                deployments,
            } = state.project_mut(&key);
            let ProjectGates {
                pipelines: pipeline_gates,
                jobs: job_gates,
                mrs: mr_gates,
                deployments: deployment_gates,
                runners: runner_gates,
            } = gates.entry(key).or_default();

            let ctx = CollectContext {
                api: api.as_ref(),
                sink: sink.as_ref(),
                project,
                monitor_logs: config.monitor_logs,
                now: Utc::now(),
            };
            let wanted = &config.metrics;
            let (p, j, r, m, d) = tokio::join!(
                when(wanted.pipelines, collect_pipelines(&ctx, pipelines, pipeline_gates)),
                when(wanted.jobs, collect_jobs(&ctx, jobs, job_gates)),
                when(wanted.runners, collect_runners(&ctx, runner_gates)),
                when(wanted.mrs, collect_merge_requests(&ctx, mrs, mr_gates)),
                when(wanted.deployments, collect_deployments(&ctx, deployments, deployment_gates)),
            );
            report(project, ResourceKind::Pipelines, p);
            report(project, ResourceKind::Jobs, j);
            report(project, ResourceKind::Runners, r);
            report(project, ResourceKind::Mrs, m);
            report(project, ResourceKind::Deployments, d);
        }

        self.save_state().await;
    }

    async fn save_state(&self) {
        if let Err(e) = self.state.save(&self.state_path).await {
            error!("GITLAB | {e}");
        }
    }

    /// First tick after a random start jitter, then every `interval + jitter`.
    /// A tick still running when the next is due makes that one skipped.
    /// Cancellation is only observed between ticks: a started tick always
    /// emits what it marked as seen before the state is saved.
    pub async fn run(mut self, cancel: CancellationToken) {
        let jitter = Duration::from_millis(fastrand::u64(0..MAX_START_JITTER_MS));
        info!(
            "GITLAB | Monitoring {} project(s) on {} every {:?}",
            self.config.projects.len(),
            self.config.base_url,
            self.config.interval
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(jitter) => {}
        }

        let mut ticker = interval(self.config.interval + jitter);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }
        self.save_state().await;
        debug!("GITLAB | Monitor stopped");
    }
}
