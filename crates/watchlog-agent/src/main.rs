// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use watchlog_agent::config::{self, Config, ConfigError};
use watchlog_agent::custom_metrics::{run_flush_loop, AggregatorService, MAX_METRICS};
use watchlog_agent::event::EventSink;
use watchlog_agent::gitlab::api::{GitlabClient, RetryPolicy};
use watchlog_agent::gitlab::{GitlabConfig, GitlabMonitor};
use watchlog_agent::http::{self, AppState};
use watchlog_agent::logger;
use watchlog_agent::logs::iis::{IisConfig, IisMonitor, PowerShellSites};
use watchlog_agent::logs::nginx::NginxMonitor;
use watchlog_agent::logs::watchlist::{Watchlist, WatchlistMonitor};
use watchlog_agent::supervisor::Supervisor;
use watchlog_agent::system_metrics;
use watchlog_transport::identity::resolve_machine_uuid;
use watchlog_transport::{
    ConnectionConfig, ConnectionManager, DeferredEmitter, HostIdentity, SystemHostProbe,
    WebSocketConnector,
};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
pub async fn main() {
    let env_loaded = config::load_env_file(&config::env_file_path());

    #[allow(clippy::expect_used)]
    logger::init(&config::log_level()).expect("could not parse log level in configuration");

    match env_loaded {
        Ok(0) => {}
        Ok(applied) => debug!("Loaded {applied} variable(s) from env file"),
        Err(e) => warn!("{e}"),
    }

    let config = match Config::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Error creating config on watchlog agent startup: {e}");
            return;
        }
    };
    info!("Starting watchlog agent {AGENT_VERSION}");

    let cancel = CancellationToken::new();
    let mut supervisor = Supervisor::new();

    let emitter = start_connection(&config, &mut supervisor, &cancel);
    let sink: Arc<dyn EventSink> = Arc::new(emitter);

    let (aggregator, aggregator_handle) = AggregatorService::new(MAX_METRICS);
    supervisor.spawn("custom-metrics", aggregator.run());
    supervisor.spawn(
        "custom-metrics-flush",
        run_flush_loop(
            aggregator_handle.clone(),
            Arc::clone(&sink),
            config.custom_metrics_flush_interval,
            cancel.clone(),
        ),
    );

    let state = AppState {
        aggregator: aggregator_handle,
        sink: Arc::clone(&sink),
    };
    let port = config.http_port;
    let http_cancel = cancel.clone();
    supervisor.spawn("http", async move {
        if let Err(e) = http::serve(port, state, http_cancel).await {
            error!("HTTP | Server stopped: {e}");
        }
    });

    if config.monitor_system {
        supervisor.spawn(
            "system-metrics",
            system_metrics::run(
                config.system_metrics_interval,
                Arc::clone(&sink),
                cancel.clone(),
            ),
        );
    }

    if config.nginx.enabled {
        match NginxMonitor::new(config.nginx.clone(), Arc::clone(&sink)) {
            Ok(monitor) => supervisor.spawn("nginx", monitor.run(cancel.clone())),
            Err(e) => error!("NGINX | Disabled: {e}"),
        }
    }

    start_integrations(&config, &sink, &mut supervisor, &cancel).await;
    start_watchlist(&config, &sink, &mut supervisor, &cancel).await;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {e}");
    }
    info!("Shutting down");
    cancel.cancel();
    supervisor.shutdown(SHUTDOWN_GRACE).await;
}

/// Without a server and an API key the agent still runs, but every event is discarded.
fn start_connection(
    config: &Config,
    supervisor: &mut Supervisor,
    cancel: &CancellationToken,
) -> DeferredEmitter {
    let (Some(server), Some(api_key)) = (&config.server, &config.api_key) else {
        warn!("WATCHLOG_SERVER or WATCHLOG_APIKEY not set, events will not be forwarded");
        return DeferredEmitter::disabled();
    };

    let uuid = resolve_machine_uuid(config.uuid.as_deref(), &SystemHostProbe, &config.env_file);
    let identity = HostIdentity::new(
        api_key.clone(),
        uuid,
        AGENT_VERSION.to_string(),
        Box::new(SystemHostProbe),
    );
    let (manager, emitter) = ConnectionManager::new(
        ConnectionConfig::new(server.clone()),
        Arc::new(identity),
        Arc::new(WebSocketConnector),
        cancel.clone(),
    );
    supervisor.spawn("connection", manager.run());
    emitter
}

async fn start_integrations(
    config: &Config,
    sink: &Arc<dyn EventSink>,
    supervisor: &mut Supervisor,
    cancel: &CancellationToken,
) {
    let integrations = match config::load_integrations(&config.integrations_path) {
        Ok(integrations) => integrations,
        Err(ConfigError::Read { path, source }) if source.kind() == std::io::ErrorKind::NotFound => {
            debug!("No integrations file at {}", path.display());
            return;
        }
        Err(e) => {
            warn!("Integrations disabled: {e}");
            return;
        }
    };

    if let Some(descriptor) = config::find_monitored(&integrations, "gitlab") {
        match GitlabConfig::from_descriptor(descriptor) {
            Ok(gitlab) => {
                match GitlabClient::new(&gitlab.base_url, &gitlab.token, RetryPolicy::default()) {
                    Ok(client) => {
                        let monitor = GitlabMonitor::new(
                            gitlab,
                            Arc::new(client),
                            Arc::clone(sink),
                            config.gitlab_state_path.clone(),
                        )
                        .await;
                        supervisor.spawn("gitlab", monitor.run(cancel.clone()));
                    }
                    Err(e) => error!("GITLAB | Disabled: {e}"),
                }
            }
            Err(e) => error!("GITLAB | Disabled: {e}"),
        }
    }

    if let Some(descriptor) = config::find_monitored(&integrations, "iis") {
        let monitor = IisConfig::from_descriptor(descriptor)
            .map_err(|e| e.to_string())
            .and_then(|iis| {
                IisMonitor::new(iis, Arc::new(PowerShellSites), Arc::clone(sink))
                    .map_err(|e| e.to_string())
            });
        match monitor {
            Ok(monitor) => supervisor.spawn("iis", monitor.run(cancel.clone())),
            Err(e) => error!("IIS | Disabled: {e}"),
        }
    }
}

async fn start_watchlist(
    config: &Config,
    sink: &Arc<dyn EventSink>,
    supervisor: &mut Supervisor,
    cancel: &CancellationToken,
) {
    let watchlist = match Watchlist::load(&config.watchlist_path).await {
        Ok(Some(watchlist)) => watchlist,
        Ok(None) => {
            debug!(
                "WATCHLIST | No watchlist at {}",
                config.watchlist_path.display()
            );
            return;
        }
        Err(e) => {
            error!("WATCHLIST | Disabled: {e}");
            return;
        }
    };
    match WatchlistMonitor::open(watchlist, Arc::clone(sink)).await {
        Ok(monitor) => supervisor.spawn("watchlist", monitor.run(cancel.clone())),
        Err(e) => error!("WATCHLIST | Disabled: {e}"),
    }
}
