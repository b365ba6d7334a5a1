// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Local HTTP surface used by instrumented applications.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header::CONTENT_ENCODING;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::DateTime;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::custom_metrics::{AggregatorHandle, MetricKind};
use crate::event::{Event, EventSink};

/// Spans slower than this are reported as timeouts.
const AI_SPAN_TIMEOUT_MS: i64 = 10_000;
const DEFAULT_APM_PLATFORM: &str = "express";

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("failed to decompress body: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("body is not JSON or NDJSON: {0}")]
    Json(#[source] serde_json::Error),
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "error": self.to_string()})),
        )
            .into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub aggregator: AggregatorHandle,
    pub sink: Arc<dyn EventSink>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/readyz", get(|| async { "READY" }))
        .route("/", get(record_metric))
        .route("/node", get(record_metric))
        .route("/apm", post(apm))
        .route("/pm2list", post(pm2_list))
        .route("/ai-tracer", post(ai_tracer))
        .route("/ingest/logs", post(ingest_logs))
        .with_state(state)
}

/// Serves until `cancel` fires.
pub async fn serve(port: u16, state: AppState, cancel: CancellationToken) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP | Listening on {addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricQuery {
    method: Option<String>,
    metric: Option<String>,
    count: Option<String>,
    value: Option<String>,
}

async fn record_metric(State(state): State<AppState>, Query(query): Query<MetricQuery>) {
    let Some(metric) = query.metric.filter(|m| !m.is_empty()) else {
        return;
    };
    let Some(kind) = query.method.as_deref().and_then(|m| m.parse::<MetricKind>().ok()) else {
        debug!("HTTP | Ignoring {metric}: unknown method {:?}", query.method);
        return;
    };
    let Some(value) = query
        .count
        .or(query.value)
        .and_then(|raw| raw.trim().parse::<f64>().ok())
    else {
        return;
    };
    if let Err(e) = state.aggregator.record(metric, kind, value) {
        warn!("HTTP | Aggregator unavailable: {e}");
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApmReport {
    pub data: Value,
    pub platform_name: String,
}

async fn apm(State(state): State<AppState>, Json(body): Json<Value>) {
    let Some(metrics) = body.get("metrics").filter(|m| !m.is_null()) else {
        return;
    };
    let platform_name = body
        .get("platformName")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_APM_PLATFORM)
        .to_string();
    state.sink.emit(Event::Apm(ApmReport {
        data: metrics.clone(),
        platform_name,
    }));
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64() != Some(0.0),
        Some(_) => true,
    }
}

async fn pm2_list(State(state): State<AppState>, Json(body): Json<Value>) {
    if truthy(body.get("username")) && truthy(body.get("apps")) {
        state.sink.emit(Event::Pm2List(body));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpanStatus {
    Success,
    Error,
    Timeout,
}

/// A traced AI call. Fields other than the identifiers and timing are
/// forwarded untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiSpan {
    pub trace_id: Value,
    pub span_id: Value,
    pub start_time: Value,
    pub end_time: Value,
    pub duration: i64,
    pub status: SpanStatus,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Epoch milliseconds from an RFC 3339 string or a number.
fn epoch_millis(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|date| date.timestamp_millis()),
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

impl AiSpan {
    /// `None` unless the identifiers are present and both times parse.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut fields) = value else {
            return None;
        };
        for key in ["traceId", "spanId", "startTime", "endTime"] {
            if !truthy(fields.get(key)) {
                return None;
            }
        }
        let start = epoch_millis(fields.get("startTime")?)?;
        let end = epoch_millis(fields.get("endTime")?)?;
        let duration = end - start;

        let blank_output = match fields.get("output") {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        };
        let status = if blank_output {
            SpanStatus::Error
        } else if duration > AI_SPAN_TIMEOUT_MS {
            SpanStatus::Timeout
        } else {
            SpanStatus::Success
        };

        fields.remove("duration");
        fields.remove("status");
        Some(Self {
            trace_id: fields.remove("traceId")?,
            span_id: fields.remove("spanId")?,
            start_time: fields.remove("startTime")?,
            end_time: fields.remove("endTime")?,
            duration,
            status,
            fields,
        })
    }
}

async fn ai_tracer(State(state): State<AppState>, Json(body): Json<Value>) -> Json<Value> {
    let spans = match body {
        Value::Array(items) => items,
        single => vec![single],
    };
    let total = spans.len();
    let valid: Vec<AiSpan> = spans.into_iter().filter_map(AiSpan::from_value).collect();
    let received = valid.len();
    if !valid.is_empty() {
        state.sink.emit(Event::AiTrace(valid));
    }
    Json(json!({
        "status": "ok",
        "received": received,
        "skipped": total - received,
    }))
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("gzip"))
}

/// A JSON object, a JSON array, or newline delimited objects. Unparsable
/// NDJSON lines are dropped.
pub fn parse_log_lines(body: &[u8]) -> Result<Vec<Value>, IngestError> {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Array(items)) => return Ok(items),
        Ok(item @ Value::Object(_)) => return Ok(vec![item]),
        Ok(_) | Err(_) => {}
    }

    let mut lines = Vec::new();
    let mut first_error = None;
    for line in trimmed.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => lines.push(value),
            Err(e) => {
                debug!("HTTP | Dropping NDJSON line: {e}");
                first_error.get_or_insert(e);
            }
        }
    }
    match (lines.is_empty(), first_error) {
        (true, Some(e)) => Err(IngestError::Json(e)),
        _ => Ok(lines),
    }
}

async fn ingest_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, IngestError> {
    let body = if is_gzip(&headers) {
        let mut decoded = Vec::new();
        GzDecoder::new(body.as_ref())
            .read_to_end(&mut decoded)
            .map_err(IngestError::Decompress)?;
        decoded
    } else {
        body.to_vec()
    };
    let lines = parse_log_lines(&body)?;
    let accepted = lines.len();
    if accepted > 0 {
        state.sink.emit(Event::PodLogLines(lines));
    }
    Ok(Json(json!({"status": "ok", "accepted": accepted})))
}
