// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::RecordingSink;
use watchlog_agent::custom_metrics::{flush_once, AggregatorService, MetricKind, MAX_METRICS};
use watchlog_agent::event::Event;
use watchlog_agent::http::{serve, AppState};

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_ready(client: &reqwest::Client, base: &str) {
    for _ in 0..50 {
        if let Ok(response) = client.get(format!("{base}/readyz")).send().await {
            if response.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server at {base} never became ready");
}

#[tokio::test]
async fn test_metrics_over_http_reach_the_sink() {
    let (service, handle) = AggregatorService::new(MAX_METRICS);
    tokio::spawn(service.run());
    let sink = Arc::new(RecordingSink::default());
    let state = AppState {
        aggregator: handle.clone(),
        sink: sink.clone(),
    };

    let port = free_port().await;
    let cancel = CancellationToken::new();
    let server = tokio::spawn(serve(port, state, cancel.clone()));

    let base = format!("http://127.0.0.1:{port}");
    let client = reqwest::Client::new();
    wait_ready(&client, &base).await;

    for count in ["2", "3"] {
        let response = client
            .get(format!("{base}/node"))
            .query(&[("method", "increment"), ("metric", "orders"), ("count", count)])
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
    }
    let response = client
        .post(format!("{base}/pm2list"))
        .json(&serde_json::json!({"username": "deploy", "apps": [{"name": "api"}]}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    flush_once(&handle, sink.as_ref()).await;
    let events = sink.take();
    assert_eq!(events.len(), 2, "unexpected events {events:?}");
    assert!(matches!(events[0], Event::Pm2List(_)));
    let Event::CustomMetrics(records) = &events[1] else {
        panic!("unexpected event {:?}", events[1]);
    };
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].metric, "orders");
    assert_eq!(records[0].metric_type, MetricKind::Increment);
    assert_eq!(records[0].count, 2);
    assert_eq!(records[0].sum, 5.0);

    cancel.cancel();
    server.await.unwrap().unwrap();
}
