// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Malformed frames received from the collector.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,

    #[error("unknown engine packet type '{0}'")]
    UnknownEnginePacket(char),

    #[error("unknown socket packet type '{0}'")]
    UnknownSocketPacket(char),

    #[error("invalid packet payload: {0}")]
    InvalidPayload(String),
}

/// Failures of the outbound session. None of them are fatal to the agent.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("server rejected connection: {0}")]
    Rejected(String),

    #[error("no ping from server within {0:?}")]
    PingTimeout(std::time::Duration),

    #[error("session closed by server")]
    Closed,

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Returned by the emitter when an emission could not be handed to the connection task.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EmitError {
    #[error("emission queue is full, dropped '{0}'")]
    QueueFull(String),

    #[error("connection task has stopped, dropped '{0}'")]
    Stopped(String),
}
