// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod connection;
pub mod emitter;
pub mod error;
pub mod identity;
pub mod protocol;

pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, WebSocketConnector};
pub use emitter::{DeferredEmitter, Emission};
pub use error::{EmitError, TransportError};
pub use identity::{AuthIdentity, HostIdentity, IdentitySource, SystemHostProbe};
