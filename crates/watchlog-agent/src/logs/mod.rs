// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log tailing: NGINX and IIS access logs and the generic watchlist.

use std::time::Duration;

pub mod access;
pub mod iis;
pub mod nginx;
pub mod normalize;
pub mod tailer;
pub mod watchlist;

pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub(crate) const FLUSH_INTERVAL: Duration = Duration::from_secs(10);
pub(crate) const RESCAN_INTERVAL: Duration = Duration::from_secs(30);
