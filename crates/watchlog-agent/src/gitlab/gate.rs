// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Remembers the digest of the last payload sent per key and admits a
/// payload only when it differs.
#[derive(Debug, Default)]
pub struct EmissionGate {
    last: HashMap<String, String>,
}

impl EmissionGate {
    pub fn admit<T: Serialize>(&mut self, key: &str, payload: &T) -> bool {
        let Some(digest) = digest(payload) else {
            return true;
        };
        if self.last.get(key) == Some(&digest) {
            return false;
        }
        self.last.insert(key.to_string(), digest);
        true
    }
}

/// SHA-256 over the payload with object keys sorted.
fn digest<T: Serialize>(payload: &T) -> Option<String> {
    // `Value` objects are BTreeMaps, so this canonicalizes key order
    let canonical = serde_json::to_value(payload).ok()?.to_string();
    Some(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// Separate gates for summaries and event batches of one kind.
#[derive(Debug, Default)]
pub struct KindGates {
    pub summary: EmissionGate,
    pub batch: EmissionGate,
}

#[derive(Debug, Default)]
pub struct ProjectGates {
    pub pipelines: KindGates,
    pub jobs: KindGates,
    pub mrs: KindGates,
    pub deployments: KindGates,
    pub runners: KindGates,
}
