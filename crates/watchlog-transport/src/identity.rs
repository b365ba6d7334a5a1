// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Machine identity sent with every connect.
//!
//! The uuid is resolved once per process and persisted, the network facing
//! parts (hostname, public address) are re-read before each attempt.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::Serialize;
use sysinfo::{Networks, System};
use tracing::{debug, warn};

const DMI_SERIAL: &str = "/sys/class/dmi/id/product_serial";
const DMI_UUID: &str = "/sys/class/dmi/id/product_uuid";

// Values firmware vendors leave in unset DMI fields.
const PLACEHOLDER_IDS: &[&str] = &[
    "none",
    "0",
    "default string",
    "not specified",
    "not applicable",
    "to be filled by o.e.m.",
    "system serial number",
];

/// Payload of the Socket.IO CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthIdentity {
    pub api_key: String,
    pub host: String,
    pub ip: Option<String>,
    pub uuid: String,
    pub distro: String,
    pub release: String,
    pub agent_version: String,
}

/// Read access to the facts identity is built from.
pub trait HostProbe: Send + Sync {
    fn hostname(&self) -> String;
    fn ipv4_addresses(&self) -> Vec<Ipv4Addr>;
    fn distro(&self) -> String;
    fn release(&self) -> String;
    fn serial_number(&self) -> Option<String>;
    fn system_uuid(&self) -> Option<String>;
}

pub trait IdentitySource: Send + Sync {
    fn resolve(&self) -> AuthIdentity;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHostProbe;

impl HostProbe for SystemHostProbe {
    fn hostname(&self) -> String {
        System::host_name().unwrap_or_else(|| "unknown".to_string())
    }

    fn ipv4_addresses(&self) -> Vec<Ipv4Addr> {
        let networks = Networks::new_with_refreshed_list();
        let mut interfaces: Vec<_> = networks.iter().collect();
        interfaces.sort_by(|a, b| a.0.cmp(b.0));
        interfaces
            .into_iter()
            .flat_map(|(_, data)| data.ip_networks().iter())
            .filter_map(|network| match network.addr {
                std::net::IpAddr::V4(addr) => Some(addr),
                std::net::IpAddr::V6(_) => None,
            })
            .collect()
    }

    fn distro(&self) -> String {
        System::name().unwrap_or_else(|| std::env::consts::OS.to_string())
    }

    fn release(&self) -> String {
        System::os_version().unwrap_or_default()
    }

    fn serial_number(&self) -> Option<String> {
        read_dmi(DMI_SERIAL)
    }

    fn system_uuid(&self) -> Option<String> {
        read_dmi(DMI_UUID)
    }
}

fn read_dmi(path: &str) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .and_then(|value| usable_id(&value))
}

fn usable_id(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || PLACEHOLDER_IDS.contains(&value.to_lowercase().as_str()) {
        return None;
    }
    Some(value.to_string())
}

/// Loopback or RFC1918 private range.
pub fn is_private_or_loopback(addr: &Ipv4Addr) -> bool {
    addr.is_loopback() || addr.is_private()
}

pub fn first_public_ipv4(addresses: &[Ipv4Addr]) -> Option<Ipv4Addr> {
    addresses
        .iter()
        .find(|addr| !is_private_or_loopback(addr))
        .copied()
}

/// Picks the machine uuid: configured value, then serial number, then system
/// uuid, then hostname. A derived value is appended to `env_file` as
/// `UUID=<uuid>` so the next start reads it back as the configured value.
pub fn resolve_machine_uuid(
    configured: Option<&str>,
    probe: &dyn HostProbe,
    env_file: &Path,
) -> String {
    if let Some(uuid) = configured.and_then(usable_id) {
        return uuid;
    }

    let uuid = probe
        .serial_number()
        .and_then(|v| usable_id(&v))
        .or_else(|| probe.system_uuid().and_then(|v| usable_id(&v)))
        .unwrap_or_else(|| probe.hostname());

    if let Err(e) = persist_uuid(env_file, &uuid) {
        warn!(
            "TRANSPORT | Could not persist machine uuid to {}: {e}",
            env_file.display()
        );
    } else {
        debug!("TRANSPORT | Persisted machine uuid to {}", env_file.display());
    }
    uuid
}

fn persist_uuid(env_file: &Path, uuid: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(env_file)?;
    writeln!(file, "\nUUID={uuid}")
}

/// Identity backed by a host probe; host and address are refreshed on every call.
pub struct HostIdentity {
    api_key: String,
    uuid: String,
    agent_version: String,
    probe: Box<dyn HostProbe>,
}

impl HostIdentity {
    pub fn new(
        api_key: String,
        uuid: String,
        agent_version: String,
        probe: Box<dyn HostProbe>,
    ) -> Self {
        Self {
            api_key,
            uuid,
            agent_version,
            probe,
        }
    }
}

impl IdentitySource for HostIdentity {
    fn resolve(&self) -> AuthIdentity {
        AuthIdentity {
            api_key: self.api_key.clone(),
            host: self.probe.hostname(),
            ip: first_public_ipv4(&self.probe.ipv4_addresses()).map(|ip| ip.to_string()),
            uuid: self.uuid.clone(),
            distro: self.probe.distro(),
            release: self.probe.release(),
            agent_version: self.agent_version.clone(),
        }
    }
}
