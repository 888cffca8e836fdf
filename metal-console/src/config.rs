/*
 * SPDX-FileCopyrightText: Copyright (c) 2021-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */

use duration_str::deserialize_duration;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
/// Configuration for the console gateway. Fields are documented as comments in the output of
/// [`GatewayConfig::into_annotated_config_file`].
pub struct GatewayConfig {
    #[serde(default = "Defaults::gateway_listen_address")]
    pub listen_address: SocketAddr,
    #[serde(default = "Defaults::gateway_metrics_address")]
    pub metrics_address: SocketAddr,
    #[serde(default = "Defaults::directory_url")]
    pub directory_url: String,
    #[serde(default)]
    pub hmac_key: Option<String>,
    #[serde(
        default = "Defaults::directory_timeout",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub directory_timeout: Duration,
    #[serde(default)]
    pub admin_group_name: String,
    #[serde(rename = "host_key", default = "Defaults::gateway_host_key_path")]
    pub host_key_path: PathBuf,
    #[serde(
        rename = "inner_host_public_key",
        default = "Defaults::inner_host_public_key_path"
    )]
    pub inner_host_public_key_path: PathBuf,
    #[serde(rename = "client_cert", default = "Defaults::client_cert_path")]
    pub client_cert_path: PathBuf,
    #[serde(rename = "client_key", default = "Defaults::client_key_path")]
    pub client_key_path: PathBuf,
    #[serde(rename = "ca_cert", default = "Defaults::ca_cert_path")]
    pub ca_cert_path: PathBuf,
    #[serde(
        default = "Defaults::revalidation_interval",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub revalidation_interval: Duration,
    #[serde(
        default = "Defaults::inner_hop_timeout",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub inner_hop_timeout: Duration,
    #[serde(default = "Defaults::inner_command")]
    pub inner_command: String,
    #[serde(default)]
    pub development: Option<DevelopmentConfig>,
}

/// Development mode: authenticate everyone against a single public key, and send every inner hop
/// to a fixed reverse proxy instead of the partition's management service.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct DevelopmentConfig {
    #[serde(rename = "public_key")]
    pub public_key_path: PathBuf,
    pub bmc_reverse_proxy_address: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
/// Configuration for the console agent. Fields are documented as comments in the output of
/// [`AgentConfig::into_annotated_config_file`].
pub struct AgentConfig {
    #[serde(default = "Defaults::agent_listen_address")]
    pub listen_address: SocketAddr,
    #[serde(default = "Defaults::agent_metrics_address")]
    pub metrics_address: SocketAddr,
    #[serde(rename = "host_key", default = "Defaults::agent_host_key_path")]
    pub host_key_path: PathBuf,
    #[serde(rename = "server_cert", default = "Defaults::server_cert_path")]
    pub server_cert_path: PathBuf,
    #[serde(rename = "server_key", default = "Defaults::server_key_path")]
    pub server_key_path: PathBuf,
    #[serde(rename = "client_ca_cert", default = "Defaults::ca_cert_path")]
    pub client_ca_cert_path: PathBuf,
    #[serde(default = "Defaults::backend")]
    pub backend: ConsoleBackendKind,
    #[serde(default = "Defaults::ipmitool_path")]
    pub ipmitool_path: PathBuf,
    #[serde(default = "Defaults::virsh_path")]
    pub virsh_path: PathBuf,
    #[serde(default)]
    pub insecure_ipmi_ciphers: bool,
    #[serde(
        default = "Defaults::credential_poll_attempts",
        deserialize_with = "deserialize_poll_attempts"
    )]
    pub credential_poll_attempts: u32,
    #[serde(
        default = "Defaults::credential_poll_interval",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub credential_poll_interval: Duration,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleBackendKind {
    /// `ipmitool sol activate` against the BMC
    Ipmi,
    /// `virsh console` against a local libvirt domain
    Hypervisor,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_toml(path)
    }

    pub fn into_annotated_config_file(self) -> String {
        let Self {
            listen_address,
            metrics_address,
            directory_url,
            hmac_key: _,
            directory_timeout,
            admin_group_name,
            host_key_path,
            inner_host_public_key_path,
            client_cert_path,
            client_key_path,
            ca_cert_path,
            revalidation_interval,
            inner_hop_timeout,
            inner_command,
            development: _,
        } = self;
        let listen_address = listen_address.to_string();
        let metrics_address = metrics_address.to_string();
        let directory_timeout = format!("{}s", directory_timeout.as_secs());
        let revalidation_interval = format!("{}s", revalidation_interval.as_secs());
        let inner_hop_timeout = format!("{}s", inner_hop_timeout.as_secs());

        format!(
            r#"
#####
## This is a default config file for the metal-console gateway. Everything in this file is
## optional: Any non-comment line in this file simply represents default values. Commented lines
## with a single `#` represent examples for optional configuration which is not part of the default
## config.
#####

## What address to listen on for SSH connections from operators.
listen_address = {listen_address:?}

## Address to listen on for prometheus metrics requests (HTTP)
metrics_address = {metrics_address:?}

## Base URL of the machine directory (metal-api)
directory_url = {directory_url:?}

## HMAC key used to sign requests to the machine directory
# hmac_key = "<key>"

## Timeout for each request to the machine directory
directory_timeout = {directory_timeout:?}

## Members of this group (as resolved from a caller's OIDC token) may open consoles of firewalls
## and unallocated machines.
admin_group_name = {admin_group_name:?}

## Path to the SSH host key presented to operators.
host_key = {host_key_path:?}

## Public host key the console agent must present on the inner hop. Connections to agents with any
## other host key are refused.
inner_host_public_key = {inner_host_public_key_path:?}

## Client certificate, key, and CA bundle for the TLS connection to the console agent
client_cert = {client_cert_path:?}
client_key = {client_key_path:?}
ca_cert = {ca_cert_path:?}

## How often to check that a machine is still allocated to the same owner while a console session
## to it is open.
revalidation_interval = {revalidation_interval:?}

## How long connecting to the console agent may take, from dialing until the remote PTY is set up
inner_hop_timeout = {inner_hop_timeout:?}

## Command requested from the console agent once the inner hop is up
inner_command = {inner_command:?}

## Optional: Development mode. Every machine accepts the given public key, and inner hops go to the
## given reverse proxy instead of the partition's management service.
# [development]
# public_key = "/path/to/id_ed25519.pub"
# bmc_reverse_proxy_address = "127.0.0.1:3333"
"#
        )
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_toml(path)
    }

    pub fn into_annotated_config_file(self) -> String {
        let Self {
            listen_address,
            metrics_address,
            host_key_path,
            server_cert_path,
            server_key_path,
            client_ca_cert_path,
            backend,
            ipmitool_path,
            virsh_path,
            insecure_ipmi_ciphers,
            credential_poll_attempts,
            credential_poll_interval,
        } = self;
        let listen_address = listen_address.to_string();
        let metrics_address = metrics_address.to_string();
        let backend = match backend {
            ConsoleBackendKind::Ipmi => "ipmi",
            ConsoleBackendKind::Hypervisor => "hypervisor",
        };
        let credential_poll_interval = format!("{}s", credential_poll_interval.as_secs());

        format!(
            r#"
#####
## This is a default config file for the metal-console agent. Everything in this file is optional:
## Any non-comment line in this file simply represents default values.
#####

## What address to listen on for inner hop connections from the gateway (TLS).
listen_address = {listen_address:?}

## Address to listen on for prometheus metrics requests (HTTP)
metrics_address = {metrics_address:?}

## Path to the SSH host key. Its public half must be configured as the gateway's
## inner_host_public_key.
host_key = {host_key_path:?}

## TLS server certificate and key, and the CA that gateway client certificates must be issued by
server_cert = {server_cert_path:?}
server_key = {server_key_path:?}
client_ca_cert = {client_ca_cert_path:?}

## How to attach to consoles: "ipmi" runs ipmitool sol activate against the BMC, "hypervisor" runs
## virsh console (for virtual development environments).
backend = {backend:?}

## Paths to the console tools
ipmitool_path = {ipmitool_path:?}
virsh_path = {virsh_path:?}

## If true, use insecure ciphers when connecting to IPMI, like SHA1. Useful for ipmi_sim.
insecure_ipmi_ciphers = {insecure_ipmi_ciphers}

## How many times (at most 5), and how often, to look for the credential the gateway hands off
## before giving up
credential_poll_attempts = {credential_poll_attempts}
credential_poll_interval = {credential_poll_interval:?}
"#
        )
    }
}

fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let cfg = std::fs::read_to_string(path).map_err(|error| ConfigError::CouldNotRead {
        path: path.to_string_lossy().to_string(),
        error,
    })?;
    toml::from_str::<T>(&cfg).map_err(|error| ConfigError::InvalidToml {
        path: path.to_string_lossy().to_string(),
        error,
    })
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_address: Defaults::gateway_listen_address(),
            metrics_address: Defaults::gateway_metrics_address(),
            directory_url: Defaults::directory_url(),
            hmac_key: None,
            directory_timeout: Defaults::directory_timeout(),
            admin_group_name: String::new(),
            host_key_path: Defaults::gateway_host_key_path(),
            inner_host_public_key_path: Defaults::inner_host_public_key_path(),
            client_cert_path: Defaults::client_cert_path(),
            client_key_path: Defaults::client_key_path(),
            ca_cert_path: Defaults::ca_cert_path(),
            revalidation_interval: Defaults::revalidation_interval(),
            inner_hop_timeout: Defaults::inner_hop_timeout(),
            inner_command: Defaults::inner_command(),
            development: None,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_address: Defaults::agent_listen_address(),
            metrics_address: Defaults::agent_metrics_address(),
            host_key_path: Defaults::agent_host_key_path(),
            server_cert_path: Defaults::server_cert_path(),
            server_key_path: Defaults::server_key_path(),
            client_ca_cert_path: Defaults::ca_cert_path(),
            backend: Defaults::backend(),
            ipmitool_path: Defaults::ipmitool_path(),
            virsh_path: Defaults::virsh_path(),
            insecure_ipmi_ciphers: false,
            credential_poll_attempts: Defaults::credential_poll_attempts(),
            credential_poll_interval: Defaults::credential_poll_interval(),
        }
    }
}

pub struct Defaults;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Could not read config file at {path}: {error}")]
    CouldNotRead { path: String, error: std::io::Error },
    #[error("TOML error reading config file at {path}: {error}")]
    InvalidToml {
        path: String,
        error: toml::de::Error,
    },
}

impl Defaults {
    pub fn gateway_listen_address() -> SocketAddr {
        "[::]:2222"
            .parse()
            .expect("BUG: default listen_address is invalid")
    }

    pub fn gateway_metrics_address() -> SocketAddr {
        "[::]:9080"
            .parse()
            .expect("BUG: default metrics_address is invalid")
    }

    pub fn agent_listen_address() -> SocketAddr {
        "[::]:3333"
            .parse()
            .expect("BUG: default listen_address is invalid")
    }

    pub fn agent_metrics_address() -> SocketAddr {
        "[::]:9081"
            .parse()
            .expect("BUG: default metrics_address is invalid")
    }

    pub fn directory_url() -> String {
        "http://localhost:8080".to_string()
    }

    pub fn directory_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn gateway_host_key_path() -> PathBuf {
        "/certs/server-key.pem".into()
    }

    pub fn inner_host_public_key_path() -> PathBuf {
        "/certs/server-key.pub".into()
    }

    pub fn client_cert_path() -> PathBuf {
        "/certs/client.pem".into()
    }

    pub fn client_key_path() -> PathBuf {
        "/certs/client-key.pem".into()
    }

    pub fn ca_cert_path() -> PathBuf {
        "/certs/ca.pem".into()
    }

    pub fn agent_host_key_path() -> PathBuf {
        "/server-key.pem".into()
    }

    pub fn server_cert_path() -> PathBuf {
        "/certs/server.pem".into()
    }

    pub fn server_key_path() -> PathBuf {
        "/certs/server-key.pem".into()
    }

    pub fn revalidation_interval() -> Duration {
        Duration::from_secs(20)
    }

    pub fn inner_hop_timeout() -> Duration {
        Duration::from_secs(10)
    }

    pub fn inner_command() -> String {
        "bash".to_string()
    }

    pub fn backend() -> ConsoleBackendKind {
        ConsoleBackendKind::Ipmi
    }

    pub fn ipmitool_path() -> PathBuf {
        "ipmitool".into()
    }

    pub fn virsh_path() -> PathBuf {
        "virsh".into()
    }

    pub fn credential_poll_attempts() -> u32 {
        MAX_CREDENTIAL_POLL_ATTEMPTS
    }

    pub fn credential_poll_interval() -> Duration {
        Duration::from_secs(1)
    }
}

/// Polling only bridges the gap between channel open and the credential arriving in the session's
/// environment. A session with no credential after this many polls never gets one.
pub const MAX_CREDENTIAL_POLL_ATTEMPTS: u32 = 5;

fn deserialize_poll_attempts<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let attempts = u32::deserialize(deserializer)?;
    if attempts == 0 || attempts > MAX_CREDENTIAL_POLL_ATTEMPTS {
        return Err(serde::de::Error::custom(format!(
            "credential_poll_attempts must be between 1 and {MAX_CREDENTIAL_POLL_ATTEMPTS}, got {attempts}"
        )));
    }
    Ok(attempts)
}

fn serialize_duration<S>(d: &std::time::Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{}s", d.as_secs()))
}
