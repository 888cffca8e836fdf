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

use crate::util::mock_directory::{MockDirectory, MockDirectoryHandle};
use lazy_static::lazy_static;
use metal_console::ShutdownHandle;
use metal_console::config::{AgentConfig, ConsoleBackendKind, GatewayConfig};
use metal_console::metrics::MetricsState;
use metal_console::{agent, gateway};
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use temp_dir::TempDir;

pub mod mock_directory;
pub mod ssh_client;

lazy_static! {
    pub static ref FIXTURES_DIR: PathBuf =
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
}

pub static ADMIN_GROUP: &str = "metal-admins";

/// Stands in for `virsh console <domain> --force`: greets, then echoes every line back until it
/// reads "exit". "size" reports the terminal size as rows and columns.
static FAKE_VIRSH: &str = r#"#!/bin/sh
echo "Connected to domain '$2'"
while read -r line; do
    if [ "$line" = "exit" ]; then
        exit 0
    fi
    if [ "$line" = "size" ]; then
        echo "size: $(stty size)"
        continue
    fi
    echo "console: $line"
done
"#;

pub fn fixture(name: &str) -> PathBuf {
    FIXTURES_DIR.join(name)
}

/// Gateway settings that tests vary.
pub struct GatewayOptions {
    pub revalidation_interval: Duration,
    /// Kept below [`ssh_client::TIMEOUT`] so that a hung inner hop shows up as a refused session
    pub inner_hop_timeout: Duration,
    /// Fixture holding the public host key the gateway expects from the agent
    pub inner_host_public_key: &'static str,
    pub client_cert: &'static str,
    pub client_key: &'static str,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            revalidation_interval: Duration::from_secs(20),
            inner_hop_timeout: Duration::from_secs(5),
            inner_host_public_key: "agent-host-key.pub",
            client_cert: "client.pem",
            client_key: "client-key.pem",
        }
    }
}

/// A directory, an agent and a gateway, all on localhost with ephemeral ports.
pub struct TestEnvironment {
    pub directory: MockDirectory,
    pub gateway_addr: SocketAddr,
    pub agent_addr: SocketAddr,
    gateway: gateway::Handle,
    agent: agent::Handle,
    _directory_handle: MockDirectoryHandle,
    _metrics: MetricsState,
    _temp: TempDir,
}

impl TestEnvironment {
    pub async fn start(options: GatewayOptions) -> eyre::Result<Self> {
        let temp = TempDir::new()?;
        let virsh_path = temp.child("virsh");
        std::fs::write(&virsh_path, FAKE_VIRSH)?;
        std::fs::set_permissions(&virsh_path, std::fs::Permissions::from_mode(0o755))?;

        let directory = MockDirectory::default();
        let directory_handle = directory.spawn().await?;
        let metrics = MetricsState::new("metal-console-test");

        let agent = agent::spawn(
            AgentConfig {
                listen_address: "127.0.0.1:0".parse()?,
                host_key_path: fixture("agent-host-key"),
                server_cert_path: fixture("server.pem"),
                server_key_path: fixture("server-key.pem"),
                client_ca_cert_path: fixture("ca.pem"),
                backend: ConsoleBackendKind::Hypervisor,
                virsh_path,
                ..Default::default()
            },
            &metrics.meter,
        )
        .await?;

        let gateway = gateway::spawn(
            GatewayConfig {
                listen_address: "127.0.0.1:0".parse()?,
                directory_url: directory_handle.url(),
                admin_group_name: ADMIN_GROUP.to_string(),
                host_key_path: fixture("gateway-host-key"),
                inner_host_public_key_path: fixture(options.inner_host_public_key),
                client_cert_path: fixture(options.client_cert),
                client_key_path: fixture(options.client_key),
                ca_cert_path: fixture("ca.pem"),
                revalidation_interval: options.revalidation_interval,
                inner_hop_timeout: options.inner_hop_timeout,
                ..Default::default()
            },
            &metrics.meter,
        )
        .await?;

        Ok(Self {
            directory,
            gateway_addr: gateway.local_addr(),
            agent_addr: agent.local_addr(),
            gateway,
            agent,
            _directory_handle: directory_handle,
            _metrics: metrics,
            _temp: temp,
        })
    }

    pub async fn shutdown(self) {
        self.gateway.shutdown_and_wait().await;
        self.agent.shutdown_and_wait().await;
    }
}

/// An address that accepts connections and then never says anything. Connections are held open
/// until the returned task is aborted.
pub async fn silent_addr() -> eyre::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    Ok((addr, holder))
}

/// An address nothing listens on.
pub async fn unused_addr() -> eyre::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?)
}
