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

//! The caller-facing SSH server.

mod frontend;
mod inner_hop;
pub mod mode;
mod relay;
pub mod revalidation;
mod session;

use crate::ShutdownHandle;
use crate::authorization::Authorizer;
use crate::config::GatewayConfig;
use crate::connection;
use crate::directory::{MachineDirectory, MetalApiDirectory};
use crate::metrics::GatewayMetrics;
use crate::registry::AllocationRegistry;
use eyre::Context;
use frontend::Handler;
pub use mode::GatewayMode;
use opentelemetry::metrics::Meter;
use russh::server::Server as RusshServer;
use russh::{MethodKind, MethodSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Everything a connection needs, shared by all of them.
pub(crate) struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub directory: Arc<dyn MachineDirectory>,
    pub registry: AllocationRegistry,
    pub mode: Arc<GatewayMode>,
    pub authorizer: Authorizer,
    pub metrics: Arc<GatewayMetrics>,
}

/// Start the gateway against the metal-api directory configured in `config`.
pub async fn spawn(config: GatewayConfig, meter: &Meter) -> eyre::Result<Handle> {
    let directory = Arc::new(MetalApiDirectory::new(&config)?);
    spawn_with_directory(config, directory, meter).await
}

pub async fn spawn_with_directory(
    config: GatewayConfig,
    directory: Arc<dyn MachineDirectory>,
    meter: &Meter,
) -> eyre::Result<Handle> {
    let host_key = russh::keys::PrivateKey::read_openssh_file(&config.host_key_path)
        .with_context(|| {
            format!(
                "Error reading host key file at {}",
                config.host_key_path.display()
            )
        })?;

    let russh_config = Arc::new(russh::server::Config {
        keys: vec![host_key],
        methods: MethodSet::from([MethodKind::PublicKey, MethodKind::Password].as_slice()),
        nodelay: true,
        auth_rejection_time: Duration::from_millis(30),
        ..Default::default()
    });

    let mode = Arc::new(GatewayMode::from_config(&config));
    if let GatewayMode::Development {
        bmc_reverse_proxy_address,
        ..
    } = mode.as_ref()
    {
        tracing::warn!(
            bmc_reverse_proxy_address,
            "running in development mode, every machine accepts the development public key"
        );
    }
    let registry = AllocationRegistry::new();
    let authorizer = Authorizer::new(
        directory.clone(),
        registry.clone(),
        mode.clone(),
        config.admin_group_name.clone(),
    );
    let listen_address = config.listen_address;
    let state = Arc::new(GatewayState {
        config: Arc::new(config),
        directory,
        registry,
        mode,
        authorizer,
        metrics: Arc::new(GatewayMetrics::new(meter)),
    });

    let listener = TcpListener::bind(listen_address)
        .await
        .with_context(|| format!("Error listening on {listen_address}"))?;
    let local_addr = listener
        .local_addr()
        .context("error reading gateway listen address")?;
    tracing::info!("gateway listening on {}", local_addr);

    let server = GatewayServer {
        state,
        russh_config,
    };
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join_handle = tokio::spawn(server.run(listener, shutdown_rx));

    Ok(Handle {
        local_addr,
        shutdown_tx,
        join_handle,
    })
}

pub struct Handle {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl Handle {
    /// The bound address, useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl ShutdownHandle<()> for Handle {
    fn into_parts(self) -> (oneshot::Sender<()>, JoinHandle<()>) {
        (self.shutdown_tx, self.join_handle)
    }
}

struct GatewayServer {
    state: Arc<GatewayState>,
    russh_config: Arc<russh::server::Config>,
}

impl GatewayServer {
    /// Accept connections until `shutdown` is received (or its sender is dropped.) Connections
    /// already accepted keep running.
    async fn run(mut self, listener: TcpListener, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                accept_result = listener.accept() => match accept_result {
                    Ok((socket, peer_addr)) => {
                        tracing::info!(%peer_addr, "begin gateway connection");
                        if let Err(error) = socket.set_nodelay(true) {
                            tracing::warn!("set_nodelay() failed: {error:?}");
                        }
                        let handler = self.new_client(Some(peer_addr));
                        tokio::spawn(connection::serve(self.russh_config.clone(), socket, handler));
                    }
                    Err(error) => {
                        tracing::error!(?error, "Error accepting SSH connection from socket");
                        break;
                    }
                },

                _ = &mut shutdown => break,
            }
        }
        tracing::info!("gateway stopped accepting connections");
    }
}

impl russh::server::Server for GatewayServer {
    type Handler = Handler;

    fn new_client(&mut self, addr: Option<SocketAddr>) -> Self::Handler {
        Handler::new(self.state.clone(), addr)
    }
}
