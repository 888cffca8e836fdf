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

//! The console agent: an SSH server on the management network, reachable only over mutually
//! authenticated TLS, that attaches callers to machine consoles.

pub mod backend;
mod console_pty;
mod frontend;
mod session;

use crate::ShutdownHandle;
use crate::config::AgentConfig;
use crate::connection;
use crate::metrics::AgentMetrics;
use crate::tls;
use backend::ConsoleBackend;
use eyre::Context;
use frontend::Handler;
use opentelemetry::metrics::Meter;
use russh::server::Server as RusshServer;
use russh::{MethodKind, MethodSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// A client that connects but never finishes the TLS handshake is dropped after this long.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct AgentState {
    pub config: Arc<AgentConfig>,
    pub backend: Arc<dyn ConsoleBackend>,
    pub metrics: Arc<AgentMetrics>,
}

pub async fn spawn(config: AgentConfig, meter: &Meter) -> eyre::Result<Handle> {
    let host_key = russh::keys::PrivateKey::read_openssh_file(&config.host_key_path)
        .with_context(|| {
            format!(
                "Error reading host key file at {}",
                config.host_key_path.display()
            )
        })?;
    let tls_acceptor = tls::server_acceptor(
        &config.server_cert_path,
        &config.server_key_path,
        &config.client_ca_cert_path,
    )
    .await
    .context("Error loading TLS server material")?;

    let russh_config = Arc::new(russh::server::Config {
        keys: vec![host_key],
        methods: MethodSet::from([MethodKind::None].as_slice()),
        nodelay: true,
        auth_rejection_time: Duration::from_millis(30),
        ..Default::default()
    });

    let backend = backend::from_config(&config);
    tracing::info!(?backend, "console backend selected");
    let listen_address = config.listen_address;
    let state = Arc::new(AgentState {
        config: Arc::new(config),
        backend,
        metrics: Arc::new(AgentMetrics::new(meter)),
    });

    let listener = TcpListener::bind(listen_address)
        .await
        .with_context(|| format!("Error listening on {listen_address}"))?;
    let local_addr = listener
        .local_addr()
        .context("error reading agent listen address")?;
    tracing::info!("agent listening on {}", local_addr);

    let server = AgentServer {
        state,
        russh_config,
        tls_acceptor,
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

struct AgentServer {
    state: Arc<AgentState>,
    russh_config: Arc<russh::server::Config>,
    tls_acceptor: TlsAcceptor,
}

impl AgentServer {
    async fn run(mut self, listener: TcpListener, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                accept_result = listener.accept() => match accept_result {
                    Ok((socket, peer_addr)) => {
                        if let Err(error) = socket.set_nodelay(true) {
                            tracing::warn!("set_nodelay() failed: {error:?}");
                        }
                        let handler = self.new_client(Some(peer_addr));
                        let tls_acceptor = self.tls_acceptor.clone();
                        let russh_config = self.russh_config.clone();
                        tokio::spawn(async move {
                            let tls_stream = match tokio::time::timeout(
                                TLS_HANDSHAKE_TIMEOUT,
                                tls_acceptor.accept(socket),
                            )
                            .await
                            {
                                Ok(Ok(tls_stream)) => tls_stream,
                                Ok(Err(error)) => {
                                    tracing::warn!(%peer_addr, %error, "TLS handshake failed");
                                    return;
                                }
                                Err(_) => {
                                    tracing::warn!(%peer_addr, "TLS handshake timed out");
                                    return;
                                }
                            };
                            tracing::info!(%peer_addr, "begin agent connection");
                            connection::serve(russh_config, tls_stream, handler).await;
                        });
                    }
                    Err(error) => {
                        tracing::error!(?error, "Error accepting connection from socket");
                        break;
                    }
                },

                _ = &mut shutdown => break,
            }
        }
        tracing::info!("agent stopped accepting connections");
    }
}

impl russh::server::Server for AgentServer {
    type Handler = Handler;

    fn new_client(&mut self, addr: Option<SocketAddr>) -> Self::Handler {
        Handler::new(self.state.clone(), addr)
    }
}
