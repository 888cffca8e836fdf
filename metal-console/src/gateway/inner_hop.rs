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

//! The gateway's side of the inner hop: TLS to the console agent, SSH on top of that, and one
//! session channel with the BMC credential in its environment and a PTY.

use crate::config::GatewayConfig;
use crate::credential::CredentialRecord;
use crate::{CREDENTIAL_ENV_VAR, OIDC_TOKEN_ENV_VAR, tls};
use eyre::Context;
use russh::client::AuthResult;
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg, Disconnect, Pty};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

static INNER_TERM: &str = "xterm";
static INNER_PTY_SIZE: (u32, u32) = (80, 40);
static INNER_PTY_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 0),
    (Pty::TTY_OP_ISPEED, 115200),
    (Pty::TTY_OP_OSPEED, 115200),
];

static RUSSH_CLIENT_CONFIG: LazyLock<Arc<russh::client::Config>> = LazyLock::new(|| {
    Arc::new(russh::client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        ..Default::default()
    })
});

/// Accepts exactly one host key.
struct PinnedHostKey {
    expected: PublicKey,
    address: String,
}

impl russh::client::Handler for PinnedHostKey {
    type Error = eyre::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if server_public_key.key_data() == self.expected.key_data() {
            Ok(true)
        } else {
            tracing::error!(
                address = self.address,
                fingerprint = %server_public_key.fingerprint(Default::default()),
                "console agent presented an unexpected host key"
            );
            Ok(false)
        }
    }
}

pub struct InnerHop {
    client: russh::client::Handle<PinnedHostKey>,
    pub channel: Channel<russh::client::Msg>,
}

/// What the agent needs to know to attach to a console.
pub struct InnerHopRequest<'a> {
    pub address: &'a str,
    pub machine_id: &'a str,
    pub credential: &'a CredentialRecord,
    pub oidc_token: Option<&'a str>,
}

impl InnerHop {
    /// Connect to the agent and get a channel ready to run the console command. Will not retry,
    /// and gives up once `inner_hop_timeout` has passed without the remote PTY being set up.
    pub async fn open(config: &GatewayConfig, request: InnerHopRequest<'_>) -> eyre::Result<Self> {
        let address = request.address;
        tokio::time::timeout(config.inner_hop_timeout, Self::establish(config, request))
            .await
            .with_context(|| {
                format!(
                    "timed out setting up inner hop to {address} after {:?}",
                    config.inner_hop_timeout
                )
            })?
    }

    async fn establish(config: &GatewayConfig, request: InnerHopRequest<'_>) -> eyre::Result<Self> {
        let InnerHopRequest {
            address,
            machine_id,
            credential,
            oidc_token,
        } = request;

        // Material is read fresh for every hop so that rotated certificates are picked up.
        let tls_config = tls::client_config(
            &config.client_cert_path,
            &config.client_key_path,
            &config.ca_cert_path,
        )
        .await
        .context("error loading TLS client material")?;
        let expected = read_public_key(&config.inner_host_public_key_path).await?;

        let tls_stream =
            tls::connect(address, Arc::new(tls_config), config.inner_hop_timeout).await?;
        tracing::debug!(machine_id, address, "TLS connection to console agent established");

        let mut client = russh::client::connect_stream(
            RUSSH_CLIENT_CONFIG.clone(),
            tls_stream,
            PinnedHostKey {
                expected,
                address: address.to_string(),
            },
        )
        .await
        .with_context(|| format!("SSH handshake with console agent at {address} failed"))?;

        // The transport is already mutually authenticated, the user name just says which machine
        match client
            .authenticate_none(machine_id)
            .await
            .with_context(|| format!("error authenticating to console agent at {address}"))?
        {
            AuthResult::Success => {}
            AuthResult::Failure { .. } => {
                return Err(eyre::format_err!(
                    "console agent at {address} refused authentication for {machine_id}"
                ));
            }
        }

        let mut channel = client
            .channel_open_session()
            .await
            .context("error opening session to console agent")?;

        let token = credential
            .encode()
            .context("error encoding BMC credential")?;
        channel
            .set_env(false, CREDENTIAL_ENV_VAR, token)
            .await
            .context("error handing off BMC credential")?;
        if let Some(token) = oidc_token.filter(|token| !token.is_empty()) {
            channel
                .set_env(false, OIDC_TOKEN_ENV_VAR, token)
                .await
                .context("error forwarding OIDC token")?;
        }

        let (cols, rows) = INNER_PTY_SIZE;
        channel
            .request_pty(true, INNER_TERM, cols, rows, 0, 0, INNER_PTY_MODES)
            .await
            .context("error sending pty request to console agent")?;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => break,
                Some(ChannelMsg::Failure) => {
                    return Err(eyre::format_err!("console agent refused the pty request"));
                }
                Some(other) => {
                    tracing::debug!(machine_id, "ignoring {other:?} while waiting for pty");
                }
                None => {
                    return Err(eyre::format_err!(
                        "console agent closed the channel before the pty was set up"
                    ));
                }
            }
        }

        Ok(Self { client, channel })
    }

    /// Split off the channel, keeping the client for [`InnerHopClient::disconnect`].
    pub fn into_parts(self) -> (InnerHopClient, Channel<russh::client::Msg>) {
        (
            InnerHopClient {
                client: self.client,
            },
            self.channel,
        )
    }
}

pub struct InnerHopClient {
    client: russh::client::Handle<PinnedHostKey>,
}

impl InnerHopClient {
    /// Disconnecting drops the TLS stream along with the SSH session.
    pub async fn disconnect(self) {
        if let Err(error) = self
            .client
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!(%error, "error disconnecting from console agent");
        }
    }
}

async fn read_public_key(path: &Path) -> eyre::Result<PublicKey> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("error reading inner host public key at {}", path.display()))?;
    PublicKey::from_openssh(contents.trim())
        .with_context(|| format!("error parsing inner host public key at {}", path.display()))
}
