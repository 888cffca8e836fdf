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

//! A minimal interactive SSH client, driving a console session the way an operator would.

use eyre::Context;
use russh::ChannelMsg;
use russh::client::{AuthResult, Handle, Msg};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How long to wait for anything the test expects from the gateway.
pub static TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Copy, Clone)]
pub enum Login<'a> {
    PublicKey(&'a Path),
    /// Password authentication, where the password is a bearer token
    Password(&'a str),
}

pub struct SessionOptions<'a> {
    pub pty: bool,
    pub env: &'a [(&'a str, &'a str)],
}

impl Default for SessionOptions<'_> {
    fn default() -> Self {
        Self { pty: true, env: &[] }
    }
}

pub struct ConsoleClient {
    session: Handle<PermissiveSshClient>,
}

/// Connect to `addr` and log in as `user`. Returns None if authentication was rejected.
pub async fn login(
    addr: SocketAddr,
    user: &str,
    login: Login<'_>,
) -> eyre::Result<Option<ConsoleClient>> {
    let mut session = russh::client::connect(
        Arc::new(russh::client::Config::default()),
        addr,
        PermissiveSshClient,
    )
    .await
    .context("error connecting to gateway")?;

    let result = match login {
        Login::PublicKey(private_key_path) => session
            .authenticate_publickey(
                user,
                PrivateKeyWithHashAlg::new(
                    Arc::new(
                        russh::keys::load_secret_key(private_key_path, None)
                            .context("error loading ssh private key")?,
                    ),
                    None,
                ),
            )
            .await
            .context("Error authenticating with public key")?,
        Login::Password(password) => session
            .authenticate_password(user, password)
            .await
            .context("Error authenticating with password")?,
    };

    match result {
        AuthResult::Success => Ok(Some(ConsoleClient { session })),
        AuthResult::Failure { .. } => Ok(None),
    }
}

impl ConsoleClient {
    pub async fn open_console(&self, options: SessionOptions<'_>) -> eyre::Result<Console> {
        let channel = self
            .session
            .channel_open_session()
            .await
            .context("Error opening session")?;
        for (name, value) in options.env {
            channel
                .set_env(false, *name, *value)
                .await
                .context("Error setting env")?;
        }
        if options.pty {
            channel
                .request_pty(false, "xterm", 100, 30, 0, 0, &[])
                .await
                .context("Error requesting PTY")?;
        }
        channel
            .request_shell(false)
            .await
            .context("Error requesting shell")?;

        Ok(Console {
            channel,
            output: String::new(),
            exit_status: None,
            closed: false,
        })
    }

    pub async fn disconnect(self) {
        self.session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .ok();
    }
}

/// One console session as seen from the operator's terminal.
pub struct Console {
    channel: russh::Channel<Msg>,
    /// Everything printed so far, stdout and stderr interleaved
    pub output: String,
    pub exit_status: Option<u32>,
    closed: bool,
}

impl Console {
    pub async fn send(&self, data: &str) -> eyre::Result<()> {
        self.channel
            .data(data.as_bytes())
            .await
            .context("error writing to console")
    }

    /// Tell the gateway the terminal is now `cols` by `rows`.
    pub async fn resize(&self, cols: u32, rows: u32) -> eyre::Result<()> {
        self.channel
            .window_change(cols, rows, 0, 0)
            .await
            .context("error sending window change")
    }

    /// Read until `needle` shows up in the output.
    pub async fn expect_output(&mut self, needle: &str) -> eyre::Result<()> {
        tokio::time::timeout(TIMEOUT, async {
            while !self.output.contains(needle) {
                if !self.read_next().await {
                    eyre::bail!("channel closed before {needle:?} showed up");
                }
            }
            Ok(())
        })
        .await
        .with_context(|| format!("timed out waiting for {needle:?}, got {:?}", self.output))?
        .with_context(|| format!("output so far: {:?}", self.output))
    }

    /// Read until the gateway closes the channel, and return the exit status it reported.
    pub async fn wait_for_exit(&mut self) -> eyre::Result<Option<u32>> {
        tokio::time::timeout(TIMEOUT, async {
            while self.read_next().await {}
        })
        .await
        .with_context(|| format!("timed out waiting for the session to end, got {:?}", self.output))?;
        Ok(self.exit_status)
    }

    /// Handle one message. Returns false once the channel is closed.
    async fn read_next(&mut self) -> bool {
        if self.closed {
            return false;
        }
        match self.channel.wait().await {
            Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                self.output.push_str(&String::from_utf8_lossy(&data));
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                self.exit_status = Some(exit_status);
            }
            Some(ChannelMsg::Close) | None => {
                self.closed = true;
            }
            Some(other) => {
                tracing::trace!("test client ignoring {other:?}");
            }
        }
        !self.closed
    }
}

pub struct PermissiveSshClient;

impl russh::client::Handler for PermissiveSshClient {
    type Error = eyre::Error;
    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
