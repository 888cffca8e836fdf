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

//! The gateway's russh connection handler: authentication of callers, and the per-channel
//! bookkeeping that feeds caller input into a running [`session`](super::session).

use super::GatewayState;
use super::session::{self, SessionRequest};
use crate::OIDC_TOKEN_ENV_VAR;
use crate::authorization::{AdminRejection, AdmissionClass, AuthorizationDecision, Rejection};
use crate::connection::{RusshOrEyreError, peer_addr_string};
use crate::io_util::WindowSize;
use lazy_static::lazy_static;
use russh::keys::PublicKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, MethodKind, MethodSet, Pty, Sig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

lazy_static! {
    static ref PUBKEY_AUTH_FAILURE_METRIC: [opentelemetry::KeyValue; 1] =
        [opentelemetry::KeyValue::new("auth_type", "public_key")];
    static ref PASSWORD_AUTH_FAILURE_METRIC: [opentelemetry::KeyValue; 1] =
        [opentelemetry::KeyValue::new("auth_type", "password")];
    static ref OIDC_TOKEN_AUTH_FAILURE_METRIC: [opentelemetry::KeyValue; 1] =
        [opentelemetry::KeyValue::new("auth_type", "oidc_token")];
}

static SECOND_CONSOLE_MESSAGE: &str = "a console session is already running on this connection\r\n";

pub struct Handler {
    state: Arc<GatewayState>,
    /// The machine ID the caller authenticated for
    authenticated_user: Option<String>,
    auth_state: Option<AuthState>,
    per_client_state: HashMap<ChannelId, PerClientState>,
    last_auth_failure: Option<AuthFailureReason>,
    // Specifically for logging. A string so that we can use <unknown> if we don't get an address at connection time.
    peer_addr: String,
}

/// Outcome of a successful SSH authentication. Not every one of them ends in a console.
#[derive(Clone)]
enum AuthState {
    Admitted(AdmissionClass),
    /// Resolved with the caller's token env var when the session starts
    AdminTokenRequired,
    /// The caller's bearer token was refused. The handshake still succeeds so that the reason can
    /// be written to the caller's terminal.
    Refused(AdminRejection),
}

#[derive(Default)]
struct PerClientState {
    // Option so that it can be taken with .take() when we get a shell_request or exec_request
    client_channel: Option<Channel<Msg>>,
    window_size: Option<WindowSize>,
    oidc_token: Option<String>,
    to_session_tx: Option<mpsc::Sender<ChannelMsg>>,
}

impl Handler {
    pub fn new(state: Arc<GatewayState>, peer_addr: Option<SocketAddr>) -> Self {
        tracing::debug!("spawning new gateway connection handler");
        state.metrics.clients.add(1, &[]);
        Self {
            state,
            authenticated_user: None,
            auth_state: None,
            per_client_state: HashMap::new(),
            last_auth_failure: None,
            peer_addr: peer_addr_string(peer_addr),
        }
    }

    fn accept(&mut self, user: &str, auth_state: AuthState) -> Auth {
        self.authenticated_user = Some(user.to_owned());
        self.auth_state = Some(auth_state);
        Auth::Accept
    }

    fn get_client_state_or_report_error(
        &mut self,
        session: &mut Session,
        channel_id: ChannelId,
    ) -> Option<&mut PerClientState> {
        if let Some(state) = self.per_client_state.get_mut(&channel_id) {
            return Some(state);
        }

        tracing::error!(self.peer_addr, "Request on unknown channel");
        session.channel_failure(channel_id).ok();
        session
            .data(channel_id, "metal-console error: Unknown channel\n".into())
            .ok();
        session.close(channel_id).ok();
        None
    }

    /// Forward a message from the caller to the channel's session, if one is running.
    async fn send_to_session(&mut self, channel_id: ChannelId, msg: ChannelMsg) {
        let Some(to_session_tx) = self
            .per_client_state
            .get(&channel_id)
            .and_then(|client_state| client_state.to_session_tx.as_ref())
        else {
            return;
        };
        // The session may already be tearing down, in which case there's no one left to tell
        if to_session_tx.send(msg).await.is_err() {
            tracing::debug!(self.peer_addr, "session gone, dropping caller message");
        }
    }

    /// A console runs until its session drops the receiving end of its input channel.
    fn console_running(&self) -> bool {
        self.per_client_state.values().any(|client_state| {
            client_state
                .to_session_tx
                .as_ref()
                .is_some_and(|tx| !tx.is_closed())
        })
    }

    /// Shell and exec requests both start the console. The exec command itself is meaningless
    /// here: there is only ever the console.
    async fn start_session(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), RusshOrEyreError> {
        let (Some(machine_id), Some(auth_state)) =
            (self.authenticated_user.clone(), self.auth_state.clone())
        else {
            return Err(eyre::format_err!(
                "BUG: session requested but we don't have an authenticated user"
            )
            .into());
        };
        let state = self.state.clone();
        let peer_addr = self.peer_addr.clone();
        let console_running = self.console_running();
        let Some(client_state) = self.get_client_state_or_report_error(session, channel_id) else {
            return Ok(());
        };

        // We have to take ownership of the client channel here so that we can drop it when the
        // session ends, which means one console per channel.
        let Some(channel) = client_state.client_channel.take() else {
            tracing::error!(peer_addr, "Channel unavailable, cannot start console session");
            session.channel_failure(channel_id).ok();
            session
                .data(
                    channel_id,
                    "metal-console error: Channel unavailable\r\n".into(),
                )
                .ok();
            session.close(channel_id).ok();
            return Ok(());
        };
        session.channel_success(channel_id).ok();

        if console_running {
            tracing::warn!(peer_addr, machine_id, "refusing a second console on one connection");
            tokio::spawn(async move {
                session::refuse(channel, SECOND_CONSOLE_MESSAGE).await;
            });
            return Ok(());
        }

        let admission = match auth_state {
            AuthState::Admitted(admission) => admission,
            AuthState::Refused(reason) => {
                tokio::spawn(async move {
                    session::refuse(channel, &format!("{reason}\r\n")).await;
                });
                return Ok(());
            }
            AuthState::AdminTokenRequired => {
                match state
                    .authorizer
                    .authorize_admin_token(&machine_id, client_state.oidc_token.as_deref())
                    .await
                {
                    AuthorizationDecision::Admitted(admission) => admission,
                    AuthorizationDecision::Rejected(rejection) => {
                        tracing::warn!(peer_addr, machine_id, %rejection, "administrator token rejected");
                        state
                            .metrics
                            .auth_failures
                            .add(1, OIDC_TOKEN_AUTH_FAILURE_METRIC.as_slice());
                        let message = rejection
                            .caller_message()
                            .unwrap_or_else(|| rejection.to_string());
                        tokio::spawn(async move {
                            session::refuse(channel, &format!("{message}\r\n")).await;
                        });
                        return Ok(());
                    }
                    AuthorizationDecision::AdminTokenRequired => {
                        return Err(eyre::format_err!(
                            "BUG: administrator token check asked for an administrator token"
                        )
                        .into());
                    }
                }
            }
        };

        let Some(window_size) = client_state.window_size else {
            tracing::info!(peer_addr, machine_id, "session requested without a PTY");
            tokio::spawn(async move {
                session::refuse(channel, "No PTY requested.\n").await;
            });
            return Ok(());
        };

        let (to_session_tx, from_caller_rx) = mpsc::channel(64);
        client_state.to_session_tx = Some(to_session_tx);
        let oidc_token = client_state.oidc_token.clone();
        tokio::spawn(session::run(
            state,
            SessionRequest {
                machine_id,
                admission,
                caller_channel: channel,
                from_caller_rx,
                window_size,
                oidc_token,
            },
        ));
        Ok(())
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        tracing::info!(self.peer_addr, "end gateway connection");
        self.state.metrics.clients.add(-1, &[]);
        // All auth failure paths set self.last_auth_failure, but auth can still succeed (they may
        // be trying multiple pubkeys, or fall back to a password.) So if authenticated_user is None
        // but last_auth_failure is Some, bump the metrics.
        if let (None, Some(last_auth_failure)) = (&self.authenticated_user, &self.last_auth_failure)
        {
            tracing::warn!(
                self.peer_addr,
                "authentication failed for user: {}",
                last_auth_failure.user()
            );
            self.state
                .metrics
                .auth_failures
                .add(1, last_auth_failure.metric());
        }
    }
}

impl russh::server::Handler for Handler {
    type Error = RusshOrEyreError;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(
                [MethodKind::PublicKey, MethodKind::Password].as_slice(),
            )),
            partial_success: false,
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        match self
            .state
            .authorizer
            .authorize_public_key(user, public_key)
            .await
        {
            AuthorizationDecision::Admitted(admission) => {
                Ok(self.accept(user, AuthState::Admitted(admission)))
            }
            AuthorizationDecision::AdminTokenRequired => {
                tracing::info!(
                    self.peer_addr,
                    machine_id = user,
                    "machine needs an administrator, will check {OIDC_TOKEN_ENV_VAR} at session start"
                );
                Ok(self.accept(user, AuthState::AdminTokenRequired))
            }
            AuthorizationDecision::Rejected(rejection) => {
                tracing::debug!(self.peer_addr, machine_id = user, %rejection, "public key rejected");
                self.last_auth_failure = Some(AuthFailureReason::PubKey {
                    user: user.to_owned(),
                });
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.state.authorizer.authorize_password(user, password).await {
            AuthorizationDecision::Admitted(admission) => {
                Ok(self.accept(user, AuthState::Admitted(admission)))
            }
            AuthorizationDecision::Rejected(Rejection::Admin(reason)) => {
                tracing::warn!(self.peer_addr, machine_id = user, %reason, "administrator password rejected");
                self.state
                    .metrics
                    .auth_failures
                    .add(1, PASSWORD_AUTH_FAILURE_METRIC.as_slice());
                Ok(self.accept(user, AuthState::Refused(reason)))
            }
            AuthorizationDecision::Rejected(_) | AuthorizationDecision::AdminTokenRequired => {
                self.last_auth_failure = Some(AuthFailureReason::Password {
                    user: user.to_owned(),
                });
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::trace!(self.peer_addr, "channel_open_session");
        if self.authenticated_user.is_none() {
            return Err(eyre::format_err!(
                "BUG: channel_open_session called but we don't have an authenticated user"
            )
            .into());
        }

        self.per_client_state.insert(
            channel.id(),
            PerClientState {
                client_channel: Some(channel),
                ..Default::default()
            },
        );
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!(self.peer_addr, term, "pty_request");
        if let Some(client_state) = self.get_client_state_or_report_error(session, channel) {
            client_state.window_size = Some(WindowSize {
                col_width,
                row_height,
                pix_width,
                pix_height,
            });
            session.channel_success(channel).ok();
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!(self.peer_addr, variable_name, "env_request");
        if variable_name == OIDC_TOKEN_ENV_VAR {
            if let Some(client_state) = self.get_client_state_or_report_error(session, channel) {
                client_state.oidc_token = Some(variable_value.to_owned());
            }
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!(self.peer_addr, "shell_request");
        self.start_session(channel, session).await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(
            self.peer_addr,
            "exec request for {:?}, starting the console instead",
            String::from_utf8_lossy(data)
        );
        self.start_session(channel, session).await
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.send_to_session(
            channel,
            ChannelMsg::Data {
                data: data.to_vec().into(),
            },
        )
        .await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!(self.peer_addr, "window_change_request");
        if let Some(client_state) = self.get_client_state_or_report_error(session, channel) {
            client_state.window_size = Some(WindowSize {
                col_width,
                row_height,
                pix_width,
                pix_height,
            });
        }
        self.send_to_session(
            channel,
            ChannelMsg::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        )
        .await;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.send_to_session(channel, ChannelMsg::Signal { signal })
            .await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!(self.peer_addr, "channel_eof");
        self.send_to_session(channel, ChannelMsg::Eof).await;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!(self.peer_addr, "channel_close");
        // Dropping the sender ends the session's caller relay
        self.per_client_state.remove(&channel);
        Ok(())
    }
}

/// Indicates the reason auth may have failed. This is so we can avoid logging warnings about failed
/// authentication if only the first method (pubkey) failed but the second succeeded.
enum AuthFailureReason {
    PubKey { user: String },
    Password { user: String },
}

impl AuthFailureReason {
    fn metric(&self) -> &'static [opentelemetry::KeyValue] {
        match self {
            AuthFailureReason::PubKey { .. } => PUBKEY_AUTH_FAILURE_METRIC.as_slice(),
            AuthFailureReason::Password { .. } => PASSWORD_AUTH_FAILURE_METRIC.as_slice(),
        }
    }

    fn user(&self) -> &str {
        match self {
            AuthFailureReason::PubKey { user } => user,
            AuthFailureReason::Password { user } => user,
        }
    }
}
