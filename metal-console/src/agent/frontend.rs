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

//! The agent's russh connection handler. The transport is already mutually authenticated by TLS,
//! so SSH authentication only names the machine.

use super::AgentState;
use super::session::{self, PtyRequest, SessionRequest};
use crate::CREDENTIAL_ENV_VAR;
use crate::connection::{RusshOrEyreError, peer_addr_string};
use crate::io_util::WindowSize;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, Pty};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub struct Handler {
    state: Arc<AgentState>,
    authenticated_user: Option<String>,
    per_client_state: HashMap<ChannelId, PerClientState>,
    peer_addr: String,
}

struct PerClientState {
    client_channel: Option<Channel<Msg>>,
    pty: Option<PtyRequest>,
    credential_tx: watch::Sender<Option<String>>,
    to_console_tx: Option<mpsc::Sender<ChannelMsg>>,
}

impl Handler {
    pub fn new(state: Arc<AgentState>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            state,
            authenticated_user: None,
            per_client_state: HashMap::new(),
            peer_addr: peer_addr_string(peer_addr),
        }
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
        session.close(channel_id).ok();
        None
    }

    async fn send_to_console(&mut self, channel_id: ChannelId, msg: ChannelMsg) {
        let Some(to_console_tx) = self
            .per_client_state
            .get(&channel_id)
            .and_then(|client_state| client_state.to_console_tx.as_ref())
        else {
            return;
        };
        if to_console_tx.send(msg).await.is_err() {
            tracing::debug!(self.peer_addr, "console gone, dropping caller message");
        }
    }

    async fn start_console(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), RusshOrEyreError> {
        let Some(machine_id) = self.authenticated_user.clone() else {
            return Err(eyre::format_err!(
                "BUG: console requested but we don't have an authenticated user"
            )
            .into());
        };
        let state = self.state.clone();
        let peer_addr = self.peer_addr.clone();
        let Some(client_state) = self.get_client_state_or_report_error(session, channel_id) else {
            return Ok(());
        };
        let Some(channel) = client_state.client_channel.take() else {
            tracing::error!(peer_addr, "Channel unavailable, cannot start console");
            session.channel_failure(channel_id).ok();
            session.close(channel_id).ok();
            return Ok(());
        };
        session.channel_success(channel_id).ok();

        let (to_console_tx, from_caller_rx) = mpsc::channel(64);
        client_state.to_console_tx = Some(to_console_tx);
        tokio::spawn(session::run(
            state,
            SessionRequest {
                machine_id,
                channel,
                credential_rx: client_state.credential_tx.subscribe(),
                pty: client_state.pty.clone(),
                from_caller_rx,
            },
        ));
        Ok(())
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        tracing::info!(self.peer_addr, "end agent connection");
    }
}

impl russh::server::Handler for Handler {
    type Error = RusshOrEyreError;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        tracing::info!(self.peer_addr, machine_id = user, "console requested");
        self.authenticated_user = Some(user.to_owned());
        Ok(Auth::Accept)
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
        let (credential_tx, _) = watch::channel(None);
        self.per_client_state.insert(
            channel.id(),
            PerClientState {
                client_channel: Some(channel),
                pty: None,
                credential_tx,
                to_console_tx: None,
            },
        );
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!(self.peer_addr, variable_name, "env_request");
        if variable_name == CREDENTIAL_ENV_VAR {
            if let Some(client_state) = self.get_client_state_or_report_error(session, channel) {
                client_state
                    .credential_tx
                    .send_replace(Some(variable_value.to_owned()));
            }
        }
        Ok(())
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
            client_state.pty = Some(PtyRequest {
                term: term.to_owned(),
                window_size: WindowSize {
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                },
            });
            session.channel_success(channel).ok();
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!(self.peer_addr, "shell_request");
        self.start_console(channel, session).await
    }

    /// The command doesn't matter, every session is a console.
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!(self.peer_addr, "exec_request");
        self.start_console(channel, session).await
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.send_to_console(
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
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.send_to_console(
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

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.send_to_console(channel, ChannelMsg::Eof).await;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!(self.peer_addr, "channel_close");
        self.per_client_state.remove(&channel);
        Ok(())
    }
}
