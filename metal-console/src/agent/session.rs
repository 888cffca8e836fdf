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

//! One console attachment on the agent: receive the credential, greet the caller, run the
//! console process until either side is done.

use super::AgentState;
use super::console_pty::ConsoleProcess;
use crate::credential::{CredentialError, poll_for_credential};
use crate::io_util::WindowSize;
use russh::server::Msg;
use russh::{Channel, ChannelMsg, ChannelWriteHalf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// The caller's PTY request.
#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub term: String,
    pub window_size: WindowSize,
}

pub struct SessionRequest {
    pub machine_id: String,
    pub channel: Channel<Msg>,
    /// The raw credential token, as set by the caller's env request
    pub credential_rx: watch::Receiver<Option<String>>,
    pub pty: Option<PtyRequest>,
    pub from_caller_rx: mpsc::Receiver<ChannelMsg>,
}

pub async fn run(state: Arc<AgentState>, request: SessionRequest) {
    let SessionRequest {
        machine_id,
        channel,
        credential_rx,
        pty,
        from_caller_rx,
    } = request;
    let (caller_rx, caller_tx) = channel.split();

    let credential = match poll_for_credential(
        state.config.credential_poll_attempts,
        state.config.credential_poll_interval,
        || {
            let token = credential_rx.borrow().clone();
            async move { token }
        },
    )
    .await
    {
        Ok(credential) => credential,
        Err(error) => {
            match &error {
                CredentialError::Missing { .. } => {
                    tracing::error!(machine_id, %error, "failed to receive console credentials")
                }
                CredentialError::Malformed(_) | CredentialError::FieldTooLong { .. } => {
                    tracing::error!(machine_id, %error, "failed to decode console credentials")
                }
            }
            state.metrics.credential_failures.add(1, &[]);
            finish(&caller_tx, 1).await;
            return;
        }
    };

    tracing::info!(machine_id, address = credential.address, "connection to console");
    let greeting = format!(
        "Connecting to console of {machine_id:?} ({})\r\n{}\r\n",
        credential.address,
        state.backend.exit_hint()
    );
    caller_tx.data(greeting.as_bytes()).await.ok();

    let Some(pty) = pty else {
        caller_tx.data(b"No PTY requested.\n".as_slice()).await.ok();
        finish(&caller_tx, 1).await;
        return;
    };

    let process = match state
        .backend
        .command(&credential)
        .and_then(|command| ConsoleProcess::spawn(&command, &pty.term, pty.window_size))
    {
        Ok(process) => process,
        Err(error) => {
            // Details stay in the log
            tracing::error!(machine_id, %error, "console command execution failed");
            finish(&caller_tx, 1).await;
            return;
        }
    };

    state.metrics.sessions.add(1, &[]);
    let exit_status = process
        .run(&machine_id, from_caller_rx, caller_rx, &caller_tx)
        .await;
    state.metrics.sessions.add(-1, &[]);

    tracing::info!(machine_id, exit_status, "console session ended");
    finish(&caller_tx, exit_status).await;
}

async fn finish(caller_tx: &ChannelWriteHalf<Msg>, exit_status: u32) {
    caller_tx.exit_status(exit_status).await.ok();
    caller_tx.eof().await.ok();
    caller_tx.close().await.ok();
}
