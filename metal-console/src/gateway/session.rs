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

//! One relayed console session: from the caller's shell request to the caller's exit status.

use super::GatewayState;
use super::inner_hop::{InnerHop, InnerHopRequest};
use super::relay;
use super::revalidation::{self, MonitorHandle, TerminationReason};
use crate::ShutdownHandle;
use crate::authorization::AdmissionClass;
use crate::io_util::WindowSize;
use eyre::Context;
use russh::server::Msg;
use russh::{Channel, ChannelMsg, ChannelWriteHalf};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};

pub struct SessionRequest {
    pub machine_id: String,
    pub admission: AdmissionClass,
    pub caller_channel: Channel<Msg>,
    /// Caller input, fed by the connection handler
    pub from_caller_rx: mpsc::Receiver<ChannelMsg>,
    pub window_size: WindowSize,
    pub oidc_token: Option<String>,
}

/// Run the session to completion. Nothing is returned: every outcome ends with an exit status on
/// the caller's channel.
pub async fn run(state: Arc<GatewayState>, request: SessionRequest) {
    let SessionRequest {
        machine_id,
        admission,
        caller_channel,
        from_caller_rx,
        window_size,
        oidc_token,
    } = request;

    let (caller_rx, caller_tx) = caller_channel.split();
    let caller_tx = Arc::new(caller_tx);

    let (inner_client, inner_channel) =
        match connect(&state, &machine_id, oidc_token.as_deref()).await {
            Ok(inner) => inner.into_parts(),
            Err(error) => {
                tracing::error!(machine_id, ?error, "unable to connect to console agent");
                drop(from_caller_rx);
                caller_tx
                    .data(format!("unable to connect to the console of {machine_id}\r\n").as_bytes())
                    .await
                    .ok();
                finish(&caller_tx, 1).await;
                return;
            }
        };

    let (inner_rx, inner_tx) = inner_channel.split();
    let inner_tx = Arc::new(inner_tx);
    // The inner PTY starts out at a fixed size, give it the caller's
    inner_tx
        .window_change(
            window_size.col_width,
            window_size.row_height,
            window_size.pix_width,
            window_size.pix_height,
        )
        .await
        .ok();

    let console_address = match &admission {
        AdmissionClass::Owner(owner) => Some(owner.console_address.as_str()),
        AdmissionClass::Admin => None,
    };
    tracing::info!(machine_id, console_address, "console session started");
    state.metrics.sessions.add(1, &[]);

    let exit_status = Arc::new(OnceLock::new());
    let (stderr_tx, stderr_rx) = mpsc::channel(32);
    let mut relays = JoinSet::new();
    relays.spawn(relay::caller_to_inner(
        from_caller_rx,
        caller_rx,
        inner_tx.clone(),
    ));
    relays.spawn(relay::inner_stdout_to_caller(
        inner_rx,
        caller_tx.clone(),
        stderr_tx,
        exit_status.clone(),
    ));
    relays.spawn(relay::inner_stderr_to_caller(stderr_rx, caller_tx.clone()));

    let mut monitor = match &admission {
        AdmissionClass::Owner(owner) => Some(revalidation::spawn(
            machine_id.clone(),
            owner.fingerprint.clone(),
            state.registry.clone(),
            state.directory.clone(),
            state.config.revalidation_interval,
        )),
        AdmissionClass::Admin => None,
    };

    // Whichever relay finishes first ends the session: once one direction is gone there is no
    // console left to talk to, and the other relays would only wait on a dead channel.
    let forced = tokio::select! {
        finished = relays.join_next() => {
            log_relay_end(&machine_id, finished);
            None
        }
        reason = wait_for_termination(monitor.as_mut()) => Some(reason),
    };
    relays.abort_all();
    // Drained so that caller input is closed off before the caller learns the session is over
    while relays.join_next().await.is_some() {}

    match &forced {
        Some(reason) => {
            tracing::info!(machine_id, %reason, "terminating console session");
            state.metrics.revalidation_terminations.add(
                1,
                &[opentelemetry::KeyValue::new("reason", reason.metric_label())],
            );
            caller_tx
                .data(format!("{reason}\r\n").as_bytes())
                .await
                .ok();
        }
        None => {
            if let Some(monitor) = monitor.take() {
                monitor.shutdown_and_wait().await;
            }
        }
    }

    // Inner side first, then the caller
    inner_tx.close().await.ok();
    inner_client.disconnect().await;
    state.metrics.sessions.add(-1, &[]);

    let status = match (&forced, exit_status.get()) {
        (None, Some(0)) => 0,
        _ => 1,
    };
    tracing::info!(machine_id, status, "console session ended");
    finish(&caller_tx, status).await;

    // Keeps the allocation registered until the very end of the session
    drop(admission);
}

/// Refuse a session after the handshake, with a reason for the caller.
pub async fn refuse(caller_channel: Channel<Msg>, message: &str) {
    let (_caller_rx, caller_tx) = caller_channel.split();
    caller_tx.data(message.as_bytes()).await.ok();
    finish(&caller_tx, 1).await;
}

async fn connect(
    state: &GatewayState,
    machine_id: &str,
    oidc_token: Option<&str>,
) -> eyre::Result<InnerHop> {
    let machine = state
        .directory
        .find_machine(machine_id)
        .await
        .context("error fetching machine")?;
    let address = state.mode.inner_hop_address(&machine)?;
    let credential = state
        .mode
        .management_credential(state.directory.as_ref(), &machine)
        .await
        .context("error fetching management credential")?;

    tracing::info!(machine_id, address, "connecting to console agent");
    let inner = InnerHop::open(
        &state.config,
        InnerHopRequest {
            address: &address,
            machine_id,
            credential: &credential,
            oidc_token,
        },
    )
    .await?;

    // The reply arrives on the relayed channel, where a Failure ends the session
    inner
        .channel
        .exec(true, state.config.inner_command.as_bytes())
        .await
        .context("error starting console command")?;
    Ok(inner)
}

async fn wait_for_termination(monitor: Option<&mut MonitorHandle>) -> TerminationReason {
    match monitor {
        Some(monitor) => monitor.terminated().await,
        None => std::future::pending().await,
    }
}

fn log_relay_end(machine_id: &str, finished: Option<Result<eyre::Result<()>, JoinError>>) {
    match finished {
        Some(Ok(Ok(()))) | None => {
            tracing::debug!(machine_id, "relay finished");
        }
        Some(Ok(Err(error))) => {
            tracing::warn!(machine_id, ?error, "relay failed");
        }
        Some(Err(error)) => {
            tracing::error!(machine_id, %error, "relay task panicked");
        }
    }
}

async fn finish(caller_tx: &ChannelWriteHalf<Msg>, exit_status: u32) {
    caller_tx.exit_status(exit_status).await.ok();
    caller_tx.eof().await.ok();
    caller_tx.close().await.ok();
}
