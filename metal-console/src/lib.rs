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

//! metal-console - two-hop SSH serial console gateway
//!
//! Operators SSH to the gateway using a machine ID as the username. The gateway authorizes them
//! against the machine directory, then opens a second SSH connection (over mutual TLS) to a console
//! agent on the management network, hands off the machine's BMC credentials, and relays the
//! terminal between the two sessions. The agent attaches to the machine's console with
//! `ipmitool sol activate`, or `virsh console` in development environments.
//!
//! ## Architecture
//!
//! - [`gateway`]: The user-facing SSH server: authentication, the inner hop, relaying and
//!   revalidation of running sessions
//! - [`agent`]: The management-network-facing SSH server that attaches to consoles
//! - [`authorization`]: Owner (public key) and administrator (bearer token) admission rules
//! - [`credential`]: Encoding of the BMC credential handed from the gateway to the agent
//! - [`directory`]: Client for the machine directory (metal-api)
//! - [`registry`]: Per-machine bookkeeping of allocation fingerprints for live sessions
//! - [`config`]: Configuration management with TOML file support

pub mod agent;
pub mod authorization;
pub mod config;
pub mod credential;
pub mod directory;
pub mod gateway;
pub mod metrics;
pub mod metrics_service;
pub mod registry;

pub(crate) mod address;
pub(crate) mod connection;
pub(crate) mod io_util;
pub(crate) mod tls;

use eyre::Context;
use russh::ChannelMsg;
use tokio::sync::oneshot;

/// Environment variable carrying the encoded BMC credential across the inner hop.
pub static CREDENTIAL_ENV_VAR: &str = "LC_IPMI_DATA";

/// Environment variable a caller can set (ssh forwards `LC_*` variables by default) to carry a
/// bearer token for administrator access.
pub static OIDC_TOKEN_ENV_VAR: &str = "LC_METAL_STACK_OIDC_TOKEN";

/// Take a russh::ChannelMsg coming from the caller and call the appropriate method on the inner
/// hop's channel.
///
/// Only the messages that make sense for an interactive console are forwarded. This whole thing
/// would be unnecessary if [`russh::ChannelWriteHalf::send_msg`] were public. :(
pub(crate) async fn proxy_channel_message<S>(
    channel_msg: &ChannelMsg,
    channel: &russh::ChannelWriteHalf<S>,
) -> eyre::Result<()>
where
    S: From<(russh::ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    match channel_msg {
        ChannelMsg::Data { data } => {
            channel
                .data(data.iter().as_slice())
                .await
                .context("error sending data")?;
        }
        ChannelMsg::ExtendedData { data, ext } => {
            channel
                .extended_data(*ext, data.iter().as_slice())
                .await
                .context("error sending extended data")?;
        }
        ChannelMsg::Eof => {
            channel.eof().await.context("error sending eof")?;
        }
        ChannelMsg::Signal { signal } => {
            channel
                .signal(signal.clone())
                .await
                .context("error sending signal")?;
        }
        ChannelMsg::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            channel
                .window_change(*col_width, *row_height, *pix_width, *pix_height)
                .await
                .context("error sending window change")?;
        }
        _ => {
            tracing::debug!("Ignoring unknown channel message {channel_msg:?}");
        }
    }

    Ok(())
}

/// Convenience trait for a task with a shutdown handle (in the form of a [`oneshot::Sender<()>`])
///
/// The shutdown handle must be treated such that dropping it means "shut down now", (because any
/// call which is awaiting the channel will immediately return.) By convention, dropping the
/// channel and sending the shutdown message mean the same thing.
pub trait ShutdownHandle<R> {
    fn into_parts(self) -> (oneshot::Sender<()>, tokio::task::JoinHandle<R>);

    fn shutdown_and_wait(self) -> impl std::future::Future<Output = R> + Send
    where
        Self: Send + Sized,
        R: Send,
    {
        async move {
            let (shutdown_tx, join_handle) = self.into_parts();
            // Let the shutdown handle drop, which causes any reads to finish (semantically the same as
            // sending an empty tuple over the channel, both mean "shut down now").
            std::mem::drop(shutdown_tx);
            join_handle.await.expect("task panicked")
        }
    }
}
