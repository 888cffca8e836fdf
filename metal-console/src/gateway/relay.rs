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

//! The three copy loops between a caller's channel and the inner hop's channel.
//!
//! russh delivers the inner side's stdout and stderr on the same channel, so the stdout relay also
//! routes stderr to its own relay through a channel. Each relay returns when its source is done.

use crate::proxy_channel_message;
use eyre::Context;
use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;

/// SSH_EXTENDED_DATA_STDERR
const STDERR_EXT: u32 = 1;

/// Caller input (keystrokes, window changes, EOF) to the inner hop. Input arrives through the
/// connection handler's callbacks, the caller's read half is only watched for the channel closing.
pub async fn caller_to_inner(
    mut from_caller_rx: mpsc::Receiver<ChannelMsg>,
    mut caller_rx: ChannelReadHalf,
    inner_tx: Arc<ChannelWriteHalf<russh::client::Msg>>,
) -> eyre::Result<()> {
    loop {
        tokio::select! {
            msg = from_caller_rx.recv() => match msg {
                Some(msg) => {
                    proxy_channel_message(&msg, &inner_tx)
                        .await
                        .context("error relaying caller input to console agent")?;
                    if matches!(msg, ChannelMsg::Eof) {
                        tracing::debug!("caller sent EOF");
                        return Ok(());
                    }
                }
                None => return Ok(()),
            },
            msg = caller_rx.wait() => if msg.is_none() {
                tracing::debug!("caller channel closed");
                return Ok(());
            },
        }
    }
}

/// Inner hop output to the caller. Stderr is handed to `stderr_tx`, the exit status (if the agent
/// reports one) is stored in `exit_status`.
pub async fn inner_stdout_to_caller(
    mut inner_rx: ChannelReadHalf,
    caller_tx: Arc<ChannelWriteHalf<russh::server::Msg>>,
    stderr_tx: mpsc::Sender<Vec<u8>>,
    exit_status: Arc<OnceLock<u32>>,
) -> eyre::Result<()> {
    while let Some(msg) = inner_rx.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                caller_tx
                    .data(&data[..])
                    .await
                    .context("error relaying console output to caller")?;
            }
            ChannelMsg::ExtendedData { data, ext } if ext == STDERR_EXT => {
                if stderr_tx.send(data.to_vec()).await.is_err() {
                    tracing::debug!("stderr relay is gone, dropping console stderr");
                }
            }
            ChannelMsg::ExitStatus {
                exit_status: status,
            } => {
                tracing::debug!(status, "console agent reported exit status");
                exit_status.set(status).ok();
            }
            ChannelMsg::Failure => {
                return Err(eyre::format_err!("console agent refused to run the console command"));
            }
            ChannelMsg::Close => break,
            // Eof is followed by Close, Success is the reply to the exec request
            other => {
                tracing::trace!("ignoring {other:?} from console agent");
            }
        }
    }
    Ok(())
}

pub async fn inner_stderr_to_caller(
    mut stderr_rx: mpsc::Receiver<Vec<u8>>,
    caller_tx: Arc<ChannelWriteHalf<russh::server::Msg>>,
) -> eyre::Result<()> {
    while let Some(data) = stderr_rx.recv().await {
        caller_tx
            .extended_data(STDERR_EXT, data.as_slice())
            .await
            .context("error relaying console stderr to caller")?;
    }
    Ok(())
}
