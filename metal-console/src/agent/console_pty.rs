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

//! Running a console process under a PTY and pumping it to and from an SSH channel.

use super::backend::{ConsoleCommand, ConsoleError};
use crate::io_util::{self, WindowSize, is_disconnect, set_controlling_terminal_on_exec};
use eyre::Context;
use nix::pty::OpenptyResult;
use russh::server::Msg;
use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf};
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::process::Child;
use tokio::sync::mpsc;

/// How long to wait for the console process to exit on its own after its side of the PTY closed.
const EXIT_GRACE_PERIOD: Duration = Duration::from_secs(2);

pub struct ConsoleProcess {
    child: Child,
    pty_master: AsyncFd<OwnedFd>,
}

/// Why the pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    /// The console process closed its side of the PTY (usually by exiting)
    ConsoleClosed,
    /// The caller went away, or the pump failed
    CallerClosed,
}

impl ConsoleProcess {
    /// Spawn `command` as a session leader with a new PTY of `window_size` as its controlling
    /// terminal and `TERM` set to `term`.
    pub fn spawn(
        command: &ConsoleCommand,
        term: &str,
        window_size: WindowSize,
    ) -> Result<Self, ConsoleError> {
        let clamp = |v: u32| u16::try_from(v).unwrap_or(u16::MAX);
        let OpenptyResult {
            master: pty_master,
            slave: pty_slave,
        } = io_util::alloc_pty(clamp(window_size.col_width), clamp(window_size.row_height))
            .map_err(ConsoleError::Pty)?;
        let pty_master = AsyncFd::new(pty_master)
            .context("error registering pty master with the runtime")
            .map_err(ConsoleError::Pty)?;

        let stdio = |what: &str| {
            pty_slave
                .try_clone()
                .with_context(|| format!("error cloning pty fd for {what}"))
                .map_err(ConsoleError::Pty)
        };
        let mut process = tokio::process::Command::new(&command.program);
        process
            .args(&command.args)
            .stdin(stdio("stdin")?)
            .stdout(stdio("stdout")?)
            .stderr(stdio("stderr")?)
            .env("TERM", term)
            .kill_on_drop(true);
        set_controlling_terminal_on_exec(&mut process, pty_slave.as_raw_fd());

        let child = process.spawn().map_err(|source| ConsoleError::Spawn {
            program: command.program.display().to_string(),
            source,
        })?;
        // Our copies of the slave side have to go, or reads from the master never see the process
        // hang up.
        drop(process);
        drop(pty_slave);

        Ok(Self { child, pty_master })
    }

    /// Pump data between the console and the caller until either side is done, then make sure the
    /// process is gone and return the status to report to the caller.
    pub async fn run(
        mut self,
        machine_id: &str,
        from_caller_rx: mpsc::Receiver<ChannelMsg>,
        caller_rx: ChannelReadHalf,
        caller_tx: &ChannelWriteHalf<Msg>,
    ) -> u32 {
        let end = match pump(
            machine_id,
            &self.pty_master,
            from_caller_rx,
            caller_rx,
            caller_tx,
        )
        .await
        {
            Ok(end) => end,
            Err(error) => {
                tracing::error!(machine_id, ?error, "console relay failed");
                PumpEnd::CallerClosed
            }
        };

        let status = match end {
            PumpEnd::ConsoleClosed => {
                match tokio::time::timeout(EXIT_GRACE_PERIOD, self.child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    Ok(Err(error)) => {
                        tracing::warn!(machine_id, ?error, "error waiting for console process");
                        None
                    }
                    Err(_) => None,
                }
            }
            PumpEnd::CallerClosed => self.child.try_wait().ok().flatten(),
        };

        match status {
            Some(status) => {
                tracing::info!(machine_id, %status, "console process exited");
                exit_code(status)
            }
            None => {
                tracing::debug!(machine_id, "killing console process");
                self.child.kill().await.ok();
                1
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> u32 {
    status
        .code()
        .and_then(|code| u32::try_from(code).ok())
        .unwrap_or(1)
}

/// Poll the PTY master, the caller's input and the caller's channel, until one of them is done.
///
/// EOF and EIO from the PTY are the normal way for a console to end and are not errors.
async fn pump(
    machine_id: &str,
    pty_master: &AsyncFd<OwnedFd>,
    mut from_caller_rx: mpsc::Receiver<ChannelMsg>,
    mut caller_rx: ChannelReadHalf,
    caller_tx: &ChannelWriteHalf<Msg>,
) -> eyre::Result<PumpEnd> {
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            res = io_util::read_from_async_fd(pty_master, &mut buf) => match res {
                Ok(0) => {
                    tracing::debug!(machine_id, "eof from pty fd");
                    return Ok(PumpEnd::ConsoleClosed);
                }
                Ok(n) => {
                    caller_tx
                        .data(&buf[..n])
                        .await
                        .context("error writing console output to channel")?;
                }
                Err(error) if is_disconnect(&error) => {
                    tracing::debug!(machine_id, "console closed the pty");
                    return Ok(PumpEnd::ConsoleClosed);
                }
                Err(error) => {
                    return Err(error).context("error reading from pty");
                }
            },
            msg = from_caller_rx.recv() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    match io_util::write_data_to_async_fd(&data, pty_master).await {
                        Ok(()) => {}
                        Err(error) if is_disconnect(&error) => {
                            return Ok(PumpEnd::ConsoleClosed);
                        }
                        Err(error) => {
                            return Err(error).context("error writing to pty");
                        }
                    }
                }
                Some(ChannelMsg::WindowChange {
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                }) => {
                    if let Err(error) = io_util::set_window_size(
                        pty_master.get_ref(),
                        col_width,
                        row_height,
                        pix_width,
                        pix_height,
                    ) {
                        tracing::warn!(machine_id, ?error, "error resizing pty");
                    }
                }
                Some(ChannelMsg::Eof) | None => {
                    tracing::debug!(machine_id, "caller closed input");
                    return Ok(PumpEnd::CallerClosed);
                }
                Some(other) => {
                    tracing::debug!(machine_id, "not handling {other:?} in console");
                }
            },
            msg = caller_rx.wait() => if msg.is_none() {
                tracing::debug!(machine_id, "caller channel closed");
                return Ok(PumpEnd::CallerClosed);
            },
        }
    }
}
