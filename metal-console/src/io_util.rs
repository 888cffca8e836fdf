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

//! Plumbing for running console processes under a PTY and polling the master side from tokio.
//!
//! The master fd is a plain UNIX fd set to O_NONBLOCK and wrapped in an [`AsyncFd`], so reads and
//! writes follow the usual pattern of trying until EWOULDBLOCK, then going back to waiting for
//! readiness.

use eyre::Context;
use nix::errno::Errno;
use nix::pty::{OpenptyResult, Winsize};
use nix::sys::termios::Termios;
use nix::unistd;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;

/// Terminal dimensions as carried by SSH pty and window-change requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
}

/// Open a PTY pair of the given size, with the master side set to non-blocking.
pub fn alloc_pty(cols: u16, rows: u16) -> eyre::Result<OpenptyResult> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let pty = nix::pty::openpty(Some(&winsize), None::<&Termios>).context("openpty failed")?;

    let master_fd = pty.master.as_raw_fd();
    // SAFETY: fcntl on an fd we own
    unsafe {
        let flags = libc::fcntl(master_fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error()).context("error reading pty master flags");
        }
        if libc::fcntl(master_fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error()).context("error setting pty master non-blocking");
        }
        // The child must not inherit the master side, or we'd never see EOF when it exits.
        if libc::fcntl(master_fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error()).context("error setting FD_CLOEXEC on pty master");
        }
    }

    Ok(pty)
}

/// Make the spawned process a session leader with `pty_slave_fd` as its controlling terminal, so
/// that it gets job control and the line discipline behaves like it would in a real terminal.
pub fn set_controlling_terminal_on_exec(
    command: &mut tokio::process::Command,
    pty_slave_fd: RawFd,
) {
    // SAFETY: only async-signal-safe calls between fork and exec
    unsafe {
        command.pre_exec(move || {
            unistd::setsid().map_err(io::Error::from)?;
            if libc::ioctl(pty_slave_fd, libc::TIOCSCTTY, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Read whatever is available from `fd`, waiting until something is. Returns 0 on EOF.
pub async fn read_from_async_fd(fd: &AsyncFd<OwnedFd>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        match unistd::read(guard.get_inner(), buf) {
            Ok(n) => return Ok(n),
            Err(e) if e == Errno::EWOULDBLOCK => {
                // clear the readiness so we go back to polling
                guard.clear_ready();
            }
            Err(e) if e == Errno::EINTR => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Write all of `data` to `fd`, waiting for it to become writable as often as necessary.
pub async fn write_data_to_async_fd(data: &[u8], fd: &AsyncFd<OwnedFd>) -> io::Result<()> {
    let mut remaining = data;
    while !remaining.is_empty() {
        let mut guard = fd.writable().await?;
        match unistd::write(guard.get_inner(), remaining) {
            Ok(n) => remaining = &remaining[n..],
            Err(e) if e == Errno::EWOULDBLOCK => guard.clear_ready(),
            Err(e) if e == Errno::EINTR => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Update the kernel's idea of the terminal size. Values that don't fit are clamped.
pub fn set_window_size(
    fd: &impl AsRawFd,
    col_width: u32,
    row_height: u32,
    pix_width: u32,
    pix_height: u32,
) -> io::Result<()> {
    let clamp = |v: u32| u16::try_from(v).unwrap_or(u16::MAX);
    let winsz = libc::winsize {
        ws_row: clamp(row_height),
        ws_col: clamp(col_width),
        ws_xpixel: clamp(pix_width),
        ws_ypixel: clamp(pix_height),
    };
    // SAFETY: ioctl on master FD
    if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &winsz) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// EOF and EIO are how a PTY master reports that the other side went away.
pub fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe
    ) || error.raw_os_error() == Some(libc::EIO)
}
