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

use russh::server::run_stream;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Run one SSH connection to completion over `stream`, logging how it ended.
///
/// Failures here are all from russh, but the error type is Handler::Error, which is *our* error
/// type. So we go through the RusshOrEyreError hoops to track down what the actual error was, and
/// avoid logging scary looking errors for plain disconnects.
pub async fn serve<H, S>(russh_config: Arc<russh::server::Config>, stream: S, handler: H)
where
    H: russh::server::Handler<Error = RusshOrEyreError> + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let session = match run_stream(russh_config, stream, handler).await {
        Ok(s) => s,
        Err(RusshOrEyreError::Russh(russh::Error::Disconnect)) => {
            tracing::debug!("client disconnected");
            return;
        }
        Err(RusshOrEyreError::Russh(russh::Error::ConnectionTimeout)) => {
            tracing::debug!("client connection timeout");
            return;
        }
        Err(RusshOrEyreError::Eyre(error)) => {
            tracing::warn!(?error, "Connection setup failed");
            return;
        }
        Err(RusshOrEyreError::Russh(error)) => {
            tracing::warn!(?error, "Connection setup failed with internal russh error");
            return;
        }
    };

    match session.await {
        Ok(_) => tracing::debug!("Connection closed"),
        Err(RusshOrEyreError::Russh(russh::Error::IO(io_error))) => match io_error.kind() {
            io::ErrorKind::UnexpectedEof => {
                tracing::debug!("eof from client");
            }
            error => {
                tracing::warn!(?error, "Connection closed with error");
            }
        },
        Err(RusshOrEyreError::Russh(russh::Error::Disconnect)) => {
            tracing::debug!("client disconnected");
        }
        Err(error) => {
            tracing::warn!(?error, "Connection closed with error");
        }
    }
}

/// The error type used by the connection handlers, so that we can distinguish between Russh errors
/// and our errors.
#[derive(Debug)]
pub enum RusshOrEyreError {
    Russh(russh::Error),
    Eyre(eyre::Error),
}

impl fmt::Display for RusshOrEyreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RusshOrEyreError::Russh(e) => fmt::Display::fmt(e, f),
            RusshOrEyreError::Eyre(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for RusshOrEyreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RusshOrEyreError::Russh(e) => e.source(),
            RusshOrEyreError::Eyre(e) => e.source(),
        }
    }
}

impl From<eyre::Error> for RusshOrEyreError {
    fn from(value: eyre::Error) -> Self {
        RusshOrEyreError::Eyre(value)
    }
}

impl From<russh::Error> for RusshOrEyreError {
    fn from(value: russh::Error) -> Self {
        RusshOrEyreError::Russh(value)
    }
}

/// A peer address for logging, with a placeholder if we didn't get one at connection time.
pub fn peer_addr_string(addr: Option<std::net::SocketAddr>) -> String {
    addr.map(|addr| addr.to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}
