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

use std::fmt;

/// A `host:port` pair, where the host may be a bracketed IPv6 literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    /// Without brackets
    pub host: String,
    pub port: u16,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("empty address")]
    Empty,
    #[error("address {0:?} has no port")]
    MissingPort(String),
    #[error("invalid port in address {0:?}")]
    InvalidPort(String),
    #[error("unterminated IPv6 literal in address {0:?}")]
    UnterminatedBracket(String),
}

impl HostPort {
    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`. A bare IPv6 literal (more than one
    /// colon, no brackets) is taken as a host without a port. Without a port, `default_port` is
    /// used, or the address is rejected if there is none.
    pub fn parse(address: &str, default_port: Option<u16>) -> Result<Self, AddressParseError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(AddressParseError::Empty);
        }

        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| AddressParseError::UnterminatedBracket(address.to_string()))?;
            match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if after.is_empty() => (host, None),
                None => return Err(AddressParseError::InvalidPort(address.to_string())),
            }
        } else if address.matches(':').count() > 1 {
            (address, None)
        } else {
            match address.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (address, None),
            }
        };

        if host.is_empty() {
            return Err(AddressParseError::Empty);
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| AddressParseError::InvalidPort(address.to_string()))?,
            None => default_port.ok_or_else(|| AddressParseError::MissingPort(address.to_string()))?,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}
