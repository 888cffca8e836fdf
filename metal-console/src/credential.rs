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

//! The BMC credential handed from the gateway to the agent, as a single environment variable on
//! the inner SSH session.
//!
//! Wire format (private to the two ends of the inner hop): base64 of a version byte followed by
//! the address, username and secret, each as a big-endian u32 length and that many bytes of UTF-8.

use base64::prelude::*;
use std::fmt;
use std::future::Future;
use std::time::Duration;

const FORMAT_VERSION: u8 = 1;

/// Out-of-band management access to one machine's BMC.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    /// `host:port` of the BMC (or, for hypervisor consoles, the domain name)
    pub address: String,
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CredentialError {
    #[error("no credential was handed off within {attempts} attempts")]
    Missing { attempts: u32 },
    #[error("malformed credential: {0}")]
    Malformed(&'static str),
    #[error("credential field {field} is too long to encode ({len} bytes)")]
    FieldTooLong { field: &'static str, len: usize },
}

impl CredentialRecord {
    pub fn encode(&self) -> Result<String, CredentialError> {
        let fields = [
            ("address", &self.address),
            ("username", &self.username),
            ("secret", &self.secret),
        ];
        let mut buf =
            Vec::with_capacity(1 + fields.iter().map(|(_, f)| 4 + f.len()).sum::<usize>());
        buf.push(FORMAT_VERSION);
        for (name, field) in fields {
            buf.extend_from_slice(&length_prefix(name, field.len())?);
            buf.extend_from_slice(field.as_bytes());
        }
        Ok(BASE64_STANDARD.encode(buf))
    }

    /// Decode a token produced by [`CredentialRecord::encode`]. Anything that isn't exactly that
    /// is an error: there is no such thing as a partially decoded credential.
    pub fn decode(token: &str) -> Result<Self, CredentialError> {
        let buf = BASE64_STANDARD
            .decode(token.trim())
            .map_err(|_| CredentialError::Malformed("not valid base64"))?;
        let (version, mut rest) = buf
            .split_first()
            .ok_or(CredentialError::Malformed("empty"))?;
        if *version != FORMAT_VERSION {
            return Err(CredentialError::Malformed("unknown format version"));
        }

        let mut next_field = || -> Result<String, CredentialError> {
            let (len, tail) = rest
                .split_first_chunk::<4>()
                .ok_or(CredentialError::Malformed("truncated length"))?;
            let len = u32::from_be_bytes(*len) as usize;
            if tail.len() < len {
                return Err(CredentialError::Malformed("truncated field"));
            }
            let (field, tail) = tail.split_at(len);
            rest = tail;
            String::from_utf8(field.to_vec()).map_err(|_| CredentialError::Malformed("not utf-8"))
        };

        let record = Self {
            address: next_field()?,
            username: next_field()?,
            secret: next_field()?,
        };
        if !rest.is_empty() {
            return Err(CredentialError::Malformed("trailing data"));
        }
        Ok(record)
    }
}

fn length_prefix(field: &'static str, len: usize) -> Result<[u8; 4], CredentialError> {
    u32::try_from(len)
        .map(u32::to_be_bytes)
        .map_err(|_| CredentialError::FieldTooLong { field, len })
}

/// Look for the handed-off credential up to `attempts` times, sleeping `interval` between
/// attempts. The environment of the inner session can arrive after the session itself, so the
/// first lookup may well come up empty.
///
/// A token that is present but malformed is returned as an error right away, it will not get any
/// better by waiting.
pub async fn poll_for_credential<F, Fut>(
    attempts: u32,
    interval: Duration,
    mut lookup: F,
) -> Result<CredentialRecord, CredentialError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<String>>,
{
    for attempt in 1..=attempts {
        if let Some(token) = lookup().await.filter(|token| !token.is_empty()) {
            return CredentialRecord::decode(&token);
        }
        if attempt < attempts {
            tracing::debug!(attempt, "credential not handed off yet, waiting");
            tokio::time::sleep(interval).await;
        }
    }
    Err(CredentialError::Missing { attempts })
}
