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

//! Who may open which machine's console.
//!
//! Ordinary allocated machines are opened by their owner, identified by one of the public keys
//! registered with the allocation. Firewalls and unallocated machines have no owner to speak of,
//! and are only opened by members of the configured administrator group, identified by a bearer
//! token. That token arrives either as the SSH password or, for public key logins, in the
//! caller's `LC_METAL_STACK_OIDC_TOKEN` environment variable once the session starts.

use crate::directory::{AllocationFingerprint, DirectoryError, MachineDirectory, RecordError};
use crate::gateway::GatewayMode;
use crate::registry::{AllocationGuard, AllocationRegistry};
use russh::keys::PublicKey;
use std::fmt;
use std::sync::Arc;

pub enum AuthorizationDecision {
    Admitted(AdmissionClass),
    Rejected(Rejection),
    /// The machine may only be opened by an administrator, and the token to prove it can only be
    /// read from the caller's environment at session start.
    AdminTokenRequired,
}

#[derive(Clone)]
pub enum AdmissionClass {
    Owner(OwnerAdmission),
    /// Administrator sessions aren't tied to an allocation and are never revalidated.
    Admin,
}

/// An owner session, and the allocation it was authorized against. The allocation stays registered
/// for as long as this (or a clone of its guard) lives.
#[derive(Clone)]
pub struct OwnerAdmission {
    pub fingerprint: AllocationFingerprint,
    /// Where the machine's console lives, for the session's logs
    pub console_address: String,
    pub guard: AllocationGuard,
}

#[derive(thiserror::Error, Debug)]
pub enum Rejection {
    #[error("offered public key is not registered for the machine")]
    NoMatchingKey,
    #[error("error looking up machine: {0}")]
    Lookup(#[from] DirectoryError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("error loading registered keys: {0:#}")]
    KeySource(eyre::Report),
    #[error(transparent)]
    Admin(#[from] AdminRejection),
}

impl Rejection {
    /// What the caller gets to see. Only administrator rejections are explained: an owner
    /// rejection never reveals anything about the registered keys.
    pub fn caller_message(&self) -> Option<String> {
        match self {
            Rejection::Admin(reason) => Some(reason.to_string()),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AdminRejection {
    #[error(
        "unable to find OIDC token stored in LC_METAL_STACK_OIDC_TOKEN env variable which is required for machine console access"
    )]
    MissingToken,
    #[error("given oidc token is invalid")]
    InvalidToken,
    #[error("you are not member of required admin group:{0} to access this machine console")]
    NotInAdminGroup(String),
}

#[derive(Clone)]
pub struct Authorizer {
    directory: Arc<dyn MachineDirectory>,
    registry: AllocationRegistry,
    mode: Arc<GatewayMode>,
    admin_group_name: String,
}

impl fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorizer")
            .field("mode", &self.mode)
            .field("admin_group_name", &self.admin_group_name)
            .finish()
    }
}

impl Authorizer {
    pub fn new(
        directory: Arc<dyn MachineDirectory>,
        registry: AllocationRegistry,
        mode: Arc<GatewayMode>,
        admin_group_name: String,
    ) -> Self {
        Self {
            directory,
            registry,
            mode,
            admin_group_name,
        }
    }

    /// Public key authentication. Privileged machines never look at the offered key: they need an
    /// administrator token, which is checked once the session starts.
    pub async fn authorize_public_key(
        &self,
        machine_id: &str,
        public_key: &PublicKey,
    ) -> AuthorizationDecision {
        let machine = match self.directory.find_machine(machine_id).await {
            Ok(machine) => machine,
            Err(error) => return AuthorizationDecision::Rejected(error.into()),
        };
        if machine.is_privileged() {
            tracing::debug!(machine_id, "machine requires an administrator token");
            return AuthorizationDecision::AdminTokenRequired;
        }

        let registered_keys = match self.mode.registered_keys(&machine).await {
            Ok(keys) => keys,
            Err(error) => return AuthorizationDecision::Rejected(Rejection::KeySource(error)),
        };
        if !key_is_registered(machine_id, public_key, &registered_keys) {
            return AuthorizationDecision::Rejected(Rejection::NoMatchingKey);
        }

        let Some(fingerprint) = machine.allocation_fingerprint() else {
            return AuthorizationDecision::Rejected(
                RecordError::NotAllocated(machine_id.to_string()).into(),
            );
        };
        let console_address = match self.mode.console_address(&machine) {
            Ok(address) => address,
            Err(error) => return AuthorizationDecision::Rejected(error.into()),
        };

        let guard = self.registry.register(machine_id, fingerprint.clone());
        tracing::info!(machine_id, %fingerprint, "owner public key accepted");
        AuthorizationDecision::Admitted(AdmissionClass::Owner(OwnerAdmission {
            fingerprint,
            console_address,
            guard,
        }))
    }

    /// Password authentication: the password is the administrator's bearer token.
    pub async fn authorize_password(&self, machine_id: &str, token: &str) -> AuthorizationDecision {
        self.authorize_admin_token(machine_id, Some(token)).await
    }

    /// Resolve an [`AuthorizationDecision::AdminTokenRequired`] with the token from the caller's
    /// environment, if any.
    pub async fn authorize_admin_token(
        &self,
        machine_id: &str,
        token: Option<&str>,
    ) -> AuthorizationDecision {
        match self.check_admin(machine_id, token.unwrap_or_default()).await {
            Ok(()) => AuthorizationDecision::Admitted(AdmissionClass::Admin),
            Err(reason) => AuthorizationDecision::Rejected(reason.into()),
        }
    }

    async fn check_admin(&self, machine_id: &str, token: &str) -> Result<(), AdminRejection> {
        if token.is_empty() {
            return Err(AdminRejection::MissingToken);
        }

        let identity = self
            .directory
            .resolve_identity(token)
            .await
            .map_err(|error| {
                tracing::warn!(machine_id, %error, "failed to fetch user details from token");
                AdminRejection::InvalidToken
            })?;

        if !identity.is_member_of(&self.admin_group_name) {
            tracing::warn!(
                machine_id,
                user = %identity.name,
                "user is not a member of the admin group"
            );
            return Err(AdminRejection::NotInAdminGroup(
                self.admin_group_name.clone(),
            ));
        }

        tracing::info!(machine_id, user = %identity.name, "administrator admitted");
        Ok(())
    }
}

/// Compare by algorithm and key material only: comments in authorized_keys lines don't matter.
/// Registered keys that don't parse are skipped.
fn key_is_registered(machine_id: &str, offered: &PublicKey, registered_keys: &[String]) -> bool {
    registered_keys
        .iter()
        .filter_map(|line| match PublicKey::from_openssh(line.trim()) {
            Ok(key) => Some(key),
            Err(error) => {
                tracing::warn!(machine_id, %error, "skipping unparsable registered public key");
                None
            }
        })
        .any(|registered| registered.key_data() == offered.key_data())
}
