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

//! The machine directory: where machines, their allocations, their BMC credentials, and the
//! identity behind a bearer token are looked up.

#[cfg(test)]
pub(crate) mod fake;
mod metal_api;

use crate::credential::CredentialRecord;
pub use metal_api::{HmacAuth, MetalApiDirectory};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Narrow query interface to the machine directory. Implementations must not retry on their own:
/// errors are propagated to the caller as they come.
#[async_trait::async_trait]
pub trait MachineDirectory: fmt::Debug + Send + Sync {
    async fn find_machine(&self, machine_id: &str) -> Result<MachineRecord, DirectoryError>;

    async fn find_management_credential(
        &self,
        machine_id: &str,
    ) -> Result<CredentialRecord, DirectoryError>;

    async fn resolve_identity(&self, bearer_token: &str) -> Result<Identity, DirectoryError>;
}

/// A snapshot of a machine as the directory knows it. Every fetch is fresh: nothing here should be
/// cached beyond a single session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub id: String,
    #[serde(default)]
    pub partition: Option<Partition>,
    #[serde(default)]
    pub allocation: Option<Allocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "mgmtserviceaddress", default)]
    pub management_service_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Creation timestamp of the allocation, kept verbatim. A new allocation of the same machine
    /// always gets a new timestamp, so this doubles as the allocation's fingerprint.
    pub created: String,
    #[serde(default)]
    pub role: Option<AllocationRole>,
    #[serde(rename = "ssh_pub_keys", default)]
    pub ssh_public_keys: Vec<String>,
    #[serde(default)]
    pub networks: Vec<MachineNetwork>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationRole {
    Firewall,
    Machine,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineNetwork {
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub ips: Vec<String>,
}

/// The allocation a session was authorized against, used to notice reallocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AllocationFingerprint(pub String);

impl fmt::Display for AllocationFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("machine {0} is not allocated")]
    NotAllocated(String),
    #[error("failed to detect private IP of machine:{0}")]
    NoPrivateAddress(String),
    #[error("machine {0} has no partition management service address")]
    NoManagementAddress(String),
}

impl MachineRecord {
    /// Firewalls and unallocated machines have no owner whose keys could be checked, so only
    /// administrators may open their consoles.
    pub fn is_privileged(&self) -> bool {
        match &self.allocation {
            None => true,
            Some(allocation) => allocation.role == Some(AllocationRole::Firewall),
        }
    }

    pub fn allocation_fingerprint(&self) -> Option<AllocationFingerprint> {
        self.allocation
            .as_ref()
            .map(|allocation| AllocationFingerprint(allocation.created.clone()))
    }

    /// The first IP of the first private network of the allocation.
    pub fn primary_private_address(&self) -> Result<&str, RecordError> {
        self.allocation
            .as_ref()
            .ok_or_else(|| RecordError::NotAllocated(self.id.clone()))?
            .networks
            .iter()
            .filter(|network| network.private)
            .find_map(|network| network.ips.first())
            .map(String::as_str)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| RecordError::NoPrivateAddress(self.id.clone()))
    }

    pub fn management_service_address(&self) -> Result<&str, RecordError> {
        self.partition
            .as_ref()
            .and_then(|partition| partition.management_service_address.as_deref())
            .filter(|address| !address.is_empty())
            .ok_or_else(|| RecordError::NoManagementAddress(self.id.clone()))
    }
}

/// Who a bearer token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Identity {
    pub fn is_member_of(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DirectoryError {
    #[error("no machine found with ID {0:?}")]
    NotFound(String),
    #[error("{count} machines found with ID {machine_id:?}")]
    Ambiguous { count: usize, machine_id: String },
    #[error("no management credentials known for machine {0:?}")]
    NoCredential(String),
    #[error("bearer token was rejected by the directory")]
    InvalidToken,
    #[error("directory returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("error talking to the directory: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("could not decode directory response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(allocation: serde_json::Value) -> MachineRecord {
        serde_json::from_value(serde_json::json!({
            "id": "m1",
            "partition": {"id": "fra-equ01", "mgmtserviceaddress": "mgmt.fra-equ01:5222"},
            "allocation": allocation,
        }))
        .expect("record didn't parse")
    }

    #[test]
    fn test_privileged_machines() {
        assert!(record(serde_json::Value::Null).is_privileged());
        assert!(
            record(serde_json::json!({"created": "2024-01-01T00:00:00Z", "role": "firewall"}))
                .is_privileged()
        );
        assert!(
            !record(serde_json::json!({"created": "2024-01-01T00:00:00Z", "role": "machine"}))
                .is_privileged()
        );
        // A role we don't know about is still an owned machine
        assert!(
            !record(serde_json::json!({"created": "2024-01-01T00:00:00Z", "role": "storage"}))
                .is_privileged()
        );
    }

    #[test]
    fn test_primary_private_address() {
        let m = record(serde_json::json!({
            "created": "2024-01-01T00:00:00Z",
            "networks": [
                {"private": false, "ips": ["212.34.83.5"]},
                {"private": true, "ips": []},
                {"private": true, "ips": ["10.0.0.7", "10.0.0.8"]},
            ],
        }));
        assert_eq!(m.primary_private_address(), Ok("10.0.0.7"));

        let m = record(serde_json::json!({
            "created": "2024-01-01T00:00:00Z",
            "networks": [{"private": false, "ips": ["212.34.83.5"]}],
        }));
        assert_eq!(
            m.primary_private_address(),
            Err(RecordError::NoPrivateAddress("m1".to_string()))
        );

        assert_eq!(
            record(serde_json::Value::Null).primary_private_address(),
            Err(RecordError::NotAllocated("m1".to_string()))
        );
    }

    #[test]
    fn test_management_service_address() {
        let m = record(serde_json::Value::Null);
        assert_eq!(m.management_service_address(), Ok("mgmt.fra-equ01:5222"));
        let m = MachineRecord {
            id: "m2".to_string(),
            partition: None,
            allocation: None,
        };
        assert_eq!(
            m.management_service_address(),
            Err(RecordError::NoManagementAddress("m2".to_string()))
        );
    }

    #[test]
    fn test_identity_membership() {
        let identity = Identity {
            name: "achim".to_string(),
            groups: vec!["k8s-all".to_string(), "metal-admins".to_string()],
        };
        assert!(identity.is_member_of("metal-admins"));
        assert!(!identity.is_member_of("metal-admin"));
    }
}
