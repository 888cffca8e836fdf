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

use crate::config::GatewayConfig;
use crate::credential::CredentialRecord;
use crate::directory::{DirectoryError, MachineDirectory, MachineRecord, RecordError};
use eyre::Context;
use std::path::PathBuf;

static DEVELOPMENT_BMC_USER: &str = "ADMIN";
static DEVELOPMENT_BMC_PASSWORD: &str = "ADMIN";

/// Where owner keys, inner hop addresses, and BMC credentials come from. Chosen once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayMode {
    /// Keys and credentials from the directory, inner hops to the partition's management service
    Production,
    /// Every machine accepts the same operator key, inner hops go to a fixed reverse proxy, and
    /// the BMC credential is a fixed test value addressed by the machine ID.
    Development {
        public_key_path: PathBuf,
        bmc_reverse_proxy_address: String,
    },
}

impl GatewayMode {
    pub fn from_config(config: &GatewayConfig) -> Self {
        match &config.development {
            Some(development) => Self::Development {
                public_key_path: development.public_key_path.clone(),
                bmc_reverse_proxy_address: development.bmc_reverse_proxy_address.clone(),
            },
            None => Self::Production,
        }
    }

    /// The owner's public keys for `machine`, one authorized_keys line each.
    pub async fn registered_keys(&self, machine: &MachineRecord) -> eyre::Result<Vec<String>> {
        match self {
            Self::Production => Ok(machine
                .allocation
                .as_ref()
                .map(|allocation| allocation.ssh_public_keys.clone())
                .unwrap_or_default()),
            Self::Development {
                public_key_path, ..
            } => {
                let contents = tokio::fs::read_to_string(public_key_path)
                    .await
                    .with_context(|| {
                        format!(
                            "error reading development public key at {}",
                            public_key_path.display()
                        )
                    })?;
                Ok(contents
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(ToOwned::to_owned)
                    .collect())
            }
        }
    }

    /// The console address of an owner session: the machine's primary private address, or in
    /// development mode the machine ID itself (which is what the hypervisor names the machine's
    /// domain).
    pub fn console_address(&self, machine: &MachineRecord) -> Result<String, RecordError> {
        match self {
            Self::Production => machine.primary_private_address().map(ToOwned::to_owned),
            Self::Development { .. } => Ok(machine.id.clone()),
        }
    }

    /// Where to dial the inner hop for `machine`.
    pub fn inner_hop_address(&self, machine: &MachineRecord) -> Result<String, RecordError> {
        match self {
            Self::Production => machine.management_service_address().map(ToOwned::to_owned),
            Self::Development {
                bmc_reverse_proxy_address,
                ..
            } => Ok(bmc_reverse_proxy_address.clone()),
        }
    }

    pub async fn management_credential(
        &self,
        directory: &dyn MachineDirectory,
        machine: &MachineRecord,
    ) -> Result<CredentialRecord, DirectoryError> {
        match self {
            Self::Production => directory.find_management_credential(&machine.id).await,
            Self::Development { .. } => Ok(CredentialRecord {
                address: machine.id.clone(),
                username: DEVELOPMENT_BMC_USER.to_string(),
                secret: DEVELOPMENT_BMC_PASSWORD.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DevelopmentConfig;
    use crate::directory::fake::FakeDirectory;

    fn machine() -> MachineRecord {
        serde_json::from_value(serde_json::json!({
            "id": "m1",
            "partition": {"id": "fra-equ01", "mgmtserviceaddress": "mgmt.fra-equ01:5222"},
            "allocation": {
                "created": "2024-01-01T00:00:00Z",
                "role": "machine",
                "ssh_pub_keys": ["ssh-ed25519 AAAA owner"],
                "networks": [{"private": true, "ips": ["10.0.0.7"]}],
            },
        }))
        .expect("record didn't parse")
    }

    #[tokio::test]
    async fn test_production_mode() {
        let mode = GatewayMode::from_config(&GatewayConfig::default());
        assert_eq!(mode, GatewayMode::Production);
        let m = machine();
        assert_eq!(
            mode.registered_keys(&m).await.unwrap(),
            vec!["ssh-ed25519 AAAA owner".to_string()]
        );
        assert_eq!(mode.console_address(&m).unwrap(), "10.0.0.7");
        assert_eq!(mode.inner_hop_address(&m).unwrap(), "mgmt.fra-equ01:5222");

        let directory = FakeDirectory::default();
        directory.set_credential(
            "m1",
            CredentialRecord {
                address: "10.1.0.7:623".to_string(),
                username: "root".to_string(),
                secret: "calvin".to_string(),
            },
        );
        assert_eq!(
            mode.management_credential(&directory, &m)
                .await
                .unwrap()
                .address,
            "10.1.0.7:623"
        );
    }

    #[tokio::test]
    async fn test_development_mode() {
        let dir = temp_dir::TempDir::new().unwrap();
        let key_path = dir.child("dev.pub");
        std::fs::write(&key_path, "# dev key\nssh-ed25519 AAAA dev\n\n").unwrap();

        let mode = GatewayMode::from_config(&GatewayConfig {
            development: Some(DevelopmentConfig {
                public_key_path: key_path,
                bmc_reverse_proxy_address: "127.0.0.1:3333".to_string(),
            }),
            ..Default::default()
        });
        let m = machine();
        assert_eq!(
            mode.registered_keys(&m).await.unwrap(),
            vec!["ssh-ed25519 AAAA dev".to_string()]
        );
        assert_eq!(mode.console_address(&m).unwrap(), "m1");
        assert_eq!(mode.inner_hop_address(&m).unwrap(), "127.0.0.1:3333");
        // Never asks the directory
        let credential = mode
            .management_credential(&FakeDirectory::default(), &m)
            .await
            .unwrap();
        assert_eq!(credential.address, "m1");
        assert_eq!(credential.username, "ADMIN");
        assert_eq!(credential.secret, "ADMIN");
    }
}
