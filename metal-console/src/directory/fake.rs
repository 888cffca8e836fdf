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

use super::{DirectoryError, Identity, MachineDirectory, MachineRecord};
use crate::credential::CredentialRecord;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// In-memory directory for unit tests. Everything it knows is set up by the test.
#[derive(Debug, Default)]
pub struct FakeDirectory {
    machines: Mutex<HashMap<String, MachineRecord>>,
    credentials: Mutex<HashMap<String, CredentialRecord>>,
    identities: Mutex<HashMap<String, Identity>>,
    failing: AtomicBool,
    machine_lookups: AtomicUsize,
}

impl FakeDirectory {
    pub fn set_machine(&self, machine: MachineRecord) {
        self.machines
            .lock()
            .unwrap()
            .insert(machine.id.clone(), machine);
    }

    pub fn set_credential(&self, machine_id: &str, credential: CredentialRecord) {
        self.credentials
            .lock()
            .unwrap()
            .insert(machine_id.to_string(), credential);
    }

    pub fn set_identity(&self, token: &str, identity: Identity) {
        self.identities
            .lock()
            .unwrap()
            .insert(token.to_string(), identity);
    }

    /// Make every lookup fail as if the directory were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn machine_lookups(&self) -> usize {
        self.machine_lookups.load(Ordering::SeqCst)
    }

    fn check_failing(&self) -> Result<(), DirectoryError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(DirectoryError::Status {
                status: 503,
                body: "directory unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl MachineDirectory for FakeDirectory {
    async fn find_machine(&self, machine_id: &str) -> Result<MachineRecord, DirectoryError> {
        self.machine_lookups.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        self.machines
            .lock()
            .unwrap()
            .get(machine_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(machine_id.to_string()))
    }

    async fn find_management_credential(
        &self,
        machine_id: &str,
    ) -> Result<CredentialRecord, DirectoryError> {
        self.check_failing()?;
        self.credentials
            .lock()
            .unwrap()
            .get(machine_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NoCredential(machine_id.to_string()))
    }

    async fn resolve_identity(&self, bearer_token: &str) -> Result<Identity, DirectoryError> {
        self.check_failing()?;
        self.identities
            .lock()
            .unwrap()
            .get(bearer_token)
            .cloned()
            .ok_or(DirectoryError::InvalidToken)
    }
}
