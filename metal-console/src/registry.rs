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

//! Bookkeeping of which allocation each machine's live console sessions were authorized against.
//!
//! The newest owner authorization for a machine wins: when a session's revalidation monitor finds
//! a different fingerprint recorded here than the one its session was admitted with, the machine
//! has since been handed to someone else. An entry lives exactly as long as at least one session
//! for the machine holds an [`AllocationGuard`] for it.

use crate::directory::AllocationFingerprint;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug)]
struct Slot {
    fingerprint: AllocationFingerprint,
    sessions: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AllocationRegistry {
    slots: Arc<DashMap<String, Slot>>,
}

impl AllocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a session for `machine_id` was authorized against `fingerprint`. A later
    /// registration for the same machine replaces the recorded fingerprint (the directory is the
    /// authority, and the newest authorization saw it most recently), but the entry stays until
    /// every guard for the machine is dropped.
    pub fn register(&self, machine_id: &str, fingerprint: AllocationFingerprint) -> AllocationGuard {
        self.slots
            .entry(machine_id.to_string())
            .and_modify(|slot| {
                slot.sessions += 1;
                if slot.fingerprint != fingerprint {
                    tracing::debug!(machine_id, %fingerprint, "replacing registered allocation");
                    slot.fingerprint = fingerprint.clone();
                }
            })
            .or_insert_with(|| Slot {
                fingerprint,
                sessions: 1,
            });

        AllocationGuard {
            registry: self.clone(),
            machine_id: machine_id.to_string(),
        }
    }

    pub fn get(&self, machine_id: &str) -> Option<AllocationFingerprint> {
        self.slots
            .get(machine_id)
            .map(|slot| slot.fingerprint.clone())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn release(&self, machine_id: &str) {
        // remove_if holds the shard lock, so a concurrent register can't sneak in between the
        // decrement and the removal.
        self.slots.remove_if_mut(machine_id, |_, slot| {
            slot.sessions = slot.sessions.saturating_sub(1);
            slot.sessions == 0
        });
    }
}

/// Keeps a machine's registry entry alive. Cloning counts as another session.
#[derive(Debug)]
pub struct AllocationGuard {
    registry: AllocationRegistry,
    machine_id: String,
}

impl Clone for AllocationGuard {
    fn clone(&self) -> Self {
        if let Some(mut slot) = self.registry.slots.get_mut(&self.machine_id) {
            slot.sessions += 1;
        }
        Self {
            registry: self.registry.clone(),
            machine_id: self.machine_id.clone(),
        }
    }
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        self.registry.release(&self.machine_id);
    }
}
