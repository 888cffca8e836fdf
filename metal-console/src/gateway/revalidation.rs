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

//! Periodic check that an owner's console session is still for the allocation it was authorized
//! against. The machine can be freed or handed to someone else while a console is open, and the
//! previous owner must not keep watching.

use crate::ShutdownHandle;
use crate::directory::{AllocationFingerprint, MachineDirectory};
use crate::registry::AllocationRegistry;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    AllocationUnknown,
    NotAllocated,
    AllocationChanged {
        authorized: AllocationFingerprint,
        current: AllocationFingerprint,
    },
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TerminationReason::AllocationUnknown => {
                "machine allocation not known, terminating console session"
            }
            TerminationReason::NotAllocated => {
                "machine is not allocated anymore, terminating console session"
            }
            TerminationReason::AllocationChanged { .. } => {
                "machine allocation changed, terminating console session"
            }
        })
    }
}

impl TerminationReason {
    pub fn metric_label(&self) -> &'static str {
        match self {
            TerminationReason::AllocationUnknown => "allocation_unknown",
            TerminationReason::NotAllocated => "not_allocated",
            TerminationReason::AllocationChanged { .. } => "allocation_changed",
        }
    }
}

pub struct MonitorHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<Option<TerminationReason>>,
}

impl MonitorHandle {
    /// Resolves when the monitor decides the session must end. Never resolves if it doesn't.
    pub async fn terminated(&mut self) -> TerminationReason {
        match (&mut self.join_handle).await {
            Ok(Some(reason)) => reason,
            Ok(None) => std::future::pending().await,
            Err(error) => {
                tracing::error!(%error, "revalidation monitor failed");
                std::future::pending().await
            }
        }
    }
}

impl ShutdownHandle<Option<TerminationReason>> for MonitorHandle {
    fn into_parts(self) -> (oneshot::Sender<()>, JoinHandle<Option<TerminationReason>>) {
        (self.shutdown_tx, self.join_handle)
    }
}

/// Start monitoring `machine_id`, authorized against `fingerprint`, every `interval`. The first
/// check happens one interval from now.
pub fn spawn(
    machine_id: String,
    fingerprint: AllocationFingerprint,
    registry: AllocationRegistry,
    directory: Arc<dyn MachineDirectory>,
    interval: Duration,
) -> MonitorHandle {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join_handle = tokio::spawn(async move {
        run(
            &machine_id,
            &fingerprint,
            &registry,
            directory.as_ref(),
            interval,
            shutdown_rx,
        )
        .await
    });
    MonitorHandle {
        shutdown_tx,
        join_handle,
    }
}

/// Returns the reason to terminate, or None if `shutdown` fired (or was dropped) first.
pub async fn run(
    machine_id: &str,
    fingerprint: &AllocationFingerprint,
    registry: &AllocationRegistry,
    directory: &dyn MachineDirectory,
    interval: Duration,
    mut shutdown: oneshot::Receiver<()>,
) -> Option<TerminationReason> {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        match registry.get(machine_id) {
            None => {
                tracing::info!(machine_id, "machine allocation not known, terminating session");
                return Some(TerminationReason::AllocationUnknown);
            }
            // A newer owner session was admitted against another allocation
            Some(registered) if &registered != fingerprint => {
                tracing::info!(
                    machine_id,
                    authorized = %fingerprint,
                    %registered,
                    "machine was reallocated and opened by its new owner, terminating session"
                );
                return Some(TerminationReason::AllocationChanged {
                    authorized: fingerprint.clone(),
                    current: registered,
                });
            }
            Some(_) => {}
        }

        tokio::select! {
            _ = &mut shutdown => {
                tracing::debug!(machine_id, "revalidation monitor shutting down");
                return None;
            }
            _ = ticker.tick() => {}
        }

        tracing::debug!(machine_id, "checking if machine is still owned by the same user");
        let machine = match directory.find_machine(machine_id).await {
            Ok(machine) => machine,
            Err(error) => {
                tracing::error!(machine_id, %error, "unable to load machine, will retry");
                continue;
            }
        };
        let Some(current) = machine.allocation_fingerprint() else {
            tracing::info!(machine_id, "machine is not allocated anymore, terminating session");
            return Some(TerminationReason::NotAllocated);
        };
        if &current != fingerprint {
            tracing::info!(
                machine_id,
                authorized = %fingerprint,
                %current,
                "machine allocation changed, terminating session"
            );
            return Some(TerminationReason::AllocationChanged {
                authorized: fingerprint.clone(),
                current,
            });
        }
    }
}
