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

//! How the agent attaches to a machine's console, given the handed-off credential.

use crate::address::{AddressParseError, HostPort};
use crate::config::{AgentConfig, ConsoleBackendKind};
use crate::credential::CredentialRecord;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Port of the RMCP+ (IPMI over LAN) service when the BMC address doesn't name one
const IPMI_DEFAULT_PORT: u16 = 623;

pub trait ConsoleBackend: fmt::Debug + Send + Sync {
    /// Shown to the caller before attaching, telling them how to leave the console.
    fn exit_hint(&self) -> &'static str;

    fn command(&self, credential: &CredentialRecord) -> Result<ConsoleCommand, ConsoleError>;
}

pub fn from_config(config: &AgentConfig) -> Arc<dyn ConsoleBackend> {
    match config.backend {
        ConsoleBackendKind::Hypervisor => Arc::new(HypervisorConsole {
            virsh_path: config.virsh_path.clone(),
        }),
        ConsoleBackendKind::Ipmi => Arc::new(IpmiSol {
            ipmitool_path: config.ipmitool_path.clone(),
            insecure_ciphers: config.insecure_ipmi_ciphers,
        }),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConsoleError {
    #[error("invalid BMC address: {0}")]
    InvalidAddress(#[from] AddressParseError),
    #[error("error allocating a PTY: {0:#}")]
    Pty(eyre::Report),
    #[error("error spawning {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// A console process to run. The arguments can contain the BMC password, so they are left out of
/// the Debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct ConsoleCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl fmt::Debug for ConsoleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleCommand")
            .field("program", &self.program)
            .field("args", &format_args!("<{} args>", self.args.len()))
            .finish()
    }
}

/// `virsh console` against a libvirt domain named like the machine, for development setups where
/// machines are VMs.
#[derive(Debug)]
pub struct HypervisorConsole {
    pub virsh_path: PathBuf,
}

impl ConsoleBackend for HypervisorConsole {
    fn exit_hint(&self) -> &'static str {
        "Exit with '<Ctrl> 5'"
    }

    fn command(&self, credential: &CredentialRecord) -> Result<ConsoleCommand, ConsoleError> {
        Ok(ConsoleCommand {
            program: self.virsh_path.clone(),
            args: vec![
                "console".to_string(),
                credential.address.clone(),
                "--force".to_string(),
            ],
        })
    }
}

/// Serial over LAN through `ipmitool`.
#[derive(Debug)]
pub struct IpmiSol {
    pub ipmitool_path: PathBuf,
    /// Use cipher suite 3 (SHA1), which is what ipmi_sim speaks
    pub insecure_ciphers: bool,
}

impl ConsoleBackend for IpmiSol {
    fn exit_hint(&self) -> &'static str {
        "Exit with '~.'"
    }

    fn command(&self, credential: &CredentialRecord) -> Result<ConsoleCommand, ConsoleError> {
        let bmc = HostPort::parse(&credential.address, Some(IPMI_DEFAULT_PORT))?;
        let mut args = vec![
            "-I".to_string(),
            "lanplus".to_string(),
            "-H".to_string(),
            bmc.host,
            "-p".to_string(),
            bmc.port.to_string(),
            "-U".to_string(),
            credential.username.clone(),
            "-P".to_string(),
            credential.secret.clone(),
        ];
        if self.insecure_ciphers {
            args.extend(["-C".to_string(), "3".to_string()]);
        }
        args.extend(["sol".to_string(), "activate".to_string()]);

        Ok(ConsoleCommand {
            program: self.ipmitool_path.clone(),
            args,
        })
    }
}
