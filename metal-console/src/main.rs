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

use clap::{Parser, Subcommand, ValueEnum};
use metal_console::ShutdownHandle;
use metal_console::config::{AgentConfig, GatewayConfig};
use metal_console::metrics::MetricsState;
use metal_console::{agent, gateway, metrics_service};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = env!("CARGO_BIN_NAME"), about, version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the caller-facing console gateway
    Gateway {
        #[arg(short, long, help = "Path to the gateway config file")]
        config: Option<PathBuf>,
    },
    /// Run the console agent on the management network
    Agent {
        #[arg(short, long, help = "Path to the agent config file")]
        config: Option<PathBuf>,
    },
    /// Print an annotated config file with all the default values
    Defaults {
        #[arg(value_enum)]
        server: Server,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Server {
    Gateway,
    Agent,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt::Layer::default().compact())
        .with(env_filter)
        .init();

    match Args::parse().command {
        Command::Defaults { server } => {
            match server {
                Server::Gateway => print!(
                    "{}",
                    GatewayConfig::default().into_annotated_config_file()
                ),
                Server::Agent => print!("{}", AgentConfig::default().into_annotated_config_file()),
            }
            Ok(())
        }
        Command::Gateway { config } => {
            let config = match config {
                Some(path) => GatewayConfig::load(&path)?,
                None => GatewayConfig::default(),
            };
            let metrics_address = config.metrics_address;
            let metrics_state = Arc::new(MetricsState::new("metal-console-gateway"));
            let handle = gateway::spawn(config, &metrics_state.meter).await?;
            run_until_ctrl_c(handle, metrics_address, metrics_state).await
        }
        Command::Agent { config } => {
            let config = match config {
                Some(path) => AgentConfig::load(&path)?,
                None => AgentConfig::default(),
            };
            let metrics_address = config.metrics_address;
            let metrics_state = Arc::new(MetricsState::new("metal-console-agent"));
            let handle = agent::spawn(config, &metrics_state.meter).await?;
            run_until_ctrl_c(handle, metrics_address, metrics_state).await
        }
    }
}

async fn run_until_ctrl_c<H>(
    handle: H,
    metrics_address: SocketAddr,
    metrics_state: Arc<MetricsState>,
) -> eyre::Result<()>
where
    H: ShutdownHandle<()> + Send,
{
    let metrics_handle = metrics_service::spawn(metrics_address, metrics_state).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    handle.shutdown_and_wait().await;
    metrics_handle.shutdown_and_wait().await;
    Ok(())
}
