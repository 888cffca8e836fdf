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

use opentelemetry::metrics::{Counter, Meter, MeterProvider, UpDownCounter};
use opentelemetry_sdk::metrics::SdkMeterProvider;

/// Prometheus registry with an opentelemetry meter feeding it, one per running service.
pub struct MetricsState {
    pub meter: Meter,
    pub registry: prometheus::Registry,
    _meter_provider: SdkMeterProvider,
}

impl MetricsState {
    pub fn new(scope: &'static str) -> Self {
        let registry = prometheus::Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .without_scope_info()
            .without_target_info()
            .build()
            .expect("BUG: could not build default metrics state");
        let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
        let meter = meter_provider.meter(scope);

        Self {
            meter,
            registry,
            _meter_provider: meter_provider,
        }
    }

    /// Render everything in the registry in the prometheus text format.
    pub fn encode(&self) -> Result<(String, Vec<u8>), prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

pub struct GatewayMetrics {
    pub clients: UpDownCounter<i64>,
    pub auth_failures: Counter<u64>,
    pub sessions: UpDownCounter<i64>,
    pub revalidation_terminations: Counter<u64>,
}

impl GatewayMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            clients: meter
                .i64_up_down_counter("metal_console_gateway_clients")
                .with_description("The number of SSH clients currently connected to the gateway")
                .build(),
            auth_failures: meter
                .u64_counter("metal_console_gateway_auth_failures")
                .with_description("The number of client authentication attempts denied")
                .build(),
            sessions: meter
                .i64_up_down_counter("metal_console_gateway_sessions")
                .with_description("The number of console sessions currently relayed to an agent")
                .build(),
            revalidation_terminations: meter
                .u64_counter("metal_console_gateway_revalidation_terminations")
                .with_description(
                    "The number of console sessions terminated because the machine's allocation changed",
                )
                .build(),
        }
    }
}

pub struct AgentMetrics {
    pub sessions: UpDownCounter<i64>,
    pub credential_failures: Counter<u64>,
}

impl AgentMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            sessions: meter
                .i64_up_down_counter("metal_console_agent_sessions")
                .with_description("The number of console processes currently attached")
                .build(),
            credential_failures: meter
                .u64_counter("metal_console_agent_credential_failures")
                .with_description(
                    "The number of sessions that never received a usable BMC credential",
                )
                .build(),
        }
    }
}
