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

//! End-to-end tests: a real gateway and a real agent on localhost, a mock directory, and a fake
//! `virsh` standing in for the console.

use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

mod util;

use util::ssh_client::{Login, SessionOptions, login};
use util::{ADMIN_GROUP, GatewayOptions, TestEnvironment, fixture, silent_addr, unused_addr};

static OWNER_SSH_PUBKEY: &str = include_str!("fixtures/owner-key.pub");
static ALLOCATED_AT: &str = "2024-05-01T12:00:00Z";
static OIDC_ENV_VAR: &str = "LC_METAL_STACK_OIDC_TOKEN";

/// An environment with owned machine m1 and firewall fw1, an administrator holding "admin-token"
/// and an ordinary user holding "user-token".
async fn standard_environment(options: GatewayOptions) -> eyre::Result<TestEnvironment> {
    let env = TestEnvironment::start(options).await?;
    env.directory.add_owned_machine(
        "m1",
        ALLOCATED_AT,
        &[OWNER_SSH_PUBKEY.trim()],
        env.agent_addr,
    );
    env.directory
        .set_credential("m1", "m1-domain", "ADMIN", "ADMIN");
    env.directory.add_firewall("fw1", env.agent_addr);
    env.directory
        .set_credential("fw1", "fw1-domain", "ADMIN", "ADMIN");
    env.directory.add_user("admin-token", "achim", &[ADMIN_GROUP]);
    env.directory.add_user("user-token", "gerrit", &["metal-users"]);
    Ok(env)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_owner_console_session() -> eyre::Result<()> {
    let env = standard_environment(GatewayOptions::default()).await?;

    let client = login(env.gateway_addr, "m1", Login::PublicKey(&fixture("owner-key")))
        .await?
        .expect("owner key was rejected");
    let mut console = client.open_console(SessionOptions::default()).await?;
    console
        .expect_output("Connecting to console of \"m1\" (m1-domain)")
        .await?;
    console.expect_output("Exit with '<Ctrl> 5'").await?;
    console.expect_output("Connected to domain 'm1-domain'").await?;

    console.send("hello\n").await?;
    console.expect_output("console: hello").await?;
    console.send("exit\n").await?;
    assert_eq!(console.wait_for_exit().await?, Some(0));

    client.disconnect().await;
    env.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_window_size_follows_caller() -> eyre::Result<()> {
    let env = standard_environment(GatewayOptions::default()).await?;

    let client = login(env.gateway_addr, "m1", Login::PublicKey(&fixture("owner-key")))
        .await?
        .expect("owner key was rejected");
    let mut console = client.open_console(SessionOptions::default()).await?;
    console.expect_output("Connected to domain 'm1-domain'").await?;

    // The inner PTY starts at 80x40, the caller asked for 100x30
    console.send("size\n").await?;
    console.expect_output("size: 30 100").await?;

    console.resize(120, 50).await?;
    console.send("size\n").await?;
    console.expect_output("size: 50 120").await?;

    console.send("exit\n").await?;
    assert_eq!(console.wait_for_exit().await?, Some(0));

    client.disconnect().await;
    env.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_one_console_per_connection() -> eyre::Result<()> {
    let env = standard_environment(GatewayOptions::default()).await?;

    let client = login(env.gateway_addr, "m1", Login::PublicKey(&fixture("owner-key")))
        .await?
        .expect("owner key was rejected");
    let mut first = client.open_console(SessionOptions::default()).await?;
    first.expect_output("Connected to domain 'm1-domain'").await?;

    let mut second = client.open_console(SessionOptions::default()).await?;
    assert_eq!(second.wait_for_exit().await?, Some(1));
    assert!(
        second
            .output
            .contains("a console session is already running on this connection"),
        "{:?}",
        second.output
    );
    assert!(!second.output.contains("Connected to domain"));

    // The running console is unaffected
    first.send("hello\n").await?;
    first.expect_output("console: hello").await?;
    first.send("exit\n").await?;
    assert_eq!(first.wait_for_exit().await?, Some(0));

    // Once it is over, the connection may open the next one
    let mut third = client.open_console(SessionOptions::default()).await?;
    third.expect_output("Connected to domain 'm1-domain'").await?;
    third.send("exit\n").await?;
    assert_eq!(third.wait_for_exit().await?, Some(0));

    client.disconnect().await;
    env.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unregistered_key_is_rejected() -> eyre::Result<()> {
    let env = standard_environment(GatewayOptions::default()).await?;

    let client = login(
        env.gateway_addr,
        "m1",
        Login::PublicKey(&fixture("stranger-key")),
    )
    .await?;
    assert!(client.is_none(), "stranger key was accepted");

    // Unknown machines don't get any further either
    let client = login(
        env.gateway_addr,
        "m404",
        Login::PublicKey(&fixture("owner-key")),
    )
    .await?;
    assert!(client.is_none(), "login to unknown machine was accepted");

    env.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_without_pty_is_refused() -> eyre::Result<()> {
    let env = standard_environment(GatewayOptions::default()).await?;

    let client = login(env.gateway_addr, "m1", Login::PublicKey(&fixture("owner-key")))
        .await?
        .expect("owner key was rejected");
    let mut console = client
        .open_console(SessionOptions {
            pty: false,
            ..Default::default()
        })
        .await?;
    assert_eq!(console.wait_for_exit().await?, Some(1));
    assert!(
        console.output.contains("No PTY requested."),
        "{:?}",
        console.output
    );

    client.disconnect().await;
    env.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_admin_password_opens_firewall() -> eyre::Result<()> {
    let env = standard_environment(GatewayOptions::default()).await?;

    let client = login(env.gateway_addr, "fw1", Login::Password("admin-token"))
        .await?
        .expect("admin token was rejected");
    let mut console = client.open_console(SessionOptions::default()).await?;
    console.expect_output("Connected to domain 'fw1-domain'").await?;
    console.send("exit\n").await?;
    assert_eq!(console.wait_for_exit().await?, Some(0));

    client.disconnect().await;
    env.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_admin_token_from_environment() -> eyre::Result<()> {
    let env = standard_environment(GatewayOptions::default()).await?;

    // Any key gets past authentication for a firewall, the token decides at session start
    let client = login(
        env.gateway_addr,
        "fw1",
        Login::PublicKey(&fixture("stranger-key")),
    )
    .await?
    .expect("firewall login was rejected");
    let mut console = client
        .open_console(SessionOptions {
            env: &[(OIDC_ENV_VAR, "admin-token")],
            ..Default::default()
        })
        .await?;
    console.expect_output("Connected to domain 'fw1-domain'").await?;
    console.send("exit\n").await?;
    assert_eq!(console.wait_for_exit().await?, Some(0));
    client.disconnect().await;

    let client = login(
        env.gateway_addr,
        "fw1",
        Login::PublicKey(&fixture("stranger-key")),
    )
    .await?
    .expect("firewall login was rejected");
    let mut console = client.open_console(SessionOptions::default()).await?;
    assert_eq!(console.wait_for_exit().await?, Some(1));
    assert!(
        console.output.contains(
            "unable to find OIDC token stored in LC_METAL_STACK_OIDC_TOKEN env variable which is required for machine console access"
        ),
        "{:?}",
        console.output
    );
    client.disconnect().await;

    env.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_admin_token_is_refused() -> eyre::Result<()> {
    let env = standard_environment(GatewayOptions::default()).await?;

    // The handshake succeeds so that the caller can be told why
    let client = login(env.gateway_addr, "fw1", Login::Password("user-token"))
        .await?
        .expect("handshake failed");
    let mut console = client.open_console(SessionOptions::default()).await?;
    assert_eq!(console.wait_for_exit().await?, Some(1));
    assert!(
        console.output.contains(
            "you are not member of required admin group:metal-admins to access this machine console"
        ),
        "{:?}",
        console.output
    );
    assert!(!console.output.contains("Connected to domain"));
    client.disconnect().await;

    let client = login(env.gateway_addr, "fw1", Login::Password("bogus"))
        .await?
        .expect("handshake failed");
    let mut console = client.open_console(SessionOptions::default()).await?;
    assert_eq!(console.wait_for_exit().await?, Some(1));
    assert!(
        console.output.contains("given oidc token is invalid"),
        "{:?}",
        console.output
    );
    client.disconnect().await;

    env.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reallocation_terminates_session() -> eyre::Result<()> {
    let env = standard_environment(GatewayOptions {
        revalidation_interval: Duration::from_millis(300),
        ..Default::default()
    })
    .await?;

    let client = login(env.gateway_addr, "m1", Login::PublicKey(&fixture("owner-key")))
        .await?
        .expect("owner key was rejected");
    let mut console = client.open_console(SessionOptions::default()).await?;
    console.expect_output("Connected to domain 'm1-domain'").await?;

    // Unchanged allocations survive revalidation
    tokio::time::sleep(Duration::from_secs(1)).await;
    console.send("still here\n").await?;
    console.expect_output("console: still here").await?;

    env.directory.reallocate("m1", "2024-06-01T08:30:00Z");
    console
        .expect_output("machine allocation changed, terminating console session")
        .await?;
    assert_eq!(console.wait_for_exit().await?, Some(1));

    client.disconnect().await;
    env.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_agent() -> eyre::Result<()> {
    let env = standard_environment(GatewayOptions::default()).await?;
    env.directory.add_owned_machine(
        "m2",
        ALLOCATED_AT,
        &[OWNER_SSH_PUBKEY.trim()],
        unused_addr().await?,
    );
    env.directory
        .set_credential("m2", "m2-domain", "ADMIN", "ADMIN");

    let client = login(env.gateway_addr, "m2", Login::PublicKey(&fixture("owner-key")))
        .await?
        .expect("owner key was rejected");
    let mut console = client.open_console(SessionOptions::default()).await?;
    assert_eq!(console.wait_for_exit().await?, Some(1));
    assert!(
        console
            .output
            .contains("unable to connect to the console of m2"),
        "{:?}",
        console.output
    );

    client.disconnect().await;
    env.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_agent_times_out() -> eyre::Result<()> {
    let env = standard_environment(GatewayOptions {
        inner_hop_timeout: Duration::from_secs(1),
        ..Default::default()
    })
    .await?;
    let (agent_addr, holder) = silent_addr().await?;
    env.directory.add_owned_machine(
        "m3",
        ALLOCATED_AT,
        &[OWNER_SSH_PUBKEY.trim()],
        agent_addr,
    );
    env.directory
        .set_credential("m3", "m3-domain", "ADMIN", "ADMIN");

    let client = login(env.gateway_addr, "m3", Login::PublicKey(&fixture("owner-key")))
        .await?
        .expect("owner key was rejected");
    let mut console = client.open_console(SessionOptions::default()).await?;
    let start = std::time::Instant::now();
    assert_eq!(console.wait_for_exit().await?, Some(1));
    assert!(
        console
            .output
            .contains("unable to connect to the console of m3"),
        "{:?}",
        console.output
    );
    assert!(start.elapsed() < Duration::from_secs(5));

    holder.abort();
    client.disconnect().await;
    env.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_agent_with_unexpected_host_key() -> eyre::Result<()> {
    let env = standard_environment(GatewayOptions {
        inner_host_public_key: "rogue-host-key.pub",
        ..Default::default()
    })
    .await?;

    let client = login(env.gateway_addr, "m1", Login::PublicKey(&fixture("owner-key")))
        .await?
        .expect("owner key was rejected");
    let mut console = client.open_console(SessionOptions::default()).await?;
    assert_eq!(console.wait_for_exit().await?, Some(1));
    assert!(
        console
            .output
            .contains("unable to connect to the console of m1"),
        "{:?}",
        console.output
    );
    assert!(!console.output.contains("Connecting to console"));

    client.disconnect().await;
    env.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_agent_refuses_foreign_client_certificate() -> eyre::Result<()> {
    let env = standard_environment(GatewayOptions {
        client_cert: "rogue-client.pem",
        client_key: "rogue-client-key.pem",
        ..Default::default()
    })
    .await?;

    let client = login(env.gateway_addr, "m1", Login::PublicKey(&fixture("owner-key")))
        .await?
        .expect("owner key was rejected");
    let mut console = client.open_console(SessionOptions::default()).await?;
    assert_eq!(console.wait_for_exit().await?, Some(1));
    assert!(
        console
            .output
            .contains("unable to connect to the console of m1"),
        "{:?}",
        console.output
    );

    client.disconnect().await;
    env.shutdown().await;
    Ok(())
}

#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_test_writer()
        .try_init()
        .ok();
}
