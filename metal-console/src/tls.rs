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

//! Mutual TLS for the inner hop. Certificates, keys and CA bundles are PEM files, read fresh every
//! time a config is built so that rotated material is picked up without a restart.

use crate::address::HostPort;
use eyre::{Context, ContextCompat};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

async fn read_pem(path: &Path, what: &str) -> eyre::Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("error reading {what} at {}", path.display()))
}

pub async fn load_certs(path: &Path) -> eyre::Result<Vec<CertificateDer<'static>>> {
    let pem = read_pem(path, "certificate").await?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("error parsing certificates in {}", path.display()))?;
    if certs.is_empty() {
        eyre::bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

pub async fn load_private_key(path: &Path) -> eyre::Result<PrivateKeyDer<'static>> {
    let pem = read_pem(path, "private key").await?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .with_context(|| format!("error parsing private key in {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}

async fn load_roots(path: &Path) -> eyre::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(load_certs(path).await?);
    if ignored > 0 {
        tracing::warn!(path = %path.display(), ignored, "ignored unparsable CA certificates");
    }
    if added == 0 {
        eyre::bail!("no usable CA certificates in {}", path.display());
    }
    Ok(roots)
}

/// Client side of the inner hop: present our certificate, trust only the given CA.
pub async fn client_config(
    cert_path: &Path,
    key_path: &Path,
    ca_path: &Path,
) -> eyre::Result<ClientConfig> {
    let roots = load_roots(ca_path).await?;
    let certs = load_certs(cert_path).await?;
    let key = load_private_key(key_path).await?;

    ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .context("error selecting TLS protocol versions")?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .context("error building TLS client config")
}

/// Server side of the inner hop: every client must present a certificate issued by the given CA.
pub async fn server_acceptor(
    cert_path: &Path,
    key_path: &Path,
    client_ca_path: &Path,
) -> eyre::Result<TlsAcceptor> {
    let provider = crypto_provider();
    let roots = load_roots(client_ca_path).await?;
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .context("error building TLS client certificate verifier")?;
    let certs = load_certs(cert_path).await?;
    let key = load_private_key(key_path).await?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("error selecting TLS protocol versions")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("error building TLS server config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Dial `address` (`host:port`) and complete a TLS handshake, verifying the server against the
/// host part of the address. `timeout` covers both the TCP connect and the handshake.
pub async fn connect(
    address: &str,
    config: Arc<ClientConfig>,
    timeout: Duration,
) -> eyre::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let target = HostPort::parse(address, None)
        .with_context(|| format!("invalid inner hop address {address:?}"))?;
    let server_name = ServerName::try_from(target.host.clone())
        .with_context(|| format!("invalid TLS server name {:?}", target.host))?;

    tokio::time::timeout(timeout, async {
        let tcp_stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .with_context(|| format!("error connecting to {target}"))?;
        tcp_stream.set_nodelay(true).ok();

        TlsConnector::from(config)
            .connect(server_name, tcp_stream)
            .await
            .with_context(|| format!("TLS handshake with {target} failed"))
    })
    .await
    .with_context(|| format!("timed out connecting to {target} after {timeout:?}"))?
}
