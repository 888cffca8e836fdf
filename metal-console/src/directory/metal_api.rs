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
use crate::config::GatewayConfig;
use crate::credential::CredentialRecord;
use chrono::{SecondsFormat, Utc};
use eyre::Context;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use ring::hmac;
use serde::Deserialize;
use std::fmt;

static DATE_HEADER: &str = "X-Date";
static HMAC_AUTH_TYPE: &str = "Metal-Admin";

/// [`MachineDirectory`] backed by the metal-api v1 REST interface.
#[derive(Clone)]
pub struct MetalApiDirectory {
    http_client: reqwest::Client,
    base_url: Url,
    hmac: Option<HmacAuth>,
}

impl fmt::Debug for MetalApiDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetalApiDirectory")
            .field("base_url", &self.base_url.as_str())
            .field("hmac", &self.hmac.is_some())
            .finish()
    }
}

impl MetalApiDirectory {
    pub fn new(config: &GatewayConfig) -> eyre::Result<Self> {
        let base_url = Url::parse(&config.directory_url)
            .with_context(|| format!("Invalid directory_url {}", config.directory_url))?;
        let http_client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(config.directory_timeout)
            .build()
            .context("error building HTTP client for the machine directory")?;
        tracing::info!(directory_url = %base_url, "using machine directory");

        Ok(Self {
            http_client,
            base_url,
            hmac: config.hmac_key.as_deref().map(HmacAuth::new),
        })
    }

    fn url(&self, path: &str) -> Url {
        // Url::join would drop the last path segment of a base URL without a trailing slash
        let mut url = self.base_url.clone();
        url.set_path(&format!(
            "{}/{}",
            self.base_url.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        ));
        url
    }

    /// Send a service request, signed with the HMAC key if one is configured.
    async fn service_request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, DirectoryError> {
        let body = body.unwrap_or_default();
        let mut request = self.http_client.request(method, self.url(path));
        if let Some(hmac) = &self.hmac {
            let date = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            request = request
                .header(AUTHORIZATION, hmac.authorization_header(&date, &body))
                .header(DATE_HEADER, date);
        }
        if !body.is_empty() {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }
        Ok(request.send().await?)
    }
}

#[async_trait::async_trait]
impl MachineDirectory for MetalApiDirectory {
    async fn find_machine(&self, machine_id: &str) -> Result<MachineRecord, DirectoryError> {
        let body = serde_json::to_vec(&serde_json::json!({ "id": machine_id }))?;
        let response = self
            .service_request(Method::POST, "v1/machine/find", Some(body))
            .await?;
        let mut machines: Vec<MachineRecord> = decode(response).await?;
        match machines.len() {
            0 => Err(DirectoryError::NotFound(machine_id.to_string())),
            1 => Ok(machines.remove(0)),
            count => Err(DirectoryError::Ambiguous {
                count,
                machine_id: machine_id.to_string(),
            }),
        }
    }

    async fn find_management_credential(
        &self,
        machine_id: &str,
    ) -> Result<CredentialRecord, DirectoryError> {
        let response = self
            .service_request(Method::GET, &format!("v1/machine/{machine_id}/ipmi"), None)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(DirectoryError::NotFound(machine_id.to_string()));
        }
        let machine: MachineIpmiResponse = decode(response).await?;
        match machine.ipmi {
            Some(IpmiResponse {
                address: Some(address),
                user: Some(username),
                password: Some(secret),
            }) if !address.is_empty() => Ok(CredentialRecord {
                address,
                username,
                secret,
            }),
            _ => Err(DirectoryError::NoCredential(machine_id.to_string())),
        }
    }

    async fn resolve_identity(&self, bearer_token: &str) -> Result<Identity, DirectoryError> {
        let response = self
            .http_client
            .get(self.url("v1/user/me"))
            .bearer_auth(bearer_token)
            .send()
            .await?;
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(DirectoryError::InvalidToken);
        }
        decode(response).await
    }
}

async fn decode<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, DirectoryError> {
    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(DirectoryError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }
    Ok(serde_json::from_slice(&body)?)
}

#[derive(Deserialize)]
struct MachineIpmiResponse {
    #[serde(default)]
    ipmi: Option<IpmiResponse>,
}

#[derive(Deserialize)]
struct IpmiResponse {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Signs service requests to metal-api with a shared HMAC key: the MAC covers the request date and
/// body, and is sent hex encoded in the Authorization header.
#[derive(Clone)]
pub struct HmacAuth {
    key: hmac::Key,
}

impl HmacAuth {
    pub fn new(key: &str) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes()),
        }
    }

    pub fn authorization_header(&self, date: &str, body: &[u8]) -> String {
        let mut context = hmac::Context::with_key(&self.key);
        context.update(date.as_bytes());
        context.update(body);
        format!(
            "{HMAC_AUTH_TYPE} {}",
            hex::encode(context.sign().as_ref())
        )
    }
}
