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

//! A stand-in for metal-api: just enough of the v1 REST interface for the gateway, with machines
//! that tests can change while sessions are running.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct Directory {
    machines: HashMap<String, Value>,
    credentials: HashMap<String, Value>,
    /// bearer token -> user
    users: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct MockDirectory {
    inner: Arc<Mutex<Directory>>,
}

pub struct MockDirectoryHandle {
    pub addr: SocketAddr,
    _shutdown_tx: oneshot::Sender<()>,
}

impl MockDirectoryHandle {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl MockDirectory {
    /// An allocated machine owned by whoever holds one of `ssh_pub_keys`.
    pub fn add_owned_machine(&self, id: &str, created: &str, ssh_pub_keys: &[&str], agent: SocketAddr) {
        self.set_machine(json!({
            "id": id,
            "partition": {"id": "test-partition", "mgmtserviceaddress": agent.to_string()},
            "allocation": {
                "created": created,
                "role": "machine",
                "ssh_pub_keys": ssh_pub_keys,
                "networks": [{"private": true, "ips": ["10.0.0.7"]}],
            },
        }));
    }

    pub fn add_firewall(&self, id: &str, agent: SocketAddr) {
        self.set_machine(json!({
            "id": id,
            "partition": {"id": "test-partition", "mgmtserviceaddress": agent.to_string()},
            "allocation": {
                "created": "2024-03-01T08:00:00Z",
                "role": "firewall",
            },
        }));
    }

    pub fn set_machine(&self, machine: Value) {
        let id = machine["id"].as_str().unwrap_or_default().to_string();
        self.inner.lock().unwrap().machines.insert(id, machine);
    }

    /// Give `id` a new allocation, as if it had been freed and handed to someone else.
    pub fn reallocate(&self, id: &str, created: &str) {
        let mut inner = self.inner.lock().unwrap();
        let machine = inner.machines.get_mut(id).expect("no such machine");
        machine["allocation"]["created"] = json!(created);
    }

    pub fn set_credential(&self, id: &str, address: &str, user: &str, password: &str) {
        self.inner.lock().unwrap().credentials.insert(
            id.to_string(),
            json!({"id": id, "ipmi": {"address": address, "user": user, "password": password}}),
        );
    }

    pub fn add_user(&self, token: &str, name: &str, groups: &[&str]) {
        self.inner
            .lock()
            .unwrap()
            .users
            .insert(token.to_string(), json!({"name": name, "groups": groups}));
    }

    pub async fn spawn(&self) -> eyre::Result<MockDirectoryHandle> {
        let app = Router::new()
            .route("/v1/machine/find", post(find_machine))
            .route("/v1/machine/{id}/ipmi", get(machine_ipmi))
            .route("/v1/user/me", get(user_me))
            .with_state(self.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });
        tracing::info!(%addr, "mock directory listening");

        Ok(MockDirectoryHandle {
            addr,
            _shutdown_tx: shutdown_tx,
        })
    }
}

async fn find_machine(State(directory): State<MockDirectory>, Json(query): Json<Value>) -> Response {
    let id = query["id"].as_str().unwrap_or_default();
    let inner = directory.inner.lock().unwrap();
    let found: Vec<Value> = inner.machines.get(id).cloned().into_iter().collect();
    Json(found).into_response()
}

async fn machine_ipmi(State(directory): State<MockDirectory>, Path(id): Path<String>) -> Response {
    let inner = directory.inner.lock().unwrap();
    match inner.credentials.get(&id) {
        Some(credential) => Json(credential.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn user_me(State(directory): State<MockDirectory>, headers: HeaderMap) -> Response {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default();
    let inner = directory.inner.lock().unwrap();
    match inner.users.get(token) {
        Some(user) => Json(user.clone()).into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}
