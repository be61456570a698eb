// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP client for the tracking server.
//!
//! Every endpoint is `POST {base_url}/api/{name}` with a JSON body.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::types::{
    AddTvRequest, AddTvResponse, ConfigResponse, GetTvRequest, MonitorRequest, MonitorResponse,
    SearchTvRequest, SearchTvResponse, SetWatchRequest, TvDetail,
};
use super::{ApiError, RemoteApi};
use crate::config::ClientConfig;

/// Body returned by endpoints that only report success or an error.
#[derive(Debug, Default, Deserialize)]
struct Ack {
    #[serde(default)]
    error: Option<String>,
}

/// Config endpoint takes an empty object.
#[derive(Debug, Serialize)]
struct Empty {}

/// Client for the tracking server API.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    auth_header: Option<String>,
}

impl HttpApi {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_header: config.auth_header.clone(),
        })
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/api/{}", self.base_url, name)
    }

    async fn post<Req, Resp>(&self, name: &str, body: &Req) -> Result<Resp, ApiError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = self.endpoint(name);
        let mut request = self.client.post(&url).json(body);
        if let Some(auth) = &self.auth_header {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }

        let response = request.send().await.map_err(|e| {
            tracing::debug!(endpoint = name, error = %e, "API request failed to send");
            ApiError::Network(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(endpoint = name, status = status.as_u16(), "API returned error status");
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| ApiError::Decode(format!("{}: {}", name, e)))
    }
}

#[async_trait]
impl RemoteApi for HttpApi {
    async fn fetch_monitor(&self, version: &str) -> Result<MonitorResponse, ApiError> {
        self.post(
            "monitor",
            &MonitorRequest {
                version: version.to_string(),
            },
        )
        .await
    }

    async fn fetch_config(&self) -> Result<ConfigResponse, ApiError> {
        self.post("get_config", &Empty {}).await
    }

    async fn fetch_tv(&self, id: u64) -> Result<TvDetail, ApiError> {
        self.post("get_tv", &GetTvRequest { id }).await
    }

    async fn set_watch(&self, request: &SetWatchRequest) -> Result<(), ApiError> {
        let ack: Ack = self.post("set_watch", request).await?;
        match ack.error {
            Some(error) => Err(ApiError::Server(error)),
            None => Ok(()),
        }
    }

    async fn search_tv(&self, keyword: &str) -> Result<SearchTvResponse, ApiError> {
        let response: SearchTvResponse = self
            .post(
                "search_tv",
                &SearchTvRequest {
                    keyword: keyword.to_string(),
                },
            )
            .await?;
        match response.error {
            Some(error) => Err(ApiError::Server(error)),
            None => Ok(response),
        }
    }

    async fn add_tv(&self, request: &AddTvRequest) -> Result<AddTvResponse, ApiError> {
        let response: AddTvResponse = self.post("add_tv", request).await?;
        match response.error {
            Some(error) => Err(ApiError::Server(error)),
            None => Ok(response),
        }
    }
}
