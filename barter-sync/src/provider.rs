//! Upstream data provider seam and its reqwest-backed implementation.

use crate::{cache::cache_key, error::SyncError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use url::Url;

/// One upstream request: an endpoint path plus query parameters.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Default, Deserialize, Serialize)]
pub struct DataRequest {
    pub endpoint: String,
    pub params: BTreeMap<String, String>,
}

impl DataRequest {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn cache_key(&self) -> String {
        cache_key(&self.endpoint, &self.params)
    }
}

/// Source of raw upstream payloads.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn fetch(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Value, SyncError>;

    async fn fetch_request(&self, request: &DataRequest) -> Result<Value, SyncError> {
        self.fetch(&request.endpoint, &request.params).await
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct ProviderErrorBody {
    pub code: String,
    pub message: String,
}

/// Normalised response of the server-side caching layer.
///
/// ```json
/// {"success":false,"error":{"code":"UPSTREAM_TIMEOUT","message":"binance did not respond"}}
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProviderErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn into_result(self) -> Result<Value, SyncError> {
        match self {
            Envelope {
                success: true,
                data: Some(data),
                ..
            } => Ok(data),
            Envelope {
                success: true,
                data: None,
                ..
            } => Err(SyncError::Parse("successful envelope without data".to_string())),
            Envelope {
                error: Some(ProviderErrorBody { code, message }),
                ..
            } => Err(SyncError::Provider { code, message }),
            Envelope { error: None, .. } => Err(SyncError::Provider {
                code: "UNKNOWN".to_string(),
                message: "request failed without error detail".to_string(),
            }),
        }
    }
}

/// How an [`HttpProvider`] interprets response bodies.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum ResponseShape {
    /// Body is an [`Envelope`] from the normalising layer.
    #[default]
    Envelope,
    /// Body is the upstream payload itself, eg/ Binance futures REST.
    Raw,
}

/// [`Provider`] speaking HTTP to a base URL.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    base_url: Url,
    shape: ResponseShape,
}

impl HttpProvider {
    pub fn new(base_url: &str, shape: ResponseShape) -> Result<Self, SyncError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|error| SyncError::Config(format!("invalid base url {base_url}: {error}")))?;

        // Endpoints join beneath the base path, eg/ "/api" + "/fapi/v1/time" -> "/api/fapi/v1/time"
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client: Client::new(),
            base_url,
            shape,
        })
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn url_for(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Url, SyncError> {
        let mut url = self
            .base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|error| SyncError::Config(format!("invalid endpoint {endpoint}: {error}")))?;

        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params.iter());
        }
        Ok(url)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn fetch(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Value, SyncError> {
        let url = self.url_for(endpoint, params)?;
        debug!(%url, "fetching");

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(endpoint, status = status.as_u16(), "upstream returned error status");
            return Err(SyncError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        match self.shape {
            ResponseShape::Raw => Ok(response.json::<Value>().await?),
            ResponseShape::Envelope => response.json::<Envelope>().await?.into_result(),
        }
    }
}
