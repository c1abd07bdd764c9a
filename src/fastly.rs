use std::collections::HashMap;
use std::time::Duration;

use http::header::USER_AGENT;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ApiKey, Config};
use crate::window::ReportingWindow;

#[derive(Error, Debug)]
pub enum FastlyApiError {
    #[error("unexpected status {status} from {url}: {body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        url: String,
        body: String,
    },
    #[error("network error calling {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Error semantics for a single API call. `FailFast` surfaces a non-2xx
/// response as an error to the caller; `ReturnEmpty` swallows it and yields
/// an empty result, for call sites where missing data is tolerable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    FailFast,
    ReturnEmpty,
}

/// One region's usage for one service. Leaves missing from the response
/// count as zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RegionalUsage {
    #[serde(default)]
    pub bandwidth: u64,
    #[serde(default)]
    pub requests: u64,
    #[serde(default)]
    pub compute_requests: u64,
}

/// Raw usage response: region name -> service id -> usage.
#[derive(Debug, Default, Deserialize)]
pub struct UsageByService {
    #[serde(default)]
    pub data: HashMap<String, HashMap<String, RegionalUsage>>,
}

impl UsageByService {
    /// Distinct service ids across all regions, sorted for a deterministic
    /// lookup order.
    pub fn service_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .data
            .values()
            .flat_map(|services| services.keys())
            .map(String::as_str)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceDetail {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
}

pub struct FastlyClient {
    http: reqwest::Client,
    api_key: ApiKey,
    endpoint: String,
}

impl FastlyClient {
    pub fn new(config: &Config) -> Result<FastlyClient, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            )),
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(FastlyClient {
            http,
            api_key: config.api_key.clone(),
            endpoint: config.fastly_endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Aggregate usage by service and region over the reporting window.
    pub async fn usage_by_service(
        &self,
        window: &ReportingWindow,
        mode: OnError,
    ) -> Result<UsageByService, FastlyApiError> {
        let url = format!(
            "{}/stats/usage_by_service?from={}&to={}",
            self.endpoint,
            window.from_bound(),
            window.to_bound()
        );

        match self.get_json(&url).await {
            Err(FastlyApiError::UnexpectedStatus { status, url, body })
                if mode == OnError::ReturnEmpty =>
            {
                warn!(%status, %url, "usage fetch failed, returning empty usage: {}", body);
                Ok(UsageByService::default())
            }
            other => other,
        }
    }

    /// Metadata for a single service id. Always mandatory; callers go
    /// through [ServiceCatalog] so each id is fetched at most once per run.
    pub async fn service(&self, service_id: &str) -> Result<ServiceDetail, FastlyApiError> {
        let url = format!("{}/service/{}", self.endpoint, service_id);
        self.get_json(&url).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FastlyApiError> {
        debug!("Calling API {}", url);
        let response = self
            .http
            .get(url)
            .header("Fastly-Key", self.api_key.token())
            .send()
            .await
            .map_err(|source| FastlyApiError::Network {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FastlyApiError::UnexpectedStatus {
                status,
                url: url.to_string(),
                body,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|source| FastlyApiError::Decode {
                url: url.to_string(),
                source,
            })
    }
}

/// Per-run memo of service metadata lookups. Created fresh at the start of
/// every invocation; guarantees at most one metadata call per distinct
/// service id no matter how many regions reference it.
#[derive(Default)]
pub struct ServiceCatalog {
    entries: HashMap<String, ServiceDetail>,
}

impl ServiceCatalog {
    pub fn new() -> ServiceCatalog {
        ServiceCatalog::default()
    }

    pub async fn lookup(
        &mut self,
        client: &FastlyClient,
        service_id: &str,
    ) -> Result<ServiceDetail, FastlyApiError> {
        if let Some(detail) = self.entries.get(service_id) {
            return Ok(detail.clone());
        }

        let detail = client.service(service_id).await?;
        self.entries.insert(service_id.to_string(), detail.clone());
        Ok(detail)
    }

    pub fn get(&self, service_id: &str) -> Option<&ServiceDetail> {
        self.entries.get(service_id)
    }

    #[cfg(test)]
    pub(crate) fn insert(&mut self, service_id: &str, detail: ServiceDetail) {
        self.entries.insert(service_id.to_string(), detail);
    }
}
