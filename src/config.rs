use std::fmt;
use std::string::String;
use std::{env, time::Duration};

use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;

/// An opaque API credential. Redacts itself in debug output so keys never
/// end up in log lines.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn token(&self) -> &str {
        &self.0
    }
}

impl From<String> for ApiKey {
    fn from(token: String) -> Self {
        ApiKey(token)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ApiKey(***)")
    }
}

pub struct Config {
    pub api_key: ApiKey,
    pub fastly_endpoint: String,
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
    pub bigquery_endpoint: String,
    pub bigquery_token: Option<ApiKey>,
    pub metadata_endpoint: String,
    pub report_start_date: Option<NaiveDate>,
    pub report_end_date: Option<NaiveDate>,
}

impl Config {
    pub fn load_from_env() -> Result<Config, String> {
        let conf = Config {
            api_key: env::var("FASTLY_KEY")
                .map_err(|e| format!("FASTLY_KEY not set - {}", e))?
                .into(),
            fastly_endpoint: env::var("FASTLY_ENDPOINT")
                .unwrap_or_else(|_| "https://api.fastly.com".to_string()),

            project_id: env::var("BQ_PROJECT_ID")
                .map_err(|e| format!("BQ_PROJECT_ID not set - {}", e))?,
            dataset_id: env::var("BQ_DATASET_ID").unwrap_or_else(|_| "fastly".to_string()),
            table_id: env::var("BQ_TABLE_ID").unwrap_or_else(|_| "fastly_breakdown".to_string()),
            bigquery_endpoint: env::var("BIGQUERY_ENDPOINT")
                .unwrap_or_else(|_| "https://bigquery.googleapis.com".to_string()),
            bigquery_token: env::var("GOOGLE_ACCESS_TOKEN").ok().map(ApiKey::from),
            metadata_endpoint: env::var("METADATA_ENDPOINT")
                .unwrap_or_else(|_| "http://metadata.google.internal".to_string()),

            report_start_date: parse_date_var("REPORT_START_DATE")?,
            report_end_date: parse_date_var("REPORT_END_DATE")?,
        };

        Ok(conf)
    }
}

fn parse_date_var(name: &str) -> Result<Option<NaiveDate>, String> {
    match env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => raw
            .parse::<NaiveDate>()
            .map(Some)
            .map_err(|e| format!("Error parsing {} as a date (expected YYYY-MM-DD) - {}", name, e)),
    }
}

#[derive(Error, Debug)]
pub enum TokenSourceError {
    #[error("failed to reach the metadata server at {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("metadata server returned status {status} for {url}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        url: String,
    },
    #[error("failed to decode the metadata token response: {0}")]
    Decode(#[source] reqwest::Error),
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Resolve a BigQuery bearer token from the GCE metadata server. Only called
/// when no GOOGLE_ACCESS_TOKEN is configured, once at startup.
pub async fn resolve_access_token(metadata_endpoint: &str) -> Result<ApiKey, TokenSourceError> {
    let url = format!(
        "{}/computeMetadata/v1/instance/service-accounts/default/token",
        metadata_endpoint
    );
    let response = reqwest::Client::new()
        .get(&url)
        .header("Metadata-Flavor", "Google")
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .map_err(|source| TokenSourceError::Unreachable {
            url: url.clone(),
            source,
        })?;

    if !response.status().is_success() {
        return Err(TokenSourceError::UnexpectedStatus {
            status: response.status(),
            url,
        });
    }

    let token: TokenResponse = response.json().await.map_err(TokenSourceError::Decode)?;
    Ok(ApiKey::from(token.access_token))
}
