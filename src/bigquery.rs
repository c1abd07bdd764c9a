use std::time::{Duration, Instant};

use chrono::NaiveDate;
use http::header::USER_AGENT;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::{ApiKey, Config};

/// One per-service aggregate row as persisted to the warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRow {
    pub date: String,
    pub service_name: String,
    pub service_id: String,
    pub service_type: String,
    pub bandwidth_bytes: u64,
    pub requests: u64,
    pub percentage_of_total: f64,
}

#[derive(Error, Debug)]
pub enum BigQueryError {
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
    #[error("delete job {job_id} did not complete within {attempts} polls")]
    DeleteIncomplete { job_id: String, attempts: u32 },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest {
    query: String,
    use_legacy_sql: bool,
    parameter_mode: String,
    query_parameters: Vec<QueryParameter>,
    timeout_ms: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryParameter {
    name: String,
    parameter_type: ParameterType,
    parameter_value: ParameterValue,
}

#[derive(Serialize)]
struct ParameterType {
    #[serde(rename = "type")]
    param_type: String,
}

#[derive(Serialize)]
struct ParameterValue {
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    num_dml_affected_rows: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Serialize)]
struct InsertAllRequest<'a> {
    rows: Vec<InsertRow<'a>>,
}

#[derive(Serialize)]
struct InsertRow<'a> {
    json: &'a UsageRow,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<InsertError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertError {
    index: u32,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

const DELETE_POLL_LIMIT: u32 = 30;

pub struct BigQueryClient {
    http: reqwest::Client,
    token: ApiKey,
    endpoint: String,
    project_id: String,
    dataset_id: String,
    table_id: String,
}

impl BigQueryClient {
    pub fn new(config: &Config, token: ApiKey) -> Result<BigQueryClient, reqwest::Error> {
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

        Ok(BigQueryClient {
            http,
            token,
            endpoint: config.bigquery_endpoint.trim_end_matches('/').to_string(),
            project_id: config.project_id.clone(),
            dataset_id: config.dataset_id.clone(),
            table_id: config.table_id.clone(),
        })
    }

    /// Fully qualified `project.dataset.table` identifier.
    pub fn full_table_id(&self) -> String {
        format!("{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }

    /// Delete any previously loaded rows for the given date, waiting until
    /// the delete job is confirmed complete. Re-running a month replaces the
    /// prior load instead of duplicating it.
    pub async fn delete_rows_for_date(&self, date: NaiveDate) -> Result<(), BigQueryError> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let request = QueryRequest {
            query: format!(
                "DELETE FROM `{}` WHERE date = @report_date",
                self.full_table_id()
            ),
            use_legacy_sql: false,
            parameter_mode: "NAMED".to_string(),
            query_parameters: vec![QueryParameter {
                name: "report_date".to_string(),
                parameter_type: ParameterType {
                    param_type: "DATE".to_string(),
                },
                parameter_value: ParameterValue {
                    value: date_str.clone(),
                },
            }],
            timeout_ms: 30_000,
        };

        let url = format!(
            "{}/bigquery/v2/projects/{}/queries",
            self.endpoint, self.project_id
        );
        let mut response: QueryResponse = self.post_json(&url, &request).await?;

        // The query endpoint may return before the job finishes; poll until
        // it is confirmed complete so the insert never races the delete.
        let mut attempts = 0;
        while !response.job_complete {
            let job_id = response
                .job_reference
                .as_ref()
                .map(|r| r.job_id.clone())
                .unwrap_or_default();
            attempts += 1;
            if attempts > DELETE_POLL_LIMIT {
                return Err(BigQueryError::DeleteIncomplete { job_id, attempts });
            }

            debug!(%job_id, attempts, "delete job still running");
            tokio::time::sleep(Duration::from_millis(500)).await;

            let mut poll_url = format!(
                "{}/bigquery/v2/projects/{}/queries/{}?timeoutMs=10000",
                self.endpoint, self.project_id, job_id
            );
            if let Some(location) = response
                .job_reference
                .as_ref()
                .and_then(|r| r.location.as_deref())
            {
                poll_url.push_str(&format!("&location={}", location));
            }
            response = self.get_json(&poll_url).await?;
        }

        info!(
            deleted_rows = response.num_dml_affected_rows.as_deref().unwrap_or("0"),
            "Deleted rows with date = {}",
            date_str
        );
        Ok(())
    }

    /// Streaming-insert the run's rows. Per-row failures are logged itemized
    /// and counted, never retried; returns the number of rejected rows.
    pub async fn insert_rows(&self, rows: &[UsageRow]) -> Result<usize, BigQueryError> {
        if rows.is_empty() {
            info!("No rows to insert");
            return Ok(0);
        }

        let request = InsertAllRequest {
            rows: rows.iter().map(|row| InsertRow { json: row }).collect(),
        };
        let url = format!(
            "{}/bigquery/v2/projects/{}/datasets/{}/tables/{}/insertAll",
            self.endpoint, self.project_id, self.dataset_id, self.table_id
        );

        let response: InsertAllResponse = self.post_json(&url, &request).await?;

        for failure in &response.insert_errors {
            let service_id = rows
                .get(failure.index as usize)
                .map(|row| row.service_id.as_str())
                .unwrap_or("?");
            for err in &failure.errors {
                error!(
                    row_index = failure.index,
                    service_id,
                    reason = %err.reason,
                    "Insert failed: {}",
                    err.message
                );
            }
        }

        let failed = response.insert_errors.len();
        if failed == 0 {
            info!(
                "Successfully inserted {} records into {}.{}",
                rows.len(),
                self.dataset_id,
                self.table_id
            );
        } else {
            error!(
                "Encountered errors while inserting rows: {} of {} rejected",
                failed,
                rows.len()
            );
        }
        Ok(failed)
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, BigQueryError> {
        let start = Instant::now();
        let response = self
            .http
            .post(url)
            .header(
                "Authorization",
                format!("Bearer {}", self.token.token()),
            )
            .json(body)
            .send()
            .await
            .map_err(|source| BigQueryError::Network {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        info!(
            %status,
            elapsed_ms = start.elapsed().as_millis(),
            uri = %url,
            "warehouse HTTP request completed"
        );

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BigQueryError::UnexpectedStatus {
                status,
                url: url.to_string(),
                body,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|source| BigQueryError::Decode {
                url: url.to_string(),
                source,
            })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, BigQueryError> {
        let response = self
            .http
            .get(url)
            .header(
                "Authorization",
                format!("Bearer {}", self.token.token()),
            )
            .send()
            .await
            .map_err(|source| BigQueryError::Network {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BigQueryError::UnexpectedStatus {
                status,
                url: url.to_string(),
                body,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|source| BigQueryError::Decode {
                url: url.to_string(),
                source,
            })
    }
}
