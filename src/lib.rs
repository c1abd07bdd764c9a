use aws_lambda_events::event::apigw::ApiGatewayV2httpRequest;
use lambda_runtime::{Error, LambdaEvent};
use tracing::level_filters::LevelFilter;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::bigquery::BigQueryClient;
use crate::config::{ApiKey, Config};
use crate::fastly::FastlyClient;

pub mod aggregate;
pub mod bigquery;
pub mod config;
pub mod fastly;
pub mod process;
pub mod window;

pub fn set_up_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

/// A type used to hold the API clients required by the lambda function: the
/// Fastly stats source and the BigQuery sink.
pub struct Clients {
    pub fastly: FastlyClient,
    pub warehouse: BigQueryClient,
}

impl Clients {
    pub fn new(config: &Config, bigquery_token: ApiKey) -> Result<Clients, Error> {
        Ok(Clients {
            fastly: FastlyClient::new(config)?,
            warehouse: BigQueryClient::new(config, bigquery_token)?,
        })
    }
}

// lambda handler
//
// The trigger is a scheduled HTTP ping; its body and headers carry no
// information, every invocation runs the same monthly job. The response body
// is the literal text "OK" even when individual row inserts were rejected.
pub async fn function_handler(
    clients: &Clients,
    config: &Config,
    evt: LambdaEvent<ApiGatewayV2httpRequest>,
) -> Result<String, Error> {
    info!("Handling monthly usage export invocation");
    debug!("Trigger path: {:?}", evt.payload.raw_path);

    let report = process::run(&clients.fastly, &clients.warehouse, config).await?;

    info!(
        services = report.services,
        rows_inserted = report.rows_inserted,
        rows_failed = report.rows_failed,
        total_bytes_delivered = report.total_bytes_delivered,
        "Completed usage export for {}",
        report.window.end_date
    );

    Ok("OK".to_string())
}
