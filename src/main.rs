use aws_lambda_events::event::apigw::ApiGatewayV2httpRequest;
use fastly_usage_shipper::config::{self, Config};
use fastly_usage_shipper::Clients;
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Error> {
    fastly_usage_shipper::set_up_logging();

    info!(
        "Initializing {} version {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::load_from_env()?;

    // if no token is configured, resolve one from the GCE metadata server
    let bigquery_token = match config.bigquery_token.clone() {
        Some(token) => token,
        None => config::resolve_access_token(&config.metadata_endpoint)
            .await
            .map_err(|e| e.to_string())?,
    };

    let clients = Clients::new(&config, bigquery_token)?;

    run(service_fn(|request: LambdaEvent<ApiGatewayV2httpRequest>| {
        fastly_usage_shipper::function_handler(&clients, &config, request)
    }))
    .await
}
