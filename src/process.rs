use chrono::Utc;
use itertools::Itertools;
use lambda_runtime::Error;
use tracing::{info, warn};

use crate::aggregate::{self, convert_size, percentage_of_total, UsageSummary};
use crate::bigquery::{BigQueryClient, UsageRow};
use crate::config::Config;
use crate::fastly::{FastlyClient, OnError, ServiceCatalog};
use crate::window::ReportingWindow;

/// Outcome of one pipeline run, reported back to the handler.
#[derive(Debug)]
pub struct RunReport {
    pub window: ReportingWindow,
    pub services: usize,
    pub rows_inserted: usize,
    pub rows_failed: usize,
    pub total_bytes_delivered: u64,
}

/// One full pipeline run: resolve the window, fetch usage and metadata,
/// aggregate, then replace the warehouse rows for the window's end date.
pub async fn run(
    fastly: &FastlyClient,
    warehouse: &BigQueryClient,
    config: &Config,
) -> Result<RunReport, Error> {
    let window = ReportingWindow::resolve(config, Utc::now().date_naive());
    info!(
        "------------------------Calculating data from {} to {}------------------------",
        window.start_date, window.end_date
    );

    let usage = fastly.usage_by_service(&window, OnError::FailFast).await?;

    // Metadata memo is per-run; ids are visited in sorted order so each
    // distinct service triggers exactly one lookup.
    let mut catalog = ServiceCatalog::new();
    for service_id in usage.service_ids() {
        catalog.lookup(fastly, service_id).await?;
    }

    let summary = aggregate::summarize(&usage);
    if summary.total_bytes_delivered == 0 && !summary.per_service.is_empty() {
        warn!("Total bytes delivered is zero; all percentages will be reported as 0");
    }

    let rows = build_rows(&window, &summary, &catalog);
    for row in &rows {
        info!(
            "{} ({}) [{}] - {} ({} requests) - {}%",
            row.service_name,
            row.service_id,
            row.service_type,
            convert_size(row.bandwidth_bytes),
            row.requests,
            row.percentage_of_total
        );
    }
    info!(
        "{} total delivered",
        convert_size(summary.total_bytes_delivered)
    );

    // Delete waits for job completion so the insert never lands behind a
    // still-running delete on a rerun of the same month.
    warehouse.delete_rows_for_date(window.end_date).await?;
    let rows_failed = warehouse.insert_rows(&rows).await?;

    Ok(RunReport {
        window,
        services: rows.len(),
        rows_inserted: rows.len() - rows_failed,
        rows_failed,
        total_bytes_delivered: summary.total_bytes_delivered,
    })
}

/// Combine the aggregate totals with the metadata catalog into warehouse
/// rows, largest bandwidth first.
fn build_rows(
    window: &ReportingWindow,
    summary: &UsageSummary,
    catalog: &ServiceCatalog,
) -> Vec<UsageRow> {
    let date = window.end_date.format("%Y-%m-%d").to_string();

    summary
        .per_service
        .iter()
        .sorted_by(|(id_a, totals_a), (id_b, totals_b)| {
            totals_b
                .bandwidth_bytes
                .cmp(&totals_a.bandwidth_bytes)
                .then_with(|| id_a.cmp(id_b))
        })
        .filter_map(|(service_id, totals)| {
            let Some(detail) = catalog.get(service_id) else {
                // Every id in the usage map was looked up before this point,
                // so a miss means the fetch stage was skipped.
                warn!(%service_id, "No metadata for service, skipping row");
                return None;
            };

            Some(UsageRow {
                date: date.clone(),
                service_name: detail.name.clone(),
                service_id: service_id.clone(),
                service_type: detail.service_type.clone(),
                bandwidth_bytes: totals.bandwidth_bytes,
                requests: totals.requests,
                percentage_of_total: percentage_of_total(
                    totals.bandwidth_bytes,
                    summary.total_bytes_delivered,
                ),
            })
        })
        .collect()
}
