use std::collections::HashMap;

use crate::fastly::UsageByService;

/// Running totals for one service across all regions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServiceTotals {
    pub bandwidth_bytes: u64,
    pub requests: u64,
}

/// Per-service totals plus the global bytes figure used for
/// percentage-of-total computation.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UsageSummary {
    pub per_service: HashMap<String, ServiceTotals>,
    pub total_bytes_delivered: u64,
}

/// Fold the raw region -> service -> usage map into per-service totals.
/// Bandwidth accumulates into both the service total and the global total;
/// compute requests count toward the service request total. Pure summation,
/// so region iteration order is irrelevant.
pub fn summarize(usage: &UsageByService) -> UsageSummary {
    let mut summary = UsageSummary::default();

    for services in usage.data.values() {
        for (service_id, entry) in services {
            let totals = summary.per_service.entry(service_id.clone()).or_default();
            totals.bandwidth_bytes += entry.bandwidth;
            totals.requests += entry.requests + entry.compute_requests;
            summary.total_bytes_delivered += entry.bandwidth;
        }
    }

    summary
}

/// Share of the global total, as a percentage rounded to 4 decimal places.
/// A zero total yields 0.0 (a month with no delivered bytes).
pub fn percentage_of_total(bandwidth_bytes: u64, total_bytes_delivered: u64) -> f64 {
    if total_bytes_delivered == 0 {
        return 0.0;
    }
    let pct = 100.0 * (bandwidth_bytes as f64 / total_bytes_delivered as f64);
    (pct * 10_000.0).round() / 10_000.0
}

const SIZE_NAMES: [&str; 9] = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Human-readable byte count with 1000-based units, rounded to 2 decimal
/// places. Report output only, never persisted.
pub fn convert_size(size_bytes: u64) -> String {
    if size_bytes == 0 {
        return "0 B".to_string();
    }

    let mut scaled = size_bytes as f64;
    let mut unit = 0;
    while scaled >= 1000.0 && unit < SIZE_NAMES.len() - 1 {
        scaled /= 1000.0;
        unit += 1;
    }

    let rounded = (scaled * 100.0).round() / 100.0;
    if rounded.fract() == 0.0 {
        format!("{:.1} {}", rounded, SIZE_NAMES[unit])
    } else {
        format!("{} {}", rounded, SIZE_NAMES[unit])
    }
}
