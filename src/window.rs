use chrono::{Datelike, NaiveDate};
use tracing::warn;

use crate::config::Config;

/// The reporting date range for a single run: one full calendar month,
/// inclusive on both ends. Immutable once computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportingWindow {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl ReportingWindow {
    /// The calendar month immediately preceding the month `today` falls in.
    pub fn prior_month(today: NaiveDate) -> ReportingWindow {
        let first_of_current = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)
            .expect("the first of the current month is a valid date");
        let end_date = first_of_current
            .pred_opt()
            .expect("a day precedes the first of the month");
        let start_date = NaiveDate::from_ymd_opt(end_date.year(), end_date.month(), 1)
            .expect("the first of the previous month is a valid date");

        ReportingWindow {
            start_date,
            end_date,
        }
    }

    /// Prior month relative to `today`, unless the configuration carries an
    /// explicit override for both bounds.
    pub fn resolve(config: &Config, today: NaiveDate) -> ReportingWindow {
        match (config.report_start_date, config.report_end_date) {
            (Some(start_date), Some(end_date)) => ReportingWindow {
                start_date,
                end_date,
            },
            (None, None) => ReportingWindow::prior_month(today),
            _ => {
                warn!(
                    "Ignoring partial window override; both REPORT_START_DATE and \
                     REPORT_END_DATE must be set"
                );
                ReportingWindow::prior_month(today)
            }
        }
    }

    /// Lower bound of the usage query, first microsecond of the start date.
    pub fn from_bound(&self) -> String {
        format!("{}T00:00:00.000000", self.start_date.format("%Y-%m-%d"))
    }

    /// Upper bound of the usage query, last microsecond of the end date.
    pub fn to_bound(&self) -> String {
        format!("{}T23:59:59.999999", self.end_date.format("%Y-%m-%d"))
    }
}
