//! Analytics time windows and the paid-traffic query text.

use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum Period {
    Week(u32),
    Month(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub year: i32,
    pub period: Period,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("year must be between 2000 and 9999, got {0}")]
    InvalidYear(i64),
    #[error("week must be between 1 and 53, got {0}")]
    InvalidWeek(i64),
    #[error("month must be between 1 and 12, got {0}")]
    InvalidMonth(i64),
}

impl TimeWindow {
    /// Resolve request parameters into a window.
    ///
    /// A missing week (with no month) becomes the current ISO week and a missing
    /// year becomes the year that week belongs to, or the calendar year when a
    /// week or month was supplied. Both substitutions are logged. A month
    /// disables the week default. When both are given the week wins.
    pub fn resolve(
        year: Option<i64>,
        week: Option<i64>,
        month: Option<i64>,
        today: NaiveDate,
    ) -> Result<Self, WindowError> {
        if let Some(y) = year {
            if !(2000..=9999).contains(&y) {
                return Err(WindowError::InvalidYear(y));
            }
        }
        if let Some(w) = week {
            if !(1..=53).contains(&w) {
                return Err(WindowError::InvalidWeek(w));
            }
        }
        if let Some(m) = month {
            if !(1..=12).contains(&m) {
                return Err(WindowError::InvalidMonth(m));
            }
        }

        let period = match (week, month) {
            (Some(w), Some(m)) => {
                debug!(week = w, month = m, "both week and month supplied; using week");
                Period::Week(w as u32)
            }
            (Some(w), None) => Period::Week(w as u32),
            (None, Some(m)) => Period::Month(m as u32),
            (None, None) => {
                let current_week = today.iso_week().week();
                warn!(default_week = current_week, "no week or month supplied; defaulting to current week");
                Period::Week(current_week)
            }
        };

        // A defaulted ISO week belongs to its ISO year, which differs from the
        // calendar year around New Year.
        let week_defaulted = week.is_none() && month.is_none();
        let year = match year {
            Some(y) => y as i32,
            None => {
                let default_year = if week_defaulted {
                    today.iso_week().year()
                } else {
                    today.year()
                };
                warn!(default_year, "no year supplied; defaulting to current year");
                default_year
            }
        };

        Ok(Self { year, period })
    }

    /// Path-safe label, e.g. `week-07` or `month-03`.
    pub fn period_label(&self) -> String {
        match self.period {
            Period::Week(w) => format!("week-{w:02}"),
            Period::Month(m) => format!("month-{m:02}"),
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.year, self.period_label())
    }
}

/// Shape of the CWV columns requested from the analytics table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryVariant {
    /// good / needs improvement / poor buckets per metric.
    #[default]
    Categorical,
    /// p70 metric values, classified against the configured thresholds.
    Percentile,
}

impl QueryVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryVariant::Categorical => "categorical",
            QueryVariant::Percentile => "percentile",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "categorical" => Some(QueryVariant::Categorical),
            "percentile" => Some(QueryVariant::Percentile),
            _ => None,
        }
    }
}

fn sanitize_table_name(table: &str) -> String {
    let cleaned = table
        .chars()
        .filter(|&c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.'))
        .collect::<String>();
    if cleaned.is_empty() {
        crate::DEFAULT_ANALYTICS_TABLE.to_string()
    } else {
        cleaned
    }
}

/// Paid-traffic query for one site and window, grouped by page path.
pub fn build_paid_traffic_query(
    table: &str,
    site_id: Uuid,
    window: &TimeWindow,
    variant: QueryVariant,
) -> String {
    let period_filter = match window.period {
        Period::Week(w) => format!("week={w}"),
        Period::Month(m) => format!("month={m}"),
    };
    let metric_columns = match variant {
        QueryVariant::Categorical => vec![
            "ARBITRARY(overall_cwv_score) AS overall_cwv_score",
            "ARBITRARY(lcp_score) AS lcp_score",
            "ARBITRARY(cls_score) AS cls_score",
            "ARBITRARY(inp_score) AS inp_score",
        ],
        QueryVariant::Percentile => vec![
            "APPROX_PERCENTILE(lcp, 0.7) AS p70_lcp",
            "APPROX_PERCENTILE(cls, 0.7) AS p70_cls",
            "APPROX_PERCENTILE(inp, 0.7) AS p70_inp",
        ],
    }
    .join(",\n       ");

    format!(
        "SELECT path,\n       CAST(SUM(pageviews) AS VARCHAR) AS pageviews,\n       {metric_columns}\n  FROM {table}\n WHERE siteid = '{site_id}'\n   AND year={year}\n   AND {period_filter}\n   AND trf_type = 'paid'\n GROUP BY path\n ORDER BY SUM(pageviews) DESC",
        table = sanitize_table_name(table),
        year = window.year,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 2, 12).unwrap()
    }

    #[test]
    fn defaults_year_and_week() {
        let window = TimeWindow::resolve(None, None, None, today()).unwrap();
        assert_eq!(window.year, 2025);
        assert_eq!(window.period, Period::Week(7));
    }

    #[test]
    fn defaulted_week_uses_its_iso_year_around_new_year() {
        let late_december = NaiveDate::from_ymd_opt(2024, 12, 30).unwrap();
        let window = TimeWindow::resolve(None, None, None, late_december).unwrap();
        assert_eq!(window, TimeWindow { year: 2025, period: Period::Week(1) });

        let new_years_day = NaiveDate::from_ymd_opt(2027, 1, 1).unwrap();
        let window = TimeWindow::resolve(None, None, None, new_years_day).unwrap();
        assert_eq!(window, TimeWindow { year: 2026, period: Period::Week(53) });

        let window = TimeWindow::resolve(None, None, Some(1), new_years_day).unwrap();
        assert_eq!(window, TimeWindow { year: 2027, period: Period::Month(1) });
        let window = TimeWindow::resolve(Some(2027), None, None, new_years_day).unwrap();
        assert_eq!(window.year, 2027);
    }

    #[test]
    fn month_disables_week_default() {
        let window = TimeWindow::resolve(Some(2024), None, Some(3), today()).unwrap();
        assert_eq!(window, TimeWindow { year: 2024, period: Period::Month(3) });
        assert_eq!(window.to_string(), "2024/month-03");
    }

    #[test]
    fn week_wins_when_both_given() {
        let window = TimeWindow::resolve(Some(2024), Some(10), Some(3), today()).unwrap();
        assert_eq!(window.period, Period::Week(10));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert_eq!(TimeWindow::resolve(None, Some(54), None, today()), Err(WindowError::InvalidWeek(54)));
        assert_eq!(TimeWindow::resolve(None, Some(0), None, today()), Err(WindowError::InvalidWeek(0)));
        assert_eq!(TimeWindow::resolve(None, None, Some(13), today()), Err(WindowError::InvalidMonth(13)));
        assert_eq!(TimeWindow::resolve(Some(99), None, None, today()), Err(WindowError::InvalidYear(99)));
    }

    #[test]
    fn query_contains_year_and_period_filters() {
        let site_id = Uuid::nil();
        let week = TimeWindow { year: 2025, period: Period::Week(7) };
        let q = build_paid_traffic_query("analytics.paid_traffic", site_id, &week, QueryVariant::Categorical);
        assert!(q.contains("year=2025"));
        assert!(q.contains("week=7"));
        assert!(!q.contains("month="));
        assert!(q.contains("lcp_score"));
        assert!(q.contains("FROM analytics.paid_traffic"));

        let month = TimeWindow { year: 2025, period: Period::Month(2) };
        let q = build_paid_traffic_query("bad; DROP TABLE x", site_id, &month, QueryVariant::Percentile);
        assert!(q.contains("month=2"));
        assert!(q.contains("p70_inp"));
        assert!(q.contains("FROM badDROPTABLEx"));
    }

    #[test]
    fn variant_parsing() {
        assert_eq!(QueryVariant::parse(" Percentile "), Some(QueryVariant::Percentile));
        assert_eq!(QueryVariant::parse("nope"), None);
        assert_eq!(QueryVariant::default().as_str(), "categorical");
    }
}
