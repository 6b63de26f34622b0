//! Core domain model for paid-traffic opportunity ranking.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

pub mod classify;
pub mod normalize;
pub mod thresholds;

pub use classify::{classify, Category, ExclusionReason};
pub use normalize::{join_base_and_path, normalize_url};
pub use thresholds::{ConfigWarning, CwvThresholds, MetricThreshold, ThresholdConfig};

pub const CRATE_NAME: &str = "paidops-core";

pub const STATUS_NEW: &str = "NEW";
pub const STATUS_IN_PROGRESS: &str = "IN_PROGRESS";

/// Opportunity statuses the top-paid view reads from the data layer.
pub const OPEN_STATUSES: [&str; 2] = [STATUS_NEW, STATUS_IN_PROGRESS];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub id: Uuid,
    pub base_url: String,
    pub organization_id: Uuid,
}

/// Detected, actionable site issue produced by upstream audits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: Uuid,
    pub site_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub opportunity_type: String,
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub data: OpportunityData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projected_traffic_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projected_traffic_lost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projected_conversion_value: Option<f64>,
    /// Sub-type override some audits set instead of a dedicated `type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opportunity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Opportunity {
    /// Largest of the projected traffic/conversion values, ignoring non-positive ones.
    pub fn projected_value(&self) -> Option<f64> {
        [
            self.data.projected_traffic_value,
            self.data.projected_conversion_value,
        ]
        .into_iter()
        .flatten()
        .filter(|v| v.is_finite() && *v > 0.0)
        .reduce(f64::max)
    }

    /// Ranking metric: traffic value, or conversion value when traffic value is absent or zero.
    pub fn value_metric(&self) -> f64 {
        match self.data.projected_traffic_value {
            Some(v) if v.is_finite() && v > 0.0 => v,
            _ => self
                .data
                .projected_conversion_value
                .filter(|v| v.is_finite())
                .unwrap_or(0.0),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags
            .iter()
            .any(|t| t.trim().eq_ignore_ascii_case(tag))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub id: Uuid,
    pub opportunity_id: Uuid,
    pub status: String,
    #[serde(default)]
    pub rank: i64,
    #[serde(default)]
    pub data: SuggestionData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SuggestionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_to: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Where a candidate URL for paid-traffic matching came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlSource {
    Page(String),
    LinkFrom(String),
    LinkTo(String),
    Form(String),
}

impl UrlSource {
    pub fn url(&self) -> &str {
        match self {
            UrlSource::Page(u) | UrlSource::LinkFrom(u) | UrlSource::LinkTo(u) | UrlSource::Form(u) => u,
        }
    }

    pub fn field_name(&self) -> &'static str {
        match self {
            UrlSource::Page(_) => "url",
            UrlSource::LinkFrom(_) => "url_from",
            UrlSource::LinkTo(_) => "url_to",
            UrlSource::Form(_) => "form",
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

impl SuggestionData {
    /// URL-bearing fields in lookup order: `url`, `url_from`, `url_to`.
    pub fn url_sources(&self) -> Vec<UrlSource> {
        let mut out = Vec::with_capacity(3);
        if let Some(u) = non_blank(&self.url) {
            out.push(UrlSource::Page(u));
        }
        if let Some(u) = non_blank(&self.url_from) {
            out.push(UrlSource::LinkFrom(u));
        }
        if let Some(u) = non_blank(&self.url_to) {
            out.push(UrlSource::LinkTo(u));
        }
        out
    }
}

impl OpportunityData {
    pub fn form_source(&self) -> Option<UrlSource> {
        non_blank(&self.form).map(UrlSource::Form)
    }
}

/// Categorical Core Web Vitals bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CwvScore {
    Good,
    NeedsImprovement,
    Poor,
}

impl CwvScore {
    pub fn parse(raw: &str) -> Option<Self> {
        let cleaned = raw
            .trim()
            .to_ascii_lowercase()
            .replace(['_', '-'], " ");
        match cleaned.split_whitespace().collect::<Vec<_>>().join(" ").as_str() {
            "good" => Some(CwvScore::Good),
            "needs improvement" | "ni" => Some(CwvScore::NeedsImprovement),
            "poor" => Some(CwvScore::Poor),
            _ => None,
        }
    }

    pub fn is_good(self) -> bool {
        self == CwvScore::Good
    }
}

/// Analytics row as returned by the query client (and stored in the cache).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawPaidTrafficRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// String-encoded integer in the analytics output; numbers are accepted too.
    #[serde(default)]
    pub pageviews: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_cwv_score: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lcp_score: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cls_score: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inp_score: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p70_lcp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p70_cls: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p70_inp: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CwvSignal {
    Categorical {
        overall: Option<CwvScore>,
        lcp: Option<CwvScore>,
        cls: Option<CwvScore>,
        inp: Option<CwvScore>,
    },
    Percentile {
        lcp: Option<f64>,
        cls: Option<f64>,
        inp: Option<f64>,
    },
    Absent,
}

/// Analytics row with its URL resolved and its CWV shape decided.
#[derive(Debug, Clone, PartialEq)]
pub struct PaidTrafficRow {
    pub url: String,
    pub pageviews: u64,
    pub cwv: CwvSignal,
}

impl RawPaidTrafficRow {
    pub fn pageview_count(&self) -> u64 {
        match &self.pageviews {
            Some(JsonValue::String(s)) => s.trim().parse::<f64>().ok(),
            Some(JsonValue::Number(n)) => n.as_f64(),
            _ => None,
        }
        .filter(|v| v.is_finite() && *v > 0.0)
        .map(|v| v as u64)
        .unwrap_or(0)
    }

    pub fn cwv_signal(&self) -> CwvSignal {
        let scores = [
            &self.overall_cwv_score,
            &self.lcp_score,
            &self.cls_score,
            &self.inp_score,
        ];
        if scores.iter().any(|s| s.is_some()) {
            let parse = |s: &Option<String>| s.as_deref().and_then(CwvScore::parse);
            return CwvSignal::Categorical {
                overall: parse(&self.overall_cwv_score),
                lcp: parse(&self.lcp_score),
                cls: parse(&self.cls_score),
                inp: parse(&self.inp_score),
            };
        }
        if self.p70_lcp.is_some() || self.p70_cls.is_some() || self.p70_inp.is_some() {
            return CwvSignal::Percentile {
                lcp: self.p70_lcp,
                cls: self.p70_cls,
                inp: self.p70_inp,
            };
        }
        CwvSignal::Absent
    }

    /// Resolve the row URL, joining a bare path onto the site base URL.
    pub fn resolve(&self, base_url: &str) -> Option<PaidTrafficRow> {
        let url = match (non_blank(&self.url), non_blank(&self.path)) {
            (Some(url), _) => url,
            (None, Some(path)) => join_base_and_path(base_url, &path),
            (None, None) => return None,
        };
        Some(PaidTrafficRow {
            url,
            pageviews: self.pageview_count(),
            cwv: self.cwv_signal(),
        })
    }
}
