//! Pageview and Core Web Vitals thresholds.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{CwvScore, CwvSignal};

pub const DEFAULT_PAID_DATA_THRESHOLD: u64 = 1000;

pub const PAID_DATA_THRESHOLD_SETTING: &str = "PAID_DATA_THRESHOLD";
pub const CWV_THRESHOLDS_SETTING: &str = "CWV_THRESHOLDS";

/// A configuration value that could not be used; defaults were applied instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub setting: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to parse {}: {}", self.setting, self.message)
    }
}

impl ConfigWarning {
    pub fn new(setting: &'static str, message: impl Into<String>) -> Self {
        Self {
            setting,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricThreshold {
    pub good: f64,
    pub needs_improvement: f64,
}

impl MetricThreshold {
    pub const fn new(good: f64, needs_improvement: f64) -> Self {
        Self {
            good,
            needs_improvement,
        }
    }

    pub fn classify(&self, value: f64) -> CwvScore {
        if value <= self.good {
            CwvScore::Good
        } else if value <= self.needs_improvement {
            CwvScore::NeedsImprovement
        } else {
            CwvScore::Poor
        }
    }

    fn is_valid(&self) -> bool {
        self.good.is_finite()
            && self.needs_improvement.is_finite()
            && self.good >= 0.0
            && self.good <= self.needs_improvement
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CwvThresholds {
    pub lcp: MetricThreshold,
    pub cls: MetricThreshold,
    pub inp: MetricThreshold,
}

impl Default for CwvThresholds {
    fn default() -> Self {
        Self {
            lcp: MetricThreshold::new(2500.0, 4000.0),
            cls: MetricThreshold::new(0.1, 0.25),
            inp: MetricThreshold::new(200.0, 500.0),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CwvThresholdsSetting {
    #[serde(rename = "LCP_GOOD")]
    lcp_good: Option<f64>,
    #[serde(rename = "LCP_NEEDS_IMPROVEMENT")]
    lcp_needs_improvement: Option<f64>,
    #[serde(rename = "CLS_GOOD")]
    cls_good: Option<f64>,
    #[serde(rename = "CLS_NEEDS_IMPROVEMENT")]
    cls_needs_improvement: Option<f64>,
    #[serde(rename = "INP_GOOD")]
    inp_good: Option<f64>,
    #[serde(rename = "INP_NEEDS_IMPROVEMENT")]
    inp_needs_improvement: Option<f64>,
}

impl CwvThresholds {
    /// Parse the `CWV_THRESHOLDS` setting: a JSON string or an already-parsed object.
    ///
    /// Keys left out keep their defaults. Anything unusable falls back to the
    /// full default set and reports a warning.
    pub fn from_setting(setting: Option<&JsonValue>) -> (Self, Option<ConfigWarning>) {
        let warn = |message: String| {
            (
                Self::default(),
                Some(ConfigWarning::new(CWV_THRESHOLDS_SETTING, message)),
            )
        };

        let object = match setting {
            None => return (Self::default(), None),
            Some(JsonValue::String(raw)) if raw.trim().is_empty() => return (Self::default(), None),
            Some(JsonValue::String(raw)) => match serde_json::from_str::<JsonValue>(raw) {
                Ok(value @ JsonValue::Object(_)) => value,
                Ok(other) => return warn(format!("expected a JSON object, got {other}")),
                Err(err) => return warn(err.to_string()),
            },
            Some(value @ JsonValue::Object(_)) => value.clone(),
            Some(other) => return warn(format!("expected a JSON object, got {other}")),
        };

        let parsed: CwvThresholdsSetting = match serde_json::from_value(object) {
            Ok(parsed) => parsed,
            Err(err) => return warn(err.to_string()),
        };

        let defaults = Self::default();
        let merged = Self {
            lcp: MetricThreshold::new(
                parsed.lcp_good.unwrap_or(defaults.lcp.good),
                parsed.lcp_needs_improvement.unwrap_or(defaults.lcp.needs_improvement),
            ),
            cls: MetricThreshold::new(
                parsed.cls_good.unwrap_or(defaults.cls.good),
                parsed.cls_needs_improvement.unwrap_or(defaults.cls.needs_improvement),
            ),
            inp: MetricThreshold::new(
                parsed.inp_good.unwrap_or(defaults.inp.good),
                parsed.inp_needs_improvement.unwrap_or(defaults.inp.needs_improvement),
            ),
        };

        if [merged.lcp, merged.cls, merged.inp].iter().all(MetricThreshold::is_valid) {
            (merged, None)
        } else {
            warn("GOOD boundary must be non-negative and not above NEEDS_IMPROVEMENT".into())
        }
    }

    /// True when any reported metric is poor or needs improvement.
    pub fn flags_poor_experience(&self, signal: &CwvSignal) -> bool {
        match *signal {
            CwvSignal::Categorical {
                overall,
                lcp,
                cls,
                inp,
            } => [overall, lcp, cls, inp]
                .into_iter()
                .flatten()
                .any(|score| !score.is_good()),
            CwvSignal::Percentile { lcp, cls, inp } => [
                (lcp, self.lcp),
                (cls, self.cls),
                (inp, self.inp),
            ]
            .into_iter()
            .filter_map(|(value, threshold)| value.filter(|v| v.is_finite()).map(|v| threshold.classify(v)))
            .any(|score| !score.is_good()),
            CwvSignal::Absent => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdConfig {
    pub paid_data_threshold: u64,
    pub cwv: CwvThresholds,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            paid_data_threshold: DEFAULT_PAID_DATA_THRESHOLD,
            cwv: CwvThresholds::default(),
        }
    }
}

impl ThresholdConfig {
    pub fn paid_threshold_from_setting(raw: Option<&str>) -> (u64, Option<ConfigWarning>) {
        let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
            return (DEFAULT_PAID_DATA_THRESHOLD, None);
        };
        match raw.parse::<u64>() {
            Ok(value) => (value, None),
            Err(err) => (
                DEFAULT_PAID_DATA_THRESHOLD,
                Some(ConfigWarning::new(
                    PAID_DATA_THRESHOLD_SETTING,
                    format!("{raw:?}: {err}"),
                )),
            ),
        }
    }

    /// Build the config from raw settings; never fails, returns any fallbacks taken.
    pub fn from_settings(
        paid_data_threshold: Option<&str>,
        cwv_thresholds: Option<&JsonValue>,
    ) -> (Self, Vec<ConfigWarning>) {
        let (paid_data_threshold, paid_warning) = Self::paid_threshold_from_setting(paid_data_threshold);
        let (cwv, cwv_warning) = CwvThresholds::from_setting(cwv_thresholds);
        let warnings = paid_warning.into_iter().chain(cwv_warning).collect();
        (
            Self {
                paid_data_threshold,
                cwv,
            },
            warnings,
        )
    }
}
