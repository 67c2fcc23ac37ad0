//! Scalar measurement results
//!
//! A sequence node may carry result specs. After a run each spec picks the
//! step result stored under its response tag and turns it into a
//! [`MeasurementResult`] checked against its limits.

use crate::action::ActionPayload;
use crate::executor::StepResult;
use crate::instruction::ResponseValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

const UNITLESS: &str = "unitless";
const NO_PREFIX: &str = "none";

/// How to turn one tagged response into a measurement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSpec {
    /// Tag of the response to evaluate.
    pub response_tag: String,
    /// Human readable measurement name.
    #[serde(default)]
    pub description: String,
    /// Base quantity, e.g. `voltage` or `unitless`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_quantity: Option<String>,
    /// Derived unit, e.g. `volt`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_quantity: Option<String>,
    /// Metric prefix of the derived unit, or `none`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_quantity_prefix: Option<String>,
    /// Lower limit; unbounded when absent.
    #[serde(default, alias = "min", skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    /// Upper limit; unbounded when absent.
    #[serde(default, alias = "max", skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    /// Nominal stimulus level.
    #[serde(default)]
    pub input_level: f64,
}

impl ResultSpec {
    /// Spec for `response_tag` with no limits.
    pub fn new(response_tag: &str, description: &str) -> Self {
        Self {
            response_tag: response_tag.to_string(),
            description: description.to_string(),
            ..Self::default()
        }
    }

    /// Set both limits.
    pub fn with_limits(mut self, minimum: Option<f64>, maximum: Option<f64>) -> Self {
        self.minimum = minimum;
        self.maximum = maximum;
        self
    }

    /// Set the quantity the measurement is expressed in.
    pub fn with_quantity(mut self, base: &str, derived: Option<&str>, prefix: Option<&str>) -> Self {
        self.base_quantity = Some(base.to_string());
        self.derived_quantity = derived.map(str::to_string);
        self.derived_quantity_prefix = prefix.map(str::to_string);
        self
    }

    /// True iff `value` lies within the limits. A missing limit is unbounded.
    pub fn within_limits(&self, value: f64) -> bool {
        self.minimum.map_or(true, |min| value >= min) && self.maximum.map_or(true, |max| value <= max)
    }
}

/// Physical quantity a measurement is expressed in.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quantities {
    /// Base quantity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_quantity: Option<String>,
    /// Derived unit; absent for unitless measurements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_quantity: Option<String>,
    /// Metric prefix; empty for `none`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_quantity_prefix: Option<String>,
}

impl Quantities {
    /// Unitless measurements have no derived quantity; the `none` prefix is
    /// stored as an empty string.
    fn from_spec(spec: &ResultSpec) -> Self {
        let unitless = spec.base_quantity.as_deref() == Some(UNITLESS);
        let (derived_quantity, derived_quantity_prefix) =
            match (&spec.derived_quantity, &spec.derived_quantity_prefix) {
                (Some(derived), Some(prefix)) if !unitless => {
                    let prefix = if prefix == NO_PREFIX { String::new() } else { prefix.clone() };
                    (Some(derived.clone()), Some(prefix))
                }
                _ => (None, None),
            };
        Self {
            base_quantity: spec.base_quantity.clone(),
            derived_quantity,
            derived_quantity_prefix,
        }
    }
}

/// One evaluated measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementResult {
    /// Fresh result id.
    pub id: String,
    /// Session of the run.
    pub session_id: String,
    /// Run that produced the measurement.
    pub run_id: String,
    /// Section short name.
    pub section: String,
    /// Action name.
    pub action: String,
    /// Always `scalar`
    #[serde(rename = "type")]
    pub kind: String,
    /// Measurement name.
    pub description: String,
    /// When the result was evaluated.
    pub timestamp: DateTime<Utc>,
    /// Quantity the value is expressed in.
    #[serde(flatten)]
    pub quantities: Quantities,
    /// Lower limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    /// Upper limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    /// Nominal stimulus level.
    pub input_level: f64,
    /// Response text as read.
    pub raw_value: String,
    /// Parsed value; `None` when the response is not numeric.
    pub measured_value: Option<f64>,
    /// Whether the value lies within the limits.
    pub passed: bool,
}

impl MeasurementResult {
    /// Evaluate `step`'s response against `spec`.
    pub fn evaluate(spec: &ResultSpec, payload: &ActionPayload, step: &StepResult) -> Self {
        let raw_value = step.raw_value.clone().unwrap_or_default();
        let measured_value = match &step.value {
            Some(ResponseValue::Number(n)) => Some(*n),
            Some(ResponseValue::Text(text)) => text.trim().parse().ok(),
            Some(_) => None,
            None => raw_value.trim().parse().ok(),
        }
        .filter(|v: &f64| v.is_finite());
        let passed = measured_value.is_some_and(|v| spec.within_limits(v));

        Self {
            id: Uuid::new_v4().to_string(),
            session_id: payload.session_id.clone(),
            run_id: payload.run_id.clone(),
            section: payload.section.clone(),
            action: payload.action.clone(),
            kind: "scalar".to_string(),
            description: spec.description.clone(),
            timestamp: Utc::now(),
            quantities: Quantities::from_spec(spec),
            minimum: spec.minimum,
            maximum: spec.maximum,
            input_level: spec.input_level,
            raw_value,
            measured_value,
            passed,
        }
    }
}

/// Evaluate every spec against the results of one run.
///
/// The latest successful step stored under a spec's tag is used; specs whose
/// tag was never produced are skipped with a warning.
pub fn build_results(
    specs: &[ResultSpec],
    payload: &ActionPayload,
    steps: &[StepResult],
) -> Vec<MeasurementResult> {
    specs
        .iter()
        .filter_map(|spec| {
            let step = steps.iter().rev().find(|step| {
                step.is_ok() && step.response_tag.as_deref() == Some(spec.response_tag.as_str())
            });
            match step {
                Some(step) => {
                    let result = MeasurementResult::evaluate(spec, payload, step);
                    info!(
                        description = %result.description,
                        measured = ?result.measured_value,
                        passed = result.passed,
                        "Measurement result"
                    );
                    Some(result)
                }
                None => {
                    warn!(tag = %spec.response_tag, "No response stored for result");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> ActionPayload {
        ActionPayload {
            session_id: "s-1".into(),
            run_id: "r-1".into(),
            section: "dcv".into(),
            action: "verify".into(),
        }
    }

    fn step(tag: &str, raw: &str) -> StepResult {
        let mut step = StepResult::new(0, "r-1", "command", Some("DMM1"));
        step.response_tag = Some(tag.into());
        step.raw_value = Some(raw.into());
        step
    }

    #[test]
    fn test_limits_decide_pass() {
        let spec = ResultSpec::new("volts", "10 V").with_limits(Some(9.99), Some(10.01));
        let pass = MeasurementResult::evaluate(&spec, &payload(), &step("volts", "10.004\n"));
        assert_eq!(pass.measured_value, Some(10.004));
        assert!(pass.passed);

        let fail = MeasurementResult::evaluate(&spec, &payload(), &step("volts", "10.02"));
        assert!(!fail.passed);
    }

    #[test]
    fn test_missing_limit_is_unbounded() {
        let spec = ResultSpec::new("volts", "").with_limits(Some(0.0), None);
        assert!(spec.within_limits(1e9));
        assert!(!spec.within_limits(-0.1));
        assert!(ResultSpec::new("x", "").within_limits(f64::MIN));
    }

    #[test]
    fn test_non_numeric_value_fails() {
        let spec = ResultSpec::new("idn", "identity");
        let result = MeasurementResult::evaluate(&spec, &payload(), &step("idn", "ACME,1"));
        assert_eq!(result.measured_value, None);
        assert!(!result.passed);
        assert_eq!(result.raw_value, "ACME,1");
    }

    #[test]
    fn test_unitless_drops_derived_quantity() {
        let unitless = ResultSpec::new("r", "").with_quantity("unitless", Some("volt"), Some("milli"));
        let q = Quantities::from_spec(&unitless);
        assert_eq!(q.derived_quantity, None);
        assert_eq!(q.derived_quantity_prefix, None);

        let volts = ResultSpec::new("r", "").with_quantity("voltage", Some("volt"), Some("none"));
        let q = Quantities::from_spec(&volts);
        assert_eq!(q.derived_quantity.as_deref(), Some("volt"));
        assert_eq!(q.derived_quantity_prefix.as_deref(), Some(""));
    }

    #[test]
    fn test_build_results_uses_latest_tagged_step() {
        let specs = vec![
            ResultSpec::new("volts", "DC").with_limits(Some(0.0), Some(1.0)),
            ResultSpec::new("never", "skipped"),
        ];
        let steps = vec![step("volts", "5"), step("volts", "0.5")];
        let results = build_results(&specs, &payload(), &steps);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].measured_value, Some(0.5));
        assert!(results[0].passed);

        let json = serde_json::to_value(&results[0]).unwrap();
        assert_eq!(json["type"], "scalar");
        assert_eq!(json["runId"], "r-1");
        assert_eq!(json["rawValue"], "0.5");
        assert_eq!(json["minimum"], 0.0);
    }

    #[test]
    fn test_spec_accepts_min_max_aliases() {
        let spec: ResultSpec = serde_json::from_str(
            r#"{ "responseTag": "v", "description": "d", "min": 1.5, "max": 2.5, "inputLevel": 2 }"#,
        )
        .unwrap();
        assert_eq!(spec.minimum, Some(1.5));
        assert_eq!(spec.maximum, Some(2.5));
        assert_eq!(spec.input_level, 2.0);
    }
}
