use crate::model::{FieldType, Id};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stored row: one serialized value per (study, field)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyValue {
    pub study_id: Id,
    pub field_id: Id,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DichotomousValue {
    pub events: Option<i64>,
    pub total: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MeanSd {
    pub mean: Option<f64>,
    pub sd: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Percent {
    pub percent: Option<f64>,
}

/// Intervention/control pair used by the baseline field types
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupPair<T> {
    pub intervention: T,
    pub control: T,
}

/// Typed value of one field for one study. The variant follows the field
/// type; the encoded form is what lands in `StudyValue::value`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Scalar(String),
    Dichotomous(DichotomousValue),
    BaselineContinuous(GroupPair<MeanSd>),
    BaselineCategorical(GroupPair<Percent>),
}

impl FieldValue {
    /// Build a value from submitted input. Malformed numbers become null and
    /// a composite with no sub-value present yields `None`.
    pub fn from_input(field_type: FieldType, input: &Value) -> Option<FieldValue> {
        match field_type {
            FieldType::DichotomousOutcome => {
                let value = DichotomousValue {
                    events: coerce_i64(&input["events"]),
                    total: coerce_i64(&input["total"]),
                };
                (value.events.is_some() || value.total.is_some())
                    .then_some(FieldValue::Dichotomous(value))
            }
            FieldType::BaselineContinuous => {
                let group = |name: &str| MeanSd {
                    mean: coerce_f64(&input[name]["mean"]),
                    sd: coerce_f64(&input[name]["sd"]),
                };
                let pair = GroupPair {
                    intervention: group("intervention"),
                    control: group("control"),
                };
                let any = [pair.intervention, pair.control]
                    .iter()
                    .any(|g| g.mean.is_some() || g.sd.is_some());
                any.then_some(FieldValue::BaselineContinuous(pair))
            }
            FieldType::BaselineCategorical => {
                let group = |name: &str| Percent {
                    percent: coerce_f64(&input[name]["percent"]),
                };
                let pair = GroupPair {
                    intervention: group("intervention"),
                    control: group("control"),
                };
                (pair.intervention.percent.is_some() || pair.control.percent.is_some())
                    .then_some(FieldValue::BaselineCategorical(pair))
            }
            _ => scalar_input(input).map(FieldValue::Scalar),
        }
    }

    /// Serialized form for storage
    pub fn encode(&self) -> String {
        match self {
            FieldValue::Scalar(raw) => raw.clone(),
            FieldValue::Dichotomous(v) => json_string(v),
            FieldValue::BaselineContinuous(v) => json_string(v),
            FieldValue::BaselineCategorical(v) => json_string(v),
        }
    }

    /// Decode a stored value under the field's current type. Values written
    /// under a previous type that no longer parse come back as `None`.
    pub fn decode(field_type: FieldType, raw: &str) -> Option<FieldValue> {
        match field_type {
            FieldType::DichotomousOutcome => serde_json::from_str(raw)
                .ok()
                .map(FieldValue::Dichotomous),
            FieldType::BaselineContinuous => serde_json::from_str(raw)
                .ok()
                .map(FieldValue::BaselineContinuous),
            FieldType::BaselineCategorical => serde_json::from_str(raw)
                .ok()
                .map(FieldValue::BaselineCategorical),
            _ => Some(FieldValue::Scalar(raw.to_string())),
        }
    }

    /// Flatten into export cells matching `FieldType::sub_columns`
    pub fn cells(&self) -> Vec<String> {
        match self {
            FieldValue::Scalar(raw) => vec![raw.clone()],
            FieldValue::Dichotomous(v) => vec![int_cell(v.events), int_cell(v.total)],
            FieldValue::BaselineContinuous(v) => vec![
                float_cell(v.intervention.mean),
                float_cell(v.intervention.sd),
                float_cell(v.control.mean),
                float_cell(v.control.sd),
            ],
            FieldValue::BaselineCategorical(v) => vec![
                float_cell(v.intervention.percent),
                float_cell(v.control.percent),
            ],
        }
    }
}

fn json_string<T: Serialize>(value: &T) -> String {
    // plain structs of numbers and options always serialize
    serde_json::to_string(value).unwrap_or_default()
}

fn scalar_input(input: &Value) -> Option<String> {
    match input {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Best-effort float parse: numbers and numeric strings, anything else is null
pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

/// Best-effort integer parse: integral numbers and integer strings
pub fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

pub fn int_cell(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn float_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_continuous_round_trip() {
        let input = json!({"intervention": {"mean": "62.5"}});
        let value = FieldValue::from_input(FieldType::BaselineContinuous, &input).unwrap();
        let raw = value.encode();
        let decoded = FieldValue::decode(FieldType::BaselineContinuous, &raw).unwrap();

        assert_eq!(
            serde_json::to_value(&decoded).unwrap(),
            json!({
                "intervention": {"mean": 62.5, "sd": null},
                "control": {"mean": null, "sd": null}
            })
        );
    }

    #[test]
    fn test_all_null_composite_is_not_stored() {
        let input = json!({"intervention": {"mean": "", "sd": "abc"}, "control": {}});
        assert_eq!(FieldValue::from_input(FieldType::BaselineContinuous, &input), None);
        assert_eq!(
            FieldValue::from_input(FieldType::DichotomousOutcome, &json!({"events": null})),
            None
        );
        assert_eq!(
            FieldValue::from_input(FieldType::BaselineCategorical, &json!(null)),
            None
        );
    }

    #[test]
    fn test_malformed_numbers_coerce_to_null() {
        let input = json!({"events": "12", "total": "lots"});
        let value = FieldValue::from_input(FieldType::DichotomousOutcome, &input).unwrap();
        assert_eq!(
            value,
            FieldValue::Dichotomous(DichotomousValue {
                events: Some(12),
                total: None
            })
        );
        assert_eq!(coerce_i64(&json!(3.0)), Some(3));
        assert_eq!(coerce_i64(&json!(3.5)), None);
        assert_eq!(coerce_f64(&json!("NaN")), None);
    }

    #[test]
    fn test_scalar_values_trimmed_and_blank_is_null() {
        assert_eq!(
            FieldValue::from_input(FieldType::Text, &json!("  NCT01 ")),
            Some(FieldValue::Scalar("NCT01".to_string()))
        );
        assert_eq!(FieldValue::from_input(FieldType::Date, &json!("   ")), None);
        assert_eq!(
            FieldValue::from_input(FieldType::Integer, &json!(42)),
            Some(FieldValue::Scalar("42".to_string()))
        );
    }

    #[test]
    fn test_stale_type_decodes_to_none() {
        assert_eq!(FieldValue::decode(FieldType::BaselineCategorical, "free text"), None);
    }
}
