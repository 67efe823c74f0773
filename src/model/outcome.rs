use crate::model::value::{coerce_f64, coerce_i64};
use crate::model::Id;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeType {
    Dichotomous,
    Continuous,
}

impl OutcomeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeType::Dichotomous => "dichotomous",
            OutcomeType::Continuous => "continuous",
        }
    }
}

impl Default for OutcomeType {
    fn default() -> Self {
        OutcomeType::Dichotomous
    }
}

impl fmt::Display for OutcomeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dichotomous" => Ok(OutcomeType::Dichotomous),
            "continuous" => Ok(OutcomeType::Continuous),
            other => Err(format!("Unknown outcome type '{}'", other)),
        }
    }
}

/// Project-level allow-list entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeDefinition {
    pub id: Id,
    pub project_id: Id,
    pub name: String,
    pub outcome_type: OutcomeType,
}

impl OutcomeDefinition {
    pub fn matches_name(&self, name: &str) -> bool {
        self.name.to_lowercase() == name.trim().to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutcomeDefinition {
    pub project_id: Id,
    pub name: String,
    pub outcome_type: OutcomeType,
}

/// Dichotomous outcome row recorded for a study
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericalOutcome {
    pub study_id: Id,
    pub outcome_name: String,
    pub events_intervention: Option<i64>,
    pub total_intervention: Option<i64>,
    pub events_control: Option<i64>,
    pub total_control: Option<i64>,
}

/// Continuous outcome row recorded for a study
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousOutcome {
    pub study_id: Id,
    pub outcome_name: String,
    pub mean_intervention: Option<f64>,
    pub sd_intervention: Option<f64>,
    pub n_intervention: Option<i64>,
    pub mean_control: Option<f64>,
    pub sd_control: Option<f64>,
    pub n_control: Option<i64>,
}

/// Submitted dichotomous row. Numbers arrive loosely typed from forms and
/// are coerced on conversion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericalOutcomeInput {
    #[serde(default)]
    pub outcome_name: String,
    #[serde(default)]
    pub events_intervention: Value,
    #[serde(default)]
    pub total_intervention: Value,
    #[serde(default)]
    pub events_control: Value,
    #[serde(default)]
    pub total_control: Value,
}

impl NumericalOutcomeInput {
    pub fn into_row(self, study_id: Id) -> NumericalOutcome {
        NumericalOutcome {
            study_id,
            outcome_name: self.outcome_name.trim().to_string(),
            events_intervention: coerce_i64(&self.events_intervention),
            total_intervention: coerce_i64(&self.total_intervention),
            events_control: coerce_i64(&self.events_control),
            total_control: coerce_i64(&self.total_control),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinuousOutcomeInput {
    #[serde(default)]
    pub outcome_name: String,
    #[serde(default)]
    pub mean_intervention: Value,
    #[serde(default)]
    pub sd_intervention: Value,
    #[serde(default)]
    pub n_intervention: Value,
    #[serde(default)]
    pub mean_control: Value,
    #[serde(default)]
    pub sd_control: Value,
    #[serde(default)]
    pub n_control: Value,
}

impl ContinuousOutcomeInput {
    pub fn into_row(self, study_id: Id) -> ContinuousOutcome {
        ContinuousOutcome {
            study_id,
            outcome_name: self.outcome_name.trim().to_string(),
            mean_intervention: coerce_f64(&self.mean_intervention),
            sd_intervention: coerce_f64(&self.sd_intervention),
            n_intervention: coerce_i64(&self.n_intervention),
            mean_control: coerce_f64(&self.mean_control),
            sd_control: coerce_f64(&self.sd_control),
            n_control: coerce_i64(&self.n_control),
        }
    }
}

/// How a save treats the outcome rows already recorded for a study
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeWrite<T> {
    /// Leave existing rows alone
    Untouched,
    /// Delete every existing row of the study, then insert these
    ReplaceAll(Vec<T>),
    /// Delete existing rows whose name equals a submitted name, then insert
    UpsertByName(Vec<T>),
}

impl<T> Default for OutcomeWrite<T> {
    fn default() -> Self {
        OutcomeWrite::Untouched
    }
}
