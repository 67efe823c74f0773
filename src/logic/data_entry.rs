use std::collections::{BTreeMap, HashMap};

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SrmaError, SrmaResult};
use crate::logic::access::AccessControl;
use crate::logic::outcome_registry::OutcomeRegistry;
use crate::model::{
    group_into_sections, ContinuousOutcome, ContinuousOutcomeInput, EffectiveRole, FieldValue,
    FormField, Id, NumericalOutcome, NumericalOutcomeInput, OutcomeType, OutcomeWrite, Study,
    StudyValue, UserContext,
};
use crate::store::traits::{Store, StudyDataCommit};

/// Pseudo-section carrying dichotomous outcome rows
pub const NUMERICAL_OUTCOMES_SECTION: &str = "numerical_outcomes";
/// Pseudo-section carrying continuous outcome rows
pub const CONTINUOUS_OUTCOMES_SECTION: &str = "continuous_outcomes";

/// One section's worth of input. For the outcome pseudo-sections only the
/// matching row list is read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SectionSave {
    pub section: String,
    /// Field id -> submitted value
    #[serde(default)]
    pub values: BTreeMap<Id, Value>,
    #[serde(default)]
    pub numerical_outcomes: Vec<NumericalOutcomeInput>,
    #[serde(default)]
    pub continuous_outcomes: Vec<ContinuousOutcomeInput>,
}

/// Whole-form submission: every field plus both outcome tables. An absent
/// outcome table leaves the stored rows alone; an empty one is a real write.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormSubmission {
    #[serde(default)]
    pub values: BTreeMap<Id, Value>,
    #[serde(default)]
    pub numerical_outcomes: Option<Vec<NumericalOutcomeInput>>,
    #[serde(default)]
    pub continuous_outcomes: Option<Vec<ContinuousOutcomeInput>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldEntry {
    pub field: FormField,
    pub value: Option<FieldValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionEntries {
    pub name: String,
    pub section_order: Option<i32>,
    pub fields: Vec<FieldEntry>,
}

/// Everything recorded for one study, decoded under the current schema
#[derive(Debug, Clone, Serialize)]
pub struct StudyData {
    pub study: Study,
    pub sections: Vec<SectionEntries>,
    pub numerical_outcomes: Vec<NumericalOutcome>,
    pub continuous_outcomes: Vec<ContinuousOutcome>,
}

pub struct DataEntry;

impl DataEntry {
    async fn load_study<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
        study_id: Id,
    ) -> SrmaResult<(EffectiveRole, Study)> {
        AccessControl::require_project(store, project_id).await?;
        let role = AccessControl::require_member(store, ctx, project_id).await?;
        let study = store
            .get_study(study_id)
            .await?
            .filter(|s| s.project_id == project_id)
            .ok_or_else(|| SrmaError::not_found(format!("study {}", study_id)))?;
        Ok((role, study))
    }

    async fn registry<S: Store>(store: &S, project_id: Id) -> SrmaResult<OutcomeRegistry> {
        Ok(OutcomeRegistry::new(
            project_id,
            store.list_outcomes(project_id).await?,
        ))
    }

    pub async fn get_study_data<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
        study_id: Id,
    ) -> SrmaResult<StudyData> {
        let (_, study) = Self::load_study(store, ctx, project_id, study_id).await?;
        let fields = store.list_fields(project_id).await?;
        let stored: HashMap<Id, Option<String>> = store
            .list_values(study_id)
            .await?
            .into_iter()
            .map(|v| (v.field_id, v.value))
            .collect();

        let sections = group_into_sections(fields)
            .into_iter()
            .map(|section| SectionEntries {
                name: section.name,
                section_order: section.section_order,
                fields: section
                    .fields
                    .into_iter()
                    .map(|field| {
                        let value = stored
                            .get(&field.id)
                            .and_then(|raw| raw.as_deref())
                            .and_then(|raw| FieldValue::decode(field.field_type, raw));
                        FieldEntry { field, value }
                    })
                    .collect(),
            })
            .collect();

        Ok(StudyData {
            study,
            sections,
            numerical_outcomes: store.list_numerical_outcomes(study_id).await?,
            continuous_outcomes: store.list_continuous_outcomes(study_id).await?,
        })
    }

    /// Incremental save of one section or one outcome pseudo-section
    pub async fn save_section<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
        study_id: Id,
        save: SectionSave,
    ) -> SrmaResult<()> {
        let (role, study) = Self::load_study(store, ctx, project_id, study_id).await?;
        let mut commit = StudyDataCommit {
            study_id: study.id,
            ..Default::default()
        };
        let section = save.section.trim();

        match section {
            NUMERICAL_OUTCOMES_SECTION => {
                let registry = Self::registry(store, project_id).await?;
                commit.numerical =
                    numerical_write(role, &registry, study.id, save.numerical_outcomes)?;
            }
            CONTINUOUS_OUTCOMES_SECTION => {
                let registry = Self::registry(store, project_id).await?;
                commit.continuous =
                    continuous_write(role, &registry, study.id, save.continuous_outcomes)?;
            }
            _ => {
                let fields = store.list_fields(project_id).await?;
                if !fields.iter().any(|f| f.section == section) {
                    return Err(SrmaError::not_found(format!("section '{}'", section)));
                }
                commit.values = field_values(&fields, study.id, save.values, Some(section))?;
            }
        }

        store.commit_study_data(commit).await?;
        info!(
            "Study {}: section '{}' saved by {}",
            study.id,
            section,
            ctx.label()
        );
        Ok(())
    }

    /// Full-form submit: all field values and both outcome tables in one
    /// commit
    pub async fn submit_form<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
        study_id: Id,
        submission: FormSubmission,
    ) -> SrmaResult<()> {
        let (role, study) = Self::load_study(store, ctx, project_id, study_id).await?;
        let fields = store.list_fields(project_id).await?;
        let registry = Self::registry(store, project_id).await?;

        let numerical = match submission.numerical_outcomes {
            Some(rows) => numerical_write(role, &registry, study.id, rows)?,
            None => OutcomeWrite::Untouched,
        };
        let continuous = match submission.continuous_outcomes {
            Some(rows) => continuous_write(role, &registry, study.id, rows)?,
            None => OutcomeWrite::Untouched,
        };
        let commit = StudyDataCommit {
            study_id: study.id,
            values: field_values(&fields, study.id, submission.values, None)?,
            numerical,
            continuous,
        };
        store.commit_study_data(commit).await?;
        info!("Study {}: form submitted by {}", study.id, ctx.label());
        Ok(())
    }
}

/// Typed values for the submitted fields. Every field must belong to the
/// project, and to `section` when one is given.
fn field_values(
    fields: &[FormField],
    study_id: Id,
    submitted: BTreeMap<Id, Value>,
    section: Option<&str>,
) -> SrmaResult<Vec<StudyValue>> {
    let by_id: HashMap<Id, &FormField> = fields.iter().map(|f| (f.id, f)).collect();
    submitted
        .into_iter()
        .map(|(field_id, input)| {
            let field = by_id
                .get(&field_id)
                .filter(|f| section.map(|s| f.section == s).unwrap_or(true))
                .ok_or_else(|| {
                    SrmaError::validation(match section {
                        Some(s) => format!("field {} is not part of section '{}'", field_id, s),
                        None => format!("field {} is not part of this project's form", field_id),
                    })
                })?;
            Ok(StudyValue {
                study_id,
                field_id,
                value: FieldValue::from_input(field.field_type, &input).map(|v| v.encode()),
            })
        })
        .collect()
}

/// Owners and admins replace every row; members upsert by name and may only
/// use names registered with the matching type.
fn outcome_write<T>(
    role: EffectiveRole,
    registry: &OutcomeRegistry,
    outcome_type: OutcomeType,
    rows: Vec<T>,
    name: fn(&T) -> &str,
) -> SrmaResult<OutcomeWrite<T>> {
    let rows: Vec<T> = rows.into_iter().filter(|r| !name(r).is_empty()).collect();
    if role.is_owner() {
        return Ok(OutcomeWrite::ReplaceAll(rows));
    }
    if let Some(row) = rows
        .iter()
        .find(|r| !registry.allows(name(r), outcome_type))
    {
        return Err(SrmaError::forbidden(format!(
            "{} outcome '{}' is not in the project's outcome registry",
            outcome_type,
            name(row)
        )));
    }
    Ok(OutcomeWrite::UpsertByName(rows))
}

fn numerical_name(row: &NumericalOutcome) -> &str {
    &row.outcome_name
}

fn continuous_name(row: &ContinuousOutcome) -> &str {
    &row.outcome_name
}

fn numerical_write(
    role: EffectiveRole,
    registry: &OutcomeRegistry,
    study_id: Id,
    rows: Vec<NumericalOutcomeInput>,
) -> SrmaResult<OutcomeWrite<NumericalOutcome>> {
    let rows: Vec<NumericalOutcome> = rows.into_iter().map(|r| r.into_row(study_id)).collect();
    outcome_write(role, registry, OutcomeType::Dichotomous, rows, numerical_name)
}

fn continuous_write(
    role: EffectiveRole,
    registry: &OutcomeRegistry,
    study_id: Id,
    rows: Vec<ContinuousOutcomeInput>,
) -> SrmaResult<OutcomeWrite<ContinuousOutcome>> {
    let rows: Vec<ContinuousOutcome> = rows.into_iter().map(|r| r.into_row(study_id)).collect();
    outcome_write(role, registry, OutcomeType::Continuous, rows, continuous_name)
}
