use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::error::SrmaResult;
use crate::logic::access::AccessControl;
use crate::model::{
    canonical_order, float_cell, int_cell, ContinuousOutcome, FieldValue, FormField, Id,
    NumericalOutcome, Study, UserContext,
};
use crate::store::traits::Store;

pub const STATIC_DATASET: &str = "static_fields";

const STUDY_COLUMNS: [&str; 4] = ["Study ID", "Title", "Author", "Year"];
const DICHOTOMOUS_COLUMNS: [&str; 4] = [
    "Events Intervention",
    "Total Intervention",
    "Events Control",
    "Total Control",
];
const CONTINUOUS_COLUMNS: [&str; 6] = [
    "Mean Intervention",
    "SD Intervention",
    "N Intervention",
    "Mean Control",
    "SD Control",
    "N Control",
];

/// A named table ready for an external encoder
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dataset {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportBundle {
    pub project_id: Id,
    pub datasets: Vec<Dataset>,
}

impl ExportBundle {
    pub fn dataset(&self, name: &str) -> Option<&Dataset> {
        self.datasets.iter().find(|d| d.name == name)
    }
}

pub struct ExportFlattener;

impl ExportFlattener {
    pub async fn export<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
    ) -> SrmaResult<ExportBundle> {
        AccessControl::require_project(store, project_id).await?;
        AccessControl::require_member(store, ctx, project_id).await?;

        let fields = canonical_order(store.list_fields(project_id).await?);
        let mut studies = store.list_studies(project_id).await?;
        studies.sort_by_key(|s| s.id);
        let values: HashMap<(Id, Id), String> = store
            .list_values_for_project(project_id)
            .await?
            .into_iter()
            .filter_map(|v| v.value.map(|raw| ((v.study_id, v.field_id), raw)))
            .collect();
        let numerical = store.list_numerical_outcomes_for_project(project_id).await?;
        let continuous = store.list_continuous_outcomes_for_project(project_id).await?;

        let mut datasets = vec![static_dataset(&fields, &studies, &values)];
        datasets.extend(outcome_datasets(
            "dichotomous",
            &DICHOTOMOUS_COLUMNS,
            &studies,
            &numerical,
            |r| &r.outcome_name,
            |r| r.study_id,
            numerical_cells,
        ));
        datasets.extend(outcome_datasets(
            "continuous",
            &CONTINUOUS_COLUMNS,
            &studies,
            &continuous,
            |r| &r.outcome_name,
            |r| r.study_id,
            continuous_cells,
        ));
        Ok(ExportBundle {
            project_id,
            datasets,
        })
    }
}

fn study_cells(study: &Study) -> Vec<String> {
    vec![
        study.id.to_string(),
        study.title.clone(),
        study.author.clone(),
        study.year.to_string(),
    ]
}

fn header(extra: impl IntoIterator<Item = String>) -> Vec<String> {
    STUDY_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(extra)
        .collect()
}

/// Columns for one field: a single column for scalars, one per sub-value
/// for composites
fn field_columns(field: &FormField) -> Vec<String> {
    let base = field.column_label();
    match field.field_type.sub_columns() {
        [] => vec![base],
        subs => subs.iter().map(|sub| format!("{} ({})", base, sub)).collect(),
    }
}

fn field_cells(field: &FormField, raw: Option<&String>) -> Vec<String> {
    let width = field.field_type.sub_columns().len().max(1);
    raw.and_then(|raw| FieldValue::decode(field.field_type, raw))
        .map(|value| value.cells())
        .filter(|cells| cells.len() == width)
        .unwrap_or_else(|| vec![String::new(); width])
}

/// One row per study, one column per field sub-value. Missing or stale
/// values become empty cells.
fn static_dataset(
    fields: &[FormField],
    studies: &[Study],
    values: &HashMap<(Id, Id), String>,
) -> Dataset {
    let columns = header(fields.iter().flat_map(field_columns));
    let rows = studies
        .iter()
        .map(|study| {
            let mut row = study_cells(study);
            for field in fields {
                row.extend(field_cells(field, values.get(&(study.id, field.id))));
            }
            row
        })
        .collect();
    Dataset {
        name: STATIC_DATASET.to_string(),
        columns,
        rows,
    }
}

fn numerical_cells(row: &NumericalOutcome) -> Vec<String> {
    vec![
        int_cell(row.events_intervention),
        int_cell(row.total_intervention),
        int_cell(row.events_control),
        int_cell(row.total_control),
    ]
}

fn continuous_cells(row: &ContinuousOutcome) -> Vec<String> {
    vec![
        float_cell(row.mean_intervention),
        float_cell(row.sd_intervention),
        int_cell(row.n_intervention),
        float_cell(row.mean_control),
        float_cell(row.sd_control),
        int_cell(row.n_control),
    ]
}

/// One table per distinct outcome name, with a row for each study that
/// recorded it. Studies appear in id order; a study with duplicate rows for
/// one name contributes its first.
fn outcome_datasets<T>(
    kind: &str,
    columns: &[&str],
    studies: &[Study],
    rows: &[T],
    name: impl Fn(&T) -> &String,
    study_id: impl Fn(&T) -> Id,
    cells: fn(&T) -> Vec<String>,
) -> Vec<Dataset> {
    let mut by_name: BTreeMap<&str, HashMap<Id, &T>> = BTreeMap::new();
    for row in rows {
        by_name
            .entry(name(row).as_str())
            .or_default()
            .entry(study_id(row))
            .or_insert(row);
    }

    by_name
        .into_iter()
        .map(|(outcome, per_study)| Dataset {
            name: format!("{}/{}", kind, outcome),
            columns: header(columns.iter().map(|c| c.to_string())),
            rows: studies
                .iter()
                .filter_map(|study| {
                    per_study.get(&study.id).map(|row| {
                        let mut cells_row = study_cells(study);
                        cells_row.extend(cells(row));
                        cells_row
                    })
                })
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::data_entry::{DataEntry, FormSubmission};
    use crate::logic::schema_ops::FormEditor;
    use crate::logic::test_support::project_with_roles;
    use crate::model::{AddFieldPayload, ChangeAction, FieldType, NewStudy};
    use crate::store::mem::MemoryStore;
    use crate::store::traits::{SchemaStore, StudyStore};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn add(section: &str, label: &str, field_type: FieldType) -> ChangeAction {
        ChangeAction::AddField(AddFieldPayload {
            section: section.to_string(),
            label: label.to_string(),
            field_type,
            required: false,
            help_text: None,
            options: None,
        })
    }

    #[tokio::test]
    async fn test_static_export_covers_every_study_and_sub_column() {
        let store = MemoryStore::new();
        let (project_id, owner, _) = project_with_roles(&store).await;
        for action in [
            add("Participants", "Age", FieldType::BaselineContinuous),
            add("Participants", "Events", FieldType::DichotomousOutcome),
            add("Identification", "Registration", FieldType::Text),
        ] {
            FormEditor::submit(&store, &owner, project_id, action, None)
                .await
                .unwrap();
        }
        let fields = store.list_fields(project_id).await.unwrap();
        let age = fields.iter().find(|f| f.label == "Age").unwrap().id;
        let registration = fields.iter().find(|f| f.label == "Registration").unwrap().id;

        let mut study_ids = Vec::new();
        for (title, year) in [("Trial A", 2020), ("Trial B", 2021)] {
            let study = store
                .create_study(
                    project_id,
                    NewStudy {
                        title: title.to_string(),
                        author: "Smith".to_string(),
                        year,
                    },
                    None,
                )
                .await
                .unwrap();
            study_ids.push(study.id);
        }
        DataEntry::submit_form(
            &store,
            &owner,
            project_id,
            study_ids[0],
            FormSubmission {
                values: BTreeMap::from([
                    (age, json!({"intervention": {"mean": 62.3, "sd": 10.1}})),
                    (registration, json!("NCT00000001")),
                ]),
                numerical_outcomes: Some(vec![serde_json::from_value(json!({
                    "outcome_name": "Mortality",
                    "events_intervention": 12,
                    "total_intervention": 200
                }))
                .unwrap()]),
                continuous_outcomes: Some(vec![serde_json::from_value(json!({
                    "outcome_name": "BMI",
                    "mean_intervention": 27.5,
                    "sd_intervention": "4.25",
                    "n_intervention": 200,
                    "mean_control": "n/a"
                }))
                .unwrap()]),
            },
        )
        .await
        .unwrap();

        let bundle = ExportFlattener::export(&store, &owner, project_id)
            .await
            .unwrap();
        let table = bundle.dataset(STATIC_DATASET).unwrap();
        assert_eq!(
            table.columns,
            vec![
                "Study ID",
                "Title",
                "Author",
                "Year",
                "Participants - Age (intervention mean)",
                "Participants - Age (intervention sd)",
                "Participants - Age (control mean)",
                "Participants - Age (control sd)",
                "Participants - Events (events)",
                "Participants - Events (total)",
                "Identification - Registration",
            ]
        );
        assert_eq!(table.rows.len(), 2);
        assert_eq!(
            table.rows[0][4..],
            ["62.3", "10.1", "", "", "", "", "NCT00000001"]
        );
        assert_eq!(table.rows[1][1], "Trial B");
        assert!(table.rows[1][4..].iter().all(|cell| cell.is_empty()));

        let mortality = bundle.dataset("dichotomous/Mortality").unwrap();
        assert_eq!(mortality.rows.len(), 1);
        assert_eq!(
            mortality.rows[0][4..],
            ["12", "200", "", ""]
        );

        let bmi = bundle.dataset("continuous/BMI").unwrap();
        assert_eq!(
            bmi.columns,
            vec![
                "Study ID",
                "Title",
                "Author",
                "Year",
                "Mean Intervention",
                "SD Intervention",
                "N Intervention",
                "Mean Control",
                "SD Control",
                "N Control",
            ]
        );
        assert_eq!(bmi.rows.len(), 1);
        assert_eq!(bmi.rows[0][1], "Trial A");
        assert_eq!(bmi.rows[0][4..], ["27.5", "4.25", "200", "", "", ""]);
        assert!(bundle.dataset("dichotomous/BMI").is_none());
    }
}
