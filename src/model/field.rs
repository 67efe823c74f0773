use crate::model::{Id, UNORDERED_SECTION};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Textarea,
    Integer,
    Date,
    DichotomousOutcome,
    BaselineContinuous,
    BaselineCategorical,
    Select,
    SelectMember,
}

impl FieldType {
    pub const ALL: [FieldType; 9] = [
        FieldType::Text,
        FieldType::Textarea,
        FieldType::Integer,
        FieldType::Date,
        FieldType::DichotomousOutcome,
        FieldType::BaselineContinuous,
        FieldType::BaselineCategorical,
        FieldType::Select,
        FieldType::SelectMember,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Textarea => "textarea",
            FieldType::Integer => "integer",
            FieldType::Date => "date",
            FieldType::DichotomousOutcome => "dichotomous_outcome",
            FieldType::BaselineContinuous => "baseline_continuous",
            FieldType::BaselineCategorical => "baseline_categorical",
            FieldType::Select => "select",
            FieldType::SelectMember => "select_member",
        }
    }

    /// Composite types store a JSON payload with named sub-values
    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            FieldType::DichotomousOutcome
                | FieldType::BaselineContinuous
                | FieldType::BaselineCategorical
        )
    }

    /// Export sub-columns, in order. Scalar types have a single unnamed column.
    pub fn sub_columns(&self) -> &'static [&'static str] {
        match self {
            FieldType::DichotomousOutcome => &["events", "total"],
            FieldType::BaselineContinuous => &[
                "intervention mean",
                "intervention sd",
                "control mean",
                "control sd",
            ],
            FieldType::BaselineCategorical => &["intervention percent", "control percent"],
            _ => &[],
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unsupported field_type \"{}\"", s))
    }
}

/// Type-specific options. `select` uses `choices`, `select_member` uses
/// `roles`; both may offer a "not reported" entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_nr: Option<bool>,
}

/// Check that `options` fit `field_type`, returning the options worth storing.
pub fn validate_options(
    field_type: FieldType,
    options: Option<&FieldOptions>,
) -> Result<Option<FieldOptions>, String> {
    match field_type {
        FieldType::Select => {
            let options = options.ok_or("select requires an \"options\" object")?;
            match &options.choices {
                Some(choices) if !choices.is_empty() => {}
                _ => return Err("options.choices must be a non-empty list of strings".to_string()),
            }
            Ok(Some(FieldOptions {
                choices: options.choices.clone(),
                roles: None,
                include_nr: options.include_nr,
            }))
        }
        FieldType::SelectMember => Ok(options.map(|o| FieldOptions {
            choices: None,
            roles: o.roles.clone(),
            include_nr: o.include_nr,
        })),
        _ => Ok(None),
    }
}

/// One entry of a project's custom form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub id: Id,
    pub project_id: Id,
    pub section: String,
    /// Shared by every field of a section; `None` on legacy rows
    pub section_order: Option<i32>,
    pub label: String,
    pub field_type: FieldType,
    pub required: bool,
    /// Position inside the section; `None` on legacy rows
    pub sort_order: Option<i32>,
    pub help_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<FieldOptions>,
}

impl FormField {
    /// Same content apart from the two order columns
    pub fn same_attributes(&self, other: &FormField) -> bool {
        self.section == other.section
            && self.label == other.label
            && self.field_type == other.field_type
            && self.required == other.required
            && self.help_text == other.help_text
            && self.options == other.options
    }

    /// Position inside the section: the stored order, else creation sequence
    pub fn position_key(&self) -> (i64, Id) {
        (
            self.sort_order.map(i64::from).unwrap_or(self.id),
            self.id,
        )
    }

    pub fn section_key(&self) -> i64 {
        self.section_order.map(i64::from).unwrap_or(UNORDERED_SECTION)
    }

    /// Display/export order: section order, section name, position, id
    pub fn canonical_cmp(&self, other: &FormField) -> Ordering {
        self.section_key()
            .cmp(&other.section_key())
            .then_with(|| self.section.cmp(&other.section))
            .then_with(|| self.position_key().cmp(&other.position_key()))
    }

    /// Export column prefix, e.g. "Participants - Age"
    pub fn column_label(&self) -> String {
        format!("{} - {}", self.section, self.label)
    }
}

/// Field definition before the store assigns an id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFormField {
    pub project_id: Id,
    pub section: String,
    pub section_order: Option<i32>,
    pub label: String,
    pub field_type: FieldType,
    pub required: bool,
    pub sort_order: Option<i32>,
    pub help_text: Option<String>,
    pub options: Option<FieldOptions>,
}

impl NewFormField {
    pub fn with_id(self, id: Id) -> FormField {
        FormField {
            id,
            project_id: self.project_id,
            section: self.section,
            section_order: self.section_order,
            label: self.label,
            field_type: self.field_type,
            required: self.required,
            sort_order: self.sort_order,
            help_text: self.help_text,
            options: self.options,
        }
    }
}

impl From<FormField> for NewFormField {
    fn from(field: FormField) -> Self {
        Self {
            project_id: field.project_id,
            section: field.section,
            section_order: field.section_order,
            label: field.label,
            field_type: field.field_type,
            required: field.required,
            sort_order: field.sort_order,
            help_text: field.help_text,
            options: field.options,
        }
    }
}

/// A rendered section of the form, fields in canonical order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormSection {
    pub name: String,
    pub section_order: Option<i32>,
    pub fields: Vec<FormField>,
}

/// Sort fields canonically and group them by section name. A section whose
/// fields disagree on `section_order` is placed where its first field sorts.
pub fn group_into_sections(mut fields: Vec<FormField>) -> Vec<FormSection> {
    fields.sort_by(|a, b| a.canonical_cmp(b));

    let mut sections: Vec<FormSection> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for field in fields {
        match index.get(&field.section) {
            Some(&i) => sections[i].fields.push(field),
            None => {
                index.insert(field.section.clone(), sections.len());
                sections.push(FormSection {
                    name: field.section.clone(),
                    section_order: field.section_order,
                    fields: vec![field],
                });
            }
        }
    }
    sections
}

/// Sort a flat field list into canonical order
pub fn canonical_order(fields: Vec<FormField>) -> Vec<FormField> {
    group_into_sections(fields)
        .into_iter()
        .flat_map(|s| s.fields)
        .collect()
}
