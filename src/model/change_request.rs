use crate::model::{Direction, FieldOptions, FieldType, Id, OutcomeType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeRequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl ChangeRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeRequestStatus::Pending => "pending",
            ChangeRequestStatus::Approved => "approved",
            ChangeRequestStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChangeRequestStatus::Pending)
    }
}

impl fmt::Display for ChangeRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeRequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ChangeRequestStatus::Pending),
            "approved" => Ok(ChangeRequestStatus::Approved),
            "rejected" => Ok(ChangeRequestStatus::Rejected),
            other => Err(format!("Unknown change request status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddFieldPayload {
    pub section: String,
    pub label: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub help_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<FieldOptions>,
}

/// Subset of field attributes to change. Absent keys are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    /// An empty string clears the help text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<FieldOptions>,
}

impl FieldChanges {
    pub fn is_empty(&self) -> bool {
        self == &FieldChanges::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditFieldPayload {
    pub field_id: Id,
    pub changes: FieldChanges,
}

/// Outcome reference by id, falling back to a case-insensitive name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A schema or outcome-registry mutation. The payload carries exactly the
/// parameters of the direct mutation so approval can re-dispatch it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", content = "payload", rename_all = "snake_case")]
pub enum ChangeAction {
    AddField(AddFieldPayload),
    EditField(EditFieldPayload),
    DeleteField { field_id: Id },
    AddOutcome { name: String, outcome_type: OutcomeType },
    DeleteOutcome(OutcomeRef),
    ReorderField { field_id: Id, direction: Direction },
    ReorderSection { section: String, direction: Direction },
}

impl ChangeAction {
    pub fn action_type(&self) -> &'static str {
        match self {
            ChangeAction::AddField(_) => "add_field",
            ChangeAction::EditField(_) => "edit_field",
            ChangeAction::DeleteField { .. } => "delete_field",
            ChangeAction::AddOutcome { .. } => "add_outcome",
            ChangeAction::DeleteOutcome(_) => "delete_outcome",
            ChangeAction::ReorderField { .. } => "reorder_field",
            ChangeAction::ReorderSection { .. } => "reorder_section",
        }
    }

    /// Payload as stored next to `action_type`
    pub fn payload(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Rebuild an action from its stored `action_type` and payload
    pub fn from_parts(action_type: &str, payload: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "action_type": action_type,
            "payload": payload,
        }))
    }

    /// Short human-readable summary for logs and listings
    pub fn describe(&self) -> String {
        match self {
            ChangeAction::AddField(p) => {
                format!("add field '{}' ({}) to section '{}'", p.label, p.field_type, p.section)
            }
            ChangeAction::EditField(p) => format!("edit field {}", p.field_id),
            ChangeAction::DeleteField { field_id } => format!("delete field {}", field_id),
            ChangeAction::AddOutcome { name, outcome_type } => {
                format!("add {} outcome '{}'", outcome_type, name)
            }
            ChangeAction::DeleteOutcome(r) => match (&r.outcome_id, &r.name) {
                (Some(id), _) => format!("delete outcome {}", id),
                (None, Some(name)) => format!("delete outcome '{}'", name),
                (None, None) => "delete outcome".to_string(),
            },
            ChangeAction::ReorderField { field_id, direction } => {
                format!("move field {} {}", field_id, direction)
            }
            ChangeAction::ReorderSection { section, direction } => {
                format!("move section '{}' {}", section, direction)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: Id,
    pub project_id: Id,
    pub requested_by: Id,
    pub status: ChangeRequestStatus,
    #[serde(flatten)]
    pub action: ChangeAction,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reviewed_by: Option<Id>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChangeRequest {
    pub project_id: Id,
    pub requested_by: Id,
    pub action: ChangeAction,
    pub reason: Option<String>,
}

/// Terminal transition recorded by a reviewer. Stores apply it only while
/// the request is still pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequestResolution {
    pub request_id: Id,
    pub status: ChangeRequestStatus,
    pub reviewed_by: Id,
    pub reviewed_at: DateTime<Utc>,
    pub resolution_notes: Option<String>,
}

impl ChangeRequestResolution {
    pub fn new(
        request_id: Id,
        status: ChangeRequestStatus,
        reviewed_by: Id,
        resolution_notes: Option<String>,
    ) -> Self {
        Self {
            request_id,
            status,
            reviewed_by,
            reviewed_at: Utc::now(),
            resolution_notes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_edit_payload_keeps_only_provided_keys() {
        let action = ChangeAction::EditField(EditFieldPayload {
            field_id: 4,
            changes: FieldChanges {
                label: Some("Age (years)".to_string()),
                ..Default::default()
            },
        });
        assert_eq!(action.action_type(), "edit_field");
        assert_eq!(
            action.payload(),
            json!({"field_id": 4, "changes": {"label": "Age (years)"}})
        );
    }

    #[test]
    fn test_action_from_stored_parts() {
        let action = ChangeAction::from_parts(
            "reorder_section",
            json!({"section": "Participants", "direction": "up"}),
        )
        .unwrap();
        assert_eq!(
            action,
            ChangeAction::ReorderSection {
                section: "Participants".to_string(),
                direction: Direction::Up,
            }
        );

        let delete = ChangeAction::from_parts("delete_outcome", json!({"name": "Mortality"})).unwrap();
        assert_eq!(
            delete,
            ChangeAction::DeleteOutcome(OutcomeRef {
                outcome_id: None,
                name: Some("Mortality".to_string()),
            })
        );

        assert!(ChangeAction::from_parts("rename_project", json!({})).is_err());
    }

    #[test]
    fn test_add_field_payload_defaults() {
        let action = ChangeAction::from_parts(
            "add_field",
            json!({"section": "Design", "label": "Blinding", "field_type": "select",
                   "options": {"choices": ["Open", "Single", "Double"]}}),
        )
        .unwrap();
        match action {
            ChangeAction::AddField(p) => {
                assert!(!p.required);
                assert_eq!(p.help_text, None);
                assert_eq!(p.options.unwrap().choices.unwrap().len(), 3);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }
}
