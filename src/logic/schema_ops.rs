use log::{debug, info};
use serde::Serialize;

use crate::error::{SrmaError, SrmaResult};
use crate::logic::access::AccessControl;
use crate::logic::change_requests::ChangeRequestWorkflow;
use crate::logic::ordering::WorkingSchema;
use crate::model::{
    ChangeAction, ChangeRequest, ChangeRequestResolution, EffectiveRole, FormSection, Id,
    OutcomeDefinition, UserContext,
};
use crate::store::traits::{SchemaCommitResult, Store};

/// How an action is replayed onto a working schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Owner/admin calling the mutation directly
    Direct,
    /// Owner approving a stored request; `add_outcome` tolerates duplicates
    Approval,
}

/// Result of a schema mutation request
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SchemaEditResult {
    Applied {
        action_type: String,
        sections: Vec<FormSection>,
        outcomes: Vec<OutcomeDefinition>,
    },
    PendingApproval {
        change_request: ChangeRequest,
    },
}

pub struct FormEditor;

impl FormEditor {
    /// Load the project's current form and registry as a working copy
    pub async fn load<S: Store>(store: &S, project_id: Id) -> SrmaResult<WorkingSchema> {
        let fields = store.list_fields(project_id).await?;
        let outcomes = store.list_outcomes(project_id).await?;
        Ok(WorkingSchema::new(project_id, fields, outcomes))
    }

    /// Replay one action onto the working copy
    pub fn apply_action(
        working: &mut WorkingSchema,
        action: &ChangeAction,
        mode: ApplyMode,
    ) -> SrmaResult<()> {
        match action {
            ChangeAction::AddField(payload) => {
                working.add_field(payload)?;
            }
            ChangeAction::EditField(payload) => {
                working.edit_field(payload.field_id, &payload.changes)?;
            }
            ChangeAction::DeleteField { field_id } => {
                working.delete_field(*field_id)?;
            }
            ChangeAction::AddOutcome { name, outcome_type } => {
                working.add_outcome(name, *outcome_type, mode == ApplyMode::Approval)?;
            }
            ChangeAction::DeleteOutcome(target) => {
                working.delete_outcome(target)?;
            }
            ChangeAction::ReorderField {
                field_id,
                direction,
            } => {
                working.move_field(*field_id, *direction)?;
            }
            ChangeAction::ReorderSection { section, direction } => {
                working.move_section(section, *direction)?;
            }
        }
        Ok(())
    }

    /// Single entry point for every schema mutation. Owners and admins
    /// apply directly, members file a change request, anyone else is
    /// refused.
    pub async fn submit<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
        action: ChangeAction,
        reason: Option<String>,
    ) -> SrmaResult<SchemaEditResult> {
        AccessControl::require_project(store, project_id).await?;
        let role = AccessControl::effective_role(store, ctx, project_id).await?;
        match role {
            EffectiveRole::Admin | EffectiveRole::Owner => {
                Self::apply_direct(store, ctx, project_id, &action).await?;
                Ok(SchemaEditResult::Applied {
                    action_type: action.action_type().to_string(),
                    sections: Self::sections(store, project_id).await?,
                    outcomes: store.list_outcomes(project_id).await?,
                })
            }
            EffectiveRole::Member => {
                // dry run so proposals against missing rows fail up front
                let mut working = Self::load(store, project_id).await?;
                Self::apply_action(&mut working, &action, ApplyMode::Approval)?;

                let request =
                    ChangeRequestWorkflow::create(store, ctx, project_id, action, reason).await?;
                Ok(SchemaEditResult::PendingApproval {
                    change_request: request,
                })
            }
            EffectiveRole::None => Err(SrmaError::forbidden(format!(
                "user {} has no role in project {}",
                ctx.user_id, project_id
            ))),
        }
    }

    async fn apply_direct<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
        action: &ChangeAction,
    ) -> SrmaResult<SchemaCommitResult> {
        let mut working = Self::load(store, project_id).await?;
        Self::apply_action(&mut working, action, ApplyMode::Direct)?;
        let result = Self::commit(store, working, None).await?;
        info!(
            "Project {}: {} applied by {}",
            project_id,
            action.describe(),
            ctx.label()
        );
        Ok(result)
    }

    /// Persist a working copy, optionally settling a change request in the
    /// same commit
    pub async fn commit<S: Store>(
        store: &S,
        working: WorkingSchema,
        resolution: Option<ChangeRequestResolution>,
    ) -> SrmaResult<SchemaCommitResult> {
        let mut commit = working.into_commit();
        commit.resolution = resolution;
        if commit.is_empty() {
            debug!("Schema commit for project {} is empty", commit.project_id);
            return Ok(SchemaCommitResult::default());
        }
        store
            .commit_schema(commit)
            .await
            .map_err(SrmaError::from)
    }

    /// The form grouped by section in canonical order
    pub async fn sections<S: Store>(store: &S, project_id: Id) -> SrmaResult<Vec<FormSection>> {
        let fields = store.list_fields(project_id).await?;
        Ok(crate::model::group_into_sections(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::test_support::project_with_roles;
    use crate::model::{
        AddFieldPayload, Direction, EditFieldPayload, FieldChanges, FieldType, NewUser,
        OutcomeType,
    };
    use crate::store::mem::MemoryStore;
    use crate::store::traits::{ChangeRequestStore, SchemaStore, UserStore};

    fn add_age() -> ChangeAction {
        ChangeAction::AddField(AddFieldPayload {
            section: "Participants".to_string(),
            label: "Age".to_string(),
            field_type: FieldType::BaselineContinuous,
            required: true,
            help_text: Some("Mean/SD by group".to_string()),
            options: None,
        })
    }

    #[tokio::test]
    async fn test_owner_applies_member_proposes() {
        let store = MemoryStore::new();
        let (project_id, owner, member) = project_with_roles(&store).await;

        let result = FormEditor::submit(&store, &owner, project_id, add_age(), None)
            .await
            .unwrap();
        assert!(matches!(result, SchemaEditResult::Applied { .. }));
        assert_eq!(store.list_fields(project_id).await.unwrap().len(), 1);

        let result = FormEditor::submit(
            &store,
            &member,
            project_id,
            ChangeAction::AddOutcome {
                name: "Mortality".to_string(),
                outcome_type: OutcomeType::Dichotomous,
            },
            Some("needed for the primary analysis".to_string()),
        )
        .await
        .unwrap();
        match result {
            SchemaEditResult::PendingApproval { change_request } => {
                assert_eq!(change_request.requested_by, member.user_id);
                assert_eq!(
                    change_request.reason.as_deref(),
                    Some("needed for the primary analysis")
                );
            }
            other => panic!("expected a pending request, got {:?}", other),
        }
        assert!(store.list_outcomes(project_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outsider_is_forbidden_and_nothing_is_stored() {
        let store = MemoryStore::new();
        let (project_id, _, _) = project_with_roles(&store).await;
        let outsider = store
            .create_user(NewUser {
                email: "outsider@example.com".to_string(),
                name: "Outsider".to_string(),
                is_admin: false,
            })
            .await
            .unwrap();
        let err = FormEditor::submit(
            &store,
            &UserContext::from(&outsider),
            project_id,
            add_age(),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SrmaError::Forbidden(_)));
        assert!(store.list_fields(project_id).await.unwrap().is_empty());
        assert!(store
            .list_change_requests(project_id, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_member_proposal_for_missing_field_is_rejected_early() {
        let store = MemoryStore::new();
        let (project_id, _, member) = project_with_roles(&store).await;
        let err = FormEditor::submit(
            &store,
            &member,
            project_id,
            ChangeAction::ReorderField {
                field_id: 404,
                direction: Direction::Up,
            },
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SrmaError::NotFound(_)));
        assert!(store
            .list_change_requests(project_id, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_direct_duplicate_outcome_fails_validation() {
        let store = MemoryStore::new();
        let (project_id, owner, _) = project_with_roles(&store).await;
        let add = |name: &str| ChangeAction::AddOutcome {
            name: name.to_string(),
            outcome_type: OutcomeType::Dichotomous,
        };
        FormEditor::submit(&store, &owner, project_id, add("mortality"), None)
            .await
            .unwrap();
        let err = FormEditor::submit(&store, &owner, project_id, add("Mortality"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SrmaError::Validation(_)));
        let outcomes = store.list_outcomes(project_id).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].name, "mortality");
    }

    #[tokio::test]
    async fn test_reorder_from_older_snapshot_keeps_concurrent_rename() {
        let store = MemoryStore::new();
        let (project_id, owner, _) = project_with_roles(&store).await;
        for label in ["A", "B"] {
            let action = ChangeAction::AddField(AddFieldPayload {
                section: "Design".to_string(),
                label: label.to_string(),
                field_type: FieldType::Text,
                required: false,
                help_text: None,
                options: None,
            });
            FormEditor::submit(&store, &owner, project_id, action, None)
                .await
                .unwrap();
        }
        let fields = store.list_fields(project_id).await.unwrap();
        let (a, b) = (fields[0].id, fields[1].id);

        // taken before the rename lands
        let mut older = FormEditor::load(&store, project_id).await.unwrap();

        let rename = ChangeAction::EditField(EditFieldPayload {
            field_id: a,
            changes: FieldChanges {
                label: Some("A (renamed)".to_string()),
                ..Default::default()
            },
        });
        FormEditor::submit(&store, &owner, project_id, rename, None)
            .await
            .unwrap();

        FormEditor::apply_action(
            &mut older,
            &ChangeAction::ReorderField {
                field_id: b,
                direction: Direction::Up,
            },
            ApplyMode::Direct,
        )
        .unwrap();
        FormEditor::commit(&store, older, None).await.unwrap();

        let fields = store.list_fields(project_id).await.unwrap();
        let labels: Vec<(&str, Option<i32>)> = fields
            .iter()
            .map(|f| (f.label.as_str(), f.sort_order))
            .collect();
        assert_eq!(labels, vec![("B", Some(1)), ("A (renamed)", Some(2))]);
    }
}
