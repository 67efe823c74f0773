use log::{info, warn};

use crate::error::{SrmaError, SrmaResult};
use crate::logic::access::AccessControl;
use crate::logic::schema_ops::{ApplyMode, FormEditor};
use crate::model::{
    non_blank, ChangeAction, ChangeRequest, ChangeRequestResolution, ChangeRequestStatus, Id,
    NewChangeRequest, UserContext,
};
use crate::store::traits::Store;

/// Pending -> approved | rejected. Settled requests never change again.
pub struct ChangeRequestWorkflow;

impl ChangeRequestWorkflow {
    /// File a pending request on behalf of `ctx`
    pub async fn create<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
        action: ChangeAction,
        reason: Option<String>,
    ) -> SrmaResult<ChangeRequest> {
        let description = action.describe();
        let request = store
            .create_change_request(NewChangeRequest {
                project_id,
                requested_by: ctx.user_id,
                action,
                reason: non_blank(reason.as_deref()),
            })
            .await?;
        info!(
            "Project {}: change request {} ({}) submitted by {}",
            project_id,
            request.id,
            description,
            ctx.label()
        );
        Ok(request)
    }

    /// Requests visible to `ctx`: everything for owners and admins, only
    /// their own for members. Oldest first.
    pub async fn list<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
        status: Option<ChangeRequestStatus>,
    ) -> SrmaResult<Vec<ChangeRequest>> {
        AccessControl::require_project(store, project_id).await?;
        let role = AccessControl::require_member(store, ctx, project_id).await?;
        let requests = store.list_change_requests(project_id, status).await?;
        if role.is_owner() {
            return Ok(requests);
        }
        Ok(requests
            .into_iter()
            .filter(|r| r.requested_by == ctx.user_id)
            .collect())
    }

    async fn load_pending<S: Store>(
        store: &S,
        project_id: Id,
        request_id: Id,
    ) -> SrmaResult<ChangeRequest> {
        let request = store
            .get_change_request(request_id)
            .await?
            .filter(|r| r.project_id == project_id)
            .ok_or_else(|| SrmaError::not_found(format!("change request {}", request_id)))?;
        if request.status.is_terminal() {
            return Err(SrmaError::conflict(format!(
                "change request {} is already {}",
                request_id, request.status
            )));
        }
        Ok(request)
    }

    /// Re-validate and apply the captured action, settling the request in
    /// the same commit. On failure the request stays pending.
    pub async fn approve<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
        request_id: Id,
        notes: Option<String>,
    ) -> SrmaResult<ChangeRequest> {
        AccessControl::require_project(store, project_id).await?;
        AccessControl::require_owner(store, ctx, project_id).await?;
        let request = Self::load_pending(store, project_id, request_id).await?;

        let mut working = FormEditor::load(store, project_id).await?;
        if let Err(err) = FormEditor::apply_action(&mut working, &request.action, ApplyMode::Approval)
        {
            warn!(
                "Project {}: change request {} ({}) could not be applied: {}",
                project_id,
                request_id,
                request.action.describe(),
                err
            );
            return Err(err);
        }

        let resolution = ChangeRequestResolution::new(
            request_id,
            ChangeRequestStatus::Approved,
            ctx.user_id,
            non_blank(notes.as_deref()),
        );
        let result = FormEditor::commit(store, working, Some(resolution)).await?;
        let approved = result.resolved_request.ok_or_else(|| {
            SrmaError::Storage(anyhow::anyhow!(
                "change request {} was not settled by its commit",
                request_id
            ))
        })?;
        info!(
            "Project {}: change request {} ({}) approved by {}",
            project_id,
            request_id,
            approved.action.describe(),
            ctx.label()
        );
        Ok(approved)
    }

    /// Settle the request as rejected without touching the schema
    pub async fn reject<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
        request_id: Id,
        notes: Option<String>,
    ) -> SrmaResult<ChangeRequest> {
        AccessControl::require_project(store, project_id).await?;
        AccessControl::require_owner(store, ctx, project_id).await?;
        Self::load_pending(store, project_id, request_id).await?;

        let resolution = ChangeRequestResolution::new(
            request_id,
            ChangeRequestStatus::Rejected,
            ctx.user_id,
            non_blank(notes.as_deref()),
        );
        let rejected = store
            .resolve_change_request(resolution)
            .await
            .map_err(SrmaError::from)?;
        info!(
            "Project {}: change request {} rejected by {}",
            project_id,
            request_id,
            ctx.label()
        );
        Ok(rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::schema_ops::SchemaEditResult;
    use crate::logic::test_support::project_with_roles;
    use crate::model::{
        AddFieldPayload, Direction, EditFieldPayload, FieldChanges, FieldType, FormField,
        OutcomeRef, OutcomeType,
    };
    use crate::store::mem::MemoryStore;
    use crate::store::traits::SchemaStore;

    fn add_field() -> ChangeAction {
        ChangeAction::AddField(AddFieldPayload {
            section: "Demographics".to_string(),
            label: "Age".to_string(),
            field_type: FieldType::BaselineContinuous,
            required: false,
            help_text: None,
            options: None,
        })
    }

    async fn propose(
        store: &MemoryStore,
        ctx: &UserContext,
        project_id: Id,
        action: ChangeAction,
    ) -> ChangeRequest {
        match FormEditor::submit(store, ctx, project_id, action, None)
            .await
            .unwrap()
        {
            SchemaEditResult::PendingApproval { change_request } => change_request,
            other => panic!("expected a pending request, got {:?}", other),
        }
    }

    fn strip_ids(fields: Vec<FormField>) -> Vec<FormField> {
        fields
            .into_iter()
            .map(|mut f| {
                f.id = 0;
                f.project_id = 0;
                f
            })
            .collect()
    }

    #[tokio::test]
    async fn test_approval_matches_direct_add() {
        let direct_store = MemoryStore::new();
        let (direct_project, direct_owner, _) = project_with_roles(&direct_store).await;
        FormEditor::submit(&direct_store, &direct_owner, direct_project, add_field(), None)
            .await
            .unwrap();

        let store = MemoryStore::new();
        let (project_id, owner, member) = project_with_roles(&store).await;
        let request = propose(&store, &member, project_id, add_field()).await;
        assert!(store.list_fields(project_id).await.unwrap().is_empty());

        let approved =
            ChangeRequestWorkflow::approve(&store, &owner, project_id, request.id, None)
                .await
                .unwrap();
        assert_eq!(approved.status, ChangeRequestStatus::Approved);
        assert_eq!(approved.reviewed_by, Some(owner.user_id));
        assert!(approved.reviewed_at.is_some());

        assert_eq!(
            strip_ids(store.list_fields(project_id).await.unwrap()),
            strip_ids(direct_store.list_fields(direct_project).await.unwrap())
        );
    }

    #[tokio::test]
    async fn test_rejection_changes_nothing() {
        let store = MemoryStore::new();
        let (project_id, owner, member) = project_with_roles(&store).await;
        let request = propose(&store, &member, project_id, add_field()).await;

        let rejected = ChangeRequestWorkflow::reject(
            &store,
            &owner,
            project_id,
            request.id,
            Some("not needed".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(rejected.status, ChangeRequestStatus::Rejected);
        assert_eq!(rejected.resolution_notes.as_deref(), Some("not needed"));
        assert!(store.list_fields(project_id).await.unwrap().is_empty());

        // settled requests are terminal
        let err = ChangeRequestWorkflow::approve(&store, &owner, project_id, request.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SrmaError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_edit_label_scenario() {
        let store = MemoryStore::new();
        let (project_id, owner, member) = project_with_roles(&store).await;
        FormEditor::submit(&store, &owner, project_id, add_field(), None)
            .await
            .unwrap();
        let age = store.list_fields(project_id).await.unwrap()[0].clone();

        let request = propose(
            &store,
            &member,
            project_id,
            ChangeAction::EditField(EditFieldPayload {
                field_id: age.id,
                changes: FieldChanges {
                    label: Some("Age (years)".to_string()),
                    ..Default::default()
                },
            }),
        )
        .await;
        assert_eq!(request.status, ChangeRequestStatus::Pending);
        assert_eq!(request.action.payload()["changes"]["label"], "Age (years)");
        assert_eq!(store.get_field(age.id).await.unwrap().unwrap().label, "Age");

        let approved =
            ChangeRequestWorkflow::approve(&store, &owner, project_id, request.id, None)
                .await
                .unwrap();
        assert_eq!(approved.status, ChangeRequestStatus::Approved);
        assert_eq!(approved.reviewed_by, Some(owner.user_id));
        assert_eq!(
            store.get_field(age.id).await.unwrap().unwrap().label,
            "Age (years)"
        );
    }

    #[tokio::test]
    async fn test_failed_approval_leaves_request_pending() {
        let store = MemoryStore::new();
        let (project_id, owner, member) = project_with_roles(&store).await;
        FormEditor::submit(&store, &owner, project_id, add_field(), None)
            .await
            .unwrap();
        let age = store.list_fields(project_id).await.unwrap()[0].clone();
        let request = propose(
            &store,
            &member,
            project_id,
            ChangeAction::DeleteField { field_id: age.id },
        )
        .await;

        // the owner deletes the field first
        FormEditor::submit(
            &store,
            &owner,
            project_id,
            ChangeAction::DeleteField { field_id: age.id },
            None,
        )
        .await
        .unwrap();

        let err = ChangeRequestWorkflow::approve(&store, &owner, project_id, request.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SrmaError::NotFound(_)));
        let pending = ChangeRequestWorkflow::list(
            &store,
            &owner,
            project_id,
            Some(ChangeRequestStatus::Pending),
        )
        .await
        .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, request.id);
    }

    #[tokio::test]
    async fn test_add_outcome_approval_is_idempotent() {
        let store = MemoryStore::new();
        let (project_id, owner, member) = project_with_roles(&store).await;
        let add = ChangeAction::AddOutcome {
            name: "Mortality".to_string(),
            outcome_type: OutcomeType::Dichotomous,
        };
        let request = propose(&store, &member, project_id, add.clone()).await;
        FormEditor::submit(&store, &owner, project_id, add, None)
            .await
            .unwrap();

        let approved =
            ChangeRequestWorkflow::approve(&store, &owner, project_id, request.id, None)
                .await
                .unwrap();
        assert_eq!(approved.status, ChangeRequestStatus::Approved);
        assert_eq!(store.list_outcomes(project_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_members_only_see_their_own_requests() {
        let store = MemoryStore::new();
        let (project_id, owner, member) = project_with_roles(&store).await;
        propose(&store, &member, project_id, add_field()).await;
        ChangeRequestWorkflow::create(&store, &owner, project_id, add_field(), None)
            .await
            .unwrap();

        let mine = ChangeRequestWorkflow::list(&store, &member, project_id, None)
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].requested_by, member.user_id);
        let all = ChangeRequestWorkflow::list(&store, &owner, project_id, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        assert!(matches!(
            ChangeRequestWorkflow::reject(&store, &member, project_id, all[0].id, None).await,
            Err(SrmaError::Forbidden(_))
        ));
    }

    fn field(section: &str, label: &str) -> ChangeAction {
        ChangeAction::AddField(AddFieldPayload {
            section: section.to_string(),
            label: label.to_string(),
            field_type: FieldType::Text,
            required: false,
            help_text: None,
            options: None,
        })
    }

    async fn layout(store: &MemoryStore, project_id: Id) -> Vec<(String, Vec<String>)> {
        FormEditor::sections(store, project_id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| (s.name, s.fields.into_iter().map(|f| f.label).collect()))
            .collect()
    }

    #[tokio::test]
    async fn test_reorder_approvals_move_fields_and_sections() {
        let store = MemoryStore::new();
        let (project_id, owner, member) = project_with_roles(&store).await;
        for action in [
            field("Demographics", "Age"),
            field("Demographics", "Sex"),
            field("Design", "Allocation"),
        ] {
            FormEditor::submit(&store, &owner, project_id, action, None)
                .await
                .unwrap();
        }
        let sex = store
            .list_fields(project_id)
            .await
            .unwrap()
            .into_iter()
            .find(|f| f.label == "Sex")
            .unwrap();

        let request = propose(
            &store,
            &member,
            project_id,
            ChangeAction::ReorderField {
                field_id: sex.id,
                direction: Direction::Up,
            },
        )
        .await;
        ChangeRequestWorkflow::approve(&store, &owner, project_id, request.id, None)
            .await
            .unwrap();
        assert_eq!(
            layout(&store, project_id).await,
            vec![
                (
                    "Demographics".to_string(),
                    vec!["Sex".to_string(), "Age".to_string()]
                ),
                ("Design".to_string(), vec!["Allocation".to_string()]),
            ]
        );

        let request = propose(
            &store,
            &member,
            project_id,
            ChangeAction::ReorderSection {
                section: "Design".to_string(),
                direction: Direction::Up,
            },
        )
        .await;
        let approved =
            ChangeRequestWorkflow::approve(&store, &owner, project_id, request.id, None)
                .await
                .unwrap();
        assert_eq!(approved.status, ChangeRequestStatus::Approved);
        let sections = FormEditor::sections(&store, project_id).await.unwrap();
        let order: Vec<(&str, Option<i32>)> = sections
            .iter()
            .map(|s| (s.name.as_str(), s.section_order))
            .collect();
        assert_eq!(order, vec![("Design", Some(1)), ("Demographics", Some(2))]);
    }

    #[tokio::test]
    async fn test_delete_outcome_approval_by_id_and_by_name() {
        let store = MemoryStore::new();
        let (project_id, owner, member) = project_with_roles(&store).await;
        for (name, outcome_type) in [
            ("Mortality", OutcomeType::Dichotomous),
            ("BMI", OutcomeType::Continuous),
        ] {
            let action = ChangeAction::AddOutcome {
                name: name.to_string(),
                outcome_type,
            };
            FormEditor::submit(&store, &owner, project_id, action, None)
                .await
                .unwrap();
        }
        let mortality = store
            .list_outcomes(project_id)
            .await
            .unwrap()
            .into_iter()
            .find(|o| o.name == "Mortality")
            .unwrap();

        let by_id = propose(
            &store,
            &member,
            project_id,
            ChangeAction::DeleteOutcome(OutcomeRef {
                outcome_id: Some(mortality.id),
                name: None,
            }),
        )
        .await;
        ChangeRequestWorkflow::approve(&store, &owner, project_id, by_id.id, None)
            .await
            .unwrap();
        let names: Vec<String> = store
            .list_outcomes(project_id)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(names, vec!["BMI".to_string()]);

        let by_name = propose(
            &store,
            &member,
            project_id,
            ChangeAction::DeleteOutcome(OutcomeRef {
                outcome_id: None,
                name: Some("bmi".to_string()),
            }),
        )
        .await;
        let approved =
            ChangeRequestWorkflow::approve(&store, &owner, project_id, by_name.id, None)
                .await
                .unwrap();
        assert_eq!(approved.status, ChangeRequestStatus::Approved);
        assert!(store.list_outcomes(project_id).await.unwrap().is_empty());
    }
}
