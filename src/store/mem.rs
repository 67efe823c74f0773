use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};

use crate::error::{DuplicateEntry, StaleRequest};
use crate::model::{
    canonical_order, normalize_email, ChangeRequest, ChangeRequestResolution,
    ChangeRequestStatus, ContinuousOutcome, FormField, Id, Membership, MembershipRole,
    NewChangeRequest, NewProject, NewStudy, NewUser, NumericalOutcome, OutcomeDefinition,
    OutcomeWrite, Project, Study, StudyValue, User,
};
use crate::store::traits::{
    ChangeRequestStore, MembershipStore, ProjectStore, SchemaCommit, SchemaCommitResult,
    SchemaStore, Store, StudyDataCommit, StudyDataStore, StudyStore, UserStore,
};

#[derive(Debug, Default)]
struct MemoryState {
    next_id: Id,
    users: BTreeMap<Id, User>,
    projects: BTreeMap<Id, Project>,
    memberships: BTreeMap<(Id, Id), Membership>,
    fields: BTreeMap<Id, FormField>,
    outcomes: BTreeMap<Id, OutcomeDefinition>,
    studies: BTreeMap<Id, Study>,
    values: BTreeMap<(Id, Id), StudyValue>,
    numerical: Vec<NumericalOutcome>,
    continuous: Vec<ContinuousOutcome>,
    change_requests: BTreeMap<Id, ChangeRequest>,
}

impl MemoryState {
    fn allocate_id(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }

    fn study_ids_for_project(&self, project_id: Id) -> HashSet<Id> {
        self.studies
            .values()
            .filter(|s| s.project_id == project_id)
            .map(|s| s.id)
            .collect()
    }

    fn remove_study_data(&mut self, study_ids: &HashSet<Id>) {
        self.values.retain(|(study_id, _), _| !study_ids.contains(study_id));
        self.numerical.retain(|row| !study_ids.contains(&row.study_id));
        self.continuous.retain(|row| !study_ids.contains(&row.study_id));
    }
}

fn write_outcomes<T, F>(rows: &mut Vec<T>, study_id: Id, write: OutcomeWrite<T>, key: F)
where
    F: Fn(&T) -> (Id, &str),
{
    match write {
        OutcomeWrite::Untouched => {}
        OutcomeWrite::ReplaceAll(new_rows) => {
            rows.retain(|row| key(row).0 != study_id);
            rows.extend(new_rows);
        }
        OutcomeWrite::UpsertByName(new_rows) => {
            let names: HashSet<String> = new_rows
                .iter()
                .map(|row| key(row).1.to_string())
                .collect();
            rows.retain(|row| {
                let (row_study, name) = key(row);
                row_study != study_id || !names.contains(name)
            });
            rows.extend(new_rows);
        }
    }
}

/// In-process store. Every write holds the lock for its whole duration and
/// validates before mutating, so a failed write changes nothing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl UserStore for MemoryStore {
    async fn get_user(&self, id: Id) -> Result<Option<User>> {
        Ok(self.state.read().users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = normalize_email(email);
        Ok(self
            .state
            .read()
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn create_user(&self, user: NewUser) -> Result<User> {
        let mut state = self.state.write();
        let email = user.normalized_email();
        if state.users.values().any(|u| u.email == email) {
            return Err(DuplicateEntry(format!("user with e-mail '{}'", email)).into());
        }
        let user = User {
            id: state.allocate_id(),
            email,
            name: user.name.trim().to_string(),
            is_admin: user.is_admin,
            is_active: true,
            created_at: Utc::now(),
        };
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn set_user_admin(&self, id: Id, is_admin: bool) -> Result<bool> {
        let mut state = self.state.write();
        match state.users.get_mut(&id) {
            Some(user) => {
                user.is_admin = is_admin;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait::async_trait]
impl ProjectStore for MemoryStore {
    async fn get_project(&self, id: Id) -> Result<Option<Project>> {
        Ok(self.state.read().projects.get(&id).cloned())
    }

    async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        Ok(self
            .state
            .read()
            .projects
            .values()
            .find(|p| p.name == name)
            .cloned())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.state.read().projects.values().cloned().collect())
    }

    async fn list_projects_for_user(&self, user_id: Id) -> Result<Vec<Project>> {
        let state = self.state.read();
        Ok(state
            .projects
            .values()
            .filter(|p| {
                state
                    .memberships
                    .get(&(user_id, p.id))
                    .map(|m| m.is_active())
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn create_project(&self, project: NewProject, owner_id: Id) -> Result<Project> {
        let mut state = self.state.write();
        if !state.users.contains_key(&owner_id) {
            bail!("Owner user {} does not exist", owner_id);
        }
        let project = Project {
            id: state.allocate_id(),
            name: project.name,
            description: project.description,
            created_at: Utc::now(),
        };
        state.projects.insert(project.id, project.clone());
        state.memberships.insert(
            (owner_id, project.id),
            Membership::new(owner_id, project.id, MembershipRole::Owner),
        );
        Ok(project)
    }

    async fn delete_project(&self, id: Id) -> Result<bool> {
        let mut state = self.state.write();
        if state.projects.remove(&id).is_none() {
            return Ok(false);
        }
        let study_ids = state.study_ids_for_project(id);
        state.remove_study_data(&study_ids);
        state.studies.retain(|_, s| s.project_id != id);
        let field_ids: HashSet<Id> = state
            .fields
            .values()
            .filter(|f| f.project_id == id)
            .map(|f| f.id)
            .collect();
        state.values.retain(|(_, field_id), _| !field_ids.contains(field_id));
        state.fields.retain(|_, f| f.project_id != id);
        state.outcomes.retain(|_, o| o.project_id != id);
        state.memberships.retain(|(_, project_id), _| *project_id != id);
        state.change_requests.retain(|_, r| r.project_id != id);
        Ok(true)
    }
}

#[async_trait::async_trait]
impl MembershipStore for MemoryStore {
    async fn get_membership(&self, user_id: Id, project_id: Id) -> Result<Option<Membership>> {
        Ok(self
            .state
            .read()
            .memberships
            .get(&(user_id, project_id))
            .cloned())
    }

    async fn list_memberships(&self, project_id: Id) -> Result<Vec<Membership>> {
        Ok(self
            .state
            .read()
            .memberships
            .values()
            .filter(|m| m.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn insert_membership(&self, membership: Membership) -> Result<()> {
        let mut state = self.state.write();
        let key = (membership.user_id, membership.project_id);
        if state.memberships.contains_key(&key) {
            return Err(DuplicateEntry(format!(
                "membership for user {} in project {}",
                key.0, key.1
            ))
            .into());
        }
        state.memberships.insert(key, membership);
        Ok(())
    }

    async fn update_membership_role(
        &self,
        user_id: Id,
        project_id: Id,
        role: MembershipRole,
    ) -> Result<bool> {
        let mut state = self.state.write();
        match state.memberships.get_mut(&(user_id, project_id)) {
            Some(m) => {
                m.role = role;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_membership(&self, user_id: Id, project_id: Id) -> Result<bool> {
        Ok(self
            .state
            .write()
            .memberships
            .remove(&(user_id, project_id))
            .is_some())
    }
}

#[async_trait::async_trait]
impl SchemaStore for MemoryStore {
    async fn list_fields(&self, project_id: Id) -> Result<Vec<FormField>> {
        let fields: Vec<FormField> = self
            .state
            .read()
            .fields
            .values()
            .filter(|f| f.project_id == project_id)
            .cloned()
            .collect();
        Ok(canonical_order(fields))
    }

    async fn get_field(&self, id: Id) -> Result<Option<FormField>> {
        Ok(self.state.read().fields.get(&id).cloned())
    }

    async fn list_outcomes(&self, project_id: Id) -> Result<Vec<OutcomeDefinition>> {
        Ok(self
            .state
            .read()
            .outcomes
            .values()
            .filter(|o| o.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn commit_schema(&self, commit: SchemaCommit) -> Result<SchemaCommitResult> {
        let mut state = self.state.write();
        let project_id = commit.project_id;

        if !state.projects.contains_key(&project_id) {
            bail!("Project {} does not exist", project_id);
        }
        for field in &commit.updated_fields {
            match state.fields.get(&field.id) {
                Some(existing) if existing.project_id == project_id => {}
                _ => bail!("Field {} no longer exists in project {}", field.id, project_id),
            }
        }
        for new_outcome in &commit.inserted_outcomes {
            let name = new_outcome.name.to_lowercase();
            let taken = state.outcomes.values().any(|o| {
                o.project_id == new_outcome.project_id
                    && o.name.to_lowercase() == name
                    && !commit.deleted_outcome_ids.contains(&o.id)
            });
            if taken {
                return Err(DuplicateEntry(format!("outcome '{}'", new_outcome.name)).into());
            }
        }
        if let Some(resolution) = &commit.resolution {
            match state.change_requests.get(&resolution.request_id) {
                Some(request) if request.status == ChangeRequestStatus::Pending => {}
                Some(_) => return Err(StaleRequest(resolution.request_id).into()),
                None => bail!("Change request {} does not exist", resolution.request_id),
            }
        }

        // validated; from here on nothing can fail
        let mut result = SchemaCommitResult::default();
        for field in commit.updated_fields {
            state.fields.insert(field.id, field);
        }
        for update in commit.reordered_fields {
            if let Some(field) = state
                .fields
                .get_mut(&update.field_id)
                .filter(|f| f.project_id == project_id)
            {
                field.section_order = update.section_order;
                field.sort_order = update.sort_order;
            }
        }
        let deleted: HashSet<Id> = commit
            .deleted_field_ids
            .into_iter()
            .filter(|id| {
                state
                    .fields
                    .get(id)
                    .map(|f| f.project_id == project_id)
                    .unwrap_or(false)
            })
            .collect();
        state.fields.retain(|id, _| !deleted.contains(id));
        state.values.retain(|(_, field_id), _| !deleted.contains(field_id));
        for new_field in commit.inserted_fields {
            let id = state.allocate_id();
            let field = new_field.with_id(id);
            state.fields.insert(id, field.clone());
            result.inserted_fields.push(field);
        }
        for outcome_id in commit.deleted_outcome_ids {
            if state
                .outcomes
                .get(&outcome_id)
                .map(|o| o.project_id == project_id)
                .unwrap_or(false)
            {
                state.outcomes.remove(&outcome_id);
            }
        }
        for new_outcome in commit.inserted_outcomes {
            let outcome = OutcomeDefinition {
                id: state.allocate_id(),
                project_id: new_outcome.project_id,
                name: new_outcome.name,
                outcome_type: new_outcome.outcome_type,
            };
            state.outcomes.insert(outcome.id, outcome.clone());
            result.inserted_outcomes.push(outcome);
        }
        if let Some(resolution) = commit.resolution {
            if let Some(request) = state.change_requests.get_mut(&resolution.request_id) {
                apply_resolution(request, resolution);
                result.resolved_request = Some(request.clone());
            }
        }
        Ok(result)
    }
}

fn apply_resolution(request: &mut ChangeRequest, resolution: ChangeRequestResolution) {
    request.status = resolution.status;
    request.reviewed_by = Some(resolution.reviewed_by);
    request.reviewed_at = Some(resolution.reviewed_at);
    request.resolution_notes = resolution.resolution_notes;
}

#[async_trait::async_trait]
impl StudyStore for MemoryStore {
    async fn get_study(&self, id: Id) -> Result<Option<Study>> {
        Ok(self.state.read().studies.get(&id).cloned())
    }

    async fn list_studies(&self, project_id: Id) -> Result<Vec<Study>> {
        Ok(self
            .state
            .read()
            .studies
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn create_study(
        &self,
        project_id: Id,
        study: NewStudy,
        created_by: Option<Id>,
    ) -> Result<Study> {
        let mut state = self.state.write();
        if !state.projects.contains_key(&project_id) {
            bail!("Project {} does not exist", project_id);
        }
        let study = Study {
            id: state.allocate_id(),
            project_id,
            title: study.title,
            author: study.author,
            year: study.year,
            created_by,
            created_at: Utc::now(),
        };
        state.studies.insert(study.id, study.clone());
        Ok(study)
    }

    async fn delete_study(&self, id: Id) -> Result<bool> {
        let mut state = self.state.write();
        if state.studies.remove(&id).is_none() {
            return Ok(false);
        }
        state.remove_study_data(&HashSet::from([id]));
        Ok(true)
    }
}

#[async_trait::async_trait]
impl StudyDataStore for MemoryStore {
    async fn list_values(&self, study_id: Id) -> Result<Vec<StudyValue>> {
        Ok(self
            .state
            .read()
            .values
            .values()
            .filter(|v| v.study_id == study_id)
            .cloned()
            .collect())
    }

    async fn list_values_for_project(&self, project_id: Id) -> Result<Vec<StudyValue>> {
        let state = self.state.read();
        let study_ids = state.study_ids_for_project(project_id);
        Ok(state
            .values
            .values()
            .filter(|v| study_ids.contains(&v.study_id))
            .cloned()
            .collect())
    }

    async fn list_numerical_outcomes(&self, study_id: Id) -> Result<Vec<NumericalOutcome>> {
        Ok(self
            .state
            .read()
            .numerical
            .iter()
            .filter(|row| row.study_id == study_id)
            .cloned()
            .collect())
    }

    async fn list_continuous_outcomes(&self, study_id: Id) -> Result<Vec<ContinuousOutcome>> {
        Ok(self
            .state
            .read()
            .continuous
            .iter()
            .filter(|row| row.study_id == study_id)
            .cloned()
            .collect())
    }

    async fn list_numerical_outcomes_for_project(
        &self,
        project_id: Id,
    ) -> Result<Vec<NumericalOutcome>> {
        let state = self.state.read();
        let study_ids = state.study_ids_for_project(project_id);
        Ok(state
            .numerical
            .iter()
            .filter(|row| study_ids.contains(&row.study_id))
            .cloned()
            .collect())
    }

    async fn list_continuous_outcomes_for_project(
        &self,
        project_id: Id,
    ) -> Result<Vec<ContinuousOutcome>> {
        let state = self.state.read();
        let study_ids = state.study_ids_for_project(project_id);
        Ok(state
            .continuous
            .iter()
            .filter(|row| study_ids.contains(&row.study_id))
            .cloned()
            .collect())
    }

    async fn commit_study_data(&self, commit: StudyDataCommit) -> Result<()> {
        let mut state = self.state.write();
        let study = state
            .studies
            .get(&commit.study_id)
            .cloned()
            .ok_or_else(|| anyhow!("Study {} does not exist", commit.study_id))?;
        for value in &commit.values {
            if value.study_id != study.id {
                bail!("Value for study {} submitted with study {}", value.study_id, study.id);
            }
            match state.fields.get(&value.field_id) {
                Some(field) if field.project_id == study.project_id => {}
                _ => bail!("Field {} no longer exists", value.field_id),
            }
        }

        for value in commit.values {
            state.values.insert((value.study_id, value.field_id), value);
        }
        write_outcomes(&mut state.numerical, study.id, commit.numerical, |row| {
            (row.study_id, row.outcome_name.as_str())
        });
        write_outcomes(&mut state.continuous, study.id, commit.continuous, |row| {
            (row.study_id, row.outcome_name.as_str())
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChangeRequestStore for MemoryStore {
    async fn create_change_request(&self, request: NewChangeRequest) -> Result<ChangeRequest> {
        let mut state = self.state.write();
        if !state.projects.contains_key(&request.project_id) {
            bail!("Project {} does not exist", request.project_id);
        }
        let request = ChangeRequest {
            id: state.allocate_id(),
            project_id: request.project_id,
            requested_by: request.requested_by,
            status: ChangeRequestStatus::Pending,
            action: request.action,
            reason: request.reason,
            created_at: Utc::now(),
            reviewed_by: None,
            reviewed_at: None,
            resolution_notes: None,
        };
        state.change_requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn get_change_request(&self, id: Id) -> Result<Option<ChangeRequest>> {
        Ok(self.state.read().change_requests.get(&id).cloned())
    }

    async fn list_change_requests(
        &self,
        project_id: Id,
        status: Option<ChangeRequestStatus>,
    ) -> Result<Vec<ChangeRequest>> {
        Ok(self
            .state
            .read()
            .change_requests
            .values()
            .filter(|r| r.project_id == project_id)
            .filter(|r| status.map(|s| r.status == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn resolve_change_request(
        &self,
        resolution: ChangeRequestResolution,
    ) -> Result<ChangeRequest> {
        let mut state = self.state.write();
        let request = state
            .change_requests
            .get_mut(&resolution.request_id)
            .ok_or_else(|| anyhow!("Change request {} does not exist", resolution.request_id))?;
        if request.status != ChangeRequestStatus::Pending {
            return Err(StaleRequest(resolution.request_id).into());
        }
        apply_resolution(request, resolution);
        Ok(request.clone())
    }
}

impl Store for MemoryStore {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SrmaError;
    use crate::model::{FieldType, NewFormField, NewOutcomeDefinition, OutcomeType};

    async fn store_with_project() -> (MemoryStore, Id, Id) {
        let store = MemoryStore::new();
        let owner = store
            .create_user(NewUser {
                email: "Owner@Example.com".to_string(),
                name: "Owner".to_string(),
                is_admin: false,
            })
            .await
            .unwrap();
        let project = store
            .create_project(
                NewProject {
                    name: "P".to_string(),
                    description: None,
                },
                owner.id,
            )
            .await
            .unwrap();
        (store, owner.id, project.id)
    }

    fn new_field(project_id: Id, label: &str) -> NewFormField {
        NewFormField {
            project_id,
            section: "S".to_string(),
            section_order: Some(1),
            label: label.to_string(),
            field_type: FieldType::Text,
            required: false,
            sort_order: Some(1),
            help_text: None,
            options: None,
        }
    }

    #[tokio::test]
    async fn test_create_project_grants_owner_membership() {
        let (store, owner_id, project_id) = store_with_project().await;
        let membership = store.get_membership(owner_id, project_id).await.unwrap().unwrap();
        assert_eq!(membership.role, MembershipRole::Owner);
        assert!(store
            .find_user_by_email("owner@example.COM")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_failed_schema_commit_writes_nothing() {
        let (store, _, project_id) = store_with_project().await;
        let mut commit = SchemaCommit::new(project_id);
        commit.inserted_fields.push(new_field(project_id, "Age"));
        let inserted = store.commit_schema(commit).await.unwrap().inserted_fields;

        let mut ghost = inserted[0].clone();
        ghost.id = 9_999;
        let mut commit = SchemaCommit::new(project_id);
        commit.inserted_fields.push(new_field(project_id, "Sex"));
        commit.updated_fields.push(ghost);
        assert!(store.commit_schema(commit).await.is_err());

        let fields = store.list_fields(project_id).await.unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].label, "Age");
    }

    #[tokio::test]
    async fn test_resolution_of_settled_request_is_stale() {
        let (store, owner_id, project_id) = store_with_project().await;
        let request = store
            .create_change_request(NewChangeRequest {
                project_id,
                requested_by: owner_id,
                action: crate::model::ChangeAction::DeleteField { field_id: 1 },
                reason: None,
            })
            .await
            .unwrap();
        let reject = ChangeRequestResolution::new(
            request.id,
            ChangeRequestStatus::Rejected,
            owner_id,
            None,
        );
        store.resolve_change_request(reject.clone()).await.unwrap();
        let err = store.resolve_change_request(reject).await.unwrap_err();
        assert!(err.downcast_ref::<StaleRequest>().is_some());
    }

    #[tokio::test]
    async fn test_delete_project_cascades() {
        let (store, owner_id, project_id) = store_with_project().await;
        let mut commit = SchemaCommit::new(project_id);
        commit.inserted_fields.push(new_field(project_id, "Age"));
        let field = store.commit_schema(commit).await.unwrap().inserted_fields[0].clone();
        let study = store
            .create_study(
                project_id,
                NewStudy {
                    title: "Trial A".to_string(),
                    author: "Smith".to_string(),
                    year: 2020,
                },
                Some(owner_id),
            )
            .await
            .unwrap();
        store
            .commit_study_data(StudyDataCommit {
                study_id: study.id,
                values: vec![StudyValue {
                    study_id: study.id,
                    field_id: field.id,
                    value: Some("42".to_string()),
                }],
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(store.delete_project(project_id).await.unwrap());
        assert!(store.get_study(study.id).await.unwrap().is_none());
        assert!(store.get_field(field.id).await.unwrap().is_none());
        assert!(store.list_values(study.id).await.unwrap().is_empty());
        assert!(store.get_membership(owner_id, project_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicates_surface_as_conflicts() {
        let (store, owner_id, project_id) = store_with_project().await;
        let err = store
            .insert_membership(Membership::new(owner_id, project_id, MembershipRole::Member))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<DuplicateEntry>().is_some());
        assert!(matches!(SrmaError::from(err), SrmaError::Conflict(_)));

        let outcome = |name: &str| NewOutcomeDefinition {
            project_id,
            name: name.to_string(),
            outcome_type: OutcomeType::Dichotomous,
        };
        let mut commit = SchemaCommit::new(project_id);
        commit.inserted_outcomes.push(outcome("Mortality"));
        store.commit_schema(commit).await.unwrap();

        let mut commit = SchemaCommit::new(project_id);
        commit.inserted_fields.push(new_field(project_id, "Age"));
        commit.inserted_outcomes.push(outcome("MORTALITY"));
        let err = store.commit_schema(commit).await.unwrap_err();
        assert!(matches!(SrmaError::from(err), SrmaError::Conflict(_)));
        assert!(store.list_fields(project_id).await.unwrap().is_empty());
        assert_eq!(store.list_outcomes(project_id).await.unwrap().len(), 1);
    }
}
