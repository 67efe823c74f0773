use crate::model::{
    ChangeRequest, ChangeRequestResolution, ChangeRequestStatus, ContinuousOutcome, FormField,
    Id, Membership, MembershipRole, NewChangeRequest, NewFormField, NewOutcomeDefinition,
    NewProject, NewStudy, NewUser, NumericalOutcome, OutcomeDefinition, OutcomeWrite, Project,
    Study, StudyValue, User,
};
use anyhow::Result;

/// New position of a stored field. Only the two order columns are written,
/// so a concurrent edit of the field's attributes survives a reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldOrderUpdate {
    pub field_id: Id,
    pub section_order: Option<i32>,
    pub sort_order: Option<i32>,
}

/// One atomic change to a project's form and outcome registry. Stores apply
/// every part of it or none; a `resolution` is applied only while the
/// request is still pending, otherwise the commit fails with `StaleRequest`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaCommit {
    pub project_id: Id,
    pub inserted_fields: Vec<NewFormField>,
    /// Fields whose attributes changed, written as whole rows
    pub updated_fields: Vec<FormField>,
    /// Fields that only moved; rows deleted in the meantime are skipped
    pub reordered_fields: Vec<FieldOrderUpdate>,
    /// Deleting a field also deletes its study values
    pub deleted_field_ids: Vec<Id>,
    pub inserted_outcomes: Vec<NewOutcomeDefinition>,
    pub deleted_outcome_ids: Vec<Id>,
    pub resolution: Option<ChangeRequestResolution>,
}

impl SchemaCommit {
    pub fn new(project_id: Id) -> Self {
        Self {
            project_id,
            ..Default::default()
        }
    }

    /// True when there is nothing to write, not even a resolution
    pub fn is_empty(&self) -> bool {
        self.inserted_fields.is_empty()
            && self.updated_fields.is_empty()
            && self.reordered_fields.is_empty()
            && self.deleted_field_ids.is_empty()
            && self.inserted_outcomes.is_empty()
            && self.deleted_outcome_ids.is_empty()
            && self.resolution.is_none()
    }
}

/// Rows created by a schema commit, in the order they were submitted
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaCommitResult {
    pub inserted_fields: Vec<FormField>,
    pub inserted_outcomes: Vec<OutcomeDefinition>,
    pub resolved_request: Option<ChangeRequest>,
}

/// One atomic data-entry write for a single study
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StudyDataCommit {
    pub study_id: Id,
    /// Upserted by (study, field)
    pub values: Vec<StudyValue>,
    pub numerical: OutcomeWrite<NumericalOutcome>,
    pub continuous: OutcomeWrite<ContinuousOutcome>,
}

#[async_trait::async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, id: Id) -> Result<Option<User>>;
    /// Lookup by e-mail, case-insensitive
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn create_user(&self, user: NewUser) -> Result<User>;
    async fn set_user_admin(&self, id: Id, is_admin: bool) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get_project(&self, id: Id) -> Result<Option<Project>>;
    async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>>;
    async fn list_projects(&self) -> Result<Vec<Project>>;
    /// Projects where the user holds an active membership
    async fn list_projects_for_user(&self, user_id: Id) -> Result<Vec<Project>>;
    /// Create the project and the creator's owner membership together
    async fn create_project(&self, project: NewProject, owner_id: Id) -> Result<Project>;
    /// Cascades to studies, values, outcomes, fields, memberships and requests
    async fn delete_project(&self, id: Id) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait MembershipStore: Send + Sync {
    async fn get_membership(&self, user_id: Id, project_id: Id) -> Result<Option<Membership>>;
    async fn list_memberships(&self, project_id: Id) -> Result<Vec<Membership>>;
    /// Fails on an existing (user, project) row
    async fn insert_membership(&self, membership: Membership) -> Result<()>;
    async fn update_membership_role(
        &self,
        user_id: Id,
        project_id: Id,
        role: MembershipRole,
    ) -> Result<bool>;
    async fn delete_membership(&self, user_id: Id, project_id: Id) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait SchemaStore: Send + Sync {
    /// Fields ordered by (section_order, section, sort_order-or-id, id)
    async fn list_fields(&self, project_id: Id) -> Result<Vec<FormField>>;
    async fn get_field(&self, id: Id) -> Result<Option<FormField>>;
    async fn list_outcomes(&self, project_id: Id) -> Result<Vec<OutcomeDefinition>>;
    async fn commit_schema(&self, commit: SchemaCommit) -> Result<SchemaCommitResult>;
}

#[async_trait::async_trait]
pub trait StudyStore: Send + Sync {
    async fn get_study(&self, id: Id) -> Result<Option<Study>>;
    async fn list_studies(&self, project_id: Id) -> Result<Vec<Study>>;
    async fn create_study(&self, project_id: Id, study: NewStudy, created_by: Option<Id>)
        -> Result<Study>;
    /// Cascades to the study's values and outcome rows
    async fn delete_study(&self, id: Id) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait StudyDataStore: Send + Sync {
    async fn list_values(&self, study_id: Id) -> Result<Vec<StudyValue>>;
    async fn list_values_for_project(&self, project_id: Id) -> Result<Vec<StudyValue>>;
    async fn list_numerical_outcomes(&self, study_id: Id) -> Result<Vec<NumericalOutcome>>;
    async fn list_continuous_outcomes(&self, study_id: Id) -> Result<Vec<ContinuousOutcome>>;
    async fn list_numerical_outcomes_for_project(
        &self,
        project_id: Id,
    ) -> Result<Vec<NumericalOutcome>>;
    async fn list_continuous_outcomes_for_project(
        &self,
        project_id: Id,
    ) -> Result<Vec<ContinuousOutcome>>;
    async fn commit_study_data(&self, commit: StudyDataCommit) -> Result<()>;
}

#[async_trait::async_trait]
pub trait ChangeRequestStore: Send + Sync {
    async fn create_change_request(&self, request: NewChangeRequest) -> Result<ChangeRequest>;
    async fn get_change_request(&self, id: Id) -> Result<Option<ChangeRequest>>;
    /// Oldest first
    async fn list_change_requests(
        &self,
        project_id: Id,
        status: Option<ChangeRequestStatus>,
    ) -> Result<Vec<ChangeRequest>>;
    /// Apply a terminal transition; fails with `StaleRequest` unless pending
    async fn resolve_change_request(
        &self,
        resolution: ChangeRequestResolution,
    ) -> Result<ChangeRequest>;
}

pub trait Store:
    UserStore
    + ProjectStore
    + MembershipStore
    + SchemaStore
    + StudyStore
    + StudyDataStore
    + ChangeRequestStore
    + Send
    + Sync
{
}
