use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::SrmaError;
use crate::logic::{
    ChangeRequestWorkflow, DataEntry, ExportBundle, ExportFlattener, FormEditor, FormSubmission,
    MemberView, ProjectOperations, SchemaEditResult, SectionSave, StudyData, TemplateLoader,
};
use crate::model::{
    AddFieldPayload, ChangeAction, ChangeRequest, ChangeRequestStatus, Direction,
    EditFieldPayload, FieldChanges, FormField, FormSection, Id, Membership, MembershipRole,
    NewProject, NewStudy, NewUser, OutcomeDefinition, OutcomeRef, OutcomeType, Project, Study,
    User, UserContext,
};
use crate::store::traits::Store;

pub type AppState<S> = Arc<S>;

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> ListResponse<T> {
    fn new(items: Vec<T>) -> Self {
        let total = items.len();
        Self { items, total }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
        }
    }
}

impl From<SrmaError> for ErrorResponse {
    fn from(err: SrmaError) -> Self {
        ErrorResponse::new(&err.to_string())
    }
}

pub fn status_for(err: &SrmaError) -> StatusCode {
    match err {
        SrmaError::Unauthenticated => StatusCode::UNAUTHORIZED,
        SrmaError::Forbidden(_) => StatusCode::FORBIDDEN,
        SrmaError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SrmaError::NotFound(_) => StatusCode::NOT_FOUND,
        SrmaError::Conflict(_) => StatusCode::CONFLICT,
        SrmaError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn api_error(err: SrmaError) -> ApiError {
    if let SrmaError::Storage(e) = &err {
        log::error!("Request failed: {:#}", e);
    }
    (status_for(&err), Json(ErrorResponse::from(err)))
}

// ---------------------------------------------------------------------------
// Users and projects
// ---------------------------------------------------------------------------

pub async fn create_user<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    RequestJson(user): RequestJson<NewUser>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let user = ProjectOperations::create_user(&*store, &ctx, user)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn list_projects<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
) -> ApiResult<ListResponse<Project>> {
    let projects = ProjectOperations::list_projects(&*store, &ctx)
        .await
        .map_err(api_error)?;
    Ok(Json(ListResponse::new(projects)))
}

pub async fn create_project<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    RequestJson(project): RequestJson<NewProject>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let project = ProjectOperations::create_project(&*store, &ctx, project)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(project)))
}

pub async fn get_project<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path(project_id): Path<Id>,
) -> ApiResult<Project> {
    ProjectOperations::get_project(&*store, &ctx, project_id)
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn delete_project<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path(project_id): Path<Id>,
) -> Result<StatusCode, ApiError> {
    ProjectOperations::delete_project(&*store, &ctx, project_id)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Memberships
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub email: String,
    #[serde(default = "default_member_role")]
    pub role: MembershipRole,
}

fn default_member_role() -> MembershipRole {
    MembershipRole::Member
}

#[derive(Debug, Deserialize)]
pub struct UpdateMemberRequest {
    pub role: MembershipRole,
}

pub async fn list_members<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path(project_id): Path<Id>,
) -> ApiResult<ListResponse<MemberView>> {
    let members = ProjectOperations::list_members(&*store, &ctx, project_id)
        .await
        .map_err(api_error)?;
    Ok(Json(ListResponse::new(members)))
}

pub async fn add_member<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path(project_id): Path<Id>,
    RequestJson(request): RequestJson<AddMemberRequest>,
) -> Result<(StatusCode, Json<Membership>), ApiError> {
    let membership =
        ProjectOperations::add_member(&*store, &ctx, project_id, &request.email, request.role)
            .await
            .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(membership)))
}

pub async fn update_member<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path((project_id, user_id)): Path<(Id, Id)>,
    RequestJson(request): RequestJson<UpdateMemberRequest>,
) -> Result<StatusCode, ApiError> {
    ProjectOperations::change_member_role(&*store, &ctx, project_id, user_id, request.role)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_member<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path((project_id, user_id)): Path<(Id, Id)>,
) -> Result<StatusCode, ApiError> {
    ProjectOperations::remove_member(&*store, &ctx, project_id, user_id)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Form schema and outcome registry
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct FormResponse {
    pub project_id: Id,
    pub sections: Vec<FormSection>,
    pub outcomes: Vec<OutcomeDefinition>,
}

/// A schema mutation body plus the optional reason members attach to
/// their proposals
#[derive(Debug, Deserialize)]
pub struct SchemaEditBody<T> {
    #[serde(flatten)]
    pub payload: T,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReasonQuery {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MoveFieldRequest {
    pub direction: Direction,
}

#[derive(Debug, Deserialize)]
pub struct MoveSectionRequest {
    pub section: String,
    pub direction: Direction,
}

#[derive(Debug, Deserialize)]
pub struct AddOutcomeRequest {
    pub name: String,
    #[serde(default)]
    pub outcome_type: OutcomeType,
}

async fn submit_edit<S: Store>(
    store: &S,
    ctx: &UserContext,
    project_id: Id,
    action: ChangeAction,
    reason: Option<String>,
) -> Result<(StatusCode, Json<SchemaEditResult>), ApiError> {
    let result = FormEditor::submit(store, ctx, project_id, action, reason)
        .await
        .map_err(api_error)?;
    let status = match result {
        SchemaEditResult::Applied { .. } => StatusCode::OK,
        SchemaEditResult::PendingApproval { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(result)))
}

pub async fn get_form<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path(project_id): Path<Id>,
) -> ApiResult<FormResponse> {
    let project = ProjectOperations::get_project(&*store, &ctx, project_id)
        .await
        .map_err(api_error)?;
    let sections = FormEditor::sections(&*store, project.id)
        .await
        .map_err(api_error)?;
    let outcomes = store
        .list_outcomes(project.id)
        .await
        .map_err(|e| api_error(e.into()))?;
    Ok(Json(FormResponse {
        project_id: project.id,
        sections,
        outcomes,
    }))
}

pub async fn add_field<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path(project_id): Path<Id>,
    RequestJson(body): RequestJson<SchemaEditBody<AddFieldPayload>>,
) -> Result<(StatusCode, Json<SchemaEditResult>), ApiError> {
    let action = ChangeAction::AddField(body.payload);
    submit_edit(&*store, &ctx, project_id, action, body.reason).await
}

pub async fn edit_field<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path((project_id, field_id)): Path<(Id, Id)>,
    RequestJson(body): RequestJson<SchemaEditBody<FieldChanges>>,
) -> Result<(StatusCode, Json<SchemaEditResult>), ApiError> {
    let action = ChangeAction::EditField(EditFieldPayload {
        field_id,
        changes: body.payload,
    });
    submit_edit(&*store, &ctx, project_id, action, body.reason).await
}

pub async fn delete_field<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path((project_id, field_id)): Path<(Id, Id)>,
    Query(query): Query<ReasonQuery>,
) -> Result<(StatusCode, Json<SchemaEditResult>), ApiError> {
    let action = ChangeAction::DeleteField { field_id };
    submit_edit(&*store, &ctx, project_id, action, query.reason).await
}

pub async fn move_field<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path((project_id, field_id)): Path<(Id, Id)>,
    RequestJson(body): RequestJson<SchemaEditBody<MoveFieldRequest>>,
) -> Result<(StatusCode, Json<SchemaEditResult>), ApiError> {
    let action = ChangeAction::ReorderField {
        field_id,
        direction: body.payload.direction,
    };
    submit_edit(&*store, &ctx, project_id, action, body.reason).await
}

pub async fn move_section<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path(project_id): Path<Id>,
    RequestJson(body): RequestJson<SchemaEditBody<MoveSectionRequest>>,
) -> Result<(StatusCode, Json<SchemaEditResult>), ApiError> {
    let action = ChangeAction::ReorderSection {
        section: body.payload.section,
        direction: body.payload.direction,
    };
    submit_edit(&*store, &ctx, project_id, action, body.reason).await
}

/// YAML template in the request body
pub async fn load_template<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path(project_id): Path<Id>,
    body: String,
) -> Result<(StatusCode, Json<ListResponse<FormField>>), ApiError> {
    let fields = TemplateLoader::load(&*store, &ctx, project_id, &body)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(ListResponse::new(fields))))
}

pub async fn list_outcomes<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path(project_id): Path<Id>,
) -> ApiResult<ListResponse<OutcomeDefinition>> {
    ProjectOperations::get_project(&*store, &ctx, project_id)
        .await
        .map_err(api_error)?;
    let outcomes = store
        .list_outcomes(project_id)
        .await
        .map_err(|e| api_error(e.into()))?;
    Ok(Json(ListResponse::new(outcomes)))
}

pub async fn add_outcome<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path(project_id): Path<Id>,
    RequestJson(body): RequestJson<SchemaEditBody<AddOutcomeRequest>>,
) -> Result<(StatusCode, Json<SchemaEditResult>), ApiError> {
    let action = ChangeAction::AddOutcome {
        name: body.payload.name,
        outcome_type: body.payload.outcome_type,
    };
    submit_edit(&*store, &ctx, project_id, action, body.reason).await
}

pub async fn delete_outcome<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path((project_id, outcome_id)): Path<(Id, Id)>,
    Query(query): Query<ReasonQuery>,
) -> Result<(StatusCode, Json<SchemaEditResult>), ApiError> {
    let action = ChangeAction::DeleteOutcome(OutcomeRef {
        outcome_id: Some(outcome_id),
        name: None,
    });
    submit_edit(&*store, &ctx, project_id, action, query.reason).await
}

// ---------------------------------------------------------------------------
// Change requests
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChangeRequestQuery {
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReviewRequest {
    #[serde(default)]
    pub notes: Option<String>,
}

pub async fn list_change_requests<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path(project_id): Path<Id>,
    Query(query): Query<ChangeRequestQuery>,
) -> ApiResult<ListResponse<ChangeRequest>> {
    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<ChangeRequestStatus>()
                .map_err(|e| api_error(SrmaError::Validation(e)))?,
        ),
    };
    let requests = ChangeRequestWorkflow::list(&*store, &ctx, project_id, status)
        .await
        .map_err(api_error)?;
    Ok(Json(ListResponse::new(requests)))
}

pub async fn approve_change_request<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path((project_id, request_id)): Path<(Id, Id)>,
    body: Option<RequestJson<ReviewRequest>>,
) -> ApiResult<ChangeRequest> {
    let notes = body.and_then(|RequestJson(review)| review.notes);
    ChangeRequestWorkflow::approve(&*store, &ctx, project_id, request_id, notes)
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn reject_change_request<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path((project_id, request_id)): Path<(Id, Id)>,
    body: Option<RequestJson<ReviewRequest>>,
) -> ApiResult<ChangeRequest> {
    let notes = body.and_then(|RequestJson(review)| review.notes);
    ChangeRequestWorkflow::reject(&*store, &ctx, project_id, request_id, notes)
        .await
        .map(Json)
        .map_err(api_error)
}

// ---------------------------------------------------------------------------
// Studies and data entry
// ---------------------------------------------------------------------------

pub async fn list_studies<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path(project_id): Path<Id>,
) -> ApiResult<ListResponse<Study>> {
    let studies = ProjectOperations::list_studies(&*store, &ctx, project_id)
        .await
        .map_err(api_error)?;
    Ok(Json(ListResponse::new(studies)))
}

pub async fn create_study<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path(project_id): Path<Id>,
    RequestJson(study): RequestJson<NewStudy>,
) -> Result<(StatusCode, Json<Study>), ApiError> {
    let study = ProjectOperations::create_study(&*store, &ctx, project_id, study)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(study)))
}

pub async fn get_study<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path((project_id, study_id)): Path<(Id, Id)>,
) -> ApiResult<Study> {
    ProjectOperations::get_study(&*store, &ctx, project_id, study_id)
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn delete_study<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path((project_id, study_id)): Path<(Id, Id)>,
) -> Result<StatusCode, ApiError> {
    ProjectOperations::delete_study(&*store, &ctx, project_id, study_id)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_study_data<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path((project_id, study_id)): Path<(Id, Id)>,
) -> ApiResult<StudyData> {
    DataEntry::get_study_data(&*store, &ctx, project_id, study_id)
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn submit_study_data<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path((project_id, study_id)): Path<(Id, Id)>,
    RequestJson(submission): RequestJson<FormSubmission>,
) -> ApiResult<StudyData> {
    DataEntry::submit_form(&*store, &ctx, project_id, study_id, submission)
        .await
        .map_err(api_error)?;
    DataEntry::get_study_data(&*store, &ctx, project_id, study_id)
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn save_study_section<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path((project_id, study_id)): Path<(Id, Id)>,
    RequestJson(save): RequestJson<SectionSave>,
) -> ApiResult<StudyData> {
    DataEntry::save_section(&*store, &ctx, project_id, study_id, save)
        .await
        .map_err(api_error)?;
    DataEntry::get_study_data(&*store, &ctx, project_id, study_id)
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn export_project<S: Store>(
    State(store): State<AppState<S>>,
    ctx: UserContext,
    Path(project_id): Path<Id>,
) -> ApiResult<ExportBundle> {
    ExportFlattener::export(&*store, &ctx, project_id)
        .await
        .map(Json)
        .map_err(api_error)
}
