use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Postgres, Row, Transaction};

use crate::error::{DuplicateEntry, StaleRequest};
use crate::model::{
    canonical_order, normalize_email, ChangeAction, ChangeRequest, ChangeRequestResolution,
    ChangeRequestStatus, ContinuousOutcome, FieldOptions, FormField, Id, Membership,
    MembershipRole, NewChangeRequest, NewProject, NewStudy, NewUser, NumericalOutcome,
    OutcomeDefinition, OutcomeWrite, Project, Study, StudyValue, User,
};
use crate::store::traits::{
    ChangeRequestStore, MembershipStore, ProjectStore, SchemaCommit, SchemaCommitResult,
    SchemaStore, Store, StudyDataCommit, StudyDataStore, StudyStore, UserStore,
};

/// SQLSTATE for unique_violation
const UNIQUE_VIOLATION: &str = "23505";

const USER_COLUMNS: &str = "id, email, name, is_admin, is_active, created_at";
const PROJECT_COLUMNS: &str = "id, name, description, created_at";
const MEMBERSHIP_COLUMNS: &str = "user_id, project_id, role, status, created_at";
const FIELD_COLUMNS: &str =
    "id, project_id, section, section_order, label, field_type, required, sort_order, help_text, options";
const OUTCOME_COLUMNS: &str = "id, project_id, name, outcome_type";
const STUDY_COLUMNS: &str = "id, project_id, title, author, year, created_by, created_at";
const NUMERICAL_COLUMNS: &str =
    "study_id, outcome_name, events_intervention, total_intervention, events_control, total_control";
const CONTINUOUS_COLUMNS: &str = "study_id, outcome_name, mean_intervention, sd_intervention, n_intervention, mean_control, sd_control, n_control";
const REQUEST_COLUMNS: &str = "id, project_id, requested_by, status, action_type, payload, reason, created_at, reviewed_by, reviewed_at, resolution_notes";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_enum<T: std::str::FromStr<Err = String>>(raw: String) -> Result<T> {
    raw.parse::<T>().map_err(|e| anyhow!(e))
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        is_admin: row.try_get("is_admin")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn project_from_row(row: &PgRow) -> Result<Project> {
    Ok(Project {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

fn membership_from_row(row: &PgRow) -> Result<Membership> {
    Ok(Membership {
        user_id: row.try_get("user_id")?,
        project_id: row.try_get("project_id")?,
        role: parse_enum(row.try_get("role")?)?,
        status: parse_enum(row.try_get("status")?)?,
        created_at: row.try_get("created_at")?,
    })
}

fn field_from_row(row: &PgRow) -> Result<FormField> {
    let options: Option<Value> = row.try_get("options")?;
    let options = options
        .map(serde_json::from_value::<FieldOptions>)
        .transpose()
        .context("Malformed field options")?;
    Ok(FormField {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        section: row.try_get("section")?,
        section_order: row.try_get("section_order")?,
        label: row.try_get("label")?,
        field_type: parse_enum(row.try_get("field_type")?)?,
        required: row.try_get("required")?,
        sort_order: row.try_get("sort_order")?,
        help_text: row.try_get("help_text")?,
        options,
    })
}

fn options_json(options: &Option<FieldOptions>) -> Result<Option<Value>> {
    options
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .context("Failed to encode field options")
}

fn outcome_from_row(row: &PgRow) -> Result<OutcomeDefinition> {
    Ok(OutcomeDefinition {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        outcome_type: parse_enum(row.try_get("outcome_type")?)?,
    })
}

fn study_from_row(row: &PgRow) -> Result<Study> {
    Ok(Study {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        year: row.try_get("year")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
    })
}

fn value_from_row(row: &PgRow) -> Result<StudyValue> {
    Ok(StudyValue {
        study_id: row.try_get("study_id")?,
        field_id: row.try_get("field_id")?,
        value: row.try_get("value")?,
    })
}

fn numerical_from_row(row: &PgRow) -> Result<NumericalOutcome> {
    Ok(NumericalOutcome {
        study_id: row.try_get("study_id")?,
        outcome_name: row.try_get("outcome_name")?,
        events_intervention: row.try_get("events_intervention")?,
        total_intervention: row.try_get("total_intervention")?,
        events_control: row.try_get("events_control")?,
        total_control: row.try_get("total_control")?,
    })
}

fn continuous_from_row(row: &PgRow) -> Result<ContinuousOutcome> {
    Ok(ContinuousOutcome {
        study_id: row.try_get("study_id")?,
        outcome_name: row.try_get("outcome_name")?,
        mean_intervention: row.try_get("mean_intervention")?,
        sd_intervention: row.try_get("sd_intervention")?,
        n_intervention: row.try_get("n_intervention")?,
        mean_control: row.try_get("mean_control")?,
        sd_control: row.try_get("sd_control")?,
        n_control: row.try_get("n_control")?,
    })
}

fn request_from_row(row: &PgRow) -> Result<ChangeRequest> {
    let action_type: String = row.try_get("action_type")?;
    let payload: Value = row.try_get("payload")?;
    let action = ChangeAction::from_parts(&action_type, payload)
        .with_context(|| format!("Malformed payload for action '{}'", action_type))?;
    Ok(ChangeRequest {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        requested_by: row.try_get("requested_by")?,
        status: parse_enum(row.try_get("status")?)?,
        action,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
        reviewed_by: row.try_get("reviewed_by")?,
        reviewed_at: row.try_get("reviewed_at")?,
        resolution_notes: row.try_get("resolution_notes")?,
    })
}

fn collect<T>(rows: Vec<PgRow>, map: fn(&PgRow) -> Result<T>) -> Result<Vec<T>> {
    rows.iter().map(map).collect()
}

/// Lock the request row and fail unless it is still pending
async fn lock_pending_request(tx: &mut Transaction<'_, Postgres>, request_id: Id) -> Result<()> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM form_change_requests WHERE id = $1 FOR UPDATE")
            .bind(request_id)
            .fetch_optional(&mut **tx)
            .await
            .context("Failed to lock change request")?;
    match status.as_deref() {
        Some("pending") => Ok(()),
        Some(_) => Err(StaleRequest(request_id).into()),
        None => bail!("Change request {} does not exist", request_id),
    }
}

async fn write_resolution(
    tx: &mut Transaction<'_, Postgres>,
    resolution: &ChangeRequestResolution,
) -> Result<ChangeRequest> {
    let row = sqlx::query(&format!(
        "UPDATE form_change_requests
         SET status = $2, reviewed_by = $3, reviewed_at = $4, resolution_notes = $5
         WHERE id = $1
         RETURNING {}",
        REQUEST_COLUMNS
    ))
    .bind(resolution.request_id)
    .bind(resolution.status.as_str())
    .bind(resolution.reviewed_by)
    .bind(resolution.reviewed_at)
    .bind(&resolution.resolution_notes)
    .fetch_one(&mut **tx)
    .await
    .context("Failed to resolve change request")?;
    request_from_row(&row)
}

#[async_trait::async_trait]
impl UserStore for PostgresStore {
    async fn get_user(&self, id: Id) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE email = $1", USER_COLUMNS))
            .bind(normalize_email(email))
            .fetch_optional(&self.pool)
            .await
            .context("Failed to look up user by e-mail")?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn create_user(&self, user: NewUser) -> Result<User> {
        let row = sqlx::query(&format!(
            "INSERT INTO users (email, name, is_admin) VALUES ($1, $2, $3) RETURNING {}",
            USER_COLUMNS
        ))
        .bind(user.normalized_email())
        .bind(user.name.trim())
        .bind(user.is_admin)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| insert_error(e, format!("user with e-mail '{}'", user.normalized_email())))?;
        user_from_row(&row)
    }

    async fn set_user_admin(&self, id: Id, is_admin: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET is_admin = $2 WHERE id = $1")
            .bind(id)
            .bind(is_admin)
            .execute(&self.pool)
            .await
            .context("Failed to update user")?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl ProjectStore for PostgresStore {
    async fn get_project(&self, id: Id) -> Result<Option<Project>> {
        let row = sqlx::query(&format!("SELECT {} FROM projects WHERE id = $1", PROJECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch project")?;
        row.as_ref().map(project_from_row).transpose()
    }

    async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM projects WHERE name = $1 ORDER BY id LIMIT 1",
            PROJECT_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up project by name")?;
        row.as_ref().map(project_from_row).transpose()
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query(&format!("SELECT {} FROM projects ORDER BY id", PROJECT_COLUMNS))
            .fetch_all(&self.pool)
            .await
            .context("Failed to list projects")?;
        collect(rows, project_from_row)
    }

    async fn list_projects_for_user(&self, user_id: Id) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT p.id, p.name, p.description, p.created_at
             FROM projects p
             JOIN project_memberships m ON m.project_id = p.id
             WHERE m.user_id = $1 AND m.status = 'active'
             ORDER BY p.id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list projects for user")?;
        collect(rows, project_from_row)
    }

    async fn create_project(&self, project: NewProject, owner_id: Id) -> Result<Project> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let row = sqlx::query(&format!(
            "INSERT INTO projects (name, description) VALUES ($1, $2) RETURNING {}",
            PROJECT_COLUMNS
        ))
        .bind(&project.name)
        .bind(&project.description)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to create project")?;
        let project = project_from_row(&row)?;

        sqlx::query(
            "INSERT INTO project_memberships (user_id, project_id, role, status)
             VALUES ($1, $2, 'owner', 'active')",
        )
        .bind(owner_id)
        .bind(project.id)
        .execute(&mut *tx)
        .await
        .context("Failed to create owner membership")?;

        tx.commit().await.context("Failed to commit project")?;
        Ok(project)
    }

    async fn delete_project(&self, id: Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete project")?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl MembershipStore for PostgresStore {
    async fn get_membership(&self, user_id: Id, project_id: Id) -> Result<Option<Membership>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM project_memberships WHERE user_id = $1 AND project_id = $2",
            MEMBERSHIP_COLUMNS
        ))
        .bind(user_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch membership")?;
        row.as_ref().map(membership_from_row).transpose()
    }

    async fn list_memberships(&self, project_id: Id) -> Result<Vec<Membership>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM project_memberships WHERE project_id = $1 ORDER BY created_at, user_id",
            MEMBERSHIP_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list memberships")?;
        collect(rows, membership_from_row)
    }

    async fn insert_membership(&self, membership: Membership) -> Result<()> {
        sqlx::query(
            "INSERT INTO project_memberships (user_id, project_id, role, status, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(membership.user_id)
        .bind(membership.project_id)
        .bind(membership.role.as_str())
        .bind(membership.status.as_str())
        .bind(membership.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            insert_error(
                e,
                format!(
                    "membership for user {} in project {}",
                    membership.user_id, membership.project_id
                ),
            )
        })?;
        Ok(())
    }

    async fn update_membership_role(
        &self,
        user_id: Id,
        project_id: Id,
        role: MembershipRole,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE project_memberships SET role = $3 WHERE user_id = $1 AND project_id = $2",
        )
        .bind(user_id)
        .bind(project_id)
        .bind(role.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to update membership")?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_membership(&self, user_id: Id, project_id: Id) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM project_memberships WHERE user_id = $1 AND project_id = $2")
                .bind(user_id)
                .bind(project_id)
                .execute(&self.pool)
                .await
                .context("Failed to delete membership")?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl SchemaStore for PostgresStore {
    async fn list_fields(&self, project_id: Id) -> Result<Vec<FormField>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM form_fields WHERE project_id = $1",
            FIELD_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list form fields")?;
        Ok(canonical_order(collect(rows, field_from_row)?))
    }

    async fn get_field(&self, id: Id) -> Result<Option<FormField>> {
        let row = sqlx::query(&format!("SELECT {} FROM form_fields WHERE id = $1", FIELD_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch form field")?;
        row.as_ref().map(field_from_row).transpose()
    }

    async fn list_outcomes(&self, project_id: Id) -> Result<Vec<OutcomeDefinition>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM project_outcomes WHERE project_id = $1 ORDER BY id",
            OUTCOME_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list outcomes")?;
        collect(rows, outcome_from_row)
    }

    async fn commit_schema(&self, commit: SchemaCommit) -> Result<SchemaCommitResult> {
        let project_id = commit.project_id;
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        if let Some(resolution) = &commit.resolution {
            lock_pending_request(&mut tx, resolution.request_id).await?;
        }

        for field in &commit.updated_fields {
            let result = sqlx::query(
                "UPDATE form_fields
                 SET section = $3, section_order = $4, label = $5, field_type = $6,
                     required = $7, sort_order = $8, help_text = $9, options = $10
                 WHERE id = $1 AND project_id = $2",
            )
            .bind(field.id)
            .bind(project_id)
            .bind(&field.section)
            .bind(field.section_order)
            .bind(&field.label)
            .bind(field.field_type.as_str())
            .bind(field.required)
            .bind(field.sort_order)
            .bind(&field.help_text)
            .bind(options_json(&field.options)?)
            .execute(&mut *tx)
            .await
            .context("Failed to update form field")?;
            if result.rows_affected() == 0 {
                bail!("Field {} no longer exists in project {}", field.id, project_id);
            }
        }

        for update in &commit.reordered_fields {
            sqlx::query(
                "UPDATE form_fields SET section_order = $3, sort_order = $4
                 WHERE id = $1 AND project_id = $2",
            )
            .bind(update.field_id)
            .bind(project_id)
            .bind(update.section_order)
            .bind(update.sort_order)
            .execute(&mut *tx)
            .await
            .context("Failed to reorder form field")?;
        }

        if !commit.deleted_field_ids.is_empty() {
            sqlx::query("DELETE FROM form_fields WHERE project_id = $1 AND id = ANY($2)")
                .bind(project_id)
                .bind(&commit.deleted_field_ids)
                .execute(&mut *tx)
                .await
                .context("Failed to delete form fields")?;
        }

        let mut result = SchemaCommitResult::default();
        for field in &commit.inserted_fields {
            let row = sqlx::query(&format!(
                "INSERT INTO form_fields
                 (project_id, section, section_order, label, field_type, required, sort_order, help_text, options)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 RETURNING {}",
                FIELD_COLUMNS
            ))
            .bind(project_id)
            .bind(&field.section)
            .bind(field.section_order)
            .bind(&field.label)
            .bind(field.field_type.as_str())
            .bind(field.required)
            .bind(field.sort_order)
            .bind(&field.help_text)
            .bind(options_json(&field.options)?)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to insert form field")?;
            result.inserted_fields.push(field_from_row(&row)?);
        }

        if !commit.deleted_outcome_ids.is_empty() {
            sqlx::query("DELETE FROM project_outcomes WHERE project_id = $1 AND id = ANY($2)")
                .bind(project_id)
                .bind(&commit.deleted_outcome_ids)
                .execute(&mut *tx)
                .await
                .context("Failed to delete outcomes")?;
        }

        for outcome in &commit.inserted_outcomes {
            let row = sqlx::query(&format!(
                "INSERT INTO project_outcomes (project_id, name, outcome_type)
                 VALUES ($1, $2, $3) RETURNING {}",
                OUTCOME_COLUMNS
            ))
            .bind(outcome.project_id)
            .bind(&outcome.name)
            .bind(outcome.outcome_type.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| insert_error(e, format!("outcome '{}'", outcome.name)))?;
            result.inserted_outcomes.push(outcome_from_row(&row)?);
        }

        if let Some(resolution) = &commit.resolution {
            result.resolved_request = Some(write_resolution(&mut tx, resolution).await?);
        }

        tx.commit().await.context("Failed to commit schema change")?;
        Ok(result)
    }
}

#[async_trait::async_trait]
impl StudyStore for PostgresStore {
    async fn get_study(&self, id: Id) -> Result<Option<Study>> {
        let row = sqlx::query(&format!("SELECT {} FROM studies WHERE id = $1", STUDY_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch study")?;
        row.as_ref().map(study_from_row).transpose()
    }

    async fn list_studies(&self, project_id: Id) -> Result<Vec<Study>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM studies WHERE project_id = $1 ORDER BY id",
            STUDY_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list studies")?;
        collect(rows, study_from_row)
    }

    async fn create_study(
        &self,
        project_id: Id,
        study: NewStudy,
        created_by: Option<Id>,
    ) -> Result<Study> {
        let row = sqlx::query(&format!(
            "INSERT INTO studies (project_id, title, author, year, created_by)
             VALUES ($1, $2, $3, $4, $5) RETURNING {}",
            STUDY_COLUMNS
        ))
        .bind(project_id)
        .bind(&study.title)
        .bind(&study.author)
        .bind(study.year)
        .bind(created_by)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create study")?;
        study_from_row(&row)
    }

    async fn delete_study(&self, id: Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM studies WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete study")?;
        Ok(result.rows_affected() > 0)
    }
}

/// Unique violations become `DuplicateEntry`; anything else keeps the
/// usual context
fn insert_error(err: sqlx::Error, what: String) -> anyhow::Error {
    let duplicate = err
        .as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == UNIQUE_VIOLATION)
        .unwrap_or(false);
    if duplicate {
        DuplicateEntry(what).into()
    } else {
        anyhow::Error::new(err).context(format!("Failed to insert {}", what))
    }
}

async fn clear_outcome_rows(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    study_id: Id,
    names: Option<Vec<String>>,
) -> Result<()> {
    match names {
        None => {
            sqlx::query(&format!("DELETE FROM {} WHERE study_id = $1", table))
                .bind(study_id)
                .execute(&mut **tx)
                .await
        }
        Some(names) => {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE study_id = $1 AND outcome_name = ANY($2)",
                table
            ))
            .bind(study_id)
            .bind(names)
            .execute(&mut **tx)
            .await
        }
    }
    .with_context(|| format!("Failed to clear rows of {}", table))?;
    Ok(())
}

fn numerical_name(row: &NumericalOutcome) -> &str {
    &row.outcome_name
}

fn continuous_name(row: &ContinuousOutcome) -> &str {
    &row.outcome_name
}

/// Rows to insert and the delete scope that precedes them
fn outcome_plan<T>(
    write: OutcomeWrite<T>,
    name: fn(&T) -> &str,
) -> Option<(Option<Vec<String>>, Vec<T>)> {
    match write {
        OutcomeWrite::Untouched => None,
        OutcomeWrite::ReplaceAll(rows) => Some((None, rows)),
        OutcomeWrite::UpsertByName(rows) => {
            let names = rows.iter().map(|r| name(r).to_string()).collect();
            Some((Some(names), rows))
        }
    }
}

#[async_trait::async_trait]
impl StudyDataStore for PostgresStore {
    async fn list_values(&self, study_id: Id) -> Result<Vec<StudyValue>> {
        let rows = sqlx::query(
            "SELECT study_id, field_id, value FROM study_values WHERE study_id = $1 ORDER BY field_id",
        )
        .bind(study_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list study values")?;
        collect(rows, value_from_row)
    }

    async fn list_values_for_project(&self, project_id: Id) -> Result<Vec<StudyValue>> {
        let rows = sqlx::query(
            "SELECT v.study_id, v.field_id, v.value
             FROM study_values v
             JOIN studies s ON s.id = v.study_id
             WHERE s.project_id = $1
             ORDER BY v.study_id, v.field_id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list project values")?;
        collect(rows, value_from_row)
    }

    async fn list_numerical_outcomes(&self, study_id: Id) -> Result<Vec<NumericalOutcome>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM study_numerical_outcomes WHERE study_id = $1 ORDER BY id",
            NUMERICAL_COLUMNS
        ))
        .bind(study_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list dichotomous outcome rows")?;
        collect(rows, numerical_from_row)
    }

    async fn list_continuous_outcomes(&self, study_id: Id) -> Result<Vec<ContinuousOutcome>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM study_continuous_outcomes WHERE study_id = $1 ORDER BY id",
            CONTINUOUS_COLUMNS
        ))
        .bind(study_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list continuous outcome rows")?;
        collect(rows, continuous_from_row)
    }

    async fn list_numerical_outcomes_for_project(
        &self,
        project_id: Id,
    ) -> Result<Vec<NumericalOutcome>> {
        let rows = sqlx::query(
            "SELECT o.study_id, o.outcome_name, o.events_intervention, o.total_intervention,
                    o.events_control, o.total_control
             FROM study_numerical_outcomes o
             JOIN studies s ON s.id = o.study_id
             WHERE s.project_id = $1
             ORDER BY o.id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list project dichotomous outcome rows")?;
        collect(rows, numerical_from_row)
    }

    async fn list_continuous_outcomes_for_project(
        &self,
        project_id: Id,
    ) -> Result<Vec<ContinuousOutcome>> {
        let rows = sqlx::query(
            "SELECT o.study_id, o.outcome_name, o.mean_intervention, o.sd_intervention,
                    o.n_intervention, o.mean_control, o.sd_control, o.n_control
             FROM study_continuous_outcomes o
             JOIN studies s ON s.id = o.study_id
             WHERE s.project_id = $1
             ORDER BY o.id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list project continuous outcome rows")?;
        collect(rows, continuous_from_row)
    }

    async fn commit_study_data(&self, commit: StudyDataCommit) -> Result<()> {
        let study_id = commit.study_id;
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let project_id: Option<Id> =
            sqlx::query_scalar("SELECT project_id FROM studies WHERE id = $1 FOR UPDATE")
                .bind(study_id)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to lock study")?;
        let project_id = project_id.ok_or_else(|| anyhow!("Study {} does not exist", study_id))?;

        if !commit.values.is_empty() {
            let field_ids: Vec<Id> = commit.values.iter().map(|v| v.field_id).collect();
            let known: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM form_fields WHERE project_id = $1 AND id = ANY($2)",
            )
            .bind(project_id)
            .bind(&field_ids)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to check form fields")?;
            let distinct: std::collections::HashSet<Id> = field_ids.into_iter().collect();
            if known as usize != distinct.len() {
                bail!("Study {} received values for fields outside its project", study_id);
            }
        }

        for value in &commit.values {
            if value.study_id != study_id {
                bail!("Value for study {} submitted with study {}", value.study_id, study_id);
            }
            sqlx::query(
                "INSERT INTO study_values (study_id, field_id, value) VALUES ($1, $2, $3)
                 ON CONFLICT (study_id, field_id) DO UPDATE SET value = EXCLUDED.value",
            )
            .bind(study_id)
            .bind(value.field_id)
            .bind(&value.value)
            .execute(&mut *tx)
            .await
            .context("Failed to save study value")?;
        }

        if let Some((names, rows)) = outcome_plan(commit.numerical, numerical_name) {
            clear_outcome_rows(&mut tx, "study_numerical_outcomes", study_id, names).await?;
            for row in rows {
                sqlx::query(&format!(
                    "INSERT INTO study_numerical_outcomes ({}) VALUES ($1, $2, $3, $4, $5, $6)",
                    NUMERICAL_COLUMNS
                ))
                .bind(study_id)
                .bind(&row.outcome_name)
                .bind(row.events_intervention)
                .bind(row.total_intervention)
                .bind(row.events_control)
                .bind(row.total_control)
                .execute(&mut *tx)
                .await
                .context("Failed to insert dichotomous outcome row")?;
            }
        }

        if let Some((names, rows)) = outcome_plan(commit.continuous, continuous_name) {
            clear_outcome_rows(&mut tx, "study_continuous_outcomes", study_id, names).await?;
            for row in rows {
                sqlx::query(&format!(
                    "INSERT INTO study_continuous_outcomes ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                    CONTINUOUS_COLUMNS
                ))
                .bind(study_id)
                .bind(&row.outcome_name)
                .bind(row.mean_intervention)
                .bind(row.sd_intervention)
                .bind(row.n_intervention)
                .bind(row.mean_control)
                .bind(row.sd_control)
                .bind(row.n_control)
                .execute(&mut *tx)
                .await
                .context("Failed to insert continuous outcome row")?;
            }
        }

        tx.commit().await.context("Failed to commit study data")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChangeRequestStore for PostgresStore {
    async fn create_change_request(&self, request: NewChangeRequest) -> Result<ChangeRequest> {
        let row = sqlx::query(&format!(
            "INSERT INTO form_change_requests (project_id, requested_by, status, action_type, payload, reason)
             VALUES ($1, $2, 'pending', $3, $4, $5)
             RETURNING {}",
            REQUEST_COLUMNS
        ))
        .bind(request.project_id)
        .bind(request.requested_by)
        .bind(request.action.action_type())
        .bind(request.action.payload())
        .bind(&request.reason)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create change request")?;
        request_from_row(&row)
    }

    async fn get_change_request(&self, id: Id) -> Result<Option<ChangeRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM form_change_requests WHERE id = $1",
            REQUEST_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch change request")?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn list_change_requests(
        &self,
        project_id: Id,
        status: Option<ChangeRequestStatus>,
    ) -> Result<Vec<ChangeRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM form_change_requests
             WHERE project_id = $1 AND ($2::TEXT IS NULL OR status = $2)
             ORDER BY created_at, id",
            REQUEST_COLUMNS
        ))
        .bind(project_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list change requests")?;
        collect(rows, request_from_row)
    }

    async fn resolve_change_request(
        &self,
        resolution: ChangeRequestResolution,
    ) -> Result<ChangeRequest> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        lock_pending_request(&mut tx, resolution.request_id).await?;
        let request = write_resolution(&mut tx, &resolution).await?;
        tx.commit().await.context("Failed to commit resolution")?;
        Ok(request)
    }
}

impl Store for PostgresStore {}
