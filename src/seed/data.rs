use crate::logic::{DataEntry, FormEditor, FormSubmission};
use crate::model::{
    AddFieldPayload, ChangeAction, ContinuousOutcomeInput, FieldType, Id, Membership,
    MembershipRole, NewProject, NewStudy, NewUser, NumericalOutcomeInput, OutcomeType, User,
    UserContext,
};
use crate::store::traits::Store;
use anyhow::Result;
use log::info;
use serde_json::json;
use std::collections::BTreeMap;

pub const DEMO_PROJECT_NAME: &str = "Demo SRMA";
pub const DEMO_ADMIN_EMAIL: &str = "admin@example.com";
pub const DEMO_MEMBER_EMAIL: &str = "member@example.com";

const MORTALITY: &str = "Mortality at 30 days";
const BMI: &str = "BMI at baseline";

/// Load the demo project. Users are reused by e-mail and an existing
/// project of the same name is left untouched.
pub async fn load_seed_data<S: Store>(store: &S) -> Result<()> {
    let admin = ensure_user(store, DEMO_ADMIN_EMAIL, "Demo Admin", true).await?;
    let member = ensure_user(store, DEMO_MEMBER_EMAIL, "Demo Member", false).await?;

    if let Some(project) = store.find_project_by_name(DEMO_PROJECT_NAME).await? {
        info!(
            "Demo project already exists (id {}) - skipping to preserve user changes",
            project.id
        );
        return Ok(());
    }

    let project = store
        .create_project(
            NewProject {
                name: DEMO_PROJECT_NAME.to_string(),
                description: Some("Example systematic review with a small custom form".to_string()),
            },
            admin.id,
        )
        .await?;
    store
        .insert_membership(Membership::new(member.id, project.id, MembershipRole::Member))
        .await?;

    let ctx = UserContext::from(&admin);
    load_form(store, &ctx, project.id).await?;
    load_studies(store, &ctx, project.id).await?;

    info!(
        "Demo data loaded: project {} ({}), users {} and {}",
        project.id, project.name, admin.email, member.email
    );
    Ok(())
}

async fn ensure_user<S: Store>(store: &S, email: &str, name: &str, is_admin: bool) -> Result<User> {
    if let Some(user) = store.find_user_by_email(email).await? {
        return Ok(user);
    }
    store
        .create_user(NewUser {
            email: email.to_string(),
            name: name.to_string(),
            is_admin,
        })
        .await
}

fn field(section: &str, label: &str, field_type: FieldType, help: Option<&str>) -> ChangeAction {
    ChangeAction::AddField(AddFieldPayload {
        section: section.to_string(),
        label: label.to_string(),
        field_type,
        required: false,
        help_text: help.map(str::to_string),
        options: None,
    })
}

async fn load_form<S: Store>(store: &S, ctx: &UserContext, project_id: Id) -> Result<()> {
    let actions = [
        field(
            "Participants",
            "Age",
            FieldType::BaselineContinuous,
            Some("Mean and SD per group"),
        ),
        field(
            "Participants",
            "Female sex",
            FieldType::BaselineCategorical,
            Some("Percent per group"),
        ),
        field(
            "Study Identification",
            "Study registration",
            FieldType::Text,
            None,
        ),
        ChangeAction::AddOutcome {
            name: MORTALITY.to_string(),
            outcome_type: OutcomeType::Dichotomous,
        },
        ChangeAction::AddOutcome {
            name: BMI.to_string(),
            outcome_type: OutcomeType::Continuous,
        },
    ];
    for action in actions {
        FormEditor::submit(store, ctx, project_id, action, None).await?;
    }
    Ok(())
}

async fn load_studies<S: Store>(store: &S, ctx: &UserContext, project_id: Id) -> Result<()> {
    let fields = store.list_fields(project_id).await?;
    let field_id = |label: &str| {
        fields
            .iter()
            .find(|f| f.label == label)
            .map(|f| f.id)
            .ok_or_else(|| anyhow::anyhow!("demo field '{}' missing", label))
    };
    let age = field_id("Age")?;
    let female = field_id("Female sex")?;
    let registration = field_id("Study registration")?;

    let studies = [
        (
            "Early statin therapy after cardiac surgery",
            "Smith",
            2019,
            "NCT01000001",
            (64.2, 9.8, 63.7, 10.4),
            (28.0, 31.5),
            (12, 210, 19, 205),
        ),
        (
            "Perioperative statins in elderly patients",
            "Garcia",
            2021,
            "NCT02000002",
            (71.5, 6.1, 70.9, 6.8),
            (44.0, 41.2),
            (8, 150, 11, 148),
        ),
    ];

    for (title, author, year, reg, age_stats, female_pct, mortality) in studies {
        let study = store
            .create_study(
                project_id,
                NewStudy {
                    title: title.to_string(),
                    author: author.to_string(),
                    year,
                },
                Some(ctx.user_id),
            )
            .await?;

        let submission = FormSubmission {
            values: BTreeMap::from([
                (
                    age,
                    json!({
                        "intervention": {"mean": age_stats.0, "sd": age_stats.1},
                        "control": {"mean": age_stats.2, "sd": age_stats.3},
                    }),
                ),
                (
                    female,
                    json!({
                        "intervention": {"percent": female_pct.0},
                        "control": {"percent": female_pct.1},
                    }),
                ),
                (registration, json!(reg)),
            ]),
            numerical_outcomes: Some(vec![NumericalOutcomeInput {
                outcome_name: MORTALITY.to_string(),
                events_intervention: json!(mortality.0),
                total_intervention: json!(mortality.1),
                events_control: json!(mortality.2),
                total_control: json!(mortality.3),
            }]),
            continuous_outcomes: Some(vec![ContinuousOutcomeInput {
                outcome_name: BMI.to_string(),
                mean_intervention: json!(27.4),
                sd_intervention: json!(4.2),
                n_intervention: json!(mortality.1),
                mean_control: json!(27.9),
                sd_control: json!(4.5),
                n_control: json!(mortality.3),
            }]),
        };
        DataEntry::submit_form(store, ctx, project_id, study.id, submission).await?;
    }
    Ok(())
}
