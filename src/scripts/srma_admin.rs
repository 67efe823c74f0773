//! Administrative commands run against the configured Postgres database.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use srma_extract::config::AppConfig;
use srma_extract::logic::TemplateLoader;
use srma_extract::model::{normalize_email, Id, Membership, MembershipRole, NewUser, UserContext};
use srma_extract::store::traits::{MembershipStore, ProjectStore, UserStore};
use srma_extract::store::PostgresStore;

#[derive(Debug, Parser)]
#[command(name = "srma-admin", about = "Administration for the SRMA extraction service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a user account
    CreateUser {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        /// Grant the global admin flag
        #[arg(long)]
        admin: bool,
    },

    /// Grant the global admin flag to an existing user
    PromoteAdmin { email: String },

    /// Add a user to a project, or change the role of an existing member
    AddMembership {
        email: String,
        project_id: Id,
        /// owner or member
        role: MembershipRole,
    },

    /// Append the fields of a YAML form template to a project
    LoadTemplate {
        project_id: Id,
        file: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = AppConfig::load()?;
    let store = PostgresStore::new(&config.database_url(), config.max_connections()).await?;
    store.migrate().await?;

    match cli.command {
        Command::CreateUser { name, email, admin } => {
            let email = normalize_email(&email);
            if store.find_user_by_email(&email).await?.is_some() {
                bail!("User with e-mail '{}' already exists", email);
            }
            let user = store
                .create_user(NewUser {
                    email,
                    name,
                    is_admin: admin,
                })
                .await?;
            println!("Created user {} <{}> (admin: {})", user.id, user.email, user.is_admin);
        }
        Command::PromoteAdmin { email } => {
            let user = store
                .find_user_by_email(&normalize_email(&email))
                .await?
                .with_context(|| format!("No user with e-mail '{}'", email))?;
            store.set_user_admin(user.id, true).await?;
            println!("{} is now an admin", user.email);
        }
        Command::AddMembership {
            email,
            project_id,
            role,
        } => {
            let user = store
                .find_user_by_email(&normalize_email(&email))
                .await?
                .with_context(|| format!("No user with e-mail '{}'", email))?;
            let project = store
                .get_project(project_id)
                .await?
                .with_context(|| format!("No project with id {}", project_id))?;
            if store.get_membership(user.id, project.id).await?.is_some() {
                store
                    .update_membership_role(user.id, project.id, role)
                    .await?;
            } else {
                store
                    .insert_membership(Membership::new(user.id, project.id, role))
                    .await?;
            }
            println!(
                "{} is {} of project {} ({})",
                user.email,
                role.as_str(),
                project.id,
                project.name
            );
        }
        Command::LoadTemplate { project_id, file } => {
            let yaml = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read template {}", file.display()))?;
            let operator = UserContext::with_details(
                0,
                true,
                None,
                Some("srma-admin".to_string()),
            );
            let fields = TemplateLoader::load(&store, &operator, project_id, &yaml).await?;
            println!(
                "Loaded {} fields from {} into project {}",
                fields.len(),
                file.display(),
                project_id
            );
        }
    }

    Ok(())
}
