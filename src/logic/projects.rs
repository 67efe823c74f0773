use log::info;
use serde::Serialize;

use crate::error::{SrmaError, SrmaResult};
use crate::logic::access::AccessControl;
use crate::model::{
    non_blank, normalize_email, Id, Membership, MembershipRole, MembershipStatus, NewProject,
    NewStudy, NewUser, Project, Study, User, UserContext,
};
use crate::store::traits::Store;

/// A membership joined with the user it belongs to
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberView {
    pub user_id: Id,
    pub email: String,
    pub name: String,
    pub role: MembershipRole,
    pub status: MembershipStatus,
}

pub struct ProjectOperations;

impl ProjectOperations {
    /// Register a user account. Admins only.
    pub async fn create_user<S: Store>(
        store: &S,
        ctx: &UserContext,
        user: NewUser,
    ) -> SrmaResult<User> {
        if !ctx.is_admin {
            return Err(SrmaError::forbidden("only admins can create users"));
        }
        let email = normalize_email(&user.email);
        if email.is_empty() || !email.contains('@') {
            return Err(SrmaError::validation(format!(
                "invalid e-mail address '{}'",
                user.email
            )));
        }
        let name = non_blank(Some(&user.name))
            .ok_or_else(|| SrmaError::validation("name must not be empty"))?;
        if store.find_user_by_email(&email).await?.is_some() {
            return Err(SrmaError::conflict(format!(
                "user with e-mail '{}' already exists",
                email
            )));
        }
        let created = store
            .create_user(NewUser {
                email,
                name,
                is_admin: user.is_admin,
            })
            .await?;
        info!("User {} created by {}", created.email, ctx.label());
        Ok(created)
    }

    /// Any authenticated user may create a project and becomes its owner
    pub async fn create_project<S: Store>(
        store: &S,
        ctx: &UserContext,
        project: NewProject,
    ) -> SrmaResult<Project> {
        let name = non_blank(Some(&project.name))
            .ok_or_else(|| SrmaError::validation("project name must not be empty"))?;
        let created = store
            .create_project(
                NewProject {
                    name,
                    description: non_blank(project.description.as_deref()),
                },
                ctx.user_id,
            )
            .await?;
        info!(
            "Project {} ({}) created by {}",
            created.id,
            created.name,
            ctx.label()
        );
        Ok(created)
    }

    /// Admins see every project, everyone else their active memberships
    pub async fn list_projects<S: Store>(
        store: &S,
        ctx: &UserContext,
    ) -> SrmaResult<Vec<Project>> {
        if ctx.is_admin {
            return Ok(store.list_projects().await?);
        }
        Ok(store.list_projects_for_user(ctx.user_id).await?)
    }

    pub async fn get_project<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
    ) -> SrmaResult<Project> {
        let project = store
            .get_project(project_id)
            .await?
            .ok_or_else(|| SrmaError::not_found(format!("project {}", project_id)))?;
        AccessControl::require_member(store, ctx, project_id).await?;
        Ok(project)
    }

    pub async fn delete_project<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
    ) -> SrmaResult<()> {
        AccessControl::require_project(store, project_id).await?;
        AccessControl::require_owner(store, ctx, project_id).await?;
        store.delete_project(project_id).await?;
        info!("Project {} deleted by {}", project_id, ctx.label());
        Ok(())
    }

    pub async fn list_members<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
    ) -> SrmaResult<Vec<MemberView>> {
        AccessControl::require_project(store, project_id).await?;
        AccessControl::require_member(store, ctx, project_id).await?;
        let mut members = Vec::new();
        for membership in store.list_memberships(project_id).await? {
            if let Some(user) = store.get_user(membership.user_id).await? {
                members.push(MemberView {
                    user_id: user.id,
                    email: user.email,
                    name: user.name,
                    role: membership.role,
                    status: membership.status,
                });
            }
        }
        Ok(members)
    }

    pub async fn add_member<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
        email: &str,
        role: MembershipRole,
    ) -> SrmaResult<Membership> {
        AccessControl::require_project(store, project_id).await?;
        AccessControl::require_owner(store, ctx, project_id).await?;
        let user = store
            .find_user_by_email(&normalize_email(email))
            .await?
            .ok_or_else(|| SrmaError::not_found(format!("user '{}'", email.trim())))?;
        if store.get_membership(user.id, project_id).await?.is_some() {
            return Err(SrmaError::conflict(format!(
                "{} is already a member of project {}",
                user.email, project_id
            )));
        }
        let membership = Membership::new(user.id, project_id, role);
        store.insert_membership(membership.clone()).await?;
        info!(
            "Project {}: {} added as {} by {}",
            project_id,
            user.email,
            role.as_str(),
            ctx.label()
        );
        Ok(membership)
    }

    pub async fn change_member_role<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
        user_id: Id,
        role: MembershipRole,
    ) -> SrmaResult<()> {
        AccessControl::require_project(store, project_id).await?;
        AccessControl::require_owner(store, ctx, project_id).await?;
        let membership = Self::load_membership(store, project_id, user_id).await?;
        if membership.role == MembershipRole::Owner && role != MembershipRole::Owner {
            Self::ensure_other_owner(store, project_id, user_id).await?;
        }
        store
            .update_membership_role(user_id, project_id, role)
            .await?;
        info!(
            "Project {}: user {} is now {} (by {})",
            project_id,
            user_id,
            role.as_str(),
            ctx.label()
        );
        Ok(())
    }

    pub async fn remove_member<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
        user_id: Id,
    ) -> SrmaResult<()> {
        AccessControl::require_project(store, project_id).await?;
        AccessControl::require_owner(store, ctx, project_id).await?;
        let membership = Self::load_membership(store, project_id, user_id).await?;
        if membership.role == MembershipRole::Owner {
            Self::ensure_other_owner(store, project_id, user_id).await?;
        }
        store.delete_membership(user_id, project_id).await?;
        info!(
            "Project {}: user {} removed by {}",
            project_id,
            user_id,
            ctx.label()
        );
        Ok(())
    }

    async fn load_membership<S: Store>(
        store: &S,
        project_id: Id,
        user_id: Id,
    ) -> SrmaResult<Membership> {
        store
            .get_membership(user_id, project_id)
            .await?
            .ok_or_else(|| {
                SrmaError::not_found(format!(
                    "membership of user {} in project {}",
                    user_id, project_id
                ))
            })
    }

    /// A project always keeps at least one active owner
    async fn ensure_other_owner<S: Store>(
        store: &S,
        project_id: Id,
        leaving: Id,
    ) -> SrmaResult<()> {
        let others = store
            .list_memberships(project_id)
            .await?
            .into_iter()
            .filter(|m| m.user_id != leaving && m.role == MembershipRole::Owner && m.is_active())
            .count();
        if others == 0 {
            return Err(SrmaError::conflict(format!(
                "project {} must keep at least one owner",
                project_id
            )));
        }
        Ok(())
    }

    pub async fn create_study<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
        study: NewStudy,
    ) -> SrmaResult<Study> {
        AccessControl::require_project(store, project_id).await?;
        AccessControl::require_member(store, ctx, project_id).await?;
        let title = non_blank(Some(&study.title))
            .ok_or_else(|| SrmaError::validation("study title must not be empty"))?;
        let author = non_blank(Some(&study.author))
            .ok_or_else(|| SrmaError::validation("study author must not be empty"))?;
        let created = store
            .create_study(
                project_id,
                NewStudy {
                    title,
                    author,
                    year: study.year,
                },
                Some(ctx.user_id),
            )
            .await?;
        info!(
            "Project {}: study {} created by {}",
            project_id,
            created.id,
            ctx.label()
        );
        Ok(created)
    }

    pub async fn list_studies<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
    ) -> SrmaResult<Vec<Study>> {
        AccessControl::require_project(store, project_id).await?;
        AccessControl::require_member(store, ctx, project_id).await?;
        Ok(store.list_studies(project_id).await?)
    }

    pub async fn get_study<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
        study_id: Id,
    ) -> SrmaResult<Study> {
        AccessControl::require_project(store, project_id).await?;
        AccessControl::require_member(store, ctx, project_id).await?;
        store
            .get_study(study_id)
            .await?
            .filter(|s| s.project_id == project_id)
            .ok_or_else(|| SrmaError::not_found(format!("study {}", study_id)))
    }

    pub async fn delete_study<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
        study_id: Id,
    ) -> SrmaResult<()> {
        AccessControl::require_project(store, project_id).await?;
        AccessControl::require_owner(store, ctx, project_id).await?;
        let study = Self::get_study(store, ctx, project_id, study_id).await?;
        store.delete_study(study.id).await?;
        info!(
            "Project {}: study {} deleted by {}",
            project_id,
            study.id,
            ctx.label()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::test_support::project_with_roles;
    use crate::store::mem::MemoryStore;
    use crate::store::traits::MembershipStore;

    #[tokio::test]
    async fn test_last_owner_cannot_leave() {
        let store = MemoryStore::new();
        let (project_id, owner, member) = project_with_roles(&store).await;

        let err = ProjectOperations::remove_member(&store, &owner, project_id, owner.user_id)
            .await
            .unwrap_err();
        assert!(matches!(err, SrmaError::Conflict(_)));
        let err = ProjectOperations::change_member_role(
            &store,
            &owner,
            project_id,
            owner.user_id,
            MembershipRole::Member,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SrmaError::Conflict(_)));

        // promote the member, then the original owner may step down
        ProjectOperations::change_member_role(
            &store,
            &owner,
            project_id,
            member.user_id,
            MembershipRole::Owner,
        )
        .await
        .unwrap();
        ProjectOperations::remove_member(&store, &owner, project_id, owner.user_id)
            .await
            .unwrap();
        assert!(store
            .get_membership(owner.user_id, project_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_add_member_by_email() {
        let store = MemoryStore::new();
        let (project_id, owner, member) = project_with_roles(&store).await;
        let admin = UserContext::new(0, true);
        ProjectOperations::create_user(
            &store,
            &admin,
            NewUser {
                email: " Reviewer@Example.com".to_string(),
                name: "Reviewer".to_string(),
                is_admin: false,
            },
        )
        .await
        .unwrap();

        assert!(matches!(
            ProjectOperations::add_member(
                &store,
                &member,
                project_id,
                "reviewer@example.com",
                MembershipRole::Member
            )
            .await,
            Err(SrmaError::Forbidden(_))
        ));
        ProjectOperations::add_member(
            &store,
            &owner,
            project_id,
            "REVIEWER@example.com",
            MembershipRole::Member,
        )
        .await
        .unwrap();
        assert!(matches!(
            ProjectOperations::add_member(
                &store,
                &owner,
                project_id,
                "reviewer@example.com",
                MembershipRole::Owner
            )
            .await,
            Err(SrmaError::Conflict(_))
        ));
        assert!(matches!(
            ProjectOperations::add_member(
                &store,
                &owner,
                project_id,
                "nobody@example.com",
                MembershipRole::Member
            )
            .await,
            Err(SrmaError::NotFound(_))
        ));

        let members = ProjectOperations::list_members(&store, &member, project_id)
            .await
            .unwrap();
        assert_eq!(members.len(), 3);
        assert!(members.iter().any(|m| m.email == "reviewer@example.com"));
    }

    #[tokio::test]
    async fn test_only_admins_create_users() {
        let store = MemoryStore::new();
        let (_, owner, _) = project_with_roles(&store).await;
        let new_user = NewUser {
            email: "x@example.com".to_string(),
            name: "X".to_string(),
            is_admin: false,
        };
        assert!(matches!(
            ProjectOperations::create_user(&store, &owner, new_user.clone()).await,
            Err(SrmaError::Forbidden(_))
        ));
        let admin = UserContext::new(0, true);
        ProjectOperations::create_user(&store, &admin, new_user.clone())
            .await
            .unwrap();
        assert!(matches!(
            ProjectOperations::create_user(&store, &admin, new_user).await,
            Err(SrmaError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_project_visibility_and_study_rules() {
        let store = MemoryStore::new();
        let (project_id, owner, member) = project_with_roles(&store).await;
        let outsider = UserContext::new(999, false);

        assert_eq!(
            ProjectOperations::list_projects(&store, &member)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(ProjectOperations::list_projects(&store, &outsider)
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            ProjectOperations::get_project(&store, &outsider, project_id).await,
            Err(SrmaError::Forbidden(_))
        ));
        assert!(matches!(
            ProjectOperations::get_project(&store, &owner, 424242).await,
            Err(SrmaError::NotFound(_))
        ));

        let blank = NewStudy {
            title: "  ".to_string(),
            author: "Smith".to_string(),
            year: 2020,
        };
        assert!(matches!(
            ProjectOperations::create_study(&store, &member, project_id, blank).await,
            Err(SrmaError::Validation(_))
        ));
        let study = ProjectOperations::create_study(
            &store,
            &member,
            project_id,
            NewStudy {
                title: "Trial".to_string(),
                author: "Smith".to_string(),
                year: 2020,
            },
        )
        .await
        .unwrap();
        assert_eq!(study.created_by, Some(member.user_id));

        assert!(matches!(
            ProjectOperations::delete_study(&store, &member, project_id, study.id).await,
            Err(SrmaError::Forbidden(_))
        ));
        ProjectOperations::delete_study(&store, &owner, project_id, study.id)
            .await
            .unwrap();
        assert!(ProjectOperations::list_studies(&store, &owner, project_id)
            .await
            .unwrap()
            .is_empty());
    }
}
