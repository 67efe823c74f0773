use crate::error::{SrmaError, SrmaResult};
use crate::model::{EffectiveRole, Id, MembershipRole, UserContext};
use crate::store::traits::Store;

pub struct AccessControl;

impl AccessControl {
    /// Admin is a global flag and wins over any membership; otherwise the
    /// active membership row decides.
    pub async fn effective_role<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
    ) -> SrmaResult<EffectiveRole> {
        if ctx.is_admin {
            return Ok(EffectiveRole::Admin);
        }
        let membership = store.get_membership(ctx.user_id, project_id).await?;
        Ok(match membership {
            Some(m) if m.is_active() => match m.role {
                MembershipRole::Owner => EffectiveRole::Owner,
                MembershipRole::Member => EffectiveRole::Member,
            },
            _ => EffectiveRole::None,
        })
    }

    pub async fn require_member<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
    ) -> SrmaResult<EffectiveRole> {
        let role = Self::effective_role(store, ctx, project_id).await?;
        if !role.is_member() {
            return Err(SrmaError::forbidden(format!(
                "user {} is not a member of project {}",
                ctx.user_id, project_id
            )));
        }
        Ok(role)
    }

    pub async fn require_owner<S: Store>(
        store: &S,
        ctx: &UserContext,
        project_id: Id,
    ) -> SrmaResult<EffectiveRole> {
        let role = Self::effective_role(store, ctx, project_id).await?;
        if !role.is_owner() {
            return Err(SrmaError::forbidden(format!(
                "user {} is not an owner of project {}",
                ctx.user_id, project_id
            )));
        }
        Ok(role)
    }

    /// Fails with NotFound before any role check so missing projects are
    /// reported consistently
    pub async fn require_project<S: Store>(store: &S, project_id: Id) -> SrmaResult<()> {
        match store.get_project(project_id).await? {
            Some(_) => Ok(()),
            None => Err(SrmaError::not_found(format!("project {}", project_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Membership, MembershipStatus, NewProject, NewUser};
    use crate::store::mem::MemoryStore;
    use crate::store::traits::{MembershipStore, ProjectStore, UserStore};

    async fn user(store: &MemoryStore, email: &str, is_admin: bool) -> UserContext {
        let user = store
            .create_user(NewUser {
                email: email.to_string(),
                name: email.to_string(),
                is_admin,
            })
            .await
            .unwrap();
        UserContext::from(&user)
    }

    #[tokio::test]
    async fn test_roles_resolve_from_membership_and_admin_flag() {
        let store = MemoryStore::new();
        let owner = user(&store, "owner@example.com", false).await;
        let member = user(&store, "member@example.com", false).await;
        let admin = user(&store, "admin@example.com", true).await;
        let outsider = user(&store, "outsider@example.com", false).await;
        let project = store
            .create_project(
                NewProject {
                    name: "P".to_string(),
                    description: None,
                },
                owner.user_id,
            )
            .await
            .unwrap();
        store
            .insert_membership(Membership::new(
                member.user_id,
                project.id,
                MembershipRole::Member,
            ))
            .await
            .unwrap();

        for (ctx, expected) in [
            (&owner, EffectiveRole::Owner),
            (&member, EffectiveRole::Member),
            (&admin, EffectiveRole::Admin),
            (&outsider, EffectiveRole::None),
        ] {
            let role = AccessControl::effective_role(&store, ctx, project.id)
                .await
                .unwrap();
            assert_eq!(role, expected);
        }

        assert!(AccessControl::require_owner(&store, &admin, project.id).await.is_ok());
        assert!(matches!(
            AccessControl::require_owner(&store, &member, project.id).await,
            Err(SrmaError::Forbidden(_))
        ));
        assert!(matches!(
            AccessControl::require_member(&store, &outsider, project.id).await,
            Err(SrmaError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_inactive_membership_grants_nothing() {
        let store = MemoryStore::new();
        let owner = user(&store, "owner@example.com", false).await;
        let former = user(&store, "former@example.com", false).await;
        let project = store
            .create_project(
                NewProject {
                    name: "P".to_string(),
                    description: None,
                },
                owner.user_id,
            )
            .await
            .unwrap();
        let mut membership = Membership::new(former.user_id, project.id, MembershipRole::Owner);
        membership.status = MembershipStatus::Inactive;
        store.insert_membership(membership).await.unwrap();

        let role = AccessControl::effective_role(&store, &former, project.id)
            .await
            .unwrap();
        assert_eq!(role, EffectiveRole::None);
    }
}
