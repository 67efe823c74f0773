use crate::model::{Id, Membership, MembershipRole, NewProject, NewUser, UserContext};
use crate::store::mem::MemoryStore;
use crate::store::traits::{MembershipStore, ProjectStore, UserStore};

/// A project with one owner and one plain member
pub async fn project_with_roles(store: &MemoryStore) -> (Id, UserContext, UserContext) {
    let owner = store
        .create_user(NewUser {
            email: "owner@example.com".to_string(),
            name: "Owner".to_string(),
            is_admin: false,
        })
        .await
        .unwrap();
    let member = store
        .create_user(NewUser {
            email: "member@example.com".to_string(),
            name: "Member".to_string(),
            is_admin: false,
        })
        .await
        .unwrap();
    let project = store
        .create_project(
            NewProject {
                name: "Review".to_string(),
                description: None,
            },
            owner.id,
        )
        .await
        .unwrap();
    store
        .insert_membership(Membership::new(member.id, project.id, MembershipRole::Member))
        .await
        .unwrap();
    (project.id, UserContext::from(&owner), UserContext::from(&member))
}
