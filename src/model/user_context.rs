use crate::model::{Id, User};
use serde::{Deserialize, Serialize};

/// Identity of the caller, passed explicitly into every access check and
/// mutation instead of being looked up from ambient request state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: Id,
    pub is_admin: bool,
    pub user_email: Option<String>,
    pub user_name: Option<String>,
}

impl UserContext {
    /// Create a new UserContext with just a user ID
    pub fn new(user_id: Id, is_admin: bool) -> Self {
        Self {
            user_id,
            is_admin,
            user_email: None,
            user_name: None,
        }
    }

    /// Create a UserContext with full user information
    pub fn with_details(
        user_id: Id,
        is_admin: bool,
        email: Option<String>,
        name: Option<String>,
    ) -> Self {
        Self {
            user_id,
            is_admin,
            user_email: email,
            user_name: name,
        }
    }

    /// Display name for log lines
    pub fn label(&self) -> String {
        match &self.user_email {
            Some(email) => format!("{} <{}>", self.user_id, email),
            None => self.user_id.to_string(),
        }
    }
}

impl From<&User> for UserContext {
    fn from(user: &User) -> Self {
        Self::with_details(
            user.id,
            user.is_admin,
            Some(user.email.clone()),
            Some(user.name.clone()),
        )
    }
}
