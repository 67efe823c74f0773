use crate::model::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    /// Always stored lower-cased
    pub email: String,
    pub name: String,
    pub is_admin: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
}

impl NewUser {
    /// Trimmed, lower-cased e-mail used as the unique lookup key
    pub fn normalized_email(&self) -> String {
        normalize_email(&self.email)
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipRole {
    Owner,
    Member,
}

impl MembershipRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipRole::Owner => "owner",
            MembershipRole::Member => "member",
        }
    }
}

impl FromStr for MembershipRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Ok(MembershipRole::Owner),
            "member" => Ok(MembershipRole::Member),
            other => Err(format!("Unknown membership role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipStatus {
    Active,
    Inactive,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Active => "active",
            MembershipStatus::Inactive => "inactive",
        }
    }
}

impl Default for MembershipStatus {
    fn default() -> Self {
        MembershipStatus::Active
    }
}

impl FromStr for MembershipStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(MembershipStatus::Active),
            "inactive" => Ok(MembershipStatus::Inactive),
            other => Err(format!("Unknown membership status '{}'", other)),
        }
    }
}

/// One row per (user, project)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: Id,
    pub project_id: Id,
    pub role: MembershipRole,
    pub status: MembershipStatus,
    pub created_at: DateTime<Utc>,
}

impl Membership {
    pub fn new(user_id: Id, project_id: Id, role: MembershipRole) -> Self {
        Self {
            user_id,
            project_id,
            role,
            status: MembershipStatus::Active,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == MembershipStatus::Active
    }
}

/// Role a user effectively holds on a project after admin override
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectiveRole {
    None,
    Member,
    Owner,
    Admin,
}

impl EffectiveRole {
    pub fn is_member(&self) -> bool {
        *self >= EffectiveRole::Member
    }

    /// Owners and admins may change the schema directly
    pub fn is_owner(&self) -> bool {
        *self >= EffectiveRole::Owner
    }
}

impl fmt::Display for EffectiveRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EffectiveRole::None => "none",
            EffectiveRole::Member => "member",
            EffectiveRole::Owner => "owner",
            EffectiveRole::Admin => "admin",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_role_ordering() {
        assert!(EffectiveRole::Admin.is_owner());
        assert!(EffectiveRole::Owner.is_owner());
        assert!(!EffectiveRole::Member.is_owner());
        assert!(EffectiveRole::Member.is_member());
        assert!(!EffectiveRole::None.is_member());
    }

    #[test]
    fn test_email_normalization() {
        let user = NewUser {
            email: "  Owner@Example.COM ".to_string(),
            name: "Owner".to_string(),
            is_admin: false,
        };
        assert_eq!(user.normalized_email(), "owner@example.com");
    }
}
