//! Records held in the document store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Department id meaning "not yet assigned"
pub const PENDING_DEPARTMENT_ID: &str = "pending";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Faculty,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin | Role::SuperAdmin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Faculty => "faculty",
            Role::Admin => "admin",
            Role::SuperAdmin => "superadmin",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "faculty" => Ok(Role::Faculty),
            "admin" => Ok(Role::Admin),
            "superadmin" => Ok(Role::SuperAdmin),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Denied,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Pending => "pending",
            UserStatus::Approved => "approved",
            UserStatus::Rejected => "rejected",
            UserStatus::Denied => "denied",
        }
    }
}

impl std::str::FromStr for UserStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(UserStatus::Pending),
            "approved" => Ok(UserStatus::Approved),
            "rejected" => Ok(UserStatus::Rejected),
            "denied" => Ok(UserStatus::Denied),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// A portal account.
///
/// `verified` is the canonical email-confirmation flag. `email_verified` is
/// kept only as a mirror for documents written by older deployments; it is
/// folded into `verified` on load and rewritten alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    /// Argon2 PHC string, absent for accounts created by an administrator
    /// until the faculty link is completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub middle_name: Option<String>,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub department_id: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub status: UserStatus,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_code_expires: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_token_expires: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

impl User {
    pub fn new(email: &str, first_name: &str, last_name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.trim().to_lowercase(),
            password: None,
            first_name: first_name.trim().to_string(),
            middle_name: None,
            last_name: last_name.trim().to_string(),
            department_id: Some(PENDING_DEPARTMENT_ID.to_string()),
            role: Role::User,
            status: UserStatus::Pending,
            verified: false,
            email_verified: false,
            verification_code: None,
            verification_code_expires: None,
            verification_token: None,
            verification_token_expires: None,
            created_at: now,
            updated_at: now,
            approved_at: None,
            rejected_at: None,
            updated_by: None,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn set_verified(&mut self, verified: bool) {
        self.verified = verified;
        self.email_verified = verified;
    }

    /// Fold the legacy flag into the canonical one
    pub fn normalize(&mut self) {
        let verified = self.verified || self.email_verified;
        self.set_verified(verified);
        self.email = self.email.trim().to_lowercase();
    }

    pub fn has_department(&self) -> bool {
        self.department_id
            .as_deref()
            .is_some_and(|d| !d.is_empty() && d != PENDING_DEPARTMENT_ID)
    }

    pub fn clear_verification_code(&mut self) {
        self.verification_code = None;
        self.verification_code_expires = None;
    }

    pub fn clear_verification_token(&mut self) {
        self.verification_token = None;
        self.verification_token_expires = None;
    }

    pub fn touch(&mut self, by: Option<&str>) {
        self.updated_at = Utc::now();
        if let Some(by) = by {
            self.updated_by = Some(by.to_string());
        }
    }
}

/// Account view safe to return over HTTP
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub department_id: Option<String>,
    pub role: Role,
    pub status: UserStatus,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            verified: user.is_verified(),
            id: user.id,
            email: user.email,
            first_name: user.first_name,
            middle_name: user.middle_name,
            last_name: user.last_name,
            department_id: user.department_id,
            role: user.role,
            status: user.status,
            created_at: user.created_at,
            approved_at: user.approved_at,
            rejected_at: user.rejected_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Department {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    /// Fields owned by the department manager
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Every collection of the portal, taken as one unit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub departments: Vec<Department>,
    #[serde(default)]
    pub subjects: Vec<serde_json::Value>,
    #[serde(default)]
    pub rooms: Vec<serde_json::Value>,
    #[serde(default)]
    pub schedule: Vec<serde_json::Value>,
    #[serde(default)]
    pub fixed_schedules: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_email_verified_is_folded() {
        let json = r#"{
            "id": "u1",
            "email": " Old@School.EDU ",
            "emailVerified": true,
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedAt": "2024-01-01T00:00:00Z"
        }"#;
        let mut user: User = serde_json::from_str(json).unwrap();
        assert!(!user.verified);
        assert_eq!(user.status, UserStatus::Pending);
        assert_eq!(user.role, Role::User);

        user.normalize();
        assert!(user.is_verified());
        assert!(user.email_verified);
        assert_eq!(user.email, "old@school.edu");
    }

    #[test]
    fn test_user_response_hides_secrets() {
        let mut user = User::new("a@x.com", "Ada", "Lovelace");
        user.password = Some("$argon2id$secret".to_string());
        user.verification_code = Some("123456".to_string());

        let body = serde_json::to_string(&UserResponse::from(user)).unwrap();
        assert!(!body.contains("argon2"));
        assert!(!body.contains("123456"));
        assert!(body.contains("\"firstName\":\"Ada\""));
    }

    #[test]
    fn test_pending_department_is_not_assigned() {
        let mut user = User::new("a@x.com", "Ada", "Lovelace");
        assert!(!user.has_department());
        user.department_id = Some("cs".to_string());
        assert!(user.has_department());
        user.department_id = None;
        assert!(!user.has_department());
    }

    #[test]
    fn test_snapshot_uses_document_field_names() {
        let snapshot: Snapshot = serde_json::from_str(r#"{"users": [], "fixedSchedules": [{"id": 1}]}"#).unwrap();
        assert_eq!(snapshot.fixed_schedules.len(), 1);
        assert!(snapshot.rooms.is_empty());

        let out = serde_json::to_value(&snapshot).unwrap();
        for key in ["users", "departments", "subjects", "rooms", "schedule", "fixedSchedules"] {
            assert!(out.get(key).is_some(), "missing {}", key);
        }
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("SuperAdmin".parse::<Role>().unwrap(), Role::SuperAdmin);
        assert!(Role::Admin.is_admin());
        assert!(!Role::Faculty.is_admin());
        assert!("janitor".parse::<Role>().is_err());
        assert_eq!(serde_json::to_string(&Role::SuperAdmin).unwrap(), "\"superadmin\"");
    }
}
