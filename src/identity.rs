//! User identities and roles
use super::contract::TimeStamp;
use super::error::ValidationError;
use chrono::Utc;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, minicbor::Encode, minicbor::Decode)]
pub enum Role {
    #[n(0)]
    ProjectManager,
    #[n(1)]
    ProgramManager,
    #[n(2)]
    Director,
    #[n(3)]
    SuperAdmin,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::ProjectManager,
        Role::ProgramManager,
        Role::Director,
        Role::SuperAdmin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::ProjectManager => "project_manager",
            Role::ProgramManager => "program_manager",
            Role::Director => "director",
            Role::SuperAdmin => "super_admin",
        }
    }

    /// Roles a user may pick for themselves at registration
    pub fn is_self_registrable(&self) -> bool {
        matches!(self, Role::ProjectManager | Role::ProgramManager)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| ValidationError::InvalidValue {
                field: "role",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct User {
    #[n(0)]
    pub id: String, // uuid7, use bech32
    #[n(1)]
    pub handle: String,
    #[n(2)]
    pub email: String,
    #[n(3)]
    pub full_name: String,
    #[n(4)]
    pub role: Role,
    #[n(5)]
    pub active: bool,
    #[n(6)]
    pub department: Option<String>,
    #[n(7)]
    pub company: Option<String>,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub updated_at: TimeStamp<Utc>,
}

impl User {
    /// Name used in history entries, falls back to the handle
    pub fn display_name(&self) -> &str {
        if self.full_name.is_empty() {
            &self.handle
        } else {
            &self.full_name
        }
    }
}

/// Registration payload
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub handle: String,
    pub email: String,
    pub full_name: String,
    pub role: Option<Role>,
    pub department: Option<String>,
    pub company: Option<String>,
}

impl NewUser {
    pub fn new(handle: &str, email: &str, role: Role) -> Self {
        Self {
            handle: handle.to_string(),
            email: email.to_string(),
            role: Some(role),
            ..Self::default()
        }
    }
    pub fn set_full_name(mut self, name: &str) -> Self {
        self.full_name = name.to_string();
        self
    }
    pub fn set_department(mut self, department: &str) -> Self {
        self.department = Some(department.to_string());
        self
    }
    pub fn set_company(mut self, company: &str) -> Self {
        self.company = Some(company.to_string());
        self
    }

    pub(crate) fn validate(&self) -> Result<Role, ValidationError> {
        if self.handle.trim().is_empty() {
            return Err(ValidationError::EmptyField("handle"));
        }
        if !self.email.contains('@') {
            return Err(ValidationError::InvalidValue {
                field: "email",
                value: self.email.clone(),
            });
        }
        self.role.ok_or(ValidationError::EmptyField("role"))
    }

    pub(crate) fn into_user(self, id: String, role: Role) -> User {
        let now = TimeStamp::new();
        User {
            id,
            handle: self.handle.trim().to_string(),
            email: self.email.trim().to_lowercase(),
            full_name: self.full_name,
            role,
            active: true,
            department: self.department,
            company: self.company,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Administrative changes to an account, unset fields are left alone
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub role: Option<Role>,
    pub active: Option<bool>,
    pub department: Option<String>,
    pub company: Option<String>,
}

impl UserUpdate {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }
    pub fn set_full_name(mut self, name: &str) -> Self {
        self.full_name = Some(name.to_string());
        self
    }
    pub fn set_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }
    pub fn set_active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }
    pub fn set_department(mut self, department: &str) -> Self {
        self.department = Some(department.to_string());
        self
    }
    pub fn set_company(mut self, company: &str) -> Self {
        self.company = Some(company.to_string());
        self
    }

    /// Returns the updated user and the names of the fields that changed
    pub(crate) fn apply_to(&self, user: &User) -> Result<(User, Vec<&'static str>), ValidationError> {
        let mut next = user.clone();
        let mut changed = Vec::new();

        if let Some(email) = &self.email {
            let email = email.trim().to_lowercase();
            if !email.contains('@') {
                return Err(ValidationError::InvalidValue {
                    field: "email",
                    value: email,
                });
            }
            if email != user.email {
                next.email = email;
                changed.push("email");
            }
        }
        if let Some(name) = &self.full_name {
            if name != &user.full_name {
                next.full_name = name.clone();
                changed.push("full_name");
            }
        }
        if let Some(role) = self.role {
            if role != user.role {
                next.role = role;
                changed.push("role");
            }
        }
        if let Some(active) = self.active {
            if active != user.active {
                next.active = active;
                changed.push("active");
            }
        }
        if let Some(department) = &self.department {
            if user.department.as_ref() != Some(department) {
                next.department = Some(department.clone());
                changed.push("department");
            }
        }
        if let Some(company) = &self.company {
            if user.company.as_ref() != Some(company) {
                next.company = Some(company.clone());
                changed.push("company");
            }
        }

        if changed.is_empty() {
            return Err(ValidationError::NoChanges);
        }
        next.updated_at = TimeStamp::new();

        Ok((next, changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> User {
        NewUser::new("ada", "Ada@Example.org", Role::ProjectManager)
            .set_full_name("Ada Lovelace")
            .into_user("user_1".into(), Role::ProjectManager)
    }

    #[test]
    fn email_is_normalised_on_creation() {
        assert_eq!(sample_user().email, "ada@example.org");
    }

    #[test]
    fn registration_requires_role_and_email() {
        let mut new_user = NewUser::new("bob", "bob@example.org", Role::Director);
        assert_eq!(new_user.validate().unwrap(), Role::Director);

        new_user.role = None;
        assert_eq!(new_user.validate(), Err(ValidationError::EmptyField("role")));

        let bad_email = NewUser::new("bob", "bob.example.org", Role::Director);
        assert!(bad_email.validate().is_err());
    }

    #[test]
    fn update_reports_changed_fields() {
        let user = sample_user();
        let (next, changed) = UserUpdate::new()
            .set_role(Role::ProgramManager)
            .set_full_name("Ada Lovelace")
            .apply_to(&user)
            .unwrap();

        assert_eq!(changed, vec!["role"]);
        assert_eq!(next.role, Role::ProgramManager);
    }

    #[test]
    fn empty_update_is_rejected() {
        let user = sample_user();
        assert_eq!(
            UserUpdate::new().set_active(true).apply_to(&user).unwrap_err(),
            ValidationError::NoChanges
        );
    }

    #[test]
    fn only_reviewers_and_creators_self_register() {
        assert!(Role::ProjectManager.is_self_registrable());
        assert!(Role::ProgramManager.is_self_registrable());
        assert!(!Role::Director.is_self_registrable());
        assert!(!Role::SuperAdmin.is_self_registrable());
    }
}
