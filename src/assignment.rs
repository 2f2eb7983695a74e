//! Assignment reconciliation and notification records
use super::contract::TimeStamp;
use super::identity::Role;
use chrono::Utc;
use std::collections::BTreeSet;
use uuid7::uuid7;

/// Role-scoped assignee sets stored on the contract
#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Assignments {
    #[n(0)]
    pub project_managers: BTreeSet<String>,
    #[n(1)]
    pub program_managers: BTreeSet<String>,
    #[n(2)]
    pub directors: BTreeSet<String>,
}

impl Assignments {
    pub fn new<I, S>(project_managers: I, program_managers: I, directors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            project_managers: project_managers.into_iter().map(Into::into).collect(),
            program_managers: program_managers.into_iter().map(Into::into).collect(),
            directors: directors.into_iter().map(Into::into).collect(),
        }
    }

    pub fn of(&self, role: Role) -> Option<&BTreeSet<String>> {
        match role {
            Role::ProjectManager => Some(&self.project_managers),
            Role::ProgramManager => Some(&self.program_managers),
            Role::Director => Some(&self.directors),
            Role::SuperAdmin => None,
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.project_managers.contains(user_id)
            || self.program_managers.contains(user_id)
            || self.directors.contains(user_id)
    }

    /// Set differences per role category, `added` is what gets notified
    pub fn delta(&self, next: &Assignments) -> AssignmentDelta {
        let mut added = Vec::new();
        let mut removed = Vec::new();

        for role in ASSIGNABLE_ROLES {
            let (Some(before), Some(after)) = (self.of(role), next.of(role)) else {
                continue;
            };
            added.extend(after.difference(before).map(|id| (role, id.clone())));
            removed.extend(before.difference(after).map(|id| (role, id.clone())));
        }

        AssignmentDelta { added, removed }
    }
}

pub const ASSIGNABLE_ROLES: [Role; 3] = [Role::ProjectManager, Role::ProgramManager, Role::Director];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentDelta {
    pub added: Vec<(Role, String)>,
    pub removed: Vec<(Role, String)>,
}

impl AssignmentDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn added_ids(&self) -> BTreeSet<String> {
        self.added.iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn removed_ids(&self) -> BTreeSet<String> {
        self.removed.iter().map(|(_, id)| id.clone()).collect()
    }
}

/// One per newly assigned user
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Notification {
    #[n(0)]
    pub id: [u8; 16],
    #[n(1)]
    pub user_id: String,
    #[n(2)]
    pub contract_id: String,
    #[n(3)]
    pub role: Role,
    #[n(4)]
    pub assigned_by: String,
    #[n(5)]
    pub message: String,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

impl Notification {
    pub fn assignment(contract_id: &str, user_id: &str, role: Role, assigned_by: &str) -> Self {
        Self {
            id: *uuid7().as_bytes(),
            user_id: user_id.to_string(),
            contract_id: contract_id.to_string(),
            role,
            assigned_by: assigned_by.to_string(),
            message: format!("you were assigned to contract {contract_id} as {role}"),
            created_at: TimeStamp::new(),
        }
    }

    /// Keys group notifications by recipient, oldest first
    pub fn key(&self) -> Vec<u8> {
        let mut key = notification_prefix(&self.user_id);
        key.extend_from_slice(&self.id);
        key
    }
}

pub fn notification_prefix(user_id: &str) -> Vec<u8> {
    let mut key = user_id.as_bytes().to_vec();
    key.push(b'/');
    key
}
