//! Activity records, written alongside every mutation
use super::contract::TimeStamp;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use uuid7::uuid7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum ActivityType {
    #[n(0)]
    Upload,
    #[n(1)]
    SubmitReview,
    #[n(2)]
    RespondToComments,
    #[n(3)]
    FixMetadata,
    #[n(4)]
    Review,
    #[n(5)]
    FinalApproval,
    #[n(6)]
    FinalPublish,
    #[n(7)]
    Archive,
    #[n(8)]
    Terminate,
    #[n(9)]
    AddComment,
    #[n(10)]
    ResolveComment,
    #[n(11)]
    AssignmentUpdate,
    #[n(12)]
    GrantPermission,
    #[n(13)]
    Login,
    #[n(14)]
    Logout,
    #[n(15)]
    UserCreated,
    #[n(16)]
    UserUpdated,
    #[n(17)]
    UserDeactivated,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Upload => "upload",
            ActivityType::SubmitReview => "submit_review",
            ActivityType::RespondToComments => "respond_to_comments",
            ActivityType::FixMetadata => "fix_metadata",
            ActivityType::Review => "review",
            ActivityType::FinalApproval => "final_approval",
            ActivityType::FinalPublish => "final_publish",
            ActivityType::Archive => "archive",
            ActivityType::Terminate => "terminate",
            ActivityType::AddComment => "add_comment",
            ActivityType::ResolveComment => "resolve_comment",
            ActivityType::AssignmentUpdate => "assignment_update",
            ActivityType::GrantPermission => "grant_permission",
            ActivityType::Login => "login",
            ActivityType::Logout => "logout",
            ActivityType::UserCreated => "user_created",
            ActivityType::UserUpdated => "user_updated",
            ActivityType::UserDeactivated => "user_deactivated",
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network metadata of the client that made a request
#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ClientMeta {
    #[n(0)]
    pub address: Option<String>,
    #[n(1)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ActivityRecord {
    #[n(0)]
    pub id: [u8; 16], // uuid7 bytes, orders records by time
    #[n(1)]
    pub actor_id: String,
    #[n(2)]
    pub activity_type: ActivityType,
    #[n(3)]
    pub contract_id: Option<String>,
    #[n(4)]
    pub details: BTreeMap<String, String>,
    #[n(5)]
    pub client: ClientMeta,
    #[n(6)]
    pub at: TimeStamp<Utc>,
}

impl ActivityRecord {
    pub fn new(
        actor_id: &str,
        activity_type: ActivityType,
        contract_id: Option<&str>,
        client: &ClientMeta,
    ) -> Self {
        Self {
            id: *uuid7().as_bytes(),
            actor_id: actor_id.to_string(),
            activity_type,
            contract_id: contract_id.map(str::to_string),
            details: BTreeMap::new(),
            client: client.clone(),
            at: TimeStamp::new(),
        }
    }

    pub fn detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }

    pub fn detail_opt(self, key: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.detail(key, value),
            None => self,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.id
    }
}

/// Filters for [`crate::service::ContractService::list_activity`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityQuery {
    pub contract_id: Option<String>,
    pub user_id: Option<String>,
    pub activity_type: Option<ActivityType>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl ActivityQuery {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn contract(mut self, contract_id: &str) -> Self {
        self.contract_id = Some(contract_id.to_string());
        self
    }
    pub fn user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }
    pub fn activity_type(mut self, activity_type: ActivityType) -> Self {
        self.activity_type = Some(activity_type);
        self
    }
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &ActivityRecord) -> bool {
        if let Some(contract_id) = &self.contract_id {
            if record.contract_id.as_ref() != Some(contract_id) {
                return false;
            }
        }
        if let Some(user_id) = &self.user_id {
            if &record.actor_id != user_id {
                return false;
            }
        }
        if let Some(activity_type) = self.activity_type {
            if record.activity_type != activity_type {
                return false;
            }
        }
        true
    }
}
