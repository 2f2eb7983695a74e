//! Reviewer and creator remarks attached to a contract
use super::contract::TimeStamp;
use super::error::ValidationError;
use super::identity::{Role, User};
use super::lifecycle::Recommendation;
use chrono::Utc;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum CommentStatus {
    #[n(0)]
    Open,
    #[n(1)]
    Resolved,
    #[n(2)]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Resolution {
    #[n(0)]
    pub resolved_by: String,
    #[n(1)]
    pub resolved_at: TimeStamp<Utc>,
    #[n(2)]
    pub response: String,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ReviewComment {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub contract_id: String,
    #[n(2)]
    pub author_id: String,
    #[n(3)]
    pub author_role: Role,
    #[n(4)]
    pub comment_type: String,
    #[n(5)]
    pub body: String,
    #[n(6)]
    pub status: CommentStatus,
    #[n(7)]
    pub is_risk: bool,
    #[n(8)]
    pub is_issue: bool,
    #[n(9)]
    pub change_request: BTreeMap<String, String>,
    #[n(10)]
    pub recommendation: Option<Recommendation>,
    #[n(11)]
    pub resolution: Option<Resolution>,
    #[n(12)]
    pub created_at: TimeStamp<Utc>,
}

impl ReviewComment {
    pub fn is_open(&self) -> bool {
        self.status == CommentStatus::Open
    }

    /// Returns the resolved copy, the original is never edited in place
    pub fn resolve(&self, resolver: &User, response: &str) -> Result<ReviewComment, ValidationError> {
        if !self.is_open() {
            return Err(ValidationError::AlreadyResolved(self.id.clone()));
        }
        if response.trim().is_empty() {
            return Err(ValidationError::EmptyField("response"));
        }
        let mut resolved = self.clone();
        resolved.status = CommentStatus::Resolved;
        resolved.resolution = Some(Resolution {
            resolved_by: resolver.id.clone(),
            resolved_at: TimeStamp::new(),
            response: response.to_string(),
        });
        Ok(resolved)
    }
}

/// Input for a new comment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewComment {
    pub comment_type: String,
    pub body: String,
    pub is_risk: bool,
    pub is_issue: bool,
    pub change_request: BTreeMap<String, String>,
    pub recommendation: Option<Recommendation>,
}

impl NewComment {
    pub fn new(comment_type: &str, body: &str) -> Self {
        Self {
            comment_type: comment_type.to_string(),
            body: body.to_string(),
            ..Self::default()
        }
    }
    pub fn risk(mut self) -> Self {
        self.is_risk = true;
        self
    }
    pub fn issue(mut self) -> Self {
        self.is_issue = true;
        self
    }
    pub fn request_change(mut self, field: &str, proposed: &str) -> Self {
        self.change_request.insert(field.to_string(), proposed.to_string());
        self
    }
    pub fn recommend(mut self, recommendation: Recommendation) -> Self {
        self.recommendation = Some(recommendation);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        if self.comment_type.trim().is_empty() {
            return Err(ValidationError::EmptyField("comment_type"));
        }
        if self.body.trim().is_empty() {
            return Err(ValidationError::EmptyField("body"));
        }
        Ok(())
    }

    pub(crate) fn into_comment(self, id: String, contract_id: &str, author: &User) -> ReviewComment {
        ReviewComment {
            id,
            contract_id: contract_id.to_string(),
            author_id: author.id.clone(),
            author_role: author.role,
            comment_type: self.comment_type,
            body: self.body,
            status: CommentStatus::Open,
            is_risk: self.is_risk,
            is_issue: self.is_issue,
            change_request: self.change_request,
            recommendation: self.recommendation,
            resolution: None,
            created_at: TimeStamp::new(),
        }
    }
}

/// Index key linking a contract to one of its comments
pub fn contract_comment_key(contract_id: &str, comment_id: &str) -> Vec<u8> {
    let mut key = contract_comment_prefix(contract_id);
    key.extend_from_slice(comment_id.as_bytes());
    key
}

pub fn contract_comment_prefix(contract_id: &str) -> Vec<u8> {
    let mut key = contract_id.as_bytes().to_vec();
    key.push(b'/');
    key
}
