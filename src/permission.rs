//! Role x status x action authorization
//!
//! [`evaluate`] is a pure, total function: it reads only the actor's role and
//! active flag, the contract's status and creator, and any explicit
//! [`ContractPermission`] grants handed to it. Every role is matched
//! exhaustively so a new role or action cannot silently fall through.
use super::contract::{Contract, Status, TimeStamp};
use super::error::{ContractError, ValidationError};
use super::identity::{Role, User};
use super::lifecycle::ARCHIVE_SOURCES;
use chrono::Utc;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, minicbor::Encode, minicbor::Decode)]
pub enum Action {
    #[n(0)]
    View,
    #[n(1)]
    Upload,
    #[n(2)]
    Edit,
    #[n(3)]
    FixMetadata,
    #[n(4)]
    SubmitReview,
    #[n(5)]
    RespondToComments,
    #[n(6)]
    Review,
    #[n(7)]
    FinalApproval,
    #[n(8)]
    FinalPublish,
    #[n(9)]
    Archive,
    #[n(10)]
    Comment,
    #[n(11)]
    ResolveComment,
    #[n(12)]
    Assign,
    #[n(13)]
    Grant,
    #[n(14)]
    Terminate,
}

impl Action {
    pub const ALL: [Action; 15] = [
        Action::View,
        Action::Upload,
        Action::Edit,
        Action::FixMetadata,
        Action::SubmitReview,
        Action::RespondToComments,
        Action::Review,
        Action::FinalApproval,
        Action::FinalPublish,
        Action::Archive,
        Action::Comment,
        Action::ResolveComment,
        Action::Assign,
        Action::Grant,
        Action::Terminate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::View => "view",
            Action::Upload => "upload",
            Action::Edit => "edit",
            Action::FixMetadata => "fix_metadata",
            Action::SubmitReview => "submit_review",
            Action::RespondToComments => "respond_to_comments",
            Action::Review => "review",
            Action::FinalApproval => "final_approval",
            Action::FinalPublish => "final_publish",
            Action::Archive => "archive",
            Action::Comment => "comment",
            Action::ResolveComment => "resolve_comment",
            Action::Assign => "assign",
            Action::Grant => "grant",
            Action::Terminate => "terminate",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| ValidationError::InvalidValue {
                field: "action",
                value: s.to_string(),
            })
    }
}

/// Operations on the user-administration surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    CreateUser,
    UpdateUser,
    DeactivateUser,
    ListUsers,
    ViewActivity,
}

impl fmt::Display for AdminAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AdminAction::CreateUser => "create_user",
            AdminAction::UpdateUser => "update_user",
            AdminAction::DeactivateUser => "deactivate_user",
            AdminAction::ListUsers => "list_users",
            AdminAction::ViewActivity => "view_activity",
        })
    }
}

/// Explicit per-contract grant, extends the role defaults
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ContractPermission {
    #[n(0)]
    pub contract_id: String,
    #[n(1)]
    pub user_id: String,
    #[n(2)]
    pub action: Action,
    #[n(3)]
    pub granted_by: String,
    #[n(4)]
    pub granted_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Inactive,
    RoleNotPermitted(Role),
    StatusNotPermitted(Status),
    NotCreator,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::Inactive => f.write_str("account is inactive"),
            DenyReason::RoleNotPermitted(role) => write!(f, "role {role} may not perform it"),
            DenyReason::StatusNotPermitted(status) => {
                write!(f, "not permitted while contract is {status}")
            }
            DenyReason::NotCreator => f.write_str("actor is not the contract creator"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn into_result(self, action: impl fmt::Display) -> Result<(), ContractError> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(ContractError::forbidden(action, reason)),
        }
    }
}

pub fn evaluate(
    actor: &User,
    contract: &Contract,
    action: Action,
    grants: &[ContractPermission],
) -> Decision {
    if !actor.active {
        return Decision::Deny(DenyReason::Inactive);
    }

    let granted = grants
        .iter()
        .any(|g| g.contract_id == contract.id && g.user_id == actor.id && g.action == action);
    let status = contract.status;

    match actor.role {
        Role::Director => Decision::Allow,
        Role::ProgramManager => {
            with_grants(program_manager_allows, actor.role, status, action, granted)
        }
        Role::ProjectManager if contract.is_created_by(&actor.id) => {
            with_grants(creator_allows, actor.role, status, action, granted)
        }
        Role::ProjectManager => {
            if action == Action::View && granted {
                Decision::Allow
            } else {
                Decision::Deny(DenyReason::NotCreator)
            }
        }
        Role::SuperAdmin => {
            if granted {
                Decision::Allow
            } else {
                Decision::Deny(DenyReason::RoleNotPermitted(actor.role))
            }
        }
    }
}

pub fn evaluate_admin(actor: &User, _action: AdminAction) -> Decision {
    if !actor.active {
        return Decision::Deny(DenyReason::Inactive);
    }
    match actor.role {
        Role::SuperAdmin | Role::Director => Decision::Allow,
        Role::ProjectManager | Role::ProgramManager => {
            Decision::Deny(DenyReason::RoleNotPermitted(actor.role))
        }
    }
}

fn with_grants(
    allows: fn(Status, Action) -> bool,
    role: Role,
    status: Status,
    action: Action,
    granted: bool,
) -> Decision {
    if allows(status, action) || granted {
        return Decision::Allow;
    }
    // distinguish "never" from "not now" for the caller
    if Status::ALL.into_iter().any(|s| allows(s, action)) {
        Decision::Deny(DenyReason::StatusNotPermitted(status))
    } else {
        Decision::Deny(DenyReason::RoleNotPermitted(role))
    }
}

fn program_manager_allows(status: Status, action: Action) -> bool {
    match action {
        Action::View => matches!(
            status,
            Status::Draft | Status::UnderReview | Status::Reviewed | Status::Approved
        ),
        Action::Review | Action::Comment => status == Status::UnderReview,
        Action::Archive => ARCHIVE_SOURCES.contains(&status),
        Action::Upload
        | Action::Edit
        | Action::FixMetadata
        | Action::SubmitReview
        | Action::RespondToComments
        | Action::FinalApproval
        | Action::FinalPublish
        | Action::ResolveComment
        | Action::Assign
        | Action::Grant
        | Action::Terminate => false,
    }
}

fn creator_allows(status: Status, action: Action) -> bool {
    match action {
        Action::View | Action::Upload => true,
        Action::Edit
        | Action::FixMetadata
        | Action::SubmitReview
        | Action::Assign
        | Action::Grant => matches!(status, Status::Draft | Status::Rejected),
        Action::RespondToComments | Action::ResolveComment => {
            matches!(status, Status::UnderReview | Status::Rejected)
        }
        Action::Comment => matches!(
            status,
            Status::Draft | Status::UnderReview | Status::Rejected
        ),
        Action::FinalPublish => status == Status::Approved,
        Action::Archive => ARCHIVE_SOURCES.contains(&status),
        Action::Review | Action::FinalApproval | Action::Terminate => false,
    }
}
