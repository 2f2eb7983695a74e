use crate::contract::Status;
use crate::permission::Action;

#[derive(thiserror::Error, Debug)]
pub enum ContractError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("forbidden: cannot {action} ({reason})")]
    Forbidden { action: String, reason: String },
    #[error("cannot {action} while contract is {actual}; expected one of [{}]", render_statuses(.expected))]
    InvalidTransition {
        action: Action,
        expected: Vec<Status>,
        actual: Status,
    },
    #[error("contract {contract_id} was modified concurrently: expected version {expected}, found {actual}")]
    Conflict {
        contract_id: String,
        expected: u64,
        actual: u64,
    },
    #[error("{entity} {id} was modified concurrently")]
    Stale { entity: &'static str, id: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{collaborator} unavailable: {message}")]
    DependencyFailure {
        collaborator: &'static str,
        message: String,
    },
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("encoding failure: {0}")]
    Encoding(String),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no fields changed")]
    NoChanges,
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("start date must not be after end date")]
    InvalidDates,
    #[error("amount must be greater than zero")]
    ZeroAmount,
    #[error("handle {0} is already taken")]
    DuplicateHandle(String),
    #[error("email {0} is already registered")]
    DuplicateEmail(String),
    #[error("user {user_id} does not hold role {expected}")]
    RoleMismatch { user_id: String, expected: String },
    #[error("user {0} is not active")]
    InactiveUser(String),
    #[error("user {0} does not exist")]
    UnknownUser(String),
    #[error("comment {0} is already resolved")]
    AlreadyResolved(String),
    #[error("comment {comment_id} does not belong to contract {contract_id}")]
    CommentMismatch {
        comment_id: String,
        contract_id: String,
    },
    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

impl ContractError {
    /// Lost races are the only errors a caller may retry after reloading.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ContractError::Conflict { .. } | ContractError::Stale { .. })
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        ContractError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn forbidden(action: impl ToString, reason: impl ToString) -> Self {
        ContractError::Forbidden {
            action: action.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn render_statuses(statuses: &[Status]) -> String {
    statuses
        .iter()
        .map(Status::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<minicbor::decode::Error> for ContractError {
    fn from(value: minicbor::decode::Error) -> Self {
        ContractError::Encoding(value.to_string())
    }
}

impl From<minicbor::encode::Error<std::convert::Infallible>> for ContractError {
    fn from(value: minicbor::encode::Error<std::convert::Infallible>) -> Self {
        ContractError::Encoding(value.to_string())
    }
}
