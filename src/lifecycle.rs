//! Contract status transitions
//!
//! This module is the only place a contract's `status` is changed. A
//! transition is validated against the status the caller loaded; the store
//! then re-checks that status and version inside its transaction.
use super::audit::ActivityType;
use super::contract::{Contract, Status, TimeStamp};
use super::error::{ContractError, ValidationError};
use super::history::{ActorStamp, HistoryKind, TransitionDetail, TransitionRecord};
use super::identity::User;
use super::ledger::ChangeType;
use super::permission::Action;
use chrono::Utc;
use std::fmt;
use std::str::FromStr;

/// Statuses a contract may be archived from, once the gate in [`Transition::Archive`] passes
pub const ARCHIVE_SOURCES: [Status; 5] = [
    Status::Draft,
    Status::UnderReview,
    Status::Reviewed,
    Status::Rejected,
    Status::Terminated,
];

pub const TERMINATE_SOURCES: [Status; 5] = [
    Status::Draft,
    Status::UnderReview,
    Status::Reviewed,
    Status::Approved,
    Status::Rejected,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum Recommendation {
    #[n(0)]
    Approve,
    #[n(1)]
    Reject,
    // lands in `rejected` like Reject, kept distinct in history and comments
    #[n(2)]
    Modify,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Approve => "approve",
            Recommendation::Reject => "reject",
            Recommendation::Modify => "modify",
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Recommendation {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Recommendation::Approve),
            "reject" => Ok(Recommendation::Reject),
            "modify" => Ok(Recommendation::Modify),
            other => Err(ValidationError::InvalidValue {
                field: "recommendation",
                value: other.to_string(),
            }),
        }
    }
}

/// A director's final decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum Verdict {
    #[n(0)]
    Approve,
    #[n(1)]
    Reject,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approve => "approve",
            Verdict::Reject => "reject",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Verdict::Approve),
            "reject" => Ok(Verdict::Reject),
            other => Err(ValidationError::InvalidValue {
                field: "decision",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    SubmitForReview,
    RespondToComments {
        comment_id: Option<String>,
    },
    Review {
        recommendation: Recommendation,
        comment_count: u64,
    },
    FinalApproval {
        verdict: Verdict,
        lock: bool,
        risk_accepted: bool,
        business_sign_off: bool,
    },
    FinalPublish,
    Archive {
        reason: String,
    },
    Terminate {
        reason: String,
    },
}

impl Transition {
    /// The permission this transition is evaluated under
    pub fn action(&self) -> Action {
        match self {
            Transition::SubmitForReview => Action::SubmitReview,
            Transition::RespondToComments { .. } => Action::RespondToComments,
            Transition::Review { .. } => Action::Review,
            Transition::FinalApproval { .. } => Action::FinalApproval,
            Transition::FinalPublish => Action::FinalPublish,
            Transition::Archive { .. } => Action::Archive,
            Transition::Terminate { .. } => Action::Terminate,
        }
    }

    pub fn sources(&self) -> &'static [Status] {
        match self {
            Transition::SubmitForReview => &[Status::Draft, Status::Rejected],
            Transition::RespondToComments { .. } => &[Status::UnderReview, Status::Rejected],
            Transition::Review { .. } => &[Status::UnderReview],
            Transition::FinalApproval { .. } => &[Status::Reviewed],
            Transition::FinalPublish => &[Status::Approved],
            Transition::Archive { .. } => &ARCHIVE_SOURCES,
            Transition::Terminate { .. } => &TERMINATE_SOURCES,
        }
    }

    /// Resulting status, assuming `from` is one of [`Transition::sources`]
    pub fn target(&self, from: Status) -> Status {
        match self {
            Transition::SubmitForReview => Status::UnderReview,
            Transition::RespondToComments { .. } => match from {
                Status::Rejected => Status::Draft,
                other => other,
            },
            Transition::Review { recommendation, .. } => match recommendation {
                Recommendation::Approve => Status::Reviewed,
                Recommendation::Reject | Recommendation::Modify => Status::Rejected,
            },
            Transition::FinalApproval { verdict, .. } => match verdict {
                Verdict::Approve => Status::Approved,
                Verdict::Reject => Status::Rejected,
            },
            Transition::FinalPublish => Status::Published,
            Transition::Archive { .. } => Status::Archived,
            Transition::Terminate { .. } => Status::Terminated,
        }
    }

    pub fn history_kind(&self) -> HistoryKind {
        match self {
            Transition::SubmitForReview | Transition::Terminate { .. } => HistoryKind::Status,
            Transition::RespondToComments { .. }
            | Transition::Review { .. }
            | Transition::FinalApproval { .. } => HistoryKind::Review,
            Transition::FinalPublish => HistoryKind::Publish,
            Transition::Archive { .. } => HistoryKind::Archive,
        }
    }

    pub fn change_type(&self) -> ChangeType {
        match self {
            Transition::SubmitForReview => ChangeType::ReviewSubmission,
            Transition::RespondToComments { .. } => ChangeType::CommentResponse,
            Transition::Review { .. } => ChangeType::Review,
            Transition::FinalApproval { .. } => ChangeType::FinalApproval,
            Transition::FinalPublish => ChangeType::Publish,
            Transition::Archive { .. } => ChangeType::Archive,
            Transition::Terminate { .. } => ChangeType::Termination,
        }
    }

    pub fn activity_type(&self) -> ActivityType {
        match self {
            Transition::SubmitForReview => ActivityType::SubmitReview,
            Transition::RespondToComments { .. } => ActivityType::RespondToComments,
            Transition::Review { .. } => ActivityType::Review,
            Transition::FinalApproval { .. } => ActivityType::FinalApproval,
            Transition::FinalPublish => ActivityType::FinalPublish,
            Transition::Archive { .. } => ActivityType::Archive,
            Transition::Terminate { .. } => ActivityType::Terminate,
        }
    }

    fn detail(&self) -> TransitionDetail {
        match self {
            Transition::SubmitForReview => TransitionDetail::Submitted,
            Transition::RespondToComments { comment_id } => TransitionDetail::Responded {
                comment_id: comment_id.clone(),
            },
            Transition::Review {
                recommendation,
                comment_count,
            } => TransitionDetail::Reviewed {
                recommendation: *recommendation,
                comment_count: *comment_count,
            },
            Transition::FinalApproval {
                verdict,
                lock,
                risk_accepted,
                business_sign_off,
            } => TransitionDetail::FinalDecision {
                verdict: *verdict,
                locked: *lock && *verdict == Verdict::Approve,
                risk_accepted: *risk_accepted,
                business_sign_off: *business_sign_off,
            },
            Transition::FinalPublish => TransitionDetail::Published,
            Transition::Archive { reason } => TransitionDetail::Archived {
                reason: reason.clone(),
            },
            Transition::Terminate { reason } => TransitionDetail::Terminated {
                reason: reason.clone(),
            },
        }
    }

    /// Validates the transition against the contract's current status and
    /// returns the status it leads to. Never coerces.
    pub fn check(&self, contract: &Contract, now: &TimeStamp<Utc>) -> Result<Status, ContractError> {
        let from = contract.status;
        let sources = self.sources();
        if !sources.contains(&from) {
            return Err(ContractError::InvalidTransition {
                action: self.action(),
                expected: sources.to_vec(),
                actual: from,
            });
        }

        // archival before the end date is only possible for terminated contracts
        if matches!(self, Transition::Archive { .. })
            && from != Status::Terminated
            && !contract.has_expired(now)
        {
            return Err(ContractError::InvalidTransition {
                action: Action::Archive,
                expected: vec![Status::Terminated],
                actual: from,
            });
        }

        Ok(self.target(from))
    }

    /// Produces the next state of `contract`: new status, version + 1 and one
    /// history entry. The input is left untouched.
    pub fn apply(
        &self,
        contract: &Contract,
        actor: &User,
        notes: Option<String>,
        now: TimeStamp<Utc>,
    ) -> Result<Contract, ContractError> {
        let to = self.check(contract, &now)?;
        let mut next = contract.clone();

        next.history.record_transition(
            self.history_kind(),
            TransitionRecord {
                actor: ActorStamp::from(actor),
                at: now.clone(),
                from: contract.status,
                to,
                notes,
                detail: self.detail(),
            },
        );

        match self {
            Transition::FinalApproval {
                verdict: Verdict::Approve,
                lock,
                ..
            } => next.locked = *lock,
            Transition::FinalPublish => {
                next.published_at = Some(now.clone());
                next.published_by = Some(actor.id.clone());
            }
            Transition::Archive { .. } => {
                next.archived_at = Some(now.clone());
                next.archived_by = Some(actor.id.clone());
            }
            _ => {}
        }

        next.status = to;
        next.version += 1;
        next.updated_at = now;

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::ContractMetadata;
    use crate::identity::{NewUser, Role};

    fn actor() -> User {
        NewUser::new("pm", "pm@example.org", Role::ProjectManager)
            .into_user("user_pm".into(), Role::ProjectManager)
    }

    fn contract_in(status: Status) -> Contract {
        let mut c = Contract::draft("contract_1".into(), "user_pm".into(), ContractMetadata::new());
        c.status = status;
        c
    }

    fn all_transitions() -> Vec<Transition> {
        vec![
            Transition::SubmitForReview,
            Transition::RespondToComments { comment_id: None },
            Transition::Review {
                recommendation: Recommendation::Approve,
                comment_count: 0,
            },
            Transition::Review {
                recommendation: Recommendation::Reject,
                comment_count: 0,
            },
            Transition::Review {
                recommendation: Recommendation::Modify,
                comment_count: 0,
            },
            Transition::FinalApproval {
                verdict: Verdict::Approve,
                lock: true,
                risk_accepted: false,
                business_sign_off: true,
            },
            Transition::FinalApproval {
                verdict: Verdict::Reject,
                lock: false,
                risk_accepted: false,
                business_sign_off: false,
            },
            Transition::FinalPublish,
            Transition::Archive {
                reason: "expired".into(),
            },
            Transition::Terminate {
                reason: "funding withdrawn".into(),
            },
        ]
    }

    #[test]
    fn transition_table() {
        let now = TimeStamp::new();
        let cases = [
            (Status::Draft, Transition::SubmitForReview, Status::UnderReview),
            (Status::Rejected, Transition::SubmitForReview, Status::UnderReview),
            (
                Status::Rejected,
                Transition::RespondToComments { comment_id: None },
                Status::Draft,
            ),
            (
                Status::UnderReview,
                Transition::RespondToComments { comment_id: None },
                Status::UnderReview,
            ),
            (Status::Approved, Transition::FinalPublish, Status::Published),
        ];
        for (from, transition, to) in cases {
            assert_eq!(transition.check(&contract_in(from), &now).unwrap(), to);
        }
    }

    #[test]
    fn modify_is_rejected_but_recorded_as_modify() {
        let transition = Transition::Review {
            recommendation: Recommendation::Modify,
            comment_count: 2,
        };
        let next = transition
            .apply(&contract_in(Status::UnderReview), &actor(), None, TimeStamp::new())
            .unwrap();

        assert_eq!(next.status, Status::Rejected);
        let entry = next.history.review.last().unwrap();
        assert_eq!(
            entry.detail,
            TransitionDetail::Reviewed {
                recommendation: Recommendation::Modify,
                comment_count: 2
            }
        );
    }

    #[test]
    fn published_and_archived_are_terminal() {
        let now = TimeStamp::new();
        for status in [Status::Published, Status::Archived] {
            let mut contract = contract_in(status);
            contract.metadata.end_date = Some(TimeStamp::days_from_now(-10));
            for transition in all_transitions() {
                assert!(
                    transition.check(&contract, &now).is_err(),
                    "{transition:?} from {status}"
                );
            }
        }
    }

    #[test]
    fn archive_requires_expiry_or_termination() {
        let now = TimeStamp::new();
        let archive = Transition::Archive {
            reason: "closing".into(),
        };

        let mut live = contract_in(Status::Draft);
        live.metadata.end_date = Some(TimeStamp::days_from_now(30));
        assert!(matches!(
            archive.check(&live, &now),
            Err(ContractError::InvalidTransition { .. })
        ));

        live.metadata.end_date = Some(TimeStamp::days_from_now(-1));
        assert_eq!(archive.check(&live, &now).unwrap(), Status::Archived);

        let mut terminated = contract_in(Status::Terminated);
        terminated.metadata.end_date = Some(TimeStamp::days_from_now(30));
        assert_eq!(archive.check(&terminated, &now).unwrap(), Status::Archived);

        let mut approved = contract_in(Status::Approved);
        approved.metadata.end_date = Some(TimeStamp::days_from_now(-1));
        assert!(archive.check(&approved, &now).is_err());
    }

    #[test]
    fn apply_bumps_version_and_leaves_input_alone() {
        let before = contract_in(Status::Draft);
        let after = Transition::SubmitForReview
            .apply(&before, &actor(), Some("ready".into()), TimeStamp::new())
            .unwrap();

        assert_eq!(before.status, Status::Draft);
        assert_eq!(before.version, 1);
        assert!(before.history.status.is_empty());

        assert_eq!(after.status, Status::UnderReview);
        assert_eq!(after.version, 2);
        let entry = after.history.status.last().unwrap();
        assert_eq!(entry.from, Status::Draft);
        assert_eq!(entry.to, Status::UnderReview);
        assert_eq!(entry.notes.as_deref(), Some("ready"));
        assert_eq!(entry.actor.id, "user_pm");
    }

    #[test]
    fn rejected_approval_does_not_lock() {
        let next = Transition::FinalApproval {
            verdict: Verdict::Reject,
            lock: true,
            risk_accepted: false,
            business_sign_off: false,
        }
        .apply(&contract_in(Status::Reviewed), &actor(), None, TimeStamp::new())
        .unwrap();

        assert_eq!(next.status, Status::Rejected);
        assert!(!next.locked);
    }

    #[test]
    fn failed_check_names_both_states() {
        let err = Transition::FinalPublish
            .check(&contract_in(Status::Draft), &TimeStamp::new())
            .unwrap_err();
        match err {
            ContractError::InvalidTransition {
                action,
                expected,
                actual,
            } => {
                assert_eq!(action, Action::FinalPublish);
                assert_eq!(expected, vec![Status::Approved]);
                assert_eq!(actual, Status::Draft);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
