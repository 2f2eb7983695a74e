//! Typed, append-only history carried inside every contract
use super::contract::{FieldChange, Status, TimeStamp};
use super::identity::{Role, User};
use super::lifecycle::{Recommendation, Verdict};
use chrono::Utc;
use std::collections::BTreeSet;

/// A sequence that can only grow. There is no mutable access to past entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryLog<T>(Vec<T>);

impl<T> HistoryLog<T> {
    pub fn append(&mut self, entry: T) {
        self.0.push(entry);
    }
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.0.iter()
    }
    pub fn last(&self) -> Option<&T> {
        self.0.last()
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T> Default for HistoryLog<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<'a, T> IntoIterator for &'a HistoryLog<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<C, T: minicbor::Encode<C>> minicbor::Encode<C> for HistoryLog<T> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        minicbor::Encode::encode(&self.0, e, ctx)
    }
}

impl<'b, C, T: minicbor::Decode<'b, C>> minicbor::Decode<'b, C> for HistoryLog<T> {
    fn decode(d: &mut minicbor::Decoder<'b>, ctx: &mut C) -> Result<Self, minicbor::decode::Error> {
        Ok(Self(<Vec<T> as minicbor::Decode<'b, C>>::decode(d, ctx)?))
    }
}

/// Who did something, frozen at the time they did it
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ActorStamp {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub role: Role,
}

impl From<&User> for ActorStamp {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            name: user.display_name().to_string(),
            role: user.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum TransitionDetail {
    #[n(0)]
    Submitted,
    #[n(1)]
    Responded {
        #[n(0)]
        comment_id: Option<String>,
    },
    #[n(2)]
    Reviewed {
        #[n(0)]
        recommendation: Recommendation,
        #[n(1)]
        comment_count: u64,
    },
    #[n(3)]
    FinalDecision {
        #[n(0)]
        verdict: Verdict,
        #[n(1)]
        locked: bool,
        #[n(2)]
        risk_accepted: bool,
        #[n(3)]
        business_sign_off: bool,
    },
    #[n(4)]
    Published,
    #[n(5)]
    Archived {
        #[n(0)]
        reason: String,
    },
    #[n(6)]
    Terminated {
        #[n(0)]
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct TransitionRecord {
    #[n(0)]
    pub actor: ActorStamp,
    #[n(1)]
    pub at: TimeStamp<Utc>,
    #[n(2)]
    pub from: Status,
    #[n(3)]
    pub to: Status,
    #[n(4)]
    pub notes: Option<String>,
    #[n(5)]
    pub detail: TransitionDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct AssignmentEvent {
    #[n(0)]
    pub actor: ActorStamp,
    #[n(1)]
    pub at: TimeStamp<Utc>,
    #[n(2)]
    pub project_managers: BTreeSet<String>,
    #[n(3)]
    pub program_managers: BTreeSet<String>,
    #[n(4)]
    pub directors: BTreeSet<String>,
    #[n(5)]
    pub added: BTreeSet<String>,
    #[n(6)]
    pub removed: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct MetadataEvent {
    #[n(0)]
    pub actor: ActorStamp,
    #[n(1)]
    pub at: TimeStamp<Utc>,
    #[n(2)]
    pub changes: Vec<FieldChange>,
}

/// Which log a transition lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    Review,
    Publish,
    Archive,
    Status,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ContractHistory {
    #[n(0)]
    pub review: HistoryLog<TransitionRecord>,
    #[n(1)]
    pub assignment: HistoryLog<AssignmentEvent>,
    #[n(2)]
    pub publish: HistoryLog<TransitionRecord>,
    #[n(3)]
    pub archive: HistoryLog<TransitionRecord>,
    #[n(4)]
    pub status: HistoryLog<TransitionRecord>,
    #[n(5)]
    pub metadata: HistoryLog<MetadataEvent>,
}

impl ContractHistory {
    pub fn record_transition(&mut self, kind: HistoryKind, record: TransitionRecord) {
        match kind {
            HistoryKind::Review => self.review.append(record),
            HistoryKind::Publish => self.publish.append(record),
            HistoryKind::Archive => self.archive.append(record),
            HistoryKind::Status => self.status.append(record),
        }
    }

    /// Every transition across all logs, oldest first
    pub fn transitions(&self) -> Vec<&TransitionRecord> {
        let mut all: Vec<_> = self
            .review
            .iter()
            .chain(self.publish.iter())
            .chain(self.archive.iter())
            .chain(self.status.iter())
            .collect();
        all.sort_by(|a, b| a.at.cmp(&b.at));
        all
    }

    pub fn entry_count(&self) -> usize {
        self.review.len()
            + self.assignment.len()
            + self.publish.len()
            + self.archive.len()
            + self.status.len()
            + self.metadata.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp() -> ActorStamp {
        ActorStamp {
            id: "user_1".into(),
            name: "Ada".into(),
            role: Role::ProjectManager,
        }
    }

    fn record(from: Status, to: Status) -> TransitionRecord {
        TransitionRecord {
            actor: stamp(),
            at: TimeStamp::new(),
            from,
            to,
            notes: None,
            detail: TransitionDetail::Submitted,
        }
    }

    #[test]
    fn transitions_land_in_their_log() {
        let mut history = ContractHistory::default();
        history.record_transition(HistoryKind::Status, record(Status::Draft, Status::UnderReview));
        history.record_transition(HistoryKind::Review, record(Status::UnderReview, Status::Reviewed));

        assert_eq!(history.status.len(), 1);
        assert_eq!(history.review.len(), 1);
        assert!(history.publish.is_empty());
        assert_eq!(history.entry_count(), 2);
        assert_eq!(history.transitions().len(), 2);
    }

    #[test]
    fn history_survives_cbor() {
        let mut history = ContractHistory::default();
        history.record_transition(HistoryKind::Archive, record(Status::Draft, Status::Archived));
        history.metadata.append(MetadataEvent {
            actor: stamp(),
            at: TimeStamp::new(),
            changes: vec![],
        });

        let cbor = minicbor::to_vec(&history).unwrap();
        let decoded: ContractHistory = minicbor::decode(&cbor).unwrap();
        assert_eq!(decoded, history);
    }
}
