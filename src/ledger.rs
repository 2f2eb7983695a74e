//! Append-only version snapshots, one per accepted contract mutation
use super::contract::{Contract, TimeStamp};
use super::error::ContractError;
use super::identity::User;
use chrono::Utc;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum ChangeType {
    #[n(0)]
    Upload,
    #[n(1)]
    ReviewSubmission,
    #[n(2)]
    CommentResponse,
    #[n(3)]
    MetadataUpdate,
    #[n(4)]
    Review,
    #[n(5)]
    FinalApproval,
    #[n(6)]
    Publish,
    #[n(7)]
    Archive,
    #[n(8)]
    Termination,
    #[n(9)]
    AssignmentUpdate,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Upload => "upload",
            ChangeType::ReviewSubmission => "review_submission",
            ChangeType::CommentResponse => "comment_response",
            ChangeType::MetadataUpdate => "metadata_update",
            ChangeType::Review => "review",
            ChangeType::FinalApproval => "final_approval",
            ChangeType::Publish => "publish",
            ChangeType::Archive => "archive",
            ChangeType::Termination => "termination",
            ChangeType::AssignmentUpdate => "assignment_update",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct VersionRecord {
    #[n(0)]
    pub contract_id: String,
    #[n(1)]
    pub version_number: u64,
    #[n(2)]
    pub created_by: String,
    #[n(3)]
    pub change_type: ChangeType,
    #[n(4)]
    pub description: String,
    #[n(5)]
    pub snapshot: Contract,
    #[n(6)]
    pub digest: String, // sha256 of the cbor encoded snapshot
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
}

impl VersionRecord {
    /// Recomputes the snapshot digest and compares it with the stored one
    pub fn verify(&self) -> Result<bool, ContractError> {
        let (hash, _) = self.snapshot.serialize_with_hash()?;
        Ok(hash == self.digest)
    }
}

/// Captures `contract` by value. The version number is the contract's own
/// version, which the lifecycle has already advanced.
pub fn snapshot(
    contract: &Contract,
    change_type: ChangeType,
    description: impl Into<String>,
    actor: &User,
) -> Result<VersionRecord, ContractError> {
    let (digest, _) = contract.serialize_with_hash()?;

    Ok(VersionRecord {
        contract_id: contract.id.clone(),
        version_number: contract.version,
        created_by: actor.id.clone(),
        change_type,
        description: description.into(),
        snapshot: contract.clone(),
        digest,
        created_at: TimeStamp::new(),
    })
}

/// Key under which a version is stored, ordered by number within a contract
pub fn version_key(contract_id: &str, version_number: u64) -> Vec<u8> {
    let mut key = version_prefix(contract_id);
    key.extend_from_slice(&version_number.to_be_bytes());
    key
}

pub fn version_prefix(contract_id: &str) -> Vec<u8> {
    let mut key = contract_id.as_bytes().to_vec();
    key.push(b'/');
    key
}

/// Contiguity check over records sorted newest first
pub fn is_contiguous(records: &[VersionRecord]) -> bool {
    let total = records.len() as u64;
    records
        .iter()
        .enumerate()
        .all(|(i, r)| r.version_number == total - i as u64)
}
