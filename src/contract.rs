//! Core contract entity, status enum and metadata builder
use super::assignment::Assignments;
use super::error::{ContractError, ValidationError};
use super::history::ContractHistory;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    /// `None` for a date the calendar does not have
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    /// Offset from now, negative values land in the past
    pub fn days_from_now(days: i64) -> Self {
        Self(Utc::now() + Duration::days(days))
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Whether the nanosecond CBOR encoding can hold this instant (years 1677..=2262)
    pub fn is_encodable(&self) -> bool {
        self.0.timestamp_nanos_opt().is_some()
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl fmt::Display for TimeStamp<Utc> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, minicbor::Encode, minicbor::Decode)]
pub enum Status {
    #[n(0)]
    Draft,
    #[n(1)]
    UnderReview,
    #[n(2)]
    Reviewed,
    #[n(3)]
    Approved,
    #[n(4)]
    Published,
    #[n(5)]
    Rejected,
    #[n(6)]
    Archived,
    #[n(7)]
    Terminated,
}

impl Status {
    pub const ALL: [Status; 8] = [
        Status::Draft,
        Status::UnderReview,
        Status::Reviewed,
        Status::Approved,
        Status::Published,
        Status::Rejected,
        Status::Archived,
        Status::Terminated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Draft => "draft",
            Status::UnderReview => "under_review",
            Status::Reviewed => "reviewed",
            Status::Approved => "approved",
            Status::Published => "published",
            Status::Rejected => "rejected",
            Status::Archived => "archived",
            Status::Terminated => "terminated",
        }
    }

    /// No status-changing transition leaves these states
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Published | Status::Archived)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ValidationError::InvalidValue {
                field: "status",
                value: s.to_string(),
            })
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractMetadata {
    #[n(0)]
    pub grant_name: Option<String>,
    #[n(1)]
    pub counterparties: Vec<String>,
    #[n(2)]
    pub amount: Option<u64>, // minor currency units
    #[n(3)]
    pub start_date: Option<TimeStamp<Utc>>,
    #[n(4)]
    pub end_date: Option<TimeStamp<Utc>>,
    #[n(5)]
    pub purpose: Option<String>,
    #[n(6)]
    pub reference: Option<String>,
}

impl ContractMetadata {
    /// Construct a new builder object, this becomes the basis for an upload
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_grant_name(mut self, name: &str) -> Self {
        self.grant_name = Some(name.to_string());
        self
    }
    pub fn add_counterparty(mut self, party: &str) -> Self {
        self.counterparties.push(party.to_string());
        self
    }
    pub fn set_amount(mut self, amount: u64) -> Self {
        self.amount = Some(amount);
        self
    }
    pub fn set_start_date(mut self, date: TimeStamp<Utc>) -> Self {
        self.start_date = Some(date);
        self
    }
    pub fn set_end_date(mut self, date: TimeStamp<Utc>) -> Self {
        self.end_date = Some(date);
        self
    }
    pub fn set_purpose(mut self, purpose: &str) -> Self {
        self.purpose = Some(purpose.to_string());
        self
    }
    pub fn set_reference(mut self, reference: &str) -> Self {
        self.reference = Some(reference.to_string());
        self
    }
    /// Checks `start_date <= end_date` when both are present
    pub fn validate_dates(&self) -> bool {
        match (self.start_date.as_ref(), self.end_date.as_ref()) {
            (Some(start), Some(end)) => start.to_datetime_utc() <= end.to_datetime_utc(),
            _ => true,
        }
    }
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(name) = &self.grant_name {
            if name.trim().is_empty() {
                return Err(ValidationError::EmptyField("grant_name"));
            }
        }
        if self.amount == Some(0) {
            return Err(ValidationError::ZeroAmount);
        }
        if self.counterparties.iter().any(|p| p.trim().is_empty()) {
            return Err(ValidationError::EmptyField("counterparties"));
        }
        for (field, date) in [("start_date", &self.start_date), ("end_date", &self.end_date)] {
            if let Some(date) = date.as_ref().filter(|d| !d.is_encodable()) {
                return Err(ValidationError::InvalidValue {
                    field,
                    value: date.to_string(),
                });
            }
        }
        if !self.validate_dates() {
            return Err(ValidationError::InvalidDates);
        }
        Ok(())
    }
}

/// Field-level corrections applied by `fix_metadata`. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataUpdate {
    grant_name: Option<String>,
    counterparties: Option<Vec<String>>,
    amount: Option<u64>,
    start_date: Option<TimeStamp<Utc>>,
    end_date: Option<TimeStamp<Utc>>,
    purpose: Option<String>,
    reference: Option<String>,
}

impl MetadataUpdate {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_grant_name(mut self, name: &str) -> Self {
        self.grant_name = Some(name.to_string());
        self
    }
    pub fn set_counterparties(mut self, parties: &[&str]) -> Self {
        self.counterparties = Some(parties.iter().map(|p| p.to_string()).collect());
        self
    }
    pub fn set_amount(mut self, amount: u64) -> Self {
        self.amount = Some(amount);
        self
    }
    pub fn set_start_date(mut self, date: TimeStamp<Utc>) -> Self {
        self.start_date = Some(date);
        self
    }
    pub fn set_end_date(mut self, date: TimeStamp<Utc>) -> Self {
        self.end_date = Some(date);
        self
    }
    pub fn set_purpose(mut self, purpose: &str) -> Self {
        self.purpose = Some(purpose.to_string());
        self
    }
    pub fn set_reference(mut self, reference: &str) -> Self {
        self.reference = Some(reference.to_string());
        self
    }

    /// Applies the update onto a copy of `current` and returns the copy with the
    /// list of field changes. Fields whose value is unchanged are not reported.
    pub fn apply_to(
        &self,
        current: &ContractMetadata,
    ) -> Result<(ContractMetadata, Vec<FieldChange>), ValidationError> {
        let mut next = current.clone();
        let mut changes = Vec::new();

        if let Some(name) = &self.grant_name {
            if current.grant_name.as_deref() != Some(name.as_str()) {
                changes.push(FieldChange::new(
                    "grant_name",
                    current.grant_name.clone().unwrap_or_default(),
                    name.clone(),
                ));
                next.grant_name = Some(name.clone());
            }
        }
        if let Some(parties) = &self.counterparties {
            if &current.counterparties != parties {
                changes.push(FieldChange::new(
                    "counterparties",
                    current.counterparties.join(", "),
                    parties.join(", "),
                ));
                next.counterparties = parties.clone();
            }
        }
        if let Some(amount) = self.amount {
            if current.amount != Some(amount) {
                changes.push(FieldChange::new(
                    "amount",
                    current.amount.map(|a| a.to_string()).unwrap_or_default(),
                    amount.to_string(),
                ));
                next.amount = Some(amount);
            }
        }
        if let Some(date) = &self.start_date {
            if current.start_date.as_ref() != Some(date) {
                changes.push(FieldChange::new(
                    "start_date",
                    current.start_date.as_ref().map(|d| d.to_string()).unwrap_or_default(),
                    date.to_string(),
                ));
                next.start_date = Some(date.clone());
            }
        }
        if let Some(date) = &self.end_date {
            if current.end_date.as_ref() != Some(date) {
                changes.push(FieldChange::new(
                    "end_date",
                    current.end_date.as_ref().map(|d| d.to_string()).unwrap_or_default(),
                    date.to_string(),
                ));
                next.end_date = Some(date.clone());
            }
        }
        if let Some(purpose) = &self.purpose {
            if current.purpose.as_deref() != Some(purpose.as_str()) {
                changes.push(FieldChange::new(
                    "purpose",
                    current.purpose.clone().unwrap_or_default(),
                    purpose.clone(),
                ));
                next.purpose = Some(purpose.clone());
            }
        }
        if let Some(reference) = &self.reference {
            if current.reference.as_deref() != Some(reference.as_str()) {
                changes.push(FieldChange::new(
                    "reference",
                    current.reference.clone().unwrap_or_default(),
                    reference.clone(),
                ));
                next.reference = Some(reference.clone());
            }
        }

        if changes.is_empty() {
            return Err(ValidationError::NoChanges);
        }
        next.validate()?;

        Ok((next, changes))
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    #[n(0)]
    pub field: String,
    #[n(1)]
    pub old_value: String,
    #[n(2)]
    pub new_value: String,
}

impl FieldChange {
    fn new(field: &str, old_value: String, new_value: String) -> Self {
        Self {
            field: field.to_string(),
            old_value,
            new_value,
        }
    }
}

/// Reference to the uploaded document held by the blob store
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    #[n(0)]
    pub blob_key: String,
    #[n(1)]
    pub file_name: String,
    #[n(2)]
    pub digest: String, // sha256 of the raw bytes
    #[n(3)]
    pub size: u64,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    #[n(0)]
    pub id: String, // uuid7, use bech32
    #[n(1)]
    pub status: Status,
    #[n(2)]
    pub version: u64,
    #[n(3)]
    pub created_by: String,
    #[n(4)]
    pub metadata: ContractMetadata,
    #[n(5)]
    pub attachment: Option<Attachment>,
    #[n(6)]
    pub extracted: BTreeMap<String, String>,
    #[n(7)]
    pub history: ContractHistory,
    #[n(8)]
    pub assignments: Assignments,
    #[n(9)]
    pub locked: bool,
    #[n(10)]
    pub created_at: TimeStamp<Utc>,
    #[n(11)]
    pub updated_at: TimeStamp<Utc>,
    #[n(12)]
    pub published_at: Option<TimeStamp<Utc>>,
    #[n(13)]
    pub published_by: Option<String>,
    #[n(14)]
    pub archived_at: Option<TimeStamp<Utc>>,
    #[n(15)]
    pub archived_by: Option<String>,
}

impl Contract {
    /// A fresh draft at version 1, as produced by an upload
    pub fn draft(id: String, created_by: String, metadata: ContractMetadata) -> Self {
        let now = TimeStamp::new();
        Self {
            id,
            status: Status::Draft,
            version: 1,
            created_by,
            metadata,
            attachment: None,
            extracted: BTreeMap::new(),
            history: ContractHistory::default(),
            assignments: Assignments::default(),
            locked: false,
            created_at: now.clone(),
            updated_at: now,
            published_at: None,
            published_by: None,
            archived_at: None,
            archived_by: None,
        }
    }

    pub fn is_created_by(&self, user_id: &str) -> bool {
        self.created_by == user_id
    }

    /// `end_date < now`, a contract without an end date never expires
    pub fn has_expired(&self, now: &TimeStamp<Utc>) -> bool {
        self.metadata
            .end_date
            .as_ref()
            .is_some_and(|end| end < now)
    }

    /// Returns the cbor encoding of the contract with its sha256 digest
    pub fn serialize_with_hash(&self) -> Result<(String, Vec<u8>), ContractError> {
        let cbor = minicbor::to_vec(self)?;
        let hash = sha256::digest(&cbor);

        Ok((hash, cbor))
    }
}
