//! Interfaces to the systems around the approval core
//!
//! Extraction, similarity search, credential verification and notification
//! delivery live outside this crate. They are injected into
//! [`crate::service::ContractService`] at construction.
use super::assignment::Notification;
use super::error::ContractError;
use std::collections::{BTreeMap, HashMap};
use tracing::info;

#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

impl CollaboratorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub(crate) fn dependency_failure(collaborator: &'static str) -> impl FnOnce(CollaboratorError) -> ContractError {
    move |err| ContractError::DependencyFailure {
        collaborator,
        message: err.0,
    }
}

/// Resolves a bearer token to a user id
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<String, CollaboratorError>;
}

/// Turns document bytes into structured fields
pub trait FieldExtractor: Send + Sync {
    fn extract(&self, document: &[u8]) -> Result<BTreeMap<String, String>, CollaboratorError>;
}

/// Attachment persistence
pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), CollaboratorError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CollaboratorError>;
    /// Drops a blob, a missing key is not an error
    fn remove(&self, key: &str) -> Result<(), CollaboratorError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarContract {
    pub contract_id: String,
    pub score: f32,
}

/// Embedding-backed "similar contracts" lookup
pub trait SimilaritySearch: Send + Sync {
    fn similar(&self, contract_id: &str, limit: usize) -> Result<Vec<SimilarContract>, CollaboratorError>;
}

/// Outbound delivery of assignment notifications
pub trait Notifier: Send + Sync {
    fn deliver(&self, notification: &Notification) -> Result<(), CollaboratorError>;
}

/// Blobs kept in their own sled tree next to the contracts
pub struct SledBlobStore {
    tree: sled::Tree,
}

impl SledBlobStore {
    pub fn new(db: &sled::Db) -> Result<Self, ContractError> {
        Ok(Self {
            tree: db.open_tree("blobs")?,
        })
    }
}

impl BlobStore for SledBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), CollaboratorError> {
        self.tree
            .insert(key.as_bytes(), bytes)
            .map(|_| ())
            .map_err(|e| CollaboratorError::new(e.to_string()))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CollaboratorError> {
        self.tree
            .get(key.as_bytes())
            .map(|v| v.map(|ivec| ivec.to_vec()))
            .map_err(|e| CollaboratorError::new(e.to_string()))
    }

    fn remove(&self, key: &str) -> Result<(), CollaboratorError> {
        self.tree
            .remove(key.as_bytes())
            .map(|_| ())
            .map_err(|e| CollaboratorError::new(e.to_string()))
    }
}

/// Emits a tracing event per notification
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn deliver(&self, notification: &Notification) -> Result<(), CollaboratorError> {
        info!(
            user_id = %notification.user_id,
            contract_id = %notification.contract_id,
            role = %notification.role,
            "assignment notification"
        );
        Ok(())
    }
}

/// Fixed token table, for local setups and tests
#[derive(Debug, Default)]
pub struct StaticCredentials {
    tokens: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_token(mut self, token: &str, user_id: &str) -> Self {
        self.tokens.insert(token.to_string(), user_id.to_string());
        self
    }
}

impl CredentialVerifier for StaticCredentials {
    fn verify(&self, token: &str) -> Result<String, CollaboratorError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| CollaboratorError::new("unknown or expired token"))
    }
}
