//! Service layer API for contract lifecycle operations
//!
//! Every operation follows the same order: load the entity (`NotFound`),
//! evaluate the actor's permission (`Forbidden`), check the lifecycle
//! transition (`InvalidTransition`), validate input, then hand one
//! [`Mutation`] to the store which commits it atomically or reports a
//! `Conflict`.
use super::assignment::{Assignments, Notification};
use super::audit::{ActivityQuery, ActivityRecord, ActivityType, ClientMeta};
use super::collaborators::{
    BlobStore, CredentialVerifier, FieldExtractor, LogNotifier, Notifier, SimilarContract,
    SimilaritySearch, SledBlobStore, dependency_failure,
};
use super::comment::{NewComment, ReviewComment};
use super::config::ServiceConfig;
use super::contract::{Attachment, Contract, ContractMetadata, FieldChange, MetadataUpdate, Status, TimeStamp};
use super::error::{ContractError, ValidationError};
use super::history::{ActorStamp, AssignmentEvent, MetadataEvent};
use super::identity::{NewUser, Role, User, UserUpdate};
use super::ledger::{self, ChangeType, VersionRecord};
use super::lifecycle::{Recommendation, Transition, Verdict};
use super::permission::{self, Action, AdminAction, ContractPermission, Decision, DenyReason};
use super::store::{ContractStore, Expected, Mutation};
use super::utils::{BLOB_HRP, COMMENT_HRP, CONTRACT_HRP, USER_HRP, new_id};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The acting user and the client they called from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub client: ClientMeta,
}

impl Caller {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            client: ClientMeta::default(),
        }
    }
    pub fn with_client(mut self, address: &str, user_agent: &str) -> Self {
        self.client = ClientMeta {
            address: Some(address.to_string()),
            user_agent: Some(user_agent.to_string()),
        };
        self
    }
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub metadata: ContractMetadata,
}

impl Upload {
    pub fn new(file_name: &str, bytes: Vec<u8>, metadata: ContractMetadata) -> Self {
        Self {
            file_name: file_name.to_string(),
            bytes,
            metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub contract_id: String,
    pub status: Status,
    pub version_number: u64,
}

impl From<&Contract> for TransitionOutcome {
    fn from(contract: &Contract) -> Self {
        Self {
            contract_id: contract.id.clone(),
            status: contract.status,
            version_number: contract.version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataOutcome {
    pub version_number: u64,
    pub updated_fields: Vec<FieldChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewOutcome {
    pub status: Status,
    pub version_number: u64,
    pub comment_ids: Vec<String>,
}

/// A director's decision on a reviewed contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalDecision {
    pub verdict: Verdict,
    pub comments: String,
    pub lock: bool,
    pub risk_accepted: bool,
    pub business_sign_off: bool,
}

impl FinalDecision {
    /// Approval locks the contract unless [`FinalDecision::set_lock`] says otherwise
    pub fn approve(comments: &str) -> Self {
        Self {
            verdict: Verdict::Approve,
            comments: comments.to_string(),
            lock: true,
            risk_accepted: false,
            business_sign_off: false,
        }
    }
    pub fn reject(comments: &str) -> Self {
        Self {
            verdict: Verdict::Reject,
            comments: comments.to_string(),
            lock: false,
            risk_accepted: false,
            business_sign_off: false,
        }
    }
    pub fn set_lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }
    pub fn accept_risk(mut self) -> Self {
        self.risk_accepted = true;
        self
    }
    pub fn sign_off(mut self) -> Self {
        self.business_sign_off = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalOutcome {
    pub status: Status,
    pub locked: bool,
    pub version_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentOutcome {
    pub notified: Vec<String>,
    pub version_number: u64,
}

pub struct ContractService {
    store: ContractStore,
    config: ServiceConfig,
    blobs: Arc<dyn BlobStore>,
    notifier: Arc<dyn Notifier>,
    extractor: Option<Arc<dyn FieldExtractor>>,
    similarity: Option<Arc<dyn SimilaritySearch>>,
    credentials: Option<Arc<dyn CredentialVerifier>>,
}

impl ContractService {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self, ContractError> {
        Self::with_config(instance, ServiceConfig::default())
    }

    pub fn with_config(instance: Arc<sled::Db>, config: ServiceConfig) -> Result<Self, ContractError> {
        validate_config(&config)?;
        let blobs = Arc::new(SledBlobStore::new(&instance)?);
        Ok(Self {
            store: ContractStore::new(instance)?,
            config,
            blobs,
            notifier: Arc::new(LogNotifier),
            extractor: None,
            similarity: None,
            credentials: None,
        })
    }

    /// Opens the database described by `config`
    pub fn open(config: ServiceConfig) -> Result<Self, ContractError> {
        validate_config(&config)?;
        let db = config.open_db()?;
        Self::with_config(Arc::new(db), config)
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = blobs;
        self
    }
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
    pub fn with_extractor(mut self, extractor: Arc<dyn FieldExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }
    pub fn with_similarity_search(mut self, similarity: Arc<dyn SimilaritySearch>) -> Self {
        self.similarity = Some(similarity);
        self
    }
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialVerifier>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn store(&self) -> &ContractStore {
        &self.store
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    // contracts

    /// Creates a draft at version 1 from an uploaded document
    pub fn upload_contract(&self, caller: &Caller, upload: Upload) -> Result<Contract, ContractError> {
        let actor = self.actor(caller)?;
        let contract = Contract::draft(new_id(CONTRACT_HRP)?, actor.id.clone(), upload.metadata.clone());
        self.authorize(&actor, &contract, Action::Upload)?;

        if upload.file_name.trim().is_empty() {
            return Err(ValidationError::EmptyField("file_name").into());
        }
        if upload.bytes.is_empty() {
            return Err(ValidationError::EmptyField("document").into());
        }
        contract.metadata.validate()?;

        let contract = self.store_upload(&actor, &caller.client, contract, &upload)?;
        info!(contract_id = %contract.id, actor = %actor.id, file_name = %upload.file_name, "contract uploaded");
        Ok(contract)
    }

    /// Puts the document in the blob store, then commits the draft. The blob
    /// is removed again when anything after the put fails.
    fn store_upload(
        &self,
        actor: &User,
        client: &ClientMeta,
        mut contract: Contract,
        upload: &Upload,
    ) -> Result<Contract, ContractError> {
        let blob_key = new_id(BLOB_HRP)?;
        self.blobs
            .put(&blob_key, &upload.bytes)
            .map_err(dependency_failure("blob store"))?;

        match self.commit_upload(actor, client, &mut contract, upload, &blob_key) {
            Ok(()) => Ok(contract),
            Err(err) => {
                if let Err(cleanup) = self.blobs.remove(&blob_key) {
                    warn!(%blob_key, error = %cleanup, "attachment blob left behind");
                }
                Err(err)
            }
        }
    }

    fn commit_upload(
        &self,
        actor: &User,
        client: &ClientMeta,
        contract: &mut Contract,
        upload: &Upload,
        blob_key: &str,
    ) -> Result<(), ContractError> {
        if let Some(extractor) = &self.extractor {
            match extractor.extract(&upload.bytes) {
                Ok(fields) => contract.extracted = fields,
                Err(err) => warn!(
                    contract_id = %contract.id,
                    error = %err,
                    "field extraction failed, continuing without extracted fields"
                ),
            }
        }

        contract.attachment = Some(Attachment {
            blob_key: blob_key.to_string(),
            file_name: upload.file_name.clone(),
            digest: sha256::digest(&upload.bytes),
            size: upload.bytes.len() as u64,
        });

        let version = ledger::snapshot(
            contract,
            ChangeType::Upload,
            format!("{} uploaded by {}", upload.file_name, actor.display_name()),
            actor,
        )?;
        let activity = ActivityRecord::new(&actor.id, ActivityType::Upload, Some(&contract.id), client)
            .detail("file_name", &upload.file_name)
            .detail("size", upload.bytes.len())
            .detail("version", contract.version);

        self.store.commit(&Mutation {
            expected: None,
            action: Action::Upload,
            contract: contract.clone(),
            version,
            activity,
            comments: Vec::new(),
            notifications: Vec::new(),
        })
    }

    pub fn get_contract(&self, contract_id: &str, caller: &Caller) -> Result<Contract, ContractError> {
        let (_, contract) = self.prepare(contract_id, caller, Action::View)?;
        Ok(contract)
    }

    /// Contracts the caller may view
    pub fn list_contracts(&self, caller: &Caller) -> Result<Vec<Contract>, ContractError> {
        let actor = self.actor(caller)?;
        let mut visible = Vec::new();
        for contract in self.store.list_contracts()? {
            let grants = self.store.grants_for(&contract.id, &actor.id)?;
            if permission::evaluate(&actor, &contract, Action::View, &grants).is_allowed() {
                visible.push(contract);
            }
        }
        debug!(actor = %actor.id, count = visible.len(), "contracts listed");
        Ok(visible)
    }

    /// Raw bytes of the uploaded document
    pub fn download_attachment(&self, contract_id: &str, caller: &Caller) -> Result<Vec<u8>, ContractError> {
        let (_, contract) = self.prepare(contract_id, caller, Action::View)?;
        let attachment = contract
            .attachment
            .ok_or_else(|| ContractError::not_found("attachment", contract_id))?;
        self.blobs
            .get(&attachment.blob_key)
            .map_err(dependency_failure("blob store"))?
            .ok_or_else(|| ContractError::not_found("attachment", attachment.blob_key))
    }

    pub fn submit_for_review(
        &self,
        contract_id: &str,
        caller: &Caller,
        notes: Option<&str>,
    ) -> Result<TransitionOutcome, ContractError> {
        let transition = Transition::SubmitForReview;
        let (actor, contract) = self.prepare_transition(contract_id, caller, &transition)?;
        let next = self.execute(&actor, &contract, &transition, notes.map(str::to_string), Vec::new(), &caller.client)?;
        Ok(TransitionOutcome::from(&next))
    }

    /// Creator's reply to review feedback, optionally resolving one comment.
    /// From `rejected` this returns the contract to `draft`.
    pub fn respond_to_comments(
        &self,
        contract_id: &str,
        caller: &Caller,
        response: &str,
        comment_id: Option<&str>,
    ) -> Result<TransitionOutcome, ContractError> {
        let transition = Transition::RespondToComments {
            comment_id: comment_id.map(str::to_string),
        };
        let (actor, contract) = self.prepare_transition(contract_id, caller, &transition)?;

        if response.trim().is_empty() {
            return Err(ValidationError::EmptyField("response").into());
        }

        let mut comments = vec![
            NewComment::new("project_manager_response", response)
                .into_comment(new_id(COMMENT_HRP)?, &contract.id, &actor),
        ];
        if let Some(comment_id) = comment_id {
            let comment = self
                .store
                .load_comment(comment_id)?
                .ok_or_else(|| ContractError::not_found("comment", comment_id))?;
            if comment.contract_id != contract.id {
                return Err(ValidationError::CommentMismatch {
                    comment_id: comment_id.to_string(),
                    contract_id: contract.id.clone(),
                }
                .into());
            }
            comments.push(comment.resolve(&actor, response)?);
        }

        let next = self.execute(&actor, &contract, &transition, Some(response.to_string()), comments, &caller.client)?;
        Ok(TransitionOutcome::from(&next))
    }

    pub fn fix_metadata(
        &self,
        contract_id: &str,
        caller: &Caller,
        update: &MetadataUpdate,
    ) -> Result<MetadataOutcome, ContractError> {
        let (actor, contract) = self.prepare(contract_id, caller, Action::FixMetadata)?;
        if contract.locked {
            return Err(ContractError::forbidden(Action::FixMetadata, "contract is locked"));
        }

        let (metadata, changes) = update.apply_to(&contract.metadata)?;
        let fields = changes
            .iter()
            .map(|c| c.field.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let now = TimeStamp::new();
        let mut next = contract.clone();
        next.metadata = metadata;
        next.history.metadata.append(MetadataEvent {
            actor: ActorStamp::from(&actor),
            at: now.clone(),
            changes: changes.clone(),
        });
        next.version += 1;
        next.updated_at = now;

        let version = ledger::snapshot(
            &next,
            ChangeType::MetadataUpdate,
            format!("metadata corrected by {}: {fields}", actor.display_name()),
            &actor,
        )?;
        let activity = ActivityRecord::new(&actor.id, ActivityType::FixMetadata, Some(&contract.id), &caller.client)
            .detail("fields", &fields)
            .detail("version", next.version);

        self.store.commit(&Mutation {
            expected: Some(Expected::of(&contract)),
            action: Action::FixMetadata,
            contract: next.clone(),
            version,
            activity,
            comments: Vec::new(),
            notifications: Vec::new(),
        })?;

        info!(contract_id = %next.id, actor = %actor.id, fields = %fields, version = next.version, "metadata corrected");
        Ok(MetadataOutcome {
            version_number: next.version,
            updated_fields: changes,
        })
    }

    /// Program manager review, `summary` becomes a comment carrying the recommendation
    pub fn submit_review(
        &self,
        contract_id: &str,
        caller: &Caller,
        recommendation: Recommendation,
        summary: Option<&str>,
        comments: Vec<NewComment>,
    ) -> Result<ReviewOutcome, ContractError> {
        let summary = summary.map(str::trim).filter(|s| !s.is_empty());
        let transition = Transition::Review {
            recommendation,
            comment_count: (comments.len() + usize::from(summary.is_some())) as u64,
        };
        let (actor, contract) = self.prepare_transition(contract_id, caller, &transition)?;

        let mut inputs = Vec::with_capacity(comments.len() + 1);
        if let Some(summary) = summary {
            inputs.push(NewComment::new("review", summary).recommend(recommendation));
        }
        for comment in comments {
            comment.validate()?;
            inputs.push(comment);
        }
        let persisted = inputs
            .into_iter()
            .map(|c| Ok(c.into_comment(new_id(COMMENT_HRP)?, &contract.id, &actor)))
            .collect::<Result<Vec<_>, ContractError>>()?;
        let comment_ids = persisted.iter().map(|c| c.id.clone()).collect();

        let next = self.execute(&actor, &contract, &transition, summary.map(str::to_string), persisted, &caller.client)?;
        Ok(ReviewOutcome {
            status: next.status,
            version_number: next.version,
            comment_ids,
        })
    }

    pub fn final_approval(
        &self,
        contract_id: &str,
        caller: &Caller,
        decision: FinalDecision,
    ) -> Result<ApprovalOutcome, ContractError> {
        let transition = Transition::FinalApproval {
            verdict: decision.verdict,
            lock: decision.lock,
            risk_accepted: decision.risk_accepted,
            business_sign_off: decision.business_sign_off,
        };
        let (actor, contract) = self.prepare_transition(contract_id, caller, &transition)?;

        if decision.comments.trim().is_empty() {
            return Err(ValidationError::EmptyField("comments").into());
        }
        let recommendation = match decision.verdict {
            Verdict::Approve => Recommendation::Approve,
            Verdict::Reject => Recommendation::Reject,
        };
        let comment = NewComment::new("director_decision", &decision.comments)
            .recommend(recommendation)
            .into_comment(new_id(COMMENT_HRP)?, &contract.id, &actor);

        let next = self.execute(&actor, &contract, &transition, Some(decision.comments), vec![comment], &caller.client)?;
        Ok(ApprovalOutcome {
            status: next.status,
            locked: next.locked,
            version_number: next.version,
        })
    }

    pub fn final_publish(
        &self,
        contract_id: &str,
        caller: &Caller,
        notes: Option<&str>,
    ) -> Result<TransitionOutcome, ContractError> {
        let transition = Transition::FinalPublish;
        let (actor, contract) = self.prepare_transition(contract_id, caller, &transition)?;
        let next = self.execute(&actor, &contract, &transition, notes.map(str::to_string), Vec::new(), &caller.client)?;
        Ok(TransitionOutcome::from(&next))
    }

    /// Allowed once the end date has passed, or at any time for a terminated contract
    pub fn archive(
        &self,
        contract_id: &str,
        caller: &Caller,
        reason: &str,
        notes: Option<&str>,
    ) -> Result<TransitionOutcome, ContractError> {
        let transition = Transition::Archive {
            reason: reason.trim().to_string(),
        };
        let (actor, contract) = self.prepare_transition(contract_id, caller, &transition)?;
        if reason.trim().is_empty() {
            return Err(ValidationError::EmptyField("reason").into());
        }
        let next = self.execute(&actor, &contract, &transition, notes.map(str::to_string), Vec::new(), &caller.client)?;
        Ok(TransitionOutcome::from(&next))
    }

    /// Archives each contract independently, one failure does not stop the rest
    pub fn batch_archive(
        &self,
        contract_ids: &[&str],
        caller: &Caller,
        reason: &str,
    ) -> Vec<(String, Result<TransitionOutcome, ContractError>)> {
        let results: Vec<_> = contract_ids
            .iter()
            .map(|id| (id.to_string(), self.archive(id, caller, reason, None)))
            .collect();

        let archived = results.iter().filter(|(_, r)| r.is_ok()).count();
        info!(
            actor = %caller.user_id,
            archived,
            failed = results.len() - archived,
            "batch archive finished"
        );
        results
    }

    pub fn terminate(
        &self,
        contract_id: &str,
        caller: &Caller,
        reason: &str,
    ) -> Result<TransitionOutcome, ContractError> {
        let transition = Transition::Terminate {
            reason: reason.trim().to_string(),
        };
        let (actor, contract) = self.prepare_transition(contract_id, caller, &transition)?;
        if reason.trim().is_empty() {
            return Err(ValidationError::EmptyField("reason").into());
        }
        let next = self.execute(&actor, &contract, &transition, None, Vec::new(), &caller.client)?;
        Ok(TransitionOutcome::from(&next))
    }

    // comments

    /// Leaves status and version alone
    pub fn add_comment(
        &self,
        contract_id: &str,
        caller: &Caller,
        comment: NewComment,
    ) -> Result<ReviewComment, ContractError> {
        let (actor, contract) = self.prepare(contract_id, caller, Action::Comment)?;
        comment.validate()?;

        let comment = comment.into_comment(new_id(COMMENT_HRP)?, &contract.id, &actor);
        let activity = ActivityRecord::new(&actor.id, ActivityType::AddComment, Some(&contract.id), &caller.client)
            .detail("comment_id", &comment.id)
            .detail("comment_type", &comment.comment_type)
            .detail("is_risk", comment.is_risk)
            .detail("is_issue", comment.is_issue);
        self.store.commit_comment(&comment, &activity)?;

        info!(contract_id = %contract.id, comment_id = %comment.id, actor = %actor.id, "comment added");
        Ok(comment)
    }

    pub fn resolve_comment(
        &self,
        comment_id: &str,
        caller: &Caller,
        response: &str,
    ) -> Result<ReviewComment, ContractError> {
        let comment = self
            .store
            .load_comment(comment_id)?
            .ok_or_else(|| ContractError::not_found("comment", comment_id))?;
        let (actor, contract) = self.prepare(&comment.contract_id, caller, Action::ResolveComment)?;

        let resolved = comment.resolve(&actor, response)?;
        let activity = ActivityRecord::new(&actor.id, ActivityType::ResolveComment, Some(&contract.id), &caller.client)
            .detail("comment_id", comment_id);
        self.store.commit_comment(&resolved, &activity)?;

        info!(contract_id = %contract.id, comment_id, actor = %actor.id, "comment resolved");
        Ok(resolved)
    }

    pub fn list_comments(&self, contract_id: &str, caller: &Caller) -> Result<Vec<ReviewComment>, ContractError> {
        let (_, contract) = self.prepare(contract_id, caller, Action::View)?;
        self.store.list_comments(&contract.id)
    }

    // assignments and grants

    /// Replaces the assignee sets and notifies only newly added users
    pub fn reconcile_assignments(
        &self,
        contract_id: &str,
        caller: &Caller,
        next: Assignments,
    ) -> Result<AssignmentOutcome, ContractError> {
        let (actor, contract) = self.prepare(contract_id, caller, Action::Assign)?;

        let delta = contract.assignments.delta(&next);
        if delta.is_empty() {
            return Err(ValidationError::NoChanges.into());
        }
        for (role, user_id) in &delta.added {
            let user = self
                .store
                .load_user(user_id)?
                .ok_or_else(|| ValidationError::UnknownUser(user_id.clone()))?;
            if !user.active {
                return Err(ValidationError::InactiveUser(user_id.clone()).into());
            }
            if user.role != *role {
                return Err(ValidationError::RoleMismatch {
                    user_id: user_id.clone(),
                    expected: role.to_string(),
                }
                .into());
            }
        }

        let notifications: Vec<Notification> = delta
            .added
            .iter()
            .map(|(role, user_id)| Notification::assignment(&contract.id, user_id, *role, &actor.id))
            .collect();
        let added = delta.added_ids();
        let removed = delta.removed_ids();

        let now = TimeStamp::new();
        let mut updated = contract.clone();
        updated.history.assignment.append(AssignmentEvent {
            actor: ActorStamp::from(&actor),
            at: now.clone(),
            project_managers: next.project_managers.clone(),
            program_managers: next.program_managers.clone(),
            directors: next.directors.clone(),
            added: added.clone(),
            removed: removed.clone(),
        });
        updated.assignments = next;
        updated.version += 1;
        updated.updated_at = now;

        let version = ledger::snapshot(
            &updated,
            ChangeType::AssignmentUpdate,
            format!(
                "assignments updated by {}: {} added, {} removed",
                actor.display_name(),
                added.len(),
                removed.len()
            ),
            &actor,
        )?;
        let activity = ActivityRecord::new(&actor.id, ActivityType::AssignmentUpdate, Some(&contract.id), &caller.client)
            .detail("added", join(&added))
            .detail("removed", join(&removed))
            .detail("version", updated.version);

        self.store.commit(&Mutation {
            expected: Some(Expected::of(&contract)),
            action: Action::Assign,
            contract: updated.clone(),
            version,
            activity,
            comments: Vec::new(),
            notifications: notifications.clone(),
        })?;

        for notification in &notifications {
            if let Err(err) = self.notifier.deliver(notification) {
                warn!(
                    user_id = %notification.user_id,
                    contract_id = %notification.contract_id,
                    error = %err,
                    "notification delivery failed"
                );
            }
        }

        info!(
            contract_id = %updated.id,
            actor = %actor.id,
            added = added.len(),
            removed = removed.len(),
            version = updated.version,
            "assignments reconciled"
        );
        Ok(AssignmentOutcome {
            notified: notifications.into_iter().map(|n| n.user_id).collect(),
            version_number: updated.version,
        })
    }

    pub fn grant_permission(
        &self,
        contract_id: &str,
        caller: &Caller,
        user_id: &str,
        action: Action,
    ) -> Result<ContractPermission, ContractError> {
        let (actor, contract) = self.prepare(contract_id, caller, Action::Grant)?;
        if self.store.load_user(user_id)?.is_none() {
            return Err(ValidationError::UnknownUser(user_id.to_string()).into());
        }

        let grant = ContractPermission {
            contract_id: contract.id.clone(),
            user_id: user_id.to_string(),
            action,
            granted_by: actor.id.clone(),
            granted_at: TimeStamp::new(),
        };
        let activity = ActivityRecord::new(&actor.id, ActivityType::GrantPermission, Some(&contract.id), &caller.client)
            .detail("user_id", user_id)
            .detail("action", action);
        self.store.put_grant(&grant, &activity)?;

        info!(contract_id = %contract.id, actor = %actor.id, user_id, %action, "permission granted");
        Ok(grant)
    }

    // reads

    /// Newest first
    pub fn list_versions(&self, contract_id: &str, caller: &Caller) -> Result<Vec<VersionRecord>, ContractError> {
        let (_, contract) = self.prepare(contract_id, caller, Action::View)?;
        let versions = self.store.list_versions(&contract.id)?;
        debug!(contract_id, count = versions.len(), "versions listed");
        Ok(versions)
    }

    pub fn get_version(
        &self,
        contract_id: &str,
        version_number: u64,
        caller: &Caller,
    ) -> Result<VersionRecord, ContractError> {
        let (_, contract) = self.prepare(contract_id, caller, Action::View)?;
        self.store
            .get_version(&contract.id, version_number)?
            .ok_or_else(|| ContractError::not_found("version", format!("{contract_id}@{version_number}")))
    }

    pub fn list_activity(&self, caller: &Caller, query: &ActivityQuery) -> Result<Vec<ActivityRecord>, ContractError> {
        let actor = self.actor(caller)?;
        self.authorize_admin(&actor, AdminAction::ViewActivity)?;
        let limit = self.config.page_size(query.limit);
        self.store.query_activity(query, limit)
    }

    pub fn list_notifications(&self, caller: &Caller) -> Result<Vec<Notification>, ContractError> {
        let actor = self.actor(caller)?;
        if !actor.active {
            return Err(ContractError::forbidden("list_notifications", DenyReason::Inactive));
        }
        self.store.notifications_for(&actor.id)
    }

    /// Similar contracts, restricted to those the caller may view
    pub fn similar_contracts(
        &self,
        contract_id: &str,
        caller: &Caller,
        limit: usize,
    ) -> Result<Vec<SimilarContract>, ContractError> {
        let (actor, contract) = self.prepare(contract_id, caller, Action::View)?;
        let similarity = self.similarity.as_ref().ok_or_else(|| ContractError::DependencyFailure {
            collaborator: "similarity search",
            message: "not configured".to_string(),
        })?;

        let mut visible = Vec::new();
        for candidate in similarity
            .similar(&contract.id, limit)
            .map_err(dependency_failure("similarity search"))?
        {
            let Some(other) = self.store.load_contract(&candidate.contract_id)? else {
                continue;
            };
            let grants = self.store.grants_for(&other.id, &actor.id)?;
            if permission::evaluate(&actor, &other, Action::View, &grants).is_allowed() {
                visible.push(candidate);
            }
        }
        Ok(visible)
    }

    // identities

    /// Creates the first administrator of an empty store
    pub fn bootstrap_admin(&self, new: NewUser, client: &ClientMeta) -> Result<User, ContractError> {
        let role = new.validate()?;
        if !matches!(role, Role::SuperAdmin | Role::Director) {
            return Err(ValidationError::InvalidValue {
                field: "role",
                value: role.to_string(),
            }
            .into());
        }
        if !self.store.list_users()?.is_empty() {
            return Err(ContractError::forbidden("bootstrap", "users already exist"));
        }

        let user = new.into_user(new_id(USER_HRP)?, role);
        let activity = ActivityRecord::new(&user.id, ActivityType::UserCreated, None, client)
            .detail("user_id", &user.id)
            .detail("role", role)
            .detail("bootstrap", true);
        self.store.insert_user(&user, &activity)?;

        info!(user_id = %user.id, %role, "administrator bootstrapped");
        Ok(user)
    }

    /// Self-service sign-up, open to project and program managers only
    pub fn register_user(&self, new: NewUser, client: &ClientMeta) -> Result<User, ContractError> {
        let role = new.validate()?;
        if !role.is_self_registrable() {
            return Err(ContractError::forbidden(
                "register",
                format!("role {role} must be created by an administrator"),
            ));
        }

        let user = new.into_user(new_id(USER_HRP)?, role);
        let activity = ActivityRecord::new(&user.id, ActivityType::UserCreated, None, client)
            .detail("user_id", &user.id)
            .detail("role", role)
            .detail("self_registered", true);
        self.store.insert_user(&user, &activity)?;

        info!(user_id = %user.id, handle = %user.handle, %role, "user registered");
        Ok(user)
    }

    pub fn create_user(&self, caller: &Caller, new: NewUser) -> Result<User, ContractError> {
        let admin = self.actor(caller)?;
        self.authorize_admin(&admin, AdminAction::CreateUser)?;
        let role = new.validate()?;

        let user = new.into_user(new_id(USER_HRP)?, role);
        let activity = ActivityRecord::new(&admin.id, ActivityType::UserCreated, None, &caller.client)
            .detail("user_id", &user.id)
            .detail("role", role);
        self.store.insert_user(&user, &activity)?;

        info!(user_id = %user.id, admin = %admin.id, %role, "user created");
        Ok(user)
    }

    pub fn update_user(&self, caller: &Caller, user_id: &str, update: &UserUpdate) -> Result<User, ContractError> {
        let admin = self.actor(caller)?;
        self.authorize_admin(&admin, AdminAction::UpdateUser)?;
        let target = self
            .store
            .load_user(user_id)?
            .ok_or_else(|| ContractError::not_found("user", user_id))?;

        let (mut updated, fields) = update.apply_to(&target)?;
        if fields.is_empty() {
            return Err(ValidationError::NoChanges.into());
        }
        updated.updated_at = TimeStamp::new();

        let activity = ActivityRecord::new(&admin.id, ActivityType::UserUpdated, None, &caller.client)
            .detail("user_id", user_id)
            .detail("fields", fields.join(","));
        self.store.update_user(&target, &updated, &activity)?;

        info!(user_id, admin = %admin.id, fields = ?fields, "user updated");
        Ok(updated)
    }

    /// Soft delete, the account stays referenced by history
    pub fn deactivate_user(&self, caller: &Caller, user_id: &str) -> Result<User, ContractError> {
        let admin = self.actor(caller)?;
        self.authorize_admin(&admin, AdminAction::DeactivateUser)?;
        let target = self
            .store
            .load_user(user_id)?
            .ok_or_else(|| ContractError::not_found("user", user_id))?;
        if !target.active {
            return Err(ValidationError::InactiveUser(user_id.to_string()).into());
        }

        let mut updated = target.clone();
        updated.active = false;
        updated.updated_at = TimeStamp::new();

        let activity = ActivityRecord::new(&admin.id, ActivityType::UserDeactivated, None, &caller.client)
            .detail("user_id", user_id);
        self.store.update_user(&target, &updated, &activity)?;

        info!(user_id, admin = %admin.id, "user deactivated");
        Ok(updated)
    }

    /// Users may read their own account, administrators any account
    pub fn get_user(&self, caller: &Caller, user_id: &str) -> Result<User, ContractError> {
        let actor = self.actor(caller)?;
        if actor.id != user_id {
            self.authorize_admin(&actor, AdminAction::ListUsers)?;
        }
        self.store
            .load_user(user_id)?
            .ok_or_else(|| ContractError::not_found("user", user_id))
    }

    pub fn list_users(&self, caller: &Caller) -> Result<Vec<User>, ContractError> {
        let actor = self.actor(caller)?;
        self.authorize_admin(&actor, AdminAction::ListUsers)?;
        self.store.list_users()
    }

    /// Resolves a token through the configured verifier and records the login
    pub fn authenticate(&self, token: &str, client: &ClientMeta) -> Result<User, ContractError> {
        let verifier = self.credentials.as_ref().ok_or_else(|| ContractError::DependencyFailure {
            collaborator: "credential verifier",
            message: "not configured".to_string(),
        })?;

        let user_id = verifier.verify(token).map_err(|err| {
            warn!(error = %err, "credential verification failed");
            ContractError::forbidden("login", "invalid credentials")
        })?;
        let user = self
            .store
            .load_user(&user_id)?
            .ok_or_else(|| ContractError::forbidden("login", "unknown account"))?;
        if !user.active {
            warn!(user_id = %user.id, "login attempt by inactive account");
            return Err(ContractError::forbidden("login", DenyReason::Inactive));
        }

        self.store
            .record_activity(&ActivityRecord::new(&user.id, ActivityType::Login, None, client))?;
        info!(user_id = %user.id, "login");
        Ok(user)
    }

    pub fn logout(&self, caller: &Caller) -> Result<(), ContractError> {
        let actor = self.actor(caller)?;
        self.store
            .record_activity(&ActivityRecord::new(&actor.id, ActivityType::Logout, None, &caller.client))?;
        info!(user_id = %actor.id, "logout");
        Ok(())
    }

    // internals

    fn actor(&self, caller: &Caller) -> Result<User, ContractError> {
        self.store.load_user(&caller.user_id)?.ok_or_else(|| {
            warn!(user_id = %caller.user_id, "request from unknown actor");
            ContractError::forbidden("act", "unknown actor")
        })
    }

    fn contract(&self, contract_id: &str) -> Result<Contract, ContractError> {
        self.store
            .load_contract(contract_id)?
            .ok_or_else(|| ContractError::not_found("contract", contract_id))
    }

    fn authorize(&self, actor: &User, contract: &Contract, action: Action) -> Result<(), ContractError> {
        let grants = self.store.grants_for(&contract.id, &actor.id)?;
        let decision = permission::evaluate(actor, contract, action, &grants);
        if let Decision::Deny(reason) = decision {
            warn!(actor = %actor.id, contract_id = %contract.id, %action, %reason, "permission denied");
        }
        decision.into_result(action)
    }

    fn authorize_admin(&self, actor: &User, action: AdminAction) -> Result<(), ContractError> {
        let decision = permission::evaluate_admin(actor, action);
        if let Decision::Deny(reason) = decision {
            warn!(actor = %actor.id, %action, %reason, "admin permission denied");
        }
        decision.into_result(action)
    }

    fn prepare(&self, contract_id: &str, caller: &Caller, action: Action) -> Result<(User, Contract), ContractError> {
        let contract = self.contract(contract_id)?;
        let actor = self.actor(caller)?;
        self.authorize(&actor, &contract, action)?;
        Ok((actor, contract))
    }

    fn prepare_transition(
        &self,
        contract_id: &str,
        caller: &Caller,
        transition: &Transition,
    ) -> Result<(User, Contract), ContractError> {
        let (actor, contract) = self.prepare(contract_id, caller, transition.action())?;
        transition.check(&contract, &TimeStamp::new())?;
        Ok((actor, contract))
    }

    /// Applies `transition` and commits the result with its snapshot, activity and comments
    fn execute(
        &self,
        actor: &User,
        current: &Contract,
        transition: &Transition,
        notes: Option<String>,
        comments: Vec<ReviewComment>,
        client: &ClientMeta,
    ) -> Result<Contract, ContractError> {
        let next = transition.apply(current, actor, notes.clone(), TimeStamp::new())?;
        let version = ledger::snapshot(
            &next,
            transition.change_type(),
            format!(
                "{} by {}: {} -> {}",
                transition.change_type(),
                actor.display_name(),
                current.status,
                next.status
            ),
            actor,
        )?;
        let activity = transition_activity(transition, actor, current, &next, notes, client);

        self.store.commit(&Mutation {
            expected: Some(Expected::of(current)),
            action: transition.action(),
            contract: next.clone(),
            version,
            activity,
            comments,
            notifications: Vec::new(),
        })?;

        info!(
            contract_id = %next.id,
            actor = %actor.id,
            action = %transition.action(),
            from = %current.status,
            to = %next.status,
            version = next.version,
            "transition accepted"
        );
        Ok(next)
    }
}

fn transition_activity(
    transition: &Transition,
    actor: &User,
    from: &Contract,
    to: &Contract,
    notes: Option<String>,
    client: &ClientMeta,
) -> ActivityRecord {
    let record = ActivityRecord::new(&actor.id, transition.activity_type(), Some(&from.id), client)
        .detail("from", from.status)
        .detail("to", to.status)
        .detail("version", to.version)
        .detail_opt("notes", notes);

    match transition {
        Transition::RespondToComments { comment_id } => record.detail_opt("comment_id", comment_id.as_ref()),
        Transition::Review {
            recommendation,
            comment_count,
        } => record
            .detail("recommendation", recommendation)
            .detail("comment_count", comment_count),
        Transition::FinalApproval {
            verdict,
            risk_accepted,
            business_sign_off,
            ..
        } => record
            .detail("decision", verdict)
            .detail("locked", to.locked)
            .detail("risk_accepted", risk_accepted)
            .detail("business_sign_off", business_sign_off),
        Transition::Archive { reason } | Transition::Terminate { reason } => record.detail("reason", reason),
        Transition::SubmitForReview | Transition::FinalPublish => record,
    }
}

fn validate_config(config: &ServiceConfig) -> Result<(), ContractError> {
    config.validate().map_err(|err| {
        ValidationError::InvalidValue {
            field: "config",
            value: err.to_string(),
        }
        .into()
    })
}

fn join(ids: &std::collections::BTreeSet<String>) -> String {
    ids.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}
