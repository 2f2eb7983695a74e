//! sled-backed persistence for contracts, versions, activity and identities
//!
//! Every accepted contract mutation is written by [`ContractStore::commit`] in
//! a single multi-tree transaction: the contract row, its version snapshot,
//! its activity record and any comments or notifications it produced. The
//! transaction re-reads the contract and compares its version with the one
//! the caller loaded, so two requests racing on the same contract cannot both
//! commit.
use super::assignment::{Notification, notification_prefix};
use super::audit::{ActivityQuery, ActivityRecord};
use super::comment::{CommentStatus, ReviewComment, contract_comment_key, contract_comment_prefix};
use super::contract::{Contract, Status};
use super::error::{ContractError, ValidationError};
use super::identity::User;
use super::ledger::{VersionRecord, version_key, version_prefix};
use super::permission::{Action, ContractPermission};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionResult, TransactionalTree,
};
use sled::{Transactional, Tree};
use std::sync::Arc;
use tracing::debug;

/// The state a mutation was planned against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    pub version: u64,
    pub status: Status,
}

impl Expected {
    pub fn of(contract: &Contract) -> Self {
        Self {
            version: contract.version,
            status: contract.status,
        }
    }
}

/// Everything one accepted contract mutation writes
#[derive(Debug, Clone)]
pub struct Mutation {
    /// `None` for a brand new contract, whose id must be vacant
    pub expected: Option<Expected>,
    pub action: Action,
    pub contract: Contract,
    pub version: VersionRecord,
    pub activity: ActivityRecord,
    pub comments: Vec<ReviewComment>,
    pub notifications: Vec<Notification>,
}

pub struct ContractStore {
    instance: Arc<sled::Db>,
    contracts: Tree,
    versions: Tree,
    activity: Tree,
    comments: Tree,
    contract_comments: Tree,
    grants: Tree,
    notifications: Tree,
    users: Tree,
    user_index: Tree,
}

struct EncodedComment {
    id: String,
    index_key: Vec<u8>,
    bytes: Vec<u8>,
    resolving: bool,
}

impl ContractStore {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self, ContractError> {
        Ok(Self {
            contracts: instance.open_tree("contracts")?,
            versions: instance.open_tree("versions")?,
            activity: instance.open_tree("activity")?,
            comments: instance.open_tree("comments")?,
            contract_comments: instance.open_tree("contract_comments")?,
            grants: instance.open_tree("grants")?,
            notifications: instance.open_tree("notifications")?,
            users: instance.open_tree("users")?,
            user_index: instance.open_tree("user_index")?,
            instance,
        })
    }

    pub fn db(&self) -> &sled::Db {
        &self.instance
    }

    pub fn flush(&self) -> Result<(), ContractError> {
        self.instance.flush()?;
        Ok(())
    }

    // contracts

    pub fn load_contract(&self, contract_id: &str) -> Result<Option<Contract>, ContractError> {
        self.contracts
            .get(contract_id.as_bytes())?
            .map(|bytes| minicbor::decode(&bytes).map_err(ContractError::from))
            .transpose()
    }

    pub fn list_contracts(&self) -> Result<Vec<Contract>, ContractError> {
        self.contracts
            .iter()
            .values()
            .map(|bytes| Ok(minicbor::decode(&bytes?)?))
            .collect()
    }

    /// Writes a mutation atomically, or nothing at all
    pub fn commit(&self, mutation: &Mutation) -> Result<(), ContractError> {
        let contract_id = mutation.contract.id.as_str();
        let contract_bytes = minicbor::to_vec(&mutation.contract)?;
        let version_key = version_key(contract_id, mutation.version.version_number);
        let version_bytes = minicbor::to_vec(&mutation.version)?;
        let activity_bytes = minicbor::to_vec(&mutation.activity)?;
        let comments = mutation
            .comments
            .iter()
            .map(encode_comment)
            .collect::<Result<Vec<_>, _>>()?;
        let notifications = mutation
            .notifications
            .iter()
            .map(|n| Ok((n.key(), minicbor::to_vec(n)?)))
            .collect::<Result<Vec<_>, ContractError>>()?;

        let result: TransactionResult<(), ContractError> = (
            &self.contracts,
            &self.versions,
            &self.activity,
            &self.comments,
            &self.contract_comments,
            &self.notifications,
        )
            .transaction(
                |(contracts, versions, activity, comments_tx, index_tx, notifications_tx)| {
                    let persisted = contracts.get(contract_id.as_bytes())?;

                    match (mutation.expected, persisted) {
                        (None, None) => {}
                        (None, Some(bytes)) => {
                            let existing = decode_in_tx::<Contract>(&bytes)?;
                            return abort(ContractError::Conflict {
                                contract_id: contract_id.to_string(),
                                expected: 0,
                                actual: existing.version,
                            });
                        }
                        (Some(_), None) => {
                            return abort(ContractError::not_found("contract", contract_id));
                        }
                        (Some(expected), Some(bytes)) => {
                            let current = decode_in_tx::<Contract>(&bytes)?;
                            if current.version != expected.version {
                                return abort(ContractError::Conflict {
                                    contract_id: contract_id.to_string(),
                                    expected: expected.version,
                                    actual: current.version,
                                });
                            }
                            if current.status != expected.status {
                                return abort(ContractError::InvalidTransition {
                                    action: mutation.action,
                                    expected: vec![expected.status],
                                    actual: current.status,
                                });
                            }
                        }
                    }

                    contracts.insert(contract_id.as_bytes(), contract_bytes.as_slice())?;

                    if versions
                        .insert(version_key.as_slice(), version_bytes.as_slice())?
                        .is_some()
                    {
                        return abort(ContractError::Conflict {
                            contract_id: contract_id.to_string(),
                            expected: mutation.version.version_number - 1,
                            actual: mutation.version.version_number,
                        });
                    }

                    activity.insert(mutation.activity.key(), activity_bytes.as_slice())?;

                    for comment in &comments {
                        write_comment(comments_tx, index_tx, comment)?;
                    }
                    for (key, bytes) in &notifications {
                        notifications_tx.insert(key.as_slice(), bytes.as_slice())?;
                    }

                    Ok(())
                },
            );

        finish(result)?;
        debug!(
            contract_id,
            version = mutation.version.version_number,
            change = %mutation.version.change_type,
            comments = mutation.comments.len(),
            notifications = mutation.notifications.len(),
            "mutation committed"
        );
        Ok(())
    }

    // versions

    /// Every snapshot of a contract, newest first
    pub fn list_versions(&self, contract_id: &str) -> Result<Vec<VersionRecord>, ContractError> {
        self.versions
            .scan_prefix(version_prefix(contract_id))
            .values()
            .rev()
            .map(|bytes| Ok(minicbor::decode(&bytes?)?))
            .collect()
    }

    pub fn get_version(
        &self,
        contract_id: &str,
        version_number: u64,
    ) -> Result<Option<VersionRecord>, ContractError> {
        self.versions
            .get(version_key(contract_id, version_number))?
            .map(|bytes| minicbor::decode(&bytes).map_err(ContractError::from))
            .transpose()
    }

    // activity

    /// Single record outside a contract mutation (logins, logouts)
    pub fn record_activity(&self, record: &ActivityRecord) -> Result<(), ContractError> {
        self.activity.insert(record.key(), minicbor::to_vec(record)?)?;
        Ok(())
    }

    /// Newest first, after filtering, skipping `query.offset` and taking `limit`
    pub fn query_activity(
        &self,
        query: &ActivityQuery,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, ContractError> {
        let mut page = Vec::with_capacity(limit);
        let mut skipped = 0;

        for bytes in self.activity.iter().values().rev() {
            let record: ActivityRecord = minicbor::decode(&bytes?)?;
            if !query.matches(&record) {
                continue;
            }
            if skipped < query.offset {
                skipped += 1;
                continue;
            }
            page.push(record);
            if page.len() == limit {
                break;
            }
        }

        Ok(page)
    }

    // comments

    pub fn load_comment(&self, comment_id: &str) -> Result<Option<ReviewComment>, ContractError> {
        self.comments
            .get(comment_id.as_bytes())?
            .map(|bytes| minicbor::decode(&bytes).map_err(ContractError::from))
            .transpose()
    }

    /// Comments of a contract, oldest first
    pub fn list_comments(&self, contract_id: &str) -> Result<Vec<ReviewComment>, ContractError> {
        let mut comments = Vec::new();
        for key in self.contract_comments.scan_prefix(contract_comment_prefix(contract_id)).keys() {
            let key = key?;
            let comment_id = &key[contract_id.len() + 1..];
            if let Some(bytes) = self.comments.get(comment_id)? {
                comments.push(minicbor::decode::<ReviewComment>(&bytes)?);
            }
        }
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(comments)
    }

    /// A comment change that is not part of a contract mutation
    pub fn commit_comment(
        &self,
        comment: &ReviewComment,
        record: &ActivityRecord,
    ) -> Result<(), ContractError> {
        let encoded = encode_comment(comment)?;
        let activity_bytes = minicbor::to_vec(record)?;

        let result: TransactionResult<(), ContractError> =
            (&self.comments, &self.contract_comments, &self.activity).transaction(
                |(comments_tx, index_tx, activity)| {
                    write_comment(comments_tx, index_tx, &encoded)?;
                    activity.insert(record.key(), activity_bytes.as_slice())?;
                    Ok(())
                },
            );

        finish(result)
    }

    // grants

    pub fn grants_for(
        &self,
        contract_id: &str,
        user_id: &str,
    ) -> Result<Vec<ContractPermission>, ContractError> {
        self.grants
            .scan_prefix(format!("{contract_id}/{user_id}/"))
            .values()
            .map(|bytes| Ok(minicbor::decode(&bytes?)?))
            .collect()
    }

    pub fn put_grant(
        &self,
        grant: &ContractPermission,
        record: &ActivityRecord,
    ) -> Result<(), ContractError> {
        let key = format!("{}/{}/{}", grant.contract_id, grant.user_id, grant.action);
        let grant_bytes = minicbor::to_vec(grant)?;
        let activity_bytes = minicbor::to_vec(record)?;

        let result: TransactionResult<(), ContractError> = (&self.grants, &self.activity)
            .transaction(|(grants, activity)| {
                grants.insert(key.as_bytes(), grant_bytes.as_slice())?;
                activity.insert(record.key(), activity_bytes.as_slice())?;
                Ok(())
            });

        finish(result)
    }

    // notifications

    pub fn notifications_for(&self, user_id: &str) -> Result<Vec<Notification>, ContractError> {
        self.notifications
            .scan_prefix(notification_prefix(user_id))
            .values()
            .map(|bytes| Ok(minicbor::decode(&bytes?)?))
            .collect()
    }

    // users

    pub fn load_user(&self, user_id: &str) -> Result<Option<User>, ContractError> {
        self.users
            .get(user_id.as_bytes())?
            .map(|bytes| minicbor::decode(&bytes).map_err(ContractError::from))
            .transpose()
    }

    pub fn list_users(&self) -> Result<Vec<User>, ContractError> {
        self.users
            .iter()
            .values()
            .map(|bytes| Ok(minicbor::decode(&bytes?)?))
            .collect()
    }

    pub fn find_user_by_handle(&self, handle: &str) -> Result<Option<User>, ContractError> {
        match self.user_index.get(handle_key(handle))? {
            Some(id) => self.load_user(&String::from_utf8_lossy(&id)),
            None => Ok(None),
        }
    }

    /// Inserts a new user, enforcing unique handle and email
    pub fn insert_user(&self, user: &User, record: &ActivityRecord) -> Result<(), ContractError> {
        let user_bytes = minicbor::to_vec(user)?;
        let activity_bytes = minicbor::to_vec(record)?;
        let handle = handle_key(&user.handle);
        let email = email_key(&user.email);

        let result: TransactionResult<(), ContractError> =
            (&self.users, &self.user_index, &self.activity).transaction(
                |(users, index, activity)| {
                    if index.get(handle.as_bytes())?.is_some() {
                        return abort(ValidationError::DuplicateHandle(user.handle.clone()).into());
                    }
                    if index.get(email.as_bytes())?.is_some() {
                        return abort(ValidationError::DuplicateEmail(user.email.clone()).into());
                    }
                    index.insert(handle.as_bytes(), user.id.as_bytes())?;
                    index.insert(email.as_bytes(), user.id.as_bytes())?;
                    users.insert(user.id.as_bytes(), user_bytes.as_slice())?;
                    activity.insert(record.key(), activity_bytes.as_slice())?;
                    Ok(())
                },
            );

        finish(result)
    }

    /// Replaces `before` with `after`, moving the email index entry if needed.
    /// Aborts with `Stale` when the stored row no longer equals `before`.
    pub fn update_user(
        &self,
        before: &User,
        after: &User,
        record: &ActivityRecord,
    ) -> Result<(), ContractError> {
        let before_bytes = minicbor::to_vec(before)?;
        let user_bytes = minicbor::to_vec(after)?;
        let activity_bytes = minicbor::to_vec(record)?;
        let old_email = email_key(&before.email);
        let new_email = email_key(&after.email);

        let result: TransactionResult<(), ContractError> =
            (&self.users, &self.user_index, &self.activity).transaction(
                |(users, index, activity)| {
                    match users.get(before.id.as_bytes())? {
                        None => return abort(ContractError::not_found("user", before.id.clone())),
                        Some(stored) if stored.as_ref() != before_bytes.as_slice() => {
                            return abort(ContractError::Stale {
                                entity: "user",
                                id: before.id.clone(),
                            });
                        }
                        Some(_) => {}
                    }
                    if old_email != new_email {
                        if index.get(new_email.as_bytes())?.is_some() {
                            return abort(
                                ValidationError::DuplicateEmail(after.email.clone()).into(),
                            );
                        }
                        index.remove(old_email.as_bytes())?;
                        index.insert(new_email.as_bytes(), after.id.as_bytes())?;
                    }
                    users.insert(after.id.as_bytes(), user_bytes.as_slice())?;
                    activity.insert(record.key(), activity_bytes.as_slice())?;
                    Ok(())
                },
            );

        finish(result)
    }
}

fn handle_key(handle: &str) -> String {
    format!("handle:{}", handle.trim().to_lowercase())
}

fn email_key(email: &str) -> String {
    format!("email:{}", email.trim().to_lowercase())
}

fn encode_comment(comment: &ReviewComment) -> Result<EncodedComment, ContractError> {
    Ok(EncodedComment {
        id: comment.id.clone(),
        index_key: contract_comment_key(&comment.contract_id, &comment.id),
        bytes: minicbor::to_vec(comment)?,
        resolving: comment.status != CommentStatus::Open,
    })
}

/// New comments need a vacant id, resolutions need a stored comment that is still open
fn write_comment(
    comments: &TransactionalTree,
    index: &TransactionalTree,
    comment: &EncodedComment,
) -> ConflictableTransactionResult<(), ContractError> {
    let stored = comments.get(comment.id.as_bytes())?;

    match (comment.resolving, stored) {
        (false, Some(_)) => {
            return abort(ContractError::Encoding(format!(
                "comment id {} already in use",
                comment.id
            )));
        }
        (true, None) => return abort(ContractError::not_found("comment", comment.id.clone())),
        (true, Some(bytes)) => {
            let current = decode_in_tx::<ReviewComment>(&bytes)?;
            if !current.is_open() {
                return abort(ValidationError::AlreadyResolved(comment.id.clone()).into());
            }
        }
        (false, None) => {}
    }

    comments.insert(comment.id.as_bytes(), comment.bytes.as_slice())?;
    index.insert(comment.index_key.as_slice(), &b""[..])?;
    Ok(())
}

fn decode_in_tx<T>(bytes: &[u8]) -> ConflictableTransactionResult<T, ContractError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(bytes).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

fn abort<T>(err: ContractError) -> ConflictableTransactionResult<T, ContractError> {
    Err(ConflictableTransactionError::Abort(err))
}

fn finish<T>(result: TransactionResult<T, ContractError>) -> Result<T, ContractError> {
    result.map_err(|e| match e {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => ContractError::Storage(err),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{ActivityType, ClientMeta};
    use crate::contract::{ContractMetadata, TimeStamp};
    use crate::identity::{NewUser, Role};
    use crate::ledger::{ChangeType, snapshot};
    use crate::lifecycle::Transition;

    fn store() -> ContractStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        ContractStore::new(Arc::new(db)).unwrap()
    }

    fn creator() -> User {
        NewUser::new("pm", "pm@example.org", Role::ProjectManager)
            .into_user("user_pm".into(), Role::ProjectManager)
    }

    fn upload(store: &ContractStore) -> Contract {
        let actor = creator();
        let contract = Contract::draft("contract_1".into(), actor.id.clone(), ContractMetadata::new());
        let version = snapshot(&contract, ChangeType::Upload, "uploaded", &actor).unwrap();
        store
            .commit(&Mutation {
                expected: None,
                action: Action::Upload,
                contract: contract.clone(),
                version,
                activity: ActivityRecord::new(&actor.id, ActivityType::Upload, Some(&contract.id), &ClientMeta::default()),
                comments: vec![],
                notifications: vec![],
            })
            .unwrap();
        contract
    }

    fn submit(current: &Contract) -> Mutation {
        let actor = creator();
        let next = Transition::SubmitForReview
            .apply(current, &actor, None, TimeStamp::new())
            .unwrap();
        let version = snapshot(&next, ChangeType::ReviewSubmission, "submitted", &actor).unwrap();
        Mutation {
            expected: Some(Expected::of(current)),
            action: Action::SubmitReview,
            contract: next,
            version,
            activity: ActivityRecord::new(&actor.id, ActivityType::SubmitReview, Some(&current.id), &ClientMeta::default()),
            comments: vec![],
            notifications: vec![],
        }
    }

    #[test]
    fn commit_writes_contract_version_and_activity() {
        let store = store();
        let contract = upload(&store);
        store.commit(&submit(&contract)).unwrap();

        let loaded = store.load_contract(&contract.id).unwrap().unwrap();
        assert_eq!(loaded.status, Status::UnderReview);
        assert_eq!(loaded.version, 2);

        let versions = store.list_versions(&contract.id).unwrap();
        let numbers: Vec<_> = versions.iter().map(|v| v.version_number).collect();
        assert_eq!(numbers, vec![2, 1]);

        let activity = store.query_activity(&ActivityQuery::new(), 10).unwrap();
        assert_eq!(activity.len(), 2);
        assert_eq!(activity[0].activity_type, ActivityType::SubmitReview);
    }

    #[test]
    fn stale_mutation_is_a_conflict_and_writes_nothing() {
        let store = store();
        let contract = upload(&store);
        let first = submit(&contract);
        let second = submit(&contract);

        store.commit(&first).unwrap();
        let err = store.commit(&second).unwrap_err();
        assert!(matches!(err, ContractError::Conflict { expected: 1, actual: 2, .. }));

        assert_eq!(store.list_versions(&contract.id).unwrap().len(), 2);
        assert_eq!(store.query_activity(&ActivityQuery::new(), 10).unwrap().len(), 2);
    }

    #[test]
    fn duplicate_upload_id_is_rejected() {
        let store = store();
        let contract = upload(&store);
        let actor = creator();
        let version = snapshot(&contract, ChangeType::Upload, "again", &actor).unwrap();
        let err = store
            .commit(&Mutation {
                expected: None,
                action: Action::Upload,
                contract,
                version,
                activity: ActivityRecord::new(&actor.id, ActivityType::Upload, None, &ClientMeta::default()),
                comments: vec![],
                notifications: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, ContractError::Conflict { .. }));
    }

    #[test]
    fn handles_and_emails_are_unique() {
        let store = store();
        let user = creator();
        let record = ActivityRecord::new(&user.id, ActivityType::UserCreated, None, &ClientMeta::default());
        store.insert_user(&user, &record).unwrap();

        let mut clash = NewUser::new("PM", "other@example.org", Role::Director)
            .into_user("user_2".into(), Role::Director);
        let err = store.insert_user(&clash, &record).unwrap_err();
        assert!(matches!(err, ContractError::Validation(ValidationError::DuplicateHandle(_))));

        clash.handle = "fresh".into();
        clash.email = "pm@example.org".into();
        let err = store.insert_user(&clash, &record).unwrap_err();
        assert!(matches!(err, ContractError::Validation(ValidationError::DuplicateEmail(_))));

        assert_eq!(store.find_user_by_handle("Pm").unwrap().unwrap().id, user.id);
        assert_eq!(store.list_users().unwrap().len(), 1);
    }

    #[test]
    fn activity_pages_are_newest_first() {
        let store = store();
        let client = ClientMeta::default();
        for i in 0..5 {
            let record = ActivityRecord::new("user_1", ActivityType::Login, None, &client)
                .detail("n", i);
            store.record_activity(&record).unwrap();
        }

        let page = store.query_activity(&ActivityQuery::new().offset(1), 2).unwrap();
        let ns: Vec<_> = page.iter().map(|r| r.details["n"].clone()).collect();
        assert_eq!(ns, vec!["3", "2"]);
    }
}
