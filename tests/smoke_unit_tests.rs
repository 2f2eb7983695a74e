//! Smoke Screen Unit tests for contract approval components
//!
//! Unit tests that span the public surface of the crate, testing behaviour in
//! isolation from the integration scenarios. Mostly the happy path.
//!

use contract_approval::{
    ContractError, ValidationError,
    config::ServiceConfig,
    contract::{Contract, ContractMetadata, Status, TimeStamp},
    identity::Role,
    permission::Action,
    service::ContractService,
    utils::{CONTRACT_HRP, USER_HRP, new_uuid_to_bech32},
};
use std::str::FromStr;

// UTILS MODULE TESTS
mod utils_tests {
    use super::*;

    /// Ids carry the human-readable prefix of the entity they name
    #[test]
    fn ids_carry_their_prefix() {
        let contract_id = new_uuid_to_bech32(CONTRACT_HRP).unwrap();
        let user_id = new_uuid_to_bech32(USER_HRP).unwrap();

        assert!(contract_id.starts_with("contract1"));
        assert!(user_id.starts_with("user1"));
        assert_ne!(contract_id, user_id);
    }

    #[test]
    fn empty_hrp_is_rejected() {
        assert!(new_uuid_to_bech32("").is_err());
    }

    /// uuid7 ids minted in sequence sort in creation order
    #[test]
    fn ids_are_unique_and_ordered() {
        let ids: Vec<String> = (0..16)
            .map(|_| new_uuid_to_bech32(CONTRACT_HRP).unwrap())
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
    }
}

// VOCABULARY TESTS
mod vocabulary_tests {
    use super::*;

    #[test]
    fn statuses_round_trip_through_their_names() {
        for status in Status::ALL {
            assert_eq!(Status::from_str(status.as_str()).unwrap(), status);
        }
        assert_eq!(Status::UnderReview.to_string(), "under_review");
        assert!(Status::Published.is_terminal());
        assert!(Status::Archived.is_terminal());
        assert!(!Status::Terminated.is_terminal());
    }

    #[test]
    fn unknown_names_are_validation_errors() {
        assert!(matches!(
            Status::from_str("pending"),
            Err(ValidationError::InvalidValue { field: "status", .. })
        ));
        assert!(matches!(
            Action::from_str("delete"),
            Err(ValidationError::InvalidValue { field: "action", .. })
        ));
        assert!(Role::from_str("auditor").is_err());
    }

    #[test]
    fn roles_and_actions_parse() {
        assert_eq!(Role::from_str("program_manager").unwrap(), Role::ProgramManager);
        assert_eq!(Action::from_str("final_approval").unwrap(), Action::FinalApproval);
        assert!(Role::ProjectManager.is_self_registrable());
        assert!(!Role::SuperAdmin.is_self_registrable());
    }
}

// CONTRACT TESTS
mod contract_tests {
    use super::*;

    #[test]
    fn drafts_start_at_version_one() {
        let contract = Contract::draft("contract1x".into(), "user1x".into(), ContractMetadata::new());
        assert_eq!(contract.status, Status::Draft);
        assert_eq!(contract.version, 1);
        assert!(!contract.locked);
        assert_eq!(contract.history.entry_count(), 0);
    }

    #[test]
    fn expiry_needs_an_end_date_in_the_past() {
        let mut contract = Contract::draft("contract1x".into(), "user1x".into(), ContractMetadata::new());
        let now = TimeStamp::new();
        assert!(!contract.has_expired(&now));

        contract.metadata = ContractMetadata::new().set_end_date(TimeStamp::days_from_now(30));
        assert!(!contract.has_expired(&now));

        contract.metadata = ContractMetadata::new().set_end_date(TimeStamp::days_from_now(-1));
        assert!(contract.has_expired(&now));
    }

    #[test]
    fn metadata_validation() {
        let valid = ContractMetadata::new()
            .set_grant_name("Rural broadband")
            .set_amount(1_000)
            .set_start_date(TimeStamp::days_from_now(-10))
            .set_end_date(TimeStamp::days_from_now(10));
        assert!(valid.validate().is_ok());

        let inverted = ContractMetadata::new()
            .set_start_date(TimeStamp::days_from_now(10))
            .set_end_date(TimeStamp::days_from_now(-10));
        assert!(!inverted.validate_dates());
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn serialized_hash_is_stable() {
        let contract = Contract::draft("contract1x".into(), "user1x".into(), ContractMetadata::new());
        let (first, cbor) = contract.serialize_with_hash().unwrap();
        let (second, _) = contract.serialize_with_hash().unwrap();
        assert_eq!(first, second);
        assert_eq!(first, sha256::digest(&cbor));
    }
}

// SERVICE TESTS
mod service_tests {
    use super::*;

    #[test]
    fn temporary_service_starts_empty() -> anyhow::Result<()> {
        let service = ContractService::open(ServiceConfig::temporary())?;
        assert!(service.store().list_users()?.is_empty());
        assert_eq!(service.config().activity_page_size, 50);
        Ok(())
    }

    #[test]
    fn conflicts_are_retryable() {
        let conflict = ContractError::Conflict {
            contract_id: "contract1x".into(),
            expected: 1,
            actual: 2,
        };
        assert!(conflict.is_retryable());
        assert!(!ContractError::Validation(ValidationError::NoChanges).is_retryable());
    }
}
