//! Registration, administration and login flows

mod common;

use common::{fixture, fixture_with};
use contract_approval::{
    ContractError, ValidationError,
    audit::{ActivityQuery, ActivityRecord, ActivityType, ClientMeta},
    collaborators::{CollaboratorError, CredentialVerifier},
    identity::{NewUser, Role, UserUpdate},
};
use std::sync::Arc;

/// Accepts `token-<user id>`
struct PrefixTokens;

impl CredentialVerifier for PrefixTokens {
    fn verify(&self, token: &str) -> Result<String, CollaboratorError> {
        token
            .strip_prefix("token-")
            .map(str::to_string)
            .ok_or_else(|| CollaboratorError::new("malformed token"))
    }
}

#[test]
fn self_registration_is_limited_to_managers() -> anyhow::Result<()> {
    let fx = fixture("register_roles")?;

    let err = fx
        .service
        .register_user(
            NewUser::new("dora", "dora@example.org", Role::Director),
            &ClientMeta::default(),
        )
        .unwrap_err();
    assert!(matches!(err, ContractError::Forbidden { .. }));

    let err = fx
        .service
        .bootstrap_admin(
            NewUser::new("root2", "root2@example.org", Role::SuperAdmin),
            &ClientMeta::default(),
        )
        .unwrap_err();
    assert!(matches!(err, ContractError::Forbidden { .. }));

    let director = fx.create_user("dora", Role::Director)?;
    assert_eq!(director.role, Role::Director);
    assert!(director.active);

    Ok(())
}

#[test]
fn handles_and_emails_are_unique_ignoring_case() -> anyhow::Result<()> {
    let fx = fixture("unique_identity")?;

    let err = fx
        .service
        .register_user(
            NewUser::new("PAT", "someone@example.org", Role::ProjectManager),
            &ClientMeta::default(),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        ContractError::Validation(ValidationError::DuplicateHandle(_))
    ));

    let err = fx
        .service
        .register_user(
            NewUser::new("patricia", "Pat@Example.org", Role::ProjectManager),
            &ClientMeta::default(),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        ContractError::Validation(ValidationError::DuplicateEmail(_))
    ));

    let admin = fx.caller(&fx.admin);
    let err = fx
        .service
        .update_user(&admin, &fx.pgm.id, &UserUpdate::new().set_email("pat@example.org"))
        .unwrap_err();
    assert!(matches!(
        err,
        ContractError::Validation(ValidationError::DuplicateEmail(_))
    ));

    let updated = fx.service.update_user(
        &admin,
        &fx.pgm.id,
        &UserUpdate::new().set_email("gail@programs.example.org").set_department("Grants"),
    )?;
    assert_eq!(updated.email, "gail@programs.example.org");

    // the old address is free again
    fx.service.register_user(
        NewUser::new("gabe", "gail@example.org", Role::ProgramManager),
        &ClientMeta::default(),
    )?;

    Ok(())
}

#[test]
fn administration_needs_an_admin_role() -> anyhow::Result<()> {
    let fx = fixture("admin_surface")?;
    let pm = fx.caller(&fx.pm);

    assert!(matches!(
        fx.service.list_users(&pm),
        Err(ContractError::Forbidden { .. })
    ));
    assert!(matches!(
        fx.service.get_user(&pm, &fx.pgm.id),
        Err(ContractError::Forbidden { .. })
    ));
    assert_eq!(fx.service.get_user(&pm, &fx.pm.id)?.handle, "pat");

    let users = fx.service.list_users(&fx.caller(&fx.director))?;
    assert_eq!(users.len(), 4);

    let err = fx
        .service
        .update_user(&fx.caller(&fx.admin), &fx.pm.id, &UserUpdate::new())
        .unwrap_err();
    assert!(matches!(err, ContractError::Validation(ValidationError::NoChanges)));

    Ok(())
}

#[test]
fn deactivated_users_are_denied_everything() -> anyhow::Result<()> {
    let fx = fixture("deactivation")?;
    let pm = fx.caller(&fx.pm);
    let contract = fx.upload(90)?;

    let deactivated = fx.service.deactivate_user(&fx.caller(&fx.admin), &fx.pm.id)?;
    assert!(!deactivated.active);

    assert!(matches!(
        fx.service.submit_for_review(&contract.id, &pm, None),
        Err(ContractError::Forbidden { .. })
    ));
    assert!(matches!(
        fx.service.get_contract(&contract.id, &pm),
        Err(ContractError::Forbidden { .. })
    ));

    let err = fx
        .service
        .deactivate_user(&fx.caller(&fx.admin), &fx.pm.id)
        .unwrap_err();
    assert!(matches!(
        err,
        ContractError::Validation(ValidationError::InactiveUser(_))
    ));

    // soft delete: history still points at the account
    assert_eq!(
        fx.service.get_contract(&contract.id, &fx.caller(&fx.director))?.created_by,
        fx.pm.id
    );

    let entries = fx.service.list_activity(
        &fx.caller(&fx.admin),
        &ActivityQuery::new().activity_type(ActivityType::UserDeactivated),
    )?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].details.get("user_id"), Some(&fx.pm.id));

    Ok(())
}

#[test]
fn login_and_logout_are_recorded() -> anyhow::Result<()> {
    let fx = fixture_with("login", |service| service.with_credentials(Arc::new(PrefixTokens)))?;
    let client = ClientMeta {
        address: Some("192.168.1.20".into()),
        user_agent: Some("firefox".into()),
    };

    let user = fx.service.authenticate(&format!("token-{}", fx.pm.id), &client)?;
    assert_eq!(user.id, fx.pm.id);
    fx.service.logout(&fx.caller(&fx.pm))?;

    assert!(matches!(
        fx.service.authenticate("garbage", &client),
        Err(ContractError::Forbidden { .. })
    ));
    assert!(matches!(
        fx.service.authenticate("token-user1ghost", &client),
        Err(ContractError::Forbidden { .. })
    ));

    fx.service.deactivate_user(&fx.caller(&fx.admin), &fx.pm.id)?;
    assert!(matches!(
        fx.service.authenticate(&format!("token-{}", fx.pm.id), &client),
        Err(ContractError::Forbidden { .. })
    ));

    let admin = fx.caller(&fx.admin);
    let logins = fx.service.list_activity(
        &admin,
        &ActivityQuery::new().activity_type(ActivityType::Login),
    )?;
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].client, client);
    let logouts = fx.service.list_activity(
        &admin,
        &ActivityQuery::new().activity_type(ActivityType::Logout),
    )?;
    assert_eq!(logouts.len(), 1);

    Ok(())
}

#[test]
fn authentication_without_a_verifier_is_a_dependency_failure() -> anyhow::Result<()> {
    let fx = fixture("no_verifier")?;
    let err = fx
        .service
        .authenticate("token", &ClientMeta::default())
        .unwrap_err();
    assert!(matches!(
        err,
        ContractError::DependencyFailure {
            collaborator: "credential verifier",
            ..
        }
    ));
    Ok(())
}

#[test]
fn updates_from_a_stale_copy_are_refused() -> anyhow::Result<()> {
    let fx = fixture("stale_user_update")?;
    let admin = fx.caller(&fx.admin);

    // another administrator loaded the account before it was deactivated
    let stale = fx.service.store().load_user(&fx.pgm.id)?.expect("pgm stored");
    fx.service.deactivate_user(&admin, &fx.pgm.id)?;

    let mut promoted = stale.clone();
    promoted.role = Role::Director;
    let activity = ActivityRecord::new(&fx.admin.id, ActivityType::UserUpdated, None, &ClientMeta::default())
        .detail("user_id", &fx.pgm.id);
    let err = fx
        .service
        .store()
        .update_user(&stale, &promoted, &activity)
        .unwrap_err();
    assert!(matches!(err, ContractError::Stale { entity: "user", .. }));
    assert!(err.is_retryable());

    let stored = fx.service.get_user(&admin, &fx.pgm.id)?;
    assert!(!stored.active);
    assert_eq!(stored.role, Role::ProgramManager);

    // reloading picks up the deactivation, the update then goes through
    let updated = fx
        .service
        .update_user(&admin, &fx.pgm.id, &UserUpdate::new().set_department("Grants"))?;
    assert!(!updated.active);

    Ok(())
}
