//! Shared setup for the integration tests
#![allow(dead_code)]

use contract_approval::{
    audit::ClientMeta,
    contract::{Contract, ContractMetadata, TimeStamp},
    identity::{NewUser, Role, User},
    service::{Caller, ContractService, Upload},
};
use std::sync::Arc;
use tempfile::{TempDir, tempdir};
use tracing_subscriber::EnvFilter;

pub struct Fixture {
    // held so the database directory outlives the service
    pub dir: TempDir,
    pub service: ContractService,
    pub admin: User,
    pub director: User,
    pub pm: User,
    pub pgm: User,
}

impl Fixture {
    pub fn caller(&self, user: &User) -> Caller {
        Caller::new(&user.id).with_client("10.0.0.7", "integration-tests")
    }

    /// A draft owned by `self.pm` whose end date lies `end_in_days` from now
    pub fn upload(&self, end_in_days: i64) -> anyhow::Result<Contract> {
        let metadata = ContractMetadata::new()
            .set_grant_name("Coastal Resilience Fund")
            .add_counterparty("Harbour Trust")
            .set_amount(25_000_000)
            .set_start_date(TimeStamp::days_from_now(end_in_days - 365))
            .set_end_date(TimeStamp::days_from_now(end_in_days));
        let upload = Upload::new("grant-agreement.pdf", b"%PDF-1.7 grant agreement".to_vec(), metadata);
        Ok(self.service.upload_contract(&self.caller(&self.pm), upload)?)
    }

    pub fn create_user(&self, handle: &str, role: Role) -> anyhow::Result<User> {
        let new = NewUser::new(handle, &format!("{handle}@example.org"), role).set_full_name(handle);
        Ok(self.service.create_user(&self.caller(&self.admin), new)?)
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fresh database on disk with one user per role
pub fn fixture(name: &str) -> anyhow::Result<Fixture> {
    fixture_with(name, |service| service)
}

/// Like [`fixture`], with a hook to swap collaborators before users are seeded
pub fn fixture_with(
    name: &str,
    configure: impl FnOnce(ContractService) -> ContractService,
) -> anyhow::Result<Fixture> {
    init_tracing();

    // Sled locks its directory, so every test gets its own database
    let dir = tempdir()?;
    let db = Arc::new(sled::open(dir.path().join(format!("{name}.db")))?);
    let service = configure(ContractService::new(db)?);

    let admin = service.bootstrap_admin(
        NewUser::new("root", "root@example.org", Role::SuperAdmin).set_full_name("Root Admin"),
        &ClientMeta::default(),
    )?;
    let admin_caller = Caller::new(&admin.id);
    let director = service.create_user(
        &admin_caller,
        NewUser::new("dana", "dana@example.org", Role::Director).set_full_name("Dana Director"),
    )?;
    let pm = service.register_user(
        NewUser::new("pat", "pat@example.org", Role::ProjectManager).set_full_name("Pat Project"),
        &ClientMeta::default(),
    )?;
    let pgm = service.register_user(
        NewUser::new("gail", "gail@example.org", Role::ProgramManager).set_full_name("Gail Program"),
        &ClientMeta::default(),
    )?;

    Ok(Fixture {
        dir,
        service,
        admin,
        director,
        pm,
        pgm,
    })
}
