pub mod assignment;
pub mod audit;
pub mod collaborators;
pub mod comment;
pub mod config;
pub mod contract;
pub mod error;
pub mod history;
pub mod identity;
pub mod ledger;
pub mod lifecycle;
pub mod permission;
pub mod service;
pub mod store;
pub mod utils;

pub use error::{ContractError, ValidationError};
pub use service::{Caller, ContractService};
