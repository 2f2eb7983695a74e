//! Identifier helpers
use super::error::ContractError;
use bech32::Bech32m;
use uuid7::uuid7;

pub const CONTRACT_HRP: &str = "contract";
pub const USER_HRP: &str = "user";
pub const COMMENT_HRP: &str = "comment";
pub const BLOB_HRP: &str = "blob";

// construct a unique id from a fresh uuid7 then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

pub(crate) fn new_id(hrp: &str) -> Result<String, ContractError> {
    new_uuid_to_bech32(hrp).map_err(|e| ContractError::Encoding(e.to_string()))
}
