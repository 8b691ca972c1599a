//! Core logic for PayPai vaults.
//!
//! Two pieces live here, shared by the CLI (`paypai-aa`) and the executor
//! daemon (`paypai-executor`):
//!
//! - [`derive`]: off-chain prediction of the address a vault proxy will
//!   occupy once deployed via CREATE2 from the factory. The local result is
//!   a display estimate; the factory's `getVaultAddress` view is the ground
//!   truth once a factory exists on-chain.
//! - [`rules`]: the spending-rule ledger model (per-token rolling budget
//!   windows with recipient filters), mirroring the on-chain vault's
//!   accounting so callers can precheck spends before paying for gas.

pub mod derive;
pub mod rules;

pub use derive::{
    create2_address, estimate_vault_address, initialize_calldata, parse_address, vault_init_code_hash,
    vault_salt, VaultAddressEstimate,
};
pub use rules::{RuleLedger, SpendDenied, SpendingRule};

use ethers::types::Address;
use thiserror::Error;

/// Errors raised by the vault core at its boundaries.
///
/// Spend-time denials are a separate type ([`SpendDenied`]) because they are
/// expected outcomes of rule evaluation, not malformed input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VaultError {
    /// The supplied string is not a well-formed 20-byte account address.
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    /// A spending rule (or rule set) failed validation.
    #[error("invalid spending rule: {0}")]
    InvalidRule(String),

    /// A rule references a token more than once within one configuration.
    #[error("duplicate rule for token {0:?}")]
    DuplicateToken(Address),
}
