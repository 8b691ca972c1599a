use ethers::types::{Address, U256};
use eyre::{eyre, Result};
use paypai_vault::parse_address;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::{fs, path::Path};

/// Raw spool entry as written by `paypai-aa vault request` (camelCase JSON).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSpendRequest {
    pub id: u64,
    pub vault: String,
    /// Decimal amount in settlement-token units.
    pub amount: String,
    pub recipient: String,
    #[serde(default)]
    pub note: Option<String>,
}

/// A fully validated spend request, safe to act on.
#[derive(Debug, Clone)]
pub struct SpendRequest {
    pub id: u64,
    pub vault: Address,
    pub amount: U256,
    pub recipient: Address,
    pub note: Option<String>,
}

/// An entry the executor refuses to touch, with the reason why.
#[derive(Debug, Clone)]
pub struct RejectedRequest {
    pub id: u64,
    pub reason: String,
}

/// Load and validate the spool. A missing file is an empty spool; malformed
/// entries are rejected individually rather than failing the whole cycle.
pub fn load_requests(
    path: impl AsRef<Path>,
    token_decimals: u32,
) -> Result<(Vec<SpendRequest>, Vec<RejectedRequest>)> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok((Vec::new(), Vec::new()));
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| eyre!("failed to read requests file {}: {e}", path.display()))?;
    let entries: Vec<RawSpendRequest> = serde_json::from_str(&raw)
        .map_err(|e| eyre!("failed to parse requests file {}: {e}", path.display()))?;

    let mut seen_ids = BTreeSet::new();
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    for entry in entries {
        if !seen_ids.insert(entry.id) {
            rejected.push(RejectedRequest {
                id: entry.id,
                reason: "duplicate request id".to_string(),
            });
            continue;
        }

        match validate_entry(&entry, token_decimals) {
            Ok(req) => accepted.push(req),
            Err(reason) => rejected.push(RejectedRequest {
                id: entry.id,
                reason,
            }),
        }
    }

    Ok((accepted, rejected))
}

/// Per-entry validation: address formats and amount positivity are checked
/// here, before any RPC is made on the request's behalf.
pub fn validate_entry(entry: &RawSpendRequest, token_decimals: u32) -> Result<SpendRequest, String> {
    let vault = parse_address(&entry.vault).map_err(|e| e.to_string())?;
    let recipient = parse_address(&entry.recipient).map_err(|e| e.to_string())?;

    let trimmed = entry.amount.trim();
    if trimmed.starts_with('-') {
        return Err(format!("amount must be positive: {}", entry.amount));
    }
    let parsed = ethers::utils::parse_units(trimmed, token_decimals)
        .map_err(|e| format!("invalid amount '{}': {e}", entry.amount))?;
    let amount: U256 = parsed.into();
    if amount.is_zero() {
        return Err(format!("amount must be greater than zero: {}", entry.amount));
    }

    Ok(SpendRequest {
        id: entry.id,
        vault,
        amount,
        recipient,
        note: entry.note.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VAULT: &str = "0x1111111111111111111111111111111111111111";
    const RECIPIENT: &str = "0x2222222222222222222222222222222222222222";

    fn raw(id: u64, amount: &str) -> RawSpendRequest {
        RawSpendRequest {
            id,
            vault: VAULT.to_string(),
            amount: amount.to_string(),
            recipient: RECIPIENT.to_string(),
            note: None,
        }
    }

    #[test]
    fn valid_entry_converts_to_base_units() {
        let req = validate_entry(&raw(1, "1.5"), 18).unwrap();
        assert_eq!(req.amount, U256::from(1_500_000_000_000_000_000u128));
        assert_eq!(req.vault, VAULT.parse::<Address>().unwrap());
    }

    #[test]
    fn bad_addresses_and_amounts_are_rejected() {
        let mut entry = raw(1, "1");
        entry.vault = "0x123".to_string();
        assert!(validate_entry(&entry, 18).is_err());

        let mut entry = raw(1, "1");
        entry.recipient = "nope".to_string();
        assert!(validate_entry(&entry, 18).is_err());

        assert!(validate_entry(&raw(1, "0"), 18).is_err());
        assert!(validate_entry(&raw(1, "-2"), 18).is_err());
        assert!(validate_entry(&raw(1, "abc"), 18).is_err());
    }

    #[test]
    fn missing_spool_is_an_empty_spool() {
        let (accepted, rejected) =
            load_requests("/definitely/not/a/real/spool.json", 18).unwrap();
        assert!(accepted.is_empty());
        assert!(rejected.is_empty());
    }
}
