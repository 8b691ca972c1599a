use crate::types::UserOperation;
use anyhow::{Context, Result};
use ethers::types::{Address, Bytes, H256, U256};

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

pub fn fmt_h256(h: H256) -> String {
    format!("0x{}", hex::encode(h.as_bytes()))
}

/// JSON-RPC "quantity" encoding (minimal hex, no leading zeros).
pub fn fmt_u256(v: U256) -> String {
    if v.is_zero() {
        "0x0".to_string()
    } else {
        format!("0x{:x}", v)
    }
}

pub fn fmt_bytes(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b.as_ref()))
}

/// The JSON shape bundlers expect for a v0.6 UserOperation.
pub fn user_op_to_json(op: &UserOperation) -> serde_json::Value {
    serde_json::json!({
        "sender": fmt_address(op.sender),
        "nonce": fmt_u256(op.nonce),
        "initCode": fmt_bytes(&op.init_code),
        "callData": fmt_bytes(&op.call_data),
        "callGasLimit": fmt_u256(op.call_gas_limit),
        "verificationGasLimit": fmt_u256(op.verification_gas_limit),
        "preVerificationGas": fmt_u256(op.pre_verification_gas),
        "maxFeePerGas": fmt_u256(op.max_fee_per_gas),
        "maxPriorityFeePerGas": fmt_u256(op.max_priority_fee_per_gas),
        "paymasterAndData": fmt_bytes(&op.paymaster_and_data),
        "signature": fmt_bytes(&op.signature),
    })
}

pub fn parse_u256_quantity(s: &str) -> Result<U256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(U256::zero());
    }
    Ok(U256::from_str_radix(s, 16)?)
}

pub fn parse_h256(s: &str) -> Result<H256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        anyhow::bail!("expected 32-byte hex, got {} bytes", bytes.len());
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(H256(arr))
}

/// Parse a human decimal amount ("1.5") into base units, rejecting zero and
/// negative values before anything reaches the network.
pub fn parse_positive_amount(s: &str, decimals: u32) -> Result<U256> {
    let trimmed = s.trim();
    if trimmed.starts_with('-') {
        anyhow::bail!("amount must be positive: {s}");
    }
    let parsed = ethers::utils::parse_units(trimmed, decimals)
        .with_context(|| format!("invalid amount: {s}"))?;
    let amount: U256 = parsed.into();
    if amount.is_zero() {
        anyhow::bail!("amount must be greater than zero: {s}");
    }
    Ok(amount)
}

pub fn format_amount(v: U256, decimals: u32) -> String {
    ethers::utils::format_units(v, decimals).unwrap_or_else(|_| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_roundtrip() {
        assert_eq!(fmt_u256(U256::zero()), "0x0");
        assert_eq!(fmt_u256(U256::from(255)), "0xff");
        assert_eq!(parse_u256_quantity("0xff").unwrap(), U256::from(255));
        assert_eq!(parse_u256_quantity("0x").unwrap(), U256::zero());
        assert!(parse_u256_quantity("0xzz").is_err());
    }

    #[test]
    fn positive_amount_validation() {
        assert_eq!(
            parse_positive_amount("1.5", 18).unwrap(),
            U256::from(1_500_000_000_000_000_000u128)
        );
        assert_eq!(parse_positive_amount("100", 6).unwrap(), U256::from(100_000_000u64));
        assert!(parse_positive_amount("0", 18).is_err());
        assert!(parse_positive_amount("-1", 18).is_err());
        assert!(parse_positive_amount("abc", 18).is_err());
    }
}
