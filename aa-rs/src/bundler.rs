use crate::encoding::{self, parse_h256, parse_u256_quantity};
use crate::types::UserOperation;
use anyhow::{anyhow, Context, Result};
use ethers::types::{Address, H256, U256};
use serde_json::Value;
use std::time::Duration;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(1500);

/// ERC-4337 bundler JSON-RPC client.
///
/// The Kite bundler speaks the standard `eth_*UserOperation*` methods, so
/// this client stays vendor-portable.
#[derive(Debug, Clone)]
pub struct BundlerClient {
    url: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct GasEstimates {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
}

impl BundlerClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }

    pub async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<GasEstimates> {
        let params = serde_json::json!([
            encoding::user_op_to_json(op),
            encoding::fmt_address(entry_point)
        ]);
        let res = self
            .rpc("eth_estimateUserOperationGas", params)
            .await
            .context("eth_estimateUserOperationGas failed")?;

        Ok(GasEstimates {
            call_gas_limit: quantity_field(&res, "callGasLimit")?,
            verification_gas_limit: quantity_field(&res, "verificationGasLimit")?,
            pre_verification_gas: quantity_field(&res, "preVerificationGas")?,
        })
    }

    pub async fn send_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<H256> {
        let params = serde_json::json!([
            encoding::user_op_to_json(op),
            encoding::fmt_address(entry_point)
        ]);
        let res = self
            .rpc("eth_sendUserOperation", params)
            .await
            .context("eth_sendUserOperation failed")?;
        parse_userop_hash(&res)
    }

    /// Poll `eth_getUserOperationReceipt` until it is non-null or `timeout`
    /// elapses. A zero timeout polls forever; callers own their deadline.
    pub async fn wait_user_operation_receipt(
        &self,
        user_op_hash: H256,
        timeout: Duration,
    ) -> Result<Value> {
        let start = std::time::Instant::now();
        loop {
            if timeout.as_secs() > 0 && start.elapsed() > timeout {
                return Err(anyhow!(
                    "timed out waiting for userOp receipt after {:?}",
                    timeout
                ));
            }

            let params = serde_json::json!([encoding::fmt_h256(user_op_hash)]);
            match self.rpc("eth_getUserOperationReceipt", params).await {
                Ok(v) if !v.is_null() => return Ok(v),
                Ok(_) => {}
                Err(e) => {
                    // transient errors are common on staging bundlers; keep polling
                    tracing::warn!(error = %e, "bundler receipt poll error");
                }
            }

            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?;

        let status = resp.status();
        let body: Value = resp.json().await.context("failed to decode JSON")?;

        if !status.is_success() {
            return Err(anyhow!("HTTP {}: {}", status, body));
        }
        if let Some(err) = body.get("error") {
            return Err(anyhow!("RPC error: {}", err));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| anyhow!("missing result field"))
    }
}

fn quantity_field(v: &Value, key: &str) -> Result<U256> {
    let s = v
        .get(key)
        .and_then(|x| x.as_str())
        .ok_or_else(|| anyhow!("missing or invalid field {key}"))?;
    parse_u256_quantity(s)
}

/// `eth_sendUserOperation` results vary by vendor: most bundlers return the
/// hash as a bare JSON string, some wrap it in an object. Accept the shapes
/// seen in the wild.
fn parse_userop_hash(res: &Value) -> Result<H256> {
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else {
        return Err(anyhow!(
            "unexpected eth_sendUserOperation result shape (expected string or {{result: ...}}): {}",
            res
        ));
    };

    parse_h256(hash_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HASH: &str = "0x2222222222222222222222222222222222222222222222222222222222222222";

    #[test]
    fn userop_hash_from_bare_string() {
        assert_eq!(
            parse_userop_hash(&json!(HASH)).unwrap(),
            parse_h256(HASH).unwrap()
        );
    }

    #[test]
    fn userop_hash_from_wrapped_objects() {
        for key in ["result", "userOpHash"] {
            let res = json!({ key: HASH });
            assert_eq!(
                parse_userop_hash(&res).unwrap(),
                parse_h256(HASH).unwrap()
            );
        }
    }

    #[test]
    fn userop_hash_rejects_unknown_shape() {
        assert!(parse_userop_hash(&json!({ "foo": "bar" })).is_err());
        assert!(parse_userop_hash(&json!(7)).is_err());
    }

    #[test]
    fn gas_estimate_fields_parse_as_quantities() {
        let res = json!({
            "callGasLimit": "0x5208",
            "verificationGasLimit": "0x186a0",
            "preVerificationGas": "0xb71b0",
        });
        assert_eq!(quantity_field(&res, "callGasLimit").unwrap(), U256::from(21000));
        assert_eq!(
            quantity_field(&res, "verificationGasLimit").unwrap(),
            U256::from(100_000)
        );
        assert!(quantity_field(&res, "missing").is_err());
    }
}
