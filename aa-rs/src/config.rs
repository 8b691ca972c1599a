use anyhow::{anyhow, Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::{env, fs, path::Path, str::FromStr};

/// On-disk deployment artifact (camelCase JSON), e.g.
/// `deployments/kite-testnet.json`. Extra fields are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRaw {
    pub chain_id: u64,
    pub rpc: String,
    /// Optional env var holding the RPC URL, so provider keys stay out of git.
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    #[serde(default)]
    pub bundler: Option<String>,
    pub entry_point: String,
    pub account_factory: String,
    #[serde(default)]
    pub vault_factory: Option<String>,
    #[serde(default)]
    pub vault_implementation: Option<String>,
    pub settlement_token: String,
    #[serde(default)]
    pub settlement_token_decimals: Option<u32>,
}

/// Resolved chain configuration, constructed once in `main` and passed down.
///
/// This is deliberately a plain value, not a process-wide singleton: every
/// operation receives the configuration it runs against, and tests can build
/// one without touching global state.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub chain_id: u64,
    pub rpc_url: String,
    pub bundler_url: Option<String>,
    pub entry_point: Address,
    pub account_factory: Address,
    /// None until a factory is deployed; local address estimates are
    /// display-only in that state.
    pub vault_factory: Option<Address>,
    pub vault_implementation: Option<Address>,
    pub settlement_token: Address,
    pub settlement_token_decimals: u32,
}

pub fn load_deployment(path: &Path, rpc_override: Option<String>) -> Result<Deployment> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read deployment json at {}", path.display()))?;
    let raw: DeploymentRaw = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse deployment json at {}", path.display()))?;

    let rpc_url = if let Some(rpc) = rpc_override {
        rpc
    } else if let Some(env_var) = raw.rpc_env_var.clone() {
        env::var(&env_var).unwrap_or(raw.rpc.clone())
    } else {
        raw.rpc.clone()
    };

    let entry_point = parse_addr(&raw.entry_point).context("invalid entryPoint address")?;
    let account_factory =
        parse_addr(&raw.account_factory).context("invalid accountFactory address")?;
    let settlement_token =
        parse_addr(&raw.settlement_token).context("invalid settlementToken address")?;

    Ok(Deployment {
        chain_id: raw.chain_id,
        rpc_url,
        bundler_url: raw.bundler.clone(),
        entry_point,
        account_factory,
        vault_factory: parse_optional_addr(raw.vault_factory.as_deref())
            .context("invalid vaultFactory address")?,
        vault_implementation: parse_optional_addr(raw.vault_implementation.as_deref())
            .context("invalid vaultImplementation address")?,
        settlement_token,
        settlement_token_decimals: raw.settlement_token_decimals.unwrap_or(18),
    })
}

fn parse_addr(s: &str) -> Result<Address> {
    Address::from_str(s).map_err(|e| anyhow!("{e}"))
}

/// The zero address means "not configured", the same convention the
/// deployment tooling uses for a factory that has not been deployed yet.
fn parse_optional_addr(s: Option<&str>) -> Result<Option<Address>> {
    match s {
        None => Ok(None),
        Some(raw) => {
            let addr = parse_addr(raw)?;
            if addr.is_zero() {
                Ok(None)
            } else {
                Ok(Some(addr))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_factory_address_reads_as_unconfigured() {
        let parsed =
            parse_optional_addr(Some("0x0000000000000000000000000000000000000000")).unwrap();
        assert_eq!(parsed, None);

        let parsed =
            parse_optional_addr(Some("0x1111111111111111111111111111111111111111")).unwrap();
        assert!(parsed.is_some());

        assert_eq!(parse_optional_addr(None).unwrap(), None);
        assert!(parse_optional_addr(Some("nope")).is_err());
    }
}
