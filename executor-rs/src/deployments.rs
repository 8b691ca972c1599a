use eyre::{eyre, Result};
use serde::Deserialize;
use std::{fs, path::Path};

/// Minimal subset of `deployments/kite-testnet.json` used by the executor.
///
/// We intentionally keep this loose: extra fields are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentArtifact {
    pub chain_id: u64,
    #[serde(default)]
    pub rpc: Option<String>,
    /// Optional name of an environment variable that contains the RPC URL.
    /// Useful to avoid committing provider API keys.
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    pub settlement_token: String,
    #[serde(default)]
    pub settlement_token_decimals: Option<u32>,

    // Optional conveniences (not required by the executor)
    #[serde(default)]
    pub vault_factory: Option<String>,
    #[serde(default)]
    pub bundler: Option<String>,
}

impl DeploymentArtifact {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| eyre!("failed to read deployment artifact {}: {e}", path.display()))?;
        let art: DeploymentArtifact = serde_json::from_str(&raw).map_err(|e| {
            eyre!(
                "failed to parse deployment artifact {}: {e}",
                path.display()
            )
        })?;

        if art.settlement_token.trim().is_empty() {
            return Err(eyre!("deployment artifact settlementToken is empty"));
        }

        Ok(art)
    }
}
