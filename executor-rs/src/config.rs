use crate::deployments::DeploymentArtifact;
use ethers::types::Address;
use eyre::{eyre, Result};
use std::{path::PathBuf, str::FromStr, time::Duration};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub settlement_token: Address,
    pub settlement_token_decimals: u32,

    pub poll_interval: Duration,

    pub state_file: PathBuf,
    pub requests_file: PathBuf,
    pub max_concurrency: usize,

    pub private_key_env: String,

    pub gas_limit: Option<u64>,

    /// Max number of executeSpend() txs to submit per cycle.
    pub max_txs_per_cycle: usize,

    /// How long to wait for a transaction receipt before considering it "still pending".
    pub tx_timeout: Duration,

    /// How long to keep an in-flight tx in the state file before dropping it and allowing a retry.
    pub pending_ttl: Duration,

    /// Backoff base duration for retryable failures (e.g., insufficient vault balance).
    pub backoff_base: Duration,

    /// Maximum backoff duration.
    pub backoff_max: Duration,

    /// Backoff base duration for rule denials (budget, recipient, authorization).
    ///
    /// These only clear when the window rolls over or the admin reconfigures,
    /// so the executor waits longer before re-checking.
    pub denial_backoff: Duration,

    /// Backoff base duration for transient RPC errors.
    pub rpc_error_backoff: Duration,

    /// Deterministic jitter window to avoid thundering herd.
    pub jitter: Duration,

    /// Whether to simulate executeSpend() via eth_call before sending a transaction.
    ///
    /// This avoids wasting gas on transactions that would revert.
    pub simulate: bool,

    pub once: bool,
    pub dry_run: bool,
}

impl ExecutorConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn from_cli_and_deployment(
        deployment: &DeploymentArtifact,
        rpc_override: Option<String>,
        private_key_env: String,
        poll_seconds: u64,
        state_file: PathBuf,
        requests_file: PathBuf,
        max_concurrency: usize,
        gas_limit: Option<u64>,
        max_txs_per_cycle: usize,
        tx_timeout_seconds: u64,
        pending_ttl_seconds: u64,
        backoff_base_seconds: u64,
        backoff_max_seconds: u64,
        denial_backoff_seconds: u64,
        rpc_error_backoff_seconds: u64,
        jitter_seconds: u64,
        simulate: bool,
        once: bool,
        dry_run: bool,
    ) -> Result<Self> {
        let rpc_url = rpc_override
            .or_else(|| std::env::var("PAYPAI_EXECUTOR_RPC_URL").ok())
            .or_else(|| {
                deployment
                    .rpc_env_var
                    .as_ref()
                    .and_then(|k| std::env::var(k).ok())
            })
            .or_else(|| deployment.rpc.clone())
            .ok_or_else(|| {
                eyre!(
                    "no rpc url provided. pass --rpc-url, set PAYPAI_EXECUTOR_RPC_URL, set deployment.rpcEnvVar, or include rpc in deployment json"
                )
            })?;

        let settlement_token = Address::from_str(&deployment.settlement_token).map_err(|e| {
            eyre!(
                "invalid settlementToken address '{}': {e}",
                deployment.settlement_token
            )
        })?;

        if max_concurrency == 0 {
            return Err(eyre!("max concurrency must be > 0"));
        }
        if max_txs_per_cycle == 0 {
            return Err(eyre!("max txs per cycle must be > 0"));
        }

        if rpc_url.contains("alchemy.com/v2/") || rpc_url.contains("infura.io/v3/") {
            tracing::warn!("RPC URL looks like it may contain an API key; consider using PAYPAI_EXECUTOR_RPC_URL env instead of committing it.");
        }

        if backoff_max_seconds > 0 && backoff_base_seconds > backoff_max_seconds {
            tracing::warn!(
                base = backoff_base_seconds,
                max = backoff_max_seconds,
                "backoff base > max; clamping base to max"
            );
        }

        if denial_backoff_seconds > 0 && denial_backoff_seconds > backoff_max_seconds {
            tracing::warn!(
                denial = denial_backoff_seconds,
                max = backoff_max_seconds,
                "denial backoff > max; clamping to max"
            );
        }

        Ok(Self {
            chain_id: deployment.chain_id,
            rpc_url,
            settlement_token,
            settlement_token_decimals: deployment.settlement_token_decimals.unwrap_or(18),
            poll_interval: Duration::from_secs(poll_seconds.max(1)),
            state_file,
            requests_file,
            max_concurrency,
            private_key_env,
            gas_limit,
            max_txs_per_cycle,
            tx_timeout: Duration::from_secs(tx_timeout_seconds.max(5)),
            pending_ttl: Duration::from_secs(pending_ttl_seconds.max(30)),
            backoff_max: Duration::from_secs(backoff_max_seconds.max(1)),
            backoff_base: Duration::from_secs(
                backoff_base_seconds.max(1).min(backoff_max_seconds.max(1)),
            ),
            denial_backoff: Duration::from_secs(
                denial_backoff_seconds.max(1).min(backoff_max_seconds.max(1)),
            ),
            rpc_error_backoff: Duration::from_secs(rpc_error_backoff_seconds.max(1)),
            jitter: Duration::from_secs(jitter_seconds),
            simulate,
            once,
            dry_run,
        })
    }
}
