mod config;
mod deployments;
mod erc20;
mod requests;
mod spender;
mod state;
mod vault;

use clap::Parser;
use config::ExecutorConfig;
use deployments::DeploymentArtifact;
use ethers::middleware::NonceManagerMiddleware;
use ethers::prelude::{Http, LocalWallet, Provider, SignerMiddleware};
use ethers::providers::Middleware;
use ethers::signers::Signer;
use eyre::{eyre, Result};
use spender::execute_spends;
use state::{now_unix, ExecutorState, FailureKind, ReconcileOutcome};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use fs2::FileExt;

fn compute_backoff_seconds(
    cfg: &ExecutorConfig,
    kind: FailureKind,
    consecutive_failures: u32,
    request_id: u64,
) -> u64 {
    // Exponential backoff with deterministic jitter.
    //
    // Important: this must remain fast even if `consecutive_failures` grows large over time.
    let base = match kind {
        FailureKind::RpcError => cfg.rpc_error_backoff.as_secs().max(1),
        // Rule denials only clear when the window rolls over, the admin
        // reconfigures, or the executor is re-authorized: wait longer.
        FailureKind::NotExecutor
        | FailureKind::NoRuleConfigured
        | FailureKind::WindowNotStarted
        | FailureKind::RecipientNotAllowed
        | FailureKind::BudgetExceeded => cfg.denial_backoff.as_secs().max(1),
        FailureKind::InsufficientVaultBalance
        | FailureKind::SimulationRevert
        | FailureKind::MinedRevert
        | FailureKind::Unknown => cfg.backoff_base.as_secs().max(1),
    };

    let max = cfg.backoff_max.as_secs().max(1);

    // Clamp base to max so the cap remains meaningful.
    let base = base.min(max);

    // base * 2^(consecutive_failures - 1), then clamped to max.
    let exp = consecutive_failures.saturating_sub(1).min(63);
    let mut backoff = base.saturating_mul(1u64 << exp).min(max);

    // Deterministic jitter in [0, jitter_max) to reduce thundering herd,
    // clamped so backoff_max remains a hard cap.
    let jitter_max = cfg.jitter.as_secs();
    if jitter_max > 0 {
        backoff = backoff.saturating_add(request_id % jitter_max).min(max);
    }

    backoff
}

#[derive(Parser, Debug)]
#[command(
    name = "paypai-executor",
    version,
    about = "PayPai executor bot (Rust): executes queued vault spends under their spending rules."
)]
struct Args {
    /// Path to a deployment artifact JSON (e.g., deployments/kite-testnet.json)
    #[arg(long, default_value = "deployments/kite-testnet.json")]
    deployment: PathBuf,

    /// Override RPC URL. If omitted, uses PAYPAI_EXECUTOR_RPC_URL or deployment.rpc.
    #[arg(long)]
    rpc_url: Option<String>,

    /// Environment variable name that contains the executor's private key.
    #[arg(long, default_value = "EXECUTOR_PRIVATE_KEY")]
    private_key_env: String,

    /// Polling interval in seconds.
    #[arg(long, default_value_t = 30)]
    poll_seconds: u64,

    /// Max concurrent RPC calls/tx sends.
    #[arg(long, default_value_t = 10)]
    max_concurrency: usize,

    /// Optional fixed gas limit for executeSpend() calls.
    #[arg(long)]
    gas_limit: Option<u64>,

    /// Max number of executeSpend() transactions to submit per cycle.
    ///
    /// This is a safety valve to avoid draining the executor wallet if something goes wrong.
    #[arg(long, default_value_t = 25)]
    max_txs_per_cycle: usize,

    /// How many seconds to wait for a transaction receipt before treating it as "still pending".
    #[arg(long, default_value_t = 120)]
    tx_timeout_seconds: u64,

    /// How many seconds to keep an in-flight tx recorded before dropping it and allowing a retry.
    #[arg(long, default_value_t = 900)]
    pending_ttl_seconds: u64,

    /// Base backoff (seconds) for retryable failures.
    #[arg(long, default_value_t = 300)]
    backoff_base_seconds: u64,

    /// Maximum backoff (seconds).
    #[arg(long, default_value_t = 21600)]
    backoff_max_seconds: u64,

    /// Base backoff (seconds) for rule denials (budget/recipient/authorization).
    #[arg(long, default_value_t = 1800)]
    denial_backoff_seconds: u64,

    /// Base backoff (seconds) for transient RPC errors.
    #[arg(long, default_value_t = 30)]
    rpc_error_backoff_seconds: u64,

    /// Add deterministic jitter in [0, jitterSeconds) to spread retries.
    #[arg(long, default_value_t = 30)]
    jitter_seconds: u64,

    /// Disable executeSpend() eth_call simulation guardrail.
    #[arg(long)]
    no_simulate: bool,

    /// Ignore persisted per-request backoff and check everything every cycle.
    ///
    /// Useful for debugging. Not recommended for normal operation.
    #[arg(long)]
    ignore_backoff: bool,

    /// Where to store executor state (completed/in-flight requests, backoff).
    #[arg(long, default_value = "executor-rs/state/state.json")]
    state_file: PathBuf,

    /// Spend-request spool written by `paypai-aa vault request`.
    #[arg(long, default_value = "executor-rs/state/requests.json")]
    requests_file: PathBuf,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,

    /// Don't send transactions; only print what would be done.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let deployment = DeploymentArtifact::load(&args.deployment)?;

    let ignore_backoff = args.ignore_backoff;

    let cfg = ExecutorConfig::from_cli_and_deployment(
        &deployment,
        args.rpc_url,
        args.private_key_env,
        args.poll_seconds,
        args.state_file,
        args.requests_file,
        args.max_concurrency,
        args.gas_limit,
        args.max_txs_per_cycle,
        args.tx_timeout_seconds,
        args.pending_ttl_seconds,
        args.backoff_base_seconds,
        args.backoff_max_seconds,
        args.denial_backoff_seconds,
        args.rpc_error_backoff_seconds,
        args.jitter_seconds,
        !args.no_simulate,
        args.once,
        args.dry_run,
    )?;

    let private_key = std::env::var(&cfg.private_key_env).map_err(|_| {
        eyre!(
            "missing private key env var '{}'. Set it in your shell before running.",
            cfg.private_key_env
        )
    })?;

    let wallet: LocalWallet = private_key
        .parse::<LocalWallet>()
        .map_err(|e| eyre!("invalid private key in {}: {e}", cfg.private_key_env))?
        .with_chain_id(cfg.chain_id);

    // Provider + signer.
    let provider =
        Provider::<Http>::try_from(cfg.rpc_url.as_str())?.interval(std::time::Duration::from_millis(800));

    // Hard safety check: ensure we're connected to the expected chain.
    let remote_chain_id = provider.get_chainid().await?.as_u64();
    if remote_chain_id != cfg.chain_id {
        return Err(eyre!(
            "RPC chainId mismatch: deployment expects {}, but RPC reports {}. Refusing to run.",
            cfg.chain_id,
            remote_chain_id
        ));
    }

    // Ensure the settlement token has code at the configured address.
    let code = provider.get_code(cfg.settlement_token, None).await?;
    if code.0.is_empty() {
        return Err(eyre!(
            "no contract code found at settlement token address {:?}. Check deployments JSON and RPC.",
            cfg.settlement_token
        ));
    }

    let executor_address = wallet.address();
    let signer = SignerMiddleware::new(provider, wallet.clone());
    let client = NonceManagerMiddleware::new(signer, executor_address);
    let client = Arc::new(client);

    // Ensure the state directory exists before we create/lock the lockfile.
    if let Some(parent) = cfg.state_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create state directory {}: {e}", parent.display()))?;
        }
    }

    // Single-instance guard: lock alongside the state file.
    // This prevents two executors from running concurrently with the same signer/state.
    let lock_path = cfg.state_file.with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", lock_path.display()))?;
    lock_file.try_lock_exclusive().map_err(|e| {
        eyre!(
            "executor already running or lock unavailable ({}): {e}",
            lock_path.display()
        )
    })?;
    // Keep file handle alive.
    let _lock_guard = lock_file;

    tracing::info!(
        chain_id = cfg.chain_id,
        settlement_token = ?cfg.settlement_token,
        signer = ?executor_address,
        dry_run = cfg.dry_run,
        simulate = cfg.simulate,
        ignore_backoff,
        once = cfg.once,
        "executor starting"
    );

    let mut state = ExecutorState::load_or_init(&cfg.state_file)?;

    loop {
        // 0) Reconcile any in-flight txs from previous cycles (or restarts).
        let reconcile = state
            .reconcile_in_flight(client.as_ref(), cfg.pending_ttl)
            .await?;

        let ReconcileOutcome {
            cleared,
            finalized_success,
            finalized_revert,
        } = reconcile;

        if cleared > 0 {
            tracing::info!(cleared, "cleared in-flight txs");
        }

        // If a previously pending tx finalized, record its outcome so the
        // request is either completed or backed off rather than re-sent.
        //
        // In dry-run mode, we do not persist these updates.
        if !cfg.dry_run {
            let now = now_unix();
            let mut dirty = cleared > 0;

            for id in finalized_success {
                dirty = true;
                state.note_success(id);
            }

            for id in finalized_revert {
                dirty = true;

                let prev = state
                    .retries
                    .get(&id)
                    .map(|r| r.consecutive_failures)
                    .unwrap_or(0);
                let consecutive = prev.saturating_add(1);
                let backoff_s =
                    compute_backoff_seconds(&cfg, FailureKind::MinedRevert, consecutive, id);
                let next_retry_at = now.saturating_add(backoff_s);

                tracing::warn!(
                    request_id = id,
                    kind = ?FailureKind::MinedRevert,
                    consecutive,
                    backoff_s,
                    next_retry_at,
                    "in-flight spend tx mined but reverted; backing off"
                );

                state.note_failure(
                    id,
                    FailureKind::MinedRevert,
                    next_retry_at,
                    Some("in-flight tx mined but reverted".to_string()),
                );
            }

            if dirty {
                state.save(&cfg.state_file)?;
            }
        }

        // 1) Load the spend-request spool.
        let (all_requests, rejected) =
            requests::load_requests(&cfg.requests_file, cfg.settlement_token_decimals)?;

        for r in &rejected {
            tracing::warn!(request_id = r.id, reason = %r.reason, "rejected malformed spend request");
        }

        // 2) Filter out completed, in-flight, and backed-off requests.
        let now = now_unix();
        let completed = state.completed_set();
        let total_known = all_requests.len();
        let mut skipped_done = 0usize;
        let mut skipped_in_flight = 0usize;
        let mut skipped_backoff = 0usize;

        let eligible: Vec<requests::SpendRequest> = all_requests
            .into_iter()
            .filter(|req| {
                if completed.contains(&req.id) {
                    skipped_done += 1;
                    return false;
                }
                if state.in_flight.contains_key(&req.id) {
                    skipped_in_flight += 1;
                    return false;
                }
                if !ignore_backoff && state.should_skip_due_to_backoff(req.id, now) {
                    skipped_backoff += 1;
                    return false;
                }
                true
            })
            .collect();

        if total_known == 0 {
            tracing::info!("no spend requests in spool");
        } else if eligible.is_empty() {
            tracing::info!(
                total_known,
                skipped_done,
                skipped_in_flight,
                skipped_backoff,
                "no spend requests eligible this cycle"
            );
        } else {
            tracing::info!(
                total_known,
                checking = eligible.len(),
                skipped_done,
                skipped_in_flight,
                skipped_backoff,
                "processing spend requests"
            );

            let outcome = execute_spends(
                client.clone(),
                executor_address,
                eligible,
                cfg.max_concurrency,
                cfg.gas_limit,
                cfg.max_txs_per_cycle,
                cfg.tx_timeout,
                cfg.simulate,
                cfg.dry_run,
            )
            .await?;

            let pending_len = outcome.pending.len();
            let successes_len = outcome.successes.len();
            let failures_len = outcome.failures.len();

            let spender::SpendOutcome {
                stats,
                pending,
                successes,
                failures,
            } = outcome;

            // In dry-run mode, we intentionally do not persist pending txs or
            // backoff updates, so `--dry-run` stays side-effect free.
            if !cfg.dry_run {
                for p in pending {
                    state.mark_in_flight(p.request_id, p.tx_hash);
                }

                for id in successes {
                    state.note_success(id);
                }

                if !failures.is_empty() {
                    for f in failures {
                        let prev = state
                            .retries
                            .get(&f.request_id)
                            .map(|r| r.consecutive_failures)
                            .unwrap_or(0);
                        let consecutive = prev.saturating_add(1);
                        let backoff_s =
                            compute_backoff_seconds(&cfg, f.kind, consecutive, f.request_id);
                        let next_retry_at = now.saturating_add(backoff_s);

                        tracing::warn!(
                            request_id = f.request_id,
                            kind = ?f.kind,
                            consecutive,
                            backoff_s,
                            next_retry_at,
                            reason = f.reason.as_deref().unwrap_or(""),
                            "spend failed; backing off"
                        );

                        state.note_failure(f.request_id, f.kind, next_retry_at, f.reason);
                    }
                }

                state.save(&cfg.state_file)?;
            }

            tracing::info!(
                ?stats,
                pending = pending_len,
                successes = successes_len,
                failures = failures_len,
                "cycle complete"
            );
        }

        if cfg.once {
            break;
        }

        tokio::time::sleep(cfg.poll_interval).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_cfg() -> ExecutorConfig {
        ExecutorConfig {
            chain_id: 1,
            rpc_url: "http://localhost:8545".to_string(),
            settlement_token: ethers::types::Address::zero(),
            settlement_token_decimals: 18,
            poll_interval: Duration::from_secs(30),
            state_file: PathBuf::from("state.json"),
            requests_file: PathBuf::from("requests.json"),
            max_concurrency: 10,
            private_key_env: "EXECUTOR_PRIVATE_KEY".to_string(),
            gas_limit: None,
            max_txs_per_cycle: 25,
            tx_timeout: Duration::from_secs(120),
            pending_ttl: Duration::from_secs(900),
            backoff_base: Duration::from_secs(300),
            backoff_max: Duration::from_secs(21600),
            denial_backoff: Duration::from_secs(1800),
            rpc_error_backoff: Duration::from_secs(30),
            jitter: Duration::from_secs(0),
            simulate: true,
            once: false,
            dry_run: false,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = test_cfg();

        assert_eq!(
            compute_backoff_seconds(&cfg, FailureKind::MinedRevert, 1, 0),
            300
        );
        assert_eq!(
            compute_backoff_seconds(&cfg, FailureKind::MinedRevert, 2, 0),
            600
        );
        // Deep failure counts saturate at the cap instead of overflowing.
        assert_eq!(
            compute_backoff_seconds(&cfg, FailureKind::MinedRevert, 64, 0),
            21600
        );
    }

    #[test]
    fn backoff_base_depends_on_failure_kind() {
        let cfg = test_cfg();

        assert_eq!(
            compute_backoff_seconds(&cfg, FailureKind::RpcError, 1, 0),
            30
        );
        assert_eq!(
            compute_backoff_seconds(&cfg, FailureKind::BudgetExceeded, 1, 0),
            1800
        );
        assert_eq!(
            compute_backoff_seconds(&cfg, FailureKind::NotExecutor, 1, 0),
            1800
        );
    }

    #[test]
    fn jitter_is_deterministic_per_request() {
        let mut cfg = test_cfg();
        cfg.jitter = Duration::from_secs(30);

        let a = compute_backoff_seconds(&cfg, FailureKind::RpcError, 1, 7);
        let b = compute_backoff_seconds(&cfg, FailureKind::RpcError, 1, 7);
        assert_eq!(a, b);
        assert_eq!(a, 30 + 7 % 30);
    }
}
