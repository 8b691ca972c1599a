use crate::erc20::Erc20;
use crate::requests::SpendRequest;
use crate::state::{now_unix, FailureKind};
use crate::vault::{self, ClientAgentVault};
use ethers::providers::Middleware;
use ethers::types::{Address, U256, U64};
use eyre::Result;
use paypai_vault::{RuleLedger, SpendDenied};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PendingTx {
    pub request_id: u64,
    pub tx_hash: ethers::types::H256,
}

#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub request_id: u64,
    pub kind: FailureKind,
    pub reason: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct SpendOutcome {
    pub stats: SpendStats,
    /// Transactions that were sent but did not produce a receipt within the configured timeout.
    /// These should be tracked as "in-flight" to avoid duplicate spends.
    pub pending: Vec<PendingTx>,

    /// Requests that were successfully executed this cycle.
    pub successes: Vec<u64>,

    /// Failures that should be backoff-tracked by the caller.
    pub failures: Vec<FailureRecord>,
}

#[derive(Debug, Default, Clone)]
#[allow(dead_code)]
pub struct SpendStats {
    pub checked: usize,
    pub allowed: usize,
    pub sent: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub precheck_failed: usize,
    pub throttled: usize,
    pub pending: usize,
}

/// Per-vault context fetched once per cycle: the settlement token plus a
/// local mirror of the on-chain rules.
///
/// The mirror exists for one reason: two requests against the same vault in
/// the same cycle. The chain's `checkSpendAllowed` cannot see the first
/// spend until it mines, so the window budget is also accounted locally and
/// both gates must pass.
struct VaultCycleCtx {
    token: Address,
    ledger: RuleLedger,
}

fn denial_failure_kind(denied: &SpendDenied) -> FailureKind {
    match denied {
        SpendDenied::NoRuleConfigured { .. } => FailureKind::NoRuleConfigured,
        SpendDenied::WindowNotStarted { .. } => FailureKind::WindowNotStarted,
        SpendDenied::RecipientNotAllowed { .. } => FailureKind::RecipientNotAllowed,
        SpendDenied::BudgetExceeded { .. } => FailureKind::BudgetExceeded,
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn execute_spends<M: Middleware + 'static>(
    client: Arc<M>,
    executor: Address,
    requests: Vec<SpendRequest>,
    max_concurrency: usize,
    gas_limit: Option<u64>,
    max_txs_per_cycle: usize,
    tx_timeout: Duration,
    simulate: bool,
    dry_run: bool,
) -> Result<SpendOutcome> {
    use futures::stream;
    use futures::StreamExt;

    let stats = Arc::new(AtomicStats::default());

    // Safety valve: cap tx submissions per cycle.
    //
    // IMPORTANT: this is a *total submissions* cap, not just a concurrency cap.
    // We intentionally do not "release" budget after a tx completes.
    let remaining_budget = Arc::new(AtomicUsize::new(max_txs_per_cycle));

    let pending_out = Arc::new(tokio::sync::Mutex::new(Vec::<PendingTx>::new()));
    let successes_out = Arc::new(tokio::sync::Mutex::new(Vec::<u64>::new()));
    let failures_out = Arc::new(tokio::sync::Mutex::new(Vec::<FailureRecord>::new()));

    // Shared per-cycle vault contexts (settlement token + rule mirror).
    let vault_ctxs = Arc::new(tokio::sync::Mutex::new(
        HashMap::<Address, Arc<tokio::sync::Mutex<VaultCycleCtx>>>::new(),
    ));

    stream::iter(requests)
        .for_each_concurrent(max_concurrency, |req| {
            let client = client.clone();
            let stats = stats.clone();
            let remaining_budget = remaining_budget.clone();
            let pending_out = pending_out.clone();
            let successes_out = successes_out.clone();
            let failures_out = failures_out.clone();
            let vault_ctxs = vault_ctxs.clone();
            async move {
                stats.checked.fetch_add(1, Ordering::Relaxed);

                let id = req.id;
                let vault_c = ClientAgentVault::new(req.vault, client.clone());

                // 1) Authorization precheck: this executor must be enabled on the vault.
                match vault_c.is_executor(executor).call().await {
                    Ok(true) => {}
                    Ok(false) => {
                        stats.precheck_failed.fetch_add(1, Ordering::Relaxed);
                        failures_out.lock().await.push(FailureRecord {
                            request_id: id,
                            kind: FailureKind::NotExecutor,
                            reason: Some(format!("{executor:?} is not an executor on {:?}", req.vault)),
                        });
                        tracing::info!(request_id = id, vault = ?req.vault, "not an authorized executor; backing off");
                        return;
                    }
                    Err(err) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        failures_out.lock().await.push(FailureRecord {
                            request_id: id,
                            kind: FailureKind::RpcError,
                            reason: Some(err.to_string()),
                        });
                        tracing::warn!(request_id = id, error = %err, "isExecutor call failed");
                        return;
                    }
                }

                // 2) Per-vault cycle context: settlement token + rule mirror.
                let ctx = {
                    let mut map = vault_ctxs.lock().await;
                    match map.get(&req.vault) {
                        Some(ctx) => ctx.clone(),
                        None => {
                            let token = match vault_c.settlement_token().call().await {
                                Ok(t) => t,
                                Err(err) => {
                                    stats.failed.fetch_add(1, Ordering::Relaxed);
                                    failures_out.lock().await.push(FailureRecord {
                                        request_id: id,
                                        kind: FailureKind::RpcError,
                                        reason: Some(err.to_string()),
                                    });
                                    tracing::warn!(request_id = id, error = %err, "settlementToken call failed");
                                    return;
                                }
                            };
                            let rules = match vault::get_spending_rules(client.clone(), req.vault).await {
                                Ok(r) => r,
                                Err(err) => {
                                    stats.failed.fetch_add(1, Ordering::Relaxed);
                                    failures_out.lock().await.push(FailureRecord {
                                        request_id: id,
                                        kind: FailureKind::RpcError,
                                        reason: Some(err.to_string()),
                                    });
                                    tracing::warn!(request_id = id, error = %err, "getSpendingRules failed");
                                    return;
                                }
                            };
                            let mut ledger = RuleLedger::new();
                            if let Err(err) = ledger.configure_rules(rules) {
                                stats.precheck_failed.fetch_add(1, Ordering::Relaxed);
                                failures_out.lock().await.push(FailureRecord {
                                    request_id: id,
                                    kind: FailureKind::Unknown,
                                    reason: Some(format!("on-chain rule set failed validation: {err}")),
                                });
                                tracing::warn!(request_id = id, vault = ?req.vault, error = %err, "rule mirror rejected on-chain rules");
                                return;
                            }
                            let ctx = Arc::new(tokio::sync::Mutex::new(VaultCycleCtx { token, ledger }));
                            map.insert(req.vault, ctx.clone());
                            ctx
                        }
                    }
                };

                // 3) Local rule gate (window accounting mirror).
                let token = {
                    let ctx = ctx.lock().await;
                    let now = now_unix();
                    if let Err(denied) =
                        ctx.ledger.evaluate_spend(ctx.token, req.amount, req.recipient, now)
                    {
                        stats.precheck_failed.fetch_add(1, Ordering::Relaxed);
                        failures_out.lock().await.push(FailureRecord {
                            request_id: id,
                            kind: denial_failure_kind(&denied),
                            reason: Some(denied.to_string()),
                        });
                        tracing::info!(request_id = id, vault = ?req.vault, %denied, "spend denied by rule mirror; backing off");
                        return;
                    }
                    ctx.token
                };

                // 4) Authoritative on-chain rule gate.
                match vault_c.check_spend_allowed(req.amount, req.recipient).call().await {
                    Ok(true) => {}
                    Ok(false) => {
                        stats.precheck_failed.fetch_add(1, Ordering::Relaxed);
                        failures_out.lock().await.push(FailureRecord {
                            request_id: id,
                            kind: FailureKind::Unknown,
                            reason: Some("vault denied spend (checkSpendAllowed=false)".to_string()),
                        });
                        tracing::info!(request_id = id, vault = ?req.vault, "checkSpendAllowed=false; backing off");
                        return;
                    }
                    Err(err) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        failures_out.lock().await.push(FailureRecord {
                            request_id: id,
                            kind: FailureKind::RpcError,
                            reason: Some(err.to_string()),
                        });
                        tracing::warn!(request_id = id, error = %err, "checkSpendAllowed call failed");
                        return;
                    }
                }

                stats.allowed.fetch_add(1, Ordering::Relaxed);

                // 5) Vault balance precheck: executeSpend transfers out of the
                // vault, so a short balance means a guaranteed revert.
                let erc20 = Erc20::new(token, client.clone());
                let balance = match erc20.balance_of(req.vault).call().await {
                    Ok(v) => v,
                    Err(err) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        failures_out.lock().await.push(FailureRecord {
                            request_id: id,
                            kind: FailureKind::RpcError,
                            reason: Some(err.to_string()),
                        });
                        tracing::warn!(request_id = id, error = %err, "balanceOf() call failed");
                        return;
                    }
                };

                if balance < req.amount {
                    stats.precheck_failed.fetch_add(1, Ordering::Relaxed);
                    failures_out.lock().await.push(FailureRecord {
                        request_id: id,
                        kind: FailureKind::InsufficientVaultBalance,
                        reason: Some(format!("vault balance {} < amount {}", balance, req.amount)),
                    });
                    tracing::info!(request_id = id, balance = %balance, amount = %req.amount, "insufficient vault balance; backing off");
                    return;
                }

                if dry_run {
                    tracing::info!(
                        request_id = id,
                        vault = ?req.vault,
                        amount = %req.amount,
                        recipient = ?req.recipient,
                        note = req.note.as_deref().unwrap_or(""),
                        "DRY RUN: would call executeSpend()"
                    );
                    return;
                }

                // Quick check: if the per-cycle tx budget is already exhausted, skip early.
                // (We still enforce the budget atomically right before sending.)
                if remaining_budget.load(Ordering::Relaxed) == 0 {
                    stats.throttled.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(request_id = id, "tx budget exhausted; skipping spend this cycle");
                    return;
                }

                if simulate {
                    // Final guardrail: simulate executeSpend() via eth_call.
                    // This avoids spending gas on transactions that would revert.
                    if let Err(err) = vault_c.execute_spend(req.amount, req.recipient).call().await {
                        stats.precheck_failed.fetch_add(1, Ordering::Relaxed);
                        failures_out.lock().await.push(FailureRecord {
                            request_id: id,
                            kind: FailureKind::SimulationRevert,
                            reason: Some(err.to_string()),
                        });
                        tracing::warn!(request_id = id, error = %err, "executeSpend() simulation reverted; backing off");
                        return;
                    }
                }

                // Enforce per-cycle tx cap (total submissions).
                // Failed sends still count against the budget; this is a safety feature.
                let budget_ok = remaining_budget
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                        if cur == 0 {
                            None
                        } else {
                            Some(cur - 1)
                        }
                    })
                    .is_ok();

                if !budget_ok {
                    stats.throttled.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(request_id = id, "tx budget exhausted; skipping spend this cycle");
                    return;
                }

                // Reserve the amount in the local mirror so a second request
                // against the same vault in this cycle sees the reduced
                // window budget. The mirror is per-cycle; an ultimately
                // failed send just leaves a conservative reservation behind.
                {
                    let mut ctx = ctx.lock().await;
                    let token = ctx.token;
                    if let Err(denied) =
                        ctx.ledger.record_spend(token, req.amount, req.recipient, now_unix())
                    {
                        stats.precheck_failed.fetch_add(1, Ordering::Relaxed);
                        failures_out.lock().await.push(FailureRecord {
                            request_id: id,
                            kind: denial_failure_kind(&denied),
                            reason: Some(denied.to_string()),
                        });
                        tracing::info!(request_id = id, %denied, "spend lost the window budget to a concurrent request; backing off");
                        return;
                    }
                }

                // Build executeSpend tx.
                let mut call = vault_c.execute_spend(req.amount, req.recipient);
                if let Some(gl) = gas_limit {
                    call = call.gas(U256::from(gl));
                }

                // Send.
                let pending = match call.send().await {
                    Ok(p) => p,
                    Err(err) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(request_id = id, error = %err, "executeSpend send failed");
                        failures_out.lock().await.push(FailureRecord {
                            request_id: id,
                            kind: FailureKind::RpcError,
                            reason: Some(err.to_string()),
                        });
                        return;
                    }
                };

                stats.sent.fetch_add(1, Ordering::Relaxed);

                let tx_hash = pending.tx_hash();

                // Wait for receipt.
                let receipt_res = tokio::time::timeout(tx_timeout, pending).await;

                match receipt_res {
                    Ok(Ok(Some(rcpt))) => {
                        let ok = rcpt.status == Some(U64::from(1));
                        if ok {
                            stats.succeeded.fetch_add(1, Ordering::Relaxed);
                            tracing::info!(request_id = id, tx = ?tx_hash, "executeSpend succeeded");
                            successes_out.lock().await.push(id);
                        } else {
                            stats.failed.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(request_id = id, tx = ?tx_hash, "executeSpend mined but reverted");
                            failures_out.lock().await.push(FailureRecord {
                                request_id: id,
                                kind: FailureKind::MinedRevert,
                                reason: Some("mined but reverted".to_string()),
                            });
                        }
                    }
                    Ok(Ok(None)) => {
                        // Uncommon: provider returned no receipt.
                        stats.pending.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(request_id = id, tx = ?tx_hash, "executeSpend sent but receipt not available yet; tracking as in-flight");
                        pending_out.lock().await.push(PendingTx { request_id: id, tx_hash });
                    }
                    Ok(Err(err)) => {
                        // We successfully submitted the tx, but failed while waiting for the receipt.
                        // Conservatively treat as "pending" and track it as in-flight to avoid duplicate spends.
                        stats.pending.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(request_id = id, tx = ?tx_hash, error = %err, "executeSpend receipt error; tracking as in-flight");
                        pending_out.lock().await.push(PendingTx { request_id: id, tx_hash });
                    }
                    Err(_) => {
                        // Timed out waiting for receipt; treat as pending.
                        stats.pending.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(request_id = id, tx = ?tx_hash, timeout_s = tx_timeout.as_secs(), "executeSpend still pending after timeout; tracking as in-flight");
                        pending_out.lock().await.push(PendingTx { request_id: id, tx_hash });
                    }
                }
            }
        })
        .await;

    let pending = pending_out.lock().await.clone();
    let successes = successes_out.lock().await.clone();
    let failures = failures_out.lock().await.clone();
    Ok(SpendOutcome {
        stats: stats.into_spend_stats(),
        pending,
        successes,
        failures,
    })
}

#[derive(Debug, Default)]
struct AtomicStats {
    checked: AtomicUsize,
    allowed: AtomicUsize,
    sent: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    precheck_failed: AtomicUsize,
    throttled: AtomicUsize,
    pending: AtomicUsize,
}

impl AtomicStats {
    fn into_spend_stats(self: Arc<Self>) -> SpendStats {
        SpendStats {
            checked: self.checked.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            precheck_failed: self.precheck_failed.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }
}
