use ethers::providers::Middleware;
use ethers::types::H256;
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    RpcError,
    NotExecutor,
    NoRuleConfigured,
    WindowNotStarted,
    RecipientNotAllowed,
    BudgetExceeded,
    InsufficientVaultBalance,
    SimulationRevert,
    MinedRevert,
    Unknown,
}

impl Default for FailureKind {
    fn default() -> Self {
        FailureKind::Unknown
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryInfo {
    pub consecutive_failures: u32,
    pub next_retry_at: u64,
    #[serde(default)]
    pub last_failure_kind: FailureKind,
    #[serde(default)]
    pub last_failure_reason: Option<String>,
}

impl Default for RetryInfo {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            next_retry_at: 0,
            last_failure_kind: FailureKind::Unknown,
            last_failure_reason: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightTx {
    pub tx_hash: String,
    pub sent_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorState {
    /// Request ids that have been spent successfully (never re-submitted).
    /// Stored as a sorted list for deterministic diffs.
    pub completed_ids: Vec<u64>,

    /// In-flight executeSpend() txs keyed by request id.
    ///
    /// This prevents duplicate spends while a previous tx is still pending.
    #[serde(default)]
    pub in_flight: BTreeMap<u64, InFlightTx>,

    /// Per-request retry/backoff state.
    ///
    /// If executeSpend() would revert (rule denial, insufficient vault
    /// balance, RPC errors, etc.), we back off to avoid repeatedly wasting
    /// gas or hammering RPCs.
    #[serde(default)]
    pub retries: BTreeMap<u64, RetryInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub cleared: usize,
    pub finalized_success: Vec<u64>,
    pub finalized_revert: Vec<u64>,
}

impl ExecutorState {
    pub fn load_or_init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let raw = fs::read_to_string(path)
                .map_err(|e| eyre!("failed to read state file {}: {e}", path.display()))?;
            let st: ExecutorState = serde_json::from_str(&raw)
                .map_err(|e| eyre!("failed to parse state file {}: {e}", path.display()))?;
            return Ok(st);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create state directory {}: {e}", parent.display()))?;
        }

        let init = ExecutorState {
            completed_ids: Vec::new(),
            in_flight: BTreeMap::new(),
            retries: BTreeMap::new(),
        };
        init.save(path)?;
        Ok(init)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create state directory {}: {e}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| eyre!("failed to serialize executor state: {e}"))?;

        // Atomic-ish write: write to a temp file then rename.
        // This reduces the chance of a corrupted state file if the process is interrupted.
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(|e| {
            eyre!(
                "failed to write temp state file {}: {e}",
                tmp_path.display()
            )
        })?;

        // Atomic-ish replace:
        // - On Unix, rename replaces the destination if it exists.
        // - On Windows, rename fails if the destination exists; in that case we remove then rename.
        if let Err(err) = fs::rename(&tmp_path, path) {
            if cfg!(windows) {
                let _ = fs::remove_file(path);
                fs::rename(&tmp_path, path)
                    .map_err(|e| eyre!("failed to replace state file {}: {e}", path.display()))?;
            } else {
                return Err(eyre!(
                    "failed to replace state file {}: {err}",
                    path.display()
                ));
            }
        }
        Ok(())
    }

    pub fn completed_set(&self) -> BTreeSet<u64> {
        self.completed_ids.iter().copied().collect()
    }

    pub fn mark_in_flight(&mut self, request_id: u64, tx_hash: H256) {
        let now = now_unix();
        self.in_flight.insert(
            request_id,
            InFlightTx {
                tx_hash: format!("{:#x}", tx_hash),
                sent_at: now,
            },
        );
    }

    pub fn should_skip_due_to_backoff(&self, request_id: u64, now: u64) -> bool {
        self.retries
            .get(&request_id)
            .map(|r| now < r.next_retry_at)
            .unwrap_or(false)
    }

    pub fn note_success(&mut self, request_id: u64) {
        // On success, record completion and clear any previous backoff.
        if !self.completed_ids.contains(&request_id) {
            self.completed_ids.push(request_id);
            self.completed_ids.sort_unstable();
        }
        self.retries.remove(&request_id);
    }

    pub fn note_failure(
        &mut self,
        request_id: u64,
        kind: FailureKind,
        next_retry_at: u64,
        reason: Option<String>,
    ) {
        let entry = self.retries.entry(request_id).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.next_retry_at = next_retry_at;
        entry.last_failure_kind = kind;
        // Keep the reason small to avoid bloating state.
        entry.last_failure_reason = reason.map(|s| {
            const MAX: usize = 240;
            // Avoid slicing by bytes (can panic on non-UTF8-boundary indices).
            let mut out: String = s.chars().take(MAX).collect();
            if out.len() < s.len() {
                out.push_str("...");
            }
            out
        });
    }

    pub async fn reconcile_in_flight<M: Middleware>(
        &mut self,
        client: &M,
        ttl: Duration,
    ) -> Result<ReconcileOutcome> {
        if self.in_flight.is_empty() {
            return Ok(ReconcileOutcome::default());
        }

        let now = now_unix();
        let ttl_s = ttl.as_secs();

        let mut kept = BTreeMap::new();
        let mut cleared = 0usize;
        let mut finalized_success = Vec::<u64>::new();
        let mut finalized_revert = Vec::<u64>::new();

        for (request_id, inflight) in self.in_flight.iter() {
            // Drop very old pending txs so the executor can retry.
            if ttl_s > 0 && now.saturating_sub(inflight.sent_at) > ttl_s {
                tracing::warn!(
                    request_id = *request_id,
                    tx = %inflight.tx_hash,
                    age_s = now.saturating_sub(inflight.sent_at),
                    ttl_s,
                    "in-flight tx expired; dropping"
                );
                cleared += 1;
                continue;
            }

            let tx_hash = match H256::from_str(&inflight.tx_hash) {
                Ok(h) => h,
                Err(_) => {
                    tracing::warn!(
                        request_id = *request_id,
                        tx = %inflight.tx_hash,
                        "invalid tx hash in state; dropping"
                    );
                    cleared += 1;
                    continue;
                }
            };

            match client.get_transaction_receipt(tx_hash).await {
                Ok(Some(rcpt)) => {
                    let status = rcpt.status.unwrap_or_default().as_u64();
                    tracing::info!(
                        request_id = *request_id,
                        tx = %inflight.tx_hash,
                        status,
                        block = rcpt.block_number.map(|b| b.as_u64()),
                        "in-flight tx finalized; clearing"
                    );
                    if status == 1 {
                        finalized_success.push(*request_id);
                    } else {
                        finalized_revert.push(*request_id);
                    }
                    cleared += 1;
                }
                Ok(None) => {
                    kept.insert(*request_id, inflight.clone());
                }
                Err(err) => {
                    tracing::warn!(
                        request_id = *request_id,
                        tx = %inflight.tx_hash,
                        error = %err,
                        "failed to fetch receipt for in-flight tx; keeping"
                    );
                    kept.insert(*request_id, inflight.clone());
                }
            }
        }

        self.in_flight = kept;
        Ok(ReconcileOutcome {
            cleared,
            finalized_success,
            finalized_revert,
        })
    }
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_skip_honours_next_retry_at() {
        let mut st = ExecutorState {
            completed_ids: vec![],
            in_flight: BTreeMap::new(),
            retries: BTreeMap::new(),
        };
        st.note_failure(7, FailureKind::BudgetExceeded, 1000, None);

        assert!(st.should_skip_due_to_backoff(7, 999));
        assert!(!st.should_skip_due_to_backoff(7, 1000));
        assert!(!st.should_skip_due_to_backoff(8, 0));
    }

    #[test]
    fn success_records_completion_once_and_clears_backoff() {
        let mut st = ExecutorState {
            completed_ids: vec![],
            in_flight: BTreeMap::new(),
            retries: BTreeMap::new(),
        };
        st.note_failure(3, FailureKind::RpcError, 50, Some("boom".into()));
        st.note_success(3);
        st.note_success(3);

        assert_eq!(st.completed_ids, vec![3]);
        assert!(st.retries.is_empty());
    }

    #[test]
    fn failure_reason_is_truncated() {
        let mut st = ExecutorState {
            completed_ids: vec![],
            in_flight: BTreeMap::new(),
            retries: BTreeMap::new(),
        };
        st.note_failure(1, FailureKind::Unknown, 0, Some("x".repeat(1000)));
        let reason = st.retries[&1].last_failure_reason.clone().unwrap();
        assert!(reason.len() <= 243);
        assert!(reason.ends_with("..."));
    }
}
