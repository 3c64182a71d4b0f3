use crate::messages::{ContainerResult, OffchainJobMessage};
use crate::task::{AsyncTask, Shutdown};
use async_trait::async_trait;
use eyre::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Off-chain jobs sit in the pending index at most this long; a job that
/// neither succeeded nor failed by then is presumed lost.
const PENDING_JOB_TTL: Duration = Duration::from_secs(15 * 60);

/// Sweep cadence for expired pending entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
}

/// A job as reported to clients: terminal result plus, on request, the
/// intermediate per-container results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub status: JobStatus,
    pub intermediate_results: Vec<ContainerResult>,
    pub result: Option<ContainerResult>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub success: u64,
    pub failed: u64,
}

#[derive(Debug)]
struct PendingEntry {
    record: JobRecord,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct StoreInner {
    pending: HashMap<String, PendingEntry>,
    completed: HashMap<String, JobRecord>,
    offchain_counts: StatusCounts,
    onchain_counts: StatusCounts,
    container_counts: HashMap<String, StatusCounts>,
    onchain_pending: u64,
}

/// Process-local job store: a TTL'd pending index, a completed index kept
/// for the life of the process, and pop-counters for the stats forwarder.
///
/// On-chain jobs have no client-visible record; they only move the
/// on-chain pending gauge and the counters.
#[derive(Debug, Clone)]
pub struct DataStore {
    inner: Arc<RwLock<StoreInner>>,
    ttl: Duration,
}

impl DataStore {
    pub fn new() -> Self {
        Self::with_ttl(PENDING_JOB_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner::default())),
            ttl,
        }
    }

    /// Marks a job running. Off-chain jobs get a pending record with TTL;
    /// on-chain jobs only bump the pending gauge.
    pub async fn set_running(&self, message: Option<&OffchainJobMessage>) {
        let mut inner = self.inner.write().await;
        match message {
            Some(m) => {
                let key = m.job_key();
                inner.pending.insert(
                    key.clone(),
                    PendingEntry {
                        record: JobRecord {
                            id: m.id.clone(),
                            status: JobStatus::Running,
                            intermediate_results: Vec::new(),
                            result: None,
                        },
                        expires_at: Instant::now() + self.ttl,
                    },
                );
            }
            None => inner.onchain_pending += 1,
        }
    }

    pub async fn set_success(
        &self,
        message: Option<&OffchainJobMessage>,
        results: Vec<ContainerResult>,
    ) {
        self.finalize(message, results, JobStatus::Success).await;
    }

    pub async fn set_failed(
        &self,
        message: Option<&OffchainJobMessage>,
        results: Vec<ContainerResult>,
    ) {
        self.finalize(message, results, JobStatus::Failed).await;
    }

    async fn finalize(
        &self,
        message: Option<&OffchainJobMessage>,
        mut results: Vec<ContainerResult>,
        status: JobStatus,
    ) {
        let mut inner = self.inner.write().await;

        for result in &results {
            let counts = inner
                .container_counts
                .entry(result.container().to_string())
                .or_default();
            match status {
                JobStatus::Success => counts.success += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Running => {}
            }
        }

        let counts = match message {
            Some(_) => &mut inner.offchain_counts,
            None => &mut inner.onchain_counts,
        };
        match status {
            JobStatus::Success => counts.success += 1,
            JobStatus::Failed => counts.failed += 1,
            JobStatus::Running => {}
        }

        match message {
            Some(m) => {
                let key = m.job_key();
                inner.pending.remove(&key);
                let result = results.pop();
                inner.completed.insert(
                    key,
                    JobRecord {
                        id: m.id.clone(),
                        status,
                        intermediate_results: results,
                        result,
                    },
                );
            }
            None => inner.onchain_pending = inner.onchain_pending.saturating_sub(1),
        }
    }

    /// Fetches records for the given `{ip}:{id}` keys from completed ∪
    /// pending, optionally including intermediate results.
    pub async fn get(&self, keys: &[String], intermediate: bool) -> Vec<JobRecord> {
        let now = Instant::now();
        let inner = self.inner.read().await;
        keys.iter()
            .filter_map(|key| {
                inner.completed.get(key).cloned().or_else(|| {
                    inner
                        .pending
                        .get(key)
                        .filter(|entry| entry.expires_at > now)
                        .map(|entry| entry.record.clone())
                })
            })
            .map(|mut record| {
                if !intermediate {
                    record.intermediate_results.clear();
                }
                record
            })
            .collect()
    }

    /// Job ids known for a requester IP. `pending` narrows to one index;
    /// `None` unions both.
    pub async fn get_job_ids(&self, ip: &str, pending: Option<bool>) -> Vec<String> {
        let prefix = format!("{ip}:");
        let now = Instant::now();
        let inner = self.inner.read().await;

        let mut ids: Vec<String> = Vec::new();
        if pending != Some(false) {
            ids.extend(
                inner
                    .pending
                    .iter()
                    .filter(|(key, entry)| key.starts_with(&prefix) && entry.expires_at > now)
                    .map(|(_, entry)| entry.record.id.clone()),
            );
        }
        if pending != Some(true) {
            ids.extend(
                inner
                    .completed
                    .iter()
                    .filter(|(key, _)| key.starts_with(&prefix))
                    .map(|(_, record)| record.id.clone()),
            );
        }
        ids.sort();
        ids.dedup();
        ids
    }

    /// Read-and-reset job counters: `(offchain, onchain)`.
    pub async fn pop_job_counters(&self) -> (StatusCounts, StatusCounts) {
        let mut inner = self.inner.write().await;
        (
            std::mem::take(&mut inner.offchain_counts),
            std::mem::take(&mut inner.onchain_counts),
        )
    }

    /// Read-and-reset per-container counters.
    pub async fn pop_container_counters(&self) -> HashMap<String, StatusCounts> {
        let mut inner = self.inner.write().await;
        std::mem::take(&mut inner.container_counts)
    }

    /// Current number of on-chain jobs between `set_running` and a terminal
    /// state.
    pub async fn onchain_pending(&self) -> u64 {
        self.inner.read().await.onchain_pending
    }

    /// Drops expired pending entries. Reads already ignore them; this
    /// reclaims the memory.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let before = inner.pending.len();
        inner.pending.retain(|_, entry| entry.expires_at > now);
        let dropped = before - inner.pending.len();
        if dropped > 0 {
            tracing::debug!(dropped, "swept expired pending jobs");
        }
        dropped
    }
}

/// Background sweeper keeping the pending index bounded.
pub struct StoreSweeper {
    store: DataStore,
    shutdown: Shutdown,
}

impl StoreSweeper {
    pub fn new(store: DataStore, shutdown: Shutdown) -> Self {
        Self { store, shutdown }
    }
}

#[async_trait]
impl AsyncTask for StoreSweeper {
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn run_forever(&self) -> Result<()> {
        while !self.shutdown.is_stopped() {
            self.store.sweep_expired().await;
            self.shutdown.sleep(SWEEP_INTERVAL).await;
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Cadence of the periodic throughput report.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Drains the pop-counters on an interval and reports job throughput.
pub struct StatsReporter {
    store: DataStore,
    shutdown: Shutdown,
}

impl StatsReporter {
    pub fn new(store: DataStore, shutdown: Shutdown) -> Self {
        Self { store, shutdown }
    }
}

#[async_trait]
impl AsyncTask for StatsReporter {
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn run_forever(&self) -> Result<()> {
        while !self.shutdown.is_stopped() {
            self.shutdown.sleep(STATS_INTERVAL).await;
            if self.shutdown.is_stopped() {
                break;
            }

            let (offchain, onchain) = self.store.pop_job_counters().await;
            let containers = self.store.pop_container_counters().await;
            let pending = self.store.onchain_pending().await;
            if offchain != StatusCounts::default()
                || onchain != StatusCounts::default()
                || !containers.is_empty()
                || pending > 0
            {
                tracing::info!(
                    offchain_success = offchain.success,
                    offchain_failed = offchain.failed,
                    onchain_success = onchain.success,
                    onchain_failed = onchain.failed,
                    onchain_pending = pending,
                    containers = ?containers,
                    "job throughput"
                );
            }
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}
