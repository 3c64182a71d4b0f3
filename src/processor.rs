use crate::chain::ChainClient;
use crate::container_lookup::ContainerLookup;
use crate::errors::InfernetError;
use crate::messages::{
    ContainerResult, CoordinatorSignatureParams, DelegatedSubscriptionMessage, JobInput,
    JobLocation, NodeMessage,
};
use crate::orchestrator::PipelineRunner;
use crate::subscription::{now_unix, Subscription, UnionId};
use crate::task::{AsyncTask, Shutdown};
use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address, Bytes, H256};
use eyre::{eyre, Result};
use futures::{stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Delivery attempts per `(id, interval)` before the tuple is abandoned.
const MAX_DELIVERY_ATTEMPTS: u8 = 3;

/// Simulation retry profile for `deliver`.
const SIMULATION_RETRIES: u32 = 3;
const SIMULATION_RETRY_SLEEP: Duration = Duration::from_millis(500);

/// Receipt polling profile for the pending-tx pruner.
const RECEIPT_POLL_RETRIES: u32 = 10;
const RECEIPT_POLL_SLEEP: Duration = Duration::from_millis(200);

/// Tracked tuples processed concurrently per tick.
const MAX_CONCURRENT_ITEMS: usize = 10;

/// A delivery slot. `Blocked` reserves the slot while the pipeline runs or
/// after a failed attempt; `Submitted` carries the live tx hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingTx {
    Blocked,
    Submitted(H256),
}

#[derive(Debug, Clone)]
struct DelegateEntry {
    sub: Subscription,
    signature: CoordinatorSignatureParams,
    data: Value,
}

#[derive(Debug, Default)]
struct ProcessorState {
    subscriptions: HashMap<u32, Subscription>,
    delegate_subscriptions: HashMap<(Address, u32), DelegateEntry>,
    pending: HashMap<(UnionId, u32), PendingTx>,
    attempts: HashMap<(UnionId, u32), u8>,
}

enum WorkItem {
    Onchain { id: u32, sub: Subscription },
    Delegated { owner: Address, nonce: u32, entry: DelegateEntry },
}

/// The stateful scheduler: tracks regular and delegated subscriptions,
/// gates each `(id, interval)` tuple through eligibility checks, runs the
/// container pipeline, submits delivery transactions, and prunes pending
/// hashes against on-chain receipts.
///
/// The single state mutex guards all four tracking maps; it is never held
/// across RPC or container calls. The tick and the pruner run back to back
/// on one loop, so a tuple is never processed and pruned concurrently.
pub struct ChainProcessor<C> {
    chain: Arc<C>,
    runner: Arc<dyn PipelineRunner>,
    lookup: Arc<ContainerLookup>,
    state: Mutex<ProcessorState>,
    shutdown: Shutdown,
    tick_period: Duration,
    dry_run: bool,
}

impl<C: ChainClient> ChainProcessor<C> {
    pub fn new(
        chain: Arc<C>,
        runner: Arc<dyn PipelineRunner>,
        lookup: Arc<ContainerLookup>,
        shutdown: Shutdown,
        tick_period: Duration,
        dry_run: bool,
    ) -> Self {
        Self {
            chain,
            runner,
            lookup,
            state: Mutex::new(ProcessorState::default()),
            shutdown,
            tick_period,
            dry_run,
        }
    }

    /// Single dispatch point for everything admitted by the guardian.
    pub async fn track(&self, msg: NodeMessage) -> Result<()> {
        match msg {
            NodeMessage::SubscriptionCreated(sub) => {
                let id = u32::try_from(sub.id)
                    .map_err(|_| eyre!("subscription {} has no on-chain id", sub.id))?;
                if !self.chain.matches_payment_requirements(&sub) {
                    return Ok(());
                }
                let mut state = self.state.lock().await;
                state.subscriptions.insert(id, sub);
                tracing::debug!(subscription_id = id, tracked = state.subscriptions.len(), "tracking subscription");
                Ok(())
            }
            NodeMessage::DelegatedSubscription(msg) => self.track_delegated(*msg).await,
            NodeMessage::OffchainJob(job) => {
                let runner = self.runner.clone();
                tokio::spawn(async move {
                    runner.run_offchain_job(&job).await;
                });
                Ok(())
            }
        }
    }

    async fn track_delegated(&self, msg: DelegatedSubscriptionMessage) -> Result<()> {
        let sub = msg.subscription.deserialize(&self.lookup);
        let sig = msg.signature;

        if u64::from(sig.expiry) < now_unix() {
            return Err(eyre!(
                "delegated subscription from {:?} carries an expired signature",
                sub.owner
            ));
        }
        if sub.containers.is_empty() {
            return Err(eyre!(
                "delegated subscription from {:?} names an unserved container permutation",
                sub.owner
            ));
        }

        let (exists, id) = self
            .chain
            .get_existing_delegate_subscription(&sub, sig.nonce)
            .await?;

        if exists {
            // The numeric-id tracker owns this subscription now; clearing
            // its slots forces re-evaluation on the next tick.
            let onchain = UnionId::Onchain(id);
            let delegated = UnionId::delegated(sub.owner, sig.nonce);
            let mut state = self.state.lock().await;
            state
                .pending
                .retain(|(uid, _), _| *uid != onchain && *uid != delegated);
            state
                .attempts
                .retain(|(uid, _), _| *uid != onchain && *uid != delegated);
            tracing::info!(
                subscription_id = id,
                owner = ?sub.owner,
                nonce = sig.nonce,
                "delegated subscription already created on-chain; cleared delivery slots"
            );
            return Ok(());
        }

        let recovered = self.chain.recover_delegatee_signer(&sub, &sig)?;
        let delegated_signer = self.chain.get_delegated_signer(&sub).await;
        if delegated_signer == Address::zero() || recovered != delegated_signer {
            return Err(eyre!(
                "delegated subscription signer mismatch: recovered {recovered:?}, owner contract expects {delegated_signer:?}"
            ));
        }

        if !self.chain.matches_payment_requirements(&sub) {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        state.delegate_subscriptions.insert(
            (sub.owner, sig.nonce),
            DelegateEntry {
                sub,
                signature: sig,
                data: msg.data,
            },
        );
        Ok(())
    }

    async fn stop_tracking(&self, uid: UnionId, reason: &str) {
        let mut state = self.state.lock().await;
        match uid {
            UnionId::Onchain(id) => {
                state.subscriptions.remove(&id);
            }
            UnionId::Delegated { owner, nonce } => {
                state.delegate_subscriptions.remove(&(owner, nonce));
            }
        }
        state.pending.retain(|(key, _), _| *key != uid);
        state.attempts.retain(|(key, _), _| *key != uid);
        tracing::info!(id = %uid, reason, "stopped tracking subscription");
    }

    /// One full scheduler pass: evaluate every tracked tuple, then prune
    /// pending transactions. Also drives `--once` smoke runs.
    pub async fn process_once(&self) {
        self.tick().await;
        self.prune_pending().await;
    }

    /// One scheduler pass over every tracked tuple.
    async fn tick(&self) {
        let items: Vec<WorkItem> = {
            let state = self.state.lock().await;
            let mut items: Vec<WorkItem> = state
                .subscriptions
                .iter()
                .map(|(id, sub)| WorkItem::Onchain {
                    id: *id,
                    sub: sub.clone(),
                })
                .collect();
            items.extend(state.delegate_subscriptions.iter().map(|((owner, nonce), entry)| {
                WorkItem::Delegated {
                    owner: *owner,
                    nonce: *nonce,
                    entry: entry.clone(),
                }
            }));
            items
        };

        stream::iter(items)
            .for_each_concurrent(MAX_CONCURRENT_ITEMS, |item| async move {
                match item {
                    WorkItem::Onchain { id, sub } => self.process_onchain(id, sub).await,
                    WorkItem::Delegated { owner, nonce, entry } => {
                        self.process_delegated(owner, nonce, entry).await
                    }
                }
            })
            .await;
    }

    async fn process_onchain(&self, id: u32, sub: Subscription) {
        let uid = UnionId::Onchain(id);

        // Gate 1: owner solvency, only when payment is on offer.
        if sub.provides_payment() {
            match self.chain.is_valid_wallet(sub.wallet).await {
                Ok(true) => {}
                Ok(false) => {
                    return self.stop_tracking(uid, "wallet not minted by factory").await;
                }
                Err(err) => {
                    tracing::warn!(subscription_id = id, error = %err, "wallet validity probe failed");
                    return;
                }
            }
            match self
                .chain
                .has_enough_balance(sub.wallet, sub.payment_token, sub.payment_amount)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    return self.stop_tracking(uid, "owner wallet cannot cover payment").await;
                }
                Err(err) => {
                    tracing::warn!(subscription_id = id, error = %err, "balance probe failed");
                    return;
                }
            }
        }

        // Gate 2: cancellation, re-read from chain.
        match self.chain.get_subscription_by_id(id).await {
            Ok(fresh) if fresh.cancelled() => {
                return self.stop_tracking(uid, "cancelled on-chain").await;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(subscription_id = id, error = %err, "subscription re-read failed");
                return;
            }
        }

        // Not yet active: nothing to do this tick.
        if !sub.active() {
            return;
        }
        let Ok(interval) = sub.interval() else { return };

        // Gate 3: completion, against the on-chain response count.
        let count = match self
            .chain
            .get_subscription_response_count(id, interval)
            .await
        {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(subscription_id = id, interval, error = %err, "response count read failed");
                return;
            }
        };
        {
            let mut state = self.state.lock().await;
            let Some(tracked) = state.subscriptions.get_mut(&id) else { return };
            if tracked.set_response_count(interval, count).is_err() {
                return;
            }
            match tracked.completed() {
                Ok(true) => {
                    drop(state);
                    return self.stop_tracking(uid, "completed").await;
                }
                Ok(false) => {}
                Err(_) => return,
            }
        }

        // This node already served the interval; wait for the next one (or
        // for the completion gate above to fire).
        if sub.node_replied(interval) {
            return;
        }
        match self.chain.get_node_has_delivered_response(id, interval).await {
            Ok(true) => {
                let mut state = self.state.lock().await;
                if let Some(tracked) = state.subscriptions.get_mut(&id) {
                    tracked.set_node_replied(interval);
                }
                return;
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(subscription_id = id, interval, error = %err, "delivered-response probe failed");
                return;
            }
        }

        if !self.pass_shared_gates(uid, &sub, interval, None).await {
            return;
        }

        // Reserve the slot before the (long) pipeline run.
        if !self.reserve_slot(uid, interval).await {
            return;
        }

        let inputs = self
            .chain
            .get_container_inputs(&sub, interval, now_unix())
            .await;
        let job_input = JobInput {
            source: JobLocation::Onchain,
            destination: JobLocation::Onchain,
            data: Value::String(format!("0x{}", hex::encode(inputs.as_ref()))),
            requires_proof: sub.requires_proof(),
        };

        self.run_pipeline_and_deliver(uid, &sub, None, interval, job_input)
            .await;
    }

    async fn process_delegated(&self, owner: Address, nonce: u32, entry: DelegateEntry) {
        let uid = UnionId::delegated(owner, nonce);
        let sub = &entry.sub;

        if u64::from(entry.signature.expiry) < now_unix() {
            return self.stop_tracking(uid, "delegated signature expired").await;
        }

        if !sub.active() {
            return;
        }
        let Ok(interval) = sub.interval() else { return };

        if !self
            .pass_shared_gates(uid, sub, interval, Some(&entry.signature))
            .await
        {
            return;
        }

        if !self.reserve_slot(uid, interval).await {
            return;
        }

        let job_input = JobInput {
            source: JobLocation::Onchain,
            destination: JobLocation::Onchain,
            data: entry.data.clone(),
            requires_proof: sub.requires_proof(),
        };

        self.run_pipeline_and_deliver(uid, sub, Some(&entry.signature), interval, job_input)
            .await;
    }

    /// Gates 4–6, shared between regular and delegated tuples. Returns
    /// false when processing must not continue this tick.
    async fn pass_shared_gates(
        &self,
        uid: UnionId,
        sub: &Subscription,
        interval: u32,
        sig: Option<&CoordinatorSignatureParams>,
    ) -> bool {
        // Gate 4: retry budget. Clearing and untracking happen under the
        // same critical section as the read.
        {
            let mut state = self.state.lock().await;
            let exhausted = state
                .attempts
                .get(&(uid, interval))
                .map(|a| *a >= MAX_DELIVERY_ATTEMPTS)
                .unwrap_or(false);
            if exhausted {
                state.attempts.remove(&(uid, interval));
                drop(state);
                self.stop_tracking(uid, "delivery retries exhausted").await;
                return false;
            }
        }

        // Gate 5: deadline.
        if sub.past_last_interval().unwrap_or(false) {
            self.stop_tracking(uid, "past last interval").await;
            return false;
        }

        // A pipeline or tx for this tuple is already in flight; no point
        // simulating again.
        {
            let state = self.state.lock().await;
            if state.pending.contains_key(&(uid, interval)) {
                return false;
            }
        }

        // Gate 6: dry simulation, skipped for proof-bearing subscriptions
        // (an empty proof would always revert).
        if !sub.requires_proof() {
            let empty = Bytes::new();
            let result = match sig {
                Some(sig) => {
                    self.chain
                        .deliver_compute_delegatee(
                            sub,
                            sig,
                            interval,
                            empty.clone(),
                            empty.clone(),
                            empty,
                            true,
                        )
                        .await
                }
                None => {
                    self.chain
                        .deliver_compute(sub, interval, empty.clone(), empty.clone(), empty, true)
                        .await
                }
            };
            if let Err(err) = result {
                if err.downcast_ref::<InfernetError>().is_some() {
                    if sub.is_callback() {
                        self.stop_tracking(uid, "coordinator rejected callback in simulation")
                            .await;
                    }
                } else {
                    tracing::warn!(id = %uid, interval, error = %err, "dry simulation failed");
                }
                return false;
            }
        }

        true
    }

    /// Claims the `(uid, interval)` slot; false when a pipeline or tx for
    /// the tuple is already in flight.
    async fn reserve_slot(&self, uid: UnionId, interval: u32) -> bool {
        let mut state = self.state.lock().await;
        if state.pending.contains_key(&(uid, interval)) {
            return false;
        }
        state.pending.insert((uid, interval), PendingTx::Blocked);
        true
    }

    async fn run_pipeline_and_deliver(
        &self,
        uid: UnionId,
        sub: &Subscription,
        sig: Option<&CoordinatorSignatureParams>,
        interval: u32,
        job_input: JobInput,
    ) {
        let job_id = format!("{uid}-{interval}");
        let results = self
            .runner
            .run_chain_job(&job_id, job_input, &sub.containers, sub.requires_proof())
            .await;

        let serialized = match results.last() {
            Some(ContainerResult::Output { output, .. }) => serialize_container_output(output),
            Some(ContainerResult::Error { container, error }) => {
                tracing::warn!(id = %uid, interval, container = %container, error = %error, "pipeline failed");
                self.record_failure(uid, interval).await;
                return;
            }
            None => {
                tracing::warn!(id = %uid, interval, "pipeline produced no results");
                self.record_failure(uid, interval).await;
                return;
            }
        };

        let (input, output, proof) = match serialized {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::warn!(id = %uid, interval, error = %err, "output serialization failed");
                self.record_failure(uid, interval).await;
                return;
            }
        };

        match self.deliver(sub, sig, interval, input, output, proof).await {
            Ok(tx) => {
                if self.dry_run {
                    tracing::info!(id = %uid, interval, "DRY RUN: delivery simulated only");
                    let mut state = self.state.lock().await;
                    state.pending.remove(&(uid, interval));
                    return;
                }
                let mut state = self.state.lock().await;
                state.pending.insert((uid, interval), PendingTx::Submitted(tx));
                tracing::info!(id = %uid, interval, tx = ?tx, "delivery submitted");
            }
            Err(err) => {
                if let Some(infernet) = err.downcast_ref::<InfernetError>() {
                    if sub.is_callback() {
                        self.stop_tracking(uid, "coordinator rejected callback delivery").await;
                    } else {
                        // Benign for recurring tuples; the next interval
                        // gets a fresh slot.
                        tracing::info!(id = %uid, interval, error = %infernet, "delivery rejected; keeping subscription");
                        let mut state = self.state.lock().await;
                        state.pending.remove(&(uid, interval));
                    }
                } else {
                    tracing::warn!(id = %uid, interval, error = %err, "delivery failed");
                    self.record_failure(uid, interval).await;
                }
            }
        }
    }

    /// Simulates and submits a delivery. Simulation reverts retry up to
    /// three times; a typed Infernet rejection aborts immediately.
    async fn deliver(
        &self,
        sub: &Subscription,
        sig: Option<&CoordinatorSignatureParams>,
        interval: u32,
        input: Bytes,
        output: Bytes,
        proof: Bytes,
    ) -> Result<H256> {
        let simulate_only = self.dry_run;
        let mut attempt = 1;
        loop {
            let result = match sig {
                Some(sig) => {
                    self.chain
                        .deliver_compute_delegatee(
                            sub,
                            sig,
                            interval,
                            input.clone(),
                            output.clone(),
                            proof.clone(),
                            simulate_only,
                        )
                        .await
                }
                None => {
                    self.chain
                        .deliver_compute(
                            sub,
                            interval,
                            input.clone(),
                            output.clone(),
                            proof.clone(),
                            simulate_only,
                        )
                        .await
                }
            };

            match result {
                Ok(tx) => return Ok(tx),
                Err(err) if err.downcast_ref::<InfernetError>().is_some() => return Err(err),
                Err(err) => {
                    if attempt >= SIMULATION_RETRIES {
                        return Err(err);
                    }
                    tracing::warn!(
                        subscription_id = sub.id,
                        interval,
                        attempt,
                        error = %err,
                        "delivery simulation reverted; retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(SIMULATION_RETRY_SLEEP).await;
                }
            }
        }
    }

    /// Records a failed attempt; the slot stays blocked until the pruner
    /// frees it (or the retry gate untracks the tuple).
    async fn record_failure(&self, uid: UnionId, interval: u32) {
        let mut state = self.state.lock().await;
        let attempts = state.attempts.entry((uid, interval)).or_insert(0);
        *attempts = attempts.saturating_add(1).min(MAX_DELIVERY_ATTEMPTS);
        tracing::debug!(id = %uid, interval, attempts = *attempts, "recorded failed delivery attempt");
    }

    /// Confirms, retries or expires pending transactions against on-chain
    /// receipts.
    async fn prune_pending(&self) {
        let snapshot: Vec<((UnionId, u32), PendingTx)> = {
            let state = self.state.lock().await;
            state.pending.iter().map(|(k, v)| (*k, *v)).collect()
        };

        let mut failed: Vec<(UnionId, u32)> = Vec::new();
        for (key, entry) in &snapshot {
            let PendingTx::Submitted(tx) = entry else { continue };
            let (found, success) = self
                .chain
                .get_tx_success_with_retries(*tx, RECEIPT_POLL_RETRIES, RECEIPT_POLL_SLEEP)
                .await;
            if !found {
                continue;
            }
            if success {
                self.confirm_delivery(*key, *tx).await;
            } else {
                tracing::warn!(id = %key.0, interval = key.1, tx = ?tx, "delivery tx mined but reverted");
                failed.push(*key);
            }
        }

        let mut state = self.state.lock().await;
        for key in failed {
            let attempts = {
                let entry = state.attempts.entry(key).or_insert(0);
                *entry = entry.saturating_add(1).min(MAX_DELIVERY_ATTEMPTS);
                *entry
            };
            if attempts < MAX_DELIVERY_ATTEMPTS {
                // Slot becomes re-submittable; the next tick retries.
                state.pending.remove(&key);
            }
            // Otherwise the retry gate untracks the tuple next tick.
        }

        // Blocked slots carrying a recorded failure are also freed for
        // retry; exhausted ones wait for the retry gate.
        let retryable: Vec<(UnionId, u32)> = state
            .pending
            .iter()
            .filter(|(key, entry)| {
                **entry == PendingTx::Blocked
                    && state
                        .attempts
                        .get(*key)
                        .map(|a| *a > 0 && *a < MAX_DELIVERY_ATTEMPTS)
                        .unwrap_or(false)
            })
            .map(|(key, _)| *key)
            .collect();
        for key in retryable {
            state.pending.remove(&key);
        }
    }

    async fn confirm_delivery(&self, key: (UnionId, u32), tx: H256) {
        let (uid, interval) = key;
        let mut state = self.state.lock().await;
        state.pending.remove(&key);
        state.attempts.remove(&key);
        match uid {
            UnionId::Onchain(id) => {
                if let Some(sub) = state.subscriptions.get_mut(&id) {
                    sub.set_node_replied(interval);
                }
            }
            UnionId::Delegated { owner, nonce } => {
                // Done: the off-chain identity is finished; any on-chain id
                // the coordinator assigned is tracked separately.
                state.delegate_subscriptions.remove(&(owner, nonce));
            }
        }
        tracing::info!(id = %uid, interval, tx = ?tx, "delivery confirmed");
    }
}

#[async_trait]
impl<C: ChainClient> AsyncTask for ChainProcessor<C> {
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn run_forever(&self) -> Result<()> {
        while !self.shutdown.is_stopped() {
            self.tick().await;
            self.prune_pending().await;
            self.shutdown.sleep(self.tick_period).await;
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let state = self.state.lock().await;
        tracing::info!(
            subscriptions = state.subscriptions.len(),
            delegated = state.delegate_subscriptions.len(),
            pending = state.pending.len(),
            "processor shut down"
        );
        Ok(())
    }
}

/// Encodes the final container output for on-chain delivery.
///
/// Outputs carrying the full five-field shape are encoded as
/// `(bytes, bytes)` input, `(bytes, bytes)` output and raw proof bytes;
/// anything else is delivered as an ABI string of its JSON form.
pub fn serialize_container_output(output: &Value) -> Result<(Bytes, Bytes, Bytes)> {
    const FIELDS: [&str; 5] = [
        "raw_input",
        "processed_input",
        "raw_output",
        "processed_output",
        "proof",
    ];

    let all_present = output.is_object() && FIELDS.iter().all(|f| output.get(f).is_some());

    if all_present {
        let raw_input = hex_field(output, "raw_input")?;
        let processed_input = hex_field(output, "processed_input")?;
        let raw_output = hex_field(output, "raw_output")?;
        let processed_output = hex_field(output, "processed_output")?;
        let proof = hex_field(output, "proof")?;

        let input = ethers::abi::encode(&[
            Token::Bytes(raw_input),
            Token::Bytes(processed_input),
        ]);
        let output = ethers::abi::encode(&[
            Token::Bytes(raw_output),
            Token::Bytes(processed_output),
        ]);
        return Ok((Bytes::from(input), Bytes::from(output), Bytes::from(proof)));
    }

    let json = serde_json::to_string(output)?;
    let encoded = ethers::abi::encode(&[Token::String(json)]);
    Ok((Bytes::new(), Bytes::from(encoded), Bytes::new()))
}

fn hex_field(output: &Value, key: &str) -> Result<Vec<u8>> {
    let raw = output
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| eyre!("field '{key}' is not a string"))?;
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    if stripped.is_empty() {
        return Ok(Vec::new());
    }
    hex::decode(stripped).map_err(|e| eyre!("field '{key}' is not valid hex: {e}"))
}

#[cfg(test)]
impl<C: ChainClient> ChainProcessor<C> {
    pub(crate) async fn tracked_ids(&self) -> Vec<u32> {
        let state = self.state.lock().await;
        let mut ids: Vec<u32> = state.subscriptions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) async fn tracked_subscription(&self, id: u32) -> Option<Subscription> {
        let state = self.state.lock().await;
        state.subscriptions.get(&id).cloned()
    }

    pub(crate) async fn tracked_delegates(&self) -> Vec<(Address, u32)> {
        let state = self.state.lock().await;
        state.delegate_subscriptions.keys().copied().collect()
    }

    pub(crate) async fn pending_entry(&self, uid: UnionId, interval: u32) -> Option<Option<H256>> {
        let state = self.state.lock().await;
        state.pending.get(&(uid, interval)).map(|entry| match entry {
            PendingTx::Blocked => None,
            PendingTx::Submitted(tx) => Some(*tx),
        })
    }

    pub(crate) async fn attempts_for(&self, uid: UnionId, interval: u32) -> Option<u8> {
        let state = self.state.lock().await;
        state.attempts.get(&(uid, interval)).copied()
    }

    pub(crate) async fn seed_slot(&self, uid: UnionId, interval: u32, tx: Option<H256>) {
        let mut state = self.state.lock().await;
        let entry = match tx {
            Some(tx) => PendingTx::Submitted(tx),
            None => PendingTx::Blocked,
        };
        state.pending.insert((uid, interval), entry);
    }

    pub(crate) async fn seed_attempts(&self, uid: UnionId, interval: u32, attempts: u8) {
        let mut state = self.state.lock().await;
        state.attempts.insert((uid, interval), attempts);
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{DeliverOutcome, MockChain};
    use crate::container_lookup::hash_containers;
    use crate::messages::OffchainJobMessage;
    use crate::subscription::{SerializedSubscription, CANCELLED_SENTINEL};
    use ethers::types::U256;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct MockRunner {
        results: StdMutex<VecDeque<Vec<ContainerResult>>>,
        calls: StdMutex<Vec<String>>,
    }

    impl MockRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                results: StdMutex::new(VecDeque::new()),
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn queue(&self, results: Vec<ContainerResult>) {
            self.results.lock().unwrap().push_back(results);
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PipelineRunner for MockRunner {
        async fn run_chain_job(
            &self,
            job_id: &str,
            _input: JobInput,
            containers: &[String],
            _requires_proof: bool,
        ) -> Vec<ContainerResult> {
            self.calls.lock().unwrap().push(job_id.to_string());
            self.results.lock().unwrap().pop_front().unwrap_or_else(|| {
                vec![ContainerResult::Output {
                    container: containers.last().cloned().unwrap_or_default(),
                    output: json!({"result": "ok"}),
                }]
            })
        }

        async fn run_offchain_job(&self, message: &OffchainJobMessage) -> Vec<ContainerResult> {
            self.calls.lock().unwrap().push(message.job_key());
            Vec::new()
        }
    }

    fn lookup() -> Arc<ContainerLookup> {
        Arc::new(ContainerLookup::new(&["echo".to_string()]))
    }

    fn processor(
        chain: Arc<MockChain>,
        runner: Arc<MockRunner>,
    ) -> ChainProcessor<MockChain> {
        ChainProcessor::new(
            chain,
            runner,
            lookup(),
            Shutdown::new(),
            Duration::from_millis(10),
            false,
        )
    }

    fn sub(id: i64, active_at: u32, period: u32, frequency: u32) -> Subscription {
        Subscription::new(
            id,
            Address::repeat_byte(0x01),
            active_at,
            period,
            frequency,
            1,
            hash_containers(&["echo".to_string()]),
            false,
            Address::zero(),
            U256::zero(),
            Address::zero(),
            Address::repeat_byte(0x02),
            vec!["echo".to_string()],
        )
    }

    fn now() -> u32 {
        now_unix() as u32
    }

    async fn track_sub(p: &ChainProcessor<MockChain>, s: Subscription) {
        p.track(NodeMessage::SubscriptionCreated(s)).await.unwrap();
    }

    #[tokio::test]
    async fn callback_infernet_error_in_simulation_evicts() {
        let chain = Arc::new(MockChain::new());
        let runner = MockRunner::new();
        let p = processor(chain.clone(), runner.clone());

        // one-shot subscription, already active
        let s = sub(6, now() - 5, 0, 1);
        chain.with(|st| {
            st.subs.insert(6, s.clone());
            st.deliver_outcomes
                .push_back(DeliverOutcome::Infernet(InfernetError::NodeRespondedAlready));
        });
        track_sub(&p, s).await;

        p.process_once().await;
        assert!(p.tracked_ids().await.is_empty());
        // no pipeline ran
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn happy_path_submits_then_confirms() {
        let chain = Arc::new(MockChain::new());
        let runner = MockRunner::new();
        let p = processor(chain.clone(), runner.clone());

        let s = sub(1, now() - 5, 600, 5);
        let tx = H256::repeat_byte(0x77);
        chain.with(|st| {
            st.subs.insert(1, s.clone());
            st.deliver_outcomes.push_back(DeliverOutcome::Ok(H256::zero())); // dry gate
            st.deliver_outcomes.push_back(DeliverOutcome::Ok(tx)); // real delivery
        });
        track_sub(&p, s).await;

        p.tick().await;

        let uid = UnionId::Onchain(1);
        assert_eq!(p.pending_entry(uid, 1).await, Some(Some(tx)));
        assert_eq!(runner.calls(), 1);
        let calls = chain.with(|st| st.deliver_calls.clone());
        assert_eq!(calls.len(), 2);
        assert!(calls[0].simulate_only);
        assert!(!calls[1].simulate_only);

        // receipt lands; pruner confirms and clears
        chain.with(|st| {
            st.receipts.insert(tx, (true, true));
        });
        p.prune_pending().await;
        assert_eq!(p.pending_entry(uid, 1).await, None);
        assert_eq!(p.attempts_for(uid, 1).await, None);

        // node_replied now short-circuits the next tick
        chain.with(|st| st.deliver_outcomes.clear());
        p.tick().await;
        assert_eq!(runner.calls(), 1);
        assert_eq!(p.tracked_ids().await, vec![1]);
    }

    #[tokio::test]
    async fn delivered_subscription_completes_and_evicts() {
        let chain = Arc::new(MockChain::new());
        let runner = MockRunner::new();
        let p = processor(chain.clone(), runner.clone());

        // single-interval subscription with a long period
        let s = sub(10, now() - 5, 600, 1);
        let tx = H256::repeat_byte(0x66);
        chain.with(|st| {
            st.subs.insert(10, s.clone());
            st.deliver_outcomes.push_back(DeliverOutcome::Ok(H256::zero()));
            st.deliver_outcomes.push_back(DeliverOutcome::Ok(tx));
        });
        track_sub(&p, s).await;

        chain.with(|st| {
            st.receipts.insert(tx, (true, true));
        });
        p.process_once().await;
        assert_eq!(p.tracked_ids().await, vec![10]);

        // redundancy now visible on-chain; the completion gate evicts
        chain.with(|st| {
            st.response_counts.insert((10, 1), 1);
        });
        p.process_once().await;
        assert!(p.tracked_ids().await.is_empty());
    }

    #[tokio::test]
    async fn reverted_tx_retries_then_gives_up() {
        let chain = Arc::new(MockChain::new());
        let runner = MockRunner::new();
        let p = processor(chain.clone(), runner.clone());

        let s = sub(2, now() - 5, 600, 5);
        chain.with(|st| {
            st.subs.insert(2, s.clone());
        });
        track_sub(&p, s).await;

        let uid = UnionId::Onchain(2);
        for round in 1..=3u8 {
            let tx = H256::repeat_byte(round);
            chain.with(|st| {
                st.deliver_outcomes.push_back(DeliverOutcome::Ok(H256::zero()));
                st.deliver_outcomes.push_back(DeliverOutcome::Ok(tx));
                st.receipts.insert(tx, (true, false));
            });
            p.process_once().await;
            assert_eq!(p.attempts_for(uid, 1).await, Some(round));
        }

        // third failure leaves the slot; the retry gate unhooks the sub
        assert_eq!(p.pending_entry(uid, 1).await, Some(Some(H256::repeat_byte(3))));
        p.tick().await;
        assert!(p.tracked_ids().await.is_empty());
        assert_eq!(p.attempts_for(uid, 1).await, None);
        assert_eq!(p.pending_entry(uid, 1).await, None);
    }

    #[tokio::test]
    async fn insolvent_owner_is_evicted() {
        let chain = Arc::new(MockChain::new());
        let runner = MockRunner::new();
        let p = processor(chain.clone(), runner.clone());

        let mut s = sub(3, now() - 5, 600, 5);
        s.payment_amount = U256::from(100u64);
        chain.with(|st| {
            st.subs.insert(3, s.clone());
            // wallet never registered as factory-minted
        });
        track_sub(&p, s).await;

        p.process_once().await;
        assert!(p.tracked_ids().await.is_empty());
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn solvent_owner_passes_payment_gate() {
        let chain = Arc::new(MockChain::new());
        let runner = MockRunner::new();
        let p = processor(chain.clone(), runner.clone());

        let mut s = sub(4, now() - 5, 600, 5);
        s.payment_amount = U256::from(100u64);
        let wallet = s.wallet;
        let tx = H256::repeat_byte(0x44);
        chain.with(|st| {
            st.subs.insert(4, s.clone());
            st.valid_wallets.insert(wallet);
            st.balances.insert((wallet, Address::zero()), U256::from(1000u64));
            st.deliver_outcomes.push_back(DeliverOutcome::Ok(H256::zero()));
            st.deliver_outcomes.push_back(DeliverOutcome::Ok(tx));
        });
        track_sub(&p, s).await;

        p.tick().await;
        assert_eq!(p.pending_entry(UnionId::Onchain(4), 1).await, Some(Some(tx)));
    }

    #[tokio::test]
    async fn cancelled_subscription_is_evicted() {
        let chain = Arc::new(MockChain::new());
        let runner = MockRunner::new();
        let p = processor(chain.clone(), runner.clone());

        let s = sub(5, now() - 5, 600, 5);
        let mut cancelled = s.clone();
        cancelled.active_at = CANCELLED_SENTINEL;
        chain.with(|st| {
            st.subs.insert(5, cancelled);
        });
        track_sub(&p, s).await;

        p.process_once().await;
        assert!(p.tracked_ids().await.is_empty());
    }

    #[tokio::test]
    async fn completed_subscription_is_evicted() {
        let chain = Arc::new(MockChain::new());
        let runner = MockRunner::new();
        let p = processor(chain.clone(), runner.clone());

        // interval == frequency == 3, redundancy met on-chain
        let s = sub(7, now() - 12, 5, 3);
        chain.with(|st| {
            st.subs.insert(7, s.clone());
            st.response_counts.insert((7, 3), 1);
        });
        track_sub(&p, s).await;

        p.process_once().await;
        assert!(p.tracked_ids().await.is_empty());
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn missed_deadline_is_evicted() {
        let chain = Arc::new(MockChain::new());
        let runner = MockRunner::new();
        let p = processor(chain.clone(), runner.clone());

        // frequency 1 with interval far past
        let s = sub(8, now() - 100, 5, 1);
        chain.with(|st| {
            st.subs.insert(8, s.clone());
        });
        track_sub(&p, s).await;

        p.process_once().await;
        assert!(p.tracked_ids().await.is_empty());
    }

    #[tokio::test]
    async fn pipeline_failure_counts_attempt_and_slot_frees() {
        let chain = Arc::new(MockChain::new());
        let runner = MockRunner::new();
        let p = processor(chain.clone(), runner.clone());

        let s = sub(9, now() - 5, 600, 5);
        chain.with(|st| {
            st.subs.insert(9, s.clone());
            st.deliver_outcomes.push_back(DeliverOutcome::Ok(H256::zero()));
        });
        runner.queue(vec![ContainerResult::Error {
            container: "echo".into(),
            error: "boom".into(),
        }]);
        track_sub(&p, s).await;

        let uid = UnionId::Onchain(9);
        p.tick().await;
        assert_eq!(p.pending_entry(uid, 1).await, Some(None)); // still blocked
        assert_eq!(p.attempts_for(uid, 1).await, Some(1));

        p.prune_pending().await;
        assert_eq!(p.pending_entry(uid, 1).await, None); // slot freed for retry
    }

    #[tokio::test]
    async fn delegated_subscription_tracks_delivers_and_finishes() {
        let chain = Arc::new(MockChain::new());
        let runner = MockRunner::new();
        let p = processor(chain.clone(), runner.clone());

        let signer = Address::repeat_byte(0x99);
        let s = sub(-1, now() - 5, 0, 1);
        let wire = SerializedSubscription::from_subscription(&s);
        let tx = H256::repeat_byte(0x55);
        chain.with(|st| {
            st.recovered_signer = signer;
            st.delegated_signer = signer;
            st.deliver_outcomes.push_back(DeliverOutcome::Ok(H256::zero()));
            st.deliver_outcomes.push_back(DeliverOutcome::Ok(tx));
        });

        let msg = DelegatedSubscriptionMessage {
            ip: "1.2.3.4".into(),
            subscription: wire,
            signature: CoordinatorSignatureParams {
                nonce: 11,
                expiry: now() + 3600,
                v: 27,
                r: U256::one(),
                s: U256::one(),
            },
            data: json!({"prompt": "hi"}),
            requires_proof: false,
        };
        p.track(NodeMessage::DelegatedSubscription(Box::new(msg)))
            .await
            .unwrap();
        assert_eq!(p.tracked_delegates().await.len(), 1);

        p.tick().await;
        let uid = UnionId::delegated(s.owner, 11);
        assert_eq!(p.pending_entry(uid, 1).await, Some(Some(tx)));
        let calls = chain.with(|st| st.deliver_calls.clone());
        assert!(calls.iter().all(|c| c.delegated));

        chain.with(|st| {
            st.receipts.insert(tx, (true, true));
        });
        p.prune_pending().await;
        // DONE: the owner-nonce entry is gone
        assert!(p.tracked_delegates().await.is_empty());
        assert_eq!(p.pending_entry(uid, 1).await, None);
    }

    #[tokio::test]
    async fn delegated_signer_mismatch_is_dropped() {
        let chain = Arc::new(MockChain::new());
        let runner = MockRunner::new();
        let p = processor(chain.clone(), runner.clone());

        let s = sub(-1, now() - 5, 0, 1);
        chain.with(|st| {
            st.recovered_signer = Address::repeat_byte(0x01);
            st.delegated_signer = Address::repeat_byte(0x02);
        });

        let msg = DelegatedSubscriptionMessage {
            ip: "1.2.3.4".into(),
            subscription: SerializedSubscription::from_subscription(&s),
            signature: CoordinatorSignatureParams {
                nonce: 1,
                expiry: now() + 3600,
                v: 27,
                r: U256::one(),
                s: U256::one(),
            },
            data: json!({}),
            requires_proof: false,
        };
        assert!(p
            .track(NodeMessage::DelegatedSubscription(Box::new(msg)))
            .await
            .is_err());
        assert!(p.tracked_delegates().await.is_empty());
    }

    #[tokio::test]
    async fn existing_delegate_clears_delivery_slots() {
        let chain = Arc::new(MockChain::new());
        let runner = MockRunner::new();
        let p = processor(chain.clone(), runner.clone());

        let s = sub(-1, now() - 5, 0, 1);
        let onchain_uid = UnionId::Onchain(21);
        chain.with(|st| {
            st.delegate_created.insert((s.owner, 9), 21);
        });
        p.seed_slot(onchain_uid, 1, Some(H256::repeat_byte(0x01))).await;
        p.seed_attempts(onchain_uid, 1, 2).await;

        let msg = DelegatedSubscriptionMessage {
            ip: "1.2.3.4".into(),
            subscription: SerializedSubscription::from_subscription(&s),
            signature: CoordinatorSignatureParams {
                nonce: 9,
                expiry: now() + 3600,
                v: 27,
                r: U256::one(),
                s: U256::one(),
            },
            data: json!({}),
            requires_proof: false,
        };
        p.track(NodeMessage::DelegatedSubscription(Box::new(msg)))
            .await
            .unwrap();

        assert_eq!(p.pending_entry(onchain_uid, 1).await, None);
        assert_eq!(p.attempts_for(onchain_uid, 1).await, None);
        assert!(p.tracked_delegates().await.is_empty());
    }

    #[test]
    fn five_field_outputs_encode_as_proof_bundle() {
        let output = json!({
            "raw_input": "0x0102",
            "processed_input": "0x",
            "raw_output": "0x0304",
            "processed_output": "0x05",
            "proof": "0xdead"
        });
        let (input, out, proof) = serialize_container_output(&output).unwrap();
        assert!(!input.is_empty());
        assert!(!out.is_empty());
        assert_eq!(proof.as_ref(), &[0xde, 0xad]);

        // encoded input decodes back to the two byte fields
        let decoded = ethers::abi::decode(
            &[ethers::abi::ParamType::Bytes, ethers::abi::ParamType::Bytes],
            &input,
        )
        .unwrap();
        assert_eq!(decoded[0], Token::Bytes(vec![0x01, 0x02]));
        assert_eq!(decoded[1], Token::Bytes(vec![]));
    }

    #[test]
    fn other_outputs_encode_as_json_string() {
        let output = json!({"message": "hello"});
        let (input, out, proof) = serialize_container_output(&output).unwrap();
        assert!(input.is_empty());
        assert!(proof.is_empty());

        let decoded =
            ethers::abi::decode(&[ethers::abi::ParamType::String], &out).unwrap();
        let Token::String(json) = &decoded[0] else { panic!() };
        assert_eq!(
            serde_json::from_str::<Value>(json).unwrap(),
            json!({"message": "hello"})
        );
    }
}
