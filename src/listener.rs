use crate::chain::ChainClient;
use crate::config::SnapshotSyncConfig;
use crate::guardian::Guardian;
use crate::messages::NodeMessage;
use crate::processor::ChainProcessor;
use crate::task::{AsyncTask, Shutdown};
use async_trait::async_trait;
use eyre::Result;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Head-follower advance cap, bounding RPC cost per tick.
const BLOCKS_PER_TICK_CAP: u64 = 100;

/// Partitions `[start, end]` (inclusive ids) into half-open batches of at
/// most `size`, the final batch possibly smaller. Always yields at least
/// one batch, beginning at `start`.
pub fn get_batches(start: u32, end: u32, size: u32) -> Vec<(u32, u32)> {
    if start == end {
        return vec![(start, start + 1)];
    }
    if end - start + 1 <= size {
        return vec![(start, end + 1)];
    }

    let mut batches = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let stop = cursor.saturating_add(size - 1).min(end) + 1;
        batches.push((cursor, stop));
        cursor = stop;
    }
    batches
}

/// Keeps the processor's tracked set reconciled with the coordinator: a
/// bounded-batch snapshot sync at startup, then an incremental head
/// follower trailing `trail_head_blocks` behind the chain for reorg
/// safety.
pub struct ChainListener<C> {
    chain: Arc<C>,
    processor: Arc<ChainProcessor<C>>,
    guardian: Arc<dyn Guardian>,
    trail_head_blocks: u64,
    snapshot_sync: SnapshotSyncConfig,
    shutdown: Shutdown,
    last_block: AtomicU64,
    last_subscription_id: AtomicU32,
}

impl<C: ChainClient> ChainListener<C> {
    pub fn new(
        chain: Arc<C>,
        processor: Arc<ChainProcessor<C>>,
        guardian: Arc<dyn Guardian>,
        trail_head_blocks: u64,
        snapshot_sync: SnapshotSyncConfig,
        shutdown: Shutdown,
    ) -> Self {
        let starting_sub_id = snapshot_sync.starting_sub_id;
        Self {
            chain,
            processor,
            guardian,
            trail_head_blocks,
            snapshot_sync,
            shutdown,
            last_block: AtomicU64::new(0),
            last_subscription_id: AtomicU32::new(starting_sub_id),
        }
    }

    /// Syncs subscriptions `(last_subscription_id, head_sub_id(block)]` in
    /// batches, advancing the id cursor on completion. Re-running against
    /// the same head is idempotent: the processor keys by subscription id.
    pub async fn snapshot_sync(&self, block: u64) -> Result<()> {
        let head_sub_id = self.chain.get_head_subscription_id(Some(block)).await?;
        let start = self.last_subscription_id.load(Ordering::SeqCst) + 1;
        if head_sub_id < start {
            return Ok(());
        }

        let batches = get_batches(start, head_sub_id, self.snapshot_sync.batch_size);
        tracing::info!(
            start,
            head_sub_id,
            block,
            batches = batches.len(),
            "snapshot syncing subscriptions"
        );

        for (index, (from, to)) in batches.iter().enumerate() {
            // Unbounded retry with exponential backoff; a batch that cannot
            // be read yet must not be skipped.
            let mut delay = self.snapshot_sync.sleep_duration();
            loop {
                if self.shutdown.is_stopped() {
                    return Ok(());
                }
                match self.sync_batch(*from, *to, block).await {
                    Ok(tracked) => {
                        tracing::debug!(from, to, tracked, "batch synced");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(
                            from,
                            to,
                            sleep_ms = delay.as_millis() as u64,
                            error = %err,
                            "batch sync failed; backing off"
                        );
                        self.shutdown.sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
            }

            // Throttle between batches to spare the RPC.
            if index + 1 < batches.len() {
                self.shutdown.sleep(self.snapshot_sync.sleep_duration()).await;
            }
        }

        self.last_subscription_id.store(head_sub_id, Ordering::SeqCst);
        Ok(())
    }

    /// Reads subscriptions `[start, end)` at `block`, loads on-chain
    /// response counts for those on their final interval, and hands each
    /// through the guardian to the processor.
    async fn sync_batch(&self, start: u32, end: u32, block: u64) -> Result<usize> {
        let mut subs = self.chain.read_subscription_batch(start, end, block).await?;

        let mut positions: Vec<(usize, u32)> = Vec::new();
        let mut pairs: Vec<(u32, u32)> = Vec::new();
        for (index, sub) in subs.iter().enumerate() {
            if sub.active() && sub.last_interval().unwrap_or(false) {
                if let Ok(interval) = sub.interval() {
                    positions.push((index, interval));
                    pairs.push((sub.id as u32, interval));
                }
            }
        }
        if !pairs.is_empty() {
            let counts = self.chain.read_redundancy_count_batch(&pairs, block).await?;
            for ((index, interval), count) in positions.into_iter().zip(counts) {
                subs[index].set_response_count(interval, count)?;
            }
        }

        let mut tracked = 0usize;
        for sub in subs {
            let id = sub.id;
            match self
                .guardian
                .process_message(NodeMessage::SubscriptionCreated(sub))
                .await
            {
                Ok(msg) => match self.processor.track(msg).await {
                    Ok(()) => tracked += 1,
                    Err(err) => {
                        tracing::warn!(subscription_id = id, error = %err, "processor rejected subscription");
                    }
                },
                Err(err) => {
                    tracing::info!(subscription_id = id, reason = %err, "subscription filtered");
                }
            }
        }
        Ok(tracked)
    }

    /// One head-follower step; returns whether any blocks were consumed.
    async fn follow_head_once(&self) -> Result<bool> {
        let chain_head = self.chain.head_block_number().await?;
        let head = chain_head.saturating_sub(self.trail_head_blocks);
        let last = self.last_block.load(Ordering::SeqCst);
        if last >= head {
            return Ok(false);
        }

        let target = last + (head - last).min(BLOCKS_PER_TICK_CAP);
        self.snapshot_sync(target).await?;
        self.last_block.store(target, Ordering::SeqCst);
        tracing::debug!(
            target,
            head,
            last_subscription_id = self.last_subscription_id.load(Ordering::SeqCst),
            "advanced listener head"
        );
        Ok(true)
    }
}

#[async_trait]
impl<C: ChainClient> AsyncTask for ChainListener<C> {
    /// Initial snapshot: start trailing the current head and sync every
    /// subscription from `starting_sub_id` forward.
    async fn setup(&self) -> Result<()> {
        let head = self
            .chain
            .head_block_number()
            .await?
            .saturating_sub(self.trail_head_blocks);
        self.last_block.store(head, Ordering::SeqCst);

        tracing::info!(
            head,
            starting_sub_id = self.snapshot_sync.starting_sub_id,
            trail_head_blocks = self.trail_head_blocks,
            "listener starting snapshot sync"
        );
        self.snapshot_sync(head).await?;
        tracing::info!(
            last_subscription_id = self.last_subscription_id.load(Ordering::SeqCst),
            "snapshot sync complete"
        );
        Ok(())
    }

    async fn run_forever(&self) -> Result<()> {
        while !self.shutdown.is_stopped() {
            match self.follow_head_once().await {
                Ok(true) => {}
                Ok(false) => {
                    self.shutdown
                        .sleep(self.snapshot_sync.sync_period_duration())
                        .await;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "listener tick failed; retrying");
                    self.shutdown
                        .sleep(self.snapshot_sync.sync_period_duration())
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        tracing::info!(
            last_block = self.last_block.load(Ordering::SeqCst),
            last_subscription_id = self.last_subscription_id.load(Ordering::SeqCst),
            "listener shut down"
        );
        Ok(())
    }
}
