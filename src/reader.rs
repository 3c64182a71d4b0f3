use crate::coordinator::CoordinatorClient;
use ethers::contract::abigen;
use ethers::providers::Middleware;
use ethers::types::{Address, BlockId, BlockNumber};
use eyre::{ensure, eyre, Result};
use std::sync::Arc;

// Batch-read helper contract deployed alongside the coordinator; one RPC
// round trip per batch instead of one per subscription.
abigen!(
    ReaderContract,
    r#"[
        struct ReaderSubscription { address owner; uint32 activeAt; uint32 period; uint32 frequency; uint16 redundancy; bytes32 containerId; bool lazy; address verifier; uint256 paymentAmount; address paymentToken; address wallet; }
        function readSubscriptionBatch(uint32 startId, uint32 endId) view returns (ReaderSubscription[])
        function readRedundancyCountBatch(uint32[] ids, uint32[] intervals) view returns (uint16[])
    ]"#
);

#[derive(Debug)]
pub struct ReaderClient<M> {
    contract: ReaderContract<M>,
    coordinator: Arc<CoordinatorClient<M>>,
}

impl<M: Middleware + 'static> ReaderClient<M> {
    pub fn new(address: Address, client: Arc<M>, coordinator: Arc<CoordinatorClient<M>>) -> Self {
        Self {
            contract: ReaderContract::new(address, client),
            coordinator,
        }
    }

    fn at_block(block: Option<u64>) -> BlockId {
        match block {
            Some(n) => BlockId::Number(BlockNumber::Number(n.into())),
            None => BlockId::Number(BlockNumber::Latest),
        }
    }

    /// Reads subscriptions `[start, end)`, materialized with their batch
    /// index as id.
    pub async fn read_subscription_batch(
        &self,
        start: u32,
        end: u32,
        block: Option<u64>,
    ) -> Result<Vec<crate::subscription::Subscription>> {
        ensure!(start < end, "invalid batch range [{start}, {end})");
        let tuples = self
            .contract
            .read_subscription_batch(start, end)
            .block(Self::at_block(block))
            .call()
            .await
            .map_err(|e| eyre!("readSubscriptionBatch({start}, {end}) failed: {e}"))?;

        let expected = (end - start) as usize;
        ensure!(
            tuples.len() == expected,
            "reader returned {} subscriptions for range [{start}, {end})",
            tuples.len()
        );

        Ok(tuples
            .into_iter()
            .enumerate()
            .map(|(offset, tuple)| {
                self.coordinator
                    .subscription_from_tuple(i64::from(start) + offset as i64, tuple)
            })
            .collect())
    }

    /// Response counts for `(id, interval)` pairs; the result is positional
    /// and the same length as the input.
    pub async fn read_redundancy_count_batch(
        &self,
        pairs: &[(u32, u32)],
        block: Option<u64>,
    ) -> Result<Vec<u16>> {
        let ids: Vec<u32> = pairs.iter().map(|(id, _)| *id).collect();
        let intervals: Vec<u32> = pairs.iter().map(|(_, interval)| *interval).collect();
        let counts = self
            .contract
            .read_redundancy_count_batch(ids, intervals)
            .block(Self::at_block(block))
            .call()
            .await
            .map_err(|e| eyre!("readRedundancyCountBatch failed: {e}"))?;
        ensure!(
            counts.len() == pairs.len(),
            "reader returned {} counts for {} pairs",
            counts.len(),
            pairs.len()
        );
        Ok(counts)
    }
}
