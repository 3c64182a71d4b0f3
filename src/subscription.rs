use crate::container_lookup::ContainerLookup;
use ethers::types::{Address, H256, U256};
use eyre::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// `activeAt` sentinel the coordinator writes on cancellation.
pub const CANCELLED_SENTINEL: u32 = u32::MAX;

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

/// An on-chain compute subscription.
///
/// Identity and parameters are immutable once read from the coordinator;
/// only per-interval response counts and the node-replied flags mutate, and
/// only the chain processor mutates them.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Coordinator-assigned id; `-1` for delegated subscriptions that have
    /// not been created on-chain yet.
    pub id: i64,
    pub owner: Address,
    pub active_at: u32,
    pub period: u32,
    pub frequency: u32,
    pub redundancy: u16,
    pub containers_hash: H256,
    pub lazy: bool,
    pub verifier: Address,
    pub payment_amount: U256,
    pub payment_token: Address,
    pub wallet: Address,

    /// Container ids resolved from `containers_hash` via the local lookup;
    /// empty when the node does not serve this permutation.
    pub containers: Vec<String>,

    responses: BTreeMap<u32, u16>,
    node_replied: BTreeMap<u32, bool>,
}

impl Subscription {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: i64,
        owner: Address,
        active_at: u32,
        period: u32,
        frequency: u32,
        redundancy: u16,
        containers_hash: H256,
        lazy: bool,
        verifier: Address,
        payment_amount: U256,
        payment_token: Address,
        wallet: Address,
        containers: Vec<String>,
    ) -> Self {
        Self {
            id,
            owner,
            active_at,
            period,
            frequency,
            redundancy,
            containers_hash,
            lazy,
            verifier,
            payment_amount,
            payment_token,
            wallet,
            containers,
            responses: BTreeMap::new(),
            node_replied: BTreeMap::new(),
        }
    }

    pub fn active(&self) -> bool {
        !self.cancelled() && now_unix() > u64::from(self.active_at)
    }

    pub fn cancelled(&self) -> bool {
        self.active_at == CANCELLED_SENTINEL
    }

    /// One-shot subscription; always interval 1.
    pub fn is_callback(&self) -> bool {
        self.period == 0
    }

    pub fn requires_proof(&self) -> bool {
        self.verifier != Address::zero()
    }

    pub fn provides_payment(&self) -> bool {
        !self.payment_amount.is_zero()
    }

    /// Current interval, starting at 1.
    ///
    /// Fails on an inactive subscription: there is no interval to speak of
    /// before `active_at`.
    pub fn interval(&self) -> Result<u32> {
        ensure!(
            self.active(),
            "subscription {} is not active; interval is undefined",
            self.id
        );
        if self.is_callback() {
            return Ok(1);
        }
        let elapsed = now_unix().saturating_sub(u64::from(self.active_at));
        let interval = elapsed / u64::from(self.period) + 1;
        Ok(u32::try_from(interval).unwrap_or(u32::MAX))
    }

    pub fn last_interval(&self) -> Result<bool> {
        Ok(self.interval()? == self.frequency)
    }

    pub fn past_last_interval(&self) -> Result<bool> {
        Ok(self.interval()? > self.frequency)
    }

    /// Completed once the final interval has collected `redundancy`
    /// responses.
    pub fn completed(&self) -> Result<bool> {
        let interval = self.interval()?;
        if interval < self.frequency {
            return Ok(false);
        }
        Ok(self.response_count(self.frequency) == self.redundancy)
    }

    pub fn response_count(&self, interval: u32) -> u16 {
        self.responses.get(&interval).copied().unwrap_or(0)
    }

    /// Records the on-chain response count for an interval. Writing a count
    /// for an interval that has not started yet is a caller bug.
    pub fn set_response_count(&mut self, interval: u32, count: u16) -> Result<()> {
        ensure!(
            interval <= self.interval()?,
            "cannot set response count for future interval {} of subscription {}",
            interval,
            self.id
        );
        self.responses.insert(interval, count);
        Ok(())
    }

    pub fn node_replied(&self, interval: u32) -> bool {
        self.node_replied.get(&interval).copied().unwrap_or(false)
    }

    pub fn set_node_replied(&mut self, interval: u32) {
        self.node_replied.insert(interval, true);
    }
}

/// A tracked unit: an on-chain subscription id, or the `(owner, nonce)`
/// identity of a delegated subscription that has no id yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnionId {
    Onchain(u32),
    Delegated { owner: Address, nonce: u32 },
}

impl UnionId {
    pub fn delegated(owner: Address, nonce: u32) -> Self {
        UnionId::Delegated { owner, nonce }
    }
}

impl std::fmt::Display for UnionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnionId::Onchain(id) => write!(f, "{id}"),
            UnionId::Delegated { owner, nonce } => write!(f, "{owner:#x}-{nonce}"),
        }
    }
}

/// Wire form of a subscription, as clients submit it with a delegated
/// signature. Carries `containers` as the already-hashed 32-byte value so
/// the round trip through the node does not need the preimage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedSubscription {
    pub owner: Address,
    pub active_at: u32,
    pub period: u32,
    pub frequency: u32,
    pub redundancy: u16,
    pub containers: H256,
    pub lazy: bool,
    pub verifier: Address,
    pub payment_amount: U256,
    pub payment_token: Address,
    pub wallet: Address,
}

impl SerializedSubscription {
    /// Materializes a `Subscription` with an unassigned id, resolving the
    /// container permutation through the node's lookup (empty on miss).
    pub fn deserialize(&self, lookup: &ContainerLookup) -> Subscription {
        Subscription::new(
            -1,
            self.owner,
            self.active_at,
            self.period,
            self.frequency,
            self.redundancy,
            self.containers,
            self.lazy,
            self.verifier,
            self.payment_amount,
            self.payment_token,
            self.wallet,
            lookup.get(&self.containers),
        )
    }

    pub fn from_subscription(sub: &Subscription) -> Self {
        Self {
            owner: sub.owner,
            active_at: sub.active_at,
            period: sub.period,
            frequency: sub.frequency,
            redundancy: sub.redundancy,
            containers: sub.containers_hash,
            lazy: sub.lazy,
            verifier: sub.verifier,
            payment_amount: sub.payment_amount,
            payment_token: sub.payment_token,
            wallet: sub.wallet,
        }
    }
}
