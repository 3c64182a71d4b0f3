use crate::coordinator::CoordinatorClient;
use crate::messages::CoordinatorSignatureParams;
use crate::reader::ReaderClient;
use crate::rpc;
use crate::subscription::Subscription;
use crate::wallet::{NodeWallet, WalletChecker};
use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::{Address, Bytes, H256, U256};
use eyre::Result;
use std::sync::Arc;
use std::time::Duration;

/// Everything the listener and processor need from the chain, behind one
/// seam so tests can substitute an in-memory fake.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// The node's signing address (the delivery `msg.sender`).
    fn node_address(&self) -> Address;

    async fn head_block_number(&self) -> Result<u64>;

    async fn get_head_subscription_id(&self, block: Option<u64>) -> Result<u32>;

    /// Subscriptions `[start, end)` at `block`.
    async fn read_subscription_batch(
        &self,
        start: u32,
        end: u32,
        block: u64,
    ) -> Result<Vec<Subscription>>;

    async fn read_redundancy_count_batch(
        &self,
        pairs: &[(u32, u32)],
        block: u64,
    ) -> Result<Vec<u16>>;

    async fn get_subscription_by_id(&self, id: u32) -> Result<Subscription>;

    async fn get_subscription_response_count(&self, id: u32, interval: u32) -> Result<u16>;

    async fn get_node_has_delivered_response(&self, id: u32, interval: u32) -> Result<bool>;

    async fn get_existing_delegate_subscription(
        &self,
        sub: &Subscription,
        nonce: u32,
    ) -> Result<(bool, u32)>;

    async fn get_delegated_signer(&self, sub: &Subscription) -> Address;

    fn recover_delegatee_signer(
        &self,
        sub: &Subscription,
        sig: &CoordinatorSignatureParams,
    ) -> Result<Address>;

    async fn get_container_inputs(&self, sub: &Subscription, interval: u32, timestamp: u64)
        -> Bytes;

    async fn is_valid_wallet(&self, wallet: Address) -> Result<bool>;

    async fn has_enough_balance(&self, wallet: Address, token: Address, amount: U256)
        -> Result<bool>;

    fn matches_payment_requirements(&self, sub: &Subscription) -> bool;

    #[allow(clippy::too_many_arguments)]
    async fn deliver_compute(
        &self,
        sub: &Subscription,
        interval: u32,
        input: Bytes,
        output: Bytes,
        proof: Bytes,
        simulate_only: bool,
    ) -> Result<H256>;

    #[allow(clippy::too_many_arguments)]
    async fn deliver_compute_delegatee(
        &self,
        sub: &Subscription,
        sig: &CoordinatorSignatureParams,
        interval: u32,
        input: Bytes,
        output: Bytes,
        proof: Bytes,
        simulate_only: bool,
    ) -> Result<H256>;

    async fn get_tx_success(&self, tx: H256) -> (bool, bool);

    /// Polls the receipt until found or `retries` exhausted.
    async fn get_tx_success_with_retries(
        &self,
        tx: H256,
        retries: u32,
        sleep: Duration,
    ) -> (bool, bool) {
        for attempt in 0..retries {
            let (found, success) = self.get_tx_success(tx).await;
            if found {
                return (true, success);
            }
            if attempt + 1 < retries {
                tokio::time::sleep(sleep).await;
            }
        }
        (false, false)
    }
}

/// Production chain client composing the contract suite.
pub struct InfernetChain<M> {
    client: Arc<M>,
    coordinator: Arc<CoordinatorClient<M>>,
    reader: ReaderClient<M>,
    wallet: Arc<NodeWallet<M>>,
    checker: WalletChecker<M>,
    allowed_sim_errors: Vec<String>,
}

impl<M: Middleware + 'static> InfernetChain<M> {
    pub fn new(
        client: Arc<M>,
        coordinator: Arc<CoordinatorClient<M>>,
        reader: ReaderClient<M>,
        wallet: Arc<NodeWallet<M>>,
        checker: WalletChecker<M>,
        allowed_sim_errors: Vec<String>,
    ) -> Self {
        Self {
            client,
            coordinator,
            reader,
            wallet,
            checker,
            allowed_sim_errors,
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainClient for InfernetChain<M> {
    fn node_address(&self) -> Address {
        self.wallet.address()
    }

    async fn head_block_number(&self) -> Result<u64> {
        rpc::head_block_number(self.client.as_ref()).await
    }

    async fn get_head_subscription_id(&self, block: Option<u64>) -> Result<u32> {
        self.coordinator.get_head_subscription_id(block).await
    }

    async fn read_subscription_batch(
        &self,
        start: u32,
        end: u32,
        block: u64,
    ) -> Result<Vec<Subscription>> {
        self.reader
            .read_subscription_batch(start, end, Some(block))
            .await
    }

    async fn read_redundancy_count_batch(
        &self,
        pairs: &[(u32, u32)],
        block: u64,
    ) -> Result<Vec<u16>> {
        self.reader
            .read_redundancy_count_batch(pairs, Some(block))
            .await
    }

    async fn get_subscription_by_id(&self, id: u32) -> Result<Subscription> {
        self.coordinator.get_subscription_by_id(id, None).await
    }

    async fn get_subscription_response_count(&self, id: u32, interval: u32) -> Result<u16> {
        self.coordinator
            .get_subscription_response_count(id, interval, None)
            .await
    }

    async fn get_node_has_delivered_response(&self, id: u32, interval: u32) -> Result<bool> {
        self.coordinator
            .get_node_has_delivered_response(id, interval, self.wallet.address(), None)
            .await
    }

    async fn get_existing_delegate_subscription(
        &self,
        sub: &Subscription,
        nonce: u32,
    ) -> Result<(bool, u32)> {
        self.coordinator
            .get_existing_delegate_subscription(sub, nonce, None)
            .await
    }

    async fn get_delegated_signer(&self, sub: &Subscription) -> Address {
        self.coordinator.get_delegated_signer(sub, None).await
    }

    fn recover_delegatee_signer(
        &self,
        sub: &Subscription,
        sig: &CoordinatorSignatureParams,
    ) -> Result<Address> {
        self.coordinator.recover_delegatee_signer(sub, sig)
    }

    async fn get_container_inputs(
        &self,
        sub: &Subscription,
        interval: u32,
        timestamp: u64,
    ) -> Bytes {
        self.coordinator
            .get_container_inputs(sub, interval, timestamp, self.wallet.address())
            .await
    }

    async fn is_valid_wallet(&self, wallet: Address) -> Result<bool> {
        self.checker.is_valid_wallet(wallet).await
    }

    async fn has_enough_balance(
        &self,
        wallet: Address,
        token: Address,
        amount: U256,
    ) -> Result<bool> {
        self.checker.has_enough_balance(wallet, token, amount).await
    }

    fn matches_payment_requirements(&self, sub: &Subscription) -> bool {
        self.checker.matches_payment_requirements(sub)
    }

    async fn deliver_compute(
        &self,
        sub: &Subscription,
        interval: u32,
        input: Bytes,
        output: Bytes,
        proof: Bytes,
        simulate_only: bool,
    ) -> Result<H256> {
        self.coordinator
            .deliver_compute(
                &self.wallet,
                sub,
                interval,
                input,
                output,
                proof,
                simulate_only,
                &self.allowed_sim_errors,
            )
            .await
    }

    async fn deliver_compute_delegatee(
        &self,
        sub: &Subscription,
        sig: &CoordinatorSignatureParams,
        interval: u32,
        input: Bytes,
        output: Bytes,
        proof: Bytes,
        simulate_only: bool,
    ) -> Result<H256> {
        self.coordinator
            .deliver_compute_delegatee(
                &self.wallet,
                sub,
                sig,
                interval,
                input,
                output,
                proof,
                simulate_only,
                &self.allowed_sim_errors,
            )
            .await
    }

    async fn get_tx_success(&self, tx: H256) -> (bool, bool) {
        rpc::get_tx_success(self.client.as_ref(), tx).await
    }
}

/// Scriptable in-memory chain for listener and processor tests.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::errors::InfernetError;
    use eyre::eyre;
    use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct DeliverCall {
        pub sub_id: i64,
        pub interval: u32,
        pub delegated: bool,
        pub simulate_only: bool,
        pub input: Bytes,
        pub output: Bytes,
        pub proof: Bytes,
    }

    /// Next scripted outcome for a deliver call.
    #[derive(Debug, Clone)]
    pub enum DeliverOutcome {
        Ok(H256),
        Infernet(InfernetError),
        Fail(&'static str),
    }

    #[derive(Debug, Default)]
    pub struct MockState {
        pub head_block: u64,
        pub head_sub_id: u32,
        pub subs: BTreeMap<u32, Subscription>,
        pub response_counts: HashMap<(u32, u32), u16>,
        pub node_responded: HashSet<(u32, u32)>,
        pub delegate_created: HashMap<(Address, u32), u32>,
        pub delegated_signer: Address,
        pub recovered_signer: Address,
        pub valid_wallets: HashSet<Address>,
        pub balances: HashMap<(Address, Address), U256>,
        pub matches_payment: bool,
        pub container_inputs: Bytes,
        pub deliver_outcomes: VecDeque<DeliverOutcome>,
        pub deliver_calls: Vec<DeliverCall>,
        pub receipts: HashMap<H256, (bool, bool)>,
        pub batch_reads: usize,
    }

    pub struct MockChain {
        pub node: Address,
        pub state: Mutex<MockState>,
    }

    impl MockChain {
        pub fn new() -> Self {
            Self {
                node: Address::repeat_byte(0xee),
                state: Mutex::new(MockState {
                    matches_payment: true,
                    ..MockState::default()
                }),
            }
        }

        pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
            f(&mut *self.state.lock().unwrap())
        }

        fn next_outcome(&self, call: DeliverCall) -> Result<H256> {
            let mut state = self.state.lock().unwrap();
            state.deliver_calls.push(call);
            match state.deliver_outcomes.pop_front() {
                Some(DeliverOutcome::Ok(hash)) => Ok(hash),
                Some(DeliverOutcome::Infernet(err)) => Err(eyre::Report::new(err)),
                Some(DeliverOutcome::Fail(msg)) => Err(eyre!("{msg}")),
                None => Ok(H256::repeat_byte(0xaa)),
            }
        }
    }

    #[async_trait]
    impl ChainClient for MockChain {
        fn node_address(&self) -> Address {
            self.node
        }

        async fn head_block_number(&self) -> Result<u64> {
            Ok(self.with(|s| s.head_block))
        }

        async fn get_head_subscription_id(&self, _block: Option<u64>) -> Result<u32> {
            Ok(self.with(|s| s.head_sub_id))
        }

        async fn read_subscription_batch(
            &self,
            start: u32,
            end: u32,
            _block: u64,
        ) -> Result<Vec<Subscription>> {
            self.with(|s| {
                s.batch_reads += 1;
                (start..end)
                    .map(|id| {
                        s.subs
                            .get(&id)
                            .cloned()
                            .ok_or_else(|| eyre!("missing subscription {id}"))
                    })
                    .collect()
            })
        }

        async fn read_redundancy_count_batch(
            &self,
            pairs: &[(u32, u32)],
            _block: u64,
        ) -> Result<Vec<u16>> {
            self.with(|s| {
                Ok(pairs
                    .iter()
                    .map(|key| s.response_counts.get(key).copied().unwrap_or(0))
                    .collect())
            })
        }

        async fn get_subscription_by_id(&self, id: u32) -> Result<Subscription> {
            self.with(|s| {
                s.subs
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| eyre!("missing subscription {id}"))
            })
        }

        async fn get_subscription_response_count(&self, id: u32, interval: u32) -> Result<u16> {
            Ok(self.with(|s| s.response_counts.get(&(id, interval)).copied().unwrap_or(0)))
        }

        async fn get_node_has_delivered_response(&self, id: u32, interval: u32) -> Result<bool> {
            Ok(self.with(|s| s.node_responded.contains(&(id, interval))))
        }

        async fn get_existing_delegate_subscription(
            &self,
            sub: &Subscription,
            nonce: u32,
        ) -> Result<(bool, u32)> {
            Ok(self.with(|s| {
                match s.delegate_created.get(&(sub.owner, nonce)) {
                    Some(id) => (true, *id),
                    None => (false, 0),
                }
            }))
        }

        async fn get_delegated_signer(&self, _sub: &Subscription) -> Address {
            self.with(|s| s.delegated_signer)
        }

        fn recover_delegatee_signer(
            &self,
            _sub: &Subscription,
            _sig: &CoordinatorSignatureParams,
        ) -> Result<Address> {
            Ok(self.with(|s| s.recovered_signer))
        }

        async fn get_container_inputs(
            &self,
            _sub: &Subscription,
            _interval: u32,
            _timestamp: u64,
        ) -> Bytes {
            self.with(|s| s.container_inputs.clone())
        }

        async fn is_valid_wallet(&self, wallet: Address) -> Result<bool> {
            Ok(self.with(|s| s.valid_wallets.contains(&wallet)))
        }

        async fn has_enough_balance(
            &self,
            wallet: Address,
            token: Address,
            amount: U256,
        ) -> Result<bool> {
            Ok(self.with(|s| {
                s.balances
                    .get(&(wallet, token))
                    .map(|balance| *balance >= amount)
                    .unwrap_or(false)
            }))
        }

        fn matches_payment_requirements(&self, _sub: &Subscription) -> bool {
            self.with(|s| s.matches_payment)
        }

        async fn deliver_compute(
            &self,
            sub: &Subscription,
            interval: u32,
            input: Bytes,
            output: Bytes,
            proof: Bytes,
            simulate_only: bool,
        ) -> Result<H256> {
            self.next_outcome(DeliverCall {
                sub_id: sub.id,
                interval,
                delegated: false,
                simulate_only,
                input,
                output,
                proof,
            })
        }

        async fn deliver_compute_delegatee(
            &self,
            sub: &Subscription,
            _sig: &CoordinatorSignatureParams,
            interval: u32,
            input: Bytes,
            output: Bytes,
            proof: Bytes,
            simulate_only: bool,
        ) -> Result<H256> {
            self.next_outcome(DeliverCall {
                sub_id: sub.id,
                interval,
                delegated: true,
                simulate_only,
                input,
                output,
                proof,
            })
        }

        async fn get_tx_success(&self, tx: H256) -> (bool, bool) {
            self.with(|s| s.receipts.get(&tx).copied().unwrap_or((false, false)))
        }
    }
}
