use crate::container_lookup::ContainerLookup;
use crate::errors::{matches_allowed_sim_errors, InfernetError};
use crate::messages::CoordinatorSignatureParams;
use crate::rpc::keccak_encoded;
use crate::subscription::Subscription;
use crate::wallet::NodeWallet;
use ethers::abi::{Detokenize, Token};
use ethers::contract::{abigen, ContractCall};
use ethers::providers::Middleware;
use ethers::types::transaction::eip712::{EIP712Domain, Eip712};
use ethers::types::{Address, BlockId, BlockNumber, Bytes, RecoveryMessage, Signature, H256, U256};
use ethers::utils::keccak256;
use eyre::{eyre, Result};
use std::sync::Arc;

abigen!(
    CoordinatorContract,
    r#"[
        struct CoordinatorSubscription { address owner; uint32 activeAt; uint32 period; uint32 frequency; uint16 redundancy; bytes32 containerId; bool lazy; address verifier; uint256 paymentAmount; address paymentToken; address wallet; }
        function id() view returns (uint32)
        function getSubscription(uint32 subscriptionId) view returns (CoordinatorSubscription)
        function delegateCreatedIds(bytes32 key) view returns (uint32)
        function nodeResponded(bytes32 key) view returns (bool)
        function redundancyCount(bytes32 key) view returns (uint16)
        function getContainerInputs(uint32 subscriptionId, uint32 interval, uint32 timestamp, address caller) view returns (bytes)
        function deliverCompute(uint32 subscriptionId, uint32 deliveryInterval, bytes input, bytes output, bytes proof, address nodeWallet)
        function deliverComputeDelegatee(uint32 nonce, uint32 expiry, CoordinatorSubscription sub, uint8 v, bytes32 r, bytes32 s, uint32 deliveryInterval, bytes input, bytes output, bytes proof, address nodeWallet)
        event SubscriptionCreated(uint32 indexed id)
        event SubscriptionCancelled(uint32 indexed id)
        event SubscriptionFulfilled(uint32 indexed id, address indexed node)
    ]"#
);

// Consumer contracts that delegate signing expose their signer here.
abigen!(
    DelegatorContract,
    r#"[
        function getSigner() view returns (address)
    ]"#
);

/// The coordinator's on-chain Subscription tuple, in ABI order.
type SubscriptionTuple = (
    Address,
    u32,
    u32,
    u32,
    u16,
    [u8; 32],
    bool,
    Address,
    U256,
    Address,
    Address,
);

fn coordinator_subscription(sub: &Subscription) -> CoordinatorSubscription {
    CoordinatorSubscription {
        owner: sub.owner,
        active_at: sub.active_at,
        period: sub.period,
        frequency: sub.frequency,
        redundancy: sub.redundancy,
        container_id: sub.containers_hash.0,
        lazy: sub.lazy,
        verifier: sub.verifier,
        payment_amount: sub.payment_amount,
        payment_token: sub.payment_token,
        wallet: sub.wallet,
    }
}

const EIP712_NAME: &str = "InfernetCoordinator";
const EIP712_VERSION: &str = "1";

const DELEGATE_SUBSCRIPTION_TYPE: &str = "DelegateSubscription(uint32 nonce,uint32 expiry,Subscription sub)Subscription(address owner,uint32 activeAt,uint32 period,uint32 frequency,uint16 redundancy,bytes32 containerId,bool lazy,address verifier,uint256 paymentAmount,address paymentToken,address wallet)";
const SUBSCRIPTION_TYPE: &str = "Subscription(address owner,uint32 activeAt,uint32 period,uint32 frequency,uint16 redundancy,bytes32 containerId,bool lazy,address verifier,uint256 paymentAmount,address paymentToken,address wallet)";

/// EIP-712 view of a delegated subscription, scoped to the coordinator's
/// signing domain.
pub struct DelegateSubscriptionTyped<'a> {
    pub chain_id: u64,
    pub verifying_contract: Address,
    pub nonce: u32,
    pub expiry: u32,
    pub sub: &'a Subscription,
}

impl Eip712 for DelegateSubscriptionTyped<'_> {
    type Error = std::convert::Infallible;

    fn domain(&self) -> std::result::Result<EIP712Domain, Self::Error> {
        Ok(EIP712Domain {
            name: Some(EIP712_NAME.to_owned()),
            version: Some(EIP712_VERSION.to_owned()),
            chain_id: Some(self.chain_id.into()),
            verifying_contract: Some(self.verifying_contract),
            salt: None,
        })
    }

    fn type_hash() -> std::result::Result<[u8; 32], Self::Error> {
        Ok(keccak256(DELEGATE_SUBSCRIPTION_TYPE))
    }

    fn struct_hash(&self) -> std::result::Result<[u8; 32], Self::Error> {
        let sub = self.sub;
        let sub_hash = keccak256(ethers::abi::encode(&[
            Token::Uint(U256::from(keccak256(SUBSCRIPTION_TYPE))),
            Token::Address(sub.owner),
            Token::Uint(sub.active_at.into()),
            Token::Uint(sub.period.into()),
            Token::Uint(sub.frequency.into()),
            Token::Uint(sub.redundancy.into()),
            Token::FixedBytes(sub.containers_hash.as_bytes().to_vec()),
            Token::Bool(sub.lazy),
            Token::Address(sub.verifier),
            Token::Uint(sub.payment_amount),
            Token::Address(sub.payment_token),
            Token::Address(sub.wallet),
        ]));

        Ok(keccak256(ethers::abi::encode(&[
            Token::Uint(U256::from(Self::type_hash()?)),
            Token::Uint(self.nonce.into()),
            Token::Uint(self.expiry.into()),
            Token::Uint(U256::from(sub_hash)),
        ])))
    }
}

/// Typed reads and writes against the coordinator contract.
#[derive(Debug)]
pub struct CoordinatorClient<M> {
    client: Arc<M>,
    contract: CoordinatorContract<M>,
    lookup: Arc<ContainerLookup>,
    chain_id: u64,
}

impl<M: Middleware + 'static> CoordinatorClient<M> {
    pub fn new(
        address: Address,
        client: Arc<M>,
        lookup: Arc<ContainerLookup>,
        chain_id: u64,
    ) -> Self {
        Self {
            contract: CoordinatorContract::new(address, client.clone()),
            client,
            lookup,
            chain_id,
        }
    }

    pub fn address(&self) -> Address {
        self.contract.address()
    }

    fn at_block(block: Option<u64>) -> BlockId {
        match block {
            Some(n) => BlockId::Number(BlockNumber::Number(n.into())),
            None => BlockId::Number(BlockNumber::Latest),
        }
    }

    /// Highest assigned subscription id at `block` (the contract's counter
    /// holds the next id to assign).
    pub async fn get_head_subscription_id(&self, block: Option<u64>) -> Result<u32> {
        let next = self
            .contract
            .id()
            .block(Self::at_block(block))
            .call()
            .await
            .map_err(|e| eyre!("coordinator id() failed: {e}"))?;
        Ok(next.saturating_sub(1))
    }

    pub async fn get_subscription_by_id(&self, id: u32, block: Option<u64>) -> Result<Subscription> {
        let tuple = self
            .contract
            .get_subscription(id)
            .block(Self::at_block(block))
            .call()
            .await
            .map_err(|e| eyre!("getSubscription({id}) failed: {e}"))?;
        Ok(self.subscription_from_tuple(i64::from(id), tuple))
    }

    pub fn subscription_from_tuple(&self, id: i64, tuple: SubscriptionTuple) -> Subscription {
        let (
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
        ) = tuple;
        let containers_hash = H256::from(containers_hash);
        Subscription::new(
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
            self.lookup.get(&containers_hash),
        )
    }

    /// Whether `node` already delivered for `(id, interval)`. Keyed by
    /// `keccak(abi.encode(uint32, uint32, address))`.
    pub async fn get_node_has_delivered_response(
        &self,
        id: u32,
        interval: u32,
        node: Address,
        block: Option<u64>,
    ) -> Result<bool> {
        let key = keccak_encoded(&[
            Token::Uint(id.into()),
            Token::Uint(interval.into()),
            Token::Address(node),
        ]);
        self.contract
            .node_responded(key.0)
            .block(Self::at_block(block))
            .call()
            .await
            .map_err(|e| eyre!("nodeResponded({id}, {interval}) failed: {e}"))
    }

    /// Responses delivered so far for `(id, interval)`. Keyed by
    /// `keccak(abi.encode(uint32, uint32))`.
    pub async fn get_subscription_response_count(
        &self,
        id: u32,
        interval: u32,
        block: Option<u64>,
    ) -> Result<u16> {
        let key = keccak_encoded(&[Token::Uint(id.into()), Token::Uint(interval.into())]);
        self.contract
            .redundancy_count(key.0)
            .block(Self::at_block(block))
            .call()
            .await
            .map_err(|e| eyre!("redundancyCount({id}, {interval}) failed: {e}"))
    }

    /// The delegated signer registered on the subscription owner's
    /// contract; zero when the owner does not implement `getSigner()`.
    pub async fn get_delegated_signer(&self, sub: &Subscription, block: Option<u64>) -> Address {
        let delegator = DelegatorContract::new(sub.owner, self.client.clone());
        match delegator
            .get_signer()
            .block(Self::at_block(block))
            .call()
            .await
        {
            Ok(signer) => signer,
            Err(err) => {
                tracing::debug!(owner = ?sub.owner, error = %err, "getSigner() reverted; treating as zero");
                Address::zero()
            }
        }
    }

    /// Looks up whether `(owner, nonce)` already produced an on-chain
    /// subscription. Exists iff the mapped id is non-zero.
    pub async fn get_existing_delegate_subscription(
        &self,
        sub: &Subscription,
        nonce: u32,
        block: Option<u64>,
    ) -> Result<(bool, u32)> {
        let key = keccak_encoded(&[Token::Address(sub.owner), Token::Uint(nonce.into())]);
        let id = self
            .contract
            .delegate_created_ids(key.0)
            .block(Self::at_block(block))
            .call()
            .await
            .map_err(|e| eyre!("delegateCreatedIds lookup failed: {e}"))?;
        Ok((id != 0, id))
    }

    /// Recovers the ECDSA signer of the EIP-712 `DelegateSubscription`
    /// digest.
    pub fn recover_delegatee_signer(
        &self,
        sub: &Subscription,
        sig: &CoordinatorSignatureParams,
    ) -> Result<Address> {
        let typed = DelegateSubscriptionTyped {
            chain_id: self.chain_id,
            verifying_contract: self.address(),
            nonce: sig.nonce,
            expiry: sig.expiry,
            sub,
        };
        let digest = typed
            .encode_eip712()
            .map_err(|e| eyre!("eip712 encoding failed: {e}"))?;
        let signature = Signature {
            r: sig.r,
            s: sig.s,
            v: sig.v,
        };
        signature
            .recover(RecoveryMessage::Hash(H256::from(digest)))
            .map_err(|e| eyre!("signature recovery failed: {e}"))
    }

    /// On-chain inputs for a subscription's next delivery; `0x` when the
    /// consumer contract does not implement the hook.
    pub async fn get_container_inputs(
        &self,
        sub: &Subscription,
        interval: u32,
        timestamp: u64,
        caller: Address,
    ) -> Bytes {
        let id = u32::try_from(sub.id).unwrap_or(0);
        let ts = u32::try_from(timestamp).unwrap_or(u32::MAX);
        match self
            .contract
            .get_container_inputs(id, interval, ts, caller)
            .call()
            .await
        {
            Ok(inputs) => inputs,
            Err(err) => {
                tracing::debug!(
                    subscription_id = sub.id,
                    interval,
                    error = %err,
                    "getContainerInputs reverted; defaulting to empty input"
                );
                Bytes::new()
            }
        }
    }

    /// Delivers a regular subscription response: simulate as the node's
    /// from-address, then submit under the wallet tx lock. With
    /// `simulate_only` the all-zero hash is returned without submitting.
    #[allow(clippy::too_many_arguments)]
    pub async fn deliver_compute(
        &self,
        wallet: &NodeWallet<M>,
        sub: &Subscription,
        interval: u32,
        input: Bytes,
        output: Bytes,
        proof: Bytes,
        simulate_only: bool,
        allowed_sim_errors: &[String],
    ) -> Result<H256> {
        let id = u32::try_from(sub.id).map_err(|_| eyre!("subscription {} has no on-chain id", sub.id))?;
        let call = self
            .contract
            .deliver_compute(id, interval, input, output, proof, wallet.payment_address())
            .from(wallet.address());
        self.simulate_then_send(wallet, call, sub.id, simulate_only, allowed_sim_errors)
            .await
    }

    /// Delivers a delegated subscription response, carrying the owner's
    /// EIP-712 signature so the coordinator creates the subscription on the
    /// fly if needed.
    #[allow(clippy::too_many_arguments)]
    pub async fn deliver_compute_delegatee(
        &self,
        wallet: &NodeWallet<M>,
        sub: &Subscription,
        sig: &CoordinatorSignatureParams,
        interval: u32,
        input: Bytes,
        output: Bytes,
        proof: Bytes,
        simulate_only: bool,
        allowed_sim_errors: &[String],
    ) -> Result<H256> {
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        sig.r.to_big_endian(&mut r);
        sig.s.to_big_endian(&mut s);

        let call = self
            .contract
            .deliver_compute_delegatee(
                sig.nonce,
                sig.expiry,
                coordinator_subscription(sub),
                u8::try_from(sig.v).unwrap_or(27),
                r,
                s,
                interval,
                input,
                output,
                proof,
                wallet.payment_address(),
            )
            .from(wallet.address());
        self.simulate_then_send(wallet, call, sub.id, simulate_only, allowed_sim_errors)
            .await
    }

    /// Shared simulate/submit tail for both delivery paths.
    ///
    /// A revert carrying a known Infernet selector fails immediately (typed,
    /// so callers can distinguish). A revert matching the operator's
    /// allow list downgrades to "gas estimation unusable": the submission
    /// goes out with the configured max gas limit.
    async fn simulate_then_send<D: Detokenize>(
        &self,
        wallet: &NodeWallet<M>,
        call: ContractCall<M, D>,
        sub_id: i64,
        simulate_only: bool,
        allowed_sim_errors: &[String],
    ) -> Result<H256> {
        let mut gas_override = None;

        if let Err(err) = call.call().await {
            let raw = err.to_string();
            if let Some(infernet) = InfernetError::from_error_str(&raw) {
                infernet.log(sub_id);
                return Err(eyre::Report::new(infernet));
            }
            if matches_allowed_sim_errors(&raw, allowed_sim_errors) {
                tracing::warn!(
                    subscription_id = sub_id,
                    error = %raw,
                    "simulation revert allowed by config; submitting with manual gas limit"
                );
                gas_override = Some(wallet.max_gas_limit());
            } else {
                return Err(eyre!("delivery simulation reverted: {raw}"));
            }
        }

        if simulate_only {
            return Ok(H256::zero());
        }

        wallet.send(call, gas_override).await
    }
}
