use crate::config::ContainerConfig;
use crate::rpc;
use crate::subscription::Subscription;
use ethers::abi::Detokenize;
use ethers::contract::{abigen, ContractCall};
use ethers::providers::Middleware;
use ethers::types::{Address, H256, U256};
use eyre::{eyre, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

abigen!(
    WalletFactory,
    r#"[
        function isValidWallet(address wallet) view returns (bool)
    ]"#
);

// Escrow wallet owned by the node operator's key; approvals let the
// coordinator draw verifier fees from it.
abigen!(
    PaymentWalletContract,
    r#"[
        function approve(address spender, address token, uint256 amount)
    ]"#
);

/// The node's signing wallet. Submission is serialized through `tx_lock` so
/// the single signing key sees strictly ordered nonces; simulation never
/// takes the lock.
#[derive(Debug)]
pub struct NodeWallet<M> {
    client: Arc<M>,
    address: Address,
    payment_address: Option<Address>,
    max_gas_limit: u64,
    tx_lock: Mutex<()>,
}

impl<M: Middleware + 'static> NodeWallet<M> {
    pub fn new(
        client: Arc<M>,
        address: Address,
        payment_address: Option<Address>,
        max_gas_limit: u64,
    ) -> Self {
        Self {
            client,
            address,
            payment_address,
            max_gas_limit,
            tx_lock: Mutex::new(()),
        }
    }

    /// The from-address all deliveries are simulated and submitted as.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Escrow address receiving payments; zero when unconfigured, which the
    /// coordinator treats as "no payment expected".
    pub fn payment_address(&self) -> Address {
        self.payment_address.unwrap_or_else(Address::zero)
    }

    pub fn has_payment_address(&self) -> bool {
        self.payment_address.is_some()
    }

    pub fn max_gas_limit(&self) -> u64 {
        self.max_gas_limit
    }

    /// Submits a prepared call. Holds the tx lock only across `send`, so
    /// concurrent simulations proceed while one submission is in flight.
    pub async fn send<D: Detokenize>(
        &self,
        mut call: ContractCall<M, D>,
        gas_limit: Option<u64>,
    ) -> Result<H256> {
        if let Some(gas) = gas_limit {
            call = call.gas(U256::from(gas));
        }

        let _guard = self.tx_lock.lock().await;
        let pending = call
            .send()
            .await
            .map_err(|e| eyre!("transaction submission failed: {e}"))?;
        Ok(pending.tx_hash())
    }

    /// `PaymentWallet.approve(spender, token, amount)`; the signing key must
    /// own the wallet contract.
    pub async fn approve(
        &self,
        wallet: Address,
        spender: Address,
        token: Address,
        amount: U256,
    ) -> Result<H256> {
        let contract = PaymentWalletContract::new(wallet, self.client.clone());
        let call = contract.approve(spender, token, amount);
        let tx = self.send(call, None).await?;
        tracing::info!(wallet = ?wallet, spender = ?spender, token = ?token, amount = %amount, tx = ?tx, "approve submitted");
        Ok(tx)
    }
}

/// Solvency and payment-policy probes used by the processor's first gate.
#[derive(Debug)]
pub struct WalletChecker<M> {
    client: Arc<M>,
    factory: WalletFactory<M>,
    /// container id -> (token -> minimum amount).
    accepted_payments: HashMap<String, HashMap<Address, U256>>,
    has_payment_address: bool,
}

impl<M: Middleware + 'static> WalletChecker<M> {
    pub fn new(
        client: Arc<M>,
        factory_address: Address,
        containers: &[ContainerConfig],
        has_payment_address: bool,
    ) -> Self {
        let accepted_payments = containers
            .iter()
            .map(|c| (c.id.clone(), c.accepted_payments.clone()))
            .collect();
        Self {
            factory: WalletFactory::new(factory_address, client.clone()),
            client,
            accepted_payments,
            has_payment_address,
        }
    }

    /// True only for wallets minted by the Infernet `WalletFactory`.
    pub async fn is_valid_wallet(&self, wallet: Address) -> Result<bool> {
        self.factory
            .is_valid_wallet(wallet)
            .call()
            .await
            .map_err(|e| eyre!("isValidWallet({wallet:?}) failed: {e}"))
    }

    /// Native or ERC-20 balance check against `amount`.
    pub async fn has_enough_balance(
        &self,
        wallet: Address,
        token: Address,
        amount: U256,
    ) -> Result<bool> {
        let balance = if token == Address::zero() {
            rpc::get_balance(self.client.as_ref(), wallet).await?
        } else {
            rpc::erc20_balance(self.client.clone(), wallet, token).await?
        };
        Ok(balance >= amount)
    }

    /// Whether the node is willing to execute this subscription given its
    /// payment offer and the containers' payment policies.
    pub fn matches_payment_requirements(&self, sub: &Subscription) -> bool {
        let matched = payment_requirements_met(
            &sub.containers,
            &self.accepted_payments,
            self.has_payment_address,
            sub.provides_payment(),
            sub.payment_token,
            sub.payment_amount,
        );
        if !matched {
            tracing::info!(
                subscription_id = sub.id,
                token = ?sub.payment_token,
                amount = %sub.payment_amount,
                "subscription does not match payment requirements"
            );
        }
        matched
    }
}

/// Pure policy core of `matches_payment_requirements`.
///
/// A container with an empty accepted-payments map takes any job, paid or
/// unpaid, and contributes nothing to the required minimum. A container
/// with a non-empty map requires payment in one of its listed tokens.
fn payment_requirements_met(
    containers: &[String],
    accepted: &HashMap<String, HashMap<Address, U256>>,
    has_payment_address: bool,
    provides_payment: bool,
    token: Address,
    amount: U256,
) -> bool {
    if !provides_payment {
        return containers
            .iter()
            .all(|c| accepted.get(c).map(|m| m.is_empty()).unwrap_or(true));
    }

    if !has_payment_address {
        return false;
    }

    let mut required = U256::zero();
    for container in containers {
        let Some(reqs) = accepted.get(container) else {
            continue;
        };
        if reqs.is_empty() {
            continue;
        }
        match reqs.get(&token) {
            Some(min) => required = required.saturating_add(*min),
            None => return false,
        }
    }
    amount >= required
}
