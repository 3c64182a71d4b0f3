use ethers::contract::abigen;
use ethers::providers::Middleware;
use ethers::types::Address;
use eyre::{eyre, Result};
use std::sync::Arc;

// Registry exposes the deployed addresses of the rest of the contract suite.
abigen!(
    Registry,
    r#"[
        function COORDINATOR() view returns (address)
        function READER() view returns (address)
        function WALLET_FACTORY() view returns (address)
    ]"#
);

/// Contract addresses discovered from the registry at startup.
#[derive(Debug, Clone, Copy)]
pub struct RegistryAddresses {
    pub coordinator: Address,
    pub reader: Address,
    pub wallet_factory: Address,
}

pub async fn resolve_registry<M: Middleware + 'static>(
    client: Arc<M>,
    registry_address: Address,
) -> Result<RegistryAddresses> {
    let registry = Registry::new(registry_address, client);

    let coordinator = registry
        .coordinator()
        .call()
        .await
        .map_err(|e| eyre!("registry COORDINATOR() failed: {e}"))?;
    let reader = registry
        .reader()
        .call()
        .await
        .map_err(|e| eyre!("registry READER() failed: {e}"))?;
    let wallet_factory = registry
        .wallet_factory()
        .call()
        .await
        .map_err(|e| eyre!("registry WALLET_FACTORY() failed: {e}"))?;

    tracing::info!(
        registry = ?registry_address,
        coordinator = ?coordinator,
        reader = ?reader,
        wallet_factory = ?wallet_factory,
        "resolved contract addresses"
    );

    Ok(RegistryAddresses {
        coordinator,
        reader,
        wallet_factory,
    })
}
