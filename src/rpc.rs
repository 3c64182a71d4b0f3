use ethers::abi::Token;
use ethers::contract::abigen;
use ethers::providers::Middleware;
use ethers::types::{Address, H256, U256};
use ethers::utils::{keccak256, to_checksum};
use eyre::{eyre, Result};
use std::time::Duration;

// Minimal ERC20 ABI for balance probes.
abigen!(
    Erc20,
    r#"[
        function balanceOf(address owner) view returns (uint256)
    ]"#
);

/// Strict address validation: either all-lowercase hex or an exact EIP-55
/// checksummed string. Mixed case with a bad checksum is rejected.
pub fn is_valid_address(raw: &str) -> bool {
    let Ok(addr) = raw.parse::<Address>() else {
        return false;
    };
    let hex_part = raw.strip_prefix("0x").unwrap_or(raw);
    if hex_part.chars().all(|c| !c.is_ascii_uppercase()) {
        return true;
    }
    to_checksum(&addr, None) == format!("0x{hex_part}")
}

/// Parses and EIP-55-normalizes an address string.
pub fn get_checksum_address(raw: &str) -> Result<Address> {
    if !is_valid_address(raw) {
        return Err(eyre!("invalid address '{raw}'"));
    }
    raw.parse::<Address>()
        .map_err(|e| eyre!("invalid address '{raw}': {e}"))
}

/// `keccak256(abi.encode(values))`, matching the coordinator's mapping keys.
pub fn keccak_encoded(tokens: &[Token]) -> H256 {
    H256::from(keccak256(ethers::abi::encode(tokens)))
}

pub async fn head_block_number<M: Middleware>(client: &M) -> Result<u64> {
    let head = client
        .get_block_number()
        .await
        .map_err(|e| eyre!("failed to read head block number: {e}"))?;
    Ok(head.as_u64())
}

/// Reads a receipt once. `(found, success)`; any error (including
/// receipt-not-found) collapses into `(false, false)`.
pub async fn get_tx_success<M: Middleware>(client: &M, tx: H256) -> (bool, bool) {
    match client.get_transaction_receipt(tx).await {
        Ok(Some(receipt)) => {
            let success = receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false);
            (true, success)
        }
        Ok(None) => (false, false),
        Err(err) => {
            tracing::debug!(tx = ?tx, error = %err, "receipt probe failed");
            (false, false)
        }
    }
}

/// Polls the receipt up to `retries` times, returning on the first sighting.
pub async fn get_tx_success_with_retries<M: Middleware>(
    client: &M,
    tx: H256,
    retries: u32,
    sleep: Duration,
) -> (bool, bool) {
    for attempt in 0..retries {
        let (found, success) = get_tx_success(client, tx).await;
        if found {
            return (true, success);
        }
        if attempt + 1 < retries {
            tokio::time::sleep(sleep).await;
        }
    }
    (false, false)
}

/// Native balance.
pub async fn get_balance<M: Middleware>(client: &M, address: Address) -> Result<U256> {
    client
        .get_balance(address, None)
        .await
        .map_err(|e| eyre!("failed to read balance of {address:?}: {e}"))
}

/// ERC-20 balance via `balanceOf`.
pub async fn erc20_balance<M: Middleware + 'static>(
    client: std::sync::Arc<M>,
    address: Address,
    token: Address,
) -> Result<U256> {
    let erc20 = Erc20::new(token, client);
    erc20
        .balance_of(address)
        .call()
        .await
        .map_err(|e| eyre!("balanceOf({address:?}) on token {token:?} failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Canonical EIP-55 test vector.
    const CHECKSUMMED: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    #[test]
    fn accepts_checksummed_and_lowercase() {
        assert!(is_valid_address(CHECKSUMMED));
        assert!(is_valid_address(&CHECKSUMMED.to_lowercase()));
    }

    #[test]
    fn rejects_bad_checksum_and_garbage() {
        // flip the case of one checksummed character
        let bad = CHECKSUMMED.replace("aA", "Aa");
        assert!(!is_valid_address(&bad));
        assert!(!is_valid_address("0x1234"));
        assert!(!is_valid_address("not-an-address"));
    }

    #[test]
    fn checksum_address_parses_valid_input() {
        let addr = get_checksum_address(CHECKSUMMED).unwrap();
        assert_eq!(to_checksum(&addr, None), CHECKSUMMED);
        assert!(get_checksum_address("0xZZ").is_err());
    }

    #[test]
    fn keccak_matches_coordinator_key_scheme() {
        // key for (id=1, interval=2) must differ from (id=2, interval=1)
        let a = keccak_encoded(&[Token::Uint(1u32.into()), Token::Uint(2u32.into())]);
        let b = keccak_encoded(&[Token::Uint(2u32.into()), Token::Uint(1u32.into())]);
        assert_ne!(a, b);

        // stable across calls
        assert_eq!(
            a,
            keccak_encoded(&[Token::Uint(1u32.into()), Token::Uint(2u32.into())])
        );
    }
}
