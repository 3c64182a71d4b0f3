use ethers::utils::keccak256;
use thiserror::Error;

/// Custom errors raised by the Infernet coordinator and its wallet suite,
/// identified on the wire by their 4-byte selectors.
///
/// Simulation surfaces these as revert data embedded in the provider error
/// string; we match on the hex-encoded selector rather than decoding the
/// full error, since none of them carry arguments.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InfernetError {
    #[error("Invalid wallet, please make sure you're using a wallet created from Infernet's `WalletFactory`.")]
    InvalidWallet,
    #[error("Interval mismatch. The interval is invalid.")]
    IntervalMismatch,
    #[error("Interval completed. Redundancy has been met for the current interval.")]
    IntervalCompleted,
    #[error("Caller is not the authorized verifier of the proof.")]
    UnauthorizedVerifier,
    #[error("Node has already responded for this interval.")]
    NodeRespondedAlready,
    #[error("Subscription not found.")]
    SubscriptionNotFound,
    #[error("Proof request not found.")]
    ProofRequestNotFound,
    #[error("Caller is not the owner of the subscription.")]
    NotSubscriptionOwner,
    #[error("Subscription is already completed, another node has likely already delivered the response.")]
    SubscriptionCompleted,
    #[error("Subscription is not active.")]
    SubscriptionNotActive,
    #[error("Unsupported verifier token. Attempting to pay a verifier in an unsupported token.")]
    UnsupportedVerifierToken,
    #[error("Signer mismatch.")]
    SignerMismatch,
    #[error("Signature expired.")]
    SignatureExpired,
    #[error("Token transfer failed.")]
    TransferFailed,
    #[error("Insufficient funds. You either are trying to withdraw `amount > unlockedBalance` or are trying to escrow `amount > unlockedBalance` or attempting to unlock `amount > lockedBalance`.")]
    InsufficientFunds,
    #[error("Insufficient allowance.")]
    InsufficientAllowance,
    #[error("Node is not allowed to deliver this subscription.")]
    NodeNotAllowed,
    #[error("Insufficient balance.")]
    InsufficientBalance,
}

impl InfernetError {
    pub const ALL: [InfernetError; 18] = [
        InfernetError::InvalidWallet,
        InfernetError::IntervalMismatch,
        InfernetError::IntervalCompleted,
        InfernetError::UnauthorizedVerifier,
        InfernetError::NodeRespondedAlready,
        InfernetError::SubscriptionNotFound,
        InfernetError::ProofRequestNotFound,
        InfernetError::NotSubscriptionOwner,
        InfernetError::SubscriptionCompleted,
        InfernetError::SubscriptionNotActive,
        InfernetError::UnsupportedVerifierToken,
        InfernetError::SignerMismatch,
        InfernetError::SignatureExpired,
        InfernetError::TransferFailed,
        InfernetError::InsufficientFunds,
        InfernetError::InsufficientAllowance,
        InfernetError::NodeNotAllowed,
        InfernetError::InsufficientBalance,
    ];

    /// Solidity error signature, e.g. `NodeRespondedAlready()`.
    pub fn signature(&self) -> &'static str {
        match self {
            InfernetError::InvalidWallet => "InvalidWallet()",
            InfernetError::IntervalMismatch => "IntervalMismatch()",
            InfernetError::IntervalCompleted => "IntervalCompleted()",
            InfernetError::UnauthorizedVerifier => "UnauthorizedVerifier()",
            InfernetError::NodeRespondedAlready => "NodeRespondedAlready()",
            InfernetError::SubscriptionNotFound => "SubscriptionNotFound()",
            InfernetError::ProofRequestNotFound => "ProofRequestNotFound()",
            InfernetError::NotSubscriptionOwner => "NotSubscriptionOwner()",
            InfernetError::SubscriptionCompleted => "SubscriptionCompleted()",
            InfernetError::SubscriptionNotActive => "SubscriptionNotActive()",
            InfernetError::UnsupportedVerifierToken => "UnsupportedVerifierToken()",
            InfernetError::SignerMismatch => "SignerMismatch()",
            InfernetError::SignatureExpired => "SignatureExpired()",
            InfernetError::TransferFailed => "TransferFailed()",
            InfernetError::InsufficientFunds => "InsufficientFunds()",
            InfernetError::InsufficientAllowance => "InsufficientAllowance()",
            InfernetError::NodeNotAllowed => "NodeNotAllowed()",
            InfernetError::InsufficientBalance => "InsufficientBalance()",
        }
    }

    /// First 4 bytes of `keccak256(signature)`.
    pub fn selector(&self) -> [u8; 4] {
        let hash = keccak256(self.signature().as_bytes());
        [hash[0], hash[1], hash[2], hash[3]]
    }

    /// Lowercase hex selector without `0x`, as it appears inside provider
    /// revert strings.
    pub fn selector_hex(&self) -> String {
        hex::encode(self.selector())
    }

    /// Errors that are normal races between redundant nodes. These log at
    /// info; everything else logs at error.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            InfernetError::NodeRespondedAlready
                | InfernetError::SubscriptionCompleted
                | InfernetError::IntervalCompleted
        )
    }

    /// Scans a provider/contract error string for any known selector.
    ///
    /// Revert data shows up hex-encoded (with or without `0x`) inside the
    /// display of ethers' `ContractError`, so a substring match on the
    /// selector hex is sufficient and avoids fragile decoding.
    pub fn from_error_str(raw: &str) -> Option<InfernetError> {
        let lowered = raw.to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|e| lowered.contains(&e.selector_hex()))
    }

    /// Logs the error at the level its category demands, tagged with the
    /// subscription id it concerns.
    pub fn log(&self, sub_id: i64) {
        if self.is_benign() {
            tracing::info!(subscription_id = sub_id, "{self}");
        } else {
            tracing::error!(subscription_id = sub_id, "{self}");
        }
    }
}

/// Substring match (case-insensitive) of a revert message against the
/// operator-configured allow list. A hit means "simulation passed, but gas
/// estimation is invalid": the submission must carry an explicit gas limit.
pub fn matches_allowed_sim_errors(raw: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return false;
    }
    let lowered = raw.to_lowercase();
    allowed
        .iter()
        .any(|pat| !pat.is_empty() && lowered.contains(&pat.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_are_four_bytes_and_distinct() {
        let mut seen = std::collections::HashSet::new();
        for err in InfernetError::ALL {
            assert!(seen.insert(err.selector()), "duplicate selector for {err:?}");
        }
        assert_eq!(seen.len(), 18);
    }

    #[test]
    fn finds_selector_inside_error_string() {
        let sel = InfernetError::NodeRespondedAlready.selector_hex();
        let raw = format!("Contract call reverted with data: 0x{sel}");
        assert_eq!(
            InfernetError::from_error_str(&raw),
            Some(InfernetError::NodeRespondedAlready)
        );
    }

    #[test]
    fn unknown_revert_matches_nothing() {
        assert_eq!(InfernetError::from_error_str("execution reverted: 0xdeadbeef"), None);
    }

    #[test]
    fn benign_set_is_exactly_three() {
        let benign: Vec<_> = InfernetError::ALL.iter().filter(|e| e.is_benign()).collect();
        assert_eq!(benign.len(), 3);
    }

    #[test]
    fn allowed_sim_errors_match_is_case_insensitive() {
        let allowed = vec!["out of gas".to_string()];
        assert!(matches_allowed_sim_errors("Execution Reverted: Out Of Gas", &allowed));
        assert!(!matches_allowed_sim_errors("nonce too low", &allowed));
        assert!(!matches_allowed_sim_errors("anything", &[]));
    }
}
