//! # Domain Errors
//!
//! Error types for the swap engine.
//!
//! `SwapError` is what every engine operation returns. `ProviderError` is
//! the narrower failure a single chain data provider reports; the network
//! gateway folds those into `SwapError` once rotation is exhausted.

use thiserror::Error;

/// Hash type (32-byte SHA-256).
pub type Hash = [u8; 32];

/// Secret type (32-byte preimage).
pub type Secret = [u8; 32];

/// Swap engine error types.
#[derive(Debug, Error)]
pub enum SwapError {
    /// Bad script, amount, key or timelock input. Caller bug, never retried.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Destination or change address does not parse for the configured network.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Inputs do not cover amount plus fee.
    #[error("Insufficient funds: required {required} sat, available {available} sat")]
    InsufficientFunds {
        /// Amount plus fee (and dust floor where relevant)
        required: u64,
        /// Sum of the selected inputs
        available: u64,
    },

    /// Every provider failed on every pass.
    #[error("Network exhausted: {operation} failed after {attempts} attempts (last error: {last_error})")]
    NetworkExhausted {
        /// Gateway operation name
        operation: String,
        /// Total provider attempts made
        attempts: u32,
        /// Last provider error observed
        last_error: String,
    },

    /// Block height could not be obtained. Fatal: no fallback height is ever guessed.
    #[error("Block height unavailable after {attempts} attempts (last error: {last_error})")]
    HeightUnavailable {
        /// Total provider attempts made
        attempts: u32,
        /// Last provider error observed
        last_error: String,
    },

    /// Script was already claimed or refunded.
    #[error("Script reuse refused: script {script_hash} was already redeemed")]
    ScriptReuse {
        /// Hex script hash
        script_hash: String,
    },

    /// Preimage does not hash to the hash-lock.
    #[error("Invalid secret: preimage does not match hash lock")]
    InvalidSecret,

    /// Refund attempted before the absolute timelock.
    #[error("Timelock not expired: current {current} < timelock {timelock}")]
    TimelockNotExpired {
        /// Current height or time
        current: u64,
        /// Configured timelock
        timelock: u64,
    },

    /// Claim attempted at or after the absolute timelock.
    #[error("Timelock expired: current {current} >= timelock {timelock}")]
    TimelockExpired {
        /// Current height or time
        current: u64,
        /// Configured timelock
        timelock: u64,
    },

    /// No provider accepted the transaction.
    #[error("Transaction broadcast failed after {attempts} attempts (last error: {last_error})")]
    TransactionBroadcastFailed {
        /// Provider attempts made
        attempts: u32,
        /// Every provider error, in attempt order
        errors: Vec<String>,
        /// Last provider error observed
        last_error: String,
    },

    /// Raw transaction id differs from the id the builder expected.
    #[error("Txid mismatch: expected {expected}, raw transaction has {actual}")]
    TxidMismatch {
        /// Expected txid
        expected: String,
        /// Txid of the raw transaction
        actual: String,
    },

    /// Derived fee rate above the sanity ceiling.
    #[error("Absurd fee: {rate:.2} sat/vB exceeds ceiling of {ceiling:.2} sat/vB")]
    AbsurdFee {
        /// Derived fee rate
        rate: f64,
        /// Configured ceiling
        ceiling: f64,
    },

    /// Outputs exceed inputs.
    #[error("Negative fee: inputs {inputs} sat < outputs {outputs} sat")]
    NegativeFee {
        /// Sum of inputs
        inputs: u64,
        /// Sum of outputs
        outputs: u64,
    },

    /// State machine transition not allowed.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Attempted state
        to: String,
    },

    /// Record lookup failed.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind
        kind: &'static str,
        /// Record id
        id: String,
    },

    /// Smart-contract-chain escrow call failed.
    #[error("Escrow error: {0}")]
    Escrow(String),

    /// Signing or post-signing script self-check failed.
    #[error("Signing error: {0}")]
    Signing(String),

    /// Persistence failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Alert sink rejected or did not answer.
    #[error("Alert delivery failed: {0}")]
    Alert(String),

    /// Operation stopped by shutdown.
    #[error("Operation cancelled")]
    Cancelled,
}

impl SwapError {
    /// Whether a caller-level retry (scheduler back-off) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkExhausted { .. }
                | Self::TransactionBroadcastFailed { .. }
                | Self::Escrow(_)
                | Self::Storage(_)
        )
    }

    /// Whether the condition must halt the affected swap.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HeightUnavailable { .. }
                | Self::ScriptReuse { .. }
                | Self::InvalidSecret
                | Self::TxidMismatch { .. }
                | Self::Signing(_)
        )
    }
}

/// Failure reported by a single chain data provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// No response within the per-call timeout.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// Non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    Http {
        /// Status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Connection-level failure.
    #[error("transport: {0}")]
    Transport(String),

    /// Payload did not match the provider's schema.
    #[error("decode: {0}")]
    Decode(String),

    /// Broadcast target already has this transaction.
    #[error("transaction already known")]
    AlreadyKnown,

    /// Transaction rejected by the provider's node.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Provider has no endpoint for this query.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_exhausted_error() {
        let err = SwapError::NetworkExhausted {
            operation: "get_utxos".to_string(),
            attempts: 9,
            last_error: "esplora: timed out after 100 ms".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("get_utxos"));
        assert!(msg.contains("9 attempts"));
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_height_unavailable_is_fatal() {
        let err = SwapError::HeightUnavailable {
            attempts: 12,
            last_error: "zero height".to_string(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_script_reuse_error() {
        let err = SwapError::ScriptReuse {
            script_hash: "ab".repeat(32),
        };
        assert!(err.to_string().contains("already redeemed"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_timelock_errors() {
        let err = SwapError::TimelockNotExpired {
            current: 100,
            timelock: 110,
        };
        assert!(err.to_string().contains("100 < timelock 110"));

        let err = SwapError::TimelockExpired {
            current: 110,
            timelock: 110,
        };
        assert!(err.to_string().contains("110 >= timelock 110"));
    }

    #[test]
    fn test_absurd_fee_error() {
        let err = SwapError::AbsurdFee {
            rate: 5000.0,
            ceiling: 1000.0,
        };
        assert!(err.to_string().contains("5000.00"));
    }

    #[test]
    fn test_insufficient_funds_error() {
        let err = SwapError::InsufficientFunds {
            required: 10_000,
            available: 500,
        };
        assert!(err.to_string().contains("10000"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_broadcast_failed_is_retryable() {
        let err = SwapError::TransactionBroadcastFailed {
            attempts: 2,
            errors: vec!["a: HTTP 500".into(), "b: HTTP 502".into()],
            last_error: "b: HTTP 502".into(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("b: HTTP 502"));
    }

    #[test]
    fn test_provider_error_display() {
        assert_eq!(ProviderError::Timeout(250).to_string(), "timed out after 250 ms");
        assert_eq!(
            ProviderError::AlreadyKnown.to_string(),
            "transaction already known"
        );
    }
}
