//! # In-Memory Escrow
//!
//! [`EscrowContract`] backed by a map, with a settable clock and an outage
//! switch. Enforces the same rules the on-chain escrow does: execute needs
//! the preimage before the deadline, refund needs the deadline to have
//! passed, and each escrow settles once.

use crate::algorithms::SecretVault;
use crate::domain::{unix_now, SecureSecret, SwapError};
use crate::ports::{EscrowContract, EscrowInfo, EscrowParams};
use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, info};

#[derive(Clone, Debug)]
struct EscrowRecord {
    params: EscrowParams,
    state: EscrowInternalState,
    revealed: Option<SecureSecret>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EscrowInternalState {
    Locked,
    Executed,
    Refunded,
}

/// In-memory escrow contract.
pub struct InMemoryEscrow {
    escrows: RwLock<HashMap<String, EscrowRecord>>,
    current_time: RwLock<u64>,
    unavailable: AtomicBool,
    nonce: AtomicU32,
    executions: AtomicU32,
}

impl InMemoryEscrow {
    /// New contract whose clock starts at wall-clock time.
    pub fn new() -> Self {
        Self {
            escrows: RwLock::new(HashMap::new()),
            current_time: RwLock::new(unix_now()),
            unavailable: AtomicBool::new(false),
            nonce: AtomicU32::new(0),
            executions: AtomicU32::new(0),
        }
    }

    /// Set the contract clock.
    pub fn set_time(&self, time: u64) {
        *self.current_time.write() = time;
    }

    /// Advance the contract clock.
    pub fn advance_time(&self, secs: u64) {
        *self.current_time.write() += secs;
    }

    /// Contract clock.
    pub fn now(&self) -> u64 {
        *self.current_time.read()
    }

    /// Make every call fail with a retryable error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Successful `execute_with_secret` calls.
    pub fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }

    /// Preimage published by an executed escrow.
    pub fn revealed_secret(&self, escrow_id: &str) -> Option<SecureSecret> {
        self.escrows.read().get(escrow_id)?.revealed.clone()
    }

    fn check_available(&self) -> Result<(), SwapError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SwapError::Escrow("contract endpoint unavailable".into()));
        }
        Ok(())
    }

    fn not_found(escrow_id: &str) -> SwapError {
        SwapError::NotFound {
            kind: "Escrow",
            id: escrow_id.to_string(),
        }
    }
}

impl Default for InMemoryEscrow {
    fn default() -> Self {
        Self::new()
    }
}

fn call_reference(escrow_id: &str, action: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(escrow_id.as_bytes());
    hasher.update(action.as_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

#[async_trait]
impl EscrowContract for InMemoryEscrow {
    async fn create_escrow(&self, params: EscrowParams) -> Result<String, SwapError> {
        self.check_available()?;
        if params.amount == 0 {
            return Err(SwapError::InvalidParameter("escrow amount must be positive".into()));
        }
        let now = self.now();
        if params.timelock <= now {
            return Err(SwapError::InvalidParameter(format!(
                "escrow deadline {} is not in the future (now {now})",
                params.timelock
            )));
        }

        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let mut hasher = Sha256::new();
        hasher.update(params.hash_lock);
        hasher.update(params.timelock.to_le_bytes());
        hasher.update(params.amount.to_le_bytes());
        hasher.update(params.resolver.as_bytes());
        hasher.update(nonce.to_le_bytes());
        let id = format!("0x{}", hex::encode(hasher.finalize()));

        info!("[escrow] created {} for {} {}", id, params.amount, params.from_asset);
        self.escrows.write().insert(
            id.clone(),
            EscrowRecord {
                params,
                state: EscrowInternalState::Locked,
                revealed: None,
            },
        );
        Ok(id)
    }

    async fn execute_with_secret(&self, escrow_id: &str, secret: &SecureSecret) -> Result<String, SwapError> {
        self.check_available()?;
        let now = self.now();
        let mut escrows = self.escrows.write();
        let record = escrows.get_mut(escrow_id).ok_or_else(|| Self::not_found(escrow_id))?;

        if record.state != EscrowInternalState::Locked {
            return Err(SwapError::Escrow(format!("escrow {escrow_id} already settled")));
        }
        if now >= record.params.timelock {
            return Err(SwapError::TimelockExpired {
                current: now,
                timelock: record.params.timelock,
            });
        }
        if !SecretVault::validate(secret.as_bytes(), &record.params.hash_lock) {
            return Err(SwapError::InvalidSecret);
        }

        record.state = EscrowInternalState::Executed;
        record.revealed = Some(secret.clone());
        self.executions.fetch_add(1, Ordering::SeqCst);
        info!("[escrow] executed {}", escrow_id);
        Ok(call_reference(escrow_id, "execute"))
    }

    async fn refund(&self, escrow_id: &str) -> Result<String, SwapError> {
        self.check_available()?;
        let now = self.now();
        let mut escrows = self.escrows.write();
        let record = escrows.get_mut(escrow_id).ok_or_else(|| Self::not_found(escrow_id))?;

        if record.state != EscrowInternalState::Locked {
            return Err(SwapError::Escrow(format!("escrow {escrow_id} already settled")));
        }
        if now < record.params.timelock {
            return Err(SwapError::TimelockNotExpired {
                current: now,
                timelock: record.params.timelock,
            });
        }

        record.state = EscrowInternalState::Refunded;
        info!("[escrow] refunded {}", escrow_id);
        Ok(call_reference(escrow_id, "refund"))
    }

    async fn get_escrow(&self, escrow_id: &str) -> Result<EscrowInfo, SwapError> {
        self.check_available()?;
        let escrows = self.escrows.read();
        let record = escrows.get(escrow_id).ok_or_else(|| Self::not_found(escrow_id))?;
        debug!("[escrow] get {} -> {:?}", escrow_id, record.state);
        Ok(EscrowInfo {
            id: escrow_id.to_string(),
            executed: record.state == EscrowInternalState::Executed,
            refunded: record.state == EscrowInternalState::Refunded,
            hash_lock: record.params.hash_lock,
            timelock: record.params.timelock,
            amount: record.params.amount,
            resolver: record.params.resolver.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(hash_lock: [u8; 32], timelock: u64) -> EscrowParams {
        EscrowParams {
            resolver: "0xresolver".into(),
            from_asset: "ETH".into(),
            to_asset: "BTC".into(),
            amount: 1_000,
            expected_amount: 50_000,
            hash_lock,
            timelock,
        }
    }

    #[tokio::test]
    async fn test_execute_with_secret() {
        let escrow = InMemoryEscrow::new();
        escrow.set_time(1_000);
        let (secret, hash) = SecretVault::generate();
        let id = escrow.create_escrow(params(hash, 2_000)).await.unwrap();

        let wrong = SecureSecret::new([9u8; 32]);
        assert!(matches!(
            escrow.execute_with_secret(&id, &wrong).await,
            Err(SwapError::InvalidSecret)
        ));

        escrow.execute_with_secret(&id, &secret).await.unwrap();
        let info = escrow.get_escrow(&id).await.unwrap();
        assert!(info.executed);
        assert_eq!(escrow.revealed_secret(&id), Some(secret.clone()));
        assert!(escrow.execute_with_secret(&id, &secret).await.is_err());
    }

    #[tokio::test]
    async fn test_refund_only_after_deadline() {
        let escrow = InMemoryEscrow::new();
        escrow.set_time(1_000);
        let id = escrow.create_escrow(params([1; 32], 2_000)).await.unwrap();

        assert!(matches!(
            escrow.refund(&id).await,
            Err(SwapError::TimelockNotExpired { current: 1_000, timelock: 2_000 })
        ));
        escrow.advance_time(1_000);
        escrow.refund(&id).await.unwrap();
        assert!(escrow.get_escrow(&id).await.unwrap().refunded);
    }

    #[tokio::test]
    async fn test_execute_after_deadline_fails() {
        let escrow = InMemoryEscrow::new();
        escrow.set_time(1_000);
        let (secret, hash) = SecretVault::generate();
        let id = escrow.create_escrow(params(hash, 1_500)).await.unwrap();
        escrow.set_time(1_500);
        assert!(matches!(
            escrow.execute_with_secret(&id, &secret).await,
            Err(SwapError::TimelockExpired { .. })
        ));
    }

    #[tokio::test]
    async fn test_outage_is_retryable() {
        let escrow = InMemoryEscrow::new();
        escrow.set_unavailable(true);
        let err = escrow.get_escrow("x").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
