//! # Simulated Chain
//!
//! Deterministic in-process [`ChainProvider`] used by tests and by the
//! runtime's `simulated` provider kind. Height, UTXOs and spends are
//! scriptable; failures, zero heights and latency can be injected; every
//! call is counted.
//!
//! Broadcast decodes the transaction, enforces `nLockTime` finality against
//! the current height, rejects double spends, records each spent input's
//! witness and adds the new outputs as mempool UTXOs.

use super::esplora::address_script_hex;
use crate::algorithms::transaction::decode_hex;
use crate::domain::{FeeEstimates, MempoolStats, OutputSpend, ProviderError, Utxo};
use crate::ports::ChainProvider;
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;

type OutPointKey = (String, u32);

struct ChainState {
    height: u32,
    utxos: HashMap<OutPointKey, Utxo>,
    transactions: HashMap<String, String>,
    spends: HashMap<OutPointKey, OutputSpend>,
    broadcasts: Vec<String>,
    fees: FeeEstimates,
    mempool_count: u64,
    failing: bool,
    fail_next: u32,
    report_zero_height: bool,
    broadcast_error: Option<ProviderError>,
    latency: Option<Duration>,
    funded: u64,
}

/// Scriptable in-memory chain.
pub struct SimulatedChain {
    name: String,
    state: Mutex<ChainState>,
    calls: AtomicU32,
}

impl SimulatedChain {
    /// New chain at `height` with moderate fees and an empty mempool.
    pub fn new(name: impl Into<String>, height: u32) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ChainState {
                height,
                utxos: HashMap::new(),
                transactions: HashMap::new(),
                spends: HashMap::new(),
                broadcasts: Vec::new(),
                fees: FeeEstimates {
                    fastest: 20.0,
                    half_hour: 10.0,
                    hour: 5.0,
                    economy: 1.0,
                },
                mempool_count: 0,
                failing: false,
                fail_next: 0,
                report_zero_height: false,
                broadcast_error: None,
                latency: None,
                funded: 0,
            }),
            calls: AtomicU32::new(0),
        }
    }

    /// Current tip.
    pub fn height(&self) -> u32 {
        self.state.lock().height
    }

    /// Set the tip.
    pub fn set_height(&self, height: u32) {
        self.state.lock().height = height;
    }

    /// Mine `blocks` blocks; every UTXO gains that many confirmations.
    pub fn advance(&self, blocks: u32) {
        let mut state = self.state.lock();
        state.height += blocks;
        for utxo in state.utxos.values_mut() {
            utxo.confirmations += blocks;
        }
    }

    /// Insert a UTXO directly.
    pub fn add_utxo(&self, utxo: Utxo) {
        self.state
            .lock()
            .utxos
            .insert((utxo.txid.clone(), utxo.vout), utxo);
    }

    /// Create a confirmed UTXO paying `value` to `address`.
    pub fn fund_address(&self, address: &str, value: u64, confirmations: u32) -> Result<Utxo, ProviderError> {
        let script_pubkey = address_script_hex(address)?;
        let mut state = self.state.lock();
        state.funded += 1;
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(state.funded.to_le_bytes());
        let utxo = Utxo {
            txid: hex::encode(hasher.finalize()),
            vout: 0,
            value,
            script_pubkey,
            confirmations,
        };
        state.utxos.insert((utxo.txid.clone(), 0), utxo.clone());
        Ok(utxo)
    }

    /// Record a spend of `txid:vout` made outside this process.
    pub fn record_spend(&self, txid: &str, vout: u32, spend: OutputSpend) {
        let mut state = self.state.lock();
        let key = (txid.to_string(), vout);
        state.utxos.remove(&key);
        state.spends.insert(key, spend);
    }

    /// Make every call fail (or recover).
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    /// Fail the next `n` calls, then recover.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().fail_next = n;
    }

    /// Report a tip height of zero.
    pub fn set_zero_height(&self, zero: bool) {
        self.state.lock().report_zero_height = zero;
    }

    /// Force every broadcast to return `error`.
    pub fn set_broadcast_error(&self, error: Option<ProviderError>) {
        self.state.lock().broadcast_error = error;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    /// Mempool size reported by `get_mempool_stats`.
    pub fn set_mempool_count(&self, count: u64) {
        self.state.lock().mempool_count = count;
    }

    /// Fee estimates reported by `get_fee_estimates`.
    pub fn set_fees(&self, fees: FeeEstimates) {
        self.state.lock().fees = fees;
    }

    /// Calls made so far.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Txids accepted by `broadcast`, in order.
    pub fn broadcasts(&self) -> Vec<String> {
        self.state.lock().broadcasts.clone()
    }

    /// Spend recorded for `txid:vout`.
    pub fn spend_of(&self, txid: &str, vout: u32) -> Option<OutputSpend> {
        self.state.lock().spends.get(&(txid.to_string(), vout)).cloned()
    }

    async fn enter(&self) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        if state.failing {
            return Err(ProviderError::Transport(format!("{} unavailable", self.name)));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(ProviderError::Http {
                status: 503,
                body: "service unavailable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChainProvider for SimulatedChain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>, ProviderError> {
        self.enter().await?;
        let script_pubkey = address_script_hex(address)?;
        let state = self.state.lock();
        let mut utxos: Vec<Utxo> = state
            .utxos
            .values()
            .filter(|u| u.script_pubkey == script_pubkey)
            .cloned()
            .collect();
        utxos.sort_by(|a, b| (&a.txid, a.vout).cmp(&(&b.txid, b.vout)));
        Ok(utxos)
    }

    async fn get_transaction_hex(&self, txid: &str) -> Result<String, ProviderError> {
        self.enter().await?;
        self.state
            .lock()
            .transactions
            .get(txid)
            .cloned()
            .ok_or_else(|| ProviderError::Http {
                status: 404,
                body: "Transaction not found".into(),
            })
    }

    async fn get_output_spend(&self, txid: &str, vout: u32) -> Result<Option<OutputSpend>, ProviderError> {
        self.enter().await?;
        Ok(self.spend_of(txid, vout))
    }

    async fn get_tip_height(&self) -> Result<u32, ProviderError> {
        self.enter().await?;
        let state = self.state.lock();
        Ok(if state.report_zero_height { 0 } else { state.height })
    }

    async fn get_fee_estimates(&self) -> Result<FeeEstimates, ProviderError> {
        self.enter().await?;
        Ok(self.state.lock().fees)
    }

    async fn get_mempool_stats(&self) -> Result<MempoolStats, ProviderError> {
        self.enter().await?;
        Ok(MempoolStats {
            count: self.state.lock().mempool_count,
            vsize: 0,
        })
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String, ProviderError> {
        self.enter().await?;
        let tx = decode_hex(tx_hex).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let txid = tx.compute_txid().to_string();

        let mut state = self.state.lock();
        if let Some(error) = state.broadcast_error.clone() {
            return Err(error);
        }
        if state.transactions.contains_key(&txid) {
            return Err(ProviderError::AlreadyKnown);
        }
        if let LockTime::Blocks(height) = tx.lock_time {
            if tx.is_lock_time_enabled() && height.to_consensus_u32() > state.height {
                return Err(ProviderError::Rejected("non-final".into()));
            }
        }
        for input in &tx.input {
            let key = (input.previous_output.txid.to_string(), input.previous_output.vout);
            if state.spends.contains_key(&key) {
                return Err(ProviderError::Rejected("bad-txns-inputs-missingorspent".into()));
            }
        }

        for (vin, input) in tx.input.iter().enumerate() {
            let key = (input.previous_output.txid.to_string(), input.previous_output.vout);
            state.utxos.remove(&key);
            state.spends.insert(
                key,
                OutputSpend {
                    txid: txid.clone(),
                    vin: vin as u32,
                    witness: input.witness.to_vec(),
                    script_sig: input.script_sig.to_bytes(),
                },
            );
        }
        for (vout, output) in tx.output.iter().enumerate() {
            let utxo = Utxo {
                txid: txid.clone(),
                vout: vout as u32,
                value: output.value.to_sat(),
                script_pubkey: hex::encode(output.script_pubkey.as_bytes()),
                confirmations: 0,
            };
            state.utxos.insert((txid.clone(), vout as u32), utxo);
        }
        state.transactions.insert(txid.clone(), tx_hex.to_string());
        state.broadcasts.push(txid.clone());
        debug!("[{}] accepted {}", self.name, txid);
        Ok(txid)
    }
}
