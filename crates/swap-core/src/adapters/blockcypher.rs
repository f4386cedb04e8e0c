//! # BlockCypher Provider
//!
//! REST client for the BlockCypher chain API. Schemas and normalizers are
//! kept separate from the HTTP calls, as in the Esplora provider.

use super::esplora::address_script_hex;
use super::http::{self, build_client};
use crate::domain::{FeeEstimates, MempoolStats, OutputSpend, ProviderError, Utxo};
use crate::ports::ChainProvider;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Response schemas
// =============================================================================

/// `GET /addrs/:a?unspentOnly=true`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BcAddress {
    /// Confirmed unspent references.
    #[serde(default)]
    pub txrefs: Vec<BcTxRef>,
    /// Mempool unspent references.
    #[serde(default)]
    pub unconfirmed_txrefs: Vec<BcTxRef>,
}

/// Output reference.
#[derive(Debug, Clone, Deserialize)]
pub struct BcTxRef {
    /// Transaction id.
    pub tx_hash: String,
    /// Output index.
    pub tx_output_n: i64,
    /// Value in satoshis.
    pub value: u64,
    /// Confirmations.
    #[serde(default)]
    pub confirmations: u32,
    /// Output script, hex (with `includeScript=true`).
    #[serde(default)]
    pub script: Option<String>,
}

/// `GET /txs/:id`.
#[derive(Debug, Clone, Deserialize)]
pub struct BcTx {
    /// Transaction id.
    pub hash: String,
    /// Raw hex (with `includeHex=true`).
    #[serde(default)]
    pub hex: Option<String>,
    /// Inputs.
    #[serde(default)]
    pub inputs: Vec<BcInput>,
    /// Outputs.
    #[serde(default)]
    pub outputs: Vec<BcOutput>,
}

/// Input of [`BcTx`].
#[derive(Debug, Clone, Deserialize)]
pub struct BcInput {
    /// Previous txid.
    #[serde(default)]
    pub prev_hash: Option<String>,
    /// Previous output index.
    #[serde(default)]
    pub output_index: i64,
    /// scriptSig hex.
    #[serde(default)]
    pub script: Option<String>,
    /// Witness items, hex.
    #[serde(default)]
    pub witness: Option<Vec<String>>,
}

/// Output of [`BcTx`].
#[derive(Debug, Clone, Deserialize)]
pub struct BcOutput {
    /// Spending txid, if spent.
    #[serde(default)]
    pub spent_by: Option<String>,
}

/// `GET /` chain summary.
#[derive(Debug, Clone, Deserialize)]
pub struct BcChain {
    /// Tip height.
    pub height: u32,
    /// Fee for fast confirmation, sat/kB.
    pub high_fee_per_kb: u64,
    /// Fee for medium confirmation, sat/kB.
    pub medium_fee_per_kb: u64,
    /// Fee for slow confirmation, sat/kB.
    pub low_fee_per_kb: u64,
    /// Mempool size.
    #[serde(default)]
    pub unconfirmed_count: u64,
}

#[derive(Debug, Serialize)]
struct BcPushRequest<'a> {
    tx: &'a str,
}

/// `POST /txs/push` response.
#[derive(Debug, Clone, Deserialize)]
pub struct BcPushResponse {
    /// Echoed transaction.
    pub tx: BcPushedTx,
}

/// Pushed transaction summary.
#[derive(Debug, Clone, Deserialize)]
pub struct BcPushedTx {
    /// Transaction id.
    pub hash: String,
}

// =============================================================================
// Normalization
// =============================================================================

/// Address view to canonical UTXOs, confirmed first.
pub fn normalize_utxos(raw: BcAddress, fallback_script: &str) -> Result<Vec<Utxo>, ProviderError> {
    raw.txrefs
        .into_iter()
        .chain(raw.unconfirmed_txrefs)
        .map(|r| {
            let vout = u32::try_from(r.tx_output_n)
                .map_err(|_| ProviderError::Decode(format!("txref {} is not an output", r.tx_hash)))?;
            Ok(Utxo {
                txid: r.tx_hash,
                vout,
                value: r.value,
                script_pubkey: r.script.unwrap_or_else(|| fallback_script.to_string()),
                confirmations: r.confirmations,
            })
        })
        .collect()
}

/// Fee-per-kB tiers to sat/vB estimates.
pub fn normalize_fee_estimates(chain: &BcChain) -> FeeEstimates {
    let per_vb = |per_kb: u64| (per_kb as f64 / 1_000.0).max(1.0);
    FeeEstimates {
        fastest: per_vb(chain.high_fee_per_kb),
        half_hour: per_vb(chain.medium_fee_per_kb),
        hour: per_vb(chain.low_fee_per_kb),
        economy: per_vb(chain.low_fee_per_kb),
    }
}

/// Locate the input of `spender` that consumes `txid:vout`.
pub fn normalize_spend(spender: &BcTx, txid: &str, vout: u32) -> Result<OutputSpend, ProviderError> {
    let (index, input) = spender
        .inputs
        .iter()
        .enumerate()
        .find(|(_, i)| i.prev_hash.as_deref() == Some(txid) && i.output_index == i64::from(vout))
        .ok_or_else(|| ProviderError::Decode(format!("{} does not spend {txid}:{vout}", spender.hash)))?;
    let witness = input
        .witness
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|item| hex::decode(item).map_err(|e| ProviderError::Decode(format!("witness: {e}"))))
        .collect::<Result<Vec<_>, _>>()?;
    let script_sig = match &input.script {
        Some(script) => hex::decode(script).map_err(|e| ProviderError::Decode(format!("script: {e}")))?,
        None => Vec::new(),
    };
    Ok(OutputSpend {
        txid: spender.hash.clone(),
        vin: index as u32,
        witness,
        script_sig,
    })
}

// =============================================================================
// Provider
// =============================================================================

/// BlockCypher REST provider.
pub struct BlockCypherProvider {
    name: String,
    base_url: String,
    client: Client,
}

impl BlockCypherProvider {
    /// Create a provider against a chain root (e.g. `https://api.blockcypher.com/v1/btc/test3`).
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: build_client(timeout)?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn chain(&self) -> Result<BcChain, ProviderError> {
        http::get_json(&self.client, &self.base_url).await
    }

    async fn tx(&self, txid: &str) -> Result<BcTx, ProviderError> {
        http::get_json(&self.client, &self.url(&format!("/txs/{txid}?includeHex=true&limit=500"))).await
    }
}

#[async_trait]
impl ChainProvider for BlockCypherProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>, ProviderError> {
        let fallback = address_script_hex(address)?;
        let raw: BcAddress = http::get_json(
            &self.client,
            &self.url(&format!("/addrs/{address}?unspentOnly=true&includeScript=true")),
        )
        .await?;
        debug!("[blockcypher] {} txrefs for {}", raw.txrefs.len() + raw.unconfirmed_txrefs.len(), address);
        normalize_utxos(raw, &fallback)
    }

    async fn get_transaction_hex(&self, txid: &str) -> Result<String, ProviderError> {
        self.tx(txid)
            .await?
            .hex
            .ok_or_else(|| ProviderError::Decode(format!("tx {txid} returned without hex")))
    }

    async fn get_output_spend(&self, txid: &str, vout: u32) -> Result<Option<OutputSpend>, ProviderError> {
        let funding = self.tx(txid).await?;
        let output = funding
            .outputs
            .get(vout as usize)
            .ok_or_else(|| ProviderError::Decode(format!("tx {txid} has no output {vout}")))?;
        let Some(spender) = output.spent_by.as_deref() else {
            return Ok(None);
        };
        let spender = self.tx(spender).await?;
        normalize_spend(&spender, txid, vout).map(Some)
    }

    async fn get_tip_height(&self) -> Result<u32, ProviderError> {
        Ok(self.chain().await?.height)
    }

    async fn get_fee_estimates(&self) -> Result<FeeEstimates, ProviderError> {
        Ok(normalize_fee_estimates(&self.chain().await?))
    }

    async fn get_mempool_stats(&self) -> Result<MempoolStats, ProviderError> {
        Ok(MempoolStats {
            count: self.chain().await?.unconfirmed_count,
            vsize: 0,
        })
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String, ProviderError> {
        let url = self.url("/txs/push");
        let request = self.client.post(&url).json(&BcPushRequest { tx: tx_hex });
        let body = http::post_broadcast(&url, request).await?;
        let pushed: BcPushResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::Decode(format!("push response: {e}")))?;
        Ok(pushed.tx.hash)
    }
}
