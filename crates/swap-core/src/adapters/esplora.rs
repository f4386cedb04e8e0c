//! # Esplora Provider
//!
//! REST client for Esplora-style block explorers. Every response has an
//! explicit schema below and a pure `normalize_*` function turning it into
//! the canonical shape, so normalization is tested on JSON fixtures without
//! a network.

use super::http::{self, build_client};
use crate::domain::{FeeEstimates, MempoolStats, OutputSpend, ProviderError, Utxo};
use crate::ports::ChainProvider;
use async_trait::async_trait;
use bitcoin::address::NetworkUnchecked;
use bitcoin::Address;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Response schemas
// =============================================================================

/// `GET /address/:a/utxo` item.
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraUtxo {
    /// Transaction id.
    pub txid: String,
    /// Output index.
    pub vout: u32,
    /// Value in satoshis.
    pub value: u64,
    /// Confirmation status.
    pub status: EsploraStatus,
}

/// Confirmation status block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EsploraStatus {
    /// Mined.
    pub confirmed: bool,
    /// Height when mined.
    #[serde(default)]
    pub block_height: Option<u32>,
}

/// `GET /tx/:id/outspend/:vout`.
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraOutspend {
    /// Output has been spent.
    pub spent: bool,
    /// Spending txid.
    #[serde(default)]
    pub txid: Option<String>,
    /// Input index in the spending tx.
    #[serde(default)]
    pub vin: Option<u32>,
}

/// `GET /tx/:id` (only the fields read here).
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraTx {
    /// Transaction id.
    pub txid: String,
    /// Inputs.
    pub vin: Vec<EsploraVin>,
}

/// Input of [`EsploraTx`].
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraVin {
    /// Witness items, hex.
    #[serde(default)]
    pub witness: Option<Vec<String>>,
    /// scriptSig, hex.
    #[serde(default)]
    pub scriptsig: String,
}

/// `GET /mempool`.
#[derive(Debug, Clone, Deserialize)]
pub struct EsploraMempool {
    /// Unconfirmed transaction count.
    pub count: u64,
    /// Total vsize.
    #[serde(default)]
    pub vsize: u64,
}

// =============================================================================
// Normalization
// =============================================================================

/// Esplora UTXOs to canonical UTXOs. Confirmations are derived from the tip.
pub fn normalize_utxos(raw: Vec<EsploraUtxo>, tip: u32, script_pubkey: &str) -> Vec<Utxo> {
    raw.into_iter()
        .map(|u| {
            let confirmations = match (u.status.confirmed, u.status.block_height) {
                (true, Some(h)) if tip >= h => tip - h + 1,
                (true, _) => 1,
                (false, _) => 0,
            };
            Utxo {
                txid: u.txid,
                vout: u.vout,
                value: u.value,
                script_pubkey: script_pubkey.to_string(),
                confirmations,
            }
        })
        .collect()
}

/// Outspend plus spending tx to a canonical spend.
pub fn normalize_outspend(outspend: &EsploraOutspend, spender: Option<&EsploraTx>) -> Result<Option<OutputSpend>, ProviderError> {
    if !outspend.spent {
        return Ok(None);
    }
    let (Some(txid), Some(vin)) = (outspend.txid.as_ref(), outspend.vin) else {
        return Err(ProviderError::Decode("spent outspend without txid/vin".into()));
    };
    let tx = spender.ok_or_else(|| ProviderError::Decode(format!("spending tx {txid} missing")))?;
    let input = tx
        .vin
        .get(vin as usize)
        .ok_or_else(|| ProviderError::Decode(format!("spending tx {txid} has no input {vin}")))?;
    let witness = input
        .witness
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|item| hex::decode(item).map_err(|e| ProviderError::Decode(format!("witness: {e}"))))
        .collect::<Result<Vec<_>, _>>()?;
    let script_sig = hex::decode(&input.scriptsig).map_err(|e| ProviderError::Decode(format!("scriptsig: {e}")))?;
    Ok(Some(OutputSpend {
        txid: txid.clone(),
        vin,
        witness,
        script_sig,
    }))
}

/// Confirmation-target map (`"1"`, `"3"`, `"6"`, `"144"`, ...) to estimates.
///
/// A missing target falls back to the closest faster target.
pub fn normalize_fee_estimates(raw: &HashMap<String, f64>) -> Result<FeeEstimates, ProviderError> {
    let mut targets: Vec<(u32, f64)> = raw
        .iter()
        .filter_map(|(k, v)| Some((k.parse::<u32>().ok()?, *v)))
        .filter(|(_, v)| v.is_finite() && *v > 0.0)
        .collect();
    if targets.is_empty() {
        return Err(ProviderError::Decode("empty fee-estimates".into()));
    }
    targets.sort_by_key(|(target, _)| *target);
    let at = |wanted: u32| {
        targets
            .iter()
            .take_while(|(t, _)| *t <= wanted)
            .last()
            .or_else(|| targets.first())
            .map(|(_, rate)| *rate)
            .unwrap_or(1.0)
    };
    Ok(FeeEstimates {
        fastest: at(1),
        half_hour: at(3),
        hour: at(6),
        economy: at(144),
    })
}

/// Tip height body to a number.
pub fn normalize_height(body: &str) -> Result<u32, ProviderError> {
    body.trim()
        .parse::<u32>()
        .map_err(|e| ProviderError::Decode(format!("tip height {body:?}: {e}")))
}

/// Output script (hex) an address pays to.
pub(crate) fn address_script_hex(address: &str) -> Result<String, ProviderError> {
    let address = address
        .parse::<Address<NetworkUnchecked>>()
        .map_err(|e| ProviderError::Decode(format!("address {address}: {e}")))?
        .assume_checked();
    Ok(hex::encode(address.script_pubkey().as_bytes()))
}

// =============================================================================
// Provider
// =============================================================================

/// Esplora REST provider.
pub struct EsploraProvider {
    name: String,
    base_url: String,
    client: Client,
}

impl EsploraProvider {
    /// Create a provider against `base_url` (e.g. `https://blockstream.info/testnet/api`).
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
}

#[async_trait]
impl ChainProvider for EsploraProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>, ProviderError> {
        let script_pubkey = address_script_hex(address)?;
        let raw: Vec<EsploraUtxo> = http::get_json(&self.client, &self.url(&format!("/address/{address}/utxo"))).await?;
        let tip = if raw.iter().any(|u| u.status.confirmed) {
            self.get_tip_height().await?
        } else {
            0
        };
        debug!("[esplora] {} utxos for {}", raw.len(), address);
        Ok(normalize_utxos(raw, tip, &script_pubkey))
    }

    async fn get_transaction_hex(&self, txid: &str) -> Result<String, ProviderError> {
        http::get_text(&self.client, &self.url(&format!("/tx/{txid}/hex"))).await
    }

    async fn get_output_spend(&self, txid: &str, vout: u32) -> Result<Option<OutputSpend>, ProviderError> {
        let outspend: EsploraOutspend =
            http::get_json(&self.client, &self.url(&format!("/tx/{txid}/outspend/{vout}"))).await?;
        let spender = match (&outspend.spent, &outspend.txid) {
            (true, Some(spender)) => {
                Some(http::get_json::<EsploraTx>(&self.client, &self.url(&format!("/tx/{spender}"))).await?)
            }
            _ => None,
        };
        normalize_outspend(&outspend, spender.as_ref())
    }

    async fn get_tip_height(&self) -> Result<u32, ProviderError> {
        let body = http::get_text(&self.client, &self.url("/blocks/tip/height")).await?;
        normalize_height(&body)
    }

    async fn get_fee_estimates(&self) -> Result<FeeEstimates, ProviderError> {
        let raw: HashMap<String, f64> = http::get_json(&self.client, &self.url("/fee-estimates")).await?;
        normalize_fee_estimates(&raw)
    }

    async fn get_mempool_stats(&self) -> Result<MempoolStats, ProviderError> {
        let raw: EsploraMempool = http::get_json(&self.client, &self.url("/mempool")).await?;
        Ok(MempoolStats {
            count: raw.count,
            vsize: raw.vsize,
        })
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String, ProviderError> {
        let url = self.url("/tx");
        let request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(tx_hex.to_string());
        let body = http::post_broadcast(&url, request).await?;
        Ok(body.trim().to_string())
    }
}
