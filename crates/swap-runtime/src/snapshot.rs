//! # Engine Snapshot
//!
//! JSON image of the repositories and the redeemed-script set, written on
//! shutdown and loaded before the watchtowers and scheduler resume.
//! Secrets in claims and swaps stay sealed; reopening them needs the same
//! `SWAP_SEALING_KEY`.

use crate::container::EngineContainer;
use serde::{Deserialize, Serialize};
use std::path::Path;
use swap_core::domain::unix_now;
use swap_core::{AtomicSwapState, HtlcState, PendingClaim};
use thiserror::Error;
use tracing::info;

/// Current on-disk format.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Snapshot errors.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// File system failure.
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed JSON.
    #[error("snapshot format: {0}")]
    Format(#[from] serde_json::Error),
    /// Written by an incompatible build.
    #[error("unsupported snapshot version {found} (expected {SNAPSHOT_VERSION})")]
    Version {
        /// Version in the file
        found: u32,
    },
    /// Repository refused a record.
    #[error("snapshot restore: {0}")]
    Storage(#[from] swap_core::SwapError),
}

/// Persisted engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format version.
    pub version: u32,
    /// Unix secs when taken.
    pub taken_at: u64,
    /// HTLC records.
    pub htlcs: Vec<HtlcState>,
    /// Claim records.
    pub claims: Vec<PendingClaim>,
    /// Swap records.
    pub swaps: Vec<AtomicSwapState>,
    /// Hex script hashes that must never be spent again.
    pub redeemed_scripts: Vec<String>,
}

/// Record counts restored from a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// HTLCs
    pub htlcs: usize,
    /// Claims
    pub claims: usize,
    /// Swaps
    pub swaps: usize,
    /// Redeemed script hashes
    pub redeemed_scripts: usize,
}

impl Snapshot {
    /// Capture the container's repositories.
    pub fn capture(container: &EngineContainer) -> Result<Self, SnapshotError> {
        let mut htlcs = container.htlcs.list()?;
        let mut claims = container.claims.list()?;
        let mut swaps = container.swaps.list()?;
        htlcs.sort_by(|a, b| a.id.cmp(&b.id));
        claims.sort_by(|a, b| a.id.cmp(&b.id));
        swaps.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Self {
            version: SNAPSHOT_VERSION,
            taken_at: unix_now(),
            htlcs,
            claims,
            swaps,
            redeemed_scripts: container.registry.export_redeemed(),
        })
    }

    /// Load records into the container. Records with the same id are replaced.
    pub fn restore(self, container: &EngineContainer) -> Result<RestoreReport, SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version { found: self.version });
        }
        let report = RestoreReport {
            htlcs: self.htlcs.len(),
            claims: self.claims.len(),
            swaps: self.swaps.len(),
            redeemed_scripts: container.registry.import_redeemed(self.redeemed_scripts),
        };
        for htlc in self.htlcs {
            container.htlcs.put(htlc)?;
        }
        for claim in self.claims {
            container.claims.put(claim)?;
        }
        for swap in self.swaps {
            container.swaps.put(swap)?;
        }
        Ok(report)
    }

    /// Read from `path`.
    pub fn read(path: &Path) -> Result<Self, SnapshotError> {
        let text = std::fs::read_to_string(path)?;
        let snapshot: Self = serde_json::from_str(&text)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version {
                found: snapshot.version,
            });
        }
        Ok(snapshot)
    }

    /// Write to `path` through a sibling temp file and rename.
    pub fn write(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        info!(
            "[snapshot] wrote {} htlc(s), {} claim(s), {} swap(s) to {}",
            self.htlcs.len(),
            self.claims.len(),
            self.swaps.len(),
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ProviderConfig, ProviderKind, RuntimeConfig};
    use swap_core::domain::{AddressFormat, ClaimStatus};
    use swap_core::{ClaimTarget, HtlcConfig, SecretVault};

    fn container() -> EngineContainer {
        EngineContainer::new(RuntimeConfig {
            engine: swap_core::EngineConfig {
                network: bitcoin::Network::Regtest,
                ..Default::default()
            },
            providers: vec![ProviderConfig {
                name: "sim".into(),
                kind: ProviderKind::Simulated,
                base_url: None,
                start_height: 10_000,
            }],
            ..Default::default()
        })
        .unwrap()
    }

    fn pubkey(byte: u8) -> String {
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let sk = bitcoin::secp256k1::SecretKey::from_slice(&[byte; 32]).unwrap();
        bitcoin::PublicKey::new(sk.public_key(&secp)).to_string()
    }

    #[tokio::test]
    async fn test_capture_restore_carries_records_and_redeemed_scripts() {
        let source = container();
        let manager = source
            .watchtowers
            .create(
                HtlcConfig {
                    hash_lock: SecretVault::hash_lock(&[0x05; 32]),
                    claim_pubkey: pubkey(0x11),
                    refund_pubkey: pubkey(0x22),
                    revocation_pubkey: None,
                    timelock: 10_100,
                    amount: 80_000,
                    format: AddressFormat::P2wsh,
                },
                None,
            )
            .unwrap();
        let claim = source
            .scheduler
            .enqueue(
                ClaimTarget::Escrow {
                    escrow_id: "0xabc".into(),
                },
                SecretVault::hash_lock(&[0x05; 32]),
                None,
                unix_now() + 3600,
            )
            .unwrap();
        let script_hash = manager.state().unwrap().script.script_hash;
        source.registry.mark_redeemed(script_hash);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("snapshot.json");
        Snapshot::capture(&source).unwrap().write(&path).unwrap();

        let target = container();
        let report = Snapshot::read(&path).unwrap().restore(&target).unwrap();
        assert_eq!(
            report,
            RestoreReport {
                htlcs: 1,
                claims: 1,
                swaps: 0,
                redeemed_scripts: 1,
            }
        );
        assert!(target.registry.is_redeemed(&script_hash));
        assert_eq!(target.htlcs.require(manager.htlc_id()).unwrap().script.script_hash, script_hash);
        assert_eq!(target.scheduler.get(&claim.id).unwrap().status, ClaimStatus::Pending);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(
            &path,
            r#"{"version":99,"taken_at":0,"htlcs":[],"claims":[],"swaps":[],"redeemed_scripts":[]}"#,
        )
        .unwrap();
        assert!(matches!(Snapshot::read(&path), Err(SnapshotError::Version { found: 99 })));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(Snapshot::read(&dir.path().join("absent.json")), Err(SnapshotError::Io(_))));
    }
}
