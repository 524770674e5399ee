// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Quote-based attestation of an enrolled device

use std::collections::BTreeMap;

use anyhow::{anyhow, Context};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tpm_types::{
    pcr_values, Classification, Configuration, Evidence, HashAlgorithm, KeyHierarchyState,
    PcrBanks, Verdict,
};
use tracing::{debug, info, warn};

use crate::anchor::{self, with_handle, TrustAnchor};
use crate::api::{Backend, FirmwareCollector};
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::{keys, pcr};

const COOKIE_SIZE: usize = 32;

/// Random freshness nonce for requests to the backend
pub fn fresh_cookie() -> Vec<u8> {
    let mut cookie = vec![0u8; COOKIE_SIZE];
    OsRng.fill_bytes(&mut cookie);
    cookie
}

/// Re-encode a JSON firmware record deterministically: keys sorted, no
/// whitespace. Returns the record and the SHA-256 of its encoding.
pub fn canonicalize(firmware: &[u8]) -> Result<(serde_json::Value, Vec<u8>)> {
    let record: serde_json::Value = serde_json::from_slice(firmware)
        .context("firmware record is not JSON")
        .map_err(Error::Encode)?;
    let encoded = serde_json::to_vec(&record)
        .context("failed to encode firmware record")
        .map_err(Error::Encode)?;
    Ok((record, Sha256::digest(&encoded).to_vec()))
}

pub fn classify_status(status: &str) -> Classification {
    match status.to_ascii_lowercase().as_str() {
        "trusted" => Classification::Trusted,
        "vulnerable" => Classification::Vulnerable,
        "unsupported" => Classification::Unsupported,
        _ => Classification::Unknown,
    }
}

/// Read each verdict sub-domain for display. Not part of the appraisal.
pub fn classify(verdict: &Verdict) -> BTreeMap<String, Classification> {
    verdict
        .domains
        .iter()
        .map(|(domain, status)| (domain.clone(), classify_status(status)))
        .collect()
}

/// Keep only the quoted banks and indices
fn quoted_values(banks: &PcrBanks, quoted: &[HashAlgorithm], indices: &[u32]) -> PcrBanks {
    banks
        .iter()
        .filter(|(bank, _)| quoted.contains(bank))
        .map(|(bank, values)| {
            let values = values
                .iter()
                .filter(|(index, _)| indices.contains(index))
                .map(|(index, value)| (*index, value.clone()))
                .collect();
            (*bank, values)
        })
        .collect()
}

/// Quote the current platform state with the enrolled attestation key
pub fn collect_evidence<A: TrustAnchor + ?Sized>(
    anchor: &mut A,
    state: &KeyHierarchyState,
    configuration: &Configuration,
    endorsement_auth: &[u8],
    collector: &mut dyn FirmwareCollector,
) -> Result<Evidence> {
    let firmware = collector
        .collect(&configuration.firmware)
        .map_err(Error::Firmware)?;
    let (record, digest) = canonicalize(&firmware)?;
    debug!("firmware record digest {}", hex::encode(&digest));

    let banks = anchor.all_pcr_values()?;
    let indices = pcr::reconcile(&banks);
    let quoted_banks = pcr::quotable_banks(&banks);
    let Some(&algorithm) = quoted_banks.iter().max() else {
        return Err(Error::ReadPcr(anyhow!("no PCR bank is populated")));
    };
    if indices.is_empty() {
        return Err(Error::ReadPcr(anyhow!("PCR banks share no common index")));
    }
    info!(
        "quoting PCRs {:?} in banks {:?}",
        indices,
        quoted_banks.iter().map(|b| b.as_str()).collect::<Vec<_>>()
    );

    if let Err(err) = anchor.flush_all_handles() {
        warn!("failed to flush stale handles: {}", err.diagnostic());
    }

    let root =
        keys::load_verified_root(anchor, endorsement_auth, &state.root, &configuration.root)?;
    let (quote, signature) = with_handle(anchor, root, |anchor, root| {
        let primary = state.keys.get(&state.primary_key).ok_or_else(|| {
            Error::Aik(anyhow!(
                "attestation key {} is not enrolled",
                state.primary_key
            ))
        })?;
        if !primary.is_activated() {
            warn!("attestation key {} has no credential", state.primary_key);
        }
        let aik = keys::load_device_key(anchor, root, &state.root.auth, primary)?;
        with_handle(anchor, aik, |anchor, aik| {
            anchor.quote(aik, &primary.auth, &digest, &quoted_banks, &indices)
        })
    })?;

    Ok(Evidence {
        cookie: fresh_cookie(),
        quote,
        signature,
        algorithm,
        pcrs: pcr_values(&quoted_values(&banks, &quoted_banks, &indices)),
        firmware: record,
    })
}

/// Result of an attestation run
#[derive(Debug, Clone)]
pub enum Attestation {
    /// Evidence assembled, backend not contacted
    DryRun(Evidence),
    Appraised {
        evidence: Evidence,
        verdict: Verdict,
        classification: BTreeMap<String, Classification>,
    },
}

impl Attestation {
    pub fn evidence(&self) -> &Evidence {
        match self {
            Attestation::DryRun(evidence) => evidence,
            Attestation::Appraised { evidence, .. } => evidence,
        }
    }
}

/// Open the configured anchor, collect evidence and submit it unless
/// `config.dry_run` is set
pub fn attest(
    config: &AgentConfig,
    state: &KeyHierarchyState,
    configuration: &Configuration,
    collector: &mut dyn FirmwareCollector,
    backend: &mut dyn Backend,
) -> Result<Attestation> {
    let selection = config.selection()?;
    let mut anchor = anchor::open(&selection, state.software_anchor.as_deref())?;
    let evidence = collect_evidence(
        anchor.as_mut(),
        state,
        configuration,
        &config.endorsement_auth,
        collector,
    );
    if let Err(err) = anchor.close() {
        warn!("failed to close trust anchor: {}", err.diagnostic());
    }
    let evidence = evidence?;

    if config.dry_run {
        info!("dry run, not contacting the backend");
        return Ok(Attestation::DryRun(evidence));
    }
    let verdict = backend.attest(&evidence)?;
    let classification = classify(&verdict);
    for (domain, class) in &classification {
        info!("{domain}: {class:?}");
    }
    Ok(Attestation::Appraised {
        evidence,
        verdict,
        classification,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_firmware_ignores_layout() {
        let (a, digest_a) = canonicalize(br#"{"b": 1, "a": [1, 2]}"#).unwrap();
        let (b, digest_b) = canonicalize(b"{\n  \"a\":[1,2],\n  \"b\":1\n}").unwrap();
        assert_eq!(a, b);
        assert_eq!(digest_a, digest_b);
        assert_eq!(digest_a.len(), 32);
        assert_eq!(
            digest_a,
            Sha256::digest(br#"{"a":[1,2],"b":1}"#).to_vec()
        );

        let (_, other) = canonicalize(br#"{"a": [2, 1], "b": 1}"#).unwrap();
        assert_ne!(digest_a, other);
    }

    #[test]
    fn test_non_json_firmware_is_an_encode_error() {
        assert!(matches!(
            canonicalize(b"\x00\x01not json"),
            Err(Error::Encode(_))
        ));
    }

    #[test]
    fn test_classification() {
        let verdict = Verdict {
            domains: BTreeMap::from([
                ("firmware".to_string(), "Trusted".to_string()),
                ("bootloader".to_string(), "vulnerable".to_string()),
                ("tpm".to_string(), "unsupported".to_string()),
                ("os".to_string(), "pending".to_string()),
            ]),
        };
        let classes = classify(&verdict);
        assert_eq!(classes["firmware"], Classification::Trusted);
        assert_eq!(classes["bootloader"], Classification::Vulnerable);
        assert_eq!(classes["tpm"], Classification::Unsupported);
        assert_eq!(classes["os"], Classification::Unknown);
    }

    #[test]
    fn test_quoted_values_are_filtered() {
        let banks = PcrBanks::from([
            (
                HashAlgorithm::Sha1,
                BTreeMap::from([(0, vec![0; 20]), (1, vec![1; 20])]),
            ),
            (HashAlgorithm::Sha384, BTreeMap::new()),
        ]);
        let quoted = quoted_values(&banks, &[HashAlgorithm::Sha1], &[1]);
        assert_eq!(quoted.len(), 1);
        assert_eq!(quoted[&HashAlgorithm::Sha1].len(), 1);
        assert_eq!(quoted[&HashAlgorithm::Sha1][&1], vec![1; 20]);
    }

    #[test]
    fn test_cookies_are_fresh() {
        assert_eq!(fresh_cookie().len(), COOKIE_SIZE);
        assert_ne!(fresh_cookie(), fresh_cookie());
    }
}
