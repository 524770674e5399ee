// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

#![allow(dead_code)]

use std::collections::BTreeMap;

use tpm2::{TpmtPublic, Unmarshal};
use tpm_attest::credential::issue_credential;
use tpm_attest::{ApiError, Backend};
use tpm_types::{
    Configuration, EnrollRequest, EnrollResponse, Evidence, KeyAlgorithm, KeyTemplate, KeyUsage,
    Verdict,
};

/// In-memory backend issuing real credentials against the request's EK
#[derive(Default)]
pub struct FakeBackend {
    /// Number of credentials to leave out of the enrollment response
    pub withhold: usize,
    /// Keys whose credential ciphertext gets corrupted
    pub corrupt: Vec<String>,
    pub enroll_error: Option<ApiError>,
    pub attest_error: Option<ApiError>,
    pub verdict: Verdict,
    pub requests: Vec<EnrollRequest>,
    pub evidence: Vec<Evidence>,
}

pub fn credential_for(name: &str) -> String {
    format!("credential-{name}")
}

impl Backend for FakeBackend {
    fn enroll(&mut self, request: &EnrollRequest) -> Result<EnrollResponse, ApiError> {
        self.requests.push(request.clone());
        if let Some(err) = self.enroll_error.take() {
            return Err(err);
        }
        let ek = TpmtPublic::from_bytes(&request.ek_public).map_err(ApiError::Other)?;
        let mut credentials = BTreeMap::new();
        for (name, key) in &request.keys {
            let public = TpmtPublic::from_bytes(&key.public).map_err(ApiError::Other)?;
            let mut credential =
                issue_credential(&ek, &public, &credential_for(name)).map_err(ApiError::Other)?;
            if self.corrupt.contains(name) {
                credential.ciphertext[0] ^= 0x80;
            }
            credentials.insert(name.clone(), credential);
        }
        for _ in 0..self.withhold {
            credentials.pop_last();
        }
        Ok(EnrollResponse { credentials })
    }

    fn attest(&mut self, evidence: &Evidence) -> Result<Verdict, ApiError> {
        self.evidence.push(evidence.clone());
        match self.attest_error.take() {
            Some(err) => Err(err),
            None => Ok(self.verdict.clone()),
        }
    }
}

/// Default configuration plus an unrestricted signing key
pub fn two_key_configuration() -> Configuration {
    let mut configuration = Configuration::default();
    configuration.keys.insert(
        "signer".into(),
        KeyTemplate {
            algorithm: KeyAlgorithm::EccP256,
            name_alg: tpm_types::HashAlgorithm::Sha256,
            usage: KeyUsage::Sign,
            restricted: false,
        },
    );
    configuration
}

pub const FIRMWARE: &[u8] = br#"{"uefi": {"version": "1.2.3", "secure_boot": true}, "bios": "abc"}"#;
