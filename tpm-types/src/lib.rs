// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM Types - values exchanged by the attestation agent
//!
//! This crate contains the types shared between:
//! - tpm-attest (device side - enrolls keys and produces evidence)
//! - the backend wire client (serializes requests, parses responses)
//! - the state store (persists the enrolled key hierarchy)
//!
//! Byte fields are hex strings in JSON and raw bytes in SCALE.

use scale::{Decode, Encode};
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

mod opt_hex_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(transparent)]
    struct Bytes(#[serde(with = "serde_human_bytes")] Vec<u8>);

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value.clone().map(Bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Ok(Option::<Bytes>::deserialize(deserializer)?.map(|b| b.0))
    }
}

/// Hash algorithm of a PCR bank or of an object's Name
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Encode,
    Decode,
)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 4] = [
        HashAlgorithm::Sha1,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha384,
        HashAlgorithm::Sha512,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn digest_size(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unsupported hash algorithm: {s}"))
    }
}

/// `bank -> (pcr index -> digest)`, as read from the anchor
pub type PcrBanks = BTreeMap<HashAlgorithm, BTreeMap<u32, Vec<u8>>>;

/// PCR (Platform Configuration Register) value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct PcrValue {
    /// PCR index (0-23 on most platforms)
    pub index: u32,

    /// Bank the value was read from
    pub algorithm: HashAlgorithm,

    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
}

/// Flatten a bank map into the evidence PCR list, bank by bank
pub fn pcr_values(banks: &PcrBanks) -> Vec<PcrValue> {
    banks
        .iter()
        .flat_map(|(bank, values)| {
            values.iter().map(move |(index, value)| PcrValue {
                index: *index,
                algorithm: *bank,
                value: value.clone(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EccSignature {
    #[serde(with = "hex_bytes")]
    pub r: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub s: Vec<u8>,
}

/// A TPM signature in wire form; exactly one field is set on valid evidence
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(
        default,
        with = "opt_hex_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub rsa: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecc: Option<EccSignature>,
}

impl Signature {
    /// Neither an RSA nor an ECC signature is populated
    pub fn is_empty(&self) -> bool {
        let rsa_empty = self.rsa.as_ref().map_or(true, |sig| sig.is_empty());
        let ecc_empty = self
            .ecc
            .as_ref()
            .map_or(true, |sig| sig.r.is_empty() || sig.s.is_empty());
        rsa_empty && ecc_empty
    }
}

/// The signed bundle submitted for appraisal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Random freshness nonce for this request, drawn per attestation. It is
    /// not part of the quoted data.
    #[serde(with = "hex_bytes")]
    pub cookie: Vec<u8>,

    /// TPMS_ATTEST message
    #[serde(with = "hex_bytes")]
    pub quote: Vec<u8>,

    pub signature: Signature,

    /// Strongest bank included in the quote
    pub algorithm: HashAlgorithm,

    pub pcrs: Vec<PcrValue>,

    /// Canonical firmware record whose SHA-256 is the quote's extra data
    pub firmware: serde_json::Value,
}

/// One certified device key in an enrollment request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollKey {
    /// Marshalled TPMT_PUBLIC
    #[serde(with = "hex_bytes")]
    pub public: Vec<u8>,

    /// TPMS_ATTEST produced by CertifyCreation
    #[serde(with = "hex_bytes")]
    pub certify_info: Vec<u8>,

    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollRequest {
    /// Marshalled TPMT_PUBLIC of the endorsement key
    #[serde(with = "hex_bytes")]
    pub ek_public: Vec<u8>,

    /// DER EK certificate, when the TPM carries one
    #[serde(
        default,
        with = "opt_hex_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub ek_certificate: Option<Vec<u8>>,

    #[serde(with = "hex_bytes")]
    pub root_public: Vec<u8>,

    pub keys: BTreeMap<String, EnrollKey>,

    #[serde(with = "hex_bytes")]
    pub cookie: Vec<u8>,
}

/// Backend-issued credential sealed to the endorsement key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedCredential {
    /// TPM2B_ID_OBJECT contents (integrity HMAC + encrypted secret)
    #[serde(with = "hex_bytes")]
    pub credential: Vec<u8>,

    /// Encrypted seed (TPM2B_ENCRYPTED_SECRET contents)
    #[serde(with = "hex_bytes")]
    pub secret: Vec<u8>,

    /// AES-GCM nonce for `ciphertext`
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,

    /// Credential string, encrypted under the activated secret
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub credentials: BTreeMap<String, EncryptedCredential>,
}

/// A device key in its persisted form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct DeviceKey {
    /// Marshalled TPMT_PUBLIC
    #[serde(with = "hex_bytes")]
    pub public: Vec<u8>,

    /// Private blob, only loadable under the root it was created under
    #[serde(with = "hex_bytes")]
    pub private: Vec<u8>,

    #[serde(with = "hex_bytes")]
    pub auth: Vec<u8>,

    /// Backend credential; empty until activation succeeds
    #[serde(default)]
    pub credential: String,
}

impl DeviceKey {
    pub fn is_activated(&self) -> bool {
        !self.credential.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct RootKeyState {
    #[serde(with = "hex_bytes")]
    pub auth: Vec<u8>,

    /// Qualified Name recorded at enrollment
    #[serde(with = "hex_bytes")]
    pub name: Vec<u8>,
}

/// Everything an enrollment produces and an attestation consumes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct KeyHierarchyState {
    pub root: RootKeyState,

    pub keys: BTreeMap<String, DeviceKey>,

    /// Name of the key that signs quotes
    pub primary_key: String,

    #[serde(
        default,
        with = "opt_hex_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub ek_certificate: Option<Vec<u8>>,

    /// Opaque software-anchor state; absent for hardware anchors
    #[serde(
        default,
        with = "opt_hex_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub software_anchor: Option<Vec<u8>>,
}

impl KeyHierarchyState {
    pub fn from_scale(mut input: &[u8]) -> Result<Self, scale::Error> {
        Self::decode(&mut input)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    #[serde(rename = "ecc-p256")]
    EccP256,
    #[serde(rename = "rsa2048")]
    Rsa2048,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyUsage {
    Sign,
    Storage,
}

/// Parameters of a key to provision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyTemplate {
    pub algorithm: KeyAlgorithm,

    #[serde(default = "default_name_alg")]
    pub name_alg: HashAlgorithm,

    pub usage: KeyUsage,

    #[serde(default)]
    pub restricted: bool,
}

fn default_name_alg() -> HashAlgorithm {
    HashAlgorithm::Sha256
}

fn default_primary_key() -> String {
    "aik".into()
}

impl KeyTemplate {
    pub fn ecc_storage() -> Self {
        Self {
            algorithm: KeyAlgorithm::EccP256,
            name_alg: HashAlgorithm::Sha256,
            usage: KeyUsage::Storage,
            restricted: true,
        }
    }

    pub fn ecc_attestation() -> Self {
        Self {
            algorithm: KeyAlgorithm::EccP256,
            name_alg: HashAlgorithm::Sha256,
            usage: KeyUsage::Sign,
            restricted: true,
        }
    }
}

/// Backend-controlled provisioning and probing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub root: KeyTemplate,

    pub keys: BTreeMap<String, KeyTemplate>,

    #[serde(default = "default_primary_key")]
    pub primary_key: String,

    /// Probe list handed to the firmware collector untouched
    #[serde(default)]
    pub firmware: serde_json::Value,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            root: KeyTemplate::ecc_storage(),
            keys: BTreeMap::from([(default_primary_key(), KeyTemplate::ecc_attestation())]),
            primary_key: default_primary_key(),
            firmware: serde_json::Value::Null,
        }
    }
}

/// Backend appraisal payload: sub-domain -> status string
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Verdict {
    pub domains: BTreeMap<String, String>,
}

/// Consumer-facing reading of one verdict entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Trusted,
    Vulnerable,
    Unsupported,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_key() -> DeviceKey {
        DeviceKey {
            public: vec![0x00, 0x23, 0x00, 0x0b],
            private: vec![1, 2, 3],
            auth: vec![0xaa; 32],
            credential: "cred-123".into(),
        }
    }

    #[test]
    fn test_device_key_json_round_trip() {
        let key = device_key();
        let json = serde_json::to_string(&key).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["public"].is_string());
        let back: DeviceKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_state_scale_round_trip() {
        let state = KeyHierarchyState {
            root: RootKeyState {
                auth: vec![1; 32],
                name: vec![2; 34],
            },
            keys: BTreeMap::from([("aik".to_string(), device_key())]),
            primary_key: "aik".into(),
            ek_certificate: None,
            software_anchor: Some(vec![9, 9]),
        };
        let decoded = KeyHierarchyState::from_scale(&state.encode()).unwrap();
        assert_eq!(decoded, state);

        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("ek_certificate").is_none());
        assert!(json["software_anchor"].is_string());
        let back: KeyHierarchyState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_signature_emptiness() {
        assert!(Signature::default().is_empty());
        assert!(Signature {
            rsa: Some(vec![]),
            ecc: None
        }
        .is_empty());
        assert!(!Signature {
            rsa: None,
            ecc: Some(EccSignature {
                r: vec![1],
                s: vec![2]
            })
        }
        .is_empty());
    }

    #[test]
    fn test_configuration_defaults() {
        let config: Configuration = serde_json::from_str(
            r#"{"root":{"algorithm":"ecc-p256","usage":"storage","restricted":true},
                "keys":{"aik":{"algorithm":"ecc-p256","usage":"sign","restricted":true}}}"#,
        )
        .unwrap();
        assert_eq!(config, Configuration::default());
    }

    #[test]
    fn test_hash_algorithm_names() {
        assert_eq!("SHA256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert!("md5".parse::<HashAlgorithm>().is_err());
        assert_eq!(
            serde_json::to_string(&HashAlgorithm::Sha384).unwrap(),
            "\"sha384\""
        );
    }
}
