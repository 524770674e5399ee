// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 data types
//!
//! Every structure that can come back from a TPM unmarshals losslessly, so
//! `T::from_bytes(&t.to_bytes())` reproduces `t` and re-marshalling a public
//! area yields the exact bytes its Name was computed over.

use anyhow::{anyhow, bail, Result};

use super::constants::*;
use super::marshal::*;

fn get_alg(buf: &mut ResponseBuffer) -> Result<TpmAlgId> {
    let raw = buf.get_u16()?;
    TpmAlgId::from_u16(raw).ok_or_else(|| anyhow!("unknown algorithm: 0x{raw:04x}"))
}

fn get_hash_alg(buf: &mut ResponseBuffer) -> Result<TpmAlgId> {
    let alg = get_alg(buf)?;
    if !alg.is_hash() && alg != TpmAlgId::Null {
        bail!("expected a hash algorithm, got {alg:?}");
    }
    Ok(alg)
}

macro_rules! tpm2b_buffer {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Default, PartialEq, Eq)]
            pub struct $name {
                pub buffer: Vec<u8>,
            }

            impl $name {
                pub fn new(data: impl Into<Vec<u8>>) -> Self {
                    Self { buffer: data.into() }
                }

                pub fn empty() -> Self {
                    Self::default()
                }

                pub fn is_empty(&self) -> bool {
                    self.buffer.is_empty()
                }
            }

            impl Marshal for $name {
                fn marshal(&self, buf: &mut CommandBuffer) {
                    buf.put_tpm2b(&self.buffer);
                }
            }

            impl Unmarshal for $name {
                fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
                    Ok(Self {
                        buffer: buf.get_tpm2b()?,
                    })
                }
            }
        )*
    };
}

tpm2b_buffer! {
    /// TPM2B_DIGEST
    Tpm2bDigest;
    /// TPM2B_DATA
    Tpm2bData;
    /// TPM2B_AUTH
    Tpm2bAuth;
    /// TPM2B_SENSITIVE_DATA
    Tpm2bSensitiveData;
    /// TPM2B_PRIVATE, opaque to everything but the TPM that produced it
    Tpm2bPrivate;
    /// TPM2B_ID_OBJECT - credential blob produced by MakeCredential
    Tpm2bIdObject;
    /// TPM2B_ENCRYPTED_SECRET
    Tpm2bEncryptedSecret;
}

pub type Tpm2bNonce = Tpm2bDigest;

/// TPMS_PCR_SELECTION - PCR selection for a single hash algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsPcrSelection {
    pub hash: TpmAlgId,
    /// Bitmap of selected PCRs, bit `n % 8` of octet `n / 8`
    pub pcr_select: Vec<u8>,
}

impl TpmsPcrSelection {
    pub fn new(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        // At least 3 octets: PCR 0-23 is the minimum every TPM implements
        let max_pcr = pcrs.iter().max().copied().unwrap_or(0);
        let size = ((max_pcr / 8) + 1).max(3) as usize;
        let mut pcr_select = vec![0u8; size];
        for &pcr in pcrs {
            pcr_select[(pcr / 8) as usize] |= 1 << (pcr % 8);
        }
        Self { hash, pcr_select }
    }

    /// Indices whose bit is set, ascending
    pub fn selected(&self) -> Vec<u32> {
        self.pcr_select
            .iter()
            .enumerate()
            .flat_map(|(octet, bits)| {
                (0..8u32)
                    .filter(move |bit| bits & (1 << bit) != 0)
                    .map(move |bit| octet as u32 * 8 + bit)
            })
            .collect()
    }
}

impl Marshal for TpmsPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash.to_u16());
        buf.put_sized_u8(&self.pcr_select);
    }
}

impl Unmarshal for TpmsPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash = get_alg(buf)?;
        let size = buf.get_u8()? as usize;
        let pcr_select = buf.get_bytes(size)?;
        Ok(Self { hash, pcr_select })
    }
}

/// TPML_PCR_SELECTION
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlPcrSelection {
    pub pcr_selections: Vec<TpmsPcrSelection>,
}

impl TpmlPcrSelection {
    pub fn new(selections: Vec<TpmsPcrSelection>) -> Self {
        Self {
            pcr_selections: selections,
        }
    }

    pub fn single(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        Self::new(vec![TpmsPcrSelection::new(hash, pcrs)])
    }

    /// The same index set in each of the given banks
    pub fn across(banks: &[TpmAlgId], pcrs: &[u32]) -> Self {
        Self::new(
            banks
                .iter()
                .map(|&hash| TpmsPcrSelection::new(hash, pcrs))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.pcr_selections.iter().all(|s| s.selected().is_empty())
    }
}

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.pcr_selections.len() as u32);
        for sel in &self.pcr_selections {
            sel.marshal(buf);
        }
    }
}

impl Unmarshal for TpmlPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        let pcr_selections = (0..count)
            .map(|_| TpmsPcrSelection::unmarshal(buf))
            .collect::<Result<_>>()?;
        Ok(Self { pcr_selections })
    }
}

/// TPML_DIGEST
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlDigest {
    pub digests: Vec<Tpm2bDigest>,
}

impl Marshal for TpmlDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.digests.len() as u32);
        for d in &self.digests {
            d.marshal(buf);
        }
    }
}

impl Unmarshal for TpmlDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        let digests = (0..count)
            .map(|_| Tpm2bDigest::unmarshal(buf))
            .collect::<Result<_>>()?;
        Ok(Self { digests })
    }
}

/// TPMS_NV_PUBLIC - NV index public area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsNvPublic {
    pub nv_index: u32,
    pub name_alg: TpmAlgId,
    pub attributes: TpmaNv,
    pub auth_policy: Tpm2bDigest,
    pub data_size: u16,
}

impl TpmsNvPublic {
    pub fn new(nv_index: u32, data_size: u16, attributes: TpmaNv) -> Self {
        Self {
            nv_index,
            name_alg: TpmAlgId::Sha256,
            attributes,
            auth_policy: Tpm2bDigest::empty(),
            data_size,
        }
    }
}

impl Marshal for TpmsNvPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.nv_index);
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.attributes.0);
        self.auth_policy.marshal(buf);
        buf.put_u16(self.data_size);
    }
}

impl Unmarshal for TpmsNvPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            nv_index: buf.get_u32()?,
            name_alg: get_hash_alg(buf)?,
            attributes: TpmaNv(buf.get_u32()?),
            auth_policy: Tpm2bDigest::unmarshal(buf)?,
            data_size: buf.get_u16()?,
        })
    }
}

/// TPMT_SYM_DEF / TPMT_SYM_DEF_OBJECT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }

    pub fn aes_128_cfb() -> Self {
        Self {
            algorithm: TpmAlgId::Aes,
            key_bits: 128,
            mode: TpmAlgId::Cfb,
        }
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.algorithm.to_u16());
        if self.algorithm != TpmAlgId::Null {
            buf.put_u16(self.key_bits);
            buf.put_u16(self.mode.to_u16());
        }
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let algorithm = get_alg(buf)?;
        if algorithm == TpmAlgId::Null {
            return Ok(Self::null());
        }
        Ok(Self {
            algorithm,
            key_bits: buf.get_u16()?,
            mode: get_alg(buf)?,
        })
    }
}

/// A scheme selector followed by its hash algorithm unless the scheme is NULL.
///
/// Covers TPMT_RSA_SCHEME, TPMT_ECC_SCHEME, TPMT_SIG_SCHEME and TPMT_KDF_SCHEME,
/// which share this layout for every scheme used here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtScheme {
    pub scheme: TpmAlgId,
    pub hash_alg: Option<TpmAlgId>,
}

pub type TpmtRsaScheme = TpmtScheme;
pub type TpmtEccScheme = TpmtScheme;
pub type TpmtSigScheme = TpmtScheme;
pub type TpmtKdfScheme = TpmtScheme;

impl TpmtScheme {
    pub fn null() -> Self {
        Self {
            scheme: TpmAlgId::Null,
            hash_alg: None,
        }
    }

    pub fn with_hash(scheme: TpmAlgId, hash: TpmAlgId) -> Self {
        Self {
            scheme,
            hash_alg: Some(hash),
        }
    }

    pub fn rsassa(hash: TpmAlgId) -> Self {
        Self::with_hash(TpmAlgId::RsaSsa, hash)
    }

    pub fn ecdsa(hash: TpmAlgId) -> Self {
        Self::with_hash(TpmAlgId::EcDsa, hash)
    }
}

impl Marshal for TpmtScheme {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.scheme.to_u16());
        if let Some(hash) = self.hash_alg {
            buf.put_u16(hash.to_u16());
        }
    }
}

impl Unmarshal for TpmtScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = get_alg(buf)?;
        if scheme == TpmAlgId::Null {
            return Ok(Self::null());
        }
        Ok(Self::with_hash(scheme, get_hash_alg(buf)?))
    }
}

/// TPMS_RSA_PARMS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsRsaParms {
    pub symmetric: TpmtSymDef,
    pub scheme: TpmtRsaScheme,
    pub key_bits: u16,
    /// 0 selects the default exponent 65537
    pub exponent: u32,
}

impl Marshal for TpmsRsaParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.key_bits);
        buf.put_u32(self.exponent);
    }
}

impl Unmarshal for TpmsRsaParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            symmetric: TpmtSymDef::unmarshal(buf)?,
            scheme: TpmtScheme::unmarshal(buf)?,
            key_bits: buf.get_u16()?,
            exponent: buf.get_u32()?,
        })
    }
}

/// TPMS_ECC_PARMS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsEccParms {
    pub symmetric: TpmtSymDef,
    pub scheme: TpmtEccScheme,
    pub curve_id: TpmEccCurve,
    pub kdf: TpmtKdfScheme,
}

impl Marshal for TpmsEccParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.curve_id.to_u16());
        self.kdf.marshal(buf);
    }
}

impl Unmarshal for TpmsEccParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let symmetric = TpmtSymDef::unmarshal(buf)?;
        let scheme = TpmtScheme::unmarshal(buf)?;
        let curve_raw = buf.get_u16()?;
        let curve_id = TpmEccCurve::from_u16(curve_raw)
            .ok_or_else(|| anyhow!("unknown ECC curve: 0x{curve_raw:04x}"))?;
        let kdf = TpmtScheme::unmarshal(buf)?;
        Ok(Self {
            symmetric,
            scheme,
            curve_id,
            kdf,
        })
    }
}

/// TPMS_KEYEDHASH_PARMS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmsKeyedHashParms {
    pub scheme: TpmAlgId,
    pub hash_alg: Option<TpmAlgId>,
    /// Only present for the XOR scheme
    pub kdf: Option<TpmAlgId>,
}

impl TpmsKeyedHashParms {
    pub fn null() -> Self {
        Self {
            scheme: TpmAlgId::Null,
            hash_alg: None,
            kdf: None,
        }
    }
}

impl Marshal for TpmsKeyedHashParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.scheme.to_u16());
        if let Some(hash) = self.hash_alg {
            buf.put_u16(hash.to_u16());
        }
        if let Some(kdf) = self.kdf {
            buf.put_u16(kdf.to_u16());
        }
    }
}

impl Unmarshal for TpmsKeyedHashParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = get_alg(buf)?;
        match scheme {
            TpmAlgId::Null => Ok(Self::null()),
            TpmAlgId::Hmac => Ok(Self {
                scheme,
                hash_alg: Some(get_hash_alg(buf)?),
                kdf: None,
            }),
            TpmAlgId::Xor => Ok(Self {
                scheme,
                hash_alg: Some(get_hash_alg(buf)?),
                kdf: Some(get_alg(buf)?),
            }),
            other => bail!("unsupported keyed-hash scheme {other:?}"),
        }
    }
}

/// TPMU_PUBLIC_PARMS
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicParms {
    Rsa(TpmsRsaParms),
    Ecc(TpmsEccParms),
    KeyedHash(TpmsKeyedHashParms),
}

impl Marshal for TpmtPublicParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtPublicParms::Rsa(p) => p.marshal(buf),
            TpmtPublicParms::Ecc(p) => p.marshal(buf),
            TpmtPublicParms::KeyedHash(p) => p.marshal(buf),
        }
    }
}

/// TPMS_ECC_POINT
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmsEccPoint {
    pub x: Vec<u8>,
    pub y: Vec<u8>,
}

impl Marshal for TpmsEccPoint {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.x);
        buf.put_tpm2b(&self.y);
    }
}

impl Unmarshal for TpmsEccPoint {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            x: buf.get_tpm2b()?,
            y: buf.get_tpm2b()?,
        })
    }
}

/// TPMU_PUBLIC_ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicUnique {
    /// TPM2B_PUBLIC_KEY_RSA (modulus)
    Rsa(Vec<u8>),
    Ecc(TpmsEccPoint),
    KeyedHash(Vec<u8>),
}

impl Marshal for TpmtPublicUnique {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtPublicUnique::Rsa(n) => buf.put_tpm2b(n),
            TpmtPublicUnique::Ecc(point) => point.marshal(buf),
            TpmtPublicUnique::KeyedHash(d) => buf.put_tpm2b(d),
        }
    }
}

/// TPMT_PUBLIC - public area of a key or sealed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtPublic {
    pub type_alg: TpmAlgId,
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Tpm2bDigest,
    pub parameters: TpmtPublicParms,
    pub unique: TpmtPublicUnique,
}

/// Policy digest of PolicySecret(TPM_RH_ENDORSEMENT), the EK authorization
/// policy from the TCG EK credential profile.
pub const EK_POLICY_SHA256: [u8; 32] = [
    0x83, 0x71, 0x97, 0x67, 0x44, 0x84, 0xb3, 0xf8, 0x1a, 0x90, 0xcc, 0x8d, 0x46, 0xa5, 0xd7, 0x24,
    0xfd, 0x52, 0xd7, 0x6e, 0x06, 0x52, 0x0b, 0x64, 0xf2, 0xa1, 0xda, 0x1b, 0x33, 0x14, 0x69, 0xaa,
];

fn storage_attributes() -> TpmaObject {
    TpmaObject::new()
        .with_fixed_tpm()
        .with_fixed_parent()
        .with_sensitive_data_origin()
        .with_user_with_auth()
        .with_no_da()
        .with_restricted()
        .with_decrypt()
}

fn signing_attributes(restricted: bool) -> TpmaObject {
    let attrs = TpmaObject::new()
        .with_fixed_tpm()
        .with_fixed_parent()
        .with_sensitive_data_origin()
        .with_user_with_auth()
        .with_no_da()
        .with_sign_encrypt();
    if restricted {
        attrs.with_restricted()
    } else {
        attrs
    }
}

fn ek_attributes() -> TpmaObject {
    TpmaObject::new()
        .with_fixed_tpm()
        .with_fixed_parent()
        .with_sensitive_data_origin()
        .with_admin_with_policy()
        .with_restricted()
        .with_decrypt()
}

impl TpmtPublic {
    fn rsa(attrs: TpmaObject, symmetric: TpmtSymDef, scheme: TpmtScheme) -> Self {
        Self {
            type_alg: TpmAlgId::Rsa,
            name_alg: TpmAlgId::Sha256,
            object_attributes: attrs,
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::Rsa(TpmsRsaParms {
                symmetric,
                scheme,
                key_bits: 2048,
                exponent: 0,
            }),
            unique: TpmtPublicUnique::Rsa(Vec::new()),
        }
    }

    fn ecc(attrs: TpmaObject, symmetric: TpmtSymDef, scheme: TpmtScheme) -> Self {
        Self {
            type_alg: TpmAlgId::Ecc,
            name_alg: TpmAlgId::Sha256,
            object_attributes: attrs,
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::Ecc(TpmsEccParms {
                symmetric,
                scheme,
                curve_id: TpmEccCurve::NistP256,
                kdf: TpmtScheme::null(),
            }),
            unique: TpmtPublicUnique::Ecc(TpmsEccPoint::default()),
        }
    }

    /// RSA-2048 storage parent (SRK-style)
    pub fn rsa_storage_key() -> Self {
        Self::rsa(
            storage_attributes(),
            TpmtSymDef::aes_128_cfb(),
            TpmtScheme::null(),
        )
    }

    /// ECC NIST P-256 storage parent
    pub fn ecc_storage_key() -> Self {
        Self::ecc(
            storage_attributes(),
            TpmtSymDef::aes_128_cfb(),
            TpmtScheme::null(),
        )
    }

    /// RSA-2048 RSASSA/SHA-256 signing key
    pub fn rsa_signing_key(restricted: bool) -> Self {
        Self::rsa(
            signing_attributes(restricted),
            TpmtSymDef::null(),
            TpmtScheme::rsassa(TpmAlgId::Sha256),
        )
    }

    /// ECC P-256 ECDSA/SHA-256 signing key
    pub fn ecc_signing_key(restricted: bool) -> Self {
        Self::ecc(
            signing_attributes(restricted),
            TpmtSymDef::null(),
            TpmtScheme::ecdsa(TpmAlgId::Sha256),
        )
    }

    /// TCG default RSA-2048 EK template (low range); unique is 256 zero bytes
    pub fn rsa_ek_template() -> Self {
        let mut ek = Self::rsa(ek_attributes(), TpmtSymDef::aes_128_cfb(), TpmtScheme::null());
        ek.auth_policy = Tpm2bDigest::new(EK_POLICY_SHA256.to_vec());
        ek.unique = TpmtPublicUnique::Rsa(vec![0u8; 256]);
        ek
    }

    /// TCG default ECC NIST P-256 EK template (low range)
    pub fn ecc_ek_template() -> Self {
        let mut ek = Self::ecc(ek_attributes(), TpmtSymDef::aes_128_cfb(), TpmtScheme::null());
        ek.auth_policy = Tpm2bDigest::new(EK_POLICY_SHA256.to_vec());
        ek.unique = TpmtPublicUnique::Ecc(TpmsEccPoint {
            x: vec![0u8; 32],
            y: vec![0u8; 32],
        });
        ek
    }

    /// The ECC public point, if this is an ECC object
    pub fn ecc_point(&self) -> Option<&TpmsEccPoint> {
        match &self.unique {
            TpmtPublicUnique::Ecc(point) => Some(point),
            _ => None,
        }
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.type_alg.to_u16());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        self.auth_policy.marshal(buf);
        self.parameters.marshal(buf);
        self.unique.marshal(buf);
    }
}

impl Unmarshal for TpmtPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let type_alg = get_alg(buf)?;
        let name_alg = get_hash_alg(buf)?;
        let object_attributes = TpmaObject(buf.get_u32()?);
        let auth_policy = Tpm2bDigest::unmarshal(buf)?;
        let (parameters, unique) = match type_alg {
            TpmAlgId::Rsa => (
                TpmtPublicParms::Rsa(TpmsRsaParms::unmarshal(buf)?),
                TpmtPublicUnique::Rsa(buf.get_tpm2b()?),
            ),
            TpmAlgId::Ecc => (
                TpmtPublicParms::Ecc(TpmsEccParms::unmarshal(buf)?),
                TpmtPublicUnique::Ecc(TpmsEccPoint::unmarshal(buf)?),
            ),
            TpmAlgId::KeyedHash => (
                TpmtPublicParms::KeyedHash(TpmsKeyedHashParms::unmarshal(buf)?),
                TpmtPublicUnique::KeyedHash(buf.get_tpm2b()?),
            ),
            other => bail!("unsupported public area type {other:?}"),
        };
        Ok(Self {
            type_alg,
            name_alg,
            object_attributes,
            auth_policy,
            parameters,
            unique,
        })
    }
}

/// TPM2B_SENSITIVE_CREATE
#[derive(Debug, Clone, Default)]
pub struct Tpm2bSensitiveCreate {
    pub user_auth: Tpm2bAuth,
    pub data: Tpm2bSensitiveData,
}

impl Tpm2bSensitiveCreate {
    pub fn with_auth(auth: &[u8]) -> Self {
        Self {
            user_auth: Tpm2bAuth::new(auth),
            data: Tpm2bSensitiveData::empty(),
        }
    }
}

impl Marshal for Tpm2bSensitiveCreate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        let mut inner = CommandBuffer::new();
        self.user_auth.marshal(&mut inner);
        self.data.marshal(&mut inner);
        buf.put_nested(inner);
    }
}

/// TPMT_TK_CREATION - ticket proving an object was created by this TPM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtTkCreation {
    pub tag: u16,
    pub hierarchy: u32,
    pub digest: Tpm2bDigest,
}

impl Marshal for TpmtTkCreation {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.tag);
        buf.put_u32(self.hierarchy);
        self.digest.marshal(buf);
    }
}

impl Unmarshal for TpmtTkCreation {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            tag: buf.get_u16()?,
            hierarchy: buf.get_u32()?,
            digest: Tpm2bDigest::unmarshal(buf)?,
        })
    }
}

/// TPMS_CLOCK_INFO
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmsClockInfo {
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: bool,
}

impl Marshal for TpmsClockInfo {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u64(self.clock);
        buf.put_u32(self.reset_count);
        buf.put_u32(self.restart_count);
        buf.put_u8(self.safe as u8);
    }
}

impl Unmarshal for TpmsClockInfo {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            clock: buf.get_u64()?,
            reset_count: buf.get_u32()?,
            restart_count: buf.get_u32()?,
            safe: buf.get_u8()? != 0,
        })
    }
}

/// TPMU_ATTEST, restricted to the two statements this crate produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmuAttest {
    Quote {
        pcr_select: TpmlPcrSelection,
        pcr_digest: Vec<u8>,
    },
    Creation {
        object_name: Vec<u8>,
        creation_hash: Vec<u8>,
    },
}

/// TPMS_ATTEST - the structure a TPM signs for Quote and CertifyCreation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsAttest {
    pub qualified_signer: Vec<u8>,
    pub extra_data: Vec<u8>,
    pub clock_info: TpmsClockInfo,
    pub firmware_version: u64,
    pub attested: TpmuAttest,
}

impl TpmsAttest {
    pub fn tag(&self) -> TpmSt {
        match self.attested {
            TpmuAttest::Quote { .. } => TpmSt::AttestQuote,
            TpmuAttest::Creation { .. } => TpmSt::AttestCreation,
        }
    }
}

impl Marshal for TpmsAttest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(TPM_GENERATED_VALUE);
        buf.put_u16(self.tag().to_u16());
        buf.put_tpm2b(&self.qualified_signer);
        buf.put_tpm2b(&self.extra_data);
        self.clock_info.marshal(buf);
        buf.put_u64(self.firmware_version);
        match &self.attested {
            TpmuAttest::Quote {
                pcr_select,
                pcr_digest,
            } => {
                pcr_select.marshal(buf);
                buf.put_tpm2b(pcr_digest);
            }
            TpmuAttest::Creation {
                object_name,
                creation_hash,
            } => {
                buf.put_tpm2b(object_name);
                buf.put_tpm2b(creation_hash);
            }
        }
    }
}

impl Unmarshal for TpmsAttest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let magic = buf.get_u32()?;
        if magic != TPM_GENERATED_VALUE {
            bail!("attestation not generated by a TPM (magic 0x{magic:08x})");
        }
        let tag = buf.get_u16()?;
        let qualified_signer = buf.get_tpm2b()?;
        let extra_data = buf.get_tpm2b()?;
        let clock_info = TpmsClockInfo::unmarshal(buf)?;
        let firmware_version = buf.get_u64()?;
        let attested = match TpmSt::from_u16(tag) {
            Some(TpmSt::AttestQuote) => TpmuAttest::Quote {
                pcr_select: TpmlPcrSelection::unmarshal(buf)?,
                pcr_digest: buf.get_tpm2b()?,
            },
            Some(TpmSt::AttestCreation) => TpmuAttest::Creation {
                object_name: buf.get_tpm2b()?,
                creation_hash: buf.get_tpm2b()?,
            },
            _ => bail!("unsupported attestation type 0x{tag:04x}"),
        };
        Ok(Self {
            qualified_signer,
            extra_data,
            clock_info,
            firmware_version,
            attested,
        })
    }
}

/// TPMT_SIGNATURE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtSignature {
    Rsa {
        scheme: TpmAlgId,
        hash_alg: TpmAlgId,
        sig: Vec<u8>,
    },
    Ecc {
        scheme: TpmAlgId,
        hash_alg: TpmAlgId,
        r: Vec<u8>,
        s: Vec<u8>,
    },
    Null,
}

impl TpmtSignature {
    /// True when neither an RSA nor an ECC signature is actually present
    pub fn is_empty(&self) -> bool {
        match self {
            TpmtSignature::Rsa { sig, .. } => sig.is_empty(),
            TpmtSignature::Ecc { r, s, .. } => r.is_empty() || s.is_empty(),
            TpmtSignature::Null => true,
        }
    }
}

impl Marshal for TpmtSignature {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtSignature::Rsa {
                scheme,
                hash_alg,
                sig,
            } => {
                buf.put_u16(scheme.to_u16());
                buf.put_u16(hash_alg.to_u16());
                buf.put_tpm2b(sig);
            }
            TpmtSignature::Ecc {
                scheme,
                hash_alg,
                r,
                s,
            } => {
                buf.put_u16(scheme.to_u16());
                buf.put_u16(hash_alg.to_u16());
                buf.put_tpm2b(r);
                buf.put_tpm2b(s);
            }
            TpmtSignature::Null => buf.put_u16(TpmAlgId::Null.to_u16()),
        }
    }
}

impl Unmarshal for TpmtSignature {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = get_alg(buf)?;
        match scheme {
            TpmAlgId::Null => Ok(TpmtSignature::Null),
            TpmAlgId::RsaSsa | TpmAlgId::RsaPss => Ok(TpmtSignature::Rsa {
                scheme,
                hash_alg: get_hash_alg(buf)?,
                sig: buf.get_tpm2b()?,
            }),
            TpmAlgId::EcDsa => Ok(TpmtSignature::Ecc {
                scheme,
                hash_alg: get_hash_alg(buf)?,
                r: buf.get_tpm2b()?,
                s: buf.get_tpm2b()?,
            }),
            other => bail!("unsupported signature scheme {other:?}"),
        }
    }
}

/// TPMS_CAPABILITY_DATA for the capabilities this crate queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmsCapabilityData {
    Handles(Vec<u32>),
    Pcrs(TpmlPcrSelection),
    Properties(Vec<(u32, u32)>),
}

impl Unmarshal for TpmsCapabilityData {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let cap = buf.get_u32()?;
        let data = if cap == TpmCap::Handles as u32 {
            let count = buf.get_u32()?;
            TpmsCapabilityData::Handles((0..count).map(|_| buf.get_u32()).collect::<Result<_>>()?)
        } else if cap == TpmCap::Pcrs as u32 {
            TpmsCapabilityData::Pcrs(TpmlPcrSelection::unmarshal(buf)?)
        } else if cap == TpmCap::TpmProperties as u32 {
            let count = buf.get_u32()?;
            TpmsCapabilityData::Properties(
                (0..count)
                    .map(|_| -> Result<(u32, u32)> { Ok((buf.get_u32()?, buf.get_u32()?)) })
                    .collect::<Result<_>>()?,
            )
        } else {
            bail!("unsupported capability 0x{cap:08x}");
        };
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcr_selection() {
        let sel = TpmsPcrSelection::new(TpmAlgId::Sha256, &[0, 7, 23]);
        assert_eq!(sel.pcr_select, vec![0x81, 0x00, 0x80]);
        assert_eq!(sel.selected(), vec![0, 7, 23]);

        let wide = TpmsPcrSelection::new(TpmAlgId::Sha1, &[31]);
        assert_eq!(wide.pcr_select.len(), 4);
        assert_eq!(wide.selected(), vec![31]);
    }

    #[test]
    fn test_public_area_is_lossless() {
        let mut key = TpmtPublic::ecc_signing_key(true);
        key.unique = TpmtPublicUnique::Ecc(TpmsEccPoint {
            x: vec![1; 32],
            y: vec![2; 32],
        });
        let bytes = key.to_bytes();
        let parsed = TpmtPublic::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.to_bytes(), bytes);

        let ek = TpmtPublic::rsa_ek_template();
        assert_eq!(TpmtPublic::from_bytes(&ek.to_bytes()).unwrap(), ek);
    }

    #[test]
    fn test_rsa_ek_template_layout() {
        let bytes = TpmtPublic::rsa_ek_template().to_bytes();
        // type, nameAlg, attributes 0x000300B2
        assert_eq!(&bytes[..8], &[0x00, 0x01, 0x00, 0x0B, 0x00, 0x03, 0x00, 0xB2]);
        assert_eq!(&bytes[8..10], &[0x00, 0x20]);
        assert_eq!(&bytes[10..42], &EK_POLICY_SHA256);
    }

    #[test]
    fn test_signature_parse() {
        let ecc = TpmtSignature::Ecc {
            scheme: TpmAlgId::EcDsa,
            hash_alg: TpmAlgId::Sha256,
            r: vec![3; 32],
            s: vec![4; 32],
        };
        let parsed = TpmtSignature::from_bytes(&ecc.to_bytes()).unwrap();
        assert_eq!(parsed, ecc);
        assert!(!parsed.is_empty());

        let null = TpmtSignature::from_bytes(&[0x00, 0x10]).unwrap();
        assert!(null.is_empty());

        let hollow = TpmtSignature::Rsa {
            scheme: TpmAlgId::RsaSsa,
            hash_alg: TpmAlgId::Sha256,
            sig: vec![],
        };
        assert!(TpmtSignature::from_bytes(&hollow.to_bytes()).unwrap().is_empty());
    }

    #[test]
    fn test_attest_parse() {
        let attest = TpmsAttest {
            qualified_signer: vec![0x00, 0x0B, 9, 9],
            extra_data: vec![7; 32],
            clock_info: TpmsClockInfo {
                clock: 42,
                reset_count: 1,
                restart_count: 2,
                safe: true,
            },
            firmware_version: 0x2023,
            attested: TpmuAttest::Quote {
                pcr_select: TpmlPcrSelection::single(TpmAlgId::Sha256, &[0, 1]),
                pcr_digest: vec![5; 32],
            },
        };
        let bytes = attest.to_bytes();
        assert_eq!(&bytes[..4], &[0xFF, 0x54, 0x43, 0x47]);
        assert_eq!(TpmsAttest::from_bytes(&bytes).unwrap(), attest);

        let mut forged = bytes.clone();
        forged[0] = 0;
        assert!(TpmsAttest::from_bytes(&forged).is_err());
    }

    #[test]
    fn test_capability_handles() {
        let data = [
            0x00, 0x00, 0x00, 0x01, // TPM_CAP_HANDLES
            0x00, 0x00, 0x00, 0x02, // count
            0x80, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x01,
        ];
        assert_eq!(
            TpmsCapabilityData::from_bytes(&data).unwrap(),
            TpmsCapabilityData::Handles(vec![0x80000000, 0x80000001])
        );
    }
}
