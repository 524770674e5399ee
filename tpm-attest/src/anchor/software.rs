// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! In-process TPM emulation
//!
//! Keys are NIST P-256 only. Primary keys are derived from the endorsement
//! seed and their template, so the same template always yields the same key
//! until [`SoftwareAnchor::reset`]. Device keys are random and leave the
//! anchor only as private blobs protected by their parent's seed, in the
//! same layout a TPM uses. Quotes and creation certificates are real
//! TPMS_ATTEST structures signed with ECDSA/SHA-256.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, ensure, Context};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature as EcdsaSignature, SigningKey};
use p256::SecretKey;
use rand::rngs::OsRng;
use rand::RngCore;
use scale::{Decode, Encode};
use tpm2::{
    tpm_rh, CommandBuffer, Marshal, ResponseBuffer, TpmEccCurve, TpmaObject, TpmlPcrSelection,
    TpmsAttest, TpmsClockInfo, TpmtPublic, TpmtPublicParms, TpmtPublicUnique, TpmuAttest,
};
use tpm_types::{EccSignature, EncryptedCredential, HashAlgorithm, PcrBanks, Signature};
use tracing::debug;

use super::{CertifiedKey, Handle, TrustAnchor};
use crate::credential::{self, kdfa};
use crate::error::{Error, Result};
use crate::name::{compute_name, hash, tpm_alg, Entity, Name};

/// Transient object slots, as on a typical discrete TPM
const MAX_LOADED_OBJECTS: usize = 3;
const PCR_COUNT: u32 = 24;
const BANKS: [HashAlgorithm; 2] = [HashAlgorithm::Sha1, HashAlgorithm::Sha256];
const FIRST_TRANSIENT: u32 = 0x8000_0000;
const FIRMWARE_VERSION: u64 = 0x0002_0000_0000_0000;
const MAX_EXTRA_DATA: usize = 64;

const LABEL_PRIMARY: &str = "PRIMARY";
const LABEL_SEED: &str = "SEED";

#[derive(Debug, Clone, Encode, Decode)]
struct PersistedState {
    endorsement_seed: Vec<u8>,
    endorsement_auth: Vec<u8>,
    pcrs: Vec<(HashAlgorithm, Vec<Vec<u8>>)>,
    ek_certificate: Option<Vec<u8>>,
    reset_count: u32,
    clock: u64,
}

impl PersistedState {
    fn fresh(reset_count: u32) -> Self {
        let mut endorsement_seed = vec![0u8; 32];
        OsRng.fill_bytes(&mut endorsement_seed);
        Self {
            endorsement_seed,
            endorsement_auth: Vec::new(),
            pcrs: BANKS
                .iter()
                .map(|&alg| (alg, vec![vec![0u8; alg.digest_size()]; PCR_COUNT as usize]))
                .collect(),
            ek_certificate: None,
            reset_count,
            clock: 0,
        }
    }

    fn bank(&self, alg: HashAlgorithm) -> Option<&Vec<Vec<u8>>> {
        self.pcrs.iter().find(|(a, _)| *a == alg).map(|(_, v)| v)
    }
}

/// What an object may be used for beyond its attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hierarchy {
    /// The endorsement key itself
    Endorsement,
    Ordinary,
}

struct Object {
    public: TpmtPublic,
    secret: SecretKey,
    auth: Vec<u8>,
    /// Protects children; present on decrypt keys only
    seed: Option<Vec<u8>>,
    qualified_name: Name,
    hierarchy: Hierarchy,
}

impl Object {
    fn can_sign(&self) -> bool {
        self.public.object_attributes.has(TpmaObject::SIGN_ENCRYPT)
    }
}

pub struct SoftwareAnchor {
    state: PersistedState,
    objects: BTreeMap<u32, Object>,
    next_handle: u32,
    closed: bool,
}

impl Default for SoftwareAnchor {
    fn default() -> Self {
        Self::new()
    }
}

fn check_template(template: &TpmtPublic) -> anyhow::Result<()> {
    match &template.parameters {
        TpmtPublicParms::Ecc(params) if params.curve_id == TpmEccCurve::NistP256 => Ok(()),
        TpmtPublicParms::Ecc(params) => bail!("curve {:?} is not supported", params.curve_id),
        _ => bail!("{:?} keys are not supported", template.type_alg),
    }
}

fn with_point(template: &TpmtPublic, secret: &SecretKey) -> anyhow::Result<TpmtPublic> {
    let mut public = template.clone();
    public.unique = TpmtPublicUnique::Ecc(credential::ecc_point(&secret.public_key())?);
    Ok(public)
}

fn sign(secret: &SecretKey, message: &[u8]) -> Signature {
    let signature: EcdsaSignature = SigningKey::from(secret).sign(message);
    let (r, s) = signature.split_bytes();
    Signature {
        rsa: None,
        ecc: Some(EccSignature {
            r: r.to_vec(),
            s: s.to_vec(),
        }),
    }
}

fn check_auth(object: &Object, auth: &[u8]) -> anyhow::Result<()> {
    ensure!(object.auth == auth, "authorization failure");
    Ok(())
}

/// `TPM2B(auth) || TPM2B(private scalar) || TPM2B(seed)`
fn encode_sensitive(object: &Object) -> anyhow::Result<Vec<u8>> {
    let mut buf = CommandBuffer::new();
    buf.put_tpm2b(&object.auth);
    buf.put_tpm2b(&object.secret.to_bytes());
    buf.put_tpm2b(object.seed.as_deref().unwrap_or_default());
    buf.finish()
}

fn decode_sensitive(data: &[u8]) -> anyhow::Result<(Vec<u8>, SecretKey, Option<Vec<u8>>)> {
    let mut buf = ResponseBuffer::new(data);
    let auth = buf.get_tpm2b()?;
    let secret = SecretKey::from_slice(&buf.get_tpm2b()?).context("invalid private scalar")?;
    let seed = buf.get_tpm2b()?;
    buf.finish()?;
    Ok((auth, secret, (!seed.is_empty()).then_some(seed)))
}

fn child_seed(public: &TpmtPublic) -> Option<Vec<u8>> {
    public
        .object_attributes
        .has(TpmaObject::DECRYPT)
        .then(|| {
            let mut seed = vec![0u8; 32];
            OsRng.fill_bytes(&mut seed);
            seed
        })
}

impl SoftwareAnchor {
    pub fn new() -> Self {
        Self::with_state(PersistedState::fresh(0))
    }

    fn with_state(state: PersistedState) -> Self {
        Self {
            state,
            objects: BTreeMap::new(),
            next_handle: FIRST_TRANSIENT,
            closed: false,
        }
    }

    /// Restore an anchor from [`SoftwareAnchor::save`] output
    pub fn restore(blob: &[u8]) -> anyhow::Result<Self> {
        let state =
            PersistedState::decode(&mut &blob[..]).context("corrupt software anchor state")?;
        ensure!(state.endorsement_seed.len() == 32, "invalid endorsement seed");
        for alg in BANKS {
            let bank = state
                .bank(alg)
                .ok_or_else(|| anyhow!("missing {alg} PCR bank"))?;
            ensure!(
                bank.len() == PCR_COUNT as usize
                    && bank.iter().all(|v| v.len() == alg.digest_size()),
                "malformed {alg} PCR bank"
            );
        }
        Ok(Self::with_state(state))
    }

    pub fn save(&self) -> Vec<u8> {
        self.state.encode()
    }

    /// Model a cleared TPM: new seeds, PCRs back to zero, nothing loaded.
    /// Every key derived before the reset becomes unreachable.
    pub fn reset(&mut self) {
        self.state = PersistedState::fresh(self.state.reset_count + 1);
        self.objects.clear();
    }

    /// TPM2_PCR_Extend: `pcr = H(pcr || digest)`
    pub fn extend_pcr(
        &mut self,
        bank: HashAlgorithm,
        index: u32,
        digest: &[u8],
    ) -> anyhow::Result<()> {
        ensure!(index < PCR_COUNT, "PCR {index} out of range");
        ensure!(
            digest.len() == bank.digest_size(),
            "{bank} digest must be {} bytes",
            bank.digest_size()
        );
        let values = self
            .state
            .pcrs
            .iter_mut()
            .find(|(alg, _)| *alg == bank)
            .map(|(_, values)| values)
            .ok_or_else(|| anyhow!("{bank} bank is not implemented"))?;
        let slot = &mut values[index as usize];
        let extended = hash(bank, &[slot.as_slice(), digest]);
        *slot = extended;
        Ok(())
    }

    pub fn set_ek_certificate(&mut self, certificate: Option<Vec<u8>>) {
        self.state.ek_certificate = certificate;
    }

    /// TPM2_HierarchyChangeAuth for the endorsement hierarchy
    pub fn set_endorsement_auth(&mut self, auth: &[u8]) {
        self.state.endorsement_auth = auth.to_vec();
    }

    pub fn loaded_objects(&self) -> usize {
        self.objects.len()
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        ensure!(!self.closed, "software anchor is closed");
        Ok(())
    }

    fn object(&self, handle: &Handle) -> anyhow::Result<&Object> {
        self.ensure_open()?;
        self.objects
            .get(&handle.raw())
            .ok_or_else(|| anyhow!("handle 0x{:08x} is not loaded", handle.raw()))
    }

    fn insert(&mut self, object: Object) -> anyhow::Result<Handle> {
        ensure!(
            self.objects.len() < MAX_LOADED_OBJECTS,
            "out of object memory"
        );
        let raw = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(FIRST_TRANSIENT);
        debug!("loaded software object 0x{raw:08x}");
        self.objects.insert(raw, object);
        Ok(Handle::new(raw))
    }

    fn clock_info(&mut self) -> TpmsClockInfo {
        self.state.clock += 1;
        TpmsClockInfo {
            clock: self.state.clock,
            reset_count: self.state.reset_count,
            restart_count: 0,
            safe: true,
        }
    }

    /// Primary keys depend only on the hierarchy seed and the template
    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: &TpmtPublic,
        auth: &[u8],
    ) -> anyhow::Result<Handle> {
        self.ensure_open()?;
        check_template(template)?;
        let template_bytes = template.to_bytes();
        let seed = &self.state.endorsement_seed;

        let secret = (0u32..16)
            .find_map(|counter| {
                kdfa(seed, LABEL_PRIMARY, &template_bytes, &counter.to_be_bytes(), 256)
                    .ok()
                    .and_then(|bytes| SecretKey::from_slice(&bytes).ok())
            })
            .ok_or_else(|| anyhow!("failed to derive a primary key"))?;
        let child_seed = template
            .object_attributes
            .has(TpmaObject::DECRYPT)
            .then(|| kdfa(seed, LABEL_SEED, &template_bytes, &[], 256))
            .transpose()?;

        let public = with_point(template, &secret)?;
        let qualified_name = compute_name(&[
            Entity::Handle(tpm_rh::ENDORSEMENT),
            Entity::Public(&public),
        ])?;
        self.insert(Object {
            public,
            secret,
            auth: auth.to_vec(),
            seed: child_seed,
            qualified_name,
            hierarchy,
        })
    }

    fn public_of(&self, handle: &Handle) -> anyhow::Result<TpmtPublic> {
        Ok(self.object(handle)?.public.clone())
    }

    fn certify_new_key(
        &mut self,
        root: &Handle,
        root_auth: &[u8],
        template: &TpmtPublic,
        key_auth: &[u8],
    ) -> anyhow::Result<(CertifiedKey, Vec<u8>)> {
        check_template(template)?;
        ensure!(
            template.object_attributes.has(TpmaObject::SIGN_ENCRYPT),
            "key cannot sign its own creation certificate"
        );
        ensure!(
            self.objects.len() < MAX_LOADED_OBJECTS,
            "out of object memory"
        );
        let parent = self.object(root)?;
        check_auth(parent, root_auth)?;
        let parent_seed = parent
            .seed
            .clone()
            .ok_or_else(|| anyhow!("parent is not a storage key"))?;
        let parent_qn = parent.qualified_name.clone();

        let secret = SecretKey::random(&mut OsRng);
        let public = with_point(template, &secret)?;
        let name = Name::of_public(&public)?;
        let object = Object {
            seed: child_seed(&public),
            qualified_name: compute_name(&[Entity::Name(&parent_qn), Entity::Public(&public)])?,
            public: public.clone(),
            secret,
            auth: key_auth.to_vec(),
            hierarchy: Hierarchy::Ordinary,
        };
        let private =
            credential::protect(&parent_seed, &name.to_bytes(), &encode_sensitive(&object)?)?;

        let attest = TpmsAttest {
            qualified_signer: object.qualified_name.to_bytes(),
            extra_data: Vec::new(),
            clock_info: self.clock_info(),
            firmware_version: FIRMWARE_VERSION,
            attested: TpmuAttest::Creation {
                object_name: name.to_bytes(),
                creation_hash: hash(
                    HashAlgorithm::Sha256,
                    &[&parent_qn.to_bytes(), &public.to_bytes()],
                ),
            },
        }
        .to_bytes();
        let signature = sign(&object.secret, &attest);
        debug!("created software device key {}", hex::encode(name.to_bytes()));

        Ok((
            CertifiedKey {
                public,
                certify_info: attest,
                signature,
            },
            private,
        ))
    }

    fn load(
        &mut self,
        root: &Handle,
        root_auth: &[u8],
        public: &TpmtPublic,
        private: &[u8],
    ) -> anyhow::Result<Handle> {
        check_template(public)?;
        let parent = self.object(root)?;
        check_auth(parent, root_auth)?;
        let parent_seed = parent
            .seed
            .as_deref()
            .ok_or_else(|| anyhow!("parent is not a storage key"))?;
        let name = Name::of_public(public)?;
        let sensitive = credential::unprotect(parent_seed, &name.to_bytes(), private)
            .context("private blob does not belong to this parent")?;
        let (auth, secret, seed) = decode_sensitive(&sensitive)?;
        ensure!(
            with_point(public, &secret)?.unique == public.unique,
            "public area does not match the private key"
        );
        let qualified_name = compute_name(&[
            Entity::Name(&parent.qualified_name),
            Entity::Public(public),
        ])?;
        self.insert(Object {
            public: public.clone(),
            secret,
            auth,
            seed,
            qualified_name,
            hierarchy: Hierarchy::Ordinary,
        })
    }

    fn activate(
        &self,
        credential: &EncryptedCredential,
        endorsement_auth: &[u8],
        key_auth: &[u8],
        key: &Handle,
        ek: &Handle,
    ) -> anyhow::Result<String> {
        let object = self.object(key)?;
        check_auth(object, key_auth)?;
        let ek = self.object(ek)?;
        ensure!(
            ek.hierarchy == Hierarchy::Endorsement,
            "credential must be activated with the endorsement key"
        );
        // PolicySecret(TPM_RH_ENDORSEMENT)
        ensure!(
            self.state.endorsement_auth == endorsement_auth,
            "endorsement policy not satisfied"
        );
        let ek_point = ek
            .public
            .ecc_point()
            .ok_or_else(|| anyhow!("endorsement key is not an ECC key"))?;
        let name = Name::of_public(&object.public)?.to_bytes();
        let secret = credential::activate_credential(
            &ek.secret,
            ek_point,
            &name,
            &credential.credential,
            &credential.secret,
        )?;
        credential::open_credential(&secret, credential)
    }

    fn sign_quote(
        &mut self,
        aik: &Handle,
        aik_auth: &[u8],
        extra_data: &[u8],
        banks: &[HashAlgorithm],
        indices: &[u32],
    ) -> anyhow::Result<(Vec<u8>, Signature)> {
        ensure!(
            extra_data.len() <= MAX_EXTRA_DATA,
            "qualifying data too long"
        );
        let mut indices = indices.to_vec();
        indices.sort_unstable();
        indices.dedup();
        if let Some(index) = indices.iter().find(|&&i| i >= PCR_COUNT) {
            bail!("PCR {index} is not implemented");
        }

        let object = self.object(aik)?;
        check_auth(object, aik_auth)?;
        ensure!(object.can_sign(), "key cannot sign");

        let mut selected = Vec::new();
        for &bank in banks {
            let values = self
                .state
                .bank(bank)
                .ok_or_else(|| anyhow!("{bank} bank is not implemented"))?;
            for &index in &indices {
                selected.extend_from_slice(&values[index as usize]);
            }
        }
        let pcr_digest = hash(HashAlgorithm::Sha256, &[&selected]);
        let qualified_signer = object.qualified_name.to_bytes();
        let secret = object.secret.clone();

        let bank_algs: Vec<_> = banks.iter().map(|&b| tpm_alg(b)).collect();
        let attest = TpmsAttest {
            qualified_signer,
            extra_data: extra_data.to_vec(),
            clock_info: self.clock_info(),
            firmware_version: FIRMWARE_VERSION,
            attested: TpmuAttest::Quote {
                pcr_select: TpmlPcrSelection::across(&bank_algs, &indices),
                pcr_digest,
            },
        }
        .to_bytes();
        let signature = sign(&secret, &attest);
        Ok((attest, signature))
    }
}

impl TrustAnchor for SoftwareAnchor {
    fn describe(&self) -> String {
        "software".into()
    }

    fn get_endorsement_key(&mut self) -> Result<(Handle, TpmtPublic)> {
        let ek = self
            .create_primary(Hierarchy::Endorsement, &TpmtPublic::ecc_ek_template(), &[])
            .map_err(Error::EndorsementKey)?;
        let public = self.public_of(&ek).map_err(Error::EndorsementKey)?;
        Ok((ek, public))
    }

    fn read_ek_certificate(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.state.ek_certificate.clone())
    }

    fn create_and_load_root(
        &mut self,
        endorsement_auth: &[u8],
        root_auth: &[u8],
        template: &TpmtPublic,
    ) -> Result<(Handle, TpmtPublic)> {
        if self.state.endorsement_auth != endorsement_auth {
            return Err(Error::RootKey(anyhow!(
                "endorsement hierarchy authorization failure"
            )));
        }
        let root = self
            .create_primary(Hierarchy::Ordinary, template, root_auth)
            .map_err(Error::RootKey)?;
        let public = self.public_of(&root).map_err(Error::RootKey)?;
        Ok((root, public))
    }

    fn create_and_certify_device_key(
        &mut self,
        root: &Handle,
        root_auth: &[u8],
        template: &TpmtPublic,
        key_auth: &[u8],
    ) -> Result<(CertifiedKey, Vec<u8>)> {
        self.certify_new_key(root, root_auth, template, key_auth)
            .map_err(Error::Enroll)
    }

    fn load_device_key(
        &mut self,
        root: &Handle,
        root_auth: &[u8],
        public: &TpmtPublic,
        private: &[u8],
    ) -> Result<Handle> {
        self.load(root, root_auth, public, private)
            .map_err(Error::Aik)
    }

    fn activate_device_key(
        &mut self,
        credential: &EncryptedCredential,
        endorsement_auth: &[u8],
        key_auth: &[u8],
        key: &Handle,
        ek: &Handle,
    ) -> Result<String> {
        self.activate(credential, endorsement_auth, key_auth, key, ek)
            .map_err(Error::Enroll)
    }

    fn pcr_values(
        &mut self,
        bank: HashAlgorithm,
        indices: &[u32],
    ) -> Result<BTreeMap<u32, Vec<u8>>> {
        self.ensure_open().map_err(Error::ReadPcr)?;
        let Some(values) = self.state.bank(bank) else {
            return Ok(BTreeMap::new());
        };
        Ok(indices
            .iter()
            .filter_map(|&i| values.get(i as usize).map(|v| (i, v.clone())))
            .collect())
    }

    fn all_pcr_values(&mut self) -> Result<PcrBanks> {
        self.ensure_open().map_err(Error::ReadPcr)?;
        Ok(self
            .state
            .pcrs
            .iter()
            .map(|(alg, values)| {
                let bank = values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (i as u32, v.clone()))
                    .collect();
                (*alg, bank)
            })
            .collect())
    }

    fn quote(
        &mut self,
        aik: &Handle,
        aik_auth: &[u8],
        extra_data: &[u8],
        banks: &[HashAlgorithm],
        indices: &[u32],
    ) -> Result<(Vec<u8>, Signature)> {
        self.sign_quote(aik, aik_auth, extra_data, banks, indices)
            .map_err(Error::Quote)
    }

    fn flush(&mut self, handle: Handle) -> Result<()> {
        let raw = handle.release();
        match self.objects.remove(&raw) {
            Some(_) => {
                debug!("flushed software object 0x{raw:08x}");
                Ok(())
            }
            None => Err(Error::invalid(format!("handle 0x{raw:08x} is not loaded"))),
        }
    }

    fn flush_all_handles(&mut self) -> Result<()> {
        self.objects.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.objects.clear();
        self.closed = true;
        Ok(())
    }

    fn software_state(&self) -> Option<Vec<u8>> {
        Some(self.save())
    }
}
