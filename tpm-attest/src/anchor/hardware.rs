// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Trust anchor backed by a TPM 2.0 device or simulator

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, bail, Context};
use tpm2::{
    ek_nv_index, tpm_pt, tpm_rc, tpm_rh, AuthSession, TpmAlgId, TpmCap, TpmCc, TpmCommand,
    TpmContext, TpmHt, TpmSt, TpmSu, TpmlPcrSelection, TpmtPublic, TpmtSignature, Transport,
};
use tpm_types::{EccSignature, EncryptedCredential, HashAlgorithm, PcrBanks, Signature};
use tracing::{debug, info, warn};

use super::{CertifiedKey, Handle, TrustAnchor};
use crate::credential;
use crate::error::{Error, OpenError, Result};
use crate::name::{hash_algorithm, tpm_alg};

/// Most TPMs return at most eight digests per PCR_Read
const PCR_READ_BATCH: usize = 8;

pub struct HardwareAnchor {
    tpm: TpmContext,
    allocation: Option<TpmlPcrSelection>,
    closed: bool,
}

fn probe_command() -> anyhow::Result<Vec<u8>> {
    let mut cmd = TpmCommand::new(TpmCc::GetCapability);
    cmd.add_u32(TpmCap::TpmProperties as u32);
    cmd.add_u32(tpm_pt::FAMILY_INDICATOR);
    cmd.add_u32(1);
    cmd.finalize()
}

/// Make sure a started TPM 2.0 is answering
fn probe(tpm: &mut TpmContext) -> Result<(), OpenError> {
    let response = probe_command()
        .and_then(|command| tpm.execute(&command))
        .map_err(OpenError::Transport)?;
    if response.tag == TpmSt::RspCommand {
        return Err(OpenError::Tpm12Unsupported);
    }
    if response.response_code == tpm_rc::INITIALIZE {
        info!("TPM is not started, sending Startup(CLEAR)");
        tpm.startup(TpmSu::Clear).map_err(OpenError::Transport)?;
        return probe_command()
            .and_then(|command| tpm.execute(&command))
            .and_then(|response| response.ensure_success())
            .map_err(OpenError::Transport);
    }
    response.ensure_success().map_err(OpenError::Transport)
}

fn to_signature(signature: TpmtSignature) -> Signature {
    match signature {
        TpmtSignature::Rsa { sig, .. } => Signature {
            rsa: Some(sig),
            ecc: None,
        },
        TpmtSignature::Ecc { r, s, .. } => Signature {
            rsa: None,
            ecc: Some(EccSignature { r, s }),
        },
        TpmtSignature::Null => Signature::default(),
    }
}

impl HardwareAnchor {
    pub fn open(transport: Box<dyn Transport>) -> Result<Self, OpenError> {
        let mut tpm = TpmContext::new(transport);
        if let Err(err) = probe(&mut tpm) {
            tpm.close().ok();
            return Err(err);
        }
        Ok(Self {
            tpm,
            allocation: None,
            closed: false,
        })
    }

    fn allocation(&mut self) -> anyhow::Result<TpmlPcrSelection> {
        if let Some(allocation) = &self.allocation {
            return Ok(allocation.clone());
        }
        let allocation = self.tpm.pcr_allocation()?;
        self.allocation = Some(allocation.clone());
        Ok(allocation)
    }

    fn read_bank(
        &mut self,
        bank: HashAlgorithm,
        indices: &[u32],
    ) -> anyhow::Result<BTreeMap<u32, Vec<u8>>> {
        let alg = tpm_alg(bank);
        let allocated: BTreeSet<u32> = self
            .allocation()?
            .pcr_selections
            .iter()
            .filter(|sel| sel.hash == alg)
            .flat_map(|sel| sel.selected())
            .collect();

        let wanted: BTreeSet<u32> = indices.iter().copied().collect();
        let pending: Vec<u32> = wanted.iter().copied().collect();
        let mut values = BTreeMap::new();
        for chunk in pending.chunks(PCR_READ_BATCH) {
            let selection = TpmlPcrSelection::single(alg, chunk);
            for (returned_alg, index, digest) in self.tpm.pcr_read(&selection)? {
                if returned_alg == alg && wanted.contains(&index) {
                    values.insert(index, digest);
                }
            }
        }

        for index in &wanted {
            if values.contains_key(index) {
                continue;
            }
            if allocated.contains(index) {
                bail!("{bank} PCR {index} is allocated but was not returned");
            }
            debug!("{bank} PCR {index} is not allocated, skipping");
        }
        Ok(values)
    }

    fn certify(
        &mut self,
        root: &Handle,
        root_auth: &[u8],
        template: &TpmtPublic,
        key_auth: &[u8],
    ) -> anyhow::Result<(CertifiedKey, Vec<u8>)> {
        let created = self.tpm.create(root.raw(), root_auth, template, key_auth)?;
        let loaded = self
            .tpm
            .load(root.raw(), root_auth, &created.private, &created.public)?;
        let certified = self.tpm.certify_creation(
            loaded,
            key_auth,
            loaded,
            &[],
            &created.creation_hash,
            &created.ticket,
        );
        if let Err(err) = self.tpm.flush_context(loaded) {
            warn!("failed to flush new device key: {err:#}");
        }
        let (certify_info, signature) = certified?;
        if signature.is_empty() {
            bail!("CertifyCreation returned an empty signature");
        }
        Ok((
            CertifiedKey {
                public: created.public,
                certify_info,
                signature: to_signature(signature),
            },
            created.private,
        ))
    }

    fn activate(
        &mut self,
        credential: &EncryptedCredential,
        endorsement_auth: &[u8],
        key_auth: &[u8],
        key: &Handle,
        ek: &Handle,
    ) -> anyhow::Result<String> {
        let session = AuthSession::start_policy(&mut self.tpm, TpmAlgId::Sha256)?;
        let secret = session
            .policy_secret(&mut self.tpm, tpm_rh::ENDORSEMENT, endorsement_auth)
            .and_then(|()| {
                self.tpm.activate_credential(
                    key.raw(),
                    key_auth,
                    ek.raw(),
                    &session,
                    &credential.credential,
                    &credential.secret,
                )
            });
        if let Err(err) = session.flush(&mut self.tpm) {
            warn!("failed to flush policy session: {err:#}");
        }
        credential::open_credential(&secret?, credential)
    }

    fn read_ek_certificate_nv(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        for index in [ek_nv_index::RSA_CERT, ek_nv_index::ECC_CERT] {
            if let Some(cert) = self.tpm.nv_read(index)? {
                debug!("read EK certificate from NV 0x{index:08x}");
                return Ok(Some(cert));
            }
        }
        Ok(None)
    }
}

impl TrustAnchor for HardwareAnchor {
    fn describe(&self) -> String {
        self.tpm.describe()
    }

    fn get_endorsement_key(&mut self) -> Result<(Handle, TpmtPublic)> {
        let (handle, public) = self
            .tpm
            .create_primary(tpm_rh::ENDORSEMENT, &[], &TpmtPublic::rsa_ek_template(), &[])
            .map_err(Error::EndorsementKey)?;
        Ok((Handle::new(handle), public))
    }

    fn read_ek_certificate(&mut self) -> Result<Option<Vec<u8>>> {
        match self.read_ek_certificate_nv() {
            Ok(cert) => Ok(cert),
            Err(err) => {
                warn!("failed to read EK certificate: {err:#}");
                Ok(None)
            }
        }
    }

    fn create_and_load_root(
        &mut self,
        endorsement_auth: &[u8],
        root_auth: &[u8],
        template: &TpmtPublic,
    ) -> Result<(Handle, TpmtPublic)> {
        let (handle, public) = self
            .tpm
            .create_primary(tpm_rh::ENDORSEMENT, endorsement_auth, template, root_auth)
            .map_err(Error::RootKey)?;
        Ok((Handle::new(handle), public))
    }

    fn create_and_certify_device_key(
        &mut self,
        root: &Handle,
        root_auth: &[u8],
        template: &TpmtPublic,
        key_auth: &[u8],
    ) -> Result<(CertifiedKey, Vec<u8>)> {
        self.certify(root, root_auth, template, key_auth)
            .map_err(Error::Enroll)
    }

    fn load_device_key(
        &mut self,
        root: &Handle,
        root_auth: &[u8],
        public: &TpmtPublic,
        private: &[u8],
    ) -> Result<Handle> {
        let handle = self
            .tpm
            .load(root.raw(), root_auth, private, public)
            .map_err(Error::Aik)?;
        Ok(Handle::new(handle))
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
        self.read_bank(bank, indices).map_err(Error::ReadPcr)
    }

    fn all_pcr_values(&mut self) -> Result<PcrBanks> {
        let allocation = self.allocation().map_err(Error::ReadPcr)?;
        let mut banks = PcrBanks::new();
        for selection in &allocation.pcr_selections {
            let Ok(bank) = hash_algorithm(selection.hash) else {
                warn!("ignoring PCR bank {:?}", selection.hash);
                continue;
            };
            let values = self
                .read_bank(bank, &selection.selected())
                .map_err(Error::ReadPcr)?;
            banks.insert(bank, values);
        }
        Ok(banks)
    }

    fn quote(
        &mut self,
        aik: &Handle,
        aik_auth: &[u8],
        extra_data: &[u8],
        banks: &[HashAlgorithm],
        indices: &[u32],
    ) -> Result<(Vec<u8>, Signature)> {
        let algs: Vec<TpmAlgId> = banks.iter().map(|&bank| tpm_alg(bank)).collect();
        let selection = TpmlPcrSelection::across(&algs, indices);
        let (quoted, signature) = self
            .tpm
            .quote(aik.raw(), aik_auth, extra_data, &selection)
            .map_err(Error::Quote)?;
        if signature.is_empty() {
            return Err(Error::Quote(anyhow!("TPM returned an empty quote signature")));
        }
        Ok((quoted, to_signature(signature)))
    }

    fn flush(&mut self, handle: Handle) -> Result<()> {
        let raw = handle.release();
        self.tpm.flush_context(raw).map_err(Error::Unknown)
    }

    fn flush_all_handles(&mut self) -> Result<()> {
        for ht in [TpmHt::Transient, TpmHt::HmacSession, TpmHt::PolicySession] {
            let handles = match self.tpm.handles(ht) {
                Ok(handles) => handles,
                Err(err) => {
                    warn!("failed to list {ht:?} handles: {err:#}");
                    continue;
                }
            };
            for handle in handles {
                match self.tpm.flush_context(handle) {
                    Ok(()) => debug!("flushed stale handle 0x{handle:08x}"),
                    Err(err) => warn!("failed to flush 0x{handle:08x}: {err:#}"),
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.tpm
            .close()
            .context("failed to close TPM transport")
            .map_err(Error::Unknown)
    }
}
