// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command implementations
//!
//! Only the commands a remote-attestation client needs: capability and PCR
//! reads, key creation/loading, creation certification, credential
//! activation, quoting and NV reads of the EK certificate.

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use super::constants::*;
use super::marshal::*;
use super::session::*;
use super::transport::*;
use super::types::*;

/// Largest NV chunk requested per NV_Read; below every TPM's MAX_NV_BUFFER
const NV_READ_CHUNK: u16 = 768;

/// Result of TPM2_Create
#[derive(Debug, Clone)]
pub struct CreatedObject {
    pub private: Vec<u8>,
    pub public: TpmtPublic,
    pub creation_hash: Vec<u8>,
    pub ticket: TpmtTkCreation,
}

/// Pure Rust TPM context over any [`Transport`]
pub struct TpmContext {
    transport: Box<dyn Transport>,
}

impl TpmContext {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// Send a raw command and parse the response header. TPM-level failures
    /// are returned in the response; only transport failures are errors.
    pub fn execute(&mut self, command: &[u8]) -> Result<TpmResponse> {
        if let Some(cc) = command.get(6..10) {
            debug!(
                "TPM command 0x{:08x}, {} bytes",
                u32::from_be_bytes([cc[0], cc[1], cc[2], cc[3]]),
                command.len()
            );
        }
        let response = self.transport.transmit(command)?;
        TpmResponse::parse(&response)
    }

    pub fn close(&mut self) -> Result<()> {
        self.transport.close()
    }

    // ==================== Startup / Capabilities ====================

    pub fn startup(&mut self, startup_type: TpmSu) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::Startup);
        cmd.add_u16(startup_type as u16);
        let response = self.execute(&cmd.finalize()?)?;
        response.ensure_success().context("Startup failed")
    }

    /// TPM2_GetCapability; returns the `moreData` flag with the decoded data
    pub fn get_capability(
        &mut self,
        capability: TpmCap,
        property: u32,
        count: u32,
    ) -> Result<(bool, TpmsCapabilityData)> {
        let mut cmd = TpmCommand::new(TpmCc::GetCapability);
        cmd.add_u32(capability as u32);
        cmd.add_u32(property);
        cmd.add_u32(count);

        let response = self.execute(&cmd.finalize()?)?;
        response.ensure_success().context("GetCapability failed")?;
        let (_, mut buf) = response.parameters(0)?;
        let more = buf.get_u8()? != 0;
        let data = TpmsCapabilityData::unmarshal(&mut buf)?;
        Ok((more, data))
    }

    /// PCR banks and indices the TPM has allocated
    pub fn pcr_allocation(&mut self) -> Result<TpmlPcrSelection> {
        match self.get_capability(TpmCap::Pcrs, 0, 1)? {
            (_, TpmsCapabilityData::Pcrs(selection)) => Ok(selection),
            (_, other) => bail!("unexpected capability data {other:?}"),
        }
    }

    /// Every loaded handle in the range of `ht`
    pub fn handles(&mut self, ht: TpmHt) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        let mut next = ht.first();
        loop {
            let (more, data) = self.get_capability(TpmCap::Handles, next, 64)?;
            let TpmsCapabilityData::Handles(handles) = data else {
                bail!("unexpected capability data {data:?}");
            };
            let last = handles.last().copied();
            out.extend(handles.into_iter().filter(|h| TpmHt::of(*h) == Some(ht)));
            match last {
                Some(last) if more => next = last + 1,
                _ => break,
            }
        }
        Ok(out)
    }

    // ==================== Key Operations ====================

    /// Create a primary key under `hierarchy`
    pub fn create_primary(
        &mut self,
        hierarchy: u32,
        hierarchy_auth: &[u8],
        template: &TpmtPublic,
        user_auth: &[u8],
    ) -> Result<(u32, TpmtPublic)> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::CreatePrimary);
        cmd.add_handle(hierarchy);
        cmd.add_auth_area(&[AuthCommand::password(hierarchy_auth)]);
        cmd.add(&Tpm2bSensitiveCreate::with_auth(user_auth));
        cmd.add_sized(template);
        // outsideInfo
        cmd.add_tpm2b_empty();
        // creationPCR
        cmd.add(&TpmlPcrSelection::default());

        let response = self.execute(&cmd.finalize()?)?;
        response.ensure_success().context("CreatePrimary failed")?;
        let (handles, mut buf) = response.parameters(1)?;
        let public = buf.get_sized::<TpmtPublic>().context("CreatePrimary outPublic")?;

        debug!("created primary key with handle 0x{:08x}", handles[0]);
        Ok((handles[0], public))
    }

    /// Create an ordinary object under a loaded parent
    pub fn create(
        &mut self,
        parent: u32,
        parent_auth: &[u8],
        template: &TpmtPublic,
        user_auth: &[u8],
    ) -> Result<CreatedObject> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::Create);
        cmd.add_handle(parent);
        cmd.add_auth_area(&[AuthCommand::password(parent_auth)]);
        cmd.add(&Tpm2bSensitiveCreate::with_auth(user_auth));
        cmd.add_sized(template);
        cmd.add_tpm2b_empty();
        cmd.add(&TpmlPcrSelection::default());

        let response = self.execute(&cmd.finalize()?)?;
        response.ensure_success().context("Create failed")?;
        let (_, mut buf) = response.parameters(0)?;
        let private = buf.get_tpm2b()?;
        let public = buf.get_sized::<TpmtPublic>().context("Create outPublic")?;
        let _creation_data = buf.get_tpm2b()?;
        let creation_hash = buf.get_tpm2b()?;
        let ticket = TpmtTkCreation::unmarshal(&mut buf)?;

        Ok(CreatedObject {
            private,
            public,
            creation_hash,
            ticket,
        })
    }

    /// Load an object under `parent`; returns the transient handle
    pub fn load(
        &mut self,
        parent: u32,
        parent_auth: &[u8],
        private: &[u8],
        public: &TpmtPublic,
    ) -> Result<u32> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::Load);
        cmd.add_handle(parent);
        cmd.add_auth_area(&[AuthCommand::password(parent_auth)]);
        cmd.add_tpm2b(private);
        cmd.add_sized(public);

        let response = self.execute(&cmd.finalize()?)?;
        response.ensure_success().context("Load failed")?;
        let (handles, _name) = response.parameters(1)?;

        debug!("loaded object with handle 0x{:08x}", handles[0]);
        Ok(handles[0])
    }

    /// Prove `object` was created by this TPM, signed by `sign_handle`
    pub fn certify_creation(
        &mut self,
        sign_handle: u32,
        sign_auth: &[u8],
        object: u32,
        qualifying_data: &[u8],
        creation_hash: &[u8],
        ticket: &TpmtTkCreation,
    ) -> Result<(Vec<u8>, TpmtSignature)> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::CertifyCreation);
        cmd.add_handle(sign_handle);
        cmd.add_handle(object);
        cmd.add_auth_area(&[AuthCommand::password(sign_auth)]);
        cmd.add_tpm2b(qualifying_data);
        cmd.add_tpm2b(creation_hash);
        // inScheme: the key's own scheme
        cmd.add(&TpmtSigScheme::null());
        cmd.add(ticket);

        let response = self.execute(&cmd.finalize()?)?;
        response
            .ensure_success()
            .context("CertifyCreation failed")?;
        let (_, mut buf) = response.parameters(0)?;
        let certify_info = buf.get_tpm2b()?;
        let signature = TpmtSignature::unmarshal(&mut buf)?;
        Ok((certify_info, signature))
    }

    /// TPM2_ActivateCredential. `key_session` must satisfy the EK policy.
    pub fn activate_credential(
        &mut self,
        activate_handle: u32,
        activate_auth: &[u8],
        key_handle: u32,
        key_session: &AuthSession,
        credential_blob: &[u8],
        secret: &[u8],
    ) -> Result<Vec<u8>> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::ActivateCredential);
        cmd.add_handle(activate_handle);
        cmd.add_handle(key_handle);
        cmd.add_auth_area(&[
            AuthCommand::password(activate_auth),
            AuthCommand::policy(key_session.handle),
        ]);
        cmd.add_tpm2b(credential_blob);
        cmd.add_tpm2b(secret);

        let response = self.execute(&cmd.finalize()?)?;
        response
            .ensure_success()
            .context("ActivateCredential failed")?;
        let (_, mut buf) = response.parameters(0)?;
        buf.get_tpm2b()
    }

    pub fn flush_context(&mut self, handle: u32) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_handle(handle);

        let response = self.execute(&cmd.finalize()?)?;
        response
            .ensure_success()
            .with_context(|| format!("FlushContext 0x{handle:08x} failed"))
    }

    // ==================== PCR Operations ====================

    /// Read PCR values; the TPM may return only part of the selection, so
    /// the result lists exactly what came back as `(bank, index, digest)`.
    pub fn pcr_read(
        &mut self,
        selection: &TpmlPcrSelection,
    ) -> Result<Vec<(TpmAlgId, u32, Vec<u8>)>> {
        let mut cmd = TpmCommand::new(TpmCc::PcrRead);
        cmd.add(selection);

        let response = self.execute(&cmd.finalize()?)?;
        response.ensure_success().context("PCR_Read failed")?;
        let (_, mut buf) = response.parameters(0)?;
        let _update_counter = buf.get_u32()?;
        let selection_out = TpmlPcrSelection::unmarshal(&mut buf)?;
        let digests = TpmlDigest::unmarshal(&mut buf)?;

        let slots: Vec<(TpmAlgId, u32)> = selection_out
            .pcr_selections
            .iter()
            .flat_map(|sel| sel.selected().into_iter().map(move |i| (sel.hash, i)))
            .collect();
        if slots.len() != digests.digests.len() {
            bail!(
                "PCR_Read returned {} digests for {} selected PCRs",
                digests.digests.len(),
                slots.len()
            );
        }
        Ok(slots
            .into_iter()
            .zip(digests.digests)
            .map(|((bank, index), digest)| (bank, index, digest.buffer))
            .collect())
    }

    // ==================== Quote Operations ====================

    /// Quote `selection` with `sign_handle`, binding `qualifying_data`
    pub fn quote(
        &mut self,
        sign_handle: u32,
        sign_auth: &[u8],
        qualifying_data: &[u8],
        selection: &TpmlPcrSelection,
    ) -> Result<(Vec<u8>, TpmtSignature)> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::Quote);
        cmd.add_handle(sign_handle);
        cmd.add_auth_area(&[AuthCommand::password(sign_auth)]);
        cmd.add_tpm2b(qualifying_data);
        cmd.add(&TpmtSigScheme::null());
        cmd.add(selection);

        let response = self.execute(&cmd.finalize()?)?;
        response.ensure_success().context("Quote failed")?;
        let (_, mut buf) = response.parameters(0)?;
        let quoted = buf.get_tpm2b()?;
        let signature = TpmtSignature::unmarshal(&mut buf)?;

        debug!("generated TPM quote, {} bytes", quoted.len());
        Ok((quoted, signature))
    }

    // ==================== NV Operations ====================

    pub fn nv_read_public(&mut self, index: u32) -> Result<(TpmsNvPublic, Vec<u8>)> {
        let mut cmd = TpmCommand::new(TpmCc::NvReadPublic);
        cmd.add_handle(index);

        let response = self.execute(&cmd.finalize()?)?;
        response.ensure_success().context("NV_ReadPublic failed")?;
        let (_, mut buf) = response.parameters(0)?;
        let public = buf.get_sized::<TpmsNvPublic>()?;
        let name = buf.get_tpm2b()?;
        Ok((public, name))
    }

    fn nv_read_chunk(&mut self, auth: u32, index: u32, size: u16, offset: u16) -> Result<Vec<u8>> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::NvRead);
        cmd.add_handle(auth);
        cmd.add_handle(index);
        cmd.add_null_auth_area();
        cmd.add_u16(size);
        cmd.add_u16(offset);

        let response = self.execute(&cmd.finalize()?)?;
        response.ensure_success()?;
        let (_, mut buf) = response.parameters(0)?;
        buf.get_tpm2b()
    }

    /// Read a whole NV index. `Ok(None)` if the index is not defined.
    pub fn nv_read(&mut self, index: u32) -> Result<Option<Vec<u8>>> {
        let public = match self.nv_read_public(index) {
            Ok((public, _)) => public,
            Err(err) if err.downcast_ref::<TpmRcError>().is_some() => return Ok(None),
            Err(err) => return Err(err),
        };

        let total = public.data_size;
        let mut out = Vec::with_capacity(total as usize);
        // owner-readable indices first, then the index authorizing itself
        let mut auth = tpm_rh::OWNER;
        while out.len() < total as usize {
            let offset = out.len() as u16;
            let size = (total - offset).min(NV_READ_CHUNK);
            let chunk = match self.nv_read_chunk(auth, index, size, offset) {
                Ok(chunk) => chunk,
                Err(_) if auth == tpm_rh::OWNER && offset == 0 => {
                    auth = index;
                    continue;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("NV_Read 0x{index:08x}"));
                }
            };
            if chunk.is_empty() {
                return Err(anyhow!("NV_Read 0x{index:08x} returned no data"));
            }
            out.extend_from_slice(&chunk);
        }
        Ok(Some(out))
    }
}
