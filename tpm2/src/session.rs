// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 session management

use anyhow::{Context, Result};
use tracing::debug;

use super::commands::TpmContext;
use super::constants::*;
use super::transport::*;
use super::types::*;

/// Authorization session handle
#[derive(Debug)]
pub struct AuthSession {
    pub handle: u32,
    pub session_type: TpmSe,
    pub hash_alg: TpmAlgId,
}

impl AuthSession {
    /// Start an unbound, unsalted session
    pub fn start(tpm: &mut TpmContext, session_type: TpmSe, hash_alg: TpmAlgId) -> Result<Self> {
        const ZERO_NONCE: [u8; 16] = [0u8; 16];

        let mut cmd = TpmCommand::new(TpmCc::StartAuthSession);
        // tpmKey
        cmd.add_handle(tpm_rh::NULL);
        // bind
        cmd.add_handle(tpm_rh::NULL);
        cmd.add_tpm2b(&ZERO_NONCE);
        // encryptedSalt
        cmd.add_tpm2b_empty();
        cmd.add_u8(session_type as u8);
        cmd.add(&TpmtSymDef::null());
        cmd.add_u16(hash_alg.to_u16());

        let response = tpm.execute(&cmd.finalize()?)?;
        response
            .ensure_success()
            .context("StartAuthSession failed")?;
        let (handles, _nonce_tpm) = response.parameters(1)?;
        debug!("started {session_type:?} session 0x{:08x}", handles[0]);

        Ok(Self {
            handle: handles[0],
            session_type,
            hash_alg,
        })
    }

    pub fn start_policy(tpm: &mut TpmContext, hash_alg: TpmAlgId) -> Result<Self> {
        Self::start(tpm, TpmSe::Policy, hash_alg)
    }

    /// Bind the policy to knowledge of `auth_handle`'s authorization value
    pub fn policy_secret(&self, tpm: &mut TpmContext, auth_handle: u32, auth: &[u8]) -> Result<()> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::PolicySecret);
        cmd.add_handle(auth_handle);
        cmd.add_handle(self.handle);
        cmd.add_auth_area(&[AuthCommand::password(auth)]);
        // nonceTPM, cpHashA, policyRef
        cmd.add_tpm2b_empty();
        cmd.add_tpm2b_empty();
        cmd.add_tpm2b_empty();
        // expiration
        cmd.add_u32(0);

        let response = tpm.execute(&cmd.finalize()?)?;
        response.ensure_success().context("PolicySecret failed")?;
        Ok(())
    }

    /// Unload the session
    pub fn flush(self, tpm: &mut TpmContext) -> Result<()> {
        tpm.flush_context(self.handle)
    }
}
