// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Device enrollment
//!
//! Obtains the endorsement key, creates the root and every configured device
//! key, has the backend seal one credential per key to the endorsement key
//! and activates them. The result is the key hierarchy state for the caller
//! to persist.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::anyhow;
use tpm2::{Marshal, TpmtPublic, Unmarshal};
use tpm_types::{
    Configuration, DeviceKey, EnrollKey, EnrollRequest, KeyHierarchyState, RootKeyState,
};
use tracing::{info, warn};

use crate::anchor::{self, with_handle, Handle, TrustAnchor};
use crate::api::Backend;
use crate::attest::fresh_cookie;
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollStage {
    Idle,
    EkObtained,
    RootCreated,
    DeviceKeysCreated,
    Certified,
    BackendEnrolled,
    CredentialsActivated,
    Persisted,
}

impl fmt::Display for EnrollStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnrollStage::Idle => "idle",
            EnrollStage::EkObtained => "ek-obtained",
            EnrollStage::RootCreated => "root-created",
            EnrollStage::DeviceKeysCreated => "device-keys-created",
            EnrollStage::Certified => "certified",
            EnrollStage::BackendEnrolled => "backend-enrolled",
            EnrollStage::CredentialsActivated => "credentials-activated",
            EnrollStage::Persisted => "persisted",
        };
        f.write_str(name)
    }
}

fn stage(stage: EnrollStage) {
    info!(%stage, "enrollment");
}

/// Outcome of a completed enrollment
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub state: KeyHierarchyState,
    /// Keys whose credential was activated
    pub activated: Vec<String>,
    /// Keys that failed activation, with the reason. They stay in `state`
    /// with an empty credential.
    pub failed: BTreeMap<String, String>,
}

impl Enrollment {
    pub fn is_degraded(&self) -> bool {
        !self.failed.is_empty()
    }
}

struct Provisioned {
    root: RootKeyState,
    keys: BTreeMap<String, DeviceKey>,
    activated: Vec<String>,
    failed: BTreeMap<String, String>,
}

/// Self-check the creation certificates before handing them to the backend
fn check_certification(name: &str, key: &EnrollKey) -> Result<()> {
    if key.signature.is_empty() {
        return Err(Error::Enroll(anyhow!("key {name} has no creation signature")));
    }
    let public = TpmtPublic::from_bytes(&key.public).map_err(Error::Enroll)?;
    if public.ecc_point().is_some() {
        keys::verify_signature(&public, &key.certify_info, &key.signature)
            .map_err(|err| Error::Enroll(err.context(format!("certifying key {name}"))))?;
    }
    Ok(())
}

fn provision<A, B>(
    anchor: &mut A,
    configuration: &Configuration,
    endorsement_auth: &[u8],
    backend: &mut B,
    ek: &Handle,
    ek_public: &TpmtPublic,
    ek_certificate: Option<Vec<u8>>,
) -> Result<Provisioned>
where
    A: TrustAnchor + ?Sized,
    B: Backend + ?Sized,
{
    let (root, root_public, root_state) =
        keys::create_root(anchor, endorsement_auth, &configuration.root)?;
    stage(EnrollStage::RootCreated);

    with_handle(anchor, root, |anchor, root| {
        let mut device_keys = BTreeMap::new();
        let mut requested = BTreeMap::new();
        for (name, template) in &configuration.keys {
            let (key, enroll_key) =
                keys::create_device_key(anchor, root, &root_state.auth, template)?;
            device_keys.insert(name.clone(), key);
            requested.insert(name.clone(), enroll_key);
        }
        stage(EnrollStage::DeviceKeysCreated);

        for (name, key) in &requested {
            check_certification(name, key)?;
        }
        stage(EnrollStage::Certified);

        let request = EnrollRequest {
            ek_public: ek_public.to_bytes(),
            ek_certificate,
            root_public: root_public.to_bytes(),
            keys: requested,
            cookie: fresh_cookie(),
        };
        let response = backend.enroll(&request)?;
        stage(EnrollStage::BackendEnrolled);

        if response.credentials.len() < request.keys.len() {
            return Err(Error::ApiResponse(format!(
                "backend returned {} credentials for {} keys",
                response.credentials.len(),
                request.keys.len()
            )));
        }
        if let Some(missing) = device_keys
            .keys()
            .find(|name| !response.credentials.contains_key(*name))
        {
            return Err(Error::ApiResponse(format!("no credential for key {missing}")));
        }
        for name in response.credentials.keys() {
            if !device_keys.contains_key(name) {
                warn!("ignoring credential for unknown key {name}");
            }
        }

        let mut activated = Vec::new();
        let mut failed = BTreeMap::new();
        for (name, key) in device_keys.iter_mut() {
            let credential = &response.credentials[name];
            let result = keys::load_device_key(anchor, root, &root_state.auth, key).and_then(
                |handle| {
                    with_handle(anchor, handle, |anchor, handle| {
                        anchor.activate_device_key(
                            credential,
                            endorsement_auth,
                            &key.auth,
                            handle,
                            ek,
                        )
                    })
                },
            );
            match result {
                Ok(value) => {
                    key.credential = value;
                    activated.push(name.clone());
                }
                Err(err) => {
                    err.trace_chain();
                    warn!("activation of key {name} failed: {}", err.diagnostic());
                    failed.insert(name.clone(), err.diagnostic());
                }
            }
        }
        stage(EnrollStage::CredentialsActivated);

        Ok(Provisioned {
            root: root_state.clone(),
            keys: device_keys,
            activated,
            failed,
        })
    })
}

/// Enroll the device behind `anchor` with the backend
pub fn enroll<A, B>(
    anchor: &mut A,
    configuration: &Configuration,
    endorsement_auth: &[u8],
    backend: &mut B,
) -> Result<Enrollment>
where
    A: TrustAnchor + ?Sized,
    B: Backend + ?Sized,
{
    stage(EnrollStage::Idle);
    let primary = &configuration.primary_key;
    if !configuration.keys.contains_key(primary) {
        return Err(Error::Aik(anyhow!(
            "primary key {primary} is not in the configuration"
        )));
    }

    if let Err(err) = anchor.flush_all_handles() {
        warn!("failed to flush stale handles: {}", err.diagnostic());
    }

    let (ek, ek_public) = anchor.get_endorsement_key()?;
    let ek_certificate = match anchor.read_ek_certificate() {
        Ok(Some(cert)) => Some(cert),
        Ok(None) => {
            info!("TPM has no EK certificate");
            None
        }
        Err(err) => {
            warn!("failed to read EK certificate: {}", err.diagnostic());
            None
        }
    };
    stage(EnrollStage::EkObtained);

    let provisioned = with_handle(anchor, ek, |anchor, ek| {
        provision(
            anchor,
            configuration,
            endorsement_auth,
            backend,
            ek,
            &ek_public,
            ek_certificate.clone(),
        )
    })?;

    if let Some(reason) = provisioned.failed.get(primary) {
        return Err(Error::Aik(anyhow!(
            "primary key {primary} was not activated: {reason}"
        )));
    }
    if !provisioned.failed.is_empty() {
        warn!(
            "enrollment degraded, {} of {} keys activated",
            provisioned.activated.len(),
            provisioned.keys.len()
        );
    }

    let state = KeyHierarchyState {
        root: provisioned.root,
        keys: provisioned.keys,
        primary_key: primary.clone(),
        ek_certificate,
        software_anchor: anchor.software_state(),
    };
    stage(EnrollStage::Persisted);
    Ok(Enrollment {
        state,
        activated: provisioned.activated,
        failed: provisioned.failed,
    })
}

/// Open the configured anchor, enroll and close it again. `previous` carries
/// the software anchor state of an earlier run, if any.
pub fn enroll_device(
    config: &AgentConfig,
    configuration: &Configuration,
    previous: Option<&KeyHierarchyState>,
    backend: &mut dyn Backend,
) -> Result<Enrollment> {
    let selection = config.selection()?;
    let software_state = previous.and_then(|state| state.software_anchor.as_deref());
    let mut anchor = anchor::open(&selection, software_state)?;
    let result = enroll(anchor.as_mut(), configuration, &config.endorsement_auth, backend);
    if let Err(err) = anchor.close() {
        warn!("failed to close trust anchor: {}", err.diagnostic());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(EnrollStage::EkObtained.to_string(), "ek-obtained");
        assert_eq!(
            EnrollStage::CredentialsActivated.to_string(),
            "credentials-activated"
        );
    }

    #[test]
    fn test_unsigned_certification_is_rejected() {
        let key = EnrollKey {
            public: vec![],
            certify_info: vec![1, 2, 3],
            signature: Default::default(),
        };
        assert!(matches!(
            check_certification("aik", &key),
            Err(Error::Enroll(_))
        ));
    }
}
