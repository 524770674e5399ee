// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Key hierarchy: endorsement key, root key and device keys

use anyhow::{anyhow, bail, Context};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature as EcdsaSignature, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use tpm2::{tpm_rh, Marshal, TpmtPublic, Unmarshal};
use tpm_types::{
    DeviceKey, EnrollKey, KeyAlgorithm, KeyTemplate, KeyUsage, RootKeyState, Signature,
};
use tracing::{debug, info, warn};

use crate::anchor::{Handle, TrustAnchor};
use crate::credential::ecc_public_key;
use crate::error::{Error, Result};
use crate::name::{compute_name, tpm_alg, Entity, Name};

pub const AUTH_SIZE: usize = 32;

/// Fresh authorization secret for a new key
pub fn random_auth() -> Vec<u8> {
    let mut auth = vec![0u8; AUTH_SIZE];
    OsRng.fill_bytes(&mut auth);
    auth
}

/// The creation template for a configured key
pub fn template_public(template: &KeyTemplate) -> Result<TpmtPublic> {
    let mut public = match (template.algorithm, template.usage) {
        (KeyAlgorithm::EccP256, KeyUsage::Sign) => TpmtPublic::ecc_signing_key(template.restricted),
        (KeyAlgorithm::Rsa2048, KeyUsage::Sign) => TpmtPublic::rsa_signing_key(template.restricted),
        (_, KeyUsage::Storage) if !template.restricted => {
            return Err(Error::invalid("storage keys must be restricted"));
        }
        (KeyAlgorithm::EccP256, KeyUsage::Storage) => TpmtPublic::ecc_storage_key(),
        (KeyAlgorithm::Rsa2048, KeyUsage::Storage) => TpmtPublic::rsa_storage_key(),
    };
    public.name_alg = tpm_alg(template.name_alg);
    Ok(public)
}

/// Qualified Name of a primary key in the endorsement hierarchy
pub fn root_name(root_public: &TpmtPublic) -> Result<Name> {
    compute_name(&[
        Entity::Handle(tpm_rh::ENDORSEMENT),
        Entity::Public(root_public),
    ])
}

fn flush_quietly<A: TrustAnchor + ?Sized>(anchor: &mut A, handle: Handle) {
    if let Err(err) = anchor.flush(handle) {
        warn!("failed to flush handle: {}", err.diagnostic());
    }
}

/// Create the root key with a fresh auth secret and record its identity
pub fn create_root<A: TrustAnchor + ?Sized>(
    anchor: &mut A,
    endorsement_auth: &[u8],
    template: &KeyTemplate,
) -> Result<(Handle, TpmtPublic, RootKeyState)> {
    let public = template_public(template)?;
    let auth = random_auth();
    let (handle, root_public) = anchor.create_and_load_root(endorsement_auth, &auth, &public)?;
    match root_name(&root_public) {
        Ok(name) => {
            info!("created root key {}", hex::encode(name.to_bytes()));
            let state = RootKeyState {
                auth,
                name: name.to_bytes(),
            };
            Ok((handle, root_public, state))
        }
        Err(err) => {
            flush_quietly(anchor, handle);
            Err(err)
        }
    }
}

/// Recreate the root key and make sure it is the one recorded at enrollment
pub fn load_verified_root<A: TrustAnchor + ?Sized>(
    anchor: &mut A,
    endorsement_auth: &[u8],
    state: &RootKeyState,
    template: &KeyTemplate,
) -> Result<Handle> {
    let expected = Name::from_bytes(&state.name)
        .map_err(|err| Error::RootKey(anyhow!("corrupt root Name in state: {}", err)))?;
    let public = template_public(template)?;
    let (handle, root_public) =
        anchor.create_and_load_root(endorsement_auth, &state.auth, &public)?;
    let actual = match root_name(&root_public) {
        Ok(name) => name,
        Err(err) => {
            flush_quietly(anchor, handle);
            return Err(err);
        }
    };
    if actual != expected {
        flush_quietly(anchor, handle);
        return Err(Error::RootKey(anyhow!(
            "root key Name {} does not match enrolled {}",
            hex::encode(actual.to_bytes()),
            hex::encode(&state.name)
        )));
    }
    debug!("root key matches enrollment");
    Ok(handle)
}

/// Create and certify one device key. Returns what is persisted and what
/// goes into the enrollment request.
pub fn create_device_key<A: TrustAnchor + ?Sized>(
    anchor: &mut A,
    root: &Handle,
    root_auth: &[u8],
    template: &KeyTemplate,
) -> Result<(DeviceKey, EnrollKey)> {
    let public = template_public(template)?;
    let auth = random_auth();
    let (certified, private) =
        anchor.create_and_certify_device_key(root, root_auth, &public, &auth)?;
    let public = certified.public.to_bytes();
    Ok((
        DeviceKey {
            public: public.clone(),
            private,
            auth,
            credential: String::new(),
        },
        EnrollKey {
            public,
            certify_info: certified.certify_info,
            signature: certified.signature,
        },
    ))
}

pub fn load_device_key<A: TrustAnchor + ?Sized>(
    anchor: &mut A,
    root: &Handle,
    root_auth: &[u8],
    key: &DeviceKey,
) -> Result<Handle> {
    let public = TpmtPublic::from_bytes(&key.public)
        .context("corrupt device key public area")
        .map_err(Error::Aik)?;
    anchor.load_device_key(root, root_auth, &public, &key.private)
}

fn left_pad(value: &[u8]) -> anyhow::Result<[u8; 32]> {
    if value.len() > 32 {
        bail!("signature component too long");
    }
    let mut out = [0u8; 32];
    out[32 - value.len()..].copy_from_slice(value);
    Ok(out)
}

/// Check an ECDSA/SHA-256 signature made by a P-256 key
pub fn verify_signature(
    public: &TpmtPublic,
    message: &[u8],
    signature: &Signature,
) -> anyhow::Result<()> {
    let point = public
        .ecc_point()
        .ok_or_else(|| anyhow!("only ECC signatures can be verified"))?;
    let ecc = signature
        .ecc
        .as_ref()
        .ok_or_else(|| anyhow!("signature has no ECC component"))?;
    let key = VerifyingKey::from(ecc_public_key(point)?);
    let signature = EcdsaSignature::from_scalars(left_pad(&ecc.r)?, left_pad(&ecc.s)?)
        .context("malformed ECDSA signature")?;
    key.verify(message, &signature)
        .context("signature verification failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::SoftwareAnchor;
    use tpm_types::HashAlgorithm;

    #[test]
    fn test_template_conversion() {
        let public = template_public(&KeyTemplate::ecc_attestation()).unwrap();
        assert!(public
            .object_attributes
            .has(tpm2::TpmaObject::RESTRICTED));
        assert_eq!(public.name_alg, tpm2::TpmAlgId::Sha256);

        let sha1 = KeyTemplate {
            name_alg: HashAlgorithm::Sha1,
            ..KeyTemplate::ecc_storage()
        };
        assert_eq!(template_public(&sha1).unwrap().name_alg, tpm2::TpmAlgId::Sha1);

        let loose_storage = KeyTemplate {
            restricted: false,
            ..KeyTemplate::ecc_storage()
        };
        assert!(matches!(
            template_public(&loose_storage),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_root_survives_restart_but_not_reset() {
        let mut anchor = SoftwareAnchor::new();
        let template = KeyTemplate::ecc_storage();
        let (root, _, state) = create_root(&mut anchor, &[], &template).unwrap();
        anchor.flush(root).unwrap();
        assert_eq!(state.auth.len(), AUTH_SIZE);

        let root = load_verified_root(&mut anchor, &[], &state, &template).unwrap();
        anchor.flush(root).unwrap();

        anchor.reset();
        assert!(matches!(
            load_verified_root(&mut anchor, &[], &state, &template),
            Err(Error::RootKey(_))
        ));
        assert_eq!(anchor.loaded_objects(), 0);
    }

    #[test]
    fn test_device_key_round_trip() {
        let mut anchor = SoftwareAnchor::new();
        let (root, _, state) = create_root(&mut anchor, &[], &KeyTemplate::ecc_storage()).unwrap();
        let (key, enroll) =
            create_device_key(&mut anchor, &root, &state.auth, &KeyTemplate::ecc_attestation())
                .unwrap();
        assert_eq!(key.public, enroll.public);
        assert!(!key.is_activated());

        let public = TpmtPublic::from_bytes(&enroll.public).unwrap();
        verify_signature(&public, &enroll.certify_info, &enroll.signature).unwrap();
        assert!(verify_signature(&public, b"other message", &enroll.signature).is_err());

        let stored: DeviceKey =
            serde_json::from_str(&serde_json::to_string(&key).unwrap()).unwrap();
        assert_eq!(stored, key);
        let handle = load_device_key(&mut anchor, &root, &state.auth, &stored).unwrap();
        anchor.flush(handle).unwrap();

        let corrupt = DeviceKey {
            public: vec![0xff; 4],
            ..stored
        };
        assert!(matches!(
            load_device_key(&mut anchor, &root, &state.auth, &corrupt),
            Err(Error::Aik(_))
        ));
        anchor.flush(root).unwrap();
    }

    #[test]
    fn test_corrupt_root_name_is_a_root_error() {
        let mut anchor = SoftwareAnchor::new();
        let state = RootKeyState {
            auth: vec![1; 32],
            name: vec![0xde, 0xad],
        };
        assert!(matches!(
            load_verified_root(&mut anchor, &[], &state, &KeyTemplate::ecc_storage()),
            Err(Error::RootKey(_))
        ));
    }
}
