// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TCG credential protection
//!
//! MakeCredential / ActivateCredential for ECC endorsement keys, the KDFa and
//! KDFe key derivation functions they rest on, and the AES-GCM envelope that
//! carries the credential string itself. The activated secret is the
//! AES-GCM key.

use aes::Aes128;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb_mode::{Decryptor, Encryptor};
use hmac::{Hmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{EncodedPoint, FieldBytes, PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tpm2::{CommandBuffer, Marshal, ResponseBuffer, TpmsEccPoint, TpmtPublic, Unmarshal};
use tpm_types::EncryptedCredential;

use crate::name::Name;

type HmacSha256 = Hmac<Sha256>;

pub const LABEL_IDENTITY: &str = "IDENTITY";
pub const LABEL_STORAGE: &str = "STORAGE";
pub const LABEL_INTEGRITY: &str = "INTEGRITY";

const GCM_NONCE_SIZE: usize = 12;

/// SP800-108 counter-mode KDF with HMAC-SHA256, as TPM2 KDFa
pub fn kdfa(
    key: &[u8],
    label: &str,
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> Result<Vec<u8>> {
    let len = bits.div_ceil(8) as usize;
    let mut out = Vec::with_capacity(len + 32);
    let mut counter = 0u32;
    while out.len() < len {
        counter += 1;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|_| anyhow!("invalid KDFa key"))?;
        mac.update(&counter.to_be_bytes());
        mac.update(label.as_bytes());
        mac.update(&[0]);
        mac.update(context_u);
        mac.update(context_v);
        mac.update(&bits.to_be_bytes());
        out.extend_from_slice(&mac.finalize().into_bytes());
    }
    out.truncate(len);
    Ok(out)
}

/// SP800-56A concatenation KDF with SHA-256, as TPM2 KDFe
pub fn kdfe(z: &[u8], label: &str, party_u: &[u8], party_v: &[u8], bits: u32) -> Vec<u8> {
    let len = bits.div_ceil(8) as usize;
    let mut out = Vec::with_capacity(len + 32);
    let mut counter = 0u32;
    while out.len() < len {
        counter += 1;
        let mut hasher = Sha256::new();
        hasher.update(counter.to_be_bytes());
        hasher.update(z);
        hasher.update(label.as_bytes());
        hasher.update([0]);
        hasher.update(party_u);
        hasher.update(party_v);
        out.extend_from_slice(&hasher.finalize());
    }
    out.truncate(len);
    out
}

fn hmac(key: &[u8], parts: &[&[u8]]) -> Result<HmacSha256> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| anyhow!("invalid HMAC key"))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac)
}

/// Encrypt `plaintext` under `seed` bound to `name`:
/// `TPM2B(HMAC(enc || name)) || enc` with `enc = AES-128-CFB(plaintext)`.
/// This is the layout of both a TPM private blob and an ID object.
pub fn protect(seed: &[u8], name: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let sym_key = kdfa(seed, LABEL_STORAGE, name, &[], 128)?;
    let hmac_key = kdfa(seed, LABEL_INTEGRITY, &[], &[], 256)?;

    let mut encrypted = plaintext.to_vec();
    Encryptor::<Aes128>::new_from_slices(&sym_key, &[0u8; 16])
        .map_err(|_| anyhow!("invalid CFB key"))?
        .encrypt(&mut encrypted);

    let integrity = hmac(&hmac_key, &[&encrypted, name])?.finalize().into_bytes();
    let mut out = CommandBuffer::with_capacity(2 + integrity.len() + encrypted.len());
    out.put_tpm2b(&integrity);
    out.put_bytes(&encrypted);
    out.finish()
}

/// Inverse of [`protect`]; the integrity check runs before decryption
pub fn unprotect(seed: &[u8], name: &[u8], blob: &[u8]) -> Result<Vec<u8>> {
    let mut buf = ResponseBuffer::new(blob);
    let integrity = buf.get_tpm2b().context("integrity HMAC")?;
    let mut encrypted = buf.get_remaining();

    let hmac_key = kdfa(seed, LABEL_INTEGRITY, &[], &[], 256)?;
    hmac(&hmac_key, &[&encrypted, name])?
        .verify_slice(&integrity)
        .map_err(|_| anyhow!("integrity check failed"))?;

    let sym_key = kdfa(seed, LABEL_STORAGE, name, &[], 128)?;
    Decryptor::<Aes128>::new_from_slices(&sym_key, &[0u8; 16])
        .map_err(|_| anyhow!("invalid CFB key"))?
        .decrypt(&mut encrypted);
    Ok(encrypted)
}

pub(crate) fn ecc_public_key(point: &TpmsEccPoint) -> Result<PublicKey> {
    if point.x.len() != 32 || point.y.len() != 32 {
        bail!("not a P-256 point");
    }
    let encoded = EncodedPoint::from_affine_coordinates(
        FieldBytes::from_slice(&point.x),
        FieldBytes::from_slice(&point.y),
        false,
    );
    PublicKey::from_sec1_bytes(encoded.as_bytes()).context("invalid P-256 point")
}

pub(crate) fn ecc_point(public: &PublicKey) -> Result<TpmsEccPoint> {
    let encoded = public.to_encoded_point(false);
    match (encoded.x(), encoded.y()) {
        (Some(x), Some(y)) => Ok(TpmsEccPoint {
            x: x.to_vec(),
            y: y.to_vec(),
        }),
        _ => bail!("point at infinity"),
    }
}

/// TPM2_MakeCredential against an ECC endorsement key. Returns the
/// TPM2B_ID_OBJECT and TPM2B_ENCRYPTED_SECRET contents.
pub fn make_credential(
    ek_public: &TpmtPublic,
    object_name: &[u8],
    secret: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let ek_point = ek_public
        .ecc_point()
        .context("credentials can only be made for ECC endorsement keys")?;
    let ek_key = ecc_public_key(ek_point)?;

    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_point = ecc_point(&ephemeral.public_key())?;
    let shared = ephemeral.diffie_hellman(&ek_key);

    let seed = kdfe(
        shared.raw_secret_bytes(),
        LABEL_IDENTITY,
        &ephemeral_point.x,
        &ek_point.x,
        256,
    );

    let mut credential = CommandBuffer::new();
    credential.put_tpm2b(secret);
    let id_object = protect(&seed, object_name, &credential.finish()?)?;
    Ok((id_object, ephemeral_point.to_bytes()))
}

/// TPM2_ActivateCredential with the private half of an ECC endorsement key
pub fn activate_credential(
    ek_secret: &SecretKey,
    ek_point: &TpmsEccPoint,
    object_name: &[u8],
    id_object: &[u8],
    encrypted_secret: &[u8],
) -> Result<Vec<u8>> {
    let ephemeral_point =
        TpmsEccPoint::from_bytes(encrypted_secret).context("malformed encrypted secret")?;
    let ephemeral = ecc_public_key(&ephemeral_point)?;
    let shared = p256::ecdh::diffie_hellman(ek_secret.to_nonzero_scalar(), ephemeral.as_affine());

    let seed = kdfe(
        shared.raw_secret_bytes(),
        LABEL_IDENTITY,
        &ephemeral_point.x,
        &ek_point.x,
        256,
    );
    let credential = unprotect(&seed, object_name, id_object)?;
    let mut buf = ResponseBuffer::new(&credential);
    let secret = buf.get_tpm2b().context("credential")?;
    buf.finish()?;
    Ok(secret)
}

/// AES-GCM encrypt with a 16- or 32-byte key; returns `(nonce, ciphertext)`
pub fn seal_payload(key: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut nonce = vec![0u8; GCM_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    let nonce_ref = Nonce::from_slice(&nonce);
    let ciphertext = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| anyhow!("invalid AES-128 key"))?
            .encrypt(nonce_ref, plaintext),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| anyhow!("invalid AES-256 key"))?
            .encrypt(nonce_ref, plaintext),
        n => bail!("unsupported credential key size {n}"),
    }
    .map_err(|_| anyhow!("credential encryption failed"))?;
    Ok((nonce, ciphertext))
}

pub fn open_payload(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != GCM_NONCE_SIZE {
        bail!("invalid credential nonce size {}", nonce.len());
    }
    let nonce = Nonce::from_slice(nonce);
    match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| anyhow!("invalid AES-128 key"))?
            .decrypt(nonce, ciphertext),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| anyhow!("invalid AES-256 key"))?
            .decrypt(nonce, ciphertext),
        n => bail!("unsupported credential key size {n}"),
    }
    .map_err(|_| anyhow!("credential decryption failed"))
}

/// Decrypt the credential string once the anchor has released its key
pub fn open_credential(secret: &[u8], credential: &EncryptedCredential) -> Result<String> {
    let plaintext = open_payload(secret, &credential.nonce, &credential.ciphertext)?;
    String::from_utf8(plaintext).context("credential is not UTF-8")
}

/// Backend side: protect `credential` for the key `key_public` held by the
/// TPM owning `ek_public`
pub fn issue_credential(
    ek_public: &TpmtPublic,
    key_public: &TpmtPublic,
    credential: &str,
) -> Result<EncryptedCredential> {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    let name = Name::of_public(key_public)?.to_bytes();
    let (id_object, encrypted_secret) = make_credential(ek_public, &name, &secret)?;
    let (nonce, ciphertext) = seal_payload(&secret, credential.as_bytes())?;
    Ok(EncryptedCredential {
        credential: id_object,
        secret: encrypted_secret,
        nonce,
        ciphertext,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ek_pair() -> (SecretKey, TpmtPublic) {
        let secret = SecretKey::random(&mut OsRng);
        let mut public = TpmtPublic::ecc_ek_template();
        public.unique = tpm2::TpmtPublicUnique::Ecc(ecc_point(&secret.public_key()).unwrap());
        (secret, public)
    }

    #[test]
    fn test_kdfa_lengths_and_determinism() {
        let a = kdfa(b"seed", LABEL_STORAGE, b"name", &[], 128).unwrap();
        assert_eq!(a.len(), 16);
        assert_eq!(a, kdfa(b"seed", LABEL_STORAGE, b"name", &[], 128).unwrap());
        // the requested size is part of the derivation
        let long = kdfa(b"seed", LABEL_STORAGE, b"name", &[], 512).unwrap();
        assert_eq!(long.len(), 64);
        assert_ne!(&long[..16], &a[..]);
        assert_ne!(a, kdfa(b"seed", LABEL_INTEGRITY, b"name", &[], 128).unwrap());
    }

    #[test]
    fn test_kdfe_first_block() {
        let out = kdfe(b"z", "L", b"u", b"v", 256);
        let expected = Sha256::digest(b"\x00\x00\x00\x01zL\x00uv");
        assert_eq!(out, expected.to_vec());
    }

    #[test]
    fn test_wrap_detects_tampering() {
        let blob = protect(b"seed", b"name", b"sensitive").unwrap();
        assert_eq!(unprotect(b"seed", b"name", &blob).unwrap(), b"sensitive");
        assert!(unprotect(b"seed", b"other", &blob).is_err());
        let mut tampered = blob.clone();
        if let Some(last) = tampered.last_mut() {
            *last ^= 1;
        }
        assert!(unprotect(b"seed", b"name", &tampered).is_err());
    }

    #[test]
    fn test_make_and_activate() {
        let (ek_secret, ek_public) = ek_pair();
        let name = Name::of_public(&TpmtPublic::ecc_signing_key(true))
            .unwrap()
            .to_bytes();
        let (id_object, encrypted) = make_credential(&ek_public, &name, b"0123456789abcdef").unwrap();

        let ek_point = ek_public.ecc_point().unwrap();
        let secret =
            activate_credential(&ek_secret, ek_point, &name, &id_object, &encrypted).unwrap();
        assert_eq!(secret, b"0123456789abcdef");

        // bound to the object's Name
        let wrong = Name::of_public(&TpmtPublic::ecc_storage_key())
            .unwrap()
            .to_bytes();
        assert!(activate_credential(&ek_secret, ek_point, &wrong, &id_object, &encrypted).is_err());

        // and to the endorsement key
        let (other_secret, _) = ek_pair();
        assert!(activate_credential(&other_secret, ek_point, &name, &id_object, &encrypted).is_err());
    }

    #[test]
    fn test_issue_and_open() {
        let (ek_secret, ek_public) = ek_pair();
        let key_public = TpmtPublic::ecc_signing_key(true);
        let issued = issue_credential(&ek_public, &key_public, "device-42").unwrap();

        let name = Name::of_public(&key_public).unwrap().to_bytes();
        let secret = activate_credential(
            &ek_secret,
            ek_public.ecc_point().unwrap(),
            &name,
            &issued.credential,
            &issued.secret,
        )
        .unwrap();
        assert_eq!(open_credential(&secret, &issued).unwrap(), "device-42");
    }

    #[test]
    fn test_payload_key_sizes() {
        for key in [vec![7u8; 16], vec![7u8; 32]] {
            let (nonce, ct) = seal_payload(&key, b"hello").unwrap();
            assert_eq!(open_payload(&key, &nonce, &ct).unwrap(), b"hello");
        }
        assert!(seal_payload(&[0u8; 20], b"hello").is_err());
        let (nonce, ct) = seal_payload(&[1u8; 16], b"hello").unwrap();
        assert!(open_payload(&[2u8; 16], &nonce, &ct).is_err());
    }

    #[test]
    fn test_rsa_ek_is_rejected() {
        let result = make_credential(&TpmtPublic::rsa_ek_template(), b"name", b"secret");
        assert!(result.is_err());
    }
}
