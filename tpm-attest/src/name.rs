// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TCG Names and QualifiedNames
//!
//! The Name of an object is `nameAlg || H_nameAlg(TPMT_PUBLIC)`; permanent
//! and session handles are named by their four handle bytes. A
//! QualifiedName folds the Names along a path from a hierarchy root:
//! `QN(child) = tag(child) || H_child(QN(parent) || Name(child))`, both
//! taken without their algorithm tag.

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tpm2::{Marshal, TpmAlgId, TpmHt, TpmsNvPublic, TpmtPublic};
use tpm_types::HashAlgorithm;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Name {
    Handle(u32),
    Digest { alg: HashAlgorithm, digest: Vec<u8> },
}

/// One element of a path passed to [`compute_name`]
#[derive(Debug, Clone, Copy)]
pub enum Entity<'a> {
    Handle(u32),
    Public(&'a TpmtPublic),
    NvPublic(&'a TpmsNvPublic),
    Name(&'a Name),
}

impl Name {
    pub fn of_public(public: &TpmtPublic) -> Result<Self> {
        let alg = hash_algorithm(public.name_alg)?;
        Ok(Name::Digest {
            alg,
            digest: hash(alg, &[&public.to_bytes()]),
        })
    }

    pub fn of_nv(public: &TpmsNvPublic) -> Result<Self> {
        let alg = hash_algorithm(public.name_alg)?;
        Ok(Name::Digest {
            alg,
            digest: hash(alg, &[&public.to_bytes()]),
        })
    }

    /// Name of a bare handle; only root-capable handle classes have one
    pub fn of_handle(handle: u32) -> Result<Self> {
        match TpmHt::of(handle) {
            Some(TpmHt::Pcr | TpmHt::HmacSession | TpmHt::PolicySession | TpmHt::Permanent) => {
                Ok(Name::Handle(handle))
            }
            _ => Err(Error::invalid(format!(
                "handle 0x{handle:08x} has no Name of its own"
            ))),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Name::Handle(handle) => handle.to_be_bytes().to_vec(),
            Name::Digest { alg, digest } => {
                let mut out = Vec::with_capacity(2 + digest.len());
                out.extend_from_slice(&tpm_alg(*alg).to_u16().to_be_bytes());
                out.extend_from_slice(digest);
                out
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if let Ok(raw) = <[u8; 4]>::try_from(bytes) {
            return Ok(Name::Handle(u32::from_be_bytes(raw)));
        }
        let Some((tag, digest)) = bytes.split_first_chunk::<2>() else {
            return Err(Error::invalid(format!("{}-byte Name", bytes.len())));
        };
        let alg_id = u16::from_be_bytes(*tag);
        let alg = TpmAlgId::from_u16(alg_id)
            .ok_or_else(|| Error::invalid(format!("unknown Name algorithm 0x{alg_id:04x}")))
            .and_then(hash_algorithm)?;
        if digest.len() != alg.digest_size() {
            return Err(Error::invalid(format!(
                "{alg} Name with a {}-byte digest",
                digest.len()
            )));
        }
        Ok(Name::Digest {
            alg,
            digest: digest.to_vec(),
        })
    }

    fn without_tag(&self) -> Vec<u8> {
        match self {
            Name::Handle(handle) => handle.to_be_bytes().to_vec(),
            Name::Digest { digest, .. } => digest.clone(),
        }
    }
}

impl Entity<'_> {
    fn name(&self) -> Result<Name> {
        match self {
            Entity::Handle(handle) => Name::of_handle(*handle),
            Entity::Public(public) => Name::of_public(public),
            Entity::NvPublic(public) => Name::of_nv(public),
            Entity::Name(name) => Ok((*name).clone()),
        }
    }
}

/// QualifiedName of the last entity of `path`, or the plain Name for a
/// single-element path. The first element may be a root handle, a Name or
/// a public area; later elements must be objects or NV indices.
pub fn compute_name(path: &[Entity]) -> Result<Name> {
    let (first, rest) = path
        .split_first()
        .ok_or_else(|| Error::invalid("empty Name path"))?;

    let mut qualified = first.name()?;
    for entity in rest {
        let Name::Digest { alg, digest } = entity.name()? else {
            return Err(Error::invalid("a handle cannot be derived from a parent"));
        };
        qualified = Name::Digest {
            alg,
            digest: hash(alg, &[&qualified.without_tag(), &digest]),
        };
    }
    Ok(qualified)
}

pub fn hash(alg: HashAlgorithm, parts: &[&[u8]]) -> Vec<u8> {
    fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
        let mut hasher = D::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().to_vec()
    }
    match alg {
        HashAlgorithm::Sha1 => run::<Sha1>(parts),
        HashAlgorithm::Sha256 => run::<Sha256>(parts),
        HashAlgorithm::Sha384 => run::<Sha384>(parts),
        HashAlgorithm::Sha512 => run::<Sha512>(parts),
    }
}

pub fn hash_algorithm(alg: TpmAlgId) -> Result<HashAlgorithm> {
    match alg {
        TpmAlgId::Sha1 => Ok(HashAlgorithm::Sha1),
        TpmAlgId::Sha256 => Ok(HashAlgorithm::Sha256),
        TpmAlgId::Sha384 => Ok(HashAlgorithm::Sha384),
        TpmAlgId::Sha512 => Ok(HashAlgorithm::Sha512),
        other => Err(Error::invalid(format!("{other:?} is not a hash algorithm"))),
    }
}

pub fn tpm_alg(alg: HashAlgorithm) -> TpmAlgId {
    match alg {
        HashAlgorithm::Sha1 => TpmAlgId::Sha1,
        HashAlgorithm::Sha256 => TpmAlgId::Sha256,
        HashAlgorithm::Sha384 => TpmAlgId::Sha384,
        HashAlgorithm::Sha512 => TpmAlgId::Sha512,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm2::{tpm_rh, TpmaNv};

    fn child() -> TpmtPublic {
        let mut public = TpmtPublic::ecc_signing_key(true);
        public.unique = tpm2::TpmtPublicUnique::Ecc(tpm2::TpmsEccPoint {
            x: vec![0x11; 32],
            y: vec![0x22; 32],
        });
        public
    }

    #[test]
    fn test_public_name_layout() {
        let public = TpmtPublic::ecc_storage_key();
        let name = Name::of_public(&public).unwrap();
        let bytes = name.to_bytes();
        assert_eq!(bytes.len(), 34);
        assert_eq!(&bytes[..2], &[0x00, 0x0b]);
        assert_eq!(bytes[2..], Sha256::digest(public.to_bytes())[..]);
        assert_eq!(Name::from_bytes(&bytes).unwrap(), name);
    }

    #[test]
    fn test_substitution_invariance() {
        let root = TpmtPublic::ecc_storage_key();
        let key = child();

        let full = compute_name(&[
            Entity::Handle(tpm_rh::ENDORSEMENT),
            Entity::Public(&root),
            Entity::Public(&key),
        ])
        .unwrap();

        let root_qn =
            compute_name(&[Entity::Handle(tpm_rh::ENDORSEMENT), Entity::Public(&root)]).unwrap();
        let via_qn = compute_name(&[Entity::Name(&root_qn), Entity::Public(&key)]).unwrap();
        assert_eq!(full, via_qn);

        let root_name = Name::of_public(&root).unwrap();
        let via_name = compute_name(&[
            Entity::Handle(tpm_rh::ENDORSEMENT),
            Entity::Name(&root_name),
            Entity::Public(&key),
        ])
        .unwrap();
        assert_eq!(full, via_name);

        let key_name = Name::of_public(&key).unwrap();
        let via_names = compute_name(&[
            Entity::Handle(tpm_rh::ENDORSEMENT),
            Entity::Name(&root_name),
            Entity::Name(&key_name),
        ])
        .unwrap();
        assert_eq!(full, via_names);
    }

    #[test]
    fn test_fold_uses_untagged_inputs() {
        let root = TpmtPublic::ecc_storage_key();
        let qn =
            compute_name(&[Entity::Handle(tpm_rh::ENDORSEMENT), Entity::Public(&root)]).unwrap();
        let mut expected = Sha256::new();
        expected.update(tpm_rh::ENDORSEMENT.to_be_bytes());
        expected.update(Sha256::digest(root.to_bytes()));
        assert_eq!(
            qn,
            Name::Digest {
                alg: HashAlgorithm::Sha256,
                digest: expected.finalize().to_vec(),
            }
        );
    }

    #[test]
    fn test_nv_index_name() {
        let nv = TpmsNvPublic::new(0x01C00002, 1024, TpmaNv(TpmaNv::OWNER_READ));
        let name = compute_name(&[Entity::NvPublic(&nv)]).unwrap();
        assert_eq!(name, Name::of_nv(&nv).unwrap());
    }

    #[test]
    fn test_invalid_paths() {
        assert!(matches!(compute_name(&[]), Err(Error::InvalidInput(_))));
        // transient object handles are not roots
        assert!(matches!(
            compute_name(&[Entity::Handle(0x80000001)]),
            Err(Error::InvalidInput(_))
        ));
        let root = TpmtPublic::ecc_storage_key();
        assert!(matches!(
            compute_name(&[Entity::Public(&root), Entity::Handle(tpm_rh::OWNER)]),
            Err(Error::InvalidInput(_))
        ));
        let mut odd = root.clone();
        odd.name_alg = TpmAlgId::Null;
        assert!(matches!(
            compute_name(&[Entity::Public(&odd)]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_reserved_roots() {
        for handle in [0x00000007, 0x02000000, 0x03000001, tpm_rh::OWNER] {
            assert_eq!(
                compute_name(&[Entity::Handle(handle)]).unwrap(),
                Name::Handle(handle)
            );
        }
    }

    #[test]
    fn test_name_from_bytes_rejects_garbage() {
        assert!(Name::from_bytes(&[0x00]).is_err());
        assert!(Name::from_bytes(&[0x00, 0x0b, 0x01, 0x02, 0x03]).is_err());
        assert!(Name::from_bytes(&[0x00, 0x06, 0x01, 0x02, 0x03, 0x04, 0x05]).is_err());
        assert_eq!(
            Name::from_bytes(&[0x40, 0x00, 0x00, 0x0b]).unwrap(),
            Name::Handle(tpm_rh::ENDORSEMENT)
        );
    }
}
