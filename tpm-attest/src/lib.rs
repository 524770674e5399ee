// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 attestation agent core
//!
//! Enrolls a device's key hierarchy with a backend and produces quote-based
//! evidence of its platform state, using either a real TPM (local device,
//! simulator or proxy) or an in-process software anchor.
//!
//! The backend client and the firmware collector live outside this crate and
//! plug in through [`Backend`] and [`FirmwareCollector`]. Persisting the
//! returned [`KeyHierarchyState`] is left to the caller; [`AgentConfig`]
//! offers a JSON state file for simple setups.

pub mod anchor;
pub mod api;
pub mod attest;
pub mod config;
pub mod credential;
pub mod enroll;
pub mod error;
pub mod keys;
pub mod name;
pub mod pcr;

pub use anchor::{open, with_handle, AnchorSelection, Handle, TrustAnchor};
pub use api::{ApiError, Backend, FirmwareCollector, StaticFirmware};
pub use attest::{attest, collect_evidence, Attestation};
pub use config::AgentConfig;
pub use enroll::{enroll, enroll_device, EnrollStage, Enrollment};
pub use error::{Error, OpenError, Result};
pub use name::{compute_name, Entity, Name};

pub use tpm_types::{
    Classification, Configuration, DeviceKey, Evidence, HashAlgorithm, KeyHierarchyState,
    PcrBanks, Verdict,
};
