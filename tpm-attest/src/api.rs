// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Seams to the collaborators outside the core: the backend wire client and
//! the firmware collector.

use thiserror::Error;
use tpm_types::{EnrollRequest, EnrollResponse, Evidence, Verdict};

/// Failures reported by the backend client
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("backend rejected the device credentials")]
    Unauthorized,
    #[error("backend rejected the request: {0}")]
    BadRequest(String),
    #[error("backend unreachable")]
    NetworkUnreachable,
    #[error("backend failure: {0}")]
    ServerError(String),
    #[error("subscription payment required")]
    PaymentRequired,
    #[error(transparent)]
    Other(anyhow::Error),
}

/// The backend wire client
pub trait Backend {
    fn enroll(&mut self, request: &EnrollRequest) -> Result<EnrollResponse, ApiError>;

    fn attest(&mut self, evidence: &Evidence) -> Result<Verdict, ApiError>;
}

/// Produces the firmware record for a backend-supplied probe list
pub trait FirmwareCollector {
    fn collect(&mut self, probes: &serde_json::Value) -> anyhow::Result<Vec<u8>>;
}

/// A collector that always returns the same record
#[derive(Debug, Clone)]
pub struct StaticFirmware(pub Vec<u8>);

impl FirmwareCollector for StaticFirmware {
    fn collect(&mut self, _probes: &serde_json::Value) -> anyhow::Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}
