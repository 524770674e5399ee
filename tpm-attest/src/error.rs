// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

use crate::api::ApiError;

/// Why a trust anchor could not be opened
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("TPM 1.2 devices are not supported")]
    Tpm12Unsupported,
    #[error("invalid TPM selection: {0}")]
    InvalidSelection(String),
    #[error("no TPM available on this platform")]
    Unsupported(#[source] anyhow::Error),
    #[error("failed to open TPM transport")]
    Transport(#[source] anyhow::Error),
}

/// Errors surfaced by the attestation core
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open trust anchor: {0}")]
    OpenTrustAnchor(#[from] OpenError),
    #[error("endorsement key unavailable")]
    EndorsementKey(#[source] anyhow::Error),
    #[error("root key unavailable or changed, re-enrollment required")]
    RootKey(#[source] anyhow::Error),
    #[error("no usable attestation key")]
    Aik(#[source] anyhow::Error),
    #[error("failed to read PCRs")]
    ReadPcr(#[source] anyhow::Error),
    #[error("failed to quote PCRs")]
    Quote(#[source] anyhow::Error),
    #[error("enrollment failed")]
    Enroll(#[source] anyhow::Error),
    #[error("invalid backend response: {0}")]
    ApiResponse(String),
    #[error("failed to encode firmware record")]
    Encode(#[source] anyhow::Error),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("firmware collection failed")]
    Firmware(#[source] anyhow::Error),
    #[error(transparent)]
    Api(ApiError),
    #[error("unexpected failure")]
    Unknown(#[source] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// One line for an operator. Internal causes stay out of it; see
    /// [`Error::trace_chain`].
    pub fn diagnostic(&self) -> String {
        self.to_string()
    }

    /// Log the complete source chain at debug level
    pub fn trace_chain(&self) {
        let mut cause = std::error::Error::source(self);
        let mut depth = 0;
        tracing::debug!("error: {self}");
        while let Some(err) = cause {
            depth += 1;
            tracing::debug!("  {depth}: {err}");
            cause = err.source();
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }
}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Other(source) => Error::Unknown(source),
            err => Error::Api(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_diagnostic_hides_internal_cause() {
        let err = Error::Quote(anyhow!("TPM error: 0x0000098e").context("Quote failed"));
        assert_eq!(err.diagnostic(), "failed to quote PCRs");
        assert!(!err.diagnostic().contains("0x0000098e"));
        assert!(!err.diagnostic().contains("Quote failed"));

        let err = Error::OpenTrustAnchor(OpenError::Transport(anyhow!("connection refused")));
        assert_eq!(
            err.diagnostic(),
            "failed to open trust anchor: failed to open TPM transport"
        );
        assert_eq!(
            Error::invalid("empty path").diagnostic(),
            "invalid input: empty path"
        );
    }

    #[test]
    fn test_api_error_mapping() {
        assert!(matches!(
            Error::from(ApiError::Unauthorized),
            Error::Api(ApiError::Unauthorized)
        ));
        assert!(matches!(
            Error::from(ApiError::Other(anyhow!("boom"))),
            Error::Unknown(_)
        ));
    }
}
