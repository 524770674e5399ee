// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Trust anchors: the TPM-shaped device that holds keys and PCRs
//!
//! [`HardwareAnchor`] drives a real TPM or simulator over a transport;
//! [`SoftwareAnchor`] emulates the same contract in-process. Both hand out
//! [`Handle`]s for loaded objects, which must be returned through
//! [`TrustAnchor::flush`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use tpm2::{
    DeviceTransport, MssimTransport, SgxProxyTransport, TcpTransport, TpmtPublic, Transport,
    MSSIM_DEFAULT_PORT, SGX_PROXY_DEFAULT_PORT,
};
use tpm_types::{EncryptedCredential, HashAlgorithm, PcrBanks, Signature};
use tracing::{error, info, warn};

use crate::error::{OpenError, Result};

mod hardware;
mod software;

pub use hardware::HardwareAnchor;
pub use software::SoftwareAnchor;

/// A loaded object or session inside an anchor. Not clonable; the only way
/// to dispose of one is [`TrustAnchor::flush`].
#[must_use = "handles must be flushed"]
#[derive(Debug)]
pub struct Handle {
    raw: u32,
    released: bool,
}

impl Handle {
    pub(crate) fn new(raw: u32) -> Self {
        Self {
            raw,
            released: false,
        }
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }

    pub(crate) fn release(mut self) -> u32 {
        self.released = true;
        self.raw
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.released {
            error!("handle 0x{:08x} dropped without being flushed", self.raw);
        }
    }
}

/// A freshly created device key and the creation certificate it signed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertifiedKey {
    pub public: TpmtPublic,
    /// TPMS_ATTEST of type creation
    pub certify_info: Vec<u8>,
    pub signature: Signature,
}

pub trait TrustAnchor: Send {
    fn describe(&self) -> String;

    fn get_endorsement_key(&mut self) -> Result<(Handle, TpmtPublic)>;

    /// DER certificate of the endorsement key, if the device carries one
    fn read_ek_certificate(&mut self) -> Result<Option<Vec<u8>>>;

    /// Primary key in the endorsement hierarchy
    fn create_and_load_root(
        &mut self,
        endorsement_auth: &[u8],
        root_auth: &[u8],
        template: &TpmtPublic,
    ) -> Result<(Handle, TpmtPublic)>;

    /// Create a key under `root` and have it certify its own creation.
    /// The key is not left loaded.
    fn create_and_certify_device_key(
        &mut self,
        root: &Handle,
        root_auth: &[u8],
        template: &TpmtPublic,
        key_auth: &[u8],
    ) -> Result<(CertifiedKey, Vec<u8>)>;

    fn load_device_key(
        &mut self,
        root: &Handle,
        root_auth: &[u8],
        public: &TpmtPublic,
        private: &[u8],
    ) -> Result<Handle>;

    /// Release the credential protected for `key` under `ek`
    fn activate_device_key(
        &mut self,
        credential: &EncryptedCredential,
        endorsement_auth: &[u8],
        key_auth: &[u8],
        key: &Handle,
        ek: &Handle,
    ) -> Result<String>;

    /// Indices the device does not implement are left out of the result
    fn pcr_values(
        &mut self,
        bank: HashAlgorithm,
        indices: &[u32],
    ) -> Result<BTreeMap<u32, Vec<u8>>>;

    fn all_pcr_values(&mut self) -> Result<PcrBanks>;

    /// Returns the TPMS_ATTEST bytes and their signature
    fn quote(
        &mut self,
        aik: &Handle,
        aik_auth: &[u8],
        extra_data: &[u8],
        banks: &[HashAlgorithm],
        indices: &[u32],
    ) -> Result<(Vec<u8>, Signature)>;

    fn flush(&mut self, handle: Handle) -> Result<()>;

    /// Best effort: unload everything left behind by earlier runs
    fn flush_all_handles(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Opaque state to persist between runs, for anchors that need it
    fn software_state(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Run `f` with `handle` and flush it afterwards, whatever `f` returned
pub fn with_handle<A, T, F>(anchor: &mut A, handle: Handle, f: F) -> Result<T>
where
    A: TrustAnchor + ?Sized,
    F: FnOnce(&mut A, &Handle) -> Result<T>,
{
    let result = f(anchor, &handle);
    let flushed = anchor.flush(handle);
    match (result, flushed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(flush_err)) => {
            warn!("flush after failure also failed: {}", flush_err.diagnostic());
            Err(err)
        }
    }
}

/// Which anchor to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorSelection {
    /// Character device at an absolute path
    Device(String),
    /// Microsoft TPM simulator protocol
    Mssim { host: String, port: u16 },
    /// Length-prefixed proxy into an enclave
    Sgx { host: String, port: u16 },
    /// Raw TPM commands over TCP
    Net { host: String, port: u16 },
    Dummy,
    /// Whatever TPM the platform provides
    System,
}

fn parse_endpoint(
    selector: &str,
    rest: &str,
    default_port: Option<u16>,
) -> Result<(String, u16), OpenError> {
    let invalid = || OpenError::InvalidSelection(selector.to_string());
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => (rest, default_port.ok_or_else(invalid)?),
    };
    if host.is_empty() || host.contains('/') {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

impl FromStr for AnchorSelection {
    type Err = OpenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("mssim://") {
            let (host, port) = parse_endpoint(s, rest, Some(MSSIM_DEFAULT_PORT))?;
            return Ok(AnchorSelection::Mssim { host, port });
        }
        if let Some(rest) = s.strip_prefix("sgx://") {
            let (host, port) = parse_endpoint(s, rest, Some(SGX_PROXY_DEFAULT_PORT))?;
            return Ok(AnchorSelection::Sgx { host, port });
        }
        if let Some(rest) = s.strip_prefix("net://") {
            let (host, port) = parse_endpoint(s, rest, None)?;
            return Ok(AnchorSelection::Net { host, port });
        }
        match s {
            "dummy" => Ok(AnchorSelection::Dummy),
            "system" => Ok(AnchorSelection::System),
            path if path.starts_with('/') => Ok(AnchorSelection::Device(path.to_string())),
            _ => Err(OpenError::InvalidSelection(s.to_string())),
        }
    }
}

impl fmt::Display for AnchorSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnchorSelection::Device(path) => f.write_str(path),
            AnchorSelection::Mssim { host, port } => write!(f, "mssim://{host}:{port}"),
            AnchorSelection::Sgx { host, port } => write!(f, "sgx://{host}:{port}"),
            AnchorSelection::Net { host, port } => write!(f, "net://{host}:{port}"),
            AnchorSelection::Dummy => f.write_str("dummy"),
            AnchorSelection::System => f.write_str("system"),
        }
    }
}

/// Open the selected anchor. `software_state` restores a previously saved
/// software anchor and is ignored by hardware.
pub fn open(
    selection: &AnchorSelection,
    software_state: Option<&[u8]>,
) -> Result<Box<dyn TrustAnchor>> {
    let transport: Box<dyn Transport> = match selection {
        AnchorSelection::Dummy => {
            let anchor = match software_state {
                Some(state) => SoftwareAnchor::restore(state).map_err(OpenError::Transport)?,
                None => SoftwareAnchor::new(),
            };
            info!("using software trust anchor");
            return Ok(Box::new(anchor));
        }
        AnchorSelection::System => {
            Box::new(DeviceTransport::detect().map_err(OpenError::Unsupported)?)
        }
        AnchorSelection::Device(path) => {
            Box::new(DeviceTransport::open(path).map_err(OpenError::Transport)?)
        }
        AnchorSelection::Mssim { host, port } => {
            Box::new(MssimTransport::connect(host, *port).map_err(OpenError::Transport)?)
        }
        AnchorSelection::Sgx { host, port } => {
            Box::new(SgxProxyTransport::connect(host, *port).map_err(OpenError::Transport)?)
        }
        AnchorSelection::Net { host, port } => {
            Box::new(TcpTransport::connect(host, *port).map_err(OpenError::Transport)?)
        }
    };
    let anchor = HardwareAnchor::open(transport)?;
    info!("using TPM at {}", anchor.describe());
    Ok(Box::new(anchor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selection() {
        let cases = [
            ("dummy", AnchorSelection::Dummy),
            ("system", AnchorSelection::System),
            ("/dev/tpmrm0", AnchorSelection::Device("/dev/tpmrm0".into())),
            (
                "mssim://localhost",
                AnchorSelection::Mssim {
                    host: "localhost".into(),
                    port: 2321,
                },
            ),
            (
                "mssim://10.0.0.2:2400",
                AnchorSelection::Mssim {
                    host: "10.0.0.2".into(),
                    port: 2400,
                },
            ),
            (
                "sgx://enclave",
                AnchorSelection::Sgx {
                    host: "enclave".into(),
                    port: 2321,
                },
            ),
            (
                "net://127.0.0.1:2321",
                AnchorSelection::Net {
                    host: "127.0.0.1".into(),
                    port: 2321,
                },
            ),
        ];
        for (input, expected) in cases {
            let parsed: AnchorSelection = input.parse().unwrap();
            assert_eq!(parsed, expected, "{input}");
            assert_eq!(parsed.to_string().parse::<AnchorSelection>().unwrap(), expected);
        }
    }

    #[test]
    fn test_parse_selection_rejects() {
        for input in [
            "",
            "tpm0",
            "net://localhost",
            "mssim://",
            "mssim://host:notaport",
            "mssim://host:70000",
            "tcp://host:1",
        ] {
            assert!(
                matches!(
                    input.parse::<AnchorSelection>(),
                    Err(OpenError::InvalidSelection(_))
                ),
                "{input}"
            );
        }
    }

    #[test]
    fn test_with_handle_flushes_on_error() {
        let mut anchor = SoftwareAnchor::new();
        let (ek, _) = anchor.get_endorsement_key().unwrap();
        assert_eq!(anchor.loaded_objects(), 1);
        let result: Result<()> = with_handle(&mut anchor, ek, |_, _| {
            Err(crate::Error::invalid("boom"))
        });
        assert!(result.is_err());
        assert_eq!(anchor.loaded_objects(), 0);

        let (ek, _) = anchor.get_endorsement_key().unwrap();
        let raw = with_handle(&mut anchor, ek, |_, handle| Ok(handle.raw())).unwrap();
        assert_ne!(raw, 0);
        assert_eq!(anchor.loaded_objects(), 0);
    }

    #[test]
    fn test_open_dummy_restores_state() {
        let mut anchor = SoftwareAnchor::new();
        anchor
            .extend_pcr(HashAlgorithm::Sha256, 7, &[0xab; 32])
            .unwrap();
        let state = anchor.save();

        let mut restored = open(&AnchorSelection::Dummy, Some(&state)).unwrap();
        let values = restored.pcr_values(HashAlgorithm::Sha256, &[7]).unwrap();
        assert_eq!(
            values[&7],
            anchor.pcr_values(HashAlgorithm::Sha256, &[7]).unwrap()[&7]
        );
        assert!(restored.software_state().is_some());
        restored.close().unwrap();
    }
}
