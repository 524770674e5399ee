// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM 2.0 client
//!
//! This crate speaks the TPM 2.0 command protocol directly, without C library
//! dependencies, over any [`Transport`]: a local character device, the
//! Microsoft simulator socket protocol, a raw TCP stream or a length-prefixed
//! enclave proxy.
//!
//! ## Supported Commands
//!
//! - Startup, GetCapability, GetRandom
//! - Keys: `CreatePrimary`, `Create`, `Load`, `ReadPublic`, `FlushContext`
//! - Attestation: `CertifyCreation`, `Quote`, `PCR_Read`
//! - Credentials: `StartAuthSession`, `PolicySecret`, `ActivateCredential`
//! - NV: `NV_ReadPublic`, `NV_Read`
//!
//! ## Example
//!
//! ```no_run
//! use tpm2::{MssimTransport, TpmAlgId, TpmContext, TpmSu, TpmlPcrSelection};
//!
//! let transport = MssimTransport::connect("127.0.0.1", 2321)?;
//! let mut ctx = TpmContext::new(Box::new(transport));
//! ctx.startup(TpmSu::Clear)?;
//! let values = ctx.pcr_read(&TpmlPcrSelection::single(TpmAlgId::Sha256, &[0, 7]))?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod commands;
mod constants;
mod marshal;
mod session;
mod transport;
mod types;

pub use commands::{CreatedObject, TpmContext};
pub use constants::*;
pub use types::*;

pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
pub use session::AuthSession;
pub use transport::{
    AuthCommand, DeviceTransport, MssimTransport, SgxProxyTransport, TcpTransport, TpmCommand,
    TpmRcError, TpmResponse, Transport, MSSIM_DEFAULT_PORT, SGX_PROXY_DEFAULT_PORT,
};
