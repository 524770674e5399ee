// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM transports and command framing
//!
//! A [`Transport`] moves opaque command/response buffers. Four are provided:
//! a character device (`/dev/tpmrm0`), a raw TCP stream (`net://`, e.g. swtpm),
//! the Microsoft simulator protocol (`mssim://`) and a length-prefixed enclave
//! proxy (`sgx://`).

use anyhow::{anyhow, bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use super::constants::*;
use super::marshal::*;

/// Maximum TPM response size accepted from any transport
pub const TPM_MAX_RESPONSE_SIZE: usize = 0x10000;

/// Size of a device read; character devices return a whole response per read
const TPM_DEVICE_READ_SIZE: usize = 4096;

const TPM_HEADER_SIZE: usize = 10;

/// Default command port of the Microsoft TPM simulator
pub const MSSIM_DEFAULT_PORT: u16 = 2321;

/// Default port of the enclave TPM proxy
pub const SGX_PROXY_DEFAULT_PORT: u16 = 2321;

/// Byte-stream session to a TPM-like device
pub trait Transport: Send {
    fn send(&mut self, command: &[u8]) -> Result<()>;

    fn receive(&mut self) -> Result<Vec<u8>>;

    /// Release the underlying resource. Calling it twice is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Human readable endpoint, for logs
    fn describe(&self) -> String;

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.send(command)?;
        self.receive()
    }
}

fn closed(what: &str) -> anyhow::Error {
    anyhow!("{what} transport is closed")
}

/// TPM character device
pub struct DeviceTransport {
    file: Option<File>,
    path: String,
}

impl DeviceTransport {
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open TPM device: {path}"))?;
        Ok(Self {
            file: Some(file),
            path: path.to_string(),
        })
    }

    /// Open the platform default device, preferring the resource manager
    pub fn detect() -> Result<Self> {
        for path in ["/dev/tpmrm0", "/dev/tpm0"] {
            if Path::new(path).exists() {
                return Self::open(path);
            }
        }
        bail!("TPM device not found")
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Transport for DeviceTransport {
    fn send(&mut self, command: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| closed("device"))?;
        file.write_all(command).context("failed to write TPM command")
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let file = self.file.as_mut().ok_or_else(|| closed("device"))?;
        let mut response = vec![0u8; TPM_DEVICE_READ_SIZE];
        let n = file
            .read(&mut response)
            .context("failed to read TPM response")?;
        response.truncate(n);
        Ok(response)
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

/// Read one TPM response, using the size field of its header to find its end
fn read_sized_response(stream: &mut impl Read) -> Result<Vec<u8>> {
    let mut header = [0u8; TPM_HEADER_SIZE];
    stream
        .read_exact(&mut header)
        .context("failed to read TPM response header")?;
    let size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    if !(TPM_HEADER_SIZE..=TPM_MAX_RESPONSE_SIZE).contains(&size) {
        bail!("invalid TPM response size {size}");
    }
    let mut response = header.to_vec();
    response.resize(size, 0);
    stream
        .read_exact(&mut response[TPM_HEADER_SIZE..])
        .context("failed to read TPM response body")?;
    Ok(response)
}

fn read_u32(stream: &mut impl Read) -> Result<u32> {
    let mut word = [0u8; 4];
    stream.read_exact(&mut word)?;
    Ok(u32::from_be_bytes(word))
}

fn connect(host: &str, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port))
        .with_context(|| format!("failed to connect to {host}:{port}"))?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Raw TPM command stream over TCP (swtpm `--server type=tcp`)
pub struct TcpTransport {
    stream: Option<TcpStream>,
    endpoint: String,
}

impl TcpTransport {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        Ok(Self {
            stream: Some(connect(host, port)?),
            endpoint: format!("net://{host}:{port}"),
        })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, command: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| closed("net"))?;
        stream
            .write_all(command)
            .context("failed to send TPM command")
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or_else(|| closed("net"))?;
        read_sized_response(stream)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.shutdown(Shutdown::Both).ok();
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

/// Commands of the Microsoft simulator socket protocol
mod mssim {
    pub const SIGNAL_POWER_ON: u32 = 1;
    pub const SIGNAL_NV_ON: u32 = 11;
    pub const SEND_COMMAND: u32 = 8;
    pub const SESSION_END: u32 = 20;
}

/// Microsoft TPM 2.0 simulator: a command port and a platform port (`port + 1`)
pub struct MssimTransport {
    command: Option<TcpStream>,
    platform: Option<TcpStream>,
    locality: u8,
    endpoint: String,
}

impl MssimTransport {
    /// Connect to both ports and power the simulated TPM on
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let platform_port = port
            .checked_add(1)
            .ok_or_else(|| anyhow!("invalid simulator port {port}"))?;
        let command = connect(host, port)?;
        let mut platform = connect(host, platform_port)?;
        for signal in [mssim::SIGNAL_POWER_ON, mssim::SIGNAL_NV_ON] {
            platform.write_all(&signal.to_be_bytes())?;
            let rc = read_u32(&mut platform).context("simulator platform signal")?;
            if rc != 0 {
                bail!("simulator rejected platform signal {signal}: {rc}");
            }
        }
        debug!("connected to TPM simulator at {host}:{port}");
        Ok(Self {
            command: Some(command),
            platform: Some(platform),
            locality: 0,
            endpoint: format!("mssim://{host}:{port}"),
        })
    }
}

impl Transport for MssimTransport {
    fn send(&mut self, command: &[u8]) -> Result<()> {
        let locality = self.locality;
        let stream = self.command.as_mut().ok_or_else(|| closed("mssim"))?;
        let mut frame = CommandBuffer::with_capacity(command.len() + 9);
        frame.put_u32(mssim::SEND_COMMAND);
        frame.put_u8(locality);
        frame.put_u32(command.len() as u32);
        frame.put_bytes(command);
        stream
            .write_all(frame.as_bytes())
            .context("failed to send simulator command")
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let stream = self.command.as_mut().ok_or_else(|| closed("mssim"))?;
        let size = read_u32(stream)? as usize;
        if size > TPM_MAX_RESPONSE_SIZE {
            bail!("invalid simulator response size {size}");
        }
        let mut response = vec![0u8; size];
        stream
            .read_exact(&mut response)
            .context("failed to read simulator response")?;
        let ack = read_u32(stream)?;
        if ack != 0 {
            bail!("simulator reported failure {ack}");
        }
        Ok(response)
    }

    fn close(&mut self) -> Result<()> {
        for mut stream in [self.command.take(), self.platform.take()]
            .into_iter()
            .flatten()
        {
            stream.write_all(&mssim::SESSION_END.to_be_bytes()).ok();
            stream.shutdown(Shutdown::Both).ok();
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

/// Enclave-hosted TPM proxy: each command and response is a u32 big-endian
/// length followed by the TPM buffer.
pub struct SgxProxyTransport {
    stream: Option<TcpStream>,
    endpoint: String,
}

impl SgxProxyTransport {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        Ok(Self {
            stream: Some(connect(host, port)?),
            endpoint: format!("sgx://{host}:{port}"),
        })
    }
}

impl Transport for SgxProxyTransport {
    fn send(&mut self, command: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| closed("sgx"))?;
        let mut frame = CommandBuffer::with_capacity(command.len() + 4);
        frame.put_u32(command.len() as u32);
        frame.put_bytes(command);
        stream
            .write_all(frame.as_bytes())
            .context("failed to send proxied TPM command")
    }

    fn receive(&mut self) -> Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or_else(|| closed("sgx"))?;
        let size = read_u32(stream)? as usize;
        if size > TPM_MAX_RESPONSE_SIZE {
            bail!("invalid proxied response size {size}");
        }
        let mut response = vec![0u8; size];
        stream
            .read_exact(&mut response)
            .context("failed to read proxied TPM response")?;
        Ok(response)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.shutdown(Shutdown::Both).ok();
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

/// One entry of a command authorization area
#[derive(Debug, Clone)]
pub struct AuthCommand {
    pub session_handle: u32,
    pub nonce: Vec<u8>,
    pub attributes: u8,
    pub hmac: Vec<u8>,
}

impl AuthCommand {
    /// Password authorization (TPM_RS_PW) carrying the plaintext auth value
    pub fn password(auth: &[u8]) -> Self {
        Self {
            session_handle: tpm_rh::PW,
            nonce: Vec::new(),
            attributes: 0,
            hmac: auth.to_vec(),
        }
    }

    /// Satisfied policy session; the session stays loaded until flushed
    pub fn policy(session_handle: u32) -> Self {
        Self {
            session_handle,
            nonce: Vec::new(),
            attributes: TpmaSa::CONTINUE_SESSION,
            hmac: Vec::new(),
        }
    }
}

impl Marshal for AuthCommand {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.session_handle);
        buf.put_tpm2b(&self.nonce);
        buf.put_u8(self.attributes);
        buf.put_tpm2b(&self.hmac);
    }
}

/// TPM command builder.
///
/// Fields go in wire order: handles, then the authorization area (session
/// commands only), then parameters.
pub struct TpmCommand {
    buf: CommandBuffer,
    code: TpmCc,
}

impl TpmCommand {
    fn start(tag: TpmSt, code: TpmCc) -> Self {
        let mut buf = CommandBuffer::with_capacity(256);
        buf.put_u16(tag.to_u16());
        buf.put_u32(0); // size, patched by finalize
        buf.put_u32(code.to_u32());
        Self { buf, code }
    }

    /// Command without an authorization area
    pub fn new(code: TpmCc) -> Self {
        Self::start(TpmSt::NoSessions, code)
    }

    /// Command carrying an authorization area
    pub fn with_sessions(code: TpmCc) -> Self {
        Self::start(TpmSt::Sessions, code)
    }

    pub fn code(&self) -> TpmCc {
        self.code
    }

    pub fn add_handle(&mut self, handle: u32) {
        self.buf.put_u32(handle);
    }

    pub fn add_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn add_tpm2b(&mut self, data: &[u8]) {
        self.buf.put_tpm2b(data);
    }

    pub fn add_tpm2b_empty(&mut self) {
        self.buf.put_tpm2b_empty();
    }

    pub fn add<T: Marshal + ?Sized>(&mut self, value: &T) {
        value.marshal(&mut self.buf);
    }

    /// Marshal `value` as a TPM2B-wrapped structure
    pub fn add_sized<T: Marshal + ?Sized>(&mut self, value: &T) {
        self.buf.put_sized(value);
    }

    /// Authorization area: u32 total size followed by one entry per
    /// authorized handle, in handle order
    pub fn add_auth_area(&mut self, auths: &[AuthCommand]) {
        let mut area = CommandBuffer::new();
        for auth in auths {
            auth.marshal(&mut area);
        }
        self.buf.put_u32(area.len() as u32);
        self.buf.append(area);
    }

    /// Empty password authorization for a single handle
    pub fn add_null_auth_area(&mut self) {
        self.add_auth_area(&[AuthCommand::password(&[])]);
    }

    /// Patch the size field; fails if any field overflowed its size prefix
    pub fn finalize(mut self) -> Result<Vec<u8>> {
        let size = u32::try_from(self.buf.len()).context("command too large")?;
        self.buf.update_u32(2, size);
        self.buf.finish()
    }
}

/// Non-success response code returned by a TPM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("TPM error: 0x{0:08x}")]
pub struct TpmRcError(pub u32);

impl TpmRcError {
    pub fn base(&self) -> u32 {
        tpm_rc::base(self.0)
    }
}

/// TPM response parser
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: TpmSt,
    pub response_code: u32,
    pub data: Vec<u8>,
}

impl TpmResponse {
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < TPM_HEADER_SIZE {
            bail!("TPM response too short: {} bytes", response.len());
        }
        let mut buf = ResponseBuffer::new(response);
        let tag_raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(tag_raw)
            .ok_or_else(|| anyhow!("invalid response tag: 0x{tag_raw:04x}"))?;
        let size = buf.get_u32()? as usize;
        if size < TPM_HEADER_SIZE || response.len() < size {
            bail!(
                "TPM response size mismatch: header says {size}, got {}",
                response.len()
            );
        }
        let response_code = buf.get_u32()?;
        Ok(Self {
            tag,
            response_code,
            data: response[TPM_HEADER_SIZE..size].to_vec(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.response_code == tpm_rc::SUCCESS
    }

    pub fn ensure_success(&self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(TpmRcError(self.response_code).into())
        }
    }

    /// Split a successful response into its `handles` response handles and a
    /// cursor over the parameter area. For session responses the parameter
    /// area is bounded by `parameterSize`, leaving the auth area unread.
    pub fn parameters(&self, handles: usize) -> Result<(Vec<u32>, ResponseBuffer<'_>)> {
        let mut buf = ResponseBuffer::new(&self.data);
        let handles = (0..handles)
            .map(|_| buf.get_u32())
            .collect::<Result<Vec<_>>>()
            .context("response handles")?;
        let params = if self.tag == TpmSt::Sessions {
            let size = buf.get_u32()? as usize;
            ResponseBuffer::new(buf.take(size).context("parameter area")?)
        } else {
            buf
        };
        Ok((handles, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TpmlPcrSelection, TpmsPcrSelection};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_command_builder() {
        let mut cmd = TpmCommand::new(TpmCc::GetRandom);
        cmd.add_u16(32);
        let bytes = cmd.finalize().unwrap();

        assert_eq!(&bytes[0..2], &[0x80, 0x01]);
        assert_eq!(&bytes[6..10], &[0x00, 0x00, 0x01, 0x7B]);
        let size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        assert_eq!(size as usize, bytes.len());
    }

    #[test]
    fn test_auth_area_layout() {
        let mut cmd = TpmCommand::with_sessions(TpmCc::Quote);
        cmd.add_handle(0x80000001);
        cmd.add_auth_area(&[AuthCommand::password(b"pw")]);
        let bytes = cmd.finalize().unwrap();

        assert_eq!(&bytes[0..2], &[0x80, 0x02]);
        assert_eq!(&bytes[14..18], &[0x00, 0x00, 0x00, 0x0B]);
        assert_eq!(&bytes[18..22], &tpm_rh::PW.to_be_bytes());
        assert_eq!(&bytes[22..24], &[0x00, 0x00]);
        assert_eq!(bytes[24], 0x00);
        assert_eq!(&bytes[25..27], &[0x00, 0x02]);
        assert_eq!(&bytes[27..29], b"pw");
        assert_eq!(bytes.len(), 29);
    }

    #[test]
    fn test_oversized_parameter_fails_finalize() {
        let mut cmd = TpmCommand::new(TpmCc::Quote);
        cmd.add_tpm2b(&vec![0u8; 0x1_0000]);
        assert!(cmd.finalize().is_err());

        let mut cmd = TpmCommand::new(TpmCc::PcrRead);
        cmd.add(&TpmlPcrSelection {
            pcr_selections: vec![TpmsPcrSelection {
                hash: TpmAlgId::Sha256,
                pcr_select: vec![0xFF; 300],
            }],
        });
        assert!(cmd.finalize().is_err());
    }

    #[test]
    fn test_response_parse() {
        let response = vec![
            0x80, 0x01, // TPM_ST_NO_SESSIONS
            0x00, 0x00, 0x00, 0x0A, // size
            0x00, 0x00, 0x00, 0x00, // TPM_RC_SUCCESS
        ];
        let parsed = TpmResponse::parse(&response).unwrap();
        assert!(parsed.is_success());
        assert!(parsed.data.is_empty());

        let failed = TpmResponse::parse(&[0x80, 0x01, 0, 0, 0, 0x0A, 0, 0, 0x01, 0x00]).unwrap();
        let err = failed.ensure_success().unwrap_err();
        assert_eq!(
            err.downcast_ref::<TpmRcError>(),
            Some(&TpmRcError(tpm_rc::INITIALIZE))
        );
    }

    #[test]
    fn test_session_response_parameters() {
        let mut body = CommandBuffer::new();
        body.put_u16(TpmSt::Sessions.to_u16());
        body.put_u32(0);
        body.put_u32(0);
        body.put_u32(0x80000002); // handle
        body.put_u32(4); // parameterSize
        body.put_tpm2b(&[0xAB, 0xCD]);
        body.put_bytes(&[0x00, 0x00, 0x01, 0x00, 0x00]); // auth response
        let len = body.len() as u32;
        body.update_u32(2, len);

        let response = TpmResponse::parse(body.as_bytes()).unwrap();
        let (handles, mut params) = response.parameters(1).unwrap();
        assert_eq!(handles, vec![0x80000002]);
        assert_eq!(params.get_tpm2b().unwrap(), vec![0xAB, 0xCD]);
        params.finish().unwrap();
    }

    #[test]
    fn test_tpm12_tag_is_recognized() {
        let response = [0x00, 0xC4, 0, 0, 0, 0x0A, 0, 0, 0, 0x1E];
        let parsed = TpmResponse::parse(&response).unwrap();
        assert_eq!(parsed.tag, TpmSt::RspCommand);
    }

    fn success_response() -> Vec<u8> {
        vec![0x80, 0x01, 0, 0, 0, 0x0A, 0, 0, 0, 0]
    }

    #[test]
    fn test_net_transport_reads_by_header_size() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut cmd = [0u8; 12];
            conn.read_exact(&mut cmd).unwrap();
            // split the response across two writes
            let resp = success_response();
            conn.write_all(&resp[..4]).unwrap();
            conn.write_all(&resp[4..]).unwrap();
            cmd
        });

        let mut transport = TcpTransport::connect("127.0.0.1", port).unwrap();
        let mut cmd = TpmCommand::new(TpmCc::GetRandom);
        cmd.add_u16(8);
        let bytes = cmd.finalize().unwrap();
        let response = transport.transmit(&bytes).unwrap();
        assert_eq!(response, success_response());
        assert_eq!(server.join().unwrap().to_vec(), bytes);

        transport.close().unwrap();
        transport.close().unwrap();
        assert!(transport.send(&bytes).is_err());
    }

    #[test]
    fn test_mssim_transport_framing() {
        let command_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = command_listener.local_addr().unwrap().port();
        let platform_listener = match TcpListener::bind(("127.0.0.1", port + 1)) {
            Ok(l) => l,
            // platform port taken by something else on this host
            Err(_) => return,
        };

        let server = thread::spawn(move || {
            let (mut platform, _) = platform_listener.accept().unwrap();
            let mut signals = Vec::new();
            for _ in 0..2 {
                signals.push(read_u32(&mut platform).unwrap());
                platform.write_all(&0u32.to_be_bytes()).unwrap();
            }

            let (mut conn, _) = command_listener.accept().unwrap();
            let op = read_u32(&mut conn).unwrap();
            let mut locality = [0u8; 1];
            conn.read_exact(&mut locality).unwrap();
            let size = read_u32(&mut conn).unwrap() as usize;
            let mut cmd = vec![0u8; size];
            conn.read_exact(&mut cmd).unwrap();

            let resp = success_response();
            conn.write_all(&(resp.len() as u32).to_be_bytes()).unwrap();
            conn.write_all(&resp).unwrap();
            conn.write_all(&0u32.to_be_bytes()).unwrap();

            let end = read_u32(&mut conn).unwrap();
            (signals, op, locality[0], cmd, end)
        });

        let mut transport = MssimTransport::connect("127.0.0.1", port).unwrap();
        let cmd = TpmCommand::new(TpmCc::GetCapability).finalize().unwrap();
        assert_eq!(transport.transmit(&cmd).unwrap(), success_response());
        transport.close().unwrap();

        let (signals, op, locality, received, end) = server.join().unwrap();
        assert_eq!(signals, vec![mssim::SIGNAL_POWER_ON, mssim::SIGNAL_NV_ON]);
        assert_eq!(op, mssim::SEND_COMMAND);
        assert_eq!(locality, 0);
        assert_eq!(received, cmd);
        assert_eq!(end, mssim::SESSION_END);
    }

    #[test]
    fn test_sgx_proxy_framing() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let size = read_u32(&mut conn).unwrap() as usize;
            let mut cmd = vec![0u8; size];
            conn.read_exact(&mut cmd).unwrap();
            let resp = success_response();
            conn.write_all(&(resp.len() as u32).to_be_bytes()).unwrap();
            conn.write_all(&resp).unwrap();
            cmd
        });

        let mut transport = SgxProxyTransport::connect("127.0.0.1", port).unwrap();
        let cmd = TpmCommand::new(TpmCc::GetRandom).finalize().unwrap();
        assert_eq!(transport.transmit(&cmd).unwrap(), success_response());
        assert_eq!(server.join().unwrap(), cmd);
        assert_eq!(transport.describe(), format!("sgx://127.0.0.1:{port}"));
    }
}
