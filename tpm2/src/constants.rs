// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 constants and command codes

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCc {
    EvictControl = 0x00000120,
    CreatePrimary = 0x00000131,
    Startup = 0x00000144,
    ActivateCredential = 0x00000147,
    CertifyCreation = 0x0000014A,
    PolicySecret = 0x00000151,
    Create = 0x00000153,
    Load = 0x00000157,
    Quote = 0x00000158,
    FlushContext = 0x00000165,
    NvRead = 0x0000014E,
    NvReadPublic = 0x00000169,
    ReadPublic = 0x00000173,
    StartAuthSession = 0x00000176,
    GetCapability = 0x0000017A,
    GetRandom = 0x0000017B,
    PcrRead = 0x0000017E,
    PcrExtend = 0x00000182,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// Well-known response codes (TPM_RC)
pub mod tpm_rc {
    pub const SUCCESS: u32 = 0x000;
    /// TPM not started; TPM2_Startup is required
    pub const INITIALIZE: u32 = 0x100;
    pub const FAILURE: u32 = 0x101;
    pub const OBJECT_MEMORY: u32 = 0x902;
    pub const SESSION_MEMORY: u32 = 0x903;
    /// Format-one codes carry the parameter/handle/session number in bits 8..11
    pub const FMT1: u32 = 0x080;

    /// Strip the parameter/handle/session number of a format-one code
    pub fn base(code: u32) -> u32 {
        if code & FMT1 != 0 {
            code & 0xBF
        } else {
            code
        }
    }
}

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TpmAlgId {
    Rsa = 0x0001,
    Sha1 = 0x0004,
    Hmac = 0x0005,
    Aes = 0x0006,
    KeyedHash = 0x0008,
    Xor = 0x000A,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Null = 0x0010,
    RsaSsa = 0x0014,
    RsaPss = 0x0016,
    EcDsa = 0x0018,
    Ecc = 0x0023,
    SymCipher = 0x0025,
    Cfb = 0x0043,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x0001 => TpmAlgId::Rsa,
            0x0004 => TpmAlgId::Sha1,
            0x0005 => TpmAlgId::Hmac,
            0x0006 => TpmAlgId::Aes,
            0x0008 => TpmAlgId::KeyedHash,
            0x000A => TpmAlgId::Xor,
            0x000B => TpmAlgId::Sha256,
            0x000C => TpmAlgId::Sha384,
            0x000D => TpmAlgId::Sha512,
            0x0010 => TpmAlgId::Null,
            0x0014 => TpmAlgId::RsaSsa,
            0x0016 => TpmAlgId::RsaPss,
            0x0018 => TpmAlgId::EcDsa,
            0x0023 => TpmAlgId::Ecc,
            0x0025 => TpmAlgId::SymCipher,
            0x0043 => TpmAlgId::Cfb,
            _ => return None,
        })
    }

    /// Digest size in bytes, `None` for anything that is not a hash
    pub fn digest_size(self) -> Option<usize> {
        match self {
            TpmAlgId::Sha1 => Some(20),
            TpmAlgId::Sha256 => Some(32),
            TpmAlgId::Sha384 => Some(48),
            TpmAlgId::Sha512 => Some(64),
            _ => None,
        }
    }

    pub fn is_hash(self) -> bool {
        self.digest_size().is_some()
    }
}

/// TPM 2.0 Handle Types (most significant octet of a handle)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmHt {
    Pcr = 0x00,
    NvIndex = 0x01,
    HmacSession = 0x02,
    PolicySession = 0x03,
    Permanent = 0x40,
    Transient = 0x80,
    Persistent = 0x81,
}

impl TpmHt {
    pub fn of(handle: u32) -> Option<Self> {
        Some(match (handle >> 24) as u8 {
            0x00 => TpmHt::Pcr,
            0x01 => TpmHt::NvIndex,
            0x02 => TpmHt::HmacSession,
            0x03 => TpmHt::PolicySession,
            0x40 => TpmHt::Permanent,
            0x80 => TpmHt::Transient,
            0x81 => TpmHt::Persistent,
            _ => return None,
        })
    }

    /// First handle of this range
    pub fn first(self) -> u32 {
        (self as u32) << 24
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x40000001;
    pub const NULL: u32 = 0x40000007;
    pub const PW: u32 = 0x40000009; // Password authorization
    pub const LOCKOUT: u32 = 0x4000000A;
    pub const ENDORSEMENT: u32 = 0x4000000B;
    pub const PLATFORM: u32 = 0x4000000C;
}

/// NV indices defined by the TCG EK credential profile
pub mod ek_nv_index {
    pub const RSA_CERT: u32 = 0x01C00002;
    pub const ECC_CERT: u32 = 0x01C0000A;
}

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmSe {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

/// TPM 2.0 Startup Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSu {
    Clear = 0x0000,
    State = 0x0001,
}

/// TPM 2.0 Capability Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCap {
    Handles = 0x00000001,
    Pcrs = 0x00000005,
    TpmProperties = 0x00000006,
}

/// TPM property tags (TPM_PT)
pub mod tpm_pt {
    pub const FAMILY_INDICATOR: u32 = 0x100;
}

/// TPM 2.0 Object Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaObject(pub u32);

impl TpmaObject {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const ST_CLEAR: u32 = 1 << 2;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const ADMIN_WITH_POLICY: u32 = 1 << 7;
    pub const NO_DA: u32 = 1 << 10;
    pub const ENCRYPTED_DUPLICATION: u32 = 1 << 11;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;
    pub const SIGN_ENCRYPT: u32 = 1 << 18;

    pub fn new() -> Self {
        Self(0)
    }

    fn with(mut self, bit: u32) -> Self {
        self.0 |= bit;
        self
    }

    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn with_fixed_tpm(self) -> Self {
        self.with(Self::FIXED_TPM)
    }

    pub fn with_fixed_parent(self) -> Self {
        self.with(Self::FIXED_PARENT)
    }

    pub fn with_sensitive_data_origin(self) -> Self {
        self.with(Self::SENSITIVE_DATA_ORIGIN)
    }

    pub fn with_user_with_auth(self) -> Self {
        self.with(Self::USER_WITH_AUTH)
    }

    pub fn with_admin_with_policy(self) -> Self {
        self.with(Self::ADMIN_WITH_POLICY)
    }

    pub fn with_no_da(self) -> Self {
        self.with(Self::NO_DA)
    }

    pub fn with_restricted(self) -> Self {
        self.with(Self::RESTRICTED)
    }

    pub fn with_decrypt(self) -> Self {
        self.with(Self::DECRYPT)
    }

    pub fn with_sign_encrypt(self) -> Self {
        self.with(Self::SIGN_ENCRYPT)
    }
}

/// TPM 2.0 NV Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaNv(pub u32);

impl TpmaNv {
    pub const PP_WRITE: u32 = 1 << 0;
    pub const OWNER_WRITE: u32 = 1 << 1;
    pub const AUTH_WRITE: u32 = 1 << 2;
    pub const PP_READ: u32 = 1 << 16;
    pub const OWNER_READ: u32 = 1 << 17;
    pub const AUTH_READ: u32 = 1 << 18;
    pub const NO_DA: u32 = 1 << 25;
    pub const WRITTEN: u32 = 1 << 29;
    pub const PLATFORM_CREATE: u32 = 1 << 30;
}

/// TPM 2.0 Session Attributes
#[derive(Debug, Clone, Copy, Default)]
pub struct TpmaSa(pub u8);

impl TpmaSa {
    pub const CONTINUE_SESSION: u8 = 1 << 0;
    pub const DECRYPT: u8 = 1 << 5;
    pub const ENCRYPT: u8 = 1 << 6;
}

/// Structure tags (TPM_ST)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    /// Response tag of a TPM 1.2 device answering a TPM 2.0 command
    RspCommand = 0x00C4,
    Null = 0x8000,
    NoSessions = 0x8001,
    Sessions = 0x8002,
    AttestQuote = 0x8018,
    AttestCreation = 0x801A,
    Creation = 0x8021,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x00C4 => TpmSt::RspCommand,
            0x8000 => TpmSt::Null,
            0x8001 => TpmSt::NoSessions,
            0x8002 => TpmSt::Sessions,
            0x8018 => TpmSt::AttestQuote,
            0x801A => TpmSt::AttestCreation,
            0x8021 => TpmSt::Creation,
            _ => return None,
        })
    }
}

/// `TPM_GENERATED_VALUE`, the magic prefix of every TPMS_ATTEST
pub const TPM_GENERATED_VALUE: u32 = 0xFF544347;

/// ECC Curve IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmEccCurve {
    None = 0x0000,
    NistP256 = 0x0003,
    NistP384 = 0x0004,
    NistP521 = 0x0005,
}

impl TpmEccCurve {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x0000 => TpmEccCurve::None,
            0x0003 => TpmEccCurve::NistP256,
            0x0004 => TpmEccCurve::NistP384,
            0x0005 => TpmEccCurve::NistP521,
            _ => return None,
        })
    }
}
