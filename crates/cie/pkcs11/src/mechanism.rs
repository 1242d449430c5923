//! Supported mechanisms and host-side hashing

use derive_more::Display;
use pkcs11_sys::*;
use rsa::Pkcs1v15Sign;
use sha2::Digest;

use crate::error::{ErrorKind, Result};

/// Smallest RSA key the mechanisms accept, in bits
pub const MIN_KEY_BITS: CK_ULONG = 1024;
/// Largest RSA key the mechanisms accept, in bits
pub const MAX_KEY_BITS: CK_ULONG = 4096;

/// Kind of crypto operation a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Operation {
    /// Signature on the card
    #[display("sign")]
    Sign,
    /// Signature check on the host
    #[display("verify")]
    Verify,
    /// Encryption on the host
    #[display("encrypt")]
    Encrypt,
    /// Decryption on the card
    #[display("decrypt")]
    Decrypt,
}

impl Operation {
    /// Key attribute granting this operation
    pub const fn capability(self) -> CK_ATTRIBUTE_TYPE {
        match self {
            Self::Sign => CKA_SIGN,
            Self::Verify => CKA_VERIFY,
            Self::Encrypt => CKA_ENCRYPT,
            Self::Decrypt => CKA_DECRYPT,
        }
    }
}

/// A mechanism of the token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Mechanism {
    /// `CKM_RSA_PKCS`
    #[display("CKM_RSA_PKCS")]
    RsaPkcs,
    /// `CKM_SHA1_RSA_PKCS`
    #[display("CKM_SHA1_RSA_PKCS")]
    Sha1RsaPkcs,
    /// `CKM_SHA256_RSA_PKCS`
    #[display("CKM_SHA256_RSA_PKCS")]
    Sha256RsaPkcs,
    /// `CKM_SHA384_RSA_PKCS`
    #[display("CKM_SHA384_RSA_PKCS")]
    Sha384RsaPkcs,
    /// `CKM_SHA512_RSA_PKCS`
    #[display("CKM_SHA512_RSA_PKCS")]
    Sha512RsaPkcs,
}

/// Properties reported by `C_GetMechanismInfo`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MechanismInfo {
    /// Minimum key size in bits
    pub min_key_bits: CK_ULONG,
    /// Maximum key size in bits
    pub max_key_bits: CK_ULONG,
    /// `CKF_*` flags
    pub flags: CK_FLAGS,
}

impl Mechanism {
    /// Every mechanism, in the order they are listed
    pub const ALL: [Self; 5] = [
        Self::RsaPkcs,
        Self::Sha1RsaPkcs,
        Self::Sha256RsaPkcs,
        Self::Sha384RsaPkcs,
        Self::Sha512RsaPkcs,
    ];

    /// Look up a `CKM_*` value
    pub fn from_ck(mechanism: CK_MECHANISM_TYPE) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.ck() == mechanism)
            .ok_or_else(|| ErrorKind::MechanismInvalid(mechanism).into())
    }

    /// `CKM_*` value of this mechanism
    pub const fn ck(self) -> CK_MECHANISM_TYPE {
        match self {
            Self::RsaPkcs => CKM_RSA_PKCS,
            Self::Sha1RsaPkcs => CKM_SHA1_RSA_PKCS,
            Self::Sha256RsaPkcs => CKM_SHA256_RSA_PKCS,
            Self::Sha384RsaPkcs => CKM_SHA384_RSA_PKCS,
            Self::Sha512RsaPkcs => CKM_SHA512_RSA_PKCS,
        }
    }

    /// Whether the mechanism can run `operation`
    pub const fn supports(self, operation: Operation) -> bool {
        match self {
            Self::RsaPkcs => true,
            _ => matches!(operation, Operation::Sign | Operation::Verify),
        }
    }

    /// Info reported for the mechanism
    pub const fn info(self) -> MechanismInfo {
        let flags = match self {
            Self::RsaPkcs => CKF_HW | CKF_SIGN | CKF_VERIFY | CKF_ENCRYPT | CKF_DECRYPT,
            _ => CKF_HW | CKF_SIGN | CKF_VERIFY,
        };
        MechanismInfo {
            min_key_bits: MIN_KEY_BITS,
            max_key_bits: MAX_KEY_BITS,
            flags,
        }
    }

    /// Fresh hasher, for the mechanisms that hash on the host
    pub fn hasher(self) -> Option<Hasher> {
        match self {
            Self::RsaPkcs => None,
            Self::Sha1RsaPkcs => Some(Hasher::Sha1(sha1::Sha1::new())),
            Self::Sha256RsaPkcs => Some(Hasher::Sha256(sha2::Sha256::new())),
            Self::Sha384RsaPkcs => Some(Hasher::Sha384(sha2::Sha384::new())),
            Self::Sha512RsaPkcs => Some(Hasher::Sha512(sha2::Sha512::new())),
        }
    }

    /// DER prefix of the DigestInfo, empty for `CKM_RSA_PKCS`
    pub fn digest_info_prefix(self) -> Box<[u8]> {
        match self {
            Self::RsaPkcs => Box::default(),
            Self::Sha1RsaPkcs => Pkcs1v15Sign::new::<sha1::Sha1>().prefix,
            Self::Sha256RsaPkcs => Pkcs1v15Sign::new::<sha2::Sha256>().prefix,
            Self::Sha384RsaPkcs => Pkcs1v15Sign::new::<sha2::Sha384>().prefix,
            Self::Sha512RsaPkcs => Pkcs1v15Sign::new::<sha2::Sha512>().prefix,
        }
    }

    /// DigestInfo for `digest`
    pub fn digest_info(self, digest: &[u8]) -> Vec<u8> {
        let prefix = self.digest_info_prefix();
        let mut info = Vec::with_capacity(prefix.len() + digest.len());
        info.extend_from_slice(&prefix);
        info.extend_from_slice(digest);
        info
    }
}

/// Incremental digest of a hashing mechanism
#[derive(Debug, Clone)]
pub enum Hasher {
    /// SHA-1
    Sha1(sha1::Sha1),
    /// SHA-256
    Sha256(sha2::Sha256),
    /// SHA-384
    Sha384(sha2::Sha384),
    /// SHA-512
    Sha512(sha2::Sha512),
}

impl Hasher {
    /// Absorb `data`
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(hasher) => hasher.update(data),
            Self::Sha256(hasher) => hasher.update(data),
            Self::Sha384(hasher) => hasher.update(data),
            Self::Sha512(hasher) => hasher.update(data),
        }
    }

    /// The digest of everything absorbed
    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha1(hasher) => hasher.finalize().to_vec(),
            Self::Sha256(hasher) => hasher.finalize().to_vec(),
            Self::Sha384(hasher) => hasher.finalize().to_vec(),
            Self::Sha512(hasher) => hasher.finalize().to_vec(),
        }
    }
}
