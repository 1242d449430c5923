//! Crypto operation contexts and the host-side half of the mechanisms
//!
//! Signing and deciphering need the private key and run on the card.
//! Verification and encryption only need the public key and run here.

use std::fmt;

use pkcs11_sys::CK_OBJECT_HANDLE;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPublicKey};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Error, ErrorKind, Result};
use crate::mechanism::{Hasher, Mechanism};

/// PKCS#1 v1.5 padding overhead
const PKCS1_OVERHEAD: usize = 11;

/// A decipher result kept between the length probe and the fill call
struct Deciphered {
    ciphertext: Vec<u8>,
    plaintext: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for Deciphered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deciphered")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("plaintext_len", &self.plaintext.len())
            .finish()
    }
}

/// State of one initialized operation
#[derive(Debug)]
pub struct OperationContext {
    mechanism: Mechanism,
    key: CK_OBJECT_HANDLE,
    hasher: Option<Hasher>,
    multipart: bool,
    deciphered: Option<Deciphered>,
}

impl OperationContext {
    /// Context for `mechanism` with `key`
    pub fn new(mechanism: Mechanism, key: CK_OBJECT_HANDLE) -> Self {
        Self {
            mechanism,
            key,
            hasher: mechanism.hasher(),
            multipart: false,
            deciphered: None,
        }
    }

    /// Mechanism of the operation
    pub const fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    /// Key object of the operation
    pub const fn key(&self) -> CK_OBJECT_HANDLE {
        self.key
    }

    /// Feed a part of a multi-part sign or verify
    pub fn update(&mut self, part: &[u8]) -> Result<()> {
        let Some(hasher) = self.hasher.as_mut() else {
            return Err(Error::new(ErrorKind::FunctionNotSupported)
                .with_context(format!("{} is single-part only", self.mechanism)));
        };
        hasher.update(part);
        self.multipart = true;
        Ok(())
    }

    /// DigestInfo the key signs or verifies
    ///
    /// `data` is the whole input of a single-part call, `None` finishes a
    /// multi-part one.
    pub fn digest_info(&mut self, data: Option<&[u8]>, public_key: &RsaPublicKey) -> Result<Vec<u8>> {
        let info = match (self.hasher.take(), data) {
            (Some(_), Some(_)) if self.multipart => return Err(ErrorKind::OperationActive.into()),
            (Some(mut hasher), Some(data)) => {
                hasher.update(data);
                self.mechanism.digest_info(&hasher.finalize())
            }
            (Some(hasher), None) => self.mechanism.digest_info(&hasher.finalize()),
            (None, Some(data)) => data.to_vec(),
            (None, None) => return Err(ErrorKind::OperationNotInitialized.into()),
        };
        if info.len() > max_message_len(public_key) {
            return Err(ErrorKind::DataLenRange.into());
        }
        Ok(info)
    }

    /// Plaintext cached by a previous probe on the same `ciphertext`
    pub fn cached_plaintext(&self, ciphertext: &[u8]) -> Option<&Zeroizing<Vec<u8>>> {
        self.deciphered
            .as_ref()
            .filter(|deciphered| deciphered.ciphertext == ciphertext)
            .map(|deciphered| &deciphered.plaintext)
    }

    /// Keep a decipher result for the fill call
    pub fn cache_plaintext(&mut self, ciphertext: &[u8], plaintext: Zeroizing<Vec<u8>>) {
        self.deciphered = Some(Deciphered {
            ciphertext: ciphertext.to_vec(),
            plaintext,
        });
    }

    /// Take the cached plaintext if it belongs to `ciphertext`
    pub fn take_plaintext(&mut self, ciphertext: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
        match self.deciphered.take() {
            Some(deciphered) if deciphered.ciphertext == ciphertext => Some(deciphered.plaintext),
            _ => None,
        }
    }
}

/// Longest message PKCS#1 v1.5 can pad for `public_key`
fn max_message_len(public_key: &RsaPublicKey) -> usize {
    public_key.size().saturating_sub(PKCS1_OVERHEAD)
}

/// Check `signature` over `digest_info`
pub fn verify(public_key: &RsaPublicKey, digest_info: &[u8], signature: &[u8]) -> Result<()> {
    if signature.len() != public_key.size() {
        return Err(ErrorKind::SignatureLenRange.into());
    }
    public_key
        .verify(Pkcs1v15Sign::new_unprefixed(), digest_info, signature)
        .map_err(|e| {
            debug!(error = %e, "Signature rejected");
            ErrorKind::SignatureInvalid.into()
        })
}

/// Check that PKCS#1 v1.5 can pad `data` for `public_key`
pub fn check_plaintext(public_key: &RsaPublicKey, data: &[u8]) -> Result<()> {
    if data.len() > max_message_len(public_key) {
        return Err(ErrorKind::DataLenRange.into());
    }
    Ok(())
}

/// Encrypt `data` with PKCS#1 v1.5 padding
pub fn encrypt(public_key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>> {
    check_plaintext(public_key, data)?;
    public_key
        .encrypt(&mut rand_v8::thread_rng(), Pkcs1v15Encrypt, data)
        .map_err(|e| Error::general(format!("encryption failed: {e}")))
}

/// Check that `ciphertext` has the modulus length
pub fn check_ciphertext(public_key: &RsaPublicKey, ciphertext: &[u8]) -> Result<()> {
    if ciphertext.len() == public_key.size() {
        Ok(())
    } else {
        Err(ErrorKind::EncryptedDataLenRange.into())
    }
}
