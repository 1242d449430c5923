//! Contents of an inserted CIE
//!
//! A [`Token`] is read once per card insertion: the serial number and the
//! authentication certificate are enough to build every object the token
//! exposes. The private key never leaves the card, its object only carries
//! the public parts.

use pkcs11_sys::*;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use sha1::{Digest, Sha1};
use tracing::info;
use x509_cert::der::{Decode, Encode};
use x509_cert::Certificate;

use crate::card::CieApplet;
use crate::error::{Error, ErrorKind, Result};
use crate::object::{Attribute, Object, ObjectClass};
use crate::trail;

/// Manufacturer reported in token information
pub const MANUFACTURER: &str = "IPZS";
/// Model reported in token information
pub const MODEL: &str = "CIE 3.0";
/// Label shared by the key pair and the certificate
pub const KEY_LABEL: &str = "CIE0";
/// Label of the data object holding the serial number
pub const SERIAL_LABEL: &str = "SERIAL";
/// Application of the data object holding the serial number
pub const SERIAL_APPLICATION: &str = "CIE";

/// Token objects of one inserted card
#[derive(Debug, Clone)]
pub struct Token {
    serial: String,
    objects: Vec<Object>,
}

impl Token {
    /// Read the token through an applet running inside a card transaction
    pub fn read(applet: &mut CieApplet<'_>) -> Result<Self> {
        let _frame = trail::enter("token::read");
        applet.select_application()?;
        let serial = applet.read_serial()?;
        let certificate = applet.read_certificate()?;
        let token = Self::new(serial, certificate)?;
        info!(serial = %token.serial, "Read CIE token");
        Ok(token)
    }

    /// Build the token from its serial number and DER certificate
    pub fn new(serial: String, certificate: Vec<u8>) -> Result<Self> {
        let unrecognized = |what: &str, e: x509_cert::der::Error| {
            Error::new(ErrorKind::TokenNotRecognized).with_context(format!("{what}: {e}"))
        };

        let parsed = Certificate::from_der(&certificate).map_err(|e| unrecognized("certificate", e))?;
        let tbs = &parsed.tbs_certificate;
        let issuer = tbs.issuer.to_der().map_err(|e| unrecognized("issuer", e))?;
        let subject = tbs.subject.to_der().map_err(|e| unrecognized("subject", e))?;
        let serial_number = tbs
            .serial_number
            .to_der()
            .map_err(|e| unrecognized("serial number", e))?;
        let public_key = RsaPublicKey::from_pkcs1_der(tbs.subject_public_key_info.subject_public_key.raw_bytes())
            .map_err(|e| Error::new(ErrorKind::TokenNotRecognized).with_context(format!("public key: {e}")))?;

        let modulus = public_key.n().to_bytes_be();
        let exponent = public_key.e().to_bytes_be();
        let modulus_bits = CK_ULONG::try_from(public_key.size() * 8)?;
        let id = Sha1::digest(&modulus).to_vec();

        let common = |private: bool| {
            [
                Attribute::bool(CKA_TOKEN, true),
                Attribute::bool(CKA_PRIVATE, private),
                Attribute::bool(CKA_MODIFIABLE, false),
                Attribute::bytes(CKA_LABEL, KEY_LABEL),
                Attribute::bytes(CKA_ID, id.clone()),
            ]
        };

        let certificate_object = Object::new(
            ObjectClass::Certificate,
            common(false).into_iter().chain([
                Attribute::ulong(CKA_CERTIFICATE_TYPE, CKC_X_509),
                Attribute::bool(CKA_TRUSTED, false),
                Attribute::bytes(CKA_SUBJECT, subject.clone()),
                Attribute::bytes(CKA_ISSUER, issuer),
                Attribute::bytes(CKA_SERIAL_NUMBER, serial_number),
                Attribute::bytes(CKA_VALUE, certificate),
            ]),
        );

        let public_key_object = Object::new(
            ObjectClass::PublicKey,
            common(false).into_iter().chain([
                Attribute::ulong(CKA_KEY_TYPE, CKK_RSA),
                Attribute::bytes(CKA_SUBJECT, subject.clone()),
                Attribute::bytes(CKA_MODULUS, modulus.clone()),
                Attribute::bytes(CKA_PUBLIC_EXPONENT, exponent.clone()),
                Attribute::ulong(CKA_MODULUS_BITS, modulus_bits),
                Attribute::bool(CKA_VERIFY, true),
                Attribute::bool(CKA_ENCRYPT, true),
                Attribute::bool(CKA_WRAP, false),
                Attribute::bool(CKA_DERIVE, false),
            ]),
        );

        let private_key_object = Object::new(
            ObjectClass::PrivateKey,
            common(true).into_iter().chain([
                Attribute::ulong(CKA_KEY_TYPE, CKK_RSA),
                Attribute::bytes(CKA_SUBJECT, subject),
                Attribute::bytes(CKA_MODULUS, modulus),
                Attribute::bytes(CKA_PUBLIC_EXPONENT, exponent),
                Attribute::bool(CKA_SIGN, true),
                Attribute::bool(CKA_DECRYPT, true),
                Attribute::bool(CKA_UNWRAP, false),
                Attribute::bool(CKA_DERIVE, false),
                Attribute::bool(CKA_SENSITIVE, true),
                Attribute::bool(CKA_ALWAYS_SENSITIVE, true),
                Attribute::bool(CKA_EXTRACTABLE, false),
                Attribute::bool(CKA_NEVER_EXTRACTABLE, true),
            ]),
        );

        let serial_object = Object::new(
            ObjectClass::Data,
            [
                Attribute::bool(CKA_TOKEN, true),
                Attribute::bool(CKA_PRIVATE, false),
                Attribute::bool(CKA_MODIFIABLE, false),
                Attribute::bytes(CKA_LABEL, SERIAL_LABEL),
                Attribute::bytes(CKA_APPLICATION, SERIAL_APPLICATION),
                Attribute::bytes(CKA_VALUE, serial.as_bytes()),
            ],
        );

        Ok(Self {
            serial,
            objects: vec![
                certificate_object,
                public_key_object,
                private_key_object,
                serial_object,
            ],
        })
    }

    /// Card serial number
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Token label
    pub fn label(&self) -> String {
        format!("CIE ({})", self.serial)
    }

    /// The objects of the token
    pub fn objects(&self) -> &[Object] {
        &self.objects
    }
}
