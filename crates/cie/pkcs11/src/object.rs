//! Token objects and attribute templates

use derive_more::Display;
use pkcs11_sys::*;
use rsa::{BigUint, RsaPublicKey};

use crate::error::{Error, ErrorKind, Result};

/// Class of a token object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ObjectClass {
    /// X.509 certificate
    #[display("certificate")]
    Certificate,
    /// RSA public key
    #[display("public key")]
    PublicKey,
    /// RSA private key, living on the card only
    #[display("private key")]
    PrivateKey,
    /// Application data
    #[display("data")]
    Data,
}

impl ObjectClass {
    /// `CKO_*` value of this class
    pub const fn ck(self) -> CK_OBJECT_CLASS {
        match self {
            Self::Certificate => CKO_CERTIFICATE,
            Self::PublicKey => CKO_PUBLIC_KEY,
            Self::PrivateKey => CKO_PRIVATE_KEY,
            Self::Data => CKO_DATA,
        }
    }
}

/// Attribute type with its value, encoded as Cryptoki lays it out in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// `CKA_*` type
    pub kind: CK_ATTRIBUTE_TYPE,
    /// Encoded value
    pub value: Vec<u8>,
}

impl Attribute {
    /// Attribute holding raw bytes
    pub fn bytes(kind: CK_ATTRIBUTE_TYPE, value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    /// Attribute holding a `CK_ULONG`
    pub fn ulong(kind: CK_ATTRIBUTE_TYPE, value: CK_ULONG) -> Self {
        Self::bytes(kind, value.to_ne_bytes())
    }

    /// Attribute holding a `CK_BBOOL`
    pub fn bool(kind: CK_ATTRIBUTE_TYPE, value: bool) -> Self {
        Self::bytes(kind, [if value { CK_TRUE } else { CK_FALSE }])
    }
}

/// Outcome of reading one attribute of an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// The encoded value
    Available(Vec<u8>),
    /// The attribute exists but may not leave the token
    Sensitive,
    /// The object has no such attribute
    Invalid,
}

impl AttributeValue {
    /// Error reported for an unreadable attribute of type `kind`
    pub const fn error(&self, kind: CK_ATTRIBUTE_TYPE) -> Option<ErrorKind> {
        match self {
            Self::Available(_) => None,
            Self::Sensitive => Some(ErrorKind::AttributeSensitive(kind)),
            Self::Invalid => Some(ErrorKind::AttributeTypeInvalid(kind)),
        }
    }
}

/// Private key components that exist only on the card
const SENSITIVE: [CK_ATTRIBUTE_TYPE; 6] = [
    CKA_PRIVATE_EXPONENT,
    CKA_PRIME_1,
    CKA_PRIME_2,
    CKA_EXPONENT_1,
    CKA_EXPONENT_2,
    CKA_COEFFICIENT,
];

/// A token object and its attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    class: ObjectClass,
    attributes: Vec<Attribute>,
}

impl Object {
    /// Build an object, `CKA_CLASS` is added from `class`
    pub fn new(class: ObjectClass, attributes: impl IntoIterator<Item = Attribute>) -> Self {
        let attributes = std::iter::once(Attribute::ulong(CKA_CLASS, class.ck()))
            .chain(attributes)
            .collect();
        Self { class, attributes }
    }

    /// Class of the object
    pub const fn class(&self) -> ObjectClass {
        self.class
    }

    /// Encoded value of `kind`, if the object has it
    pub fn attribute(&self, kind: CK_ATTRIBUTE_TYPE) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|attribute| attribute.kind == kind)
            .map(|attribute| attribute.value.as_slice())
    }

    /// Whether the boolean attribute `kind` is set
    pub fn flag(&self, kind: CK_ATTRIBUTE_TYPE) -> bool {
        self.attribute(kind) == Some(&[CK_TRUE])
    }

    /// Whether using the object needs an authenticated session
    pub fn is_private(&self) -> bool {
        self.flag(CKA_PRIVATE)
    }

    /// Read `kind` for the caller
    pub fn read(&self, kind: CK_ATTRIBUTE_TYPE) -> AttributeValue {
        if self.class == ObjectClass::PrivateKey && SENSITIVE.contains(&kind) {
            return AttributeValue::Sensitive;
        }
        self.attribute(kind)
            .map_or(AttributeValue::Invalid, |value| AttributeValue::Available(value.to_vec()))
    }

    /// Whether every attribute of `template` is present with an equal value
    pub fn matches(&self, template: &[Attribute]) -> bool {
        template
            .iter()
            .all(|wanted| self.attribute(wanted.kind) == Some(wanted.value.as_slice()))
    }

    /// RSA public key built from `CKA_MODULUS` and `CKA_PUBLIC_EXPONENT`
    ///
    /// Both halves of the key pair carry the public components.
    pub fn rsa_public_key(&self) -> Result<RsaPublicKey> {
        let (Some(modulus), Some(exponent)) =
            (self.attribute(CKA_MODULUS), self.attribute(CKA_PUBLIC_EXPONENT))
        else {
            return Err(Error::new(ErrorKind::KeyFunctionNotPermitted)
                .with_context(format!("{} has no RSA public components", self.class)));
        };
        RsaPublicKey::new(BigUint::from_bytes_be(modulus), BigUint::from_bytes_be(exponent))
            .map_err(|e| Error::general(format!("{} holds a malformed RSA key: {e}", self.class)))
    }

    /// Fail with [`ErrorKind::KeyFunctionNotPermitted`] unless the boolean
    /// `capability` (`CKA_SIGN`, `CKA_DECRYPT`, ...) is set
    pub fn require(&self, capability: CK_ATTRIBUTE_TYPE) -> Result<()> {
        if self.flag(capability) {
            Ok(())
        } else {
            Err(ErrorKind::KeyFunctionNotPermitted.into())
        }
    }
}
