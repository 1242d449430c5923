//! CIE application identifiers and command constants

/// AID of the CIE IAS application
pub const CIE_AID: &[u8] = b"\xA0\x00\x00\x00\x30\x80\x00\x00\x00\x09\x81\x60\x01";

/// Reference of the user PIN
pub const PIN_REFERENCE: u8 = 0x10;
/// Reference of the PUK
pub const PUK_REFERENCE: u8 = 0x11;
/// Length of the PIN and of the PUK
pub const PIN_LENGTH: usize = 8;
/// Tries before the PIN is blocked
pub const PIN_MAX_TRIES: u8 = 3;

/// Algorithm reference of RSA with PKCS#1 v1.5 padding
pub const ALGORITHM_RSA_PKCS1: u8 = 0x02;
/// Reference of the signature and decipher key
pub const KEY_REFERENCE: u8 = 0x81;

/// Largest READ BINARY chunk the card serves
pub const READ_CHUNK: u8 = 0xE7;

/// Instruction bytes
pub mod ins {
    /// SELECT
    pub const SELECT: u8 = 0xA4;
    /// READ BINARY
    pub const READ_BINARY: u8 = 0xB0;
    /// VERIFY
    pub const VERIFY: u8 = 0x20;
    /// CHANGE REFERENCE DATA
    pub const CHANGE_REFERENCE_DATA: u8 = 0x24;
    /// RESET RETRY COUNTER
    pub const RESET_RETRY_COUNTER: u8 = 0x2C;
    /// MANAGE SECURITY ENVIRONMENT
    pub const MSE: u8 = 0x22;
    /// PERFORM SECURITY OPERATION
    pub const PSO: u8 = 0x2A;
    /// GET CHALLENGE
    pub const GET_CHALLENGE: u8 = 0x84;
    /// GET RESPONSE
    pub const GET_RESPONSE: u8 = 0xC0;
}

/// File identifiers
pub mod fid {
    /// Master file
    pub const MASTER_FILE: u16 = 0x3F00;
    /// EF holding the authentication certificate (DER)
    pub const CERTIFICATE: u16 = 0x1003;
    /// EF holding the card serial number (ASCII)
    pub const SERIAL: u16 = 0x1002;
}

/// Control reference template tags used in MSE SET
pub mod tags {
    /// Cryptographic mechanism reference
    pub const ALGORITHM: u8 = 0x80;
    /// Reference of a private key
    pub const KEY_REFERENCE: u8 = 0x84;
}
