//! Status word definitions for APDU responses

use std::fmt;

use tracing::Level;

/// Status Word (SW1-SW2) from an APDU response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord {
    /// First status byte (SW1)
    pub sw1: u8,
    /// Second status byte (SW2)
    pub sw2: u8,
}

impl StatusWord {
    /// Create a new status word
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    /// Create from a u16 value (SW1 | SW2)
    pub const fn from_u16(status: u16) -> Self {
        Self {
            sw1: (status >> 8) as u8,
            sw2: status as u8,
        }
    }

    /// Convert to a u16 value (SW1 | SW2)
    pub const fn to_u16(&self) -> u16 {
        ((self.sw1 as u16) << 8) | (self.sw2 as u16)
    }

    /// 90 00
    pub const fn is_success(&self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    /// 61 XX, more response bytes are waiting for GET RESPONSE
    pub const fn is_more_data_available(&self) -> bool {
        self.sw1 == 0x61
    }

    /// Number of waiting bytes when SW1 = 61 (00 means 256 or more)
    pub const fn remaining_bytes(&self) -> Option<u8> {
        if self.sw1 == 0x61 {
            Some(self.sw2)
        } else {
            None
        }
    }

    /// 6C XX, the card wants the command re-issued with Le = XX
    pub const fn corrected_le(&self) -> Option<u8> {
        if self.sw1 == 0x6C {
            Some(self.sw2)
        } else {
            None
        }
    }

    /// 62 XX
    pub const fn is_warning(&self) -> bool {
        self.sw1 == 0x62
    }

    /// End of file reached before Le bytes could be read (62 82)
    pub const fn is_end_of_file(&self) -> bool {
        self.sw1 == 0x62 && self.sw2 == 0x82
    }

    /// Offset beyond the end of an elementary file (6B 00)
    pub const fn is_wrong_offset(&self) -> bool {
        self.sw1 == 0x6B && self.sw2 == 0x00
    }

    /// Verification counter (63 CX), returning the remaining tries
    pub const fn retries_left(&self) -> Option<u8> {
        if self.sw1 == 0x63 && (self.sw2 & 0xF0) == 0xC0 {
            Some(self.sw2 & 0x0F)
        } else {
            None
        }
    }

    /// Security status not satisfied (69 82)
    pub const fn is_security_condition_not_satisfied(&self) -> bool {
        self.sw1 == 0x69 && self.sw2 == 0x82
    }

    /// Authentication method blocked (69 83)
    pub const fn is_auth_method_blocked(&self) -> bool {
        self.sw1 == 0x69 && self.sw2 == 0x83
    }

    /// Reference data not usable (69 84)
    pub const fn is_reference_data_invalidated(&self) -> bool {
        self.sw1 == 0x69 && self.sw2 == 0x84
    }

    /// File not found (6A 82)
    pub const fn is_file_not_found(&self) -> bool {
        self.sw1 == 0x6A && self.sw2 == 0x82
    }

    /// Wrong length (67 00)
    pub const fn is_wrong_length(&self) -> bool {
        self.sw1 == 0x67 && self.sw2 == 0x00
    }

    /// Get the appropriate tracing level for this status word
    pub const fn tracing_level(&self) -> Level {
        if self.is_success() || self.is_more_data_available() {
            Level::DEBUG
        } else if self.sw1 == 0x62 || self.sw1 == 0x63 {
            Level::INFO
        } else {
            Level::WARN
        }
    }

    /// Get a description of this status word
    pub const fn description(&self) -> &'static str {
        match (self.sw1, self.sw2) {
            (0x90, 0x00) => "Success",
            (0x61, _) => "More data available",
            (0x62, 0x81) => "Part of returned data may be corrupted",
            (0x62, 0x82) => "End of file reached before reading Le bytes",
            (0x62, 0x83) => "Selected file invalidated",
            (0x62, _) => "Warning, non-volatile memory unchanged",
            (0x63, n) if (n & 0xF0) == 0xC0 => "Verification failed, counter value",
            (0x63, _) => "Warning, non-volatile memory changed",
            (0x64, _) => "Execution error, non-volatile memory unchanged",
            (0x65, 0x81) => "Memory failure",
            (0x67, 0x00) => "Wrong length",
            (0x68, 0x82) => "Secure messaging not supported",
            (0x68, 0x84) => "Command chaining not supported",
            (0x69, 0x81) => "Command incompatible with file structure",
            (0x69, 0x82) => "Security status not satisfied",
            (0x69, 0x83) => "Authentication method blocked",
            (0x69, 0x84) => "Reference data not usable",
            (0x69, 0x85) => "Conditions of use not satisfied",
            (0x69, 0x86) => "Command not allowed",
            (0x6A, 0x80) => "Incorrect parameters in the data field",
            (0x6A, 0x81) => "Function not supported",
            (0x6A, 0x82) => "File not found",
            (0x6A, 0x86) => "Incorrect parameters P1-P2",
            (0x6A, 0x88) => "Referenced data not found",
            (0x6B, 0x00) => "Wrong parameters P1-P2",
            (0x6C, _) => "Wrong Le field",
            (0x6D, 0x00) => "Instruction code not supported or invalid",
            (0x6E, 0x00) => "Class not supported",
            (0x6F, 0x00) => "No precise diagnosis",
            _ => "Unknown status word",
        }
    }
}

impl From<(u8, u8)> for StatusWord {
    fn from(tuple: (u8, u8)) -> Self {
        Self::new(tuple.0, tuple.1)
    }
}

impl From<u16> for StatusWord {
    fn from(status: u16) -> Self {
        Self::from_u16(status)
    }
}

impl From<StatusWord> for u16 {
    fn from(status: StatusWord) -> Self {
        status.to_u16()
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X} {:02X}", self.sw1, self.sw2)
    }
}

/// Status words the card layer answers with or checks for
pub mod common {
    use super::StatusWord;

    /// 90 00
    pub const SUCCESS: StatusWord = StatusWord::new(0x90, 0x00);
    /// 62 82
    pub const END_OF_FILE: StatusWord = StatusWord::new(0x62, 0x82);
    /// 63 C0, counter exhausted
    pub const COUNTER_EXHAUSTED: StatusWord = StatusWord::new(0x63, 0xC0);
    /// 67 00
    pub const WRONG_LENGTH: StatusWord = StatusWord::new(0x67, 0x00);
    /// 68 84
    pub const CHAINING_NOT_SUPPORTED: StatusWord = StatusWord::new(0x68, 0x84);
    /// 69 82
    pub const SECURITY_CONDITION_NOT_SATISFIED: StatusWord = StatusWord::new(0x69, 0x82);
    /// 69 83
    pub const AUTH_METHOD_BLOCKED: StatusWord = StatusWord::new(0x69, 0x83);
    /// 69 84
    pub const REFERENCE_DATA_INVALIDATED: StatusWord = StatusWord::new(0x69, 0x84);
    /// 69 85
    pub const CONDITIONS_NOT_SATISFIED: StatusWord = StatusWord::new(0x69, 0x85);
    /// 6A 80
    pub const INCORRECT_DATA: StatusWord = StatusWord::new(0x6A, 0x80);
    /// 6A 82
    pub const FILE_NOT_FOUND: StatusWord = StatusWord::new(0x6A, 0x82);
    /// 6A 86
    pub const INCORRECT_P1P2: StatusWord = StatusWord::new(0x6A, 0x86);
    /// 6A 88
    pub const REFERENCED_DATA_NOT_FOUND: StatusWord = StatusWord::new(0x6A, 0x88);
    /// 6B 00
    pub const WRONG_OFFSET: StatusWord = StatusWord::new(0x6B, 0x00);
    /// 6D 00
    pub const INVALID_INSTRUCTION: StatusWord = StatusWord::new(0x6D, 0x00);
    /// 6E 00
    pub const CLASS_NOT_SUPPORTED: StatusWord = StatusWord::new(0x6E, 0x00);
    /// 6F 00
    pub const NO_PRECISE_DIAGNOSIS: StatusWord = StatusWord::new(0x6F, 0x00);

    /// 63 CX with the given remaining tries
    pub const fn counter(retries: u8) -> StatusWord {
        StatusWord::new(0x63, 0xC0 | (retries & 0x0F))
    }
}
