//! APDU command definitions
//!
//! Commands encode to the short form whenever Lc and Le fit in one byte and
//! switch to the extended form otherwise (ISO/IEC 7816-4 section 5.1).
//! Cards that lack extended length support take long payloads through
//! [`Command::chained`] instead.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Largest data field of a short command
pub const SHORT_MAX_DATA: usize = 255;

/// Largest data field of an extended command
pub const EXTENDED_MAX_DATA: usize = 65535;

/// CLA bit announcing that more chained commands follow
pub const CLA_CHAINING: u8 = 0x10;

/// Generic APDU command structure
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    /// Command class byte
    pub cla: u8,
    /// Instruction byte
    pub ins: u8,
    /// Parameter 1
    pub p1: u8,
    /// Parameter 2
    pub p2: u8,
    /// Command data (optional)
    pub data: Option<Bytes>,
    /// Expected length, `0` meaning the maximum for the encoding in use
    pub le: Option<u16>,
}

impl Command {
    /// Create a new command with just the header bytes
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: None,
        }
    }

    /// Create a new command with expected response length (Le)
    pub const fn new_with_le(cla: u8, ins: u8, p1: u8, p2: u8, le: u16) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: Some(le),
        }
    }

    /// Create a new command with data payload
    pub fn new_with_data<T: Into<Bytes>>(cla: u8, ins: u8, p1: u8, p2: u8, data: T) -> Self {
        Self::new(cla, ins, p1, p2).with_data(data)
    }

    /// Set the data field
    pub fn with_data<T: Into<Bytes>>(mut self, data: T) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the expected length field
    pub const fn with_le(mut self, le: u16) -> Self {
        self.le = Some(le);
        self
    }

    /// Command data, empty when absent
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }

    /// Whether the CLA byte announces a following chained command
    pub const fn is_chained(&self) -> bool {
        self.cla & CLA_CHAINING != 0
    }

    fn needs_extended(&self) -> bool {
        self.data().len() > SHORT_MAX_DATA || self.le.is_some_and(|le| le > 256)
    }

    /// Calculate length of serialized command
    pub fn command_length(&self) -> usize {
        let extended = self.needs_extended();
        let data_len = self.data().len();
        let mut length = 4;
        if data_len > 0 {
            length += data_len + if extended { 3 } else { 1 };
        }
        if self.le.is_some() {
            length += match (extended, data_len > 0) {
                (false, _) => 1,
                (true, true) => 2,
                (true, false) => 3,
            };
        }
        length
    }

    /// Convert to raw APDU bytes
    pub fn to_bytes(&self) -> Result<Bytes> {
        let data = self.data();
        if data.len() > EXTENDED_MAX_DATA {
            return Err(Error::DataTooLong(data.len()));
        }
        let extended = self.needs_extended();

        let mut buffer = BytesMut::with_capacity(self.command_length());
        buffer.put_slice(&[self.cla, self.ins, self.p1, self.p2]);

        if !data.is_empty() {
            if extended {
                buffer.put_u8(0x00);
                buffer.put_u16(data.len() as u16);
            } else {
                buffer.put_u8(data.len() as u8);
            }
            buffer.put_slice(data);
        }

        if let Some(le) = self.le {
            if extended {
                if data.is_empty() {
                    buffer.put_u8(0x00);
                }
                // 65536 encodes as 00 00
                buffer.put_u16(le);
            } else {
                // 256 encodes as 00
                buffer.put_u8(le as u8);
            }
        }

        Ok(buffer.freeze())
    }

    /// Split the command into a command chain carrying at most `max_data`
    /// bytes each. Every link but the last has the chaining bit set in CLA and
    /// only the last one keeps Le.
    pub fn chained(&self, max_data: usize) -> Vec<Self> {
        let data = self.data();
        if data.len() <= max_data || max_data == 0 {
            return vec![self.clone()];
        }

        let chunks: Vec<&[u8]> = data.chunks(max_data).collect();
        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut link = Self::new(self.cla, self.ins, self.p1, self.p2)
                    .with_data(Bytes::copy_from_slice(chunk));
                if i == last {
                    link.le = self.le;
                } else {
                    link.cla |= CLA_CHAINING;
                }
                link
            })
            .collect()
    }

    /// Parse a command from raw bytes, short or extended form
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let [cla, ins, p1, p2, body @ ..] = data else {
            return Err(Error::InvalidCommandLength(data.len()));
        };
        let mut command = Self::new(*cla, *ins, *p1, *p2);
        let invalid = || Error::InvalidCommandLength(data.len());

        match body {
            [] => {}
            // case 2 short
            [le] => command.le = Some(if *le == 0 { 256 } else { u16::from(*le) }),
            // extended forms start with a zero byte followed by two length bytes
            [0x00, hi, lo, rest @ ..] => {
                let len = u16::from_be_bytes([*hi, *lo]);
                if rest.is_empty() {
                    // case 2 extended, 0 stands for 65536 and is kept as 0
                    command.le = Some(len);
                } else {
                    let lc = usize::from(len);
                    if rest.len() < lc {
                        return Err(invalid());
                    }
                    command.data = Some(Bytes::copy_from_slice(&rest[..lc]));
                    match &rest[lc..] {
                        [] => {}
                        [hi, lo] => command.le = Some(u16::from_be_bytes([*hi, *lo])),
                        _ => return Err(invalid()),
                    }
                }
            }
            [lc, rest @ ..] => {
                let lc = usize::from(*lc);
                if rest.len() < lc {
                    return Err(invalid());
                }
                command.data = Some(Bytes::copy_from_slice(&rest[..lc]));
                match &rest[lc..] {
                    [] => {}
                    [le] => command.le = Some(if *le == 0 { 256 } else { u16::from(*le) }),
                    _ => return Err(invalid()),
                }
            }
        }

        Ok(command)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("cla", &format_args!("{:#04x}", self.cla))
            .field("ins", &format_args!("{:#04x}", self.ins))
            .field("p1", &format_args!("{:#04x}", self.p1))
            .field("p2", &format_args!("{:#04x}", self.p2))
            .field("data_len", &self.data().len())
            .field("le", &self.le)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_command_serialization() {
        let cmd = Command::new_with_data(0x00, 0xA4, 0x04, 0x0C, hex!("A0000000308000000009816001").to_vec());
        assert_eq!(
            cmd.to_bytes().unwrap().as_ref(),
            hex!("00A4040C0D A0000000308000000009816001")
        );

        let cmd = Command::new_with_le(0x00, 0x84, 0x00, 0x00, 8);
        assert_eq!(cmd.to_bytes().unwrap().as_ref(), hex!("0084000008"));

        let cmd = Command::new_with_data(0x00, 0x2A, 0x9E, 0x9A, vec![0x01, 0x02]).with_le(256);
        assert_eq!(cmd.to_bytes().unwrap().as_ref(), hex!("002A9E9A02010200"));
    }

    #[test]
    fn test_extended_encoding() {
        let cmd = Command::new_with_data(0x00, 0x2A, 0x80, 0x86, vec![0xAB; 300]).with_le(0);
        let bytes = cmd.to_bytes().unwrap();
        assert_eq!(&bytes[..7], hex!("002A8086 00012C"));
        assert_eq!(&bytes[bytes.len() - 2..], hex!("0000"));
        assert_eq!(bytes.len(), cmd.command_length());
        assert_eq!(Command::from_bytes(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_command_length() {
        assert_eq!(Command::new(0x00, 0xB0, 0x00, 0x00).command_length(), 4);
        assert_eq!(Command::new_with_le(0x00, 0xB0, 0x00, 0x00, 0xE7).command_length(), 5);
        let cmd = Command::new_with_data(0x00, 0xD6, 0x00, 0x00, vec![1, 2, 3]);
        assert_eq!(cmd.command_length(), 8);
        assert_eq!(cmd.with_le(0xFF).command_length(), 9);
    }

    #[test]
    fn test_command_from_bytes() {
        let cmd = Command::from_bytes(&hex!("00A4040C")).unwrap();
        assert_eq!((cmd.cla, cmd.ins, cmd.p1, cmd.p2), (0x00, 0xA4, 0x04, 0x0C));
        assert!(cmd.data.is_none());
        assert!(cmd.le.is_none());

        let cmd = Command::from_bytes(&hex!("00A4020C021003")).unwrap();
        assert_eq!(cmd.data(), &hex!("1003"));
        assert!(cmd.le.is_none());

        let cmd = Command::from_bytes(&hex!("00B00000E7")).unwrap();
        assert!(cmd.data.is_none());
        assert_eq!(cmd.le, Some(0xE7));

        let cmd = Command::from_bytes(&hex!("00B0000000")).unwrap();
        assert_eq!(cmd.le, Some(256));

        let cmd = Command::from_bytes(&hex!("002A9E9A03010203FF")).unwrap();
        assert_eq!(cmd.data(), &hex!("010203"));
        assert_eq!(cmd.le, Some(0xFF));

        assert!(Command::from_bytes(&hex!("00A4")).is_err());
        assert!(Command::from_bytes(&hex!("00A4040C050102")).is_err());
    }

    #[test]
    fn test_chaining() {
        let cmd = Command::new_with_data(0x00, 0x2A, 0x80, 0x86, vec![0x11; 257]).with_le(256);
        let chain = cmd.chained(SHORT_MAX_DATA);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].cla, CLA_CHAINING);
        assert_eq!(chain[0].data().len(), 255);
        assert!(chain[0].le.is_none());
        assert_eq!(chain[1].cla, 0x00);
        assert_eq!(chain[1].data().len(), 2);
        assert_eq!(chain[1].le, Some(256));

        let short = Command::new_with_data(0x00, 0x20, 0x00, 0x10, vec![0x31; 8]);
        assert_eq!(short.chained(SHORT_MAX_DATA), vec![short]);
    }
}
