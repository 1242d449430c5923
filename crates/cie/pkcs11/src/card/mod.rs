//! CIE card application
//!
//! [`CieApplet`] speaks the IAS commands the provider needs over any
//! [`CardTransport`]. It does not open transactions itself: callers run it
//! inside one so that, say, VERIFY and PSO reach the card back to back.

pub mod constants;

use cie_apdu_core::response::status::common as sw;
use cie_apdu_core::{CardExecutor, CardTransport, Command, StatusWord};
use iso7816_tlv::ber::{Tag, Tlv, Value};
use tracing::debug;
use zeroize::Zeroizing;

use self::constants::{fid, ins, tags};
use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::trail;

/// What an empty VERIFY reports about the PIN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinStatus {
    /// The PIN was verified in the current card session
    Verified,
    /// The PIN is not verified, this many tries remain
    Retries(u8),
    /// No tries remain
    Blocked,
}

/// The CIE IAS application reached through a transport
#[derive(Debug)]
pub struct CieApplet<'a> {
    executor: CardExecutor<&'a mut dyn CardTransport>,
}

impl<'a> CieApplet<'a> {
    /// Wrap a transport
    pub fn new(transport: &'a mut dyn CardTransport) -> Self {
        Self {
            executor: CardExecutor::new(transport),
        }
    }

    /// SELECT the IAS application by AID
    pub fn select_application(&mut self) -> Result<()> {
        let command = Command::new_with_data(0x00, ins::SELECT, 0x04, 0x0C, constants::CIE_AID);
        self.executor
            .execute(&command)
            .context("selecting the CIE application")?;
        Ok(())
    }

    fn select_file(&mut self, id: u16) -> Result<()> {
        let command = Command::new_with_data(0x00, ins::SELECT, 0x02, 0x0C, id.to_be_bytes().to_vec());
        self.executor
            .execute(&command)
            .context(&format!("selecting EF {id:04X}"))?;
        Ok(())
    }

    /// Read a transparent EF of the application in READ BINARY chunks
    pub fn read_file(&mut self, id: u16) -> Result<Vec<u8>> {
        let _frame = trail::enter("card::read_file");
        self.select_file(id)?;

        let mut contents = Vec::new();
        loop {
            let offset = u16::try_from(contents.len())
                .ok()
                .filter(|offset| *offset <= 0x7FFF)
                .ok_or_else(|| Error::general(format!("EF {id:04X} exceeds the addressable size")))?;
            let [p1, p2] = offset.to_be_bytes();
            let command = Command::new_with_le(
                0x00,
                ins::READ_BINARY,
                p1,
                p2,
                u16::from(constants::READ_CHUNK),
            );
            let response = self.executor.transmit(&command)?;
            let status = response.status();
            if status.is_wrong_offset() {
                break;
            }
            if !status.is_success() && !status.is_end_of_file() {
                return Err(Error::new(ErrorKind::Card(status)).with_context(format!("reading EF {id:04X}")));
            }

            let chunk = response.payload();
            contents.extend_from_slice(chunk);
            if status.is_end_of_file() || chunk.len() < usize::from(constants::READ_CHUNK) {
                break;
            }
        }
        debug!(file = format_args!("{id:04X}"), len = contents.len(), "Read EF");
        Ok(contents)
    }

    /// Serial number of the card
    pub fn read_serial(&mut self) -> Result<String> {
        let raw = self.read_file(fid::SERIAL)?;
        let serial = String::from_utf8_lossy(&raw)
            .trim_matches(|c: char| c == '\0' || c.is_whitespace())
            .to_string();
        if serial.is_empty() {
            return Err(ErrorKind::TokenNotRecognized.into());
        }
        Ok(serial)
    }

    /// DER authentication certificate
    pub fn read_certificate(&mut self) -> Result<Vec<u8>> {
        self.read_file(fid::CERTIFICATE)
    }

    /// Query the PIN counter without presenting the PIN
    pub fn pin_status(&mut self) -> Result<PinStatus> {
        let command = Command::new(0x00, ins::VERIFY, 0x00, constants::PIN_REFERENCE);
        let status = self.executor.transmit(&command)?.status();
        match (status.sw1, status.sw2) {
            (0x90, 0x00) => Ok(PinStatus::Verified),
            (0x69, 0x83) => Ok(PinStatus::Blocked),
            _ => match status.retries_left() {
                Some(0) => Ok(PinStatus::Blocked),
                Some(retries) => Ok(PinStatus::Retries(retries)),
                None => Err(ErrorKind::Card(status).into()),
            },
        }
    }

    /// VERIFY the user PIN
    pub fn verify_pin(&mut self, pin: &[u8]) -> Result<()> {
        let _frame = trail::enter("card::verify_pin");
        self.verify(constants::PIN_REFERENCE, pin)
    }

    /// VERIFY the PUK
    pub fn verify_puk(&mut self, puk: &[u8]) -> Result<()> {
        let _frame = trail::enter("card::verify_puk");
        self.verify(constants::PUK_REFERENCE, puk)
    }

    fn verify(&mut self, reference: u8, secret: &[u8]) -> Result<()> {
        let command = Command::new_with_data(0x00, ins::VERIFY, 0x00, reference, secret.to_vec());
        let status = self.executor.transmit(&command)?.status();
        check_verification(status)
    }

    /// CHANGE REFERENCE DATA of the PIN
    pub fn change_pin(&mut self, old: &[u8], new: &[u8]) -> Result<()> {
        let _frame = trail::enter("card::change_pin");
        let data = Zeroizing::new([old, new].concat());
        let command = Command::new_with_data(
            0x00,
            ins::CHANGE_REFERENCE_DATA,
            0x00,
            constants::PIN_REFERENCE,
            data.to_vec(),
        );
        let status = self.executor.transmit(&command)?.status();
        check_verification(status)
    }

    /// RESET RETRY COUNTER of the PIN with the PUK, setting a new PIN
    pub fn unblock_pin(&mut self, puk: &[u8], new: &[u8]) -> Result<()> {
        let _frame = trail::enter("card::unblock_pin");
        let data = Zeroizing::new([puk, new].concat());
        let command = Command::new_with_data(
            0x00,
            ins::RESET_RETRY_COUNTER,
            0x00,
            constants::PIN_REFERENCE,
            data.to_vec(),
        );
        let status = self.executor.transmit(&command)?.status();
        check_verification(status)
    }

    /// MSE SET selecting the card key for `template` (`B6` sign, `B8`
    /// decipher)
    fn set_environment(&mut self, template: u8) -> Result<()> {
        let command = Command::new_with_data(0x00, ins::MSE, 0x41, template, environment_data()?);
        self.executor
            .execute(&command)
            .context("setting the security environment")?;
        Ok(())
    }

    /// PSO COMPUTE DIGITAL SIGNATURE over a DigestInfo
    pub fn sign(&mut self, digest_info: &[u8]) -> Result<Vec<u8>> {
        let _frame = trail::enter("card::sign");
        self.set_environment(0xB6)?;
        let command = Command::new_with_data(0x00, ins::PSO, 0x9E, 0x9A, digest_info.to_vec()).with_le(256);
        let signature = self.executor.execute(&command)?;
        Ok(signature.to_vec())
    }

    /// PSO DECIPHER of a PKCS#1 v1.5 cryptogram
    pub fn decipher(&mut self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let _frame = trail::enter("card::decipher");
        self.set_environment(0xB8)?;
        // padding indicator byte
        let mut data = Vec::with_capacity(ciphertext.len() + 1);
        data.push(0x00);
        data.extend_from_slice(ciphertext);
        let command = Command::new_with_data(0x00, ins::PSO, 0x80, 0x86, data).with_le(256);
        let plaintext = self.executor.execute_chained(&command)?;
        Ok(Zeroizing::new(plaintext.to_vec()))
    }

    /// `len` random bytes from GET CHALLENGE
    pub fn challenge(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut random = Vec::with_capacity(len);
        while random.len() < len {
            let chunk = self
                .executor
                .execute(&Command::new_with_le(0x00, ins::GET_CHALLENGE, 0x00, 0x00, 8))?;
            if chunk.is_empty() {
                return Err(ErrorKind::Card(sw::NO_PRECISE_DIAGNOSIS).into());
            }
            random.extend_from_slice(&chunk);
        }
        random.truncate(len);
        Ok(random)
    }
}

/// Control reference template selecting RSA PKCS#1 v1.5 with the card key
fn environment_data() -> Result<Vec<u8>> {
    let tlv_error = |e: iso7816_tlv::TlvError| Error::general(format!("building MSE template: {e}"));
    let mut data = Vec::with_capacity(6);
    for (tag, value) in [
        (tags::ALGORITHM, constants::ALGORITHM_RSA_PKCS1),
        (tags::KEY_REFERENCE, constants::KEY_REFERENCE),
    ] {
        let tag = Tag::try_from(tag).map_err(tlv_error)?;
        let tlv = Tlv::new(tag, Value::Primitive(vec![value])).map_err(tlv_error)?;
        data.extend_from_slice(&tlv.to_vec());
    }
    Ok(data)
}

/// Map the answer to VERIFY and the PIN management commands
fn check_verification(status: StatusWord) -> Result<()> {
    match (status.sw1, status.sw2) {
        (0x90, 0x00) => Ok(()),
        (0x63, 0xC0) | (0x69, 0x83) => Err(ErrorKind::PinLocked.into()),
        (0x69, 0x84) => Err(ErrorKind::PinExpired.into()),
        (0x67, 0x00) | (0x6A, 0x80) => Err(ErrorKind::PinLenRange.into()),
        _ => match status.retries_left() {
            Some(retries) => Err(ErrorKind::PinIncorrect { retries }.into()),
            None => Err(ErrorKind::Card(status).into()),
        },
    }
}
