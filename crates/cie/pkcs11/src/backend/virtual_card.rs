//! In-process CIE for development and tests
//!
//! [`VirtualCard`] answers the part of ISO 7816-4/8 the card layer speaks:
//! application and file selection, READ BINARY, PIN and PUK verification,
//! PIN change and unblock, MSE SET, PSO COMPUTE DIGITAL SIGNATURE and PSO
//! DECIPHER (with command chaining), GET CHALLENGE and GET RESPONSE.
//! [`VirtualCardBackend`] puts such cards into named readers that can be
//! plugged and unplugged at runtime.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cie_apdu_core::command::CLA_CHAINING;
use cie_apdu_core::prelude::*;
use iso7816_tlv::ber::{Tlv, Value};
use parking_lot::{Condvar, Mutex};
use rand_v8::RngCore;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::{CardBackend, CardConnection, ReaderStatus};
use crate::card::constants::{self, fid, ins, tags};
use crate::error::{Error, Result};

/// Name of the reader created by [`VirtualCardBackend::with_default_card`]
pub const DEFAULT_READER: &str = "Virtual CIE Reader 00";
/// PIN of a fresh virtual card
pub const DEFAULT_PIN: &[u8; 8] = b"12345678";
/// PUK of a fresh virtual card
pub const DEFAULT_PUK: &[u8; 8] = b"87654321";
/// Serial number stored on a fresh virtual card
pub const DEFAULT_SERIAL: &str = "CA00000AA";

const CERTIFICATE: &[u8] = include_bytes!("../../testdata/virtual-card-cert.der");
const PRIVATE_KEY: &[u8] = include_bytes!("../../testdata/virtual-card-key.der");
const ATR: [u8; 20] = [
    0x3B, 0x8F, 0x80, 0x01, 0x80, 0x31, 0x80, 0x65, 0xB0, 0x85, 0x04, 0x00, 0x11, 0x12, 0x0F,
    0xFF, 0x82, 0x90, 0x00, 0x8B,
];

/// Reference data with its retry counter
struct Secret {
    value: Zeroizing<Vec<u8>>,
    retries: u8,
}

impl Secret {
    fn new(value: &[u8]) -> Self {
        Self {
            value: Zeroizing::new(value.to_vec()),
            retries: constants::PIN_MAX_TRIES,
        }
    }

    const fn blocked(&self) -> bool {
        self.retries == 0
    }

    fn check(&mut self, candidate: &[u8]) -> std::result::Result<(), StatusWord> {
        if self.blocked() {
            return Err(sw::AUTH_METHOD_BLOCKED);
        }
        if candidate.len() != self.value.len() {
            return Err(sw::WRONG_LENGTH);
        }
        if candidate == self.value.as_slice() {
            self.retries = constants::PIN_MAX_TRIES;
            return Ok(());
        }
        self.retries -= 1;
        Err(if self.blocked() {
            sw::AUTH_METHOD_BLOCKED
        } else {
            sw::counter(self.retries)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Environment {
    Sign,
    Decipher,
}

/// A CIE living in memory
pub struct VirtualCard {
    key: RsaPrivateKey,
    certificate: Vec<u8>,
    serial: Vec<u8>,
    pin: Secret,
    puk: Secret,
    pin_expired: bool,

    applet_selected: bool,
    current_file: Option<u16>,
    pin_verified: bool,
    environment: Option<Environment>,
    chain: Option<(u8, Vec<u8>)>,
    pending: Bytes,
    exchanges: usize,
}

impl fmt::Debug for VirtualCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualCard")
            .field("serial", &String::from_utf8_lossy(&self.serial))
            .field("pin_retries", &self.pin.retries)
            .field("applet_selected", &self.applet_selected)
            .field("pin_verified", &self.pin_verified)
            .finish_non_exhaustive()
    }
}

impl VirtualCard {
    /// A card with the bundled test key and certificate and the default
    /// secrets
    pub fn cie() -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs1_der(PRIVATE_KEY)
            .map_err(|e| Error::general(format!("virtual card key: {e}")))?;
        Ok(Self::new(key, CERTIFICATE.to_vec(), DEFAULT_SERIAL))
    }

    /// A card holding `key` and `certificate`
    pub fn new(key: RsaPrivateKey, certificate: Vec<u8>, serial: &str) -> Self {
        Self {
            key,
            certificate,
            serial: serial.as_bytes().to_vec(),
            pin: Secret::new(DEFAULT_PIN),
            puk: Secret::new(DEFAULT_PUK),
            pin_expired: false,
            applet_selected: false,
            current_file: None,
            pin_verified: false,
            environment: None,
            chain: None,
            pending: Bytes::new(),
            exchanges: 0,
        }
    }

    /// Public half of the card key
    pub fn public_key(&self) -> RsaPublicKey {
        self.key.to_public_key()
    }

    /// DER certificate stored on the card
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    /// Remaining PIN tries
    pub const fn pin_retries(&self) -> u8 {
        self.pin.retries
    }

    /// Mark the PIN as expired, a correct VERIFY then answers `69 84`
    pub const fn expire_pin(&mut self) {
        self.pin_expired = true;
    }

    /// Number of APDUs processed so far
    pub const fn exchanges(&self) -> usize {
        self.exchanges
    }

    /// Drop the volatile state, as a warm reset does
    pub fn reset(&mut self) {
        self.applet_selected = false;
        self.current_file = None;
        self.pin_verified = false;
        self.environment = None;
        self.chain = None;
        self.pending = Bytes::new();
    }

    /// Process one command APDU
    pub fn process(&mut self, apdu: &[u8]) -> Response {
        self.exchanges += 1;
        let Ok(command) = Command::from_bytes(apdu) else {
            return Response::status_only(sw::WRONG_LENGTH);
        };
        if command.cla & !CLA_CHAINING != 0x00 {
            return Response::status_only(sw::CLASS_NOT_SUPPORTED);
        }
        if command.ins == ins::GET_RESPONSE {
            return self.get_response(&command);
        }
        self.pending = Bytes::new();

        // a chain interrupted by another instruction is discarded
        let data = match self.chain.take() {
            Some((chained_ins, mut buffer)) if chained_ins == command.ins => {
                buffer.extend_from_slice(command.data());
                buffer
            }
            _ => command.data().to_vec(),
        };
        if command.is_chained() {
            if command.ins != ins::PSO {
                return Response::status_only(sw::CHAINING_NOT_SUPPORTED);
            }
            self.chain = Some((command.ins, data));
            return Response::success(Bytes::new());
        }

        let result = match command.ins {
            ins::SELECT => self.select(&command, &data),
            ins::READ_BINARY => return self.read_binary(&command),
            ins::VERIFY => self.verify(&command, &data),
            ins::CHANGE_REFERENCE_DATA => self.change_pin(&command, &data),
            ins::RESET_RETRY_COUNTER => self.unblock_pin(&command, &data),
            ins::MSE => self.manage_security_environment(&command, &data),
            ins::PSO => self.perform_security_operation(&command, &data),
            ins::GET_CHALLENGE => self.challenge(&command),
            _ => Err(sw::INVALID_INSTRUCTION),
        };

        match result {
            Ok(payload) => self.respond(payload, &command),
            Err(status) => Response::status_only(status),
        }
    }

    /// Send at most Le bytes, keeping the rest for GET RESPONSE
    fn respond(&mut self, payload: Vec<u8>, command: &Command) -> Response {
        let max = expected_length(command);
        if payload.len() <= max {
            return Response::success(payload);
        }
        let mut payload = Bytes::from(payload);
        let rest = payload.split_off(max);
        let status = more_data(rest.len());
        self.pending = rest;
        Response::new(payload, status)
    }

    fn get_response(&mut self, command: &Command) -> Response {
        if self.pending.is_empty() {
            return Response::status_only(sw::CONDITIONS_NOT_SATISFIED);
        }
        let take = expected_length(command).min(self.pending.len());
        let chunk = self.pending.split_to(take);
        if self.pending.is_empty() {
            Response::success(chunk)
        } else {
            Response::new(chunk, more_data(self.pending.len()))
        }
    }

    fn file(&self, id: u16) -> Option<&[u8]> {
        match id {
            fid::CERTIFICATE => Some(&self.certificate),
            fid::SERIAL => Some(&self.serial),
            _ => None,
        }
    }

    fn select(&mut self, command: &Command, data: &[u8]) -> std::result::Result<Vec<u8>, StatusWord> {
        match command.p1 {
            0x04 if data == constants::CIE_AID => {
                self.applet_selected = true;
                self.current_file = None;
                self.pin_verified = false;
                self.environment = None;
                Ok(Vec::new())
            }
            0x04 => Err(sw::FILE_NOT_FOUND),
            0x00 | 0x02 => {
                let [hi, lo] = data else {
                    return Err(sw::WRONG_LENGTH);
                };
                let id = u16::from_be_bytes([*hi, *lo]);
                if id == fid::MASTER_FILE {
                    self.applet_selected = false;
                    self.current_file = None;
                    return Ok(Vec::new());
                }
                if !self.applet_selected || self.file(id).is_none() {
                    return Err(sw::FILE_NOT_FOUND);
                }
                self.current_file = Some(id);
                Ok(Vec::new())
            }
            _ => Err(sw::INCORRECT_P1P2),
        }
    }

    fn read_binary(&mut self, command: &Command) -> Response {
        if command.p1 & 0x80 != 0 {
            return Response::status_only(sw::INCORRECT_P1P2);
        }
        let Some(contents) = self.current_file.and_then(|id| self.file(id)) else {
            return Response::status_only(sw::CONDITIONS_NOT_SATISFIED);
        };
        let offset = usize::from(u16::from_be_bytes([command.p1, command.p2]));
        if offset > contents.len() {
            return Response::status_only(sw::WRONG_OFFSET);
        }
        let wanted = expected_length(command);
        let end = contents.len().min(offset + wanted);
        let chunk = contents[offset..end].to_vec();
        if chunk.len() < wanted {
            Response::new(chunk, sw::END_OF_FILE)
        } else {
            Response::success(chunk)
        }
    }

    fn verify(&mut self, command: &Command, data: &[u8]) -> std::result::Result<Vec<u8>, StatusWord> {
        let is_pin = match (command.p1, command.p2) {
            (0x00, constants::PIN_REFERENCE) => true,
            (0x00, constants::PUK_REFERENCE) => false,
            _ => return Err(sw::REFERENCED_DATA_NOT_FOUND),
        };
        let secret = if is_pin { &mut self.pin } else { &mut self.puk };

        if data.is_empty() {
            return if secret.blocked() {
                Err(sw::AUTH_METHOD_BLOCKED)
            } else if is_pin && self.pin_verified {
                Ok(Vec::new())
            } else {
                Err(sw::counter(secret.retries))
            };
        }

        secret.check(data)?;
        if is_pin {
            if self.pin_expired {
                return Err(sw::REFERENCE_DATA_INVALIDATED);
            }
            self.pin_verified = true;
        }
        Ok(Vec::new())
    }

    fn change_pin(&mut self, command: &Command, data: &[u8]) -> std::result::Result<Vec<u8>, StatusWord> {
        if (command.p1, command.p2) != (0x00, constants::PIN_REFERENCE) {
            return Err(sw::INCORRECT_P1P2);
        }
        if data.len() != 2 * constants::PIN_LENGTH {
            return Err(sw::WRONG_LENGTH);
        }
        let (old, new) = data.split_at(constants::PIN_LENGTH);
        self.pin.check(old)?;
        self.pin.value = Zeroizing::new(new.to_vec());
        self.pin_expired = false;
        self.pin_verified = true;
        info!("Virtual card PIN changed");
        Ok(Vec::new())
    }

    fn unblock_pin(&mut self, command: &Command, data: &[u8]) -> std::result::Result<Vec<u8>, StatusWord> {
        if (command.p1, command.p2) != (0x00, constants::PIN_REFERENCE) {
            return Err(sw::INCORRECT_P1P2);
        }
        if data.len() != 2 * constants::PIN_LENGTH {
            return Err(sw::WRONG_LENGTH);
        }
        let (puk, new) = data.split_at(constants::PIN_LENGTH);
        self.puk.check(puk)?;
        self.pin = Secret::new(new);
        self.pin_expired = false;
        info!("Virtual card PIN unblocked");
        Ok(Vec::new())
    }

    fn manage_security_environment(
        &mut self,
        command: &Command,
        data: &[u8],
    ) -> std::result::Result<Vec<u8>, StatusWord> {
        let environment = match (command.p1, command.p2) {
            (0x41, 0xB6) => Environment::Sign,
            (0x41, 0xB8) => Environment::Decipher,
            _ => return Err(sw::INCORRECT_P1P2),
        };

        let (mut algorithm, mut key) = (None, None);
        let mut rest = data;
        while !rest.is_empty() {
            let (tlv, remaining) = Tlv::parse(rest);
            let tlv = tlv.map_err(|_| sw::INCORRECT_DATA)?;
            let Value::Primitive(value) = tlv.value() else {
                return Err(sw::INCORRECT_DATA);
            };
            let tag = tlv.tag().to_bytes();
            if tag == [tags::ALGORITHM] {
                algorithm = value.first().copied();
            } else if tag == [tags::KEY_REFERENCE] {
                key = value.first().copied();
            }
            rest = remaining;
        }

        if algorithm != Some(constants::ALGORITHM_RSA_PKCS1) || key != Some(constants::KEY_REFERENCE) {
            return Err(sw::INCORRECT_DATA);
        }
        self.environment = Some(environment);
        Ok(Vec::new())
    }

    fn perform_security_operation(
        &mut self,
        command: &Command,
        data: &[u8],
    ) -> std::result::Result<Vec<u8>, StatusWord> {
        let environment = match (command.p1, command.p2) {
            (0x9E, 0x9A) => Environment::Sign,
            (0x80, 0x86) => Environment::Decipher,
            _ => return Err(sw::INCORRECT_P1P2),
        };
        if !self.pin_verified {
            return Err(sw::SECURITY_CONDITION_NOT_SATISFIED);
        }
        if self.environment != Some(environment) {
            return Err(sw::CONDITIONS_NOT_SATISFIED);
        }

        match environment {
            Environment::Sign => self
                .key
                .sign(Pkcs1v15Sign::new_unprefixed(), data)
                .map_err(|_| sw::INCORRECT_DATA),
            Environment::Decipher => {
                let [0x00, ciphertext @ ..] = data else {
                    return Err(sw::INCORRECT_DATA);
                };
                self.key
                    .decrypt(Pkcs1v15Encrypt, ciphertext)
                    .map_err(|_| sw::INCORRECT_DATA)
            }
        }
    }

    fn challenge(&self, command: &Command) -> std::result::Result<Vec<u8>, StatusWord> {
        let Some(le) = command.le.filter(|le| *le > 0) else {
            return Err(sw::WRONG_LENGTH);
        };
        let mut challenge = vec![0u8; usize::from(le)];
        rand_v8::thread_rng().fill_bytes(&mut challenge);
        Ok(challenge)
    }
}

/// Le of a command as a byte count
fn expected_length(command: &Command) -> usize {
    match command.le {
        // only an extended Le parses to 0
        Some(0) => 65536,
        Some(le) => usize::from(le),
        None => 256,
    }
}

fn more_data(remaining: usize) -> StatusWord {
    StatusWord::new(0x61, u8::try_from(remaining).unwrap_or(0))
}

#[derive(Debug, Clone)]
struct Inserted {
    id: u64,
    card: Arc<Mutex<VirtualCard>>,
}

#[derive(Debug)]
struct VirtualReader {
    name: String,
    card: Option<Inserted>,
}

#[derive(Debug, Default)]
struct ReaderTable {
    readers: Vec<VirtualReader>,
    generation: u64,
    cancellations: u64,
    insertions: u64,
}

impl ReaderTable {
    fn reader_mut(&mut self, name: &str) -> Option<&mut VirtualReader> {
        self.readers.iter_mut().find(|r| r.name == name)
    }

    fn is_inserted(&self, reader: &str, id: u64) -> bool {
        self.readers
            .iter()
            .any(|r| r.name == reader && r.card.as_ref().is_some_and(|c| c.id == id))
    }
}

#[derive(Debug, Default)]
struct Shared {
    table: Mutex<ReaderTable>,
    changed: Condvar,
}

impl Shared {
    fn update<R>(&self, f: impl FnOnce(&mut ReaderTable) -> R) -> R {
        let mut table = self.table.lock();
        let result = f(&mut table);
        table.generation += 1;
        self.changed.notify_all();
        result
    }
}

/// Readers holding virtual cards
#[derive(Debug, Clone, Default)]
pub struct VirtualCardBackend {
    shared: Arc<Shared>,
}

impl VirtualCardBackend {
    /// A backend without readers
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend with one reader holding a fresh [`VirtualCard::cie`]
    pub fn with_default_card() -> Result<Self> {
        let backend = Self::new();
        backend.add_reader(DEFAULT_READER);
        backend.insert_card(DEFAULT_READER, VirtualCard::cie()?);
        Ok(backend)
    }

    /// Plug in an empty reader
    pub fn add_reader(&self, name: &str) {
        self.shared.update(|table| {
            table.readers.push(VirtualReader {
                name: name.to_string(),
                card: None,
            });
        });
        debug!(reader = name, "Virtual reader added");
    }

    /// Unplug a reader together with its card
    pub fn remove_reader(&self, name: &str) -> bool {
        self.shared.update(|table| {
            let before = table.readers.len();
            table.readers.retain(|r| r.name != name);
            table.readers.len() != before
        })
    }

    /// Insert `card` into `reader`, replacing any card already there
    pub fn insert_card(&self, reader: &str, card: VirtualCard) -> bool {
        self.shared.update(|table| {
            table.insertions += 1;
            let id = table.insertions;
            match table.reader_mut(reader) {
                Some(slot) => {
                    slot.card = Some(Inserted {
                        id,
                        card: Arc::new(Mutex::new(card)),
                    });
                    true
                }
                None => false,
            }
        })
    }

    /// Pull the card out of `reader`
    pub fn remove_card(&self, reader: &str) -> bool {
        self.shared.update(|table| {
            table
                .reader_mut(reader)
                .and_then(|slot| slot.card.take())
                .is_some()
        })
    }

    /// Run `f` on the card in `reader`
    pub fn with_card<R>(&self, reader: &str, f: impl FnOnce(&mut VirtualCard) -> R) -> Option<R> {
        let card = {
            let mut table = self.shared.table.lock();
            table.reader_mut(reader)?.card.clone()?
        };
        let mut card = card.card.lock();
        Some(f(&mut card))
    }
}

impl CardBackend for VirtualCardBackend {
    fn readers(&self) -> Result<Vec<ReaderStatus>, TransportError> {
        let table = self.shared.table.lock();
        Ok(table
            .readers
            .iter()
            .map(|r| ReaderStatus {
                name: r.name.clone(),
                card_present: r.card.is_some(),
                atr: r.card.as_ref().map(|_| ATR.to_vec()),
            })
            .collect())
    }

    fn connect(&self, reader: &str) -> Result<Box<dyn CardConnection>, TransportError> {
        let mut table = self.shared.table.lock();
        let slot = table.reader_mut(reader).ok_or(TransportError::Connection)?;
        let inserted = slot.card.clone().ok_or(TransportError::NoCard)?;
        Ok(Box::new(VirtualConnection {
            shared: Arc::clone(&self.shared),
            reader: reader.to_string(),
            inserted,
        }))
    }

    fn wait_for_change(&self, timeout: Duration) -> Result<bool, TransportError> {
        let mut table = self.shared.table.lock();
        let (generation, cancellations) = (table.generation, table.cancellations);
        let _ = self.shared.changed.wait_while_for(
            &mut table,
            |t| t.generation == generation && t.cancellations == cancellations,
            timeout,
        );
        if table.cancellations != cancellations {
            return Err(TransportError::Cancelled);
        }
        Ok(table.generation != generation)
    }

    fn cancel_wait(&self) {
        let mut table = self.shared.table.lock();
        table.cancellations += 1;
        self.shared.changed.notify_all();
    }

    fn manufacturer(&self) -> &str {
        "CIE Middleware"
    }
}

#[derive(Debug)]
struct VirtualConnection {
    shared: Arc<Shared>,
    reader: String,
    inserted: Inserted,
}

impl CardConnection for VirtualConnection {
    fn transaction(
        &mut self,
        body: &mut dyn FnMut(&mut dyn CardTransport),
    ) -> Result<(), TransportError> {
        let card = Arc::clone(&self.inserted.card);
        let mut card = card.lock();
        let mut transport = VirtualTransport {
            shared: &self.shared,
            reader: &self.reader,
            id: self.inserted.id,
            card: &mut card,
        };
        if !transport.is_connected() {
            return Err(TransportError::CardRemoved);
        }
        body(&mut transport);
        Ok(())
    }
}

#[derive(Debug)]
struct VirtualTransport<'a> {
    shared: &'a Shared,
    reader: &'a str,
    id: u64,
    card: &'a mut VirtualCard,
}

impl CardTransport for VirtualTransport<'_> {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::CardRemoved);
        }
        Ok(self.card.process(command).to_bytes())
    }

    fn is_connected(&self) -> bool {
        self.shared.table.lock().is_inserted(self.reader, self.id)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.card.reset();
        Ok(())
    }
}
