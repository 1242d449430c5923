//! The provider engine
//!
//! [`Provider`] is the state `C_Initialize` creates and `C_Finalize` drops.
//! Its methods are the Cryptoki operations with Rust types: owned buffers in,
//! owned buffers out. The two-phase buffer convention lives in the ABI layer,
//! which uses the `*_len` methods to answer length probes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use cie_apdu_core::TransportError;
use parking_lot::RwLock;
use pkcs11_sys::*;
use rsa::traits::PublicKeyParts;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::backend::{self, CardBackend};
use crate::card::constants::{PIN_LENGTH, PIN_MAX_TRIES};
use crate::card::{CieApplet, PinStatus};
use crate::config::ProviderConfig;
use crate::crypto::{self, OperationContext};
use crate::error::{Error, ErrorKind, Result};
use crate::mechanism::{Mechanism, MechanismInfo, Operation};
use crate::object::{Attribute, AttributeValue};
use crate::registry::Registry;
use crate::session::{LoginState, Session, SessionState};
use crate::token;
use crate::trail;

/// Manufacturer of the library
pub const MANUFACTURER: &str = "CIE Middleware";
/// Description of the library
pub const LIBRARY_DESCRIPTION: &str = "CIE PKCS#11 provider";

/// What `C_GetSlotInfo` reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    /// Reader name
    pub description: String,
    /// Backend manufacturer
    pub manufacturer: String,
    /// Whether a card sits in the reader
    pub token_present: bool,
}

/// What `C_GetTokenInfo` reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    /// Token label
    pub label: String,
    /// Token manufacturer
    pub manufacturer: String,
    /// Token model
    pub model: String,
    /// Card serial number
    pub serial: String,
    /// `CKF_*` flags
    pub flags: CK_FLAGS,
    /// Open sessions on the token
    pub session_count: usize,
    /// Open read-write sessions on the token
    pub rw_session_count: usize,
    /// PIN length bounds
    pub pin_len: (usize, usize),
}

/// What `C_GetSessionInfo` reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    /// Slot of the session
    pub slot: CK_SLOT_ID,
    /// `CKS_*` state
    pub state: CK_STATE,
    /// `CKF_*` flags
    pub flags: CK_FLAGS,
}

/// Provider state between initialize and finalize
#[derive(Debug)]
pub struct Provider {
    config: ProviderConfig,
    registry: Registry,
    sessions: RwLock<HashMap<CK_SESSION_HANDLE, Arc<Session>>>,
    next_session: AtomicU64,
    next_object: AtomicU64,
    shutdown: AtomicBool,
}

fn next_handle(counter: &AtomicU64) -> Result<CK_ULONG> {
    CK_ULONG::try_from(counter.fetch_add(1, Ordering::Relaxed))
        .map_err(|_| Error::general("handle space exhausted"))
}

fn check_pin_len(pin: &[u8]) -> Result<()> {
    if pin.len() == PIN_LENGTH {
        Ok(())
    } else {
        Err(ErrorKind::PinLenRange.into())
    }
}

impl Provider {
    /// Create the provider with the backend `config` selects
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let backend = backend::from_config(&config)?;
        Self::with_backend(config, backend)
    }

    /// Create the provider on `backend`
    pub fn with_backend(config: ProviderConfig, backend: Arc<dyn CardBackend>) -> Result<Self> {
        let registry = Registry::new(backend, config.reader_filter.clone())?;
        info!(backend = ?config.backend, "Provider initialized");
        Ok(Self {
            config,
            registry,
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            next_object: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        })
    }

    /// The configuration in use
    pub const fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Manufacturer string of the card backend
    pub fn backend_manufacturer(&self) -> &str {
        self.registry.backend().manufacturer()
    }

    fn session(&self, handle: CK_SESSION_HANDLE) -> Result<Arc<Session>> {
        let session = self
            .sessions
            .read()
            .get(&handle)
            .cloned()
            .ok_or(ErrorKind::SessionHandleInvalid(handle))?;
        if session.is_stale() {
            self.sessions.write().remove(&handle);
            info!(session = handle, "Closed session of a removed card");
            return Err(ErrorKind::DeviceRemoved.into());
        }
        Ok(session)
    }

    /// Run `body` on the card of `session`, with the application selected
    fn card<R>(&self, session: &Session, body: impl FnOnce(&mut CieApplet<'_>) -> Result<R>) -> Result<R> {
        session.slot().run(session.generation(), |applet| {
            applet.select_application()?;
            body(applet)
        })
    }

    // slots and tokens

    /// Re-read the reader list
    pub fn update_slot_list(&self) -> Result<()> {
        self.registry.refresh()
    }

    /// Slot ids as of the last reader list update
    pub fn slot_list(&self, present_only: bool) -> Vec<CK_SLOT_ID> {
        self.registry.slot_ids(present_only)
    }

    /// Describe a slot
    pub fn slot_info(&self, slot_id: CK_SLOT_ID) -> Result<SlotInfo> {
        self.registry.refresh()?;
        let slot = self.registry.slot(slot_id)?;
        Ok(SlotInfo {
            description: slot.reader_name().to_string(),
            manufacturer: self.backend_manufacturer().to_string(),
            token_present: slot.is_present(),
        })
    }

    /// Describe the token in a slot
    pub fn token_info(&self, slot_id: CK_SLOT_ID) -> Result<TokenInfo> {
        let _frame = trail::enter("provider::token_info");
        self.registry.refresh()?;
        let slot = self.registry.slot(slot_id)?;
        let token = slot.token()?;
        let generation = slot.present_generation()?;

        let mut flags = CKF_TOKEN_INITIALIZED | CKF_LOGIN_REQUIRED | CKF_USER_PIN_INITIALIZED | CKF_RNG;
        let pin_status = slot.run(generation, |applet| {
            applet.select_application()?;
            applet.pin_status()
        });
        match pin_status {
            Ok(PinStatus::Verified) => {}
            Ok(PinStatus::Retries(retries)) => {
                if retries < PIN_MAX_TRIES {
                    flags |= CKF_USER_PIN_COUNT_LOW;
                }
                if retries == 1 {
                    flags |= CKF_USER_PIN_FINAL_TRY;
                }
            }
            Ok(PinStatus::Blocked) => flags |= CKF_USER_PIN_LOCKED,
            Err(e) if matches!(e.kind(), ErrorKind::DeviceRemoved | ErrorKind::TokenNotPresent) => {
                return Err(e);
            }
            Err(e) => warn!(slot = slot_id, error = %e, "Could not read the PIN counter"),
        }

        let (session_count, rw_session_count) = self
            .sessions
            .read()
            .values()
            .filter(|session| session.slot().id() == slot_id && !session.is_stale())
            .fold((0, 0), |(all, rw), session| {
                (all + 1, rw + usize::from(session.is_read_write()))
            });

        Ok(TokenInfo {
            label: token.label(),
            manufacturer: token::MANUFACTURER.to_string(),
            model: token::MODEL.to_string(),
            serial: token.serial().to_string(),
            flags,
            session_count,
            rw_session_count,
            pin_len: (PIN_LENGTH, PIN_LENGTH),
        })
    }

    /// Mechanisms of the token in a slot
    pub fn mechanism_list(&self, slot_id: CK_SLOT_ID) -> Result<Vec<CK_MECHANISM_TYPE>> {
        self.registry.slot(slot_id)?;
        Ok(Mechanism::ALL.iter().map(|mechanism| mechanism.ck()).collect())
    }

    /// Describe one mechanism
    pub fn mechanism_info(&self, slot_id: CK_SLOT_ID, mechanism: CK_MECHANISM_TYPE) -> Result<MechanismInfo> {
        self.registry.slot(slot_id)?;
        Ok(Mechanism::from_ck(mechanism)?.info())
    }

    /// Wait for a slot event
    ///
    /// A pending event is returned first. Without one, a non-blocking call
    /// fails with [`ErrorKind::NoEvent`] and a blocking one polls the backend
    /// until something changes or the provider shuts down.
    pub fn wait_for_slot_event(&self, blocking: bool) -> Result<CK_SLOT_ID> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(ErrorKind::NotInitialized.into());
            }
            if let Some(slot) = self.registry.next_event()? {
                debug!(slot, "Slot event");
                return Ok(slot);
            }
            if !blocking {
                return Err(ErrorKind::NoEvent.into());
            }
            match self
                .registry
                .backend()
                .wait_for_change(self.config.slot_poll_interval())
            {
                Ok(_) | Err(TransportError::Timeout) => {}
                Err(TransportError::Cancelled) => return Err(ErrorKind::NotInitialized.into()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Stop slot event waits and close every session
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.registry.backend().cancel_wait();
        let closed = {
            let mut sessions = self.sessions.write();
            let closed = sessions.len();
            sessions.clear();
            closed
        };
        info!(closed_sessions = closed, "Provider finalized");
    }

    // sessions

    /// Open a session on the token in a slot
    pub fn open_session(&self, slot_id: CK_SLOT_ID, flags: CK_FLAGS) -> Result<CK_SESSION_HANDLE> {
        let _frame = trail::enter("provider::open_session");
        if flags & CKF_SERIAL_SESSION == 0 {
            return Err(ErrorKind::SessionParallelNotSupported.into());
        }
        self.registry.refresh()?;
        let slot = self.registry.slot(slot_id)?;
        let token = slot.token()?;
        let generation = slot.present_generation()?;

        let handle = next_handle(&self.next_session)?;
        let read_write = flags & CKF_RW_SESSION != 0;
        let session = Session::new(handle, slot, generation, token, read_write, || {
            next_handle(&self.next_object)
        })?;
        self.sessions.write().insert(handle, Arc::new(session));
        info!(session = handle, slot = slot_id, read_write, "Opened session");
        Ok(handle)
    }

    /// Close a session
    pub fn close_session(&self, handle: CK_SESSION_HANDLE) -> Result<()> {
        self.sessions
            .write()
            .remove(&handle)
            .ok_or(ErrorKind::SessionHandleInvalid(handle))?;
        info!(session = handle, "Closed session");
        Ok(())
    }

    /// Close every session of a slot
    pub fn close_all_sessions(&self, slot_id: CK_SLOT_ID) -> Result<()> {
        self.registry.slot(slot_id)?;
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, session| session.slot().id() != slot_id);
        info!(slot = slot_id, closed = before - sessions.len(), "Closed all sessions");
        Ok(())
    }

    /// Describe a session
    pub fn session_info(&self, handle: CK_SESSION_HANDLE) -> Result<SessionInfo> {
        let session = self.session(handle)?;
        Ok(SessionInfo {
            slot: session.slot().id(),
            state: session.ck_state(),
            flags: session.ck_flags(),
        })
    }

    /// Log in as `user_type`, verifying the PIN (or the PUK for the
    /// security officer) on the card
    pub fn login(&self, handle: CK_SESSION_HANDLE, user_type: CK_USER_TYPE, pin: &[u8]) -> Result<()> {
        let _frame = trail::enter("provider::login");
        let session = self.session(handle)?;
        let login = match user_type {
            CKU_USER => LoginState::User,
            CKU_SO => LoginState::SecurityOfficer,
            other => return Err(ErrorKind::UserTypeInvalid(other).into()),
        };
        if login == LoginState::SecurityOfficer && self.read_only_session_on(session.slot().id()) {
            return Err(ErrorKind::SessionReadOnlyExists.into());
        }
        let mut state = session.lock();
        if state.login_state() != LoginState::Public {
            return Err(ErrorKind::UserAlreadyLoggedIn.into());
        }
        check_pin_len(pin)?;

        self.card(&session, |applet| match login {
            LoginState::SecurityOfficer => applet.verify_puk(pin),
            _ => applet.verify_pin(pin),
        })?;
        state.log_in(login, pin);
        info!(session = handle, user = %login, "Logged in");
        Ok(())
    }

    fn read_only_session_on(&self, slot_id: CK_SLOT_ID) -> bool {
        self.sessions
            .read()
            .values()
            .any(|session| session.slot().id() == slot_id && !session.is_read_write())
    }

    /// Log out
    pub fn logout(&self, handle: CK_SESSION_HANDLE) -> Result<()> {
        let session = self.session(handle)?;
        session.lock().log_out()?;
        info!(session = handle, "Logged out");
        Ok(())
    }

    /// Change the PIN
    pub fn set_pin(&self, handle: CK_SESSION_HANDLE, old: &[u8], new: &[u8]) -> Result<()> {
        let _frame = trail::enter("provider::set_pin");
        let session = self.session(handle)?;
        if !session.is_read_write() {
            return Err(ErrorKind::SessionReadOnly.into());
        }
        let mut state = session.lock();
        if state.login_state() == LoginState::SecurityOfficer {
            return Err(Error::new(ErrorKind::FunctionNotSupported).with_context("the PUK cannot be changed"));
        }
        check_pin_len(old)?;
        check_pin_len(new)?;

        self.card(&session, |applet| applet.change_pin(old, new))?;
        state.update_secret(new);
        info!(session = handle, "PIN changed");
        Ok(())
    }

    /// Set a new PIN with the PUK of the security officer login, unblocking it
    pub fn init_pin(&self, handle: CK_SESSION_HANDLE, new: &[u8]) -> Result<()> {
        let _frame = trail::enter("provider::init_pin");
        let session = self.session(handle)?;
        if !session.is_read_write() {
            return Err(ErrorKind::SessionReadOnly.into());
        }
        let state = session.lock();
        let puk = state.secret(LoginState::SecurityOfficer)?;
        check_pin_len(new)?;

        self.card(&session, |applet| applet.unblock_pin(puk, new))?;
        info!(session = handle, "PIN unblocked");
        Ok(())
    }

    /// Random bytes from the card
    pub fn generate_random(&self, handle: CK_SESSION_HANDLE, len: usize) -> Result<Vec<u8>> {
        let session = self.session(handle)?;
        let _state = session.lock();
        self.card(&session, |applet| applet.challenge(len))
    }

    // objects

    /// Start a search for the objects matching `template`
    pub fn find_init(&self, handle: CK_SESSION_HANDLE, template: &[Attribute]) -> Result<()> {
        let session = self.session(handle)?;
        let mut state = session.lock();
        let results = session.find(template);
        debug!(session = handle, matches = results.len(), "Search started");
        state.begin_search(results)
    }

    /// Next results of the search
    pub fn find_next(&self, handle: CK_SESSION_HANDLE, max: usize) -> Result<Vec<CK_OBJECT_HANDLE>> {
        self.session(handle)?.lock().next_results(max)
    }

    /// End the search
    pub fn find_final(&self, handle: CK_SESSION_HANDLE) -> Result<()> {
        self.session(handle)?.lock().end_search()
    }

    /// Values of the attributes `kinds` of an object
    pub fn attribute_values(
        &self,
        handle: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        kinds: &[CK_ATTRIBUTE_TYPE],
    ) -> Result<Vec<AttributeValue>> {
        let session = self.session(handle)?;
        let object = session.object(object)?;
        Ok(kinds.iter().map(|kind| object.read(*kind)).collect())
    }

    // crypto operations

    /// Start `operation`, or abort the active one when `mechanism` is `None`
    pub fn operation_init(
        &self,
        handle: CK_SESSION_HANDLE,
        operation: Operation,
        mechanism: Option<CK_MECHANISM_TYPE>,
        key: CK_OBJECT_HANDLE,
    ) -> Result<()> {
        let session = self.session(handle)?;
        let mut state = session.lock();
        let Some(mechanism) = mechanism else {
            state.abort(operation);
            debug!(session = handle, %operation, "Operation aborted");
            return Ok(());
        };
        if state.is_active(operation) {
            return Err(ErrorKind::OperationActive.into());
        }

        let mechanism = Mechanism::from_ck(mechanism)?;
        if !mechanism.supports(operation) {
            return Err(ErrorKind::MechanismInvalid(mechanism.ck()).into());
        }
        let object = session.key(key)?;
        object.require(operation.capability())?;
        if object.is_private() && state.login_state() != LoginState::User {
            return Err(ErrorKind::UserNotLoggedIn.into());
        }

        state.begin(operation, OperationContext::new(mechanism, key))?;
        debug!(session = handle, %operation, %mechanism, key, "Operation initialized");
        Ok(())
    }

    /// Run `f` on the context of `operation`, ending it on failure
    fn step<R>(
        &self,
        handle: CK_SESSION_HANDLE,
        operation: Operation,
        f: impl FnOnce(&Session, &mut SessionState) -> Result<R>,
    ) -> Result<R> {
        let session = self.session(handle)?;
        let mut state = session.lock();
        if !state.is_active(operation) {
            return Err(ErrorKind::OperationNotInitialized.into());
        }
        let result = f(&*session, &mut *state);
        if result.is_err() {
            state.abort(operation);
        }
        result
    }

    /// Length of the signature the active sign operation produces
    pub fn sign_len(&self, handle: CK_SESSION_HANDLE) -> Result<usize> {
        self.step(handle, Operation::Sign, |session, state| {
            let key = state.context(Operation::Sign)?.key();
            Ok(session.public_key(key)?.size())
        })
    }

    /// Sign `data` in one part
    pub fn sign(&self, handle: CK_SESSION_HANDLE, data: &[u8]) -> Result<Vec<u8>> {
        self.sign_with(handle, Some(data))
    }

    /// Feed a part to a multi-part signature
    pub fn sign_update(&self, handle: CK_SESSION_HANDLE, part: &[u8]) -> Result<()> {
        self.step(handle, Operation::Sign, |_, state| {
            state.context(Operation::Sign)?.update(part)
        })
    }

    /// Finish a multi-part signature
    pub fn sign_final(&self, handle: CK_SESSION_HANDLE) -> Result<Vec<u8>> {
        self.sign_with(handle, None)
    }

    fn sign_with(&self, handle: CK_SESSION_HANDLE, data: Option<&[u8]>) -> Result<Vec<u8>> {
        let _frame = trail::enter("provider::sign");
        self.step(handle, Operation::Sign, |session, state| {
            let mut context = state.finish(Operation::Sign)?;
            let public_key = session.public_key(context.key())?;
            let digest_info = context.digest_info(data, &public_key)?;
            let pin = state.secret(LoginState::User)?;
            let signature = self.card(session, |applet| {
                applet.verify_pin(pin)?;
                applet.sign(&digest_info)
            })?;
            debug!(session = handle, mechanism = %context.mechanism(), len = signature.len(), "Signed");
            Ok(signature)
        })
    }

    /// Verify `signature` over `data` in one part
    pub fn verify(&self, handle: CK_SESSION_HANDLE, data: &[u8], signature: &[u8]) -> Result<()> {
        self.verify_with(handle, Some(data), signature)
    }

    /// Feed a part to a multi-part verification
    pub fn verify_update(&self, handle: CK_SESSION_HANDLE, part: &[u8]) -> Result<()> {
        self.step(handle, Operation::Verify, |_, state| {
            state.context(Operation::Verify)?.update(part)
        })
    }

    /// Finish a multi-part verification
    pub fn verify_final(&self, handle: CK_SESSION_HANDLE, signature: &[u8]) -> Result<()> {
        self.verify_with(handle, None, signature)
    }

    fn verify_with(&self, handle: CK_SESSION_HANDLE, data: Option<&[u8]>, signature: &[u8]) -> Result<()> {
        self.step(handle, Operation::Verify, |session, state| {
            let mut context = state.finish(Operation::Verify)?;
            let public_key = session.public_key(context.key())?;
            let digest_info = context.digest_info(data, &public_key)?;
            crypto::verify(&public_key, &digest_info, signature)
        })
    }

    /// Length of the cryptogram for `data`
    pub fn encrypt_len(&self, handle: CK_SESSION_HANDLE, data: &[u8]) -> Result<usize> {
        self.step(handle, Operation::Encrypt, |session, state| {
            let public_key = session.public_key(state.context(Operation::Encrypt)?.key())?;
            crypto::check_plaintext(&public_key, data)?;
            Ok(public_key.size())
        })
    }

    /// Encrypt `data`
    pub fn encrypt(&self, handle: CK_SESSION_HANDLE, data: &[u8]) -> Result<Vec<u8>> {
        self.step(handle, Operation::Encrypt, |session, state| {
            let context = state.finish(Operation::Encrypt)?;
            crypto::encrypt(&session.public_key(context.key())?, data)
        })
    }

    /// Decipher `ciphertext` on the card and keep the plaintext, returning
    /// its length
    pub fn decrypt_len(&self, handle: CK_SESSION_HANDLE, ciphertext: &[u8]) -> Result<usize> {
        self.step(handle, Operation::Decrypt, |session, state| {
            self.decipher(session, state, ciphertext)
        })
    }

    /// Plaintext of `ciphertext`, from the probe cache when it saw the same
    /// cryptogram
    pub fn decrypt(&self, handle: CK_SESSION_HANDLE, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.step(handle, Operation::Decrypt, |session, state| {
            self.decipher(session, state, ciphertext)?;
            state
                .finish(Operation::Decrypt)?
                .take_plaintext(ciphertext)
                .ok_or_else(|| Error::general("deciphered plaintext went missing"))
        })
    }

    fn decipher(&self, session: &Session, state: &mut SessionState, ciphertext: &[u8]) -> Result<usize> {
        let _frame = trail::enter("provider::decipher");
        if let Some(plaintext) = state.context(Operation::Decrypt)?.cached_plaintext(ciphertext) {
            return Ok(plaintext.len());
        }
        let key = state.context(Operation::Decrypt)?.key();
        crypto::check_ciphertext(&session.public_key(key)?, ciphertext)?;

        let pin = Zeroizing::new(state.secret(LoginState::User)?.to_vec());
        let plaintext = self.card(session, |applet| {
            applet.verify_pin(&pin)?;
            applet.decipher(ciphertext)
        })?;
        let len = plaintext.len();
        state
            .context(Operation::Decrypt)?
            .cache_plaintext(ciphertext, plaintext);
        debug!(session = session.handle(), len, "Deciphered");
        Ok(len)
    }
}
