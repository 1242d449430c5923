//! Sessions
//!
//! The parts of a session fixed at open (slot, card generation, object
//! directory) live outside its lock. Login state, the search and the
//! operation contexts sit behind a per-session mutex, so calls on different
//! sessions never contend.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use derive_more::Display;
use parking_lot::{Mutex, MutexGuard};
use pkcs11_sys::*;
use rsa::RsaPublicKey;
use zeroize::Zeroizing;

use crate::crypto::OperationContext;
use crate::error::{ErrorKind, Result};
use crate::mechanism::Operation;
use crate::object::{Attribute, Object, ObjectClass};
use crate::registry::Slot;
use crate::token::Token;

/// Who the session is authenticated as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LoginState {
    /// Not authenticated
    #[display("public")]
    Public,
    /// Authenticated with the PIN
    #[display("user")]
    User,
    /// Authenticated with the PUK
    #[display("security officer")]
    SecurityOfficer,
}

/// Mutable state of a session
pub struct SessionState {
    login: LoginState,
    secret: Option<Zeroizing<Vec<u8>>>,
    search: Option<VecDeque<CK_OBJECT_HANDLE>>,
    operations: HashMap<Operation, OperationContext>,
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("login", &self.login)
            .field("search", &self.search)
            .field("operations", &self.operations)
            .finish_non_exhaustive()
    }
}

impl SessionState {
    /// Current login state
    pub const fn login_state(&self) -> LoginState {
        self.login
    }

    /// Record a successful login, keeping `secret` for re-verification
    pub fn log_in(&mut self, login: LoginState, secret: &[u8]) {
        self.login = login;
        self.secret = Some(Zeroizing::new(secret.to_vec()));
    }

    /// Forget the login and wipe the secret
    pub fn log_out(&mut self) -> Result<()> {
        if self.login == LoginState::Public {
            return Err(ErrorKind::UserNotLoggedIn.into());
        }
        self.login = LoginState::Public;
        self.secret = None;
        Ok(())
    }

    /// Secret of the login `as_`, or [`ErrorKind::UserNotLoggedIn`]
    pub fn secret(&self, as_: LoginState) -> Result<&[u8]> {
        match &self.secret {
            Some(secret) if self.login == as_ => Ok(secret.as_slice()),
            _ => Err(ErrorKind::UserNotLoggedIn.into()),
        }
    }

    /// Replace the kept PIN after a PIN change
    pub fn update_secret(&mut self, secret: &[u8]) {
        if self.login == LoginState::User {
            self.secret = Some(Zeroizing::new(secret.to_vec()));
        }
    }

    /// Start a search over `results`
    pub fn begin_search(&mut self, results: Vec<CK_OBJECT_HANDLE>) -> Result<()> {
        if self.search.is_some() {
            return Err(ErrorKind::SearchAlreadyActive.into());
        }
        self.search = Some(results.into());
        Ok(())
    }

    /// Next `max` results of the active search
    pub fn next_results(&mut self, max: usize) -> Result<Vec<CK_OBJECT_HANDLE>> {
        let search = self
            .search
            .as_mut()
            .ok_or(ErrorKind::OperationNotInitialized)?;
        let take = max.min(search.len());
        Ok(search.drain(..take).collect())
    }

    /// End the active search
    pub fn end_search(&mut self) -> Result<()> {
        self.search
            .take()
            .map(drop)
            .ok_or_else(|| ErrorKind::OperationNotInitialized.into())
    }

    /// Whether a context of `operation` is active
    pub fn is_active(&self, operation: Operation) -> bool {
        self.operations.contains_key(&operation)
    }

    /// Install the context of `operation`
    pub fn begin(&mut self, operation: Operation, context: OperationContext) -> Result<()> {
        if self.is_active(operation) {
            return Err(ErrorKind::OperationActive.into());
        }
        self.operations.insert(operation, context);
        Ok(())
    }

    /// The active context of `operation`
    pub fn context(&mut self, operation: Operation) -> Result<&mut OperationContext> {
        self.operations
            .get_mut(&operation)
            .ok_or_else(|| ErrorKind::OperationNotInitialized.into())
    }

    /// Remove the active context of `operation`, ending it
    pub fn finish(&mut self, operation: Operation) -> Result<OperationContext> {
        self.operations
            .remove(&operation)
            .ok_or_else(|| ErrorKind::OperationNotInitialized.into())
    }

    /// Drop the context of `operation`, if any
    pub fn abort(&mut self, operation: Operation) {
        self.operations.remove(&operation);
    }
}

/// An open session
pub struct Session {
    handle: CK_SESSION_HANDLE,
    slot: Arc<Slot>,
    generation: u64,
    read_write: bool,
    token: Arc<Token>,
    objects: BTreeMap<CK_OBJECT_HANDLE, usize>,
    state: Mutex<SessionState>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("slot", &self.slot.id())
            .field("generation", &self.generation)
            .field("read_write", &self.read_write)
            .field("objects", &self.objects)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Open a session on the card of `generation`, giving each token object
    /// a handle from `next_handle`
    pub fn new(
        handle: CK_SESSION_HANDLE,
        slot: Arc<Slot>,
        generation: u64,
        token: Arc<Token>,
        read_write: bool,
        mut next_handle: impl FnMut() -> Result<CK_OBJECT_HANDLE>,
    ) -> Result<Self> {
        let objects = (0..token.objects().len())
            .map(|index| Ok((next_handle()?, index)))
            .collect::<Result<_>>()?;
        Ok(Self {
            handle,
            slot,
            generation,
            read_write,
            token,
            objects,
            state: Mutex::new(SessionState {
                login: LoginState::Public,
                secret: None,
                search: None,
                operations: HashMap::new(),
            }),
        })
    }

    /// Session handle
    pub const fn handle(&self) -> CK_SESSION_HANDLE {
        self.handle
    }

    /// Slot of the session
    pub const fn slot(&self) -> &Arc<Slot> {
        &self.slot
    }

    /// Card generation the session was opened on
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the card the session was opened on is gone
    pub fn is_stale(&self) -> bool {
        self.slot.generation() != self.generation
    }

    /// Whether the session is read-write
    pub const fn is_read_write(&self) -> bool {
        self.read_write
    }

    /// Token contents the session sees
    pub const fn token(&self) -> &Arc<Token> {
        &self.token
    }

    /// Lock the mutable state
    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }

    /// Object behind `handle`
    pub fn object(&self, handle: CK_OBJECT_HANDLE) -> Result<&Object> {
        self.objects
            .get(&handle)
            .and_then(|index| self.token.objects().get(*index))
            .ok_or_else(|| ErrorKind::ObjectHandleInvalid(handle).into())
    }

    /// Key object behind `handle`
    pub fn key(&self, handle: CK_OBJECT_HANDLE) -> Result<&Object> {
        match self.object(handle) {
            Ok(object) if matches!(object.class(), ObjectClass::PublicKey | ObjectClass::PrivateKey) => {
                Ok(object)
            }
            _ => Err(ErrorKind::KeyHandleInvalid(handle).into()),
        }
    }

    /// RSA public key of the key object behind `handle`
    pub fn public_key(&self, handle: CK_OBJECT_HANDLE) -> Result<RsaPublicKey> {
        self.key(handle)?.rsa_public_key()
    }

    /// Handles of the objects matching `template`
    pub fn find(&self, template: &[Attribute]) -> Vec<CK_OBJECT_HANDLE> {
        self.objects
            .iter()
            .filter(|(_, index)| {
                self.token
                    .objects()
                    .get(**index)
                    .is_some_and(|object| object.matches(template))
            })
            .map(|(handle, _)| *handle)
            .collect()
    }

    /// `CKS_*` state for `C_GetSessionInfo`
    pub fn ck_state(&self) -> CK_STATE {
        match (self.read_write, self.lock().login_state()) {
            (false, LoginState::Public) => CKS_RO_PUBLIC_SESSION,
            (false, LoginState::User) => CKS_RO_USER_FUNCTIONS,
            (false, LoginState::SecurityOfficer) => {
                unreachable!("security officer logins are refused while read-only sessions exist")
            }
            (true, LoginState::Public) => CKS_RW_PUBLIC_SESSION,
            (true, LoginState::User) => CKS_RW_USER_FUNCTIONS,
            (true, LoginState::SecurityOfficer) => CKS_RW_SO_FUNCTIONS,
        }
    }

    /// `CKF_*` flags for `C_GetSessionInfo`
    pub const fn ck_flags(&self) -> CK_FLAGS {
        if self.read_write {
            CKF_SERIAL_SESSION | CKF_RW_SESSION
        } else {
            CKF_SERIAL_SESSION
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanism::Mechanism;

    fn state() -> SessionState {
        SessionState {
            login: LoginState::Public,
            secret: None,
            search: None,
            operations: HashMap::new(),
        }
    }

    #[test]
    fn test_login_state() {
        let mut state = state();
        assert_eq!(state.log_out().unwrap_err().kind(), &ErrorKind::UserNotLoggedIn);
        assert!(state.secret(LoginState::User).is_err());

        state.log_in(LoginState::User, b"12345678");
        assert_eq!(state.secret(LoginState::User).unwrap(), b"12345678");
        assert!(state.secret(LoginState::SecurityOfficer).is_err());
        state.update_secret(b"87654321");
        assert_eq!(state.secret(LoginState::User).unwrap(), b"87654321");

        state.log_out().unwrap();
        assert_eq!(state.login_state(), LoginState::Public);
        assert!(state.secret(LoginState::User).is_err());
    }

    #[test]
    fn test_search() {
        let mut state = state();
        assert_eq!(
            state.next_results(1).unwrap_err().kind(),
            &ErrorKind::OperationNotInitialized
        );
        state.begin_search(vec![1, 2, 3]).unwrap();
        assert_eq!(
            state.begin_search(vec![4]).unwrap_err().kind(),
            &ErrorKind::SearchAlreadyActive
        );
        assert_eq!(state.next_results(2).unwrap(), [1, 2]);
        assert_eq!(state.next_results(2).unwrap(), [3]);
        assert!(state.next_results(2).unwrap().is_empty());
        state.end_search().unwrap();
        assert!(state.end_search().is_err());
    }

    #[test]
    fn test_operations() {
        let mut state = state();
        state
            .begin(Operation::Sign, OperationContext::new(Mechanism::RsaPkcs, 7))
            .unwrap();
        assert_eq!(
            state
                .begin(Operation::Sign, OperationContext::new(Mechanism::RsaPkcs, 7))
                .unwrap_err()
                .kind(),
            &ErrorKind::OperationActive
        );
        // other kinds are independent
        state
            .begin(Operation::Verify, OperationContext::new(Mechanism::RsaPkcs, 8))
            .unwrap();
        assert_eq!(state.context(Operation::Sign).unwrap().key(), 7);
        assert_eq!(state.finish(Operation::Sign).unwrap().key(), 7);
        assert!(state.context(Operation::Sign).is_err());
        state.abort(Operation::Verify);
        assert!(state.finish(Operation::Verify).is_err());
    }
}
