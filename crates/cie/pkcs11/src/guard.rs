//! Exclusive access to a reader
//!
//! [`ReaderHandle::transaction`] returns a [`CardTransaction`] holding the
//! reader's in-process lock. [`CardTransaction::run`] then opens the backend
//! transaction, which keeps other processes away from the card, and runs the
//! body against the CIE applet. Both are released when the call returns, on
//! every path.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::backend::{CardBackend, CardConnection};
use crate::card::CieApplet;
use crate::error::{Error, ErrorKind, Result};
use crate::trail;

/// A connection tagged with the slot generation it was opened for
struct Connection {
    generation: u64,
    inner: Box<dyn CardConnection>,
}

/// One reader and its lazily opened card connection
pub struct ReaderHandle {
    name: String,
    backend: Arc<dyn CardBackend>,
    connection: Mutex<Option<Connection>>,
}

impl fmt::Debug for ReaderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ReaderHandle {
    /// Handle on `name` of `backend`
    pub fn new(name: impl Into<String>, backend: Arc<dyn CardBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            connection: Mutex::new(None),
        }
    }

    /// Reader name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the reader, blocking while another thread holds it
    ///
    /// `generation` is the presence generation of the slot: a connection
    /// opened for an earlier card is dropped and a new one is opened.
    pub fn transaction(&self, generation: u64) -> Result<CardTransaction<'_>> {
        let mut connection = self.connection.lock();
        if connection
            .as_ref()
            .is_some_and(|connection| connection.generation != generation)
        {
            debug!(reader = %self.name, "Dropping connection to a previous card");
            *connection = None;
        }
        if connection.is_none() {
            let inner = self.backend.connect(&self.name)?;
            debug!(reader = %self.name, generation, "Connected to card");
            *connection = Some(Connection { generation, inner });
        }
        Ok(CardTransaction {
            reader: &self.name,
            connection,
        })
    }
}

/// The in-process lock on a reader with a live connection
#[must_use = "the reader is released as soon as the transaction is dropped"]
pub struct CardTransaction<'a> {
    reader: &'a str,
    connection: MutexGuard<'a, Option<Connection>>,
}

impl fmt::Debug for CardTransaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardTransaction")
            .field("reader", &self.reader)
            .finish_non_exhaustive()
    }
}

impl CardTransaction<'_> {
    /// Run `body` inside one backend transaction
    ///
    /// When the card turns out to be gone the connection is dropped, so the
    /// next acquisition reconnects.
    pub fn run<R>(mut self, body: impl FnOnce(&mut CieApplet<'_>) -> Result<R>) -> Result<R> {
        let _frame = trail::enter("guard::run");
        let Some(connection) = self.connection.as_mut() else {
            return Err(Error::general("reader transaction without a connection"));
        };

        let mut body = Some(body);
        let mut outcome = None;
        let status = connection.inner.transaction(&mut |transport| {
            if let Some(body) = body.take() {
                let mut applet = CieApplet::new(transport);
                outcome = Some(body(&mut applet));
            }
        });

        let result = match (status, outcome) {
            (Ok(()), Some(result)) => result,
            (Ok(()), None) => Err(Error::general("card transaction body did not run")),
            // the body result wins, it knows what reached the card
            (Err(e), Some(Ok(_))) => Err(e.into()),
            (Err(_), Some(Err(e))) => Err(e),
            (Err(e), None) => Err(e.into()),
        };

        if let Err(e) = &result
            && matches!(e.kind(), ErrorKind::DeviceRemoved | ErrorKind::TokenNotPresent)
        {
            debug!(reader = %self.reader, "Card gone, dropping connection");
            *self.connection = None;
        }
        result
    }
}
