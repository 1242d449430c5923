//! Slots and token presence
//!
//! Every reader the backend reports becomes a slot, numbered in discovery
//! order. Slots are never removed: a reader that goes away is reported as an
//! empty slot and gets its id back when it returns. Each presence change bumps
//! the slot generation, which invalidates sessions and cached token contents
//! of the previous card, and queues a slot event.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use pkcs11_sys::CK_SLOT_ID;
use tracing::{debug, info};

use crate::backend::{CardBackend, ReaderStatus};
use crate::card::CieApplet;
use crate::error::{ErrorKind, Result};
use crate::guard::{CardTransaction, ReaderHandle};
use crate::token::Token;
use crate::trail;

#[derive(Debug, Default)]
struct SlotState {
    present: bool,
    atr: Option<Vec<u8>>,
    generation: u64,
    token: Option<Arc<Token>>,
    // the card went away during an operation, report it on the next refresh
    lost: bool,
}

/// A reader seen by the provider
pub struct Slot {
    id: CK_SLOT_ID,
    reader: ReaderHandle,
    state: Mutex<SlotState>,
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("reader", &self.reader.name())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Slot {
    /// Slot id
    pub const fn id(&self) -> CK_SLOT_ID {
        self.id
    }

    /// Name of the reader behind the slot
    pub fn reader_name(&self) -> &str {
        self.reader.name()
    }

    /// Whether a card sits in the reader
    pub fn is_present(&self) -> bool {
        self.state.lock().present
    }

    /// ATR of the present card
    pub fn atr(&self) -> Option<Vec<u8>> {
        self.state.lock().atr.clone()
    }

    /// Presence generation, bumped on every insertion and removal
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Generation of the present card, or [`ErrorKind::TokenNotPresent`]
    pub fn present_generation(&self) -> Result<u64> {
        let state = self.state.lock();
        if state.present {
            Ok(state.generation)
        } else {
            Err(ErrorKind::TokenNotPresent.into())
        }
    }

    fn transaction(&self, generation: u64) -> Result<CardTransaction<'_>> {
        if self.generation() != generation {
            return Err(ErrorKind::DeviceRemoved.into());
        }
        self.reader.transaction(generation)
    }

    /// Run `body` in a card transaction on the card of `generation`
    ///
    /// A card found missing invalidates the generation, so sessions and the
    /// cached token of that card are dropped even if an identical card is
    /// back before the next refresh.
    pub fn run<R>(
        &self,
        generation: u64,
        body: impl FnOnce(&mut CieApplet<'_>) -> Result<R>,
    ) -> Result<R> {
        let result = self.transaction(generation).and_then(|transaction| transaction.run(body));
        if let Err(e) = &result
            && matches!(e.kind(), ErrorKind::DeviceRemoved | ErrorKind::TokenNotPresent)
        {
            let mut state = self.state.lock();
            if state.generation == generation {
                state.generation += 1;
                state.token = None;
                state.lost = true;
                info!(slot = self.id, "Card lost during an operation");
            }
        }
        result
    }

    /// Token contents of the present card, read on first use
    pub fn token(&self) -> Result<Arc<Token>> {
        let _frame = trail::enter("slot::token");
        let generation = {
            let state = self.state.lock();
            if !state.present {
                return Err(ErrorKind::TokenNotPresent.into());
            }
            if let Some(token) = &state.token {
                return Ok(token.clone());
            }
            state.generation
        };

        let token = Arc::new(self.run(generation, Token::read)?);

        let mut state = self.state.lock();
        if state.generation != generation {
            return Err(ErrorKind::DeviceRemoved.into());
        }
        Ok(state.token.get_or_insert(token).clone())
    }

    /// Apply a reader snapshot, returning whether presence changed
    fn update(&self, status: Option<&ReaderStatus>) -> bool {
        let present = status.is_some_and(|status| status.card_present);
        let atr = status.and_then(|status| status.atr.clone()).filter(|_| present);

        let mut state = self.state.lock();
        // a different ATR means the card was swapped between two polls
        let swapped = present
            && state.present
            && atr.is_some()
            && state.atr.is_some()
            && atr != state.atr;
        let lost = std::mem::take(&mut state.lost);
        if state.present == present && !swapped {
            return lost;
        }
        info!(
            slot = self.id,
            reader = %self.reader.name(),
            present,
            atr = %atr.as_deref().map(hex::encode).unwrap_or_default(),
            generation = state.generation + 1,
            "Slot presence changed"
        );
        state.present = present;
        state.atr = atr;
        state.generation += 1;
        state.token = None;
        true
    }
}

#[derive(Debug, Default)]
struct Inner {
    slots: Vec<Arc<Slot>>,
    events: VecDeque<CK_SLOT_ID>,
}

/// The slots of the provider
pub struct Registry {
    backend: Arc<dyn CardBackend>,
    filter: Option<String>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("backend", &self.backend)
            .field("filter", &self.filter)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl Registry {
    /// Discover the readers of `backend`
    ///
    /// Cards already present at discovery do not produce slot events.
    pub fn new(backend: Arc<dyn CardBackend>, filter: Option<String>) -> Result<Self> {
        let registry = Self {
            backend,
            filter,
            inner: Mutex::new(Inner::default()),
        };
        registry.refresh()?;
        let mut inner = registry.inner.lock();
        inner.events.clear();
        info!(slots = inner.slots.len(), "Discovered readers");
        drop(inner);
        Ok(registry)
    }

    /// The backend the slots live on
    pub fn backend(&self) -> &Arc<dyn CardBackend> {
        &self.backend
    }

    fn accepts(&self, reader: &str) -> bool {
        self.filter
            .as_deref()
            .is_none_or(|filter| reader.contains(filter))
    }

    /// Re-read the readers, recording presence changes as slot events
    pub fn refresh(&self) -> Result<()> {
        let readers: Vec<ReaderStatus> = self
            .backend
            .readers()?
            .into_iter()
            .filter(|reader| self.accepts(&reader.name))
            .collect();

        let mut inner = self.inner.lock();
        for reader in &readers {
            if !inner.slots.iter().any(|slot| slot.reader.name() == reader.name) {
                let id = CK_SLOT_ID::try_from(inner.slots.len())?;
                debug!(slot = id, reader = %reader.name, "New reader");
                inner.slots.push(Arc::new(Slot {
                    id,
                    reader: ReaderHandle::new(reader.name.clone(), self.backend.clone()),
                    state: Mutex::new(SlotState::default()),
                }));
            }
        }

        let changed: Vec<CK_SLOT_ID> = inner
            .slots
            .iter()
            .filter(|slot| {
                let status = readers.iter().find(|reader| reader.name == slot.reader.name());
                slot.update(status)
            })
            .map(|slot| slot.id)
            .collect();
        for id in changed {
            if !inner.events.contains(&id) {
                inner.events.push_back(id);
            }
        }
        Ok(())
    }

    /// Refresh, then take the oldest unconsumed slot event
    pub fn next_event(&self) -> Result<Option<CK_SLOT_ID>> {
        self.refresh()?;
        Ok(self.inner.lock().events.pop_front())
    }

    /// Slot ids, optionally only those with a card
    pub fn slot_ids(&self, present_only: bool) -> Vec<CK_SLOT_ID> {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|slot| !present_only || slot.is_present())
            .map(|slot| slot.id)
            .collect()
    }

    /// Look up a slot
    pub fn slot(&self, id: CK_SLOT_ID) -> Result<Arc<Slot>> {
        let inner = self.inner.lock();
        usize::try_from(id)
            .ok()
            .and_then(|index| inner.slots.get(index))
            .cloned()
            .ok_or_else(|| ErrorKind::SlotIdInvalid(id).into())
    }
}

#[cfg(all(test, feature = "virtual-card"))]
mod tests {
    use super::*;
    use crate::backend::virtual_card::{DEFAULT_READER, DEFAULT_SERIAL};
    use crate::backend::{VirtualCard, VirtualCardBackend};

    fn registry() -> (VirtualCardBackend, Registry) {
        let backend = VirtualCardBackend::with_default_card().unwrap();
        let registry = Registry::new(Arc::new(backend.clone()), None).unwrap();
        (backend, registry)
    }

    #[test]
    fn test_discovery() {
        let (_, registry) = registry();
        assert_eq!(registry.slot_ids(false), [0]);
        assert_eq!(registry.slot_ids(true), [0]);
        assert_eq!(registry.next_event().unwrap(), None);

        let slot = registry.slot(0).unwrap();
        assert_eq!(slot.reader_name(), DEFAULT_READER);
        assert!(slot.is_present());
        assert!(slot.atr().is_some());
        assert_eq!(
            registry.slot(7).unwrap_err().kind(),
            &ErrorKind::SlotIdInvalid(7)
        );
    }

    #[test]
    fn test_presence_events() {
        let (backend, registry) = registry();
        let slot = registry.slot(0).unwrap();
        let generation = slot.generation();

        backend.remove_card(DEFAULT_READER);
        assert_eq!(registry.next_event().unwrap(), Some(0));
        assert_eq!(registry.next_event().unwrap(), None);
        assert!(!slot.is_present());
        assert!(slot.generation() > generation);
        assert_eq!(registry.slot_ids(true), Vec::<CK_SLOT_ID>::new());
        assert_eq!(slot.token().unwrap_err().kind(), &ErrorKind::TokenNotPresent);

        backend.insert_card(DEFAULT_READER, VirtualCard::cie().unwrap());
        assert_eq!(registry.next_event().unwrap(), Some(0));
        assert_eq!(slot.token().unwrap().serial(), DEFAULT_SERIAL);
    }

    #[test]
    fn test_reader_keeps_its_id() {
        let (backend, registry) = registry();
        backend.add_reader("Other Reader");
        registry.refresh().unwrap();
        assert_eq!(registry.slot_ids(false), [0, 1]);
        // an empty reader appearing is not a presence change
        assert_eq!(registry.next_event().unwrap(), None);

        backend.remove_reader(DEFAULT_READER);
        assert_eq!(registry.next_event().unwrap(), Some(0));
        assert_eq!(registry.slot_ids(false), [0, 1]);
        assert!(!registry.slot(0).unwrap().is_present());

        backend.add_reader(DEFAULT_READER);
        backend.insert_card(DEFAULT_READER, VirtualCard::cie().unwrap());
        assert_eq!(registry.next_event().unwrap(), Some(0));
        assert_eq!(registry.slot(0).unwrap().reader_name(), DEFAULT_READER);
    }

    #[test]
    fn test_reader_filter() {
        let backend = VirtualCardBackend::with_default_card().unwrap();
        backend.add_reader("Other Reader");
        let registry = Registry::new(Arc::new(backend), Some("Other".into())).unwrap();
        assert_eq!(registry.slot_ids(false), [0]);
        assert_eq!(registry.slot(0).unwrap().reader_name(), "Other Reader");
    }

    #[test]
    fn test_token_is_cached() {
        let (backend, registry) = registry();
        let slot = registry.slot(0).unwrap();
        let first = slot.token().unwrap();
        let exchanges = backend.with_card(DEFAULT_READER, |card| card.exchanges()).unwrap();
        let second = slot.token().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            backend.with_card(DEFAULT_READER, |card| card.exchanges()).unwrap(),
            exchanges
        );
    }

    #[test]
    fn test_stale_generation() {
        let (backend, registry) = registry();
        let slot = registry.slot(0).unwrap();
        let generation = slot.present_generation().unwrap();
        backend.remove_card(DEFAULT_READER);
        registry.refresh().unwrap();
        backend.insert_card(DEFAULT_READER, VirtualCard::cie().unwrap());
        registry.refresh().unwrap();
        assert_eq!(
            slot.run(generation, |applet| applet.select_application()).unwrap_err().kind(),
            &ErrorKind::DeviceRemoved
        );
    }

    #[test]
    fn test_card_lost_during_operation() {
        let (backend, registry) = registry();
        let slot = registry.slot(0).unwrap();
        let generation = slot.present_generation().unwrap();
        slot.run(generation, |applet| applet.select_application()).unwrap();

        // swapped for an identical card between two refreshes
        backend.remove_card(DEFAULT_READER);
        backend.insert_card(DEFAULT_READER, VirtualCard::cie().unwrap());
        assert_eq!(
            slot.run(generation, |applet| applet.select_application()).unwrap_err().kind(),
            &ErrorKind::DeviceRemoved
        );
        assert!(slot.generation() > generation);
        assert_eq!(registry.next_event().unwrap(), Some(0));

        let generation = slot.present_generation().unwrap();
        slot.run(generation, |applet| applet.select_application()).unwrap();
    }
}
