//! Reader and card state monitoring

use std::collections::HashMap;
use std::ffi::CString;
use std::time::Duration;

use parking_lot::Mutex;
use pcsc::{Context, ReaderState, State};
use tracing::{debug, trace};

use crate::error::PcscError;

/// Watches the PC/SC service for readers appearing or going away and for
/// cards being inserted or removed
#[allow(missing_debug_implementations)]
pub struct PcscMonitor {
    /// PC/SC context, shared with the device manager
    context: Context,
    /// Card presence per reader as of the last call
    known: Mutex<HashMap<String, bool>>,
}

impl PcscMonitor {
    /// Create a new monitor
    pub(crate) fn new(context: Context) -> Self {
        Self {
            context,
            known: Mutex::new(HashMap::new()),
        }
    }

    fn reader_names(&self) -> Result<Vec<CString>, PcscError> {
        match self.context.list_readers_owned() {
            Ok(names) => Ok(names),
            Err(pcsc::Error::NoReadersAvailable) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Record the presence seen in `states`, returning whether it differs
    /// from what was known before
    fn record(&self, states: &[ReaderState]) -> bool {
        let current: HashMap<String, bool> = states
            .iter()
            .skip(1)
            .map(|rs| {
                let state = rs.event_state();
                (
                    rs.name().to_string_lossy().into_owned(),
                    state.contains(State::PRESENT) && !state.contains(State::EMPTY),
                )
            })
            .collect();

        let mut known = self.known.lock();
        let changed = *known != current;
        *known = current;
        changed
    }

    /// Block until a reader or card change is observed or `timeout` elapses
    ///
    /// Returns `Ok(true)` when something changed since the previous call and
    /// `Ok(false)` on timeout. A concurrent [`cancel`](Self::cancel) makes the
    /// call fail with [`pcsc::Error::Cancelled`].
    pub fn wait_for_change(&self, timeout: Duration) -> Result<bool, PcscError> {
        let mut states = vec![ReaderState::new(pcsc::PNP_NOTIFICATION(), State::UNAWARE)];
        states.extend(
            self.reader_names()?
                .into_iter()
                .map(|name| ReaderState::new(name, State::UNAWARE)),
        );

        match self.context.get_status_change(Duration::ZERO, &mut states) {
            Ok(()) | Err(pcsc::Error::Timeout) => {}
            Err(e) => return Err(e.into()),
        }
        if self.record(&states) {
            debug!("Reader state changed since last poll");
            return Ok(true);
        }

        for rs in &mut states {
            rs.sync_current_state();
        }
        match self.context.get_status_change(timeout, &mut states) {
            Ok(()) => {
                trace!("Status change reported");
                Ok(self.record(&states) || states[0].event_state().contains(State::CHANGED))
            }
            Err(pcsc::Error::Timeout) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Wake up every thread blocked in [`wait_for_change`](Self::wait_for_change)
    pub fn cancel(&self) -> Result<(), PcscError> {
        self.context.cancel()?;
        Ok(())
    }
}
