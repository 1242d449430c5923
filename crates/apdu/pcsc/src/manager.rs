//! Device manager for PC/SC operations

use pcsc::{Context, ReaderState, Scope, State};
use tracing::debug;

use crate::config::PcscConfig;
use crate::error::PcscError;
use crate::monitor::PcscMonitor;
use crate::reader::PcscReader;
use crate::transport::PcscTransport;

/// Manager for PC/SC device operations
#[allow(missing_debug_implementations)]
pub struct PcscDeviceManager {
    /// PC/SC context
    context: Context,
}

impl PcscDeviceManager {
    /// Create a new PC/SC device manager
    pub fn new() -> Result<Self, PcscError> {
        let context = Context::establish(Scope::User)?;
        Ok(Self { context })
    }

    /// List all card readers with their current card state. No readers at
    /// all is reported as an empty list.
    pub fn list_readers(&self) -> Result<Vec<PcscReader>, PcscError> {
        let names = match self.context.list_readers_owned() {
            Ok(names) => names,
            Err(pcsc::Error::NoReadersAvailable) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut states: Vec<ReaderState> = names
            .into_iter()
            .map(|name| ReaderState::new(name, State::UNAWARE))
            .collect();

        // A zero timeout only reads the current state
        match self
            .context
            .get_status_change(std::time::Duration::ZERO, &mut states)
        {
            Ok(()) | Err(pcsc::Error::Timeout) => {}
            Err(e) => {
                debug!(error = %e, "Could not read reader states");
                return Ok(states
                    .iter()
                    .map(|rs| PcscReader::new(rs.name().to_string_lossy().into_owned(), false, None))
                    .collect());
            }
        }

        Ok(states.iter().map(PcscReader::from_reader_state).collect())
    }

    /// Current state of one reader
    pub fn reader(&self, reader_name: &str) -> Result<PcscReader, PcscError> {
        self.list_readers()?
            .into_iter()
            .find(|r| r.name() == reader_name)
            .ok_or_else(|| PcscError::ReaderNotFound(reader_name.to_string()))
    }

    /// Open a connection to a specific reader
    pub fn open_reader(&self, reader_name: &str) -> Result<PcscTransport, PcscError> {
        self.open_reader_with_config(reader_name, PcscConfig::default())
    }

    /// Open a connection to a specific reader with custom configuration
    pub fn open_reader_with_config(
        &self,
        reader_name: &str,
        config: PcscConfig,
    ) -> Result<PcscTransport, PcscError> {
        PcscTransport::new(self.context.clone(), reader_name, config)
    }

    /// Create a monitor for reader and card state changes
    pub fn monitor(&self) -> PcscMonitor {
        PcscMonitor::new(self.context.clone())
    }
}
