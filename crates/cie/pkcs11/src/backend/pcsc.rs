//! Backend over the platform PC/SC service

use std::fmt;
use std::time::Duration;

use cie_apdu_core::{CardTransport, TransportError};
use cie_apdu_transport_pcsc::{PcscConfig, PcscDeviceManager, PcscMonitor, PcscTransport};
use tracing::{debug, warn};

use super::{CardBackend, CardConnection, ReaderStatus};
use crate::config::{ProviderConfig, ShareMode};
use crate::error::Result;

/// Readers of the platform PC/SC service
pub struct PcscBackend {
    manager: PcscDeviceManager,
    // status waits block their context, so the monitor gets its own
    monitor: PcscMonitor,
    config: PcscConfig,
}

impl fmt::Debug for PcscBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PcscBackend {
    /// Establish the PC/SC contexts
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let manager = PcscDeviceManager::new().map_err(TransportError::from)?;
        let monitor = PcscDeviceManager::new()
            .map_err(TransportError::from)?
            .monitor();
        let share_mode = match config.share_mode {
            ShareMode::Shared => cie_apdu_transport_pcsc::ShareMode::Shared,
            ShareMode::Exclusive => cie_apdu_transport_pcsc::ShareMode::Exclusive,
        };
        Ok(Self {
            manager,
            monitor,
            config: PcscConfig::new().with_share_mode(share_mode),
        })
    }
}

impl CardBackend for PcscBackend {
    fn readers(&self) -> Result<Vec<ReaderStatus>, TransportError> {
        let readers = self.manager.list_readers()?;
        Ok(readers
            .into_iter()
            .map(|reader| ReaderStatus {
                name: reader.name().to_string(),
                card_present: reader.has_card(),
                atr: reader.atr().map(<[u8]>::to_vec),
            })
            .collect())
    }

    fn connect(&self, reader: &str) -> Result<Box<dyn CardConnection>, TransportError> {
        let transport = self
            .manager
            .open_reader_with_config(reader, self.config.clone())?;
        debug!(reader, "Opened PC/SC connection");
        Ok(Box::new(PcscConnection { transport }))
    }

    fn wait_for_change(&self, timeout: Duration) -> Result<bool, TransportError> {
        Ok(self.monitor.wait_for_change(timeout)?)
    }

    fn cancel_wait(&self) {
        if let Err(e) = self.monitor.cancel() {
            warn!(error = %e, "Failed to cancel the PC/SC status wait");
        }
    }

    fn manufacturer(&self) -> &str {
        "PC/SC"
    }
}

#[derive(Debug)]
struct PcscConnection {
    transport: PcscTransport,
}

impl CardConnection for PcscConnection {
    fn transaction(
        &mut self,
        body: &mut dyn FnMut(&mut dyn CardTransport),
    ) -> Result<(), TransportError> {
        Ok(self.transport.transaction(|tx| body(tx))?)
    }
}
