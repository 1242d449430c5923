//! PC/SC transport implementation for APDU operations
//!
//! This crate implements the `CardTransport` trait from `cie-apdu-core` on top
//! of the platform PC/SC service (pcsc-lite, WinSCard or CryptoTokenKit).
//!
//! ```no_run
//! use cie_apdu_core::{CardExecutor, Command};
//! use cie_apdu_transport_pcsc::PcscDeviceManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = PcscDeviceManager::new()?;
//! let Some(reader) = manager.list_readers()?.into_iter().find(|r| r.has_card()) else {
//!     println!("No card found");
//!     return Ok(());
//! };
//!
//! let mut transport = manager.open_reader(reader.name())?;
//! let response = transport.transaction(|tx| {
//!     let mut executor = CardExecutor::new(tx);
//!     executor.transmit(&Command::new_with_le(0x00, 0x84, 0x00, 0x00, 8))
//! })??;
//! println!("{:?}", response);
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![warn(missing_docs)]

mod config;
mod error;
mod manager;
mod monitor;
mod reader;
mod transport;

pub use config::{PcscConfig, ShareMode};
pub use error::PcscError;
pub use manager::PcscDeviceManager;
pub use monitor::PcscMonitor;
pub use reader::PcscReader;
pub use transport::{PcscTransport, TransactionTransport};

// Re-export some pcsc types for convenience
pub use pcsc::{Protocol, Protocols};
