//! PKCS#11 provider for the Italian electronic identity card (CIE)
//!
//! The `cdylib` exports the Cryptoki entry points and `C_GetFunctionList`.
//! Underneath them sits [`Provider`], the engine that discovers readers,
//! manages sessions and runs the card operations. It can be used directly
//! from Rust, which is how the integration tests drive it.
//!
//! ```no_run
//! use cie_pkcs11::{Provider, ProviderConfig};
//!
//! # fn main() -> cie_pkcs11::Result<()> {
//! let provider = Provider::new(ProviderConfig::default())?;
//! for slot in provider.slot_list(true) {
//!     println!("{}", provider.token_info(slot)?.label);
//! }
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod abi;
pub mod backend;
pub mod card;
pub mod config;
pub mod crypto;
pub mod error;
pub mod guard;
pub mod mechanism;
pub mod object;
pub mod provider;
pub mod registry;
pub mod session;
pub mod token;
pub mod trail;

mod logging;

pub use config::ProviderConfig;
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use mechanism::{Mechanism, Operation};
pub use object::{Attribute, AttributeValue, ObjectClass};
pub use provider::{Provider, SessionInfo, SlotInfo, TokenInfo};
pub use session::LoginState;
