//! Core traits and types for APDU (Application Protocol Data Unit) exchanges
//!
//! This crate provides the foundational types for talking to an ISO/IEC 7816-4
//! smart card:
//!
//! - [`Command`] encoding in short and extended form, plus command chaining
//! - [`Response`] parsing and [`StatusWord`] interpretation
//! - the [`CardTransport`] trait implemented by reader backends
//! - [`CardExecutor`], which follows `61xx` with GET RESPONSE and re-issues
//!   commands answered with `6Cxx`
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

pub mod command;
pub mod executor;
pub mod response;
pub mod transport;

mod error;
pub use error::{Error, Result, ResultExt};

pub use command::Command;
pub use executor::CardExecutor;
pub use response::Response;
pub use response::status::StatusWord;
pub use transport::{CardTransport, TransportError};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{
        Bytes, BytesMut, CardExecutor, Command, Error, Response, Result, ResultExt,
        response::status::{StatusWord, common as sw},
        transport::{CardTransport, TransportError},
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reexports() {
        let cmd = Command::new(0x00, 0xA4, 0x04, 0x0C);
        assert_eq!(cmd.cla, 0x00);
        assert_eq!(cmd.ins, 0xA4);

        let resp = Response::success(Bytes::from_static(&[0x01, 0x02, 0x03]));
        assert!(resp.is_success());
        assert_eq!(resp.payload(), &[0x01, 0x02, 0x03][..]);
        assert_eq!(resp.status(), StatusWord::new(0x90, 0x00));
    }
}
