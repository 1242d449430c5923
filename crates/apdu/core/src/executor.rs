//! Executor for APDU command execution
//!
//! [`CardExecutor`] wraps a transport and takes care of the transmission
//! protocol details that every card application needs: following `61xx` with
//! GET RESPONSE, re-issuing a command answered with `6Cxx`, and sending long
//! payloads as a command chain.

use std::fmt;

use bytes::BytesMut;
use tracing::{Level, debug, info, instrument, trace, warn};

use crate::command::{Command, SHORT_MAX_DATA};
use crate::response::Response;
use crate::response::status::StatusWord;
use crate::transport::CardTransport;
use crate::{Error, Result};

/// INS byte of GET RESPONSE
const INS_GET_RESPONSE: u8 = 0xC0;

/// Card executor combining a transport with response chaining
pub struct CardExecutor<T: CardTransport> {
    /// The transport used for communication
    transport: T,
    /// Maximum number of GET RESPONSE rounds per command
    max_chain: usize,
    /// Class byte for GET RESPONSE
    get_response_cla: u8,
}

impl<T: CardTransport> fmt::Debug for CardExecutor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardExecutor")
            .field("transport", &self.transport)
            .field("max_chain", &self.max_chain)
            .field("get_response_cla", &format_args!("{:#04x}", self.get_response_cla))
            .finish()
    }
}

impl<T: CardTransport> CardExecutor<T> {
    /// Create a new card executor with the given transport
    pub const fn new(transport: T) -> Self {
        Self {
            transport,
            max_chain: 32,
            get_response_cla: 0x00,
        }
    }

    /// Limit the number of GET RESPONSE rounds
    pub const fn with_max_chain(mut self, max_chain: usize) -> Self {
        self.max_chain = max_chain;
        self
    }

    /// Get a reference to the underlying transport
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Get a mutable reference to the underlying transport
    pub const fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Take ownership of the transport and return it
    pub fn into_transport(self) -> T {
        self.transport
    }

    fn exchange(&mut self, command: &Command) -> Result<Response> {
        let bytes = command.to_bytes()?;
        let raw = self.transport.transmit_raw(&bytes)?;
        Response::from_bytes(&raw)
    }

    /// Transmit a command and collect its complete response
    ///
    /// The returned response may carry any status word; use
    /// [`execute`](Self::execute) to treat everything but `90 00` as an error.
    #[instrument(level = "trace", skip(self), fields(ins = format_args!("{:#04x}", command.ins)))]
    pub fn transmit(&mut self, command: &Command) -> Result<Response> {
        let mut response = self.exchange(command)?;

        if let Some(le) = response.status().corrected_le() {
            trace!(le, "Card asked for a corrected Le, re-issuing");
            let retry = command.clone().with_le(if le == 0 { 256 } else { u16::from(le) });
            response = self.exchange(&retry)?;
        }

        let mut chain_count = 0;
        if response.status().is_more_data_available() {
            let mut payload = BytesMut::from(response.payload().as_ref());
            while let Some(remaining) = response.status().remaining_bytes() {
                if chain_count >= self.max_chain {
                    return Err(Error::ChainLimitExceeded);
                }
                chain_count += 1;
                trace!(remaining, chain_count, "Sending GET RESPONSE");

                let get_response = Command::new_with_le(
                    self.get_response_cla,
                    INS_GET_RESPONSE,
                    0x00,
                    0x00,
                    if remaining == 0 { 256 } else { u16::from(remaining) },
                );
                response = self.exchange(&get_response)?;
                payload.extend_from_slice(response.payload());
            }
            response = Response::new(payload.freeze(), response.status());
        }

        log_status(command, response.status());
        Ok(response)
    }

    /// Transmit a command, splitting its data into a command chain when it
    /// exceeds a short APDU. Every intermediate link must answer `90 00`.
    pub fn transmit_chained(&mut self, command: &Command) -> Result<Response> {
        let mut links = command.chained(SHORT_MAX_DATA);
        let Some(last) = links.pop() else {
            return self.transmit(command);
        };
        for link in &links {
            let response = self.exchange(link)?;
            if !response.is_success() {
                log_status(link, response.status());
                return Ok(response);
            }
        }
        self.transmit(&last)
    }

    /// Transmit a command and return its payload, failing on any status word
    /// other than `90 00`
    pub fn execute(&mut self, command: &Command) -> Result<bytes::Bytes> {
        self.transmit(command)?.into_result()
    }

    /// Chained variant of [`execute`](Self::execute)
    pub fn execute_chained(&mut self, command: &Command) -> Result<bytes::Bytes> {
        self.transmit_chained(command)?.into_result()
    }
}

fn log_status(command: &Command, status: StatusWord) {
    let ins = command.ins;
    match status.tracing_level() {
        Level::DEBUG => debug!(ins, %status, "{}", status.description()),
        Level::INFO => info!(ins, %status, "{}", status.description()),
        _ => warn!(ins, %status, "{}", status.description()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use hex_literal::hex;

    #[test]
    fn test_get_response_chain() {
        let transport = MockTransport::new([
            &hex!("0102 6102")[..],
            &hex!("0304 6101")[..],
            &hex!("05 9000")[..],
        ]);
        let mut executor = CardExecutor::new(transport);

        let cmd = Command::new_with_le(0x00, 0xB0, 0x00, 0x00, 0);
        let response = executor.transmit(&cmd).unwrap();
        assert!(response.is_success());
        assert_eq!(response.payload().as_ref(), &hex!("0102030405"));

        let sent = &executor.transport().commands;
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].as_ref(), &hex!("00C0000002"));
        assert_eq!(sent[2].as_ref(), &hex!("00C0000001"));
    }

    #[test]
    fn test_wrong_le_reissued() {
        let transport = MockTransport::new([&hex!("6C08")[..], &hex!("1122334455667788 9000")[..]]);
        let mut executor = CardExecutor::new(transport);

        let payload = executor
            .execute(&Command::new_with_le(0x00, 0x84, 0x00, 0x00, 0x10))
            .unwrap();
        assert_eq!(payload.len(), 8);
        assert_eq!(executor.transport().commands[1].as_ref(), &hex!("0084000008"));
    }

    #[test]
    fn test_chain_limit() {
        let transport = MockTransport::new(vec![hex!("00 6101"); 5]);
        let mut executor = CardExecutor::new(transport).with_max_chain(3);
        let err = executor
            .transmit(&Command::new_with_le(0x00, 0xB0, 0x00, 0x00, 0))
            .unwrap_err();
        assert!(matches!(err, Error::ChainLimitExceeded));
    }

    #[test]
    fn test_command_chaining() {
        let transport = MockTransport::new([&hex!("9000")[..], &hex!("CAFE 9000")[..]]);
        let mut executor = CardExecutor::new(transport);

        let cmd = Command::new_with_data(0x00, 0x2A, 0x80, 0x86, vec![0x00; 257]).with_le(0);
        let payload = executor.execute_chained(&cmd).unwrap();
        assert_eq!(payload.as_ref(), &hex!("CAFE"));

        let sent = &executor.transport().commands;
        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[0][..5], &hex!("102A8086FF"));
        assert_eq!(&sent[1][..5], &hex!("002A808602"));
    }

    #[test]
    fn test_chaining_stops_on_error() {
        let transport = MockTransport::new([&hex!("6884")[..]]);
        let mut executor = CardExecutor::new(transport);
        let cmd = Command::new_with_data(0x00, 0x2A, 0x80, 0x86, vec![0x00; 300]);
        let response = executor.transmit_chained(&cmd).unwrap();
        assert_eq!(response.status(), StatusWord::new(0x68, 0x84));
        assert_eq!(executor.transport().commands.len(), 1);
    }

    #[test]
    fn test_execute_status_error() {
        let transport = MockTransport::new([&hex!("6A82")[..]]);
        let mut executor = CardExecutor::new(transport);
        let err = executor
            .execute(&Command::new_with_data(0x00, 0xA4, 0x02, 0x0C, vec![0x10, 0x03]))
            .unwrap_err();
        assert!(err.status_word().unwrap().is_file_not_found());
    }
}
