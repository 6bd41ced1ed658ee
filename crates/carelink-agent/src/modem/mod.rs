//! Cellular modem driver.
//!
//! All traffic goes through one [`ModemDriver`], which owns the serial
//! channel and serializes exchanges on it. Layers, bottom up:
//!
//! - [`transport`]: raw non-blocking byte channel and the reset line
//! - [`exchange`]: one command/response round trip
//! - [`session`]: lifecycle state and response parsers
//! - [`driver`]: probing, initialization and recovery escalation
//! - [`sms`]: message submission and delivery with retries

pub mod driver;
pub mod exchange;
pub mod session;
pub mod sms;
pub mod transport;

use thiserror::Error;

pub use driver::ModemDriver;
pub use exchange::{CommandExchange, ExchangeOutcome, ExchangeResult};
pub use session::{ModemSession, Registration, SessionState, SignalQuality};
pub use sms::{DeliveryReceipt, SubmitReceipt};
pub use transport::{CommandReset, HardwareReset, NoReset, SerialDevice, Transport};

#[derive(Debug, Error)]
pub enum ModemError {
    #[error("modem did not answer after {attempts} probes")]
    Unresponsive { attempts: u32 },

    #[error("modem session is faulted")]
    Faulted,

    #[error("modem is not registered on the network ({0})")]
    NotRegistered(Registration),

    #[error("modem rejected text mode")]
    TextModeRejected,

    #[error("no message prompt from modem (got {response:?})")]
    PromptTimeout { response: String },

    #[error("modem rejected the message: {response:?}")]
    SubmissionRejected { response: String },

    #[error("no submission confirmation within {window_s}s")]
    SubmissionTimeout { window_s: u64 },

    #[error("delivery failed after {attempts} attempts: {last_error}")]
    DeliveryExhausted { attempts: u32, last_error: String },

    #[error("modem I/O error: {0}")]
    Io(#[from] std::io::Error),
}
