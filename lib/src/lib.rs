//! Device-side implementation of the USB CCID smart-card reader class,
//! restricted to the ICCD subset: T=1 only, extended APDUs, no PIN pad.
//!
//! The host sees a standards-conformant reader; on the device side a
//! pluggable [`Card`] services the APDUs. The kernel gadget glue is kept
//! behind the narrow [`GadgetBackend`] seam: it feeds SETUP packets and
//! bulk-OUT completions into an [`IccdFunction`] and registers the
//! descriptors the function hands out. Everything runs on one cooperative
//! event loop; the endpoint submissions are the only yield points.

pub mod card;
pub mod function;
pub mod gadget;
pub mod loopback;
pub mod message;
pub mod slot;
pub mod usb;

pub use card::Card;
pub use function::{IccdFunction, Reply};
pub use gadget::{CompletionStatus, GadgetBackend};
pub use slot::Slot;

use thiserror::Error as ThisError;

/// Errors of the ICCD core.
///
/// Protocol-level failures (bad lengths, unsupported commands, absent
/// cards) never show up here: those become CCID responses with a bError
/// code. This type covers the local category: malformed transfers,
/// configuration and usage mistakes, and card-contract failures.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("invalid bMessageType: {0:#04x}")]
    InvalidMessageType(u8),

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("card already present")]
    AlreadyPresent,

    #[error("no card present")]
    NotPresent,

    #[error("slot {0} out of range")]
    BadSlot(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),

    #[error("card failure: {0}")]
    Card(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("transfer failed with status {0}")]
    Transfer(i32),

    #[error("endpoint I/O failed")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a card-implementation failure.
    pub fn card<E>(source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Card(source.into())
    }
}
