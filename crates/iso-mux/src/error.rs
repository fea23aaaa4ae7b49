//! Error types for the isochronous engine

use thiserror::Error;

use crate::hci::HciStatus;

/// Errors that can occur in the isochronous engine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IsoError {
    /// Command parameters out of range or inconsistent
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// A fixed-size pool has no free slot
    #[error("no free {0} available")]
    ResourcesExhausted(&'static str),

    /// No BIG with this handle
    #[error("unknown BIG handle: 0x{0:02X}")]
    UnknownBig(u8),

    /// Stale or unknown BIS handle
    #[error("unknown BIS handle: 0x{0:04X}")]
    UnknownBis(u16),

    /// No BIG sync with this handle
    #[error("unknown BIG sync handle: 0x{0:02X}")]
    UnknownSync(u8),

    /// Command not allowed in the current state
    #[error("command disallowed: {0}")]
    CommandDisallowed(&'static str),

    /// Controller does not support the requested feature
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    /// Encryption requested does not match the BIG
    #[error("encryption mode mismatch: requested {requested}, BIG encrypted {advertised}")]
    EncryptionModeError { requested: bool, advertised: bool },

    /// Window widening exceeds what the BIG timing allows
    #[error("receive window widening of {widening_us}us exceeds limit of {limit_us}us")]
    WindowTooWide { widening_us: u32, limit_us: u32 },

    /// Received payload cannot be parsed
    #[error("malformed PDU at index {index}")]
    MalformedPdu { index: usize },

    /// Payload index outside the event's range
    #[error("unexpected payload index {index} (limit {limit})")]
    UnexpectedIndex { index: usize, limit: usize },

    /// SDU queue of a BIS is full
    #[error("SDU queue full ({0} entries)")]
    SduQueueFull(usize),

    /// Wire format error
    #[error("protocol error: {0}")]
    Parse(#[from] iso_protocol::ParseError),
}

impl IsoError {
    /// HCI status reported for this error
    pub fn status(&self) -> HciStatus {
        match self {
            IsoError::InvalidParameters(_) | IsoError::Parse(_) => HciStatus::InvalidParameters,
            IsoError::ResourcesExhausted(_) => HciStatus::ConnectionRejectedLimitedResources,
            IsoError::UnknownBig(_) => HciStatus::UnknownAdvertisingId,
            IsoError::UnknownBis(_) | IsoError::UnknownSync(_) => HciStatus::UnknownConnectionId,
            IsoError::CommandDisallowed(_) => HciStatus::CommandDisallowed,
            IsoError::UnsupportedFeature(_) => HciStatus::UnsupportedFeature,
            IsoError::EncryptionModeError { .. } => HciStatus::EncryptionModeNotAcceptable,
            IsoError::WindowTooWide { .. } => HciStatus::UnacceptableConnectionParameters,
            IsoError::MalformedPdu { .. } | IsoError::UnexpectedIndex { .. } => {
                HciStatus::UnspecifiedError
            }
            IsoError::SduQueueFull(_) => HciStatus::MemoryCapacityExceeded,
        }
    }
}
