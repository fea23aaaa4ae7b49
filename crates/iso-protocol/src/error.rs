//! Error types for isochronous PDU parsing and encoding

use thiserror::Error;

/// Errors that can occur while decoding over-the-air structures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Buffer is shorter than the structure it should contain
    #[error("incomplete data: need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Buffer has a length the structure can never have
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// A field holds a value outside its permitted range
    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: u32 },

    /// Unknown BIG control opcode
    #[error("unknown control opcode: 0x{0:02X}")]
    UnknownOpcode(u8),

    /// A reserved value was used where the field defines none
    #[error("reserved value in {field}: {value}")]
    Reserved { field: &'static str, value: u32 },

    /// A framed segment claims more bytes than the PDU holds
    #[error("segment length {claimed} exceeds {remaining} remaining bytes")]
    SegmentOverrun { claimed: usize, remaining: usize },
}
