//! Isochronous broadcast wire formats
//!
//! This crate provides bit-exact codecs and the pure algorithms shared by
//! the broadcaster and receiver sides of a Broadcast Isochronous Group:
//!
//! - Data channel maps and Channel Selection Algorithm #2 with subevents
//! - BIS and BIG control access address derivation
//! - BIGInfo, the BIS PDU header and BIG control PDUs
//! - The framed-PDU segmentation header
//! - PHY air time and window widening arithmetic

pub mod access_address;
pub mod biginfo;
pub mod chan_map;
pub mod chsel;
pub mod error;
pub mod pdu;
pub mod segment;
pub mod timing;

pub use access_address::{bis_access_address, control_access_address, generate_seed_access_address};
pub use biginfo::{BigInfo, BigInfoEncryption, Framing, FramingMode, OffsetUnits};
pub use chan_map::ChannelMap;
pub use chsel::{channel_identifier, next_event_channel, next_subevent_channel, ChannelHop, EventChannel};
pub use error::ParseError;
pub use pdu::{BigControlPdu, BisPduHeader, Llid};
pub use timing::Phy;

/// Mask of the 39-bit BIS payload and BIG event counters
pub const PAYLOAD_COUNTER_MASK: u64 = (1 << 39) - 1;

/// Trait for structures that serialize to their over-the-air bytes
pub trait EncodePdu {
    /// Encode to bytes
    fn encode(&self) -> Vec<u8>;
}

/// Trait for structures parsed from their over-the-air bytes
pub trait DecodePdu: Sized {
    /// Decode from exactly the structure's bytes
    fn decode(bytes: &[u8]) -> Result<Self, ParseError>;
}
