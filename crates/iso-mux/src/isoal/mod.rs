//! Isochronous Adaptation Layer
//!
//! The mux turns queued SDUs into the BN payloads of each BIS event, the
//! demux reassembles received payloads into SDUs. Both sides work in the
//! same two modes:
//!
//! - **Unframed**: each SDU is cut into `pdu_per_sdu` fixed slots; LLID marks
//!   the last fragment and empty continuation PDUs pad unused slots.
//! - **Framed**: SDUs are written as segments with a 2-byte segmentation
//!   header, several SDUs may share a PDU and an SDU may span events.

use iso_protocol::{Framing, FramingMode, Llid};
use serde::{Deserialize, Serialize};

use crate::error::IsoError;

pub mod demux;
pub mod mux;

pub use demux::IsoalDemux;
pub use mux::IsoalMux;

/// Parameters shared by the mux and demux of one BIS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsoalConfig {
    pub max_pdu: u8,
    pub iso_interval_us: u32,
    pub sdu_interval_us: u32,
    pub bn: u8,
    pub pto: u8,
    pub framing: Framing,
    pub framing_mode: FramingMode,
    /// SDUs the mux may hold
    pub max_sdu_queue: usize,
}

impl IsoalConfig {
    /// PDUs that carry one SDU in unframed mode
    ///
    /// Fails unless the ISO interval holds a whole number of SDU intervals
    /// that divides BN evenly.
    pub fn pdu_per_sdu(&self) -> Result<u8, IsoError> {
        if self.bn == 0 || self.sdu_interval_us == 0 || self.max_pdu == 0 {
            return Err(IsoError::InvalidParameters(
                "BN, SDU interval and max PDU must be non-zero".into(),
            ));
        }
        if self.iso_interval_us % self.sdu_interval_us != 0 {
            return Err(IsoError::InvalidParameters(format!(
                "ISO interval {}us is not a multiple of SDU interval {}us",
                self.iso_interval_us, self.sdu_interval_us
            )));
        }
        let sdus_per_event = self.iso_interval_us / self.sdu_interval_us;
        if sdus_per_event == 0 || u32::from(self.bn) % sdus_per_event != 0 {
            return Err(IsoError::InvalidParameters(format!(
                "BN {} cannot carry {} SDUs per event",
                self.bn, sdus_per_event
            )));
        }
        Ok((u32::from(self.bn) / sdus_per_event) as u8)
    }

    pub fn is_framed(&self) -> bool {
        self.framing == Framing::Framed
    }
}

/// An SDU handed to the mux
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sdu {
    pub data: Vec<u8>,
    /// Packet sequence number
    pub sequence: u16,
    /// Time the SDU was generated, on the controller clock
    pub timestamp_us: u64,
}

impl Sdu {
    pub fn new(data: Vec<u8>, sequence: u16, timestamp_us: u64) -> Self {
        Self {
            data,
            sequence,
            timestamp_us,
        }
    }
}

/// One PDU payload produced by the mux
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoalPdu {
    pub llid: Llid,
    pub payload: Vec<u8>,
}

impl IsoalPdu {
    pub(crate) fn padding() -> Self {
        Self {
            llid: Llid::UnframedContinuation,
            payload: Vec::new(),
        }
    }

    /// Empty unframed continuation or empty framed PDU
    pub fn is_padding(&self) -> bool {
        self.payload.is_empty() && self.llid != Llid::UnframedEnd
    }
}

/// What an event consumed from the mux
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MuxCompletion {
    /// PDUs within BN that carried SDU data
    pub pdus_with_payload: usize,
    /// SDUs fully handed to the air and dropped from the queue
    pub sdus_completed: usize,
}

/// Reassembly outcome of an SDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SduStatus {
    /// All fragments received
    Valid,
    /// Some fragments received, some missing or corrupt
    Errors,
    /// Nothing received
    Lost,
}

/// An SDU reassembled by the demux
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedSdu {
    pub data: Vec<u8>,
    pub timestamp_us: u64,
    pub sequence: u16,
    pub status: SduStatus,
}

impl ReceivedSdu {
    pub fn is_valid(&self) -> bool {
        self.status == SduStatus::Valid
    }
}
