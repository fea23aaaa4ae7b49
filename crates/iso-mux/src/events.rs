//! Events reported toward the host
//!
//! Every HCI event the engine raises, and every SDU delivered on an output
//! data path, goes through one [`IsoEvent`] stream in the order it happened.

use iso_protocol::Phy;

use crate::hci::HciStatus;
use crate::isoal::ReceivedSdu;
use crate::state::BisHandle;

/// Parameters reported when a broadcast BIG is established
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigCreatedInfo {
    /// BIG synchronization delay in microseconds
    pub big_sync_delay_us: u32,
    /// Transport latency in microseconds
    pub transport_latency_us: u32,
    pub phy: Phy,
    pub nse: u8,
    pub bn: u8,
    pub pto: u8,
    pub irc: u8,
    pub max_pdu: u8,
    /// ISO interval in units of 1.25 ms
    pub iso_interval: u16,
    /// One handle per BIS, in BIS number order
    pub bis_handles: Vec<BisHandle>,
}

/// Parameters reported when a BIG sync is established
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigSyncInfo {
    pub transport_latency_us: u32,
    pub nse: u8,
    pub bn: u8,
    pub pto: u8,
    pub irc: u8,
    pub max_pdu: u8,
    pub iso_interval: u16,
    /// One handle per synchronized BIS, in the requested order
    pub bis_handles: Vec<BisHandle>,
}

/// Unified event enum for the isochronous engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoEvent {
    // -------------------------------------------------------------------------
    // Broadcaster
    // -------------------------------------------------------------------------
    /// LE Create BIG Complete
    CreateBigComplete {
        status: HciStatus,
        big_handle: u8,
        /// Present on success
        info: Option<BigCreatedInfo>,
    },

    /// LE Terminate BIG Complete
    TerminateBigComplete { big_handle: u8, reason: u8 },

    /// Number Of Completed Packets for one broadcast BIS
    NumberOfCompletedPackets { handle: BisHandle, count: u16 },

    // -------------------------------------------------------------------------
    // Receiver
    // -------------------------------------------------------------------------
    /// LE BIG Sync Established
    BigSyncEstablished {
        status: HciStatus,
        big_handle: u8,
        /// Present on success
        info: Option<BigSyncInfo>,
    },

    /// LE BIG Sync Lost
    BigSyncLost { big_handle: u8, reason: u8 },

    /// SDU delivered on an output data path
    SduReceived { handle: BisHandle, sdu: ReceivedSdu },
}

impl IsoEvent {
    /// Whether this event creates or ends a BIG or BIG sync
    pub fn is_lifecycle(&self) -> bool {
        !matches!(
            self,
            IsoEvent::NumberOfCompletedPackets { .. } | IsoEvent::SduReceived { .. }
        )
    }

    /// BIG handle the event refers to, if any
    pub fn big_handle(&self) -> Option<u8> {
        match self {
            IsoEvent::CreateBigComplete { big_handle, .. }
            | IsoEvent::TerminateBigComplete { big_handle, .. }
            | IsoEvent::BigSyncEstablished { big_handle, .. }
            | IsoEvent::BigSyncLost { big_handle, .. } => Some(*big_handle),
            IsoEvent::NumberOfCompletedPackets { .. } | IsoEvent::SduReceived { .. } => None,
        }
    }

    /// BIS handle the event refers to, if any
    pub fn bis_handle(&self) -> Option<BisHandle> {
        match self {
            IsoEvent::NumberOfCompletedPackets { handle, .. }
            | IsoEvent::SduReceived { handle, .. } => Some(*handle),
            _ => None,
        }
    }
}
