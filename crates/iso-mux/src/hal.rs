//! Seams toward the link layer scheduler, the radio and the cipher
//!
//! The controller does not own time. A scheduler reserves slots of air time
//! and calls [`IsoController::run_activity`](crate::IsoController::run_activity)
//! when one begins; the radio reports each finished operation through
//! [`IsoController::radio_done`](crate::IsoController::radio_done).

use thiserror::Error;

use crate::state::{BigSlot, SyncSlot};

/// What a scheduled slot of air time is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Activity {
    /// Event of a broadcast BIG
    BigTx(BigSlot),
    /// Event of a BIG sync
    BigRx(SyncSlot),
}

/// A reservation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleItem {
    pub start_us: u64,
    pub end_us: u64,
    pub activity: Activity,
}

/// The requested reservation overlaps another one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("scheduling conflict")]
pub struct SchedConflict;

/// Link layer scheduler
pub trait Scheduler {
    /// Reserve air time; the activity runs at `item.start_us`
    fn schedule(&mut self, item: ScheduleItem) -> Result<(), SchedConflict>;

    /// Drop every reservation held by `activity`
    fn cancel(&mut self, activity: Activity);
}

/// Radio state after an operation completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transition {
    /// Power down
    #[default]
    None,
    /// Stay ready for a following transmit
    ToTx,
    /// Stay ready for a following receive
    ToRx,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub start_us: u64,
    /// Header and payload
    pub pdu: Vec<u8>,
    pub transition: Transition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxRequest {
    /// Start of the receive window
    pub start_us: u64,
    pub window_us: u32,
    pub transition: Transition,
}

/// A packet caught by the receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxPacket {
    /// Header and payload
    pub pdu: Vec<u8>,
    /// Start of the packet on air
    pub timestamp_us: u64,
    pub crc_ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RxError {
    /// Nothing arrived inside the window
    #[error("receive timeout")]
    Timeout,
    /// The operation was stopped before completing
    #[error("receive aborted")]
    Aborted,
}

/// Completion of the outstanding radio operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioDone {
    Tx { end_us: u64 },
    Rx(Result<RxPacket, RxError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RadioError {
    /// Another operation is still outstanding
    #[error("radio busy")]
    Busy,
    /// The requested start time has already passed
    #[error("start time {0}us already passed")]
    TooLate(u64),
}

/// PHY driver
pub trait Radio {
    /// Tune and set the link identity for the next operation
    fn set_channel(&mut self, channel_index: u8, access_address: u32, crc_init: u32);

    fn transmit(&mut self, request: TxRequest) -> Result<(), RadioError>;

    fn receive(&mut self, request: RxRequest) -> Result<(), RadioError>;

    /// Abort reception if no packet starts within `timeout_us` of the window start
    fn enable_wait_for_response(&mut self, timeout_us: u32);

    /// Stop whatever is in progress; no completion is reported for it
    fn disable(&mut self);
}

/// Key material of an encrypted BIG
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupKey {
    pub broadcast_code: [u8; 16],
    pub giv: [u8; 8],
    pub gskd: [u8; 16],
}

/// Identity of a payload for nonce construction
#[derive(Debug, Clone, Copy)]
pub struct CipherContext<'a> {
    pub key: &'a GroupKey,
    /// 39-bit payload counter of the PDU
    pub payload_counter: u64,
    /// BIS number, 0 for the control link
    pub bis_number: u8,
    /// First header byte, authenticated but not encrypted
    pub header: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("MIC check failed")]
pub struct MicFailure;

/// Payload encryption for encrypted BIGs
///
/// Key derivation and the block cipher are provided by the platform.
pub trait IsoCipher: Send {
    /// Encrypt in place and append the 4-byte MIC
    fn encrypt(&mut self, ctx: &CipherContext<'_>, payload: &mut Vec<u8>);

    /// Verify and strip the MIC, then decrypt in place
    fn decrypt(&mut self, ctx: &CipherContext<'_>, payload: &mut Vec<u8>) -> Result<(), MicFailure>;
}
