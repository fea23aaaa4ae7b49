//! HCI parameter blocks and status codes
//!
//! These are the decoded forms of the HCI LE commands that drive BIG
//! creation and synchronization. HCI transport encoding lives outside this
//! crate; callers construct these blocks directly.

use iso_protocol::{Framing, Phy};
use serde::{Deserialize, Serialize};

use crate::state::BisHandle;

/// Bluetooth Core HCI error codes used by this subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HciStatus {
    Success = 0x00,
    UnknownConnectionId = 0x02,
    MemoryCapacityExceeded = 0x07,
    ConnectionTimeout = 0x08,
    CommandDisallowed = 0x0C,
    ConnectionRejectedLimitedResources = 0x0D,
    UnsupportedFeature = 0x11,
    InvalidParameters = 0x12,
    RemoteUserTerminated = 0x13,
    LocalHostTerminated = 0x16,
    UnspecifiedError = 0x1F,
    EncryptionModeNotAcceptable = 0x25,
    UnacceptableConnectionParameters = 0x3B,
    MicFailure = 0x3D,
    ConnectionFailedToBeEstablished = 0x3E,
    UnknownAdvertisingId = 0x42,
    OperationCancelledByHost = 0x44,
}

impl HciStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        self == HciStatus::Success
    }
}

/// How subevents of different BISes are ordered within an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Packing {
    /// All subevents of BIS 1, then all of BIS 2, ...
    #[default]
    Sequential,
    /// Subevent 1 of every BIS, then subevent 2 of every BIS, ...
    Interleaved,
}

/// LE Create BIG
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBig {
    pub big_handle: u8,
    pub adv_handle: u8,
    pub num_bis: u8,
    /// SDU interval in microseconds
    pub sdu_interval_us: u32,
    pub max_sdu: u16,
    pub max_transport_latency_ms: u16,
    /// Retransmission number
    pub rtn: u8,
    pub phy: Phy,
    pub packing: Packing,
    pub framing: Framing,
    pub encryption: bool,
    pub broadcast_code: [u8; 16],
}

/// LE Create BIG Test
///
/// Gives the host direct control over every BIG parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBigTest {
    pub big_handle: u8,
    pub adv_handle: u8,
    pub num_bis: u8,
    pub sdu_interval_us: u32,
    /// ISO interval in units of 1.25 ms
    pub iso_interval: u16,
    pub nse: u8,
    pub max_sdu: u16,
    pub max_pdu: u8,
    pub phy: Phy,
    pub packing: Packing,
    pub framing: Framing,
    pub bn: u8,
    pub irc: u8,
    pub pto: u8,
    pub encryption: bool,
    pub broadcast_code: [u8; 16],
}

/// LE Terminate BIG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateBig {
    pub big_handle: u8,
    pub reason: u8,
}

/// LE BIG Create Sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BigCreateSync {
    pub big_handle: u8,
    /// Periodic advertising sync carrying the BIGInfo
    pub sync_handle: u16,
    pub encryption: bool,
    pub broadcast_code: [u8; 16],
    /// Maximum subevents to receive per BIS event, 0 = controller decides
    pub mse: u8,
    /// Sync timeout in units of 10 ms
    pub sync_timeout: u16,
    /// BIS indices (1-based) to synchronize to
    pub bis: Vec<u8>,
}

/// LE BIG Terminate Sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BigTerminateSync {
    pub big_handle: u8,
}

/// Direction of an ISO data path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataPathDirection {
    /// Host to controller (broadcast BIS)
    Input,
    /// Controller to host (synchronized BIS)
    Output,
}

/// LE Setup ISO Data Path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupIsoDataPath {
    pub handle: BisHandle,
    pub direction: DataPathDirection,
    /// 0x00 = HCI; vendor paths are not supported
    pub data_path_id: u8,
}

/// LE Remove ISO Data Path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveIsoDataPath {
    pub handle: BisHandle,
    pub direction: DataPathDirection,
}

/// Payload generated by ISO test mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestPayloadType {
    /// Zero-length SDUs
    ZeroLength,
    /// Length varies per SDU between 4 bytes and Max_SDU
    Variable,
    /// Every SDU is Max_SDU bytes
    Maximum,
}

/// Counters reported by LE ISO Read Test Counters and LE ISO Test End
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestCounters {
    pub received: u32,
    pub missed: u32,
    pub failed: u32,
}
