//! Handles and lifecycle states

use serde::{Deserialize, Serialize};

use crate::pool::Handle;

/// Connection handle base of broadcast BISes
const BIS_TX_HANDLE_BASE: u16 = 0x0100;
/// Connection handle base of synchronized BISes
const BIS_RX_HANDLE_BASE: u16 = 0x0200;

/// Slot of a broadcast BIG in the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BigSlot(pub(crate) Handle);

/// Slot of a BIG sync in the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncSlot(pub(crate) Handle);

/// Which side of the broadcast a BIS belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BisRole {
    Broadcast,
    Synchronized,
}

/// Handle of a BIS, valid until its BIG or sync is freed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BisHandle {
    pub(crate) role: BisRole,
    pub(crate) slot: Handle,
}

impl BisHandle {
    pub fn role(&self) -> BisRole {
        self.role
    }

    /// HCI connection handle for this BIS
    pub fn conn_handle(&self) -> u16 {
        let base = match self.role {
            BisRole::Broadcast => BIS_TX_HANDLE_BASE,
            BisRole::Synchronized => BIS_RX_HANDLE_BASE,
        };
        base + self.slot.index()
    }
}

impl std::fmt::Display for BisHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.conn_handle())
    }
}

/// Lifecycle of a broadcast BIG
///
/// A free slot is the idle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BigState {
    /// Created, first event not yet transmitted
    Pending,
    /// Transmitting
    Active,
    /// Termination requested, freed after the current or next event
    Terminating,
}

/// Lifecycle of a BIG sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncState {
    /// Waiting for BIGInfo on the periodic advertising sync
    AwaitingBigInfo,
    /// Receive windows scheduled, nothing received yet
    Syncing,
    /// At least one PDU received
    Synchronized,
    /// Sync timed out
    Lost,
    /// Terminated by the host or by the broadcaster
    Terminated,
}

impl SyncState {
    /// Whether the sync has ended and its slot is about to be freed
    pub fn is_final(&self) -> bool {
        matches!(self, SyncState::Lost | SyncState::Terminated)
    }
}
