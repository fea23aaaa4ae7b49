//! Virtual radio
//!
//! A [`Radio`] with one operation in flight at a time. Transmissions are
//! placed in an outbox for the simulated air; receptions wait there until
//! the simulation resolves them against what was transmitted.

use iso_mux::{Radio, RadioError, RxRequest, TxRequest};
use iso_protocol::pdu::BIS_HEADER_LEN;
use iso_protocol::Phy;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// A packet put on the air by a virtual radio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AirPacket {
    pub channel: u8,
    pub access_address: u32,
    pub crc_init: u32,
    pub start_us: u64,
    pub end_us: u64,
    /// Header and payload
    pub pdu: Vec<u8>,
}

/// Operation the radio is currently busy with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOp {
    Tx {
        end_us: u64,
    },
    Rx {
        channel: u8,
        access_address: u32,
        crc_init: u32,
        start_us: u64,
        window_us: u32,
    },
}

impl PendingOp {
    /// End of the receive window; `None` for a transmission
    pub fn window_end_us(&self) -> Option<u64> {
        match self {
            PendingOp::Rx {
                start_us,
                window_us,
                ..
            } => Some(start_us + u64::from(*window_us)),
            PendingOp::Tx { .. } => None,
        }
    }
}

/// Every operation the radio accepted, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioOp {
    Tx(AirPacket),
    Rx {
        channel: u8,
        access_address: u32,
        start_us: u64,
        window_us: u32,
    },
}

/// Simulated radio driven by a [`BroadcastSimulation`](crate::BroadcastSimulation)
#[derive(Debug)]
pub struct VirtualRadio {
    phy: Phy,
    /// Simulation time at the last engine call
    now_us: u64,
    channel: u8,
    access_address: u32,
    crc_init: u32,
    /// Armed by `enable_wait_for_response`, consumed by the next receive
    wfr_timeout_us: Option<u32>,
    pending: Option<PendingOp>,
    outbox: Vec<AirPacket>,
    history: Vec<RadioOp>,
}

impl VirtualRadio {
    pub fn new(phy: Phy) -> Self {
        Self {
            phy,
            now_us: 0,
            channel: 0,
            access_address: 0,
            crc_init: 0,
            wfr_timeout_us: None,
            pending: None,
            outbox: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn phy(&self) -> Phy {
        self.phy
    }

    pub fn set_phy(&mut self, phy: Phy) {
        self.phy = phy;
    }

    /// Advance the radio's notion of the current time
    pub fn set_time(&mut self, now_us: u64) {
        self.now_us = now_us;
    }

    pub fn pending(&self) -> Option<&PendingOp> {
        self.pending.as_ref()
    }

    /// Complete the outstanding operation
    pub fn take_pending(&mut self) -> Option<PendingOp> {
        self.pending.take()
    }

    /// Packets transmitted since the last call
    pub fn take_transmitted(&mut self) -> Vec<AirPacket> {
        std::mem::take(&mut self.outbox)
    }

    pub fn history(&self) -> &[RadioOp] {
        &self.history
    }

    /// Transmitted packets on the given access address
    pub fn sent_on(&self, access_address: u32) -> impl Iterator<Item = &AirPacket> + '_ {
        self.history.iter().filter_map(move |op| match op {
            RadioOp::Tx(packet) if packet.access_address == access_address => Some(packet),
            _ => None,
        })
    }

    pub fn tx_count(&self) -> usize {
        self.history
            .iter()
            .filter(|op| matches!(op, RadioOp::Tx(_)))
            .count()
    }

    fn check_start(&self, start_us: u64) -> Result<(), RadioError> {
        if self.pending.is_some() {
            return Err(RadioError::Busy);
        }
        if start_us < self.now_us {
            return Err(RadioError::TooLate(start_us));
        }
        Ok(())
    }
}

impl Radio for VirtualRadio {
    fn set_channel(&mut self, channel_index: u8, access_address: u32, crc_init: u32) {
        self.channel = channel_index;
        self.access_address = access_address;
        self.crc_init = crc_init;
    }

    fn transmit(&mut self, request: TxRequest) -> Result<(), RadioError> {
        self.check_start(request.start_us)?;
        let payload_len = request.pdu.len().saturating_sub(BIS_HEADER_LEN);
        let end_us = request.start_us + u64::from(self.phy.pdu_air_time_us(payload_len));
        let packet = AirPacket {
            channel: self.channel,
            access_address: self.access_address,
            crc_init: self.crc_init,
            start_us: request.start_us,
            end_us,
            pdu: request.pdu,
        };
        trace!(
            channel = packet.channel,
            start_us = packet.start_us,
            len = packet.pdu.len(),
            "virtual radio transmit"
        );
        self.history.push(RadioOp::Tx(packet.clone()));
        self.outbox.push(packet);
        self.pending = Some(PendingOp::Tx { end_us });
        Ok(())
    }

    fn receive(&mut self, request: RxRequest) -> Result<(), RadioError> {
        self.check_start(request.start_us)?;
        let window_us = self.wfr_timeout_us.take().unwrap_or(request.window_us);
        self.history.push(RadioOp::Rx {
            channel: self.channel,
            access_address: self.access_address,
            start_us: request.start_us,
            window_us,
        });
        self.pending = Some(PendingOp::Rx {
            channel: self.channel,
            access_address: self.access_address,
            crc_init: self.crc_init,
            start_us: request.start_us,
            window_us,
        });
        Ok(())
    }

    fn enable_wait_for_response(&mut self, timeout_us: u32) {
        self.wfr_timeout_us = Some(timeout_us);
    }

    fn disable(&mut self) {
        self.pending = None;
        self.wfr_timeout_us = None;
    }
}
