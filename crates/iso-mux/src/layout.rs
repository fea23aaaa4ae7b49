//! Timing layout of a BIG event
//!
//! Subevent `s` (0-based) of the BIS at position `b` (0-based) starts at
//! `b * bis_spacing + s * sub_interval` after the anchor. Sequential and
//! interleaved packing only differ in how the two spacings are chosen, so
//! both roles walk subevents in offset order.

use iso_protocol::timing::{iso_interval_us, T_MSS_US};
use iso_protocol::{Framing, Phy};

use crate::hci::Packing;

/// Largest BIG control PDU payload (CHANNEL_MAP_IND)
const MAX_CONTROL_PAYLOAD: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLayout {
    pub num_bis: u8,
    pub nse: u8,
    pub bn: u8,
    pub irc: u8,
    pub pto: u8,
    pub phy: Phy,
    /// ISO interval in units of 1.25 ms
    pub iso_interval: u16,
    pub sub_interval_us: u32,
    pub bis_spacing_us: u32,
    /// Air time of a maximum size PDU
    pub mpt_us: u32,
    /// Extra payload bytes per PDU (MIC)
    pub payload_overhead: usize,
}

impl EventLayout {
    /// Layout chosen by a broadcaster for the given packing
    #[allow(clippy::too_many_arguments)]
    pub fn for_packing(
        num_bis: u8,
        nse: u8,
        bn: u8,
        irc: u8,
        pto: u8,
        phy: Phy,
        iso_interval: u16,
        max_pdu: u8,
        payload_overhead: usize,
        packing: Packing,
    ) -> Self {
        let mpt_us = phy.pdu_air_time_us(usize::from(max_pdu) + payload_overhead);
        let (sub_interval_us, bis_spacing_us) = match packing {
            Packing::Sequential => {
                let sub = mpt_us + T_MSS_US;
                (sub, u32::from(nse) * sub)
            }
            Packing::Interleaved => {
                let spacing = mpt_us + T_MSS_US;
                (u32::from(num_bis) * spacing, spacing)
            }
        };
        Self {
            num_bis,
            nse,
            bn,
            irc,
            pto,
            phy,
            iso_interval,
            sub_interval_us,
            bis_spacing_us,
            mpt_us,
            payload_overhead,
        }
    }

    pub fn iso_interval_us(&self) -> u32 {
        iso_interval_us(self.iso_interval)
    }

    /// Group count, `NSE / BN`
    pub fn gc(&self) -> u8 {
        self.nse / self.bn.max(1)
    }

    /// Time from the anchor to the end of the last BIS subevent
    pub fn sync_delay_us(&self) -> u32 {
        u32::from(self.num_bis.saturating_sub(1)) * self.bis_spacing_us
            + u32::from(self.nse.saturating_sub(1)) * self.sub_interval_us
            + self.mpt_us
    }

    /// Offset of subevent `se` of the BIS at position `bis_index`
    pub fn subevent_offset_us(&self, bis_index: usize, se: u8) -> u32 {
        bis_index as u32 * self.bis_spacing_us + u32::from(se) * self.sub_interval_us
    }

    /// Offset of the BIG control subevent
    pub fn control_offset_us(&self) -> u32 {
        self.sync_delay_us() + T_MSS_US
    }

    /// Air time of the largest control PDU
    pub fn control_air_time_us(&self) -> u32 {
        self.phy
            .pdu_air_time_us(MAX_CONTROL_PAYLOAD + self.payload_overhead)
    }

    /// Air time reserved for an event
    pub fn event_duration_us(&self, with_control: bool) -> u32 {
        if with_control {
            self.control_offset_us() + self.control_air_time_us()
        } else {
            self.sync_delay_us()
        }
    }

    /// Payload index carried by subevent `se` of a BIS event
    ///
    /// The first `IRC` groups repeat the current payloads; later groups carry
    /// payloads `PTO` events ahead per group.
    pub fn pdu_index(&self, se: u8) -> usize {
        let bn = usize::from(self.bn.max(1));
        let n = usize::from(se) % bn;
        let g = usize::from(se) / bn;
        let irc = usize::from(self.irc);
        if g < irc {
            n
        } else {
            bn * usize::from(self.pto) * (g - irc + 1) + n
        }
    }

    /// Subevents of the given BIS positions, in air order
    pub fn subevent_order(&self, bis_positions: &[usize]) -> Vec<(usize, u8)> {
        let mut order: Vec<(usize, u8)> = bis_positions
            .iter()
            .flat_map(|&b| (0..self.nse).map(move |se| (b, se)))
            .collect();
        order.sort_by_key(|&(b, se)| (self.subevent_offset_us(b, se), b));
        order
    }

    /// Transport latency for the given framing and SDU interval
    pub fn transport_latency_us(&self, framing: Framing, sdu_interval_us: u32) -> u32 {
        let iso = self.iso_interval_us();
        let extra = u32::from(self.pto) * u32::from(self.gc().saturating_sub(self.irc));
        match framing {
            Framing::Unframed => (self.sync_delay_us() + (extra + 1) * iso).saturating_sub(sdu_interval_us),
            Framing::Framed => self.sync_delay_us() + extra * iso + iso + sdu_interval_us,
        }
    }
}
