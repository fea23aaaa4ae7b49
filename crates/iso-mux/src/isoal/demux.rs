//! ISOAL demultiplexer (PDU → SDU)
//!
//! The receiver stores each payload it catches with [`IsoalDemux::put_pdu`].
//! [`IsoalDemux::event_done`] reassembles the SDUs of the event's first BN
//! payloads and shifts pre-transmitted payloads toward the event they
//! belong to.

use iso_protocol::segment::{segments, Segment};
use iso_protocol::Llid;
use tracing::{debug, trace};

use super::{IsoalConfig, ReceivedSdu, SduStatus};
use crate::error::IsoError;

#[derive(Debug, Clone)]
struct RxSlot {
    llid: Llid,
    payload: Vec<u8>,
    malformed: bool,
}

#[derive(Debug)]
struct PartialSdu {
    data: Vec<u8>,
    timestamp_us: u64,
    errors: bool,
}

#[derive(Debug)]
pub struct IsoalDemux {
    config: IsoalConfig,
    pdu_per_sdu: u8,
    /// Payload indices accepted per event
    limit: usize,
    slots: Vec<Option<RxSlot>>,
    anchor_us: u64,
    sequence: u16,
    /// Framed SDU under reassembly
    partial: Option<PartialSdu>,
}

impl IsoalDemux {
    /// Demux for a BIS with `nse` subevents per event
    pub fn new(config: IsoalConfig, nse: u8) -> Result<Self, IsoError> {
        if config.bn == 0 || nse < config.bn {
            return Err(IsoError::InvalidParameters(format!(
                "NSE {nse} smaller than BN {}",
                config.bn
            )));
        }
        let pdu_per_sdu = if config.is_framed() {
            0
        } else {
            config.pdu_per_sdu()?
        };
        let bn = usize::from(config.bn);
        let gc = usize::from(nse) / bn;
        let limit = (bn * usize::from(nse)).max(bn * (1 + usize::from(config.pto) * gc));

        Ok(Self {
            config,
            pdu_per_sdu,
            limit,
            slots: vec![None; limit],
            anchor_us: 0,
            sequence: 0,
            partial: None,
        })
    }

    pub fn config(&self) -> &IsoalConfig {
        &self.config
    }

    /// Payload indices accepted per event
    pub fn index_limit(&self) -> usize {
        self.limit
    }

    pub fn event_start(&mut self, anchor_us: u64) {
        self.anchor_us = anchor_us;
    }

    /// Whether payload `index` has already been received this event
    pub fn has_pdu(&self, index: usize) -> bool {
        matches!(self.slots.get(index), Some(Some(slot)) if !slot.malformed)
    }

    /// Store a received payload
    ///
    /// The first copy of an index wins. A malformed payload is kept as a
    /// corrupt slot so the SDU it belongs to is reported with errors.
    /// Unframed padding is not stored: a pre-transmitted slot goes out as
    /// padding when its SDU is late, and the data follows under the same
    /// index in a later subevent.
    pub fn put_pdu(&mut self, index: usize, payload: &[u8], llid: Llid) -> Result<(), IsoError> {
        if index >= self.limit {
            return Err(IsoError::UnexpectedIndex {
                index,
                limit: self.limit,
            });
        }
        if !self.config.is_framed() && llid == Llid::UnframedContinuation && payload.is_empty() {
            trace!(index, "padding ignored");
            return Ok(());
        }
        if self.has_pdu(index) {
            trace!(index, "duplicate payload ignored");
            return Ok(());
        }

        let malformed = !self.well_formed(payload, llid);
        self.slots[index] = Some(RxSlot {
            llid,
            payload: payload.to_vec(),
            malformed,
        });
        if malformed {
            return Err(IsoError::MalformedPdu { index });
        }
        Ok(())
    }

    fn well_formed(&self, payload: &[u8], llid: Llid) -> bool {
        if payload.len() > usize::from(self.config.max_pdu) {
            return false;
        }
        if self.config.is_framed() {
            llid == Llid::Framed && segments(payload).all(|s| s.is_ok())
        } else {
            matches!(llid, Llid::UnframedEnd | Llid::UnframedContinuation)
        }
    }

    /// Reassemble the SDUs of the current event
    pub fn event_done(&mut self) -> Vec<ReceivedSdu> {
        let sdus = if self.config.is_framed() {
            self.reassemble_framed()
        } else {
            self.reassemble_unframed()
        };

        let bn = usize::from(self.config.bn);
        self.slots.drain(..bn);
        self.slots.resize_with(self.limit, || None);
        sdus
    }

    fn next_sequence(&mut self) -> u16 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }

    fn reassemble_unframed(&mut self) -> Vec<ReceivedSdu> {
        let pps = usize::from(self.pdu_per_sdu);
        let groups = usize::from(self.config.bn) / pps;
        let mut sdus = Vec::with_capacity(groups);

        for group in 0..groups {
            let mut data = Vec::new();
            let mut complete = false;
            let mut gap = false;
            let mut carried = false;

            for slot in &self.slots[group * pps..(group + 1) * pps] {
                match slot {
                    Some(slot) if !slot.malformed => {
                        if complete {
                            continue;
                        }
                        data.extend_from_slice(&slot.payload);
                        if slot.llid == Llid::UnframedEnd {
                            complete = true;
                            carried = true;
                        } else if !slot.payload.is_empty() {
                            carried = true;
                        }
                    }
                    _ => {
                        if !complete {
                            gap = true;
                        }
                    }
                }
            }

            let status = if !carried {
                SduStatus::Lost
            } else if complete && !gap {
                SduStatus::Valid
            } else {
                SduStatus::Errors
            };
            if status == SduStatus::Lost {
                data.clear();
            }
            let timestamp_us =
                self.anchor_us + group as u64 * u64::from(self.config.sdu_interval_us);
            let sequence = self.next_sequence();
            sdus.push(ReceivedSdu {
                data,
                timestamp_us,
                sequence,
                status,
            });
        }
        sdus
    }

    fn reassemble_framed(&mut self) -> Vec<ReceivedSdu> {
        let mut sdus = Vec::new();
        for index in 0..usize::from(self.config.bn) {
            let Some(slot) = self.slots[index].take() else {
                if let Some(partial) = self.partial.as_mut() {
                    partial.errors = true;
                }
                continue;
            };
            for segment in segments(&slot.payload) {
                match segment {
                    Ok(segment) => self.framed_segment(&segment, &mut sdus),
                    Err(err) => {
                        debug!(index, %err, "discarding SDU under reassembly");
                        if let Some(partial) = self.partial.take() {
                            self.emit(partial, SduStatus::Errors, &mut sdus);
                        }
                        break;
                    }
                }
            }
        }
        sdus
    }

    fn framed_segment(&mut self, segment: &Segment<'_>, sdus: &mut Vec<ReceivedSdu>) {
        if let Some(offset) = segment.time_offset {
            if let Some(unfinished) = self.partial.take() {
                self.emit(unfinished, SduStatus::Errors, sdus);
            }
            self.partial = Some(PartialSdu {
                data: segment.data.to_vec(),
                timestamp_us: self.anchor_us.saturating_sub(offset.into()),
                errors: false,
            });
        } else if let Some(partial) = self.partial.as_mut() {
            partial.data.extend_from_slice(segment.data);
        } else {
            trace!("continuation segment without a start");
            return;
        }

        if segment.header.cmplt {
            if let Some(done) = self.partial.take() {
                let status = if done.errors {
                    SduStatus::Errors
                } else {
                    SduStatus::Valid
                };
                self.emit(done, status, sdus);
            }
        }
    }

    fn emit(&mut self, partial: PartialSdu, status: SduStatus, sdus: &mut Vec<ReceivedSdu>) {
        let sequence = self.next_sequence();
        sdus.push(ReceivedSdu {
            data: partial.data,
            timestamp_us: partial.timestamp_us,
            sequence,
            status,
        });
    }
}
