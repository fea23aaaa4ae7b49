//! ISOAL multiplexer (SDU → PDU)
//!
//! The broadcaster drives the mux once per BIS event:
//!
//! 1. [`IsoalMux::event_start`] fixes the set of SDUs the event may use.
//! 2. [`IsoalMux::get_pdu`] is called for every subevent; the same index
//!    returns the same payload for the whole event, so retransmissions and
//!    pre-transmissions can re-fetch freely.
//! 3. [`IsoalMux::event_done`] drops what the event actually carried.

use std::collections::VecDeque;

use iso_protocol::segment::{write_segment, SEGMENT_HEADER_LEN, TIME_OFFSET_LEN};
use iso_protocol::{FramingMode, Llid};
use tracing::{debug, warn};

use super::{IsoalConfig, IsoalPdu, MuxCompletion, Sdu};
use crate::error::IsoError;

/// Position in the SDU queue while packing framed PDUs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct FramedCursor {
    /// Queue index of the next SDU to write
    sdu: usize,
    /// Bytes of that SDU already written
    offset: usize,
    /// Its first segment has been written
    started: bool,
}

#[derive(Debug)]
pub struct IsoalMux {
    config: IsoalConfig,
    /// Unframed only; 0 in framed mode
    pdu_per_sdu: u8,
    queue: VecDeque<Sdu>,
    /// SDUs queued when the current event started
    eligible: usize,
    anchor_us: u64,
    /// Bit `i`: payload `i < bn` was fetched this event
    fetched: u32,
    /// Bit `i`: payload `i < bn` carried SDU data
    carried: u32,
    /// Framed: committed position at the start of the event
    front: FramedCursor,
    /// Framed: payloads built this event with the cursor after each
    framed: Vec<(IsoalPdu, FramedCursor)>,
}

impl IsoalMux {
    pub fn new(config: IsoalConfig) -> Result<Self, IsoError> {
        if config.bn == 0 || config.bn > 7 {
            return Err(IsoError::InvalidParameters(format!(
                "BN {} out of range",
                config.bn
            )));
        }
        if config.max_pdu == 0 {
            return Err(IsoError::InvalidParameters("max PDU is zero".into()));
        }
        let pdu_per_sdu = if config.is_framed() {
            if usize::from(config.max_pdu) <= SEGMENT_HEADER_LEN + TIME_OFFSET_LEN {
                return Err(IsoError::InvalidParameters(format!(
                    "max PDU {} cannot hold a framed segment",
                    config.max_pdu
                )));
            }
            0
        } else {
            config.pdu_per_sdu()?
        };

        Ok(Self {
            config,
            pdu_per_sdu,
            queue: VecDeque::with_capacity(config.max_sdu_queue),
            eligible: 0,
            anchor_us: 0,
            fetched: 0,
            carried: 0,
            front: FramedCursor::default(),
            framed: Vec::new(),
        })
    }

    pub fn config(&self) -> &IsoalConfig {
        &self.config
    }

    pub fn pdu_per_sdu(&self) -> u8 {
        self.pdu_per_sdu
    }

    /// SDUs waiting, including any partially sent framed SDU
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn enqueue_sdu(&mut self, sdu: Sdu) -> Result<(), IsoError> {
        if self.queue.len() >= self.config.max_sdu_queue {
            return Err(IsoError::SduQueueFull(self.config.max_sdu_queue));
        }
        self.queue.push_back(sdu);
        Ok(())
    }

    /// Begin an event anchored at `anchor_us`
    ///
    /// SDUs enqueued after this call wait for the next event.
    pub fn event_start(&mut self, anchor_us: u64) {
        self.anchor_us = anchor_us;
        self.eligible = self.queue.len();
        self.fetched = 0;
        self.carried = 0;
    }

    /// Payload for payload index `index` of the current event
    ///
    /// Indices `>= bn` address payloads of later events (pre-transmission).
    pub fn get_pdu(&mut self, index: usize) -> IsoalPdu {
        let pdu = if self.config.is_framed() {
            self.framed_pdu(index)
        } else {
            self.unframed_pdu(index)
        };
        if index < usize::from(self.config.bn) {
            self.fetched |= 1 << index;
            if !pdu.is_padding() {
                self.carried |= 1 << index;
            }
        }
        pdu
    }

    /// Commit what was fetched for payloads `0..bn`
    pub fn event_done(&mut self) -> MuxCompletion {
        if self.fetched == 0 {
            return MuxCompletion::default();
        }
        let last = (31 - self.fetched.leading_zeros()) as usize;
        let sdus_completed = if self.config.is_framed() {
            self.commit_framed(last)
        } else {
            self.commit_unframed(last)
        };
        let completion = MuxCompletion {
            pdus_with_payload: self.carried.count_ones() as usize,
            sdus_completed,
        };
        self.fetched = 0;
        self.carried = 0;
        self.eligible = 0;
        completion
    }

    /// The event starting at `anchor_us` will not be transmitted
    ///
    /// Its SDUs are flushed as if sent.
    pub fn event_skipped(&mut self, anchor_us: u64) -> MuxCompletion {
        self.event_start(anchor_us);
        for index in 0..usize::from(self.config.bn) {
            self.get_pdu(index);
        }
        let completion = self.event_done();
        if completion.sdus_completed > 0 {
            debug!(
                flushed = completion.sdus_completed,
                "SDUs flushed for skipped event"
            );
        }
        MuxCompletion {
            pdus_with_payload: 0,
            ..completion
        }
    }

    /// Slot `index` holds fragment `index % pps` of queued SDU `index / pps`.
    /// The queue only ever loses its front, so a pre-transmitted slot carries
    /// the same bytes when its own event sends it; a slot whose SDU is not
    /// queued yet goes out as padding and is filled by a later event.
    fn unframed_pdu(&self, index: usize) -> IsoalPdu {
        let pps = usize::from(self.pdu_per_sdu);
        let sdu_index = index / pps;
        let fragment = index % pps;
        if sdu_index >= self.eligible {
            return IsoalPdu::padding();
        }
        let Some(sdu) = self.queue.get(sdu_index) else {
            return IsoalPdu::padding();
        };

        let max_pdu = usize::from(self.config.max_pdu);
        let len = sdu.data.len();
        let start = fragment * max_pdu;
        if start > len || (start == len && fragment > 0) {
            return IsoalPdu::padding();
        }
        let end = (start + max_pdu).min(len);
        // Known truncation: the last slot is marked complete even when bytes
        // remain; see commit_unframed.
        let complete = end == len || fragment + 1 == pps;
        IsoalPdu {
            llid: if complete {
                Llid::UnframedEnd
            } else {
                Llid::UnframedContinuation
            },
            payload: sdu.data[start..end].to_vec(),
        }
    }

    fn commit_unframed(&mut self, last: usize) -> usize {
        let pps = usize::from(self.pdu_per_sdu);
        let slots = last / pps + 1;
        let done = slots.min(self.eligible).min(self.queue.len());
        let capacity = pps * usize::from(self.config.max_pdu);
        for sdu in self.queue.drain(..done) {
            if sdu.data.len() > capacity {
                warn!(
                    sequence = sdu.sequence,
                    len = sdu.data.len(),
                    capacity,
                    "SDU truncated to fit its PDU slots"
                );
            }
        }
        done
    }

    fn framed_pdu(&mut self, index: usize) -> IsoalPdu {
        while self.framed.len() <= index {
            let cursor = self.framed.last().map(|(_, c)| *c).unwrap_or(self.front);
            let built = self.build_framed(self.framed.len(), cursor);
            self.framed.push(built);
        }
        self.framed[index].0.clone()
    }

    fn build_framed(&self, index: usize, mut cursor: FramedCursor) -> (IsoalPdu, FramedCursor) {
        let events_ahead = (index / usize::from(self.config.bn)) as u64;
        let anchor = self.anchor_us + events_ahead * u64::from(self.config.iso_interval_us);
        let max_pdu = usize::from(self.config.max_pdu);
        let mut payload = Vec::with_capacity(max_pdu);

        while cursor.sdu < self.eligible {
            let Some(sdu) = self.queue.get(cursor.sdu) else {
                break;
            };
            let first = !cursor.started;
            let overhead = SEGMENT_HEADER_LEN + if first { TIME_OFFSET_LEN } else { 0 };
            let space = max_pdu - payload.len();
            if space < overhead {
                break;
            }
            let remaining = sdu.data.len() - cursor.offset;
            let room = space - overhead;
            if remaining > 0 && room == 0 {
                break;
            }
            if first
                && self.config.framing_mode == FramingMode::Unsegmented
                && !payload.is_empty()
                && remaining > room
                && remaining + overhead <= max_pdu
            {
                // fits whole in the next PDU
                break;
            }

            let take = remaining.min(room);
            let cmplt = take == remaining;
            let time_offset = first.then(|| anchor.saturating_sub(sdu.timestamp_us));
            write_segment(
                &mut payload,
                cmplt,
                time_offset,
                &sdu.data[cursor.offset..cursor.offset + take],
            );
            if cmplt {
                cursor = FramedCursor {
                    sdu: cursor.sdu + 1,
                    offset: 0,
                    started: false,
                };
            } else {
                cursor.offset += take;
                cursor.started = true;
                break;
            }
        }

        (
            IsoalPdu {
                llid: Llid::Framed,
                payload,
            },
            cursor,
        )
    }

    fn commit_framed(&mut self, last: usize) -> usize {
        let bn = usize::from(self.config.bn);
        let Some(&(_, committed)) = self.framed.get(last) else {
            return 0;
        };
        let done = committed.sdu.min(self.queue.len());
        self.queue.drain(..done);

        // Payloads built for later events are kept: pre-transmitted copies
        // must match what the later event sends.
        let carry = if last + 1 == bn && self.framed.len() > bn {
            self.framed
                .split_off(bn)
                .into_iter()
                .map(|(pdu, c)| {
                    (
                        pdu,
                        FramedCursor {
                            sdu: c.sdu.saturating_sub(done),
                            ..c
                        },
                    )
                })
                .collect()
        } else {
            Vec::new()
        };
        self.framed = carry;
        self.front = FramedCursor {
            sdu: 0,
            ..committed
        };
        done
    }
}
