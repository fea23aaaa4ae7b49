//! Channel Selection Algorithm #2 with the isochronous subevent extension
//!
//! Every BIS (and the BIG control link) hops independently, keyed by a
//! channel identifier derived from its access address. The event channel
//! depends only on the event counter; each further subevent channel is
//! derived from the previous subevent's state, so subevents must be walked
//! in order even when a receiver skips some of them.

use crate::chan_map::{ChannelMap, NUM_DATA_CHANNELS};
use tracing::trace;

/// Reverse the bit order within each byte of `v`
fn perm(v: u16) -> u16 {
    let [hi, lo] = v.to_be_bytes();
    u16::from_be_bytes([hi.reverse_bits(), lo.reverse_bits()])
}

/// Multiply, add and modulo 2^16
fn mam(a: u16, b: u16) -> u16 {
    a.wrapping_mul(17).wrapping_add(b)
}

/// Channel identifier for an access address
pub fn channel_identifier(access_address: u32) -> u16 {
    ((access_address >> 16) ^ (access_address & 0xFFFF)) as u16
}

/// Running hop state of one link within an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelHop {
    pub prn_sub_lu: u16,
    pub remap_idx: u8,
}

/// Result of selecting the first channel of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventChannel {
    pub channel_index: u8,
    pub prn_sub_lu: u16,
    pub remap_idx: u8,
}

impl EventChannel {
    /// Hop state to feed into [`next_subevent_channel`]
    pub fn hop(&self) -> ChannelHop {
        ChannelHop {
            prn_sub_lu: self.prn_sub_lu,
            remap_idx: self.remap_idx,
        }
    }
}

/// Channel of the first subevent of the event with the given counter
pub fn next_event_channel(counter: u16, channel_id: u16, chan_map: &ChannelMap) -> EventChannel {
    let mut prn_s = counter ^ channel_id;
    for _ in 0..3 {
        prn_s = mam(perm(prn_s), channel_id);
    }
    let prn_e = prn_s ^ channel_id;

    let unmapped = (prn_e % u16::from(NUM_DATA_CHANNELS)) as u8;
    let (channel_index, remap_idx) = if chan_map.is_used(unmapped) {
        (unmapped, chan_map.used_index(unmapped))
    } else {
        let n = u32::from(chan_map.used_count());
        let remap_idx = ((n * u32::from(prn_e)) >> 16) as u8;
        (chan_map.remap(remap_idx), remap_idx)
    };

    trace!(
        counter,
        channel_id,
        channel_index,
        remap_idx,
        "event channel selected"
    );

    EventChannel {
        channel_index,
        prn_sub_lu: prn_s,
        remap_idx,
    }
}

/// Channel of the subevent following the one described by `hop`
///
/// `hop` is advanced in place.
pub fn next_subevent_channel(channel_id: u16, hop: &mut ChannelHop, chan_map: &ChannelMap) -> u8 {
    hop.prn_sub_lu = mam(perm(hop.prn_sub_lu), channel_id);
    let prn_sub_se = u32::from(hop.prn_sub_lu ^ channel_id);

    let n = i32::from(chan_map.used_count());
    let d = 1.max((n - 5).min(3).max(((n - 10) / 2).min(11)));
    let span = (n - 2 * d + 1) as u32;
    let step = d as u32 + ((prn_sub_se * span) >> 16);
    hop.remap_idx = ((u32::from(hop.remap_idx) + step) % n as u32) as u8;

    let channel_index = chan_map.remap(hop.remap_idx);
    trace!(channel_id, channel_index, remap_idx = hop.remap_idx, "subevent channel selected");
    channel_index
}
