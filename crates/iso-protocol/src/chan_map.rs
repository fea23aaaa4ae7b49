//! Data channel map
//!
//! A 37-bit set of the RF data channels a BIG may hop on, with its
//! cardinality cached.

use crate::error::ParseError;

/// Number of LE data channels
pub const NUM_DATA_CHANNELS: u8 = 37;

/// Minimum number of used channels in any map
pub const MIN_USED_CHANNELS: u8 = 2;

const CHANNEL_MASK: u64 = (1 << NUM_DATA_CHANNELS) - 1;

/// Set of used data channels (bit `n` = channel `n`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelMap {
    bits: u64,
    used: u8,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self::all()
    }
}

impl ChannelMap {
    /// Map with all 37 data channels in use
    pub fn all() -> Self {
        Self {
            bits: CHANNEL_MASK,
            used: NUM_DATA_CHANNELS,
        }
    }

    /// Build a map from its bit representation
    ///
    /// Bits above channel 36 must be clear and at least two channels must
    /// be used.
    pub fn from_bits(bits: u64) -> Result<Self, ParseError> {
        if bits & !CHANNEL_MASK != 0 {
            return Err(ParseError::Reserved {
                field: "channel map",
                value: (bits >> NUM_DATA_CHANNELS) as u32,
            });
        }
        let used = bits.count_ones() as u8;
        if used < MIN_USED_CHANNELS {
            return Err(ParseError::InvalidField {
                field: "channel map",
                value: used.into(),
            });
        }
        Ok(Self { bits, used })
    }

    /// Build a map from the listed channel indices
    pub fn from_channels(channels: &[u8]) -> Result<Self, ParseError> {
        let mut bits = 0u64;
        for &ch in channels {
            if ch >= NUM_DATA_CHANNELS {
                return Err(ParseError::InvalidField {
                    field: "channel index",
                    value: ch.into(),
                });
            }
            bits |= 1 << ch;
        }
        Self::from_bits(bits)
    }

    /// Decode the 5-byte little-endian ChM field
    ///
    /// The three most significant bits are reserved for future use and ignored.
    pub fn from_bytes(bytes: &[u8; 5]) -> Result<Self, ParseError> {
        let mut raw = [0u8; 8];
        raw[..5].copy_from_slice(bytes);
        Self::from_bits(u64::from_le_bytes(raw) & CHANNEL_MASK)
    }

    /// Encode as the 5-byte little-endian ChM field
    pub fn to_bytes(&self) -> [u8; 5] {
        let raw = self.bits.to_le_bytes();
        [raw[0], raw[1], raw[2], raw[3], raw[4]]
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// Number of used channels
    pub fn used_count(&self) -> u8 {
        self.used
    }

    pub fn is_used(&self, channel: u8) -> bool {
        channel < NUM_DATA_CHANNELS && self.bits & (1 << channel) != 0
    }

    /// Position of a used channel among the used channels, in ascending order
    pub fn used_index(&self, channel: u8) -> u8 {
        let below = self.bits & ((1u64 << channel) - 1);
        below.count_ones() as u8
    }

    /// The `remap_idx`-th used channel, in ascending order
    pub fn remap(&self, remap_idx: u8) -> u8 {
        let mut remaining = remap_idx;
        for ch in 0..NUM_DATA_CHANNELS {
            if self.bits & (1 << ch) != 0 {
                if remaining == 0 {
                    return ch;
                }
                remaining -= 1;
            }
        }
        // remap_idx is always reduced modulo used_count by the callers
        debug_assert!(false, "remap index {remap_idx} out of range");
        0
    }

    /// Iterate the used channels in ascending order
    pub fn iter_used(&self) -> impl Iterator<Item = u8> + '_ {
        (0..NUM_DATA_CHANNELS).filter(move |&ch| self.bits & (1 << ch) != 0)
    }

    /// Intersection of two maps, if it still holds enough channels
    pub fn intersect(&self, other: &ChannelMap) -> Option<ChannelMap> {
        Self::from_bits(self.bits & other.bits).ok()
    }
}
