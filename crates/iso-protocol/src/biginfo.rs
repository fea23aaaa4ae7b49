//! BIGInfo codec
//!
//! BIGInfo is carried in the ACAD of periodic advertising and tells a
//! receiver everything it needs to synchronize to a BIG. It is 33 bytes for
//! unencrypted BIGs and 57 bytes (GIV and GSKD appended) for encrypted ones.
//!
//! Layout (little-endian, bit offsets within each group):
//!
//! | bytes  | content                                                          |
//! |--------|------------------------------------------------------------------|
//! | 0..4   | BIG_Offset:14, BIG_Offset_Units:1, ISO_Interval:12, Num_BIS:5     |
//! | 4      | NSE:5, BN:3                                                      |
//! | 5..8   | Sub_Interval:20, PTO:4                                           |
//! | 8..11  | BIS_Spacing:20, IRC:4                                            |
//! | 11     | Max_PDU                                                          |
//! | 12     | RFU:7, Framing_Mode:1                                            |
//! | 13..17 | Seed Access Address                                              |
//! | 17..21 | SDU_Interval:20, Max_SDU:12                                      |
//! | 21..23 | BaseCRCInit                                                      |
//! | 23..28 | ChM:37, PHY:3                                                    |
//! | 28..33 | bisPayloadCount:39, Framing:1                                    |
//! | 33..41 | GIV (encrypted only)                                             |
//! | 41..57 | GSKD (encrypted only)                                            |

use crate::chan_map::ChannelMap;
use crate::error::ParseError;
use crate::timing::Phy;
use crate::{DecodePdu, EncodePdu, PAYLOAD_COUNTER_MASK};

/// Length of an unencrypted BIGInfo
pub const BIGINFO_LEN: usize = 33;
/// Length of an encrypted BIGInfo
pub const BIGINFO_ENCRYPTED_LEN: usize = 57;

const MAX_BIG_OFFSET: u16 = 0x3FFF;

/// Unit of the BIG_Offset field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OffsetUnits {
    Us30,
    Us300,
}

impl OffsetUnits {
    pub fn us(self) -> u32 {
        match self {
            OffsetUnits::Us30 => 30,
            OffsetUnits::Us300 => 300,
        }
    }

    /// Encode an offset, rounding down to the unit
    ///
    /// Returns the field value and unit. The encoded time is never later than
    /// `offset_us` and at most one unit earlier.
    pub fn encode_offset(offset_us: u32) -> (u16, OffsetUnits) {
        if offset_us < 30 * (u32::from(MAX_BIG_OFFSET) + 1) {
            ((offset_us / 30) as u16, OffsetUnits::Us30)
        } else {
            let value = (offset_us / 300).min(u32::from(MAX_BIG_OFFSET));
            (value as u16, OffsetUnits::Us300)
        }
    }
}

/// Whether SDUs are carried framed or unframed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Framing {
    #[default]
    Unframed,
    Framed,
}

/// How framed SDUs may be split across PDUs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FramingMode {
    /// SDUs may be segmented at any PDU boundary
    #[default]
    Segmentable,
    /// An SDU that fits an empty PDU is never split
    Unsegmented,
}

/// Key material advertised for encrypted BIGs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigInfoEncryption {
    pub giv: [u8; 8],
    pub gskd: [u8; 16],
}

/// Decoded BIGInfo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigInfo {
    pub big_offset: u16,
    pub offset_units: OffsetUnits,
    /// ISO interval in units of 1.25 ms
    pub iso_interval: u16,
    pub num_bis: u8,
    pub nse: u8,
    pub bn: u8,
    pub sub_interval_us: u32,
    pub pto: u8,
    pub bis_spacing_us: u32,
    pub irc: u8,
    pub max_pdu: u8,
    pub framing_mode: FramingMode,
    pub seed_access_address: u32,
    pub sdu_interval_us: u32,
    pub max_sdu: u16,
    pub base_crc_init: u16,
    pub channel_map: ChannelMap,
    pub phy: Phy,
    /// Payload counter of the first BIS PDU of the described event (39 bits)
    pub payload_count: u64,
    pub framing: Framing,
    pub encryption: Option<BigInfoEncryption>,
}

impl BigInfo {
    /// Offset from the periodic advertising packet to the BIG anchor
    pub fn offset_us(&self) -> u32 {
        u32::from(self.big_offset) * self.offset_units.us()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// Encoded length of this BIGInfo
    pub fn encoded_len(&self) -> usize {
        if self.is_encrypted() {
            BIGINFO_ENCRYPTED_LEN
        } else {
            BIGINFO_LEN
        }
    }
}

fn read_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn write_le(out: &mut Vec<u8>, value: u64, len: usize) {
    out.extend_from_slice(&value.to_le_bytes()[..len]);
}

fn check_range(field: &'static str, value: u32, min: u32, max: u32) -> Result<(), ParseError> {
    if value < min || value > max {
        return Err(ParseError::InvalidField { field, value });
    }
    Ok(())
}

impl EncodePdu for BigInfo {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());

        let units = match self.offset_units {
            OffsetUnits::Us30 => 0,
            OffsetUnits::Us300 => 1,
        };
        let word0 = u32::from(self.big_offset & MAX_BIG_OFFSET)
            | units << 14
            | u32::from(self.iso_interval & 0x0FFF) << 15
            | u32::from(self.num_bis & 0x1F) << 27;
        write_le(&mut out, word0.into(), 4);

        out.push((self.nse & 0x1F) | (self.bn & 0x07) << 5);
        let sub = (self.sub_interval_us & 0xF_FFFF) | u32::from(self.pto & 0x0F) << 20;
        write_le(&mut out, sub.into(), 3);
        let spacing = (self.bis_spacing_us & 0xF_FFFF) | u32::from(self.irc & 0x0F) << 20;
        write_le(&mut out, spacing.into(), 3);
        out.push(self.max_pdu);
        out.push(match self.framing_mode {
            FramingMode::Segmentable => 0x00,
            FramingMode::Unsegmented => 0x80,
        });
        write_le(&mut out, self.seed_access_address.into(), 4);
        let sdu = (self.sdu_interval_us & 0xF_FFFF) | u32::from(self.max_sdu & 0x0FFF) << 20;
        write_le(&mut out, sdu.into(), 4);
        write_le(&mut out, self.base_crc_init.into(), 2);
        let chm = self.channel_map.bits() | u64::from(self.phy.to_bits()) << 37;
        write_le(&mut out, chm, 5);
        let framed = match self.framing {
            Framing::Unframed => 0,
            Framing::Framed => 1u64 << 39,
        };
        write_le(&mut out, (self.payload_count & PAYLOAD_COUNTER_MASK) | framed, 5);

        if let Some(enc) = &self.encryption {
            out.extend_from_slice(&enc.giv);
            out.extend_from_slice(&enc.gskd);
        }
        out
    }
}

impl DecodePdu for BigInfo {
    fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() != BIGINFO_LEN && bytes.len() != BIGINFO_ENCRYPTED_LEN {
            return Err(ParseError::InvalidLength {
                expected: BIGINFO_LEN,
                actual: bytes.len(),
            });
        }

        let word0 = read_le(&bytes[0..4]) as u32;
        let big_offset = (word0 & 0x3FFF) as u16;
        let offset_units = if word0 & (1 << 14) != 0 {
            OffsetUnits::Us300
        } else {
            OffsetUnits::Us30
        };
        let iso_interval = ((word0 >> 15) & 0x0FFF) as u16;
        let num_bis = (word0 >> 27) as u8;
        let nse = bytes[4] & 0x1F;
        let bn = bytes[4] >> 5;
        let sub = read_le(&bytes[5..8]) as u32;
        let spacing = read_le(&bytes[8..11]) as u32;
        let max_pdu = bytes[11];
        let framing_mode = if bytes[12] & 0x80 != 0 {
            FramingMode::Unsegmented
        } else {
            FramingMode::Segmentable
        };
        let seed_access_address = read_le(&bytes[13..17]) as u32;
        let sdu = read_le(&bytes[17..21]) as u32;
        let base_crc_init = read_le(&bytes[21..23]) as u16;
        let chm = read_le(&bytes[23..28]);
        let count = read_le(&bytes[28..33]);

        check_range("ISO_Interval", iso_interval.into(), 4, 3200)?;
        check_range("Num_BIS", num_bis.into(), 1, 31)?;
        check_range("NSE", nse.into(), 1, 31)?;
        check_range("BN", bn.into(), 1, 7)?;
        check_range("IRC", sub_field(spacing, 20, 4), 1, 15)?;
        check_range("Max_PDU", max_pdu.into(), 0, 251)?;

        let channel_map = ChannelMap::from_bits(chm & ((1 << 37) - 1))?;
        let phy = Phy::from_bits((chm >> 37) as u8)?;

        let encryption = if bytes.len() == BIGINFO_ENCRYPTED_LEN {
            let mut giv = [0u8; 8];
            giv.copy_from_slice(&bytes[33..41]);
            let mut gskd = [0u8; 16];
            gskd.copy_from_slice(&bytes[41..57]);
            Some(BigInfoEncryption { giv, gskd })
        } else {
            None
        };

        Ok(BigInfo {
            big_offset,
            offset_units,
            iso_interval,
            num_bis,
            nse,
            bn,
            sub_interval_us: sub & 0xF_FFFF,
            pto: sub_field(sub, 20, 4) as u8,
            bis_spacing_us: spacing & 0xF_FFFF,
            irc: sub_field(spacing, 20, 4) as u8,
            max_pdu,
            framing_mode,
            seed_access_address,
            sdu_interval_us: sdu & 0xF_FFFF,
            max_sdu: (sdu >> 20) as u16,
            base_crc_init,
            channel_map,
            phy,
            payload_count: count & PAYLOAD_COUNTER_MASK,
            framing: if count >> 39 & 1 != 0 {
                Framing::Framed
            } else {
                Framing::Unframed
            },
            encryption,
        })
    }
}

fn sub_field(value: u32, shift: u32, width: u32) -> u32 {
    (value >> shift) & ((1 << width) - 1)
}
