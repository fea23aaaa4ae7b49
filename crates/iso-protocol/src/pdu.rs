//! BIS data PDU header and BIG control PDUs

use crate::chan_map::ChannelMap;
use crate::error::ParseError;
use crate::{DecodePdu, EncodePdu};

/// Length of the BIS PDU header
pub const BIS_HEADER_LEN: usize = 2;
/// Largest payload a BIS PDU may carry
pub const MAX_PDU_PAYLOAD: usize = 251;

/// Link layer identifier of a BIS PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Llid {
    /// Unframed: complete SDU or last fragment of an SDU
    UnframedEnd = 0b00,
    /// Unframed: first or middle fragment, or padding when empty
    UnframedContinuation = 0b01,
    /// Framed: one or more segments
    Framed = 0b10,
    /// BIG control PDU (control link only)
    Control = 0b11,
}

impl Llid {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Llid::UnframedEnd,
            0b01 => Llid::UnframedContinuation,
            0b10 => Llid::Framed,
            _ => Llid::Control,
        }
    }
}

/// Header of a BIS or BIG control PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BisPduHeader {
    pub llid: Llid,
    /// Control subevent sequence number (3 bits)
    pub cssn: u8,
    /// Control subevent transmission flag
    pub cstf: bool,
    pub length: u8,
}

impl BisPduHeader {
    pub fn encode(&self) -> [u8; 2] {
        let mut b0 = self.llid as u8 | (self.cssn & 0x07) << 2;
        if self.cstf {
            b0 |= 1 << 5;
        }
        [b0, self.length]
    }

    /// Parse the header at the start of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < BIS_HEADER_LEN {
            return Err(ParseError::Incomplete {
                needed: BIS_HEADER_LEN - bytes.len(),
            });
        }
        Ok(Self {
            llid: Llid::from_bits(bytes[0]),
            cssn: (bytes[0] >> 2) & 0x07,
            cstf: bytes[0] & (1 << 5) != 0,
            length: bytes[1],
        })
    }
}

/// Split a received PDU into header and payload, checking the length field
pub fn split_pdu(pdu: &[u8]) -> Result<(BisPduHeader, &[u8]), ParseError> {
    let header = BisPduHeader::decode(pdu)?;
    let payload = &pdu[BIS_HEADER_LEN..];
    if payload.len() != usize::from(header.length) {
        return Err(ParseError::InvalidLength {
            expected: header.length.into(),
            actual: payload.len(),
        });
    }
    Ok((header, payload))
}

/// Build a PDU from a header template and payload
pub fn build_pdu(llid: Llid, cssn: u8, cstf: bool, payload: &[u8]) -> Vec<u8> {
    let header = BisPduHeader {
        llid,
        cssn,
        cstf,
        length: payload.len().min(u8::MAX.into()) as u8,
    };
    let mut pdu = Vec::with_capacity(BIS_HEADER_LEN + payload.len());
    pdu.extend_from_slice(&header.encode());
    pdu.extend_from_slice(payload);
    pdu
}

/// BIG control PDU opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlOpcode {
    ChannelMapInd = 0x00,
    TerminateInd = 0x01,
}

impl TryFrom<u8> for ControlOpcode {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ControlOpcode::ChannelMapInd),
            0x01 => Ok(ControlOpcode::TerminateInd),
            other => Err(ParseError::UnknownOpcode(other)),
        }
    }
}

/// Payload of a BIG control PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BigControlPdu {
    /// New channel map, effective from the event with counter `instant`
    ChannelMapInd { channel_map: ChannelMap, instant: u16 },
    /// BIG ends before the event with counter `instant`
    TerminateInd { reason: u8, instant: u16 },
}

impl BigControlPdu {
    pub fn opcode(&self) -> ControlOpcode {
        match self {
            BigControlPdu::ChannelMapInd { .. } => ControlOpcode::ChannelMapInd,
            BigControlPdu::TerminateInd { .. } => ControlOpcode::TerminateInd,
        }
    }

    pub fn instant(&self) -> u16 {
        match self {
            BigControlPdu::ChannelMapInd { instant, .. }
            | BigControlPdu::TerminateInd { instant, .. } => *instant,
        }
    }
}

impl EncodePdu for BigControlPdu {
    fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.opcode() as u8];
        match self {
            BigControlPdu::ChannelMapInd {
                channel_map,
                instant,
            } => {
                out.extend_from_slice(&channel_map.to_bytes());
                out.extend_from_slice(&instant.to_le_bytes());
            }
            BigControlPdu::TerminateInd { reason, instant } => {
                out.push(*reason);
                out.extend_from_slice(&instant.to_le_bytes());
            }
        }
        out
    }
}

impl DecodePdu for BigControlPdu {
    fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        let (&opcode, body) = bytes
            .split_first()
            .ok_or(ParseError::Incomplete { needed: 1 })?;
        match ControlOpcode::try_from(opcode)? {
            ControlOpcode::ChannelMapInd => {
                if body.len() != 7 {
                    return Err(ParseError::InvalidLength {
                        expected: 8,
                        actual: bytes.len(),
                    });
                }
                let mut chm = [0u8; 5];
                chm.copy_from_slice(&body[..5]);
                Ok(BigControlPdu::ChannelMapInd {
                    channel_map: ChannelMap::from_bytes(&chm)?,
                    instant: u16::from_le_bytes([body[5], body[6]]),
                })
            }
            ControlOpcode::TerminateInd => {
                if body.len() != 3 {
                    return Err(ParseError::InvalidLength {
                        expected: 4,
                        actual: bytes.len(),
                    });
                }
                Ok(BigControlPdu::TerminateInd {
                    reason: body[0],
                    instant: u16::from_le_bytes([body[1], body[2]]),
                })
            }
        }
    }
}

/// Whether the event with counter `counter` is at or past `instant`
///
/// Instants are compared modulo 2^16 over a half-range window.
pub fn instant_reached(counter: u64, instant: u16) -> bool {
    (counter as u16).wrapping_sub(instant) as i16 >= 0
}
