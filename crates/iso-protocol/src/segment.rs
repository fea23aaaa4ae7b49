//! Framed-PDU segmentation header
//!
//! A framed PDU payload is a sequence of segments. Each segment starts with
//! a 2-byte header:
//!
//! - byte 0 bit 0: `SC`, 0 for the first segment of an SDU, 1 for a continuation
//! - byte 0 bit 1: `CMPLT`, set on the last segment of an SDU
//! - byte 1: length of what follows the header
//!
//! A first segment carries a 3-byte little-endian TimeOffset ahead of the SDU
//! bytes, and its length field counts it.

use crate::error::ParseError;

/// Length of the segmentation header
pub const SEGMENT_HEADER_LEN: usize = 2;
/// Length of the TimeOffset field of a first segment
pub const TIME_OFFSET_LEN: usize = 3;
/// Largest encodable TimeOffset in microseconds
pub const MAX_TIME_OFFSET: u32 = 0xFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Continuation of an SDU started in an earlier segment
    pub sc: bool,
    /// Last segment of the SDU
    pub cmplt: bool,
    pub length: u8,
}

impl SegmentHeader {
    pub fn encode(&self) -> [u8; 2] {
        [u8::from(self.sc) | u8::from(self.cmplt) << 1, self.length]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < SEGMENT_HEADER_LEN {
            return Err(ParseError::Incomplete {
                needed: SEGMENT_HEADER_LEN - bytes.len(),
            });
        }
        Ok(Self {
            sc: bytes[0] & 0x01 != 0,
            cmplt: bytes[0] & 0x02 != 0,
            length: bytes[1],
        })
    }
}

/// Encode a TimeOffset, saturating at the 24-bit maximum
pub fn encode_time_offset(offset_us: u64) -> [u8; 3] {
    let clamped = offset_us.min(MAX_TIME_OFFSET.into()) as u32;
    let b = clamped.to_le_bytes();
    [b[0], b[1], b[2]]
}

pub fn decode_time_offset(bytes: &[u8; 3]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0])
}

/// One segment of a framed PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub header: SegmentHeader,
    /// Present on first segments only
    pub time_offset: Option<u32>,
    pub data: &'a [u8],
}

/// Append a segment to a framed PDU payload
pub fn write_segment(out: &mut Vec<u8>, cmplt: bool, time_offset_us: Option<u64>, data: &[u8]) {
    let offset_len = if time_offset_us.is_some() {
        TIME_OFFSET_LEN
    } else {
        0
    };
    let header = SegmentHeader {
        sc: time_offset_us.is_none(),
        cmplt,
        length: (offset_len + data.len()) as u8,
    };
    out.extend_from_slice(&header.encode());
    if let Some(offset) = time_offset_us {
        out.extend_from_slice(&encode_time_offset(offset));
    }
    out.extend_from_slice(data);
}

/// Iterate the segments of a framed PDU payload
///
/// Stops after the first error.
pub fn segments(payload: &[u8]) -> Segments<'_> {
    Segments {
        remaining: payload,
        failed: false,
    }
}

pub struct Segments<'a> {
    remaining: &'a [u8],
    failed: bool,
}

impl<'a> Segments<'a> {
    fn parse_next(&mut self) -> Result<Segment<'a>, ParseError> {
        let header = SegmentHeader::decode(self.remaining)?;
        let body = &self.remaining[SEGMENT_HEADER_LEN..];
        let claimed = usize::from(header.length);
        if claimed > body.len() {
            return Err(ParseError::SegmentOverrun {
                claimed,
                remaining: body.len(),
            });
        }
        let (segment, rest) = body.split_at(claimed);
        self.remaining = rest;

        if header.sc {
            return Ok(Segment {
                header,
                time_offset: None,
                data: segment,
            });
        }
        if segment.len() < TIME_OFFSET_LEN {
            return Err(ParseError::InvalidField {
                field: "segment length",
                value: header.length.into(),
            });
        }
        let (offset, data) = segment.split_at(TIME_OFFSET_LEN);
        let offset: &[u8; 3] = offset.try_into().map_err(|_| ParseError::Incomplete {
            needed: TIME_OFFSET_LEN,
        })?;
        Ok(Segment {
            header,
            time_offset: Some(decode_time_offset(offset)),
            data,
        })
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = Result<Segment<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining.is_empty() {
            return None;
        }
        let item = self.parse_next();
        if item.is_err() {
            self.failed = true;
        }
        Some(item)
    }
}
