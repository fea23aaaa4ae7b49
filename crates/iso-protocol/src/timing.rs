//! PHY air-time and clock-drift arithmetic
//!
//! All durations are in microseconds. ISO intervals travel over the air in
//! units of 1.25 ms and are converted here.

use crate::error::ParseError;

/// Inter frame space
pub const T_IFS_US: u32 = 150;
/// Minimum subevent space
pub const T_MSS_US: u32 = 150;
/// Unit of the ISO_Interval field
pub const ISO_INTERVAL_UNIT_US: u32 = 1250;
/// Length of the message integrity check appended to encrypted payloads
pub const MIC_LEN: usize = 4;

/// Sleep clock accuracy field (0..=7) to worst-case drift in ppm
const SCA_PPM: [u32; 8] = [500, 250, 150, 100, 75, 50, 30, 20];

/// LE physical layer used by a BIG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Phy {
    /// LE 1M
    #[default]
    Le1M,
    /// LE 2M
    Le2M,
    /// LE Coded (S=8)
    LeCoded,
}

impl Phy {
    /// Encoding used by the 3-bit PHY field of BIGInfo
    pub fn to_bits(self) -> u8 {
        match self {
            Phy::Le1M => 0,
            Phy::Le2M => 1,
            Phy::LeCoded => 2,
        }
    }

    /// Decode the 3-bit BIGInfo PHY field
    pub fn from_bits(bits: u8) -> Result<Self, ParseError> {
        match bits {
            0 => Ok(Phy::Le1M),
            1 => Ok(Phy::Le2M),
            2 => Ok(Phy::LeCoded),
            _ => Err(ParseError::InvalidField {
                field: "PHY",
                value: bits.into(),
            }),
        }
    }

    /// Encoding used by HCI events (1 = 1M, 2 = 2M, 3 = Coded)
    pub fn to_hci(self) -> u8 {
        self.to_bits() + 1
    }

    /// Time on air of a packet with `payload_len` bytes after the 2-byte header
    pub fn pdu_air_time_us(self, payload_len: usize) -> u32 {
        let len = payload_len as u32;
        match self {
            // preamble(1) + AA(4) + header(2) + payload + CRC(3), 8 us per byte
            Phy::Le1M => (10 + len) * 8,
            // preamble(2) + AA(4) + header(2) + payload + CRC(3), 4 us per byte
            Phy::Le2M => (11 + len) * 4,
            // preamble 80 + AA 256 + CI 16 + TERM1 24 + TERM2 24, then 64 us per byte
            Phy::LeCoded => 400 + (5 + len) * 64,
        }
    }

    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Phy::Le1M => "LE 1M",
            Phy::Le2M => "LE 2M",
            Phy::LeCoded => "LE Coded",
        }
    }
}

/// Worst-case drift in ppm for a sleep clock accuracy field value
pub fn sca_ppm(sca: u8) -> u32 {
    SCA_PPM[usize::from(sca & 0x07)]
}

/// Window widening for `elapsed_us` since the last confirmed anchor
///
/// `total_ppm` is the sum of the remote and local clock accuracies.
pub fn window_widening_us(elapsed_us: u64, total_ppm: u32) -> u32 {
    let widening = (elapsed_us * u64::from(total_ppm)).div_ceil(1_000_000);
    u32::try_from(widening).unwrap_or(u32::MAX)
}

/// Convert an ISO_Interval field value to microseconds
pub fn iso_interval_us(units: u16) -> u32 {
    u32::from(units) * ISO_INTERVAL_UNIT_US
}
