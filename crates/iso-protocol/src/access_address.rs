//! BIS and BIG control access addresses
//!
//! All access addresses of a BIG are derived from one random seed access
//! address. BIS `n` (1-based) uses the diversifier for `n`; the BIG control
//! link uses `n = 0`.

use rand::RngCore;
use tracing::debug;

/// Access address of the primary advertising channels
pub const ADVERTISING_ACCESS_ADDRESS: u32 = 0x8E89_BED6;

/// Diversifier word for stream `n`
fn diversifier(n: u8) -> u32 {
    let d = (35 * u32::from(n) + 42) & 0x7F;
    let bit = |i: u32| (d >> i) & 1;
    (bit(0) * 0xFC00_0000)
        | (bit(1) << 25)
        | (bit(2) << 23)
        | (bit(3) << 22)
        | (bit(4) << 20)
        | (bit(5) << 19)
        | (bit(6) << 18)
}

/// Access address of BIS `n`, or of the BIG control link for `n == 0`
pub fn bis_access_address(seed: u32, n: u8) -> u32 {
    seed ^ diversifier(n)
}

/// Access address of the BIG control link
pub fn control_access_address(seed: u32) -> u32 {
    bis_access_address(seed, 0)
}

fn longest_run(aa: u32) -> u32 {
    let mut longest = 1;
    let mut run = 1;
    for i in 1..32 {
        if (aa >> i) & 1 == (aa >> (i - 1)) & 1 {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 1;
        }
    }
    longest
}

fn transitions(v: u32, bits: u32) -> u32 {
    let mask = if bits == 32 { u32::MAX } else { (1 << bits) - 1 };
    let v = v & mask;
    ((v ^ (v >> 1)) & (mask >> 1)).count_ones()
}

/// Whether `aa` satisfies the access address rules for LE 1M, 2M and Coded
pub fn is_valid_access_address(aa: u32) -> bool {
    if aa == ADVERTISING_ACCESS_ADDRESS {
        return false;
    }
    if (aa ^ ADVERTISING_ACCESS_ADDRESS).count_ones() == 1 {
        return false;
    }
    let [b0, b1, b2, b3] = aa.to_le_bytes();
    if b0 == b1 && b1 == b2 && b2 == b3 {
        return false;
    }
    if longest_run(aa) > 6 {
        return false;
    }
    if transitions(aa, 32) > 24 {
        return false;
    }
    if transitions(aa >> 26, 6) < 2 {
        return false;
    }
    // LE Coded constraints
    if (aa & 0xFF).count_ones() < 3 {
        return false;
    }
    transitions(aa, 16) <= 11
}

/// Draw a seed access address whose control and BIS addresses are all valid
pub fn generate_seed_access_address<R: RngCore + ?Sized>(rng: &mut R, num_bis: u8) -> u32 {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let seed = rng.next_u32();
        if (0..=num_bis).all(|n| is_valid_access_address(bis_access_address(seed, n))) {
            debug!(seed = format_args!("0x{seed:08X}"), attempts, "seed access address");
            return seed;
        }
    }
}
