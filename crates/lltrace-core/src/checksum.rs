//! CRC-24 validation for link-layer PDUs.
//!
//! The CRC covers the PDU header and payload (never the access address, the
//! coding indicator or the CRC itself). The shift register is preset with the
//! 24-bit CRC init and clocked with each byte LSB first; the result is sent
//! with its highest register bit first, which leaves the wire value bit-reversed
//! within each byte relative to [`compute`].

use serde::Serialize;

/// CRC init for every PDU on the primary advertising access address
pub const ADVERTISING_CRC_INIT: u32 = 0x55_5555;

/// Generator polynomial x^24 + x^10 + x^9 + x^6 + x^4 + x^3 + x + 1 (low 24 bits)
const POLYNOMIAL: u32 = 0x00_065B;

const MASK_24: u32 = 0xFF_FFFF;

/// Register flips for one nibble step, indexed by `(state[23:20] << 4) | nibble`.
static NEXT_STATE_FLIPS: [u32; 256] = build_next_state_flips();

const fn build_next_state_flips() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut index = 0;
    while index < 256 {
        let mut state = ((index as u32) & 0xF0) << 16;
        let nibble = (index as u32) & 0x0F;
        let mut bit = 0;
        while bit < 4 {
            let feedback = ((nibble >> bit) ^ (state >> 23)) & 1;
            state = (state << 1) & MASK_24;
            if feedback != 0 {
                state ^= POLYNOMIAL;
            }
            bit += 1;
        }
        table[index] = state;
        index += 1;
    }
    table
}

/// Compute the CRC-24 of `pdu` seeded with `init`.
#[must_use]
pub fn compute(pdu: &[u8], init: u32) -> u32 {
    let mut state = init & MASK_24;
    for &byte in pdu {
        for nibble in [byte & 0x0F, byte >> 4] {
            let index = ((((state >> 16) & 0xF0) as u8) | nibble) as usize;
            state = ((state << 4) ^ NEXT_STATE_FLIPS[index]) & MASK_24;
        }
    }
    state
}

/// Reverse the bit order inside each byte of `value`.
#[must_use]
pub fn reverse_bits_per_byte(value: u32) -> u32 {
    let bytes = value.to_le_bytes();
    u32::from_le_bytes([
        bytes[0].reverse_bits(),
        bytes[1].reverse_bits(),
        bytes[2].reverse_bits(),
        bytes[3].reverse_bits(),
    ])
}

/// Outcome of checksum validation for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChecksumVerdict {
    /// Transmitted CRC matches
    Good,
    /// Transmitted CRC does not match
    Bad {
        /// CRC computed over the PDU
        computed: u32,
        /// Transmitted CRC, bit order corrected
        declared: u32,
    },
    /// No CRC init is known for this stream
    Indeterminate,
    /// The frame carries no complete CRC
    Unavailable,
    /// Validation disabled by configuration
    Skipped,
}

impl ChecksumVerdict {
    /// Whether the frame passed validation
    #[must_use]
    pub fn is_good(&self) -> bool {
        matches!(self, Self::Good)
    }
}

/// Verify a transmitted CRC.
///
/// `declared` is the three wire bytes read big-endian (first byte in the most
/// significant position). Without an `init` the result is
/// [`ChecksumVerdict::Indeterminate`].
#[must_use]
pub fn verify(pdu: &[u8], declared: u32, init: Option<u32>) -> ChecksumVerdict {
    let Some(init) = init else {
        return ChecksumVerdict::Indeterminate;
    };
    let computed = compute(pdu, init);
    let declared = reverse_bits_per_byte(declared) & MASK_24;
    if computed == declared {
        ChecksumVerdict::Good
    } else {
        ChecksumVerdict::Bad { computed, declared }
    }
}
