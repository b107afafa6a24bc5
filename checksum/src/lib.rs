// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crc::{Crc, CRC_32_ISCSI, CRC_32_ISO_HDLC};

/// CRC-32 (IEEE 802.3 / zlib polynomial), as used by the GPT header and
/// partition entry array checksums. Init and final XOR are both
/// `0xFFFFFFFF`, matching the way the UEFI spec describes the algorithm.
pub fn crc32_ieee(data: &[u8]) -> u32 {
    Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(data)
}

/// CRC-32C (Castagnoli), as used throughout VHDX's headers, region table
/// and log entries.
pub fn crc32c(data: &[u8]) -> u32 {
    Crc::<u32>::new(&CRC_32_ISCSI).checksum(data)
}

/// Fletcher-64 over `data` interpreted as little-endian 32-bit words,
/// continuing from a prior partial result in `init`. `data.len()` must be a
/// multiple of 4.
pub fn fletcher64(data: &[u8], init: u64) -> u64 {
    debug_assert_eq!(data.len() % 4, 0);

    let mut sum1 = init & 0xFFFF_FFFF;
    let mut sum2 = init >> 32;

    for word in data.chunks_exact(4) {
        sum1 += u32::from_le_bytes(word.try_into().unwrap()) as u64;
        sum2 += sum1;
    }

    sum1 %= 0xFFFF_FFFF;
    sum2 %= 0xFFFF_FFFF;

    (sum2 << 32) | sum1
}

/// Verifies an APFS object's embedded Fletcher-64 checksum (the first 8
/// bytes of `data`, i.e. `obj_phys_t::o_cksum`). An all-zero or all-one
/// checksum field is treated as invalid rather than unchecked.
pub fn verify_fletcher64_block(data: &[u8]) -> bool {
    if data.len() < 8 || data.len() % 4 != 0 {
        return false;
    }

    let stored = u64::from_le_bytes(data[0..8].try_into().unwrap());
    if stored == 0 || stored == u64::MAX {
        return false;
    }

    let partial = fletcher64(&data[8..], 0);
    fletcher64(&data[0..8], partial) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fletcher64_of_zero_is_zero() {
        assert_eq!(fletcher64(&[0u8; 16], 0), 0);
    }

    #[test]
    fn verify_rejects_zero_checksum() {
        let block = vec![0u8; 64];
        assert!(!verify_fletcher64_block(&block));
    }

    #[test]
    fn verify_accepts_self_consistent_block() {
        let mut block = vec![0u8; 64];
        for (idx, byte) in block.iter_mut().enumerate().skip(8) {
            *byte = idx as u8;
        }
        let cs = fletcher64(&block[8..], 0);
        // Solve for the two checksum words the way obj_phys_t verification does:
        // Fletcher64(cksum_bytes, 2, Fletcher64(rest, 0)) must equal zero.
        // The original C tool derives a block's checksum at write time as the
        // low/high words that zero out the verification pass; reproduce that
        // derivation directly instead of solving the fletcher equation here.
        let sum1 = cs & 0xFFFF_FFFF;
        let sum2 = cs >> 32;
        let c1 = 0xFFFF_FFFFu64.saturating_sub((sum1 + sum2) % 0xFFFF_FFFF);
        let c2 = 0xFFFF_FFFFu64.saturating_sub((sum1 + c1) % 0xFFFF_FFFF);
        block[0..4].copy_from_slice(&(c1 as u32).to_le_bytes());
        block[4..8].copy_from_slice(&(c2 as u32).to_le_bytes());
        assert!(verify_fletcher64_block(&block));
    }

    #[test]
    fn crc32_ieee_matches_known_vector() {
        assert_eq!(crc32_ieee(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn crc32c_matches_known_vector() {
        assert_eq!(crc32c(b"123456789"), 0xE306_9283);
    }
}
