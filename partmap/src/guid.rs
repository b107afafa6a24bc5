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

use std::fmt::{self, Debug};

/// A 128 bit GUID stored in GPT's "mixed-endian" on-disk form: the first
/// three fields are little-endian, the last two (clock-seq and node) are
/// big-endian.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid {
    first: u32,
    second: u16,
    third: u16,
    fourth: u16,
    fifth: [u8; 6],
}

impl Guid {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self {
            first: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            second: u16::from_le_bytes([bytes[4], bytes[5]]),
            third: u16::from_le_bytes([bytes[6], bytes[7]]),
            fourth: u16::from_be_bytes([bytes[8], bytes[9]]),
            fifth: [
                bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
            ],
        }
    }

    pub fn to_bytes(self) -> [u8; 16] {
        let [a, b, c, d] = self.first.to_le_bytes();
        let [e, f] = self.second.to_le_bytes();
        let [g, h] = self.third.to_le_bytes();
        let [i, j] = self.fourth.to_be_bytes();
        let [k, l, m, n, o, p] = self.fifth;
        [a, b, c, d, e, f, g, h, i, j, k, l, m, n, o, p]
    }

    pub fn is_nil(self) -> bool {
        self.to_bytes() == [0u8; 16]
    }
}

impl Debug for Guid {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "{:08X}-{:04X}-{:04X}-{:04X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            self.first,
            self.second,
            self.third,
            self.fourth,
            self.fifth[0],
            self.fifth[1],
            self.fifth[2],
            self.fifth[3],
            self.fifth[4],
            self.fifth[5],
        )
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, fmt)
    }
}

/// `7C3457EF-0000-11AA-AA11-00306543ECAC`, the GPT partition type GUID for
/// an APFS container.
pub const PTYPE_APFS: Guid = Guid::from_bytes([
    0xEF, 0x57, 0x34, 0x7C, 0x00, 0x00, 0xAA, 0x11, 0xAA, 0x11, 0x00, 0x30, 0x65, 0x43, 0xEC, 0xAC,
]);

#[cfg(test)]
mod tests {
    use super::*;

    // Test case from Apple's TN2166.
    #[test]
    fn mixed_endian_round_trip() {
        let bytes = [
            0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E,
            0xC9, 0x3B,
        ];
        let guid = Guid::from_bytes(bytes);
        assert_eq!(guid.to_bytes(), bytes);
        assert_eq!(
            format!("{:?}", guid),
            "C12A7328-F81F-11D2-BA4B-00A0C93EC93B"
        );
    }
}
