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

use fsdump_device::{ByteSource, Error, PartMapError, Result};
use zerocopy::{little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout};

const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const PARTITION_TABLE_OFFSET: usize = 0x1BE;

#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct MbrEntryRaw {
    status: u8,
    chs_start: [u8; 3],
    partition_type: u8,
    chs_end: [u8; 3],
    lba_start: U32,
    lba_size: U32,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub partition_type: u8,
    pub first_lba: u64,
    pub last_lba: u64,
}

impl Entry {
    pub fn is_unused(&self) -> bool {
        self.partition_type == 0
    }
}

#[derive(Debug)]
pub struct Mbr {
    sector_size: u64,
    entries: Vec<Entry>,
}

impl Mbr {
    /// Reads the classic 4-entry partition table from sector 0, used as a
    /// fallback when no valid GPT is present.
    pub fn load(device: &impl ByteSource) -> Result<Self> {
        let sector_size = device.sector_size();
        let mut sector = vec![0u8; sector_size as usize];
        device.read(0, &mut sector)?;

        if sector[510..512] != MBR_SIGNATURE {
            return Err(Error::PartMap(PartMapError::Signature));
        }

        let entry_size = std::mem::size_of::<MbrEntryRaw>();
        let entries = (0..4)
            .map(|idx| {
                let start = PARTITION_TABLE_OFFSET + idx * entry_size;
                let raw = MbrEntryRaw::read_from_bytes(&sector[start..start + entry_size])
                    .expect("fixed 16-byte slice always parses");
                let first_lba = raw.lba_start.get() as u64;
                let last_lba = match raw.lba_size.get().checked_sub(1) {
                    Some(span) => first_lba + span as u64,
                    None => first_lba,
                };
                Entry {
                    partition_type: raw.partition_type,
                    first_lba,
                    last_lba,
                }
            })
            .collect();

        Ok(Self {
            sector_size,
            entries,
        })
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn partition_offset_and_size(&self, entry: &Entry) -> (u64, u64) {
        let offset = entry.first_lba * self.sector_size;
        let size = (entry.last_lba - entry.first_lba + 1) * self.sector_size;
        (offset, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct MemSource(RefCell<Vec<u8>>);

    impl ByteSource for MemSource {
        fn size(&self) -> u64 {
            self.0.borrow().len() as u64
        }
        fn sector_size(&self) -> u64 {
            512
        }
        fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
            let data = self.0.borrow();
            let start = offset as usize;
            buffer.copy_from_slice(&data[start..start + buffer.len()]);
            Ok(())
        }
        fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
            let mut data = self.0.borrow_mut();
            let start = offset as usize;
            data[start..start + buffer.len()].copy_from_slice(buffer);
            Ok(())
        }
    }

    fn build_mbr(entries: &[(u8, u32, u32)]) -> MemSource {
        let mut sector = vec![0u8; 512];
        for (idx, (ptype, lba_start, lba_size)) in entries.iter().enumerate() {
            let off = PARTITION_TABLE_OFFSET + idx * 16;
            sector[off + 4] = *ptype;
            sector[off + 8..off + 12].copy_from_slice(&lba_start.to_le_bytes());
            sector[off + 12..off + 16].copy_from_slice(&lba_size.to_le_bytes());
        }
        sector[510..512].copy_from_slice(&MBR_SIGNATURE);
        MemSource(RefCell::new(sector))
    }

    #[test]
    fn rejects_missing_signature() {
        let dev = MemSource(RefCell::new(vec![0u8; 512]));
        assert!(Mbr::load(&dev).is_err());
    }

    #[test]
    fn loads_four_entries_and_computes_ranges() {
        let dev = build_mbr(&[(0x0C, 2048, 204800), (0x83, 206848, 409600)]);
        let mbr = Mbr::load(&dev).unwrap();
        assert_eq!(mbr.entries().len(), 4);

        let fat = &mbr.entries()[0];
        assert_eq!(fat.partition_type, 0x0C);
        assert!(!fat.is_unused());
        let (offset, size) = mbr.partition_offset_and_size(fat);
        assert_eq!(offset, 2048 * 512);
        assert_eq!(size, 204800 * 512);

        let linux = &mbr.entries()[1];
        assert_eq!(linux.partition_type, 0x83);
        let (offset, size) = mbr.partition_offset_and_size(linux);
        assert_eq!(offset, 206848 * 512);
        assert_eq!(size, 409600 * 512);

        for unused in &mbr.entries()[2..] {
            assert!(unused.is_unused());
        }
    }
}
