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

//! Recognizes an NTFS volume from its BIOS parameter block, but does not
//! walk `$MFT`/`$Bitmap` to find used clusters; the partition is copied
//! whole instead. A used-block walk would follow the same shape as
//! [`fsdump_fs_apfs`]'s spaceman walk, reading the `$Bitmap` file's data
//! runs, but that is not implemented here.

use fsdump_fs::{ByteSource, Error, FsError, FsScanner, Result};
use fsdump_fs_raw::RawScanner;
use log::debug;
use zerocopy::{little_endian::U16, FromBytes, Immutable, IntoBytes, KnownLayout};

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct BiosParameterBlock {
    bytes_per_sector: U16,
    sectors_per_cluster: u8,
    reserved_sectors: U16,
    fats: u8,
    root_entries: U16,
    sectors_small: U16,
    media_descriptor: u8,
    sectors_per_fat: U16,
}

/// An NTFS volume, identified by the `NTFS    ` OEM ID at boot-sector
/// offset 3.
pub struct NtfsScanner<'a> {
    source: &'a dyn ByteSource,
}

impl<'a> NtfsScanner<'a> {
    /// Validates the boot sector's BIOS parameter block at offset 0x0B of
    /// `source`. `source` is expected to already be windowed to the
    /// partition.
    pub fn new(source: &'a dyn ByteSource) -> Result<Self> {
        let mut sector = vec![0u8; source.sector_size().max(512) as usize];
        source.read(0, &mut sector)?;

        let bpb = BiosParameterBlock::read_from_prefix(&sector[0x0B..])
            .map_err(|_| Error::Fs(FsError::Inconsistent))?
            .0;

        if bpb.bytes_per_sector.get() == 0 || bpb.sectors_per_cluster == 0 {
            return Err(Error::Fs(FsError::Inconsistent));
        }
        debug!(
            "NTFS volume: {} bytes/sector, {} sectors/cluster",
            bpb.bytes_per_sector.get(),
            bpb.sectors_per_cluster
        );

        Ok(Self { source })
    }
}

impl<'a> FsScanner for NtfsScanner<'a> {
    fn copy_used(&self, dst: &dyn ByteSource) -> Result<()> {
        RawScanner::new(self.source).copy_used(dst)
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

    fn boot_sector() -> Vec<u8> {
        let mut sector = vec![0u8; 512];
        sector[3..11].copy_from_slice(b"NTFS    ");
        sector[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        sector[0x0D] = 8;
        sector
    }

    #[test]
    fn rejects_zeroed_bpb() {
        let source = MemSource(RefCell::new(vec![0u8; 512]));
        assert!(NtfsScanner::new(&source).is_err());
    }

    #[test]
    fn copies_whole_volume() {
        let mut data = boot_sector();
        data.extend((0u8..=255).cycle().take(0x800));
        let size = data.len();
        let src = MemSource(RefCell::new(data));
        let dst = MemSource(RefCell::new(vec![0u8; size]));
        let scanner = NtfsScanner::new(&src).unwrap();
        scanner.copy_used(&dst).unwrap();
        assert_eq!(*src.0.borrow(), *dst.0.borrow());
    }
}
