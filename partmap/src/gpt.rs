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

use fsdump_checksum::crc32_ieee;
use fsdump_device::{ByteSource, Error, PartMapError, Result};
use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::guid::Guid;

const GPT_SIGNATURE: u64 = 0x5452_4150_2049_4645; // "EFI PART" read as a little-endian u64.
const GPT_REVISION: u32 = 0x0001_0000;
const GPT_ENTRY_SIZE: u32 = 0x80;
const COPY_CHUNK: usize = 0x1000;

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct GptHeader {
    signature: U64,
    revision: U32,
    header_size: U32,
    header_crc32: U32,
    reserved: U32,
    my_lba: U64,
    alternate_lba: U64,
    first_usable_lba: U64,
    last_usable_lba: U64,
    disk_guid: [u8; 16],
    partition_entry_lba: U64,
    number_of_partition_entries: U32,
    size_of_partition_entry: U32,
    partition_entry_array_crc32: U32,
}

#[repr(C)]
#[derive(Debug, Clone, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct GptEntryRaw {
    partition_type_guid: [u8; 16],
    unique_partition_guid: [u8; 16],
    starting_lba: U64,
    ending_lba: U64,
    attributes: U64,
    partition_name: [U16; 36],
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub partition_type: Guid,
    pub unique_guid: Guid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl Entry {
    fn from_raw(raw: &GptEntryRaw) -> Self {
        let name: String = raw
            .partition_name
            .iter()
            .map(|c| c.get())
            .take_while(|&c| c != 0)
            .filter_map(char::from_u32)
            .collect();

        Self {
            partition_type: Guid::from_bytes(raw.partition_type_guid),
            unique_guid: Guid::from_bytes(raw.unique_partition_guid),
            first_lba: raw.starting_lba.get(),
            last_lba: raw.ending_lba.get(),
            attributes: raw.attributes.get(),
            name,
        }
    }

    pub fn is_unused(&self) -> bool {
        self.first_lba == 0 && self.last_lba == 0
    }
}

/// A verified GPT partition map: the primary header plus its partition
/// entry array.
#[derive(Debug)]
pub struct Gpt {
    sector_size: u64,
    my_lba: u64,
    alternate_lba: u64,
    partition_entry_lba: u64,
    size_of_partition_entry: u32,
    number_of_partition_entries: u32,
    entries: Vec<Entry>,
}

impl Gpt {
    /// Reads and validates the primary GPT header and partition entry
    /// array at LBA 1. Both the header CRC and the entry array CRC are
    /// checked against the UEFI algorithm (CRC-32 with the zeroed checksum
    /// field, seeded and XORed with `0xFFFFFFFF`).
    pub fn load(device: &impl ByteSource) -> Result<Self> {
        let sector_size = device.sector_size();
        let mut hdr_buf = vec![0u8; sector_size as usize];
        device.read(sector_size, &mut hdr_buf)?;

        let header = read_and_verify_header(&hdr_buf)?;

        let entry_array_size =
            header.number_of_partition_entries.get() as u64 * header.size_of_partition_entry.get() as u64;
        let padded_size = round_up(entry_array_size, sector_size);
        let mut entry_buf = vec![0u8; padded_size as usize];
        device.read(header.partition_entry_lba.get() * sector_size, &mut entry_buf)?;

        verify_entry_array(&entry_buf, entry_array_size as usize, header.partition_entry_array_crc32.get())?;

        let entries = parse_entries(&entry_buf, header.number_of_partition_entries.get());

        Ok(Self {
            sector_size,
            my_lba: header.my_lba.get(),
            alternate_lba: header.alternate_lba.get(),
            partition_entry_lba: header.partition_entry_lba.get(),
            size_of_partition_entry: header.size_of_partition_entry.get(),
            number_of_partition_entries: header.number_of_partition_entries.get(),
            entries,
        })
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn find_first_by_type(&self, partition_type: Guid) -> Option<&Entry> {
        self.entries
            .iter()
            .take_while(|e| !e.is_unused())
            .find(|e| e.partition_type == partition_type)
    }

    pub fn partition_offset_and_size(&self, entry: &Entry) -> (u64, u64) {
        let offset = entry.first_lba * self.sector_size;
        let size = (entry.last_lba - entry.first_lba + 1) * self.sector_size;
        (offset, size)
    }

    /// Duplicates the protective MBR, the primary header and entry array,
    /// and the alternate (backup) header and entry array onto `dst`.
    pub fn copy_gpt(&self, src: &impl ByteSource, dst: &impl ByteSource) -> Result<()> {
        copy_range(src, dst, 0, self.sector_size)?;
        copy_range(src, dst, self.sector_size, self.sector_size)?;

        let entry_array_size = self.number_of_partition_entries as u64 * self.size_of_partition_entry as u64;
        copy_range(
            src,
            dst,
            self.partition_entry_lba * self.sector_size,
            entry_array_size,
        )?;

        let mut alt_hdr_buf = vec![0u8; self.sector_size as usize];
        src.read(self.alternate_lba * self.sector_size, &mut alt_hdr_buf)?;
        dst.write(self.alternate_lba * self.sector_size, &alt_hdr_buf)?;

        let alt_header = GptHeader::ref_from_bytes(&alt_hdr_buf[..std::mem::size_of::<GptHeader>()])
            .map_err(|_| Error::PartMap(PartMapError::Signature))?;
        let alt_entry_array_size =
            alt_header.number_of_partition_entries.get() as u64 * alt_header.size_of_partition_entry.get() as u64;
        copy_range(
            src,
            dst,
            alt_header.partition_entry_lba.get() * self.sector_size,
            alt_entry_array_size,
        )?;

        let _ = self.my_lba;
        Ok(())
    }
}

fn read_and_verify_header(hdr_buf: &[u8]) -> Result<GptHeader> {
    let header_size_field = U32::from_bytes([hdr_buf[12], hdr_buf[13], hdr_buf[14], hdr_buf[15]]).get();
    if header_size_field as usize > hdr_buf.len() {
        return Err(Error::PartMap(PartMapError::Signature));
    }

    let header =
        GptHeader::read_from_bytes(&hdr_buf[..std::mem::size_of::<GptHeader>()]).map_err(|_| Error::PartMap(PartMapError::Signature))?;

    if header.signature.get() != GPT_SIGNATURE {
        return Err(Error::PartMap(PartMapError::Signature));
    }
    if header.revision.get() != GPT_REVISION {
        return Err(Error::PartMap(PartMapError::Signature));
    }
    if header.size_of_partition_entry.get() != GPT_ENTRY_SIZE {
        return Err(Error::PartMap(PartMapError::Signature));
    }

    let mut zeroed = hdr_buf[..header_size_field as usize].to_vec();
    zeroed[16..20].fill(0);
    let calculated = crc32_ieee(&zeroed);
    if calculated != header.header_crc32.get() {
        return Err(Error::PartMap(PartMapError::HeaderChecksum));
    }

    Ok(header)
}

fn verify_entry_array(entry_buf: &[u8], exact_size: usize, expected_crc: u32) -> Result<()> {
    let calculated = crc32_ieee(&entry_buf[..exact_size]);
    if calculated != expected_crc {
        return Err(Error::PartMap(PartMapError::EntryArrayChecksum));
    }
    Ok(())
}

fn parse_entries(entry_buf: &[u8], count: u32) -> Vec<Entry> {
    let entry_size = std::mem::size_of::<GptEntryRaw>();
    (0..count as usize)
        .map(|idx| {
            let raw = GptEntryRaw::read_from_bytes(&entry_buf[idx * entry_size..(idx + 1) * entry_size])
                .expect("entry array was already length-checked against the CRC32 pass");
            Entry::from_raw(&raw)
        })
        .collect()
}

fn round_up(value: u64, multiple: u64) -> u64 {
    (value + multiple - 1) / multiple * multiple
}

fn copy_range(src: &impl ByteSource, dst: &impl ByteSource, mut offset: u64, mut size: u64) -> Result<()> {
    let mut buf = [0u8; COPY_CHUNK];
    while size > 0 {
        let chunk = size.min(COPY_CHUNK as u64) as usize;
        src.read(offset, &mut buf[..chunk])?;
        dst.write(offset, &buf[..chunk])?;
        offset += chunk as u64;
        size -= chunk as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct MemSource {
        sector_size: u64,
        data: RefCell<Vec<u8>>,
    }

    impl ByteSource for MemSource {
        fn size(&self) -> u64 {
            self.data.borrow().len() as u64
        }
        fn sector_size(&self) -> u64 {
            self.sector_size
        }
        fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
            let data = self.data.borrow();
            let start = offset as usize;
            buffer.copy_from_slice(&data[start..start + buffer.len()]);
            Ok(())
        }
        fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
            let mut data = self.data.borrow_mut();
            let start = offset as usize;
            data[start..start + buffer.len()].copy_from_slice(buffer);
            Ok(())
        }
    }

    fn build_gpt(entries: &[(Guid, u64, u64)]) -> MemSource {
        let sector_size = 512u64;
        let num_entries = 128u32;
        let entry_size = GPT_ENTRY_SIZE;
        let entry_array_bytes = num_entries as u64 * entry_size as u64;
        let entry_array_sectors = round_up(entry_array_bytes, sector_size) / sector_size;

        let total_sectors = 2 + entry_array_sectors * 2 + 64;
        let mut data = vec![0u8; (total_sectors * sector_size) as usize];

        let mut entry_buf = vec![0u8; entry_array_bytes as usize];
        for (idx, (ptype, first, last)) in entries.iter().enumerate() {
            let base = idx * entry_size as usize;
            entry_buf[base..base + 16].copy_from_slice(&ptype.to_bytes());
            entry_buf[base + 32..base + 40].copy_from_slice(&first.to_le_bytes());
            entry_buf[base + 40..base + 48].copy_from_slice(&last.to_le_bytes());
        }
        let entry_crc = crc32_ieee(&entry_buf);

        let pe_lba = 2u64;
        let alt_pe_lba = 2 + entry_array_sectors + 1;
        let alt_lba = total_sectors - 1;

        let write_header = |data: &mut [u8], my_lba: u64, alt_lba: u64, pe_lba: u64| {
            let off = (my_lba * sector_size) as usize;
            data[off..off + 8].copy_from_slice(&GPT_SIGNATURE.to_le_bytes());
            data[off + 8..off + 12].copy_from_slice(&GPT_REVISION.to_le_bytes());
            data[off + 12..off + 16].copy_from_slice(&92u32.to_le_bytes());
            data[off + 24..off + 32].copy_from_slice(&my_lba.to_le_bytes());
            data[off + 32..off + 40].copy_from_slice(&alt_lba.to_le_bytes());
            data[off + 72..off + 80].copy_from_slice(&pe_lba.to_le_bytes());
            data[off + 80..off + 84].copy_from_slice(&num_entries.to_le_bytes());
            data[off + 84..off + 88].copy_from_slice(&entry_size.to_le_bytes());
            data[off + 88..off + 92].copy_from_slice(&entry_crc.to_le_bytes());
            let hdr_crc = crc32_ieee(&data[off..off + 92]);
            data[off + 16..off + 20].copy_from_slice(&hdr_crc.to_le_bytes());
        };

        write_header(&mut data, 1, alt_lba, pe_lba);
        data[(pe_lba * sector_size) as usize..(pe_lba * sector_size) as usize + entry_buf.len()]
            .copy_from_slice(&entry_buf);

        write_header(&mut data, alt_lba, 1, alt_pe_lba);
        data[(alt_pe_lba * sector_size) as usize..(alt_pe_lba * sector_size) as usize + entry_buf.len()]
            .copy_from_slice(&entry_buf);

        MemSource {
            sector_size,
            data: RefCell::new(data),
        }
    }

    #[test]
    fn loads_and_finds_apfs_partition() {
        let dev = build_gpt(&[(crate::guid::PTYPE_APFS, 40, 1000)]);
        let gpt = Gpt::load(&dev).unwrap();
        let entry = gpt.find_first_by_type(crate::guid::PTYPE_APFS).unwrap();
        assert_eq!(entry.first_lba, 40);
        assert_eq!(entry.last_lba, 1000);
    }

    #[test]
    fn rejects_tampered_header() {
        let dev = build_gpt(&[(crate::guid::PTYPE_APFS, 40, 1000)]);
        {
            let mut data = dev.data.borrow_mut();
            data[512 + 40] ^= 0xFF;
        }
        assert!(Gpt::load(&dev).is_err());
    }

    #[test]
    fn copy_gpt_duplicates_both_headers() {
        let dev = build_gpt(&[(crate::guid::PTYPE_APFS, 40, 1000)]);
        let gpt = Gpt::load(&dev).unwrap();
        let dst = MemSource {
            sector_size: 512,
            data: RefCell::new(vec![0u8; dev.data.borrow().len()]),
        };
        gpt.copy_gpt(&dev, &dst).unwrap();
        assert_eq!(dst.data.borrow()[0..1024], dev.data.borrow()[0..1024]);
    }
}
