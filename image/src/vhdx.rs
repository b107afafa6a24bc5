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

//! Microsoft VHDX: a fixed-size logical disk backed by two alternating
//! headers, a region table, a metadata table, a Block Allocation Table
//! (BAT) and a write-ahead log protecting every BAT page mutation.
//!
//! Every multi-byte field is little-endian; GUIDs are Microsoft's
//! mixed-endian form, reusing [`fsdump_partmap::Guid`].

use std::{
    cell::RefCell,
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use fsdump_checksum::crc32c;
use fsdump_device::{ByteSource, DeviceError, Error, ImageError, Result};
use fsdump_partmap::Guid;
use log::debug;
use rand::Rng;
use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

const VHDX_SIGNATURE: u64 = 0x656C_6966_7864_6876; // "vhdxfile"
const SIG_HEAD: u32 = 0x6461_6568; // "head"
const SIG_REGI: u32 = 0x6967_6572; // "regi"
const SIG_LOGE: u32 = 0x6567_6F6C; // "loge"
const SIG_ZERO: u32 = 0x6F72_657A; // "zero"
const SIG_DESC: u32 = 0x6373_6564; // "desc"
const SIG_DATA: u32 = 0x6174_6164; // "data"
const SIG_META: u64 = 0x6174_6164_6174_656D; // "metadata"

const HEADER1_OFFSET: u64 = 0x10000;
const HEADER2_OFFSET: u64 = 0x20000;
const REGION1_OFFSET: u64 = 0x30000;
const REGION2_OFFSET: u64 = 0x40000;
const REGION_TABLE_SIZE: usize = 0x10000;
const LOG_OFFSET: u64 = 0x100000;
const LOG_LENGTH: u32 = 0x100000;
const META_OFFSET: u64 = 0x200000;
const META_LENGTH: u32 = 0x100000;
const BAT_OFFSET: u64 = 0x300000;

const DEFAULT_BLOCK_SIZE: u32 = 0x2000000; // 32 MiB
const DEFAULT_SECTOR_SIZE_LOGICAL: u32 = 512;
const DEFAULT_SECTOR_SIZE_PHYSICAL: u32 = 4096;

const HEADER_SIZE: usize = 0x1000;
const BAT_ENTRY_SIZE: u64 = 8;
const BAT_PAGE_SIZE: usize = 0x1000;
const BAT_ENTRIES_PER_PAGE: usize = BAT_PAGE_SIZE / BAT_ENTRY_SIZE as usize;

const REGI_FLAG_REQUIRED: u32 = 1;
const META_FLAGS_IS_VIRTUAL_DISK: u32 = 2;
const META_FLAGS_IS_REQUIRED: u32 = 4;

const FILE_PARAM_LEAVE_BLOCKS_ALLOCATED: u32 = 0x1;
const FILE_PARAM_HAS_PARENT: u32 = 0x2;

const PAYLOAD_BLOCK_NOT_PRESENT: u64 = 0;
const PAYLOAD_BLOCK_UNDEFINED: u64 = 1;
const PAYLOAD_BLOCK_ZERO: u64 = 2;
const PAYLOAD_BLOCK_UNMAPPED: u64 = 3;
const PAYLOAD_BLOCK_FULLY_PRESENT: u64 = 6;
const PAYLOAD_BLOCK_PARTIALLY_PRESENT: u64 = 7;

const GUID_BAT: Guid = Guid::from_bytes([
    0x66, 0x77, 0xC2, 0x2D, 0x23, 0xF6, 0x00, 0x42, 0x9D, 0x64, 0x11, 0x5E, 0x9B, 0xFD, 0x4A, 0x08,
]);
const GUID_METADATA: Guid = Guid::from_bytes([
    0x06, 0xA2, 0x7C, 0x8B, 0x90, 0x47, 0x9A, 0x4B, 0xB8, 0xFE, 0x57, 0x5F, 0x05, 0x0F, 0x88, 0x6E,
]);
const GUID_FILE_PARAMETERS: Guid = Guid::from_bytes([
    0x37, 0x67, 0xA1, 0xCA, 0x36, 0xFA, 0x43, 0x4D, 0xB3, 0xB6, 0x33, 0xF0, 0xAA, 0x44, 0xE7, 0x6B,
]);
const GUID_VIRTUAL_DISK_SIZE: Guid = Guid::from_bytes([
    0x24, 0x42, 0xA5, 0x2F, 0x1B, 0xCD, 0x76, 0x48, 0xB2, 0x11, 0x5D, 0xBE, 0xD8, 0x3B, 0xF4, 0xB8,
]);
const GUID_VIRTUAL_DISK_ID: Guid = Guid::from_bytes([
    0xAB, 0x12, 0xCA, 0xBE, 0xE6, 0xB2, 0x23, 0x45, 0x93, 0xEF, 0xC3, 0x09, 0xE0, 0x00, 0xC7, 0x46,
]);
const GUID_LOGICAL_SECTOR_SIZE: Guid = Guid::from_bytes([
    0x1D, 0xBF, 0x41, 0x81, 0x6F, 0xA9, 0x09, 0x47, 0xBA, 0x47, 0xF2, 0x33, 0xA8, 0xFA, 0xAB, 0x5F,
]);
const GUID_PHYSICAL_SECTOR_SIZE: Guid = Guid::from_bytes([
    0xC7, 0x48, 0xA3, 0xCD, 0x5D, 0x44, 0x71, 0x44, 0x9C, 0xC9, 0xE9, 0x88, 0x52, 0x51, 0xC5, 0x56,
]);

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct HeaderWire {
    signature: U32,
    checksum: U32,
    sequence_number: U64,
    file_write_guid: [u8; 16],
    data_write_guid: [u8; 16],
    log_guid: [u8; 16],
    log_version: U16,
    version: U16,
    log_length: U32,
    log_offset: U64,
    reserved: [u8; 4016],
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RegionTableHeaderWire {
    signature: U32,
    checksum: U32,
    entry_count: U32,
    reserved: U32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RegionTableEntryWire {
    guid: [u8; 16],
    file_offset: U64,
    length: U32,
    flags: U32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct MetadataTableHeaderWire {
    signature: U64,
    reserved: U16,
    entry_count: U16,
    reserved2: [U32; 5],
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct MetadataTableEntryWire {
    item_id: [u8; 16],
    offset: U32,
    length: U32,
    flags: U32,
    reserved2: U32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct FileParametersWire {
    block_size: U32,
    flags: U32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct VirtualDiskSizeWire {
    virtual_disk_size: U64,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct VirtualDiskIdWire {
    virtual_disk_id: [u8; 16],
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct LogicalSectorSizeWire {
    logical_sector_size: U32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct PhysicalSectorSizeWire {
    physical_sector_size: U32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct LogEntryHeaderWire {
    signature: U32,
    checksum: U32,
    entry_length: U32,
    tail: U32,
    sequence_number: U64,
    descriptor_count: U32,
    reserved: U32,
    log_guid: [u8; 16],
    flushed_file_offset: U64,
    last_file_offset: U64,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct LogDataDescriptorWire {
    data_signature: U32,
    trailing_bytes: U32,
    leading_bytes: [U32; 2],
    file_offset: U64,
    sequence_number: U64,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct LogZeroDescriptorWire {
    zero_signature: U32,
    reserved: U32,
    zero_length: U64,
    file_offset: U64,
    sequence_number: U64,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct LogDataSectorWire {
    data_signature: U32,
    sequence_high: U32,
    data: [u8; 4084],
    sequence_low: U32,
}

const _: () = assert!(std::mem::size_of::<HeaderWire>() == HEADER_SIZE);
const _: () = assert!(std::mem::size_of::<RegionTableHeaderWire>() == 16);
const _: () = assert!(std::mem::size_of::<RegionTableEntryWire>() == 32);
const _: () = assert!(std::mem::size_of::<MetadataTableHeaderWire>() == 32);
const _: () = assert!(std::mem::size_of::<MetadataTableEntryWire>() == 32);
const _: () = assert!(std::mem::size_of::<LogEntryHeaderWire>() == 64);
const _: () = assert!(std::mem::size_of::<LogDataDescriptorWire>() == 32);
const _: () = assert!(std::mem::size_of::<LogZeroDescriptorWire>() == 32);
const _: () = assert!(std::mem::size_of::<LogDataSectorWire>() == 4096);

fn random_guid() -> Guid {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    bytes[7] = (bytes[7] & 0x0F) | 0x40;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;
    Guid::from_bytes(bytes)
}

#[derive(Clone)]
struct Header {
    sequence_number: u64,
    file_write_guid: Guid,
    data_write_guid: Guid,
    log_guid: Guid,
    log_version: u16,
    version: u16,
    log_length: u32,
    log_offset: u64,
}

fn read_header(file: &File, offset: u64) -> Result<Option<Header>> {
    let mut buf = [0u8; HEADER_SIZE];
    file.read_exact_at(&mut buf, offset)?;
    let wire = match HeaderWire::read_from_bytes(&buf[..]) {
        Ok(w) => w,
        Err(_) => return Ok(None),
    };
    if wire.signature.get() != SIG_HEAD {
        return Ok(None);
    }

    let stored_checksum = wire.checksum.get();
    let mut check_buf = buf;
    check_buf[4..8].fill(0);
    if crc32c(&check_buf) != stored_checksum {
        return Ok(None);
    }

    Ok(Some(Header {
        sequence_number: wire.sequence_number.get(),
        file_write_guid: Guid::from_bytes(wire.file_write_guid),
        data_write_guid: Guid::from_bytes(wire.data_write_guid),
        log_guid: Guid::from_bytes(wire.log_guid),
        log_version: wire.log_version.get(),
        version: wire.version.get(),
        log_length: wire.log_length.get(),
        log_offset: wire.log_offset.get(),
    }))
}

fn write_header(file: &File, header: &Header, offset: u64) -> Result<()> {
    let mut wire = HeaderWire {
        signature: SIG_HEAD.into(),
        checksum: 0u32.into(),
        sequence_number: header.sequence_number.into(),
        file_write_guid: header.file_write_guid.to_bytes(),
        data_write_guid: header.data_write_guid.to_bytes(),
        log_guid: header.log_guid.to_bytes(),
        log_version: header.log_version.into(),
        version: header.version.into(),
        log_length: header.log_length.into(),
        log_offset: header.log_offset.into(),
        reserved: [0; 4016],
    };
    let checksum = crc32c(wire.as_bytes());
    wire.checksum = checksum.into();
    file.write_all_at(wire.as_bytes(), offset)?;
    Ok(())
}

fn write_region_table(file: &File, bat_offset: u64, bat_size: u32, meta_offset: u64, meta_size: u32, offset: u64) -> Result<()> {
    let mut buf = vec![0u8; REGION_TABLE_SIZE];

    let header = RegionTableHeaderWire {
        signature: SIG_REGI.into(),
        checksum: 0u32.into(),
        entry_count: 2u32.into(),
        reserved: 0u32.into(),
    };
    buf[0..16].copy_from_slice(header.as_bytes());

    let bat_entry = RegionTableEntryWire {
        guid: GUID_BAT.to_bytes(),
        file_offset: bat_offset.into(),
        length: bat_size.into(),
        flags: REGI_FLAG_REQUIRED.into(),
    };
    buf[16..48].copy_from_slice(bat_entry.as_bytes());

    let meta_entry = RegionTableEntryWire {
        guid: GUID_METADATA.to_bytes(),
        file_offset: meta_offset.into(),
        length: meta_size.into(),
        flags: REGI_FLAG_REQUIRED.into(),
    };
    buf[48..80].copy_from_slice(meta_entry.as_bytes());

    let checksum = crc32c(&buf);
    buf[4..8].copy_from_slice(&checksum.to_le_bytes());

    file.write_all_at(&buf, offset)?;
    Ok(())
}

struct RegionTable {
    bat_offset: u64,
    bat_size: u32,
    meta_offset: u64,
    meta_size: u32,
}

fn read_region_table(file: &File, offset: u64) -> Result<RegionTable> {
    let mut buf = vec![0u8; REGION_TABLE_SIZE];
    file.read_exact_at(&mut buf, offset)?;

    let header = RegionTableHeaderWire::read_from_prefix(&buf)
        .map_err(|_| Error::Image(ImageError::Signature))?
        .0;
    if header.signature.get() != SIG_REGI {
        return Err(Error::Image(ImageError::Signature));
    }
    let stored_checksum = header.checksum.get();
    let mut check = buf.clone();
    check[4..8].fill(0);
    if crc32c(&check) != stored_checksum {
        return Err(Error::Image(ImageError::HeaderChecksum));
    }

    let mut bat = None;
    let mut meta = None;
    for n in 0..header.entry_count.get() as usize {
        let entry_off = 16 + n * 32;
        let entry = RegionTableEntryWire::read_from_prefix(&buf[entry_off..])
            .map_err(|_| Error::Image(ImageError::Signature))?
            .0;
        let guid = Guid::from_bytes(entry.guid);
        if guid == GUID_BAT {
            bat = Some((entry.file_offset.get(), entry.length.get()));
        } else if guid == GUID_METADATA {
            meta = Some((entry.file_offset.get(), entry.length.get()));
        } else if entry.flags.get() & REGI_FLAG_REQUIRED != 0 {
            return Err(Error::NotSupported("unknown required VHDX region"));
        }
    }

    let (bat_offset, bat_size) = bat.ok_or(Error::NotSupported("VHDX file has no BAT region"))?;
    let (meta_offset, meta_size) = meta.ok_or(Error::NotSupported("VHDX file has no metadata region"))?;
    Ok(RegionTable {
        bat_offset,
        bat_size,
        meta_offset,
        meta_size,
    })
}

struct Metadata {
    block_size: u32,
    leave_blocks_allocated: bool,
    has_parent: bool,
    disk_size: u64,
    virtual_disk_id: Guid,
    sector_size_logical: u32,
    sector_size_physical: u32,
}

fn read_metadata(file: &File, offset: u64, length: u32) -> Result<Metadata> {
    let mut buf = vec![0u8; length as usize];
    file.read_exact_at(&mut buf, offset)?;

    let header = MetadataTableHeaderWire::read_from_prefix(&buf)
        .map_err(|_| Error::Image(ImageError::Signature))?
        .0;
    if header.signature.get() != SIG_META {
        return Err(Error::Image(ImageError::Signature));
    }

    let mut block_size = 0u32;
    let mut flags = 0u32;
    let mut disk_size = 0u64;
    let mut virtual_disk_id = Guid::from_bytes([0; 16]);
    let mut sector_size_logical = DEFAULT_SECTOR_SIZE_LOGICAL;
    let mut sector_size_physical = DEFAULT_SECTOR_SIZE_PHYSICAL;

    for n in 0..header.entry_count.get() as usize {
        let entry_off = 32 + n * 32;
        let entry = MetadataTableEntryWire::read_from_prefix(&buf[entry_off..])
            .map_err(|_| Error::Image(ImageError::Signature))?
            .0;
        let guid = Guid::from_bytes(entry.item_id);
        let data_off = entry.offset.get() as usize;
        let data_len = entry.length.get() as usize;
        let data = buf
            .get(data_off..data_off + data_len)
            .ok_or_else(|| Error::InvalidData("VHDX metadata entry out of range".into()))?;

        if guid == GUID_FILE_PARAMETERS {
            let p = FileParametersWire::read_from_bytes(data).map_err(|_| Error::Image(ImageError::Signature))?;
            block_size = p.block_size.get();
            flags = p.flags.get();
        } else if guid == GUID_VIRTUAL_DISK_SIZE {
            let p = VirtualDiskSizeWire::read_from_bytes(data).map_err(|_| Error::Image(ImageError::Signature))?;
            disk_size = p.virtual_disk_size.get();
        } else if guid == GUID_VIRTUAL_DISK_ID {
            let p = VirtualDiskIdWire::read_from_bytes(data).map_err(|_| Error::Image(ImageError::Signature))?;
            virtual_disk_id = Guid::from_bytes(p.virtual_disk_id);
        } else if guid == GUID_LOGICAL_SECTOR_SIZE {
            let p = LogicalSectorSizeWire::read_from_bytes(data).map_err(|_| Error::Image(ImageError::Signature))?;
            sector_size_logical = p.logical_sector_size.get();
        } else if guid == GUID_PHYSICAL_SECTOR_SIZE {
            let p = PhysicalSectorSizeWire::read_from_bytes(data).map_err(|_| Error::Image(ImageError::Signature))?;
            sector_size_physical = p.physical_sector_size.get();
        }
        // Parent locator entries are recognized only to determine has_parent
        // via the file-parameters flags; their contents are never read.
    }

    Ok(Metadata {
        block_size,
        leave_blocks_allocated: flags & FILE_PARAM_LEAVE_BLOCKS_ALLOCATED != 0,
        has_parent: flags & FILE_PARAM_HAS_PARENT != 0,
        disk_size,
        virtual_disk_id,
        sector_size_logical,
        sector_size_physical,
    })
}

fn write_metadata(
    file: &File,
    offset: u64,
    block_size: u32,
    disk_size: u64,
    virtual_disk_id: Guid,
    sector_size_logical: u32,
    sector_size_physical: u32,
) -> Result<()> {
    let mut buf = vec![0u8; META_LENGTH as usize];

    let header = MetadataTableHeaderWire {
        signature: SIG_META.into(),
        reserved: 0u16.into(),
        entry_count: 5u16.into(),
        reserved2: [0u32.into(); 5],
    };
    buf[0..32].copy_from_slice(header.as_bytes());

    let mut data_off = 32 + 5 * 32;

    let mut put_entry = |n: usize, guid: Guid, data: &[u8], flags: u32, buf: &mut [u8], data_off: &mut usize| {
        let entry = MetadataTableEntryWire {
            item_id: guid.to_bytes(),
            offset: (*data_off as u32).into(),
            length: (data.len() as u32).into(),
            flags: flags.into(),
            reserved2: 0u32.into(),
        };
        buf[32 + n * 32..32 + n * 32 + 32].copy_from_slice(entry.as_bytes());
        buf[*data_off..*data_off + data.len()].copy_from_slice(data);
        *data_off += data.len();
    };

    let file_params = FileParametersWire {
        block_size: block_size.into(),
        flags: 0u32.into(),
    };
    put_entry(0, GUID_FILE_PARAMETERS, file_params.as_bytes(), META_FLAGS_IS_REQUIRED, &mut buf, &mut data_off);

    let vdisk_size = VirtualDiskSizeWire {
        virtual_disk_size: disk_size.into(),
    };
    put_entry(
        1,
        GUID_VIRTUAL_DISK_SIZE,
        vdisk_size.as_bytes(),
        META_FLAGS_IS_VIRTUAL_DISK | META_FLAGS_IS_REQUIRED,
        &mut buf,
        &mut data_off,
    );

    let vdisk_id = VirtualDiskIdWire {
        virtual_disk_id: virtual_disk_id.to_bytes(),
    };
    put_entry(
        2,
        GUID_VIRTUAL_DISK_ID,
        vdisk_id.as_bytes(),
        META_FLAGS_IS_VIRTUAL_DISK | META_FLAGS_IS_REQUIRED,
        &mut buf,
        &mut data_off,
    );

    let lss = LogicalSectorSizeWire {
        logical_sector_size: sector_size_logical.into(),
    };
    put_entry(
        3,
        GUID_LOGICAL_SECTOR_SIZE,
        lss.as_bytes(),
        META_FLAGS_IS_VIRTUAL_DISK | META_FLAGS_IS_REQUIRED,
        &mut buf,
        &mut data_off,
    );

    let pss = PhysicalSectorSizeWire {
        physical_sector_size: sector_size_physical.into(),
    };
    put_entry(
        4,
        GUID_PHYSICAL_SECTOR_SIZE,
        pss.as_bytes(),
        META_FLAGS_IS_VIRTUAL_DISK | META_FLAGS_IS_REQUIRED,
        &mut buf,
        &mut data_off,
    );

    file.write_all_at(&buf, offset)?;
    Ok(())
}

struct PendingLog {
    log_guid: Guid,
    writes: Vec<(u64, [u8; 4096])>,
}

struct State {
    active_header: usize,
    headers: [Header; 2],
    bat: Vec<u64>,
    file_size: u64,
    log_seqno: u64,
    log_tail: u32,
    pending_log: Option<PendingLog>,
    data_write_guid_updated: bool,
    file_write_guid_updated: bool,
}

/// A VHDX-backed logical disk with a write-ahead-logged Block Allocation
/// Table.
pub struct VhdxWriter {
    file: File,
    writable: bool,
    bat_offset: u64,
    meta_offset: u64,
    meta_size: u32,
    block_size: u32,
    disk_size: u64,
    sector_size_logical: u32,
    chunk_ratio: u64,
    state: RefCell<State>,
}

impl VhdxWriter {
    /// Lays out a fresh VHDX file of `disk_size` bytes: identifier, two
    /// headers, two region tables, an empty log, metadata table and BAT.
    pub fn create(path: impl AsRef<Path>, disk_size: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;

        let mut ident = vec![0u8; 0x10000];
        ident[0..8].copy_from_slice(&VHDX_SIGNATURE.to_le_bytes());
        for (n, c) in "fsdump 0.1".encode_utf16().enumerate() {
            ident[8 + n * 2..8 + n * 2 + 2].copy_from_slice(&c.to_le_bytes());
        }
        file.write_all_at(&ident, 0)?;

        let block_size = DEFAULT_BLOCK_SIZE;
        let sector_size_logical = DEFAULT_SECTOR_SIZE_LOGICAL;
        let sector_size_physical = DEFAULT_SECTOR_SIZE_PHYSICAL;
        let chunk_ratio = ((sector_size_logical as u64) << 23) / block_size as u64;
        let data_blocks_count = (disk_size + block_size as u64 - 1) / block_size as u64;
        let bat_entries_count = data_blocks_count + data_blocks_count.saturating_sub(1) / chunk_ratio;

        let mut bat_size = bat_entries_count * BAT_ENTRY_SIZE;
        if bat_size & 0xFFFFF != 0 {
            bat_size = (bat_size + 0x100000) & !0xFFFFF;
        }
        let bat_size = bat_size as u32;

        let headers = [
            Header {
                sequence_number: 1,
                file_write_guid: random_guid(),
                data_write_guid: random_guid(),
                log_guid: Guid::from_bytes([0; 16]),
                log_version: 0,
                version: 1,
                log_length: LOG_LENGTH,
                log_offset: LOG_OFFSET,
            },
            Header {
                sequence_number: 2,
                file_write_guid: random_guid(),
                data_write_guid: random_guid(),
                log_guid: Guid::from_bytes([0; 16]),
                log_version: 0,
                version: 1,
                log_length: LOG_LENGTH,
                log_offset: LOG_OFFSET,
            },
        ];
        write_header(&file, &headers[0], HEADER1_OFFSET)?;
        write_header(&file, &headers[1], HEADER2_OFFSET)?;

        write_region_table(&file, BAT_OFFSET, bat_size, META_OFFSET, META_LENGTH, REGION1_OFFSET)?;
        write_region_table(&file, BAT_OFFSET, bat_size, META_OFFSET, META_LENGTH, REGION2_OFFSET)?;

        let virtual_disk_id = random_guid();
        write_metadata(&file, META_OFFSET, block_size, disk_size, virtual_disk_id, sector_size_logical, sector_size_physical)?;

        let file_size = BAT_OFFSET + bat_size as u64;
        file.set_len(file_size)?;

        debug!("created VHDX of {disk_size:#x} bytes, block size {block_size:#x}, {bat_entries_count} BAT entries");

        Ok(Self {
            file,
            writable: true,
            bat_offset: BAT_OFFSET,
            meta_offset: META_OFFSET,
            meta_size: META_LENGTH,
            block_size,
            disk_size,
            sector_size_logical,
            chunk_ratio,
            state: RefCell::new(State {
                active_header: 1,
                headers,
                bat: vec![0u64; bat_entries_count as usize],
                file_size,
                log_seqno: 0,
                log_tail: 0,
                pending_log: None,
                data_write_guid_updated: false,
                file_write_guid_updated: false,
            }),
        })
    }

    /// Opens an existing VHDX, selecting the active header, replaying the
    /// log if needed, and loading the region table, metadata and BAT.
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;

        let mut ident_sig = [0u8; 8];
        file.read_exact_at(&mut ident_sig, 0)?;
        if u64::from_le_bytes(ident_sig) != VHDX_SIGNATURE {
            return Err(Error::Image(ImageError::Signature));
        }

        let h0 = read_header(&file, HEADER1_OFFSET)?;
        let h1 = read_header(&file, HEADER2_OFFSET)?;
        let (active_header, headers) = match (h0, h1) {
            (None, None) => return Err(Error::Image(ImageError::Signature)),
            (Some(a), None) => {
                let b = a.clone();
                (0, [a, b])
            }
            (None, Some(b)) => {
                let a = b.clone();
                (1, [a, b])
            }
            (Some(a), Some(b)) => {
                if b.sequence_number > a.sequence_number {
                    (1, [a, b])
                } else {
                    (0, [a, b])
                }
            }
        };

        let needs_replay = !headers[active_header].log_guid.is_nil();
        if needs_replay && !writable {
            return Err(Error::Device(DeviceError::ReadOnlyMedia));
        }

        let region_offset = if active_header == 0 { REGION1_OFFSET } else { REGION2_OFFSET };
        let region = read_region_table(&file, region_offset)?;

        let meta = read_metadata(&file, region.meta_offset, region.meta_size)?;
        if meta.has_parent {
            return Err(Error::NotSupported("differencing VHDX (has_parent)"));
        }
        let _ = meta.leave_blocks_allocated; // not relevant without differencing support

        if meta.block_size == 0 {
            return Err(Error::InvalidData("VHDX block size is zero".into()));
        }
        let chunk_ratio = ((meta.sector_size_logical as u64) << 23) / meta.block_size as u64;
        if chunk_ratio == 0 {
            return Err(Error::InvalidData("VHDX chunk ratio is zero".into()));
        }
        let data_blocks_count = (meta.disk_size + meta.block_size as u64 - 1) / meta.block_size as u64;
        let bat_entries_count = data_blocks_count + data_blocks_count.saturating_sub(1) / chunk_ratio;

        let mut raw_bat = vec![0u8; region.bat_size as usize];
        file.read_exact_at(&mut raw_bat, region.bat_offset)?;
        let mut bat = vec![0u64; bat_entries_count as usize];
        for (entry, chunk) in bat.iter_mut().zip(raw_bat.chunks_exact(8)) {
            *entry = u64::from_le_bytes(chunk.try_into().unwrap());
        }

        let file_size = file.metadata()?.len();

        let mut writer = Self {
            file,
            writable,
            bat_offset: region.bat_offset,
            meta_offset: region.meta_offset,
            meta_size: region.meta_size,
            block_size: meta.block_size,
            disk_size: meta.disk_size,
            sector_size_logical: meta.sector_size_logical,
            chunk_ratio,
            state: RefCell::new(State {
                active_header,
                headers,
                bat,
                file_size,
                log_seqno: 0,
                log_tail: 0,
                pending_log: None,
                data_write_guid_updated: false,
                file_write_guid_updated: false,
            }),
        };

        if needs_replay {
            writer.log_replay()?;
        }

        debug!(
            "opened VHDX of {:#x} bytes, block size {:#x}, virtual disk id {}",
            writer.disk_size, writer.block_size, meta.virtual_disk_id
        );

        Ok(writer)
    }

    pub fn close(self) -> Result<()> {
        if self.writable {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn bat_index(&self, block: u64) -> u64 {
        block + block / self.chunk_ratio
    }

    fn flip_header(&self, state: &mut State, mutate: impl FnOnce(&mut Header)) -> Result<()> {
        let inactive = 1 - state.active_header;
        let mut header = state.headers[state.active_header].clone();
        header.sequence_number += 1;
        mutate(&mut header);

        let offset = if inactive == 0 { HEADER1_OFFSET } else { HEADER2_OFFSET };
        write_header(&self.file, &header, offset)?;
        state.headers[inactive] = header;
        state.active_header = inactive;
        Ok(())
    }

    /// Flips twice so both on-disk header copies converge on the same
    /// value, per spec.md §4.D's `log_complete`/GUID-update protocol.
    fn flip_header_twice(&self, state: &mut State, value: impl Fn(&mut Header) + Copy) -> Result<()> {
        self.flip_header(state, value)?;
        self.flip_header(state, value)?;
        Ok(())
    }

    fn update_file_write_guid(&self, state: &mut State) -> Result<()> {
        let guid = random_guid();
        self.flip_header_twice(state, move |h| h.file_write_guid = guid)
    }

    fn update_data_write_guid(&self, state: &mut State) -> Result<()> {
        let guid = random_guid();
        self.flip_header_twice(state, move |h| h.data_write_guid = guid)
    }

    fn log_start(&self, state: &mut State) -> Result<()> {
        let guid = random_guid();
        self.flip_header(state, move |h| h.log_guid = guid)?;
        state.pending_log = Some(PendingLog { log_guid: guid, writes: Vec::new() });
        Ok(())
    }

    fn log_write(&self, state: &mut State, offset: u64, page: &[u8; 4096]) -> Result<()> {
        state
            .pending_log
            .as_mut()
            .expect("log_write called without a prior log_start")
            .writes
            .push((offset, *page));
        Ok(())
    }

    fn log_commit(&self, state: &mut State) -> Result<()> {
        let pending = state.pending_log.take().expect("log_commit called without a prior log_start");
        state.log_seqno += 1;
        let seqno = state.log_seqno;

        let descriptor_count = pending.writes.len();
        let header_sectors = (64 + descriptor_count * 32).div_ceil(4096);
        let entry_length = (header_sectors + descriptor_count) * 4096;

        let log_length = state.headers[state.active_header].log_length;
        let log_offset = state.headers[state.active_header].log_offset;
        if entry_length > log_length as usize {
            return Err(Error::Image(ImageError::Full));
        }

        let mut tail = state.log_tail;
        if tail as usize + entry_length > log_length as usize {
            tail = 0;
        }

        let mut entry = vec![0u8; entry_length];
        let header = LogEntryHeaderWire {
            signature: SIG_LOGE.into(),
            checksum: 0u32.into(),
            entry_length: (entry_length as u32).into(),
            tail: tail.into(),
            sequence_number: seqno.into(),
            descriptor_count: (descriptor_count as u32).into(),
            reserved: 0u32.into(),
            log_guid: pending.log_guid.to_bytes(),
            flushed_file_offset: state.file_size.into(),
            last_file_offset: state.file_size.into(),
        };
        entry[0..64].copy_from_slice(header.as_bytes());

        let mut desc_pos = 64;
        let mut data_pos = header_sectors * 4096;
        for (offset, page) in &pending.writes {
            let descriptor = LogDataDescriptorWire {
                data_signature: SIG_DESC.into(),
                trailing_bytes: u32::from_le_bytes(page[4092..4096].try_into().unwrap()).into(),
                leading_bytes: [
                    u32::from_le_bytes(page[0..4].try_into().unwrap()).into(),
                    u32::from_le_bytes(page[4..8].try_into().unwrap()).into(),
                ],
                file_offset: (*offset).into(),
                sequence_number: seqno.into(),
            };
            entry[desc_pos..desc_pos + 32].copy_from_slice(descriptor.as_bytes());
            desc_pos += 32;

            let sector = LogDataSectorWire {
                data_signature: SIG_DATA.into(),
                sequence_high: ((seqno >> 32) as u32).into(),
                data: page[8..4092].try_into().unwrap(),
                sequence_low: (seqno as u32).into(),
            };
            entry[data_pos..data_pos + 4096].copy_from_slice(sector.as_bytes());
            data_pos += 4096;
        }

        let checksum = crc32c(&entry);
        entry[4..8].copy_from_slice(&checksum.to_le_bytes());

        self.file.write_all_at(&entry, log_offset + tail as u64)?;
        self.file.sync_data()?;

        state.log_tail = (tail as usize + entry_length) as u32;
        Ok(())
    }

    fn log_complete(&self, state: &mut State) -> Result<()> {
        self.flip_header_twice(state, |h| h.log_guid = Guid::from_bytes([0; 16]))
    }

    /// Replays the active header's log: every `desc` descriptor's target
    /// page is reconstructed from its leading/trailing bytes plus the
    /// accompanying data sector and written in place; `zero` descriptors
    /// zero-fill their target range. Clears `LogGuid` on success.
    fn log_replay(&mut self) -> Result<()> {
        let (log_offset, log_length, log_guid) = {
            let state = self.state.borrow();
            let h = &state.headers[state.active_header];
            (h.log_offset, h.log_length as usize, h.log_guid)
        };

        let mut log = vec![0u8; log_length];
        self.file.read_exact_at(&mut log, log_offset)?;

        let mut off = 0usize;
        while off + 64 <= log.len() {
            let header = match LogEntryHeaderWire::read_from_prefix(&log[off..]) {
                Ok((h, _)) => h,
                Err(_) => break,
            };
            if header.signature.get() != SIG_LOGE {
                off += 4096;
                continue;
            }

            let entry_length = header.entry_length.get() as usize;
            if entry_length == 0 || entry_length % 4096 != 0 || off + entry_length > log.len() {
                break;
            }

            let mut check = log[off..off + entry_length].to_vec();
            check[4..8].fill(0);
            if crc32c(&check) != header.checksum.get() {
                off += 4096;
                continue;
            }
            if Guid::from_bytes(header.log_guid) != log_guid {
                off += 4096;
                continue;
            }

            let descriptor_count = header.descriptor_count.get() as usize;
            let header_sectors = (64 + descriptor_count * 32).div_ceil(4096);
            let mut desc_pos = off + 64;
            let mut data_pos = off + header_sectors * 4096;

            for _ in 0..descriptor_count {
                let signature = u32::from_le_bytes(log[desc_pos..desc_pos + 4].try_into().unwrap());
                if signature == SIG_DESC {
                    let descriptor = LogDataDescriptorWire::read_from_bytes(&log[desc_pos..desc_pos + 32])
                        .map_err(|_| Error::Image(ImageError::LogTorn))?;
                    let sector = LogDataSectorWire::read_from_bytes(&log[data_pos..data_pos + 4096])
                        .map_err(|_| Error::Image(ImageError::LogTorn))?;

                    let seq = ((sector.sequence_high.get() as u64) << 32) | sector.sequence_low.get() as u64;
                    if seq != descriptor.sequence_number.get() {
                        return Err(Error::Image(ImageError::LogTorn));
                    }

                    let mut page = [0u8; 4096];
                    page[0..4].copy_from_slice(&descriptor.leading_bytes[0].get().to_le_bytes());
                    page[4..8].copy_from_slice(&descriptor.leading_bytes[1].get().to_le_bytes());
                    page[8..4092].copy_from_slice(&sector.data);
                    page[4092..4096].copy_from_slice(&descriptor.trailing_bytes.get().to_le_bytes());

                    self.file.write_all_at(&page, descriptor.file_offset.get())?;
                    data_pos += 4096;
                } else if signature == SIG_ZERO {
                    let descriptor = LogZeroDescriptorWire::read_from_bytes(&log[desc_pos..desc_pos + 32])
                        .map_err(|_| Error::Image(ImageError::LogTorn))?;
                    let zeros = vec![0u8; descriptor.zero_length.get() as usize];
                    self.file.write_all_at(&zeros, descriptor.file_offset.get())?;
                }
                desc_pos += 32;
            }

            off += entry_length;
        }

        self.file.sync_data()?;

        let mut state = self.state.borrow_mut();
        self.log_complete(&mut state)?;
        debug!("replayed VHDX log, LogGuid cleared");
        Ok(())
    }

    fn commit_bat_page(&self, state: &mut State, bat_index: usize) -> Result<()> {
        let page_index = bat_index / BAT_ENTRIES_PER_PAGE;
        let page_start = page_index * BAT_ENTRIES_PER_PAGE;
        let page_end = (page_start + BAT_ENTRIES_PER_PAGE).min(state.bat.len());

        let mut page = [0u8; BAT_PAGE_SIZE];
        for (n, entry) in state.bat[page_start..page_end].iter().enumerate() {
            page[n * 8..n * 8 + 8].copy_from_slice(&entry.to_le_bytes());
        }
        let page_offset = self.bat_offset + page_index as u64 * BAT_PAGE_SIZE as u64;

        self.log_start(state)?;
        self.log_write(state, page_offset, &page)?;
        self.log_commit(state)?;
        self.file.write_all_at(&page, page_offset)?;
        self.log_complete(state)?;
        Ok(())
    }

    fn alloc_block(&self, state: &mut State, block: u64) -> Result<u64> {
        if !state.file_write_guid_updated {
            state.file_write_guid_updated = true;
            self.update_file_write_guid(state)?;
        }

        let offset = state.file_size;
        state.file_size += self.block_size as u64;
        self.file.set_len(state.file_size)?;

        let index = self.bat_index(block) as usize;
        state.bat[index] = offset | PAYLOAD_BLOCK_FULLY_PRESENT;
        self.commit_bat_page(state, index)?;

        Ok(offset)
    }
}

impl ByteSource for VhdxWriter {
    fn size(&self) -> u64 {
        self.disk_size
    }

    fn sector_size(&self) -> u64 {
        self.sector_size_logical as u64
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let end = offset.checked_add(buffer.len() as u64).ok_or(Error::Device(DeviceError::OutOfBounds))?;
        if end > self.disk_size {
            return Err(Error::Device(DeviceError::OutOfBounds));
        }

        let state = self.state.borrow();
        let mut off = offset;
        let mut rest = buffer;
        while !rest.is_empty() {
            let block = off / self.block_size as u64;
            let off_in_block = off % self.block_size as u64;
            let chunk = rest.len().min((self.block_size as u64 - off_in_block) as usize);

            let entry = state.bat[self.bat_index(block) as usize];
            let bat_state = entry & 7;
            let file_offset = entry & !0xFFFFF;

            match bat_state {
                PAYLOAD_BLOCK_FULLY_PRESENT => {
                    self.file.read_exact_at(&mut rest[..chunk], file_offset + off_in_block)?;
                }
                PAYLOAD_BLOCK_PARTIALLY_PRESENT => {
                    return Err(Error::NotSupported("partially-present VHDX block"));
                }
                PAYLOAD_BLOCK_NOT_PRESENT | PAYLOAD_BLOCK_UNDEFINED | PAYLOAD_BLOCK_ZERO | PAYLOAD_BLOCK_UNMAPPED => {
                    rest[..chunk].fill(0);
                }
                _ => return Err(Error::InvalidData("unrecognized VHDX BAT entry state".into())),
            }

            off += chunk as u64;
            rest = &mut rest[chunk..];
        }
        Ok(())
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::PermissionDenied);
        }
        let end = offset.checked_add(buffer.len() as u64).ok_or(Error::Device(DeviceError::OutOfBounds))?;
        if end > self.disk_size {
            return Err(Error::Device(DeviceError::OutOfBounds));
        }

        let mut state = self.state.borrow_mut();
        if !state.data_write_guid_updated {
            state.data_write_guid_updated = true;
            self.update_data_write_guid(&mut state)?;
        }

        let mut off = offset;
        let mut rest = buffer;
        while !rest.is_empty() {
            let block = off / self.block_size as u64;
            let off_in_block = off % self.block_size as u64;
            let chunk = rest.len().min((self.block_size as u64 - off_in_block) as usize);

            let index = self.bat_index(block) as usize;
            let entry = state.bat[index];
            let file_offset = if entry & 7 == PAYLOAD_BLOCK_FULLY_PRESENT {
                entry & !0xFFFFF
            } else {
                self.alloc_block(&mut state, block)?
            };

            self.file.write_all_at(&rest[..chunk], file_offset + off_in_block)?;
            off += chunk as u64;
            rest = &rest[chunk..];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("fsdump-vhdx-test-{}-{}", std::process::id(), name))
    }

    #[test]
    fn fresh_image_reads_zero() {
        let path = temp_path("fresh");
        let writer = VhdxWriter::create(&path, 0x4000_0000).unwrap();
        let mut buf = [0xAAu8; 0x1000];
        writer.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 0x1000]);
        writer.close().unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn write_allocates_and_reads_back() {
        let path = temp_path("alloc");
        let writer = VhdxWriter::create(&path, 0x8000_0000).unwrap();
        writer.write(0, b"TEST").unwrap();
        writer.write(0x4000_0000 - 0x1000, b"TEST").unwrap();

        let mut buf = [0u8; 4];
        writer.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"TEST");
        writer.read(0x4000_0000 - 0x1000, &mut buf).unwrap();
        assert_eq!(&buf, b"TEST");

        let mut zero = [0u8; 4];
        writer.read(4, &mut zero).unwrap();
        assert_eq!(zero, [0u8; 4]);

        writer.close().unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn round_trips_across_reopen() {
        let path = temp_path("reopen");
        {
            let writer = VhdxWriter::create(&path, 0x4000_0000).unwrap();
            writer.write(0x1234, b"hello").unwrap();
            writer.close().unwrap();
        }

        let writer = VhdxWriter::open(&path, false).unwrap();
        let mut buf = [0u8; 5];
        writer.read(0x1234, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_only_rejects_writes() {
        let path = temp_path("ro");
        VhdxWriter::create(&path, 0x1000).unwrap().close().unwrap();
        let writer = VhdxWriter::open(&path, false).unwrap();
        assert!(matches!(writer.write(0, b"x"), Err(Error::PermissionDenied)));
    }

    #[test]
    fn write_past_end_is_invalid() {
        let path = temp_path("oob");
        let writer = VhdxWriter::create(&path, 0x1000).unwrap();
        assert!(writer.write(0x1000, b"x").is_err());
        writer.close().unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn replays_a_torn_write_from_the_log() {
        // Create a clean VHDX, then hand-craft a log entry describing a BAT
        // page 0 mutation and mark the active header's LogGuid non-zero, as
        // if a crash happened between `log_commit` and `log_complete`.
        let path = temp_path("replay");
        let log_offset;
        let log_guid = random_guid();
        {
            let writer = VhdxWriter::create(&path, 0x4000_0000).unwrap();
            log_offset = writer.state.borrow().headers[writer.state.borrow().active_header].log_offset;
            writer.close().unwrap();
        }

        let mut page = [0u8; 4096];
        page[0..8].copy_from_slice(b"CRASHTST");
        let bat_page_file_offset = BAT_OFFSET;
        let seqno = 1u64;

        let descriptor = LogDataDescriptorWire {
            data_signature: SIG_DESC.into(),
            trailing_bytes: u32::from_le_bytes(page[4092..4096].try_into().unwrap()).into(),
            leading_bytes: [
                u32::from_le_bytes(page[0..4].try_into().unwrap()).into(),
                u32::from_le_bytes(page[4..8].try_into().unwrap()).into(),
            ],
            file_offset: bat_page_file_offset.into(),
            sequence_number: seqno.into(),
        };
        let sector = LogDataSectorWire {
            data_signature: SIG_DATA.into(),
            sequence_high: ((seqno >> 32) as u32).into(),
            data: page[8..4092].try_into().unwrap(),
            sequence_low: (seqno as u32).into(),
        };

        let entry_length = 4096 * 2;
        let mut entry = vec![0u8; entry_length];
        let header = LogEntryHeaderWire {
            signature: SIG_LOGE.into(),
            checksum: 0u32.into(),
            entry_length: (entry_length as u32).into(),
            tail: 0u32.into(),
            sequence_number: seqno.into(),
            descriptor_count: 1u32.into(),
            reserved: 0u32.into(),
            log_guid: log_guid.to_bytes(),
            flushed_file_offset: 0u64.into(),
            last_file_offset: 0u64.into(),
        };
        entry[0..64].copy_from_slice(header.as_bytes());
        entry[64..96].copy_from_slice(descriptor.as_bytes());
        entry[4096..8192].copy_from_slice(sector.as_bytes());
        let checksum = crc32c(&entry);
        entry[4..8].copy_from_slice(&checksum.to_le_bytes());

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&entry, log_offset).unwrap();

        // Mark the active header's LogGuid non-zero (simulate a crash that
        // committed the log entry but never ran log_complete).
        let h0 = read_header(&file, HEADER1_OFFSET).unwrap().unwrap();
        let h1 = read_header(&file, HEADER2_OFFSET).unwrap().unwrap();
        let (active, mut active_header) = if h1.sequence_number > h0.sequence_number { (1, h1) } else { (0, h0) };
        active_header.sequence_number += 1;
        active_header.log_guid = log_guid;
        let offset = if active == 0 { HEADER2_OFFSET } else { HEADER1_OFFSET };
        write_header(&file, &active_header, offset).unwrap();
        drop(file);

        let writer = VhdxWriter::open(&path, true).unwrap();
        let mut replayed_page = vec![0u8; 4096];
        writer.file.read_exact_at(&mut replayed_page, BAT_OFFSET).unwrap();
        assert_eq!(&replayed_page[0..8], b"CRASHTST");
        assert!(writer.state.borrow().headers[writer.state.borrow().active_header].log_guid.is_nil());

        writer.close().unwrap();
        std::fs::remove_file(&path).unwrap();
    }
}
