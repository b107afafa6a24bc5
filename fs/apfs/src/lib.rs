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

//! Walks an APFS container's space manager to find which blocks are
//! actually in use, instead of reading the filesystem tree itself. This is
//! enough to dump a container without interpreting any of its file data.

use fsdump_checksum::verify_fletcher64_block;
use fsdump_fs::{ByteSource, Error, FsError, FsScanner, Result};
use log::error;
use zerocopy::{
    little_endian::{U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

const NX_DEFAULT_BLOCK_SIZE: u64 = 4096;
const NX_MAGIC: &[u8; 4] = b"NXSB";
const OBJECT_TYPE_MASK: u32 = 0x0000_FFFF;
const OBJECT_TYPE_SPACEMAN: u32 = 0x5;
const OBJECT_TYPE_SPACEMAN_CIB: u32 = 0x7;
const SD_MAIN: usize = 0;
// Matches the 4 MiB read-ahead buffer the original copier used.
const COPY_CHUNK: usize = 0x40_0000;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct ObjPhys {
    cksum: U64,
    oid: U64,
    xid: U64,
    obj_type: U32,
    subtype: U32,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct NxSuperblockPrefix {
    o: ObjPhys,
    magic: [u8; 4],
    block_size: U32,
    block_count: U64,
    features: U64,
    readonly_compatible_features: U64,
    incompatible_features: U64,
    uuid: [u8; 16],
    next_oid: U64,
    next_xid: U64,
    xp_desc_blocks: U32,
    xp_data_blocks: U32,
    xp_desc_base: U64,
    xp_data_base: U64,
    xp_desc_next: U32,
    xp_data_next: U32,
    xp_desc_index: U32,
    xp_desc_len: U32,
    xp_data_index: U32,
    xp_data_len: U32,
    spaceman_oid: U64,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct CheckpointMapPhysHeader {
    o: ObjPhys,
    flags: U32,
    count: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct CheckpointMapping {
    cpm_type: U32,
    cpm_subtype: U32,
    cpm_size: U32,
    cpm_pad: U32,
    cpm_fs_oid: U64,
    cpm_oid: U64,
    cpm_paddr: U64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct SpacemanDevice {
    block_count: U64,
    chunk_count: U64,
    cib_count: U32,
    cab_count: U32,
    free_count: U64,
    addr_offset: U32,
    reserved: U32,
    reserved2: U64,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct SpacemanPrefix {
    o: ObjPhys,
    block_size: U32,
    blocks_per_chunk: U32,
    chunks_per_cib: U32,
    cibs_per_cab: U32,
    dev: [SpacemanDevice; 2],
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct ChunkInfoBlockHeader {
    o: ObjPhys,
    index: U32,
    chunk_info_count: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct ChunkInfo {
    xid: U64,
    addr: U64,
    block_count: U32,
    free_count: U32,
    bitmap_addr: U64,
}

/// An APFS container, identified by its `NXSB` superblock at block 0 of the
/// partition.
pub struct ApfsScanner<'a> {
    source: &'a dyn ByteSource,
}

impl<'a> ApfsScanner<'a> {
    /// Validates the container superblock at block 0 of `source`. `source`
    /// is expected to already be windowed to the partition.
    pub fn new(source: &'a dyn ByteSource) -> Result<Self> {
        let mut block = vec![0u8; NX_DEFAULT_BLOCK_SIZE as usize];
        source.read(0, &mut block)?;

        if !verify_fletcher64_block(&block) {
            error!("APFS container superblock failed Fletcher-64 verification");
            return Err(Error::Fs(FsError::BlockChecksum));
        }

        let (sb, _) = NxSuperblockPrefix::read_from_prefix(&block)
            .map_err(|_| Error::Fs(FsError::Inconsistent))?;

        if &sb.magic != NX_MAGIC {
            error!("Not an APFS container (nx_magic mismatch)");
            return Err(Error::Fs(FsError::Inconsistent));
        }
        if sb.block_size.get() as u64 != NX_DEFAULT_BLOCK_SIZE {
            error!("Unsupported APFS block size {}", sb.block_size.get());
            return Err(Error::Fs(FsError::Inconsistent));
        }

        Ok(Self { source })
    }

    fn read_block(&self, paddr: u64, buf: &mut [u8]) -> Result<()> {
        self.source.read(paddr * NX_DEFAULT_BLOCK_SIZE, buf)
    }

    fn read_verified_block(&self, paddr: u64, buf: &mut [u8]) -> Result<()> {
        self.read_block(paddr, buf)?;
        if !verify_fletcher64_block(buf) {
            error!("Block verification failed at {:#x}", paddr);
            return Err(Error::Fs(FsError::BlockChecksum));
        }
        Ok(())
    }

    fn copy_range(&self, dst: &dyn ByteSource, paddr: u64, blocks: u64) -> Result<()> {
        let mut offset = paddr * NX_DEFAULT_BLOCK_SIZE;
        let mut remaining = blocks * NX_DEFAULT_BLOCK_SIZE;
        let mut buf = vec![0u8; COPY_CHUNK.min(remaining.max(1) as usize)];

        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            self.source.read(offset, &mut buf[..chunk])?;
            dst.write(offset, &buf[..chunk])?;
            offset += chunk as u64;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    /// Finds the current checkpoint's spaceman object by walking the
    /// checkpoint descriptor ring forward from `nx_xp_desc_index`, the way
    /// `Apfs::CopyData` does: advance by `xp_desc_len - 1` each step
    /// (wrapping modulo `xp_desc_blocks`), stop once the transaction id
    /// stops increasing.
    fn find_spaceman(&self, sb: &NxSuperblockPrefix) -> Result<(u64, u32)> {
        let base = sb.xp_desc_base.get();
        let blocks = sb.xp_desc_blocks.get();
        let len = sb.xp_desc_len.get();

        let mut idx = sb.xp_desc_index.get();
        let mut max_xid = 0u64;
        let mut max_paddr = base;
        let mut candidate = vec![0u8; NX_DEFAULT_BLOCK_SIZE as usize];

        loop {
            idx = idx.wrapping_add(len).wrapping_sub(1);
            if idx >= blocks {
                idx -= blocks;
            }
            self.read_verified_block(base + idx as u64, &mut candidate)?;
            let (cur, _) = NxSuperblockPrefix::read_from_prefix(&candidate)
                .map_err(|_| Error::Fs(FsError::Inconsistent))?;

            let xid = cur.o.xid.get();
            if xid < max_xid {
                break;
            }
            max_xid = xid;
            max_paddr = base + idx as u64;
            idx = cur.xp_desc_next.get();
        }

        self.read_verified_block(max_paddr, &mut candidate)?;
        let (latest, _) = NxSuperblockPrefix::read_from_prefix(&candidate)
            .map_err(|_| Error::Fs(FsError::Inconsistent))?;
        let cpm_idx = latest.xp_desc_index.get();

        let mut cpm_block = vec![0u8; NX_DEFAULT_BLOCK_SIZE as usize];
        self.read_verified_block(base + cpm_idx as u64, &mut cpm_block)?;
        let (cpm_header, rest) = CheckpointMapPhysHeader::read_from_prefix(&cpm_block)
            .map_err(|_| Error::Fs(FsError::Inconsistent))?;

        let entry_size = std::mem::size_of::<CheckpointMapping>();
        for i in 0..cpm_header.count.get() as usize {
            let start = i * entry_size;
            let mapping = CheckpointMapping::read_from_bytes(&rest[start..start + entry_size])
                .map_err(|_| Error::Fs(FsError::Inconsistent))?;
            if (mapping.cpm_type.get() & OBJECT_TYPE_MASK) == OBJECT_TYPE_SPACEMAN {
                return Ok((mapping.cpm_paddr.get(), mapping.cpm_size.get()));
            }
        }

        Err(Error::Fs(FsError::Inconsistent))
    }

    fn copy_via_spaceman(&self, dst: &dyn ByteSource, sm_paddr: u64, sm_size: u32) -> Result<()> {
        let mut sm_buf = vec![0u8; sm_size as usize];
        self.read_verified_block(sm_paddr, &mut sm_buf)?;

        let (sm, _) = SpacemanPrefix::read_from_prefix(&sm_buf)
            .map_err(|_| Error::Fs(FsError::Inconsistent))?;
        if (sm.o.obj_type.get() & OBJECT_TYPE_MASK) != OBJECT_TYPE_SPACEMAN {
            return Err(Error::Fs(FsError::Inconsistent));
        }

        let dev = sm.dev[SD_MAIN];
        if dev.cab_count.get() > 0 {
            return Err(Error::Fs(FsError::ChunkInfoAddressBlock));
        }

        let addr_offset = dev.addr_offset.get() as usize;
        for i in 0..dev.cib_count.get() as usize {
            let start = addr_offset + i * 8;
            let addr = u64::from_le_bytes(sm_buf[start..start + 8].try_into().unwrap());
            self.copy_cib(dst, addr)?;
        }
        Ok(())
    }

    fn copy_cib(&self, dst: &dyn ByteSource, cib_paddr: u64) -> Result<()> {
        let mut cib_block = vec![0u8; NX_DEFAULT_BLOCK_SIZE as usize];
        self.read_verified_block(cib_paddr, &mut cib_block)?;

        let (header, rest) = ChunkInfoBlockHeader::read_from_prefix(&cib_block)
            .map_err(|_| Error::Fs(FsError::Inconsistent))?;
        if (header.o.obj_type.get() & OBJECT_TYPE_MASK) != OBJECT_TYPE_SPACEMAN_CIB {
            return Err(Error::Fs(FsError::Inconsistent));
        }

        let entry_size = std::mem::size_of::<ChunkInfo>();
        let mut bitmap = vec![0u8; NX_DEFAULT_BLOCK_SIZE as usize];

        for i in 0..header.chunk_info_count.get() as usize {
            let start = i * entry_size;
            let ci = ChunkInfo::read_from_bytes(&rest[start..start + entry_size])
                .map_err(|_| Error::Fs(FsError::Inconsistent))?;

            let addr = ci.addr.get();
            let block_count = ci.block_count.get();
            let free_count = ci.free_count.get();

            if free_count == block_count {
                continue;
            } else if free_count == 0 {
                self.copy_range(dst, addr, block_count as u64)?;
            } else {
                self.read_block(ci.bitmap_addr.get(), &mut bitmap)?;
                let mut run_start: Option<u64> = None;

                for blk in 0..block_count {
                    let used = (bitmap[(blk >> 3) as usize] >> (blk & 7)) & 1 != 0;
                    match (used, run_start) {
                        (true, None) => run_start = Some(addr + blk as u64),
                        (false, Some(start)) => {
                            self.copy_range(dst, start, (addr + blk as u64) - start)?;
                            run_start = None;
                        }
                        _ => {}
                    }
                }
                if let Some(start) = run_start {
                    self.copy_range(dst, start, (addr + block_count as u64) - start)?;
                }
            }
        }
        Ok(())
    }
}

impl<'a> FsScanner for ApfsScanner<'a> {
    fn copy_used(&self, dst: &dyn ByteSource) -> Result<()> {
        let mut block = vec![0u8; NX_DEFAULT_BLOCK_SIZE as usize];
        self.read_verified_block(0, &mut block)?;
        let (sb, _) = NxSuperblockPrefix::read_from_prefix(&block)
            .map_err(|_| Error::Fs(FsError::Inconsistent))?;

        self.copy_range(dst, 0, 1)?;
        self.copy_range(dst, sb.xp_desc_base.get(), sb.xp_desc_blocks.get() as u64)?;
        self.copy_range(dst, sb.xp_data_base.get(), sb.xp_data_blocks.get() as u64)?;

        let (sm_paddr, sm_size) = self.find_spaceman(&sb)?;
        self.copy_via_spaceman(dst, sm_paddr, sm_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_signature() {
        let backing = std::cell::RefCell::new(vec![0u8; NX_DEFAULT_BLOCK_SIZE as usize * 4]);
        struct Mem<'a>(&'a std::cell::RefCell<Vec<u8>>);
        impl<'a> ByteSource for Mem<'a> {
            fn size(&self) -> u64 {
                self.0.borrow().len() as u64
            }
            fn sector_size(&self) -> u64 {
                512
            }
            fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
                let data = self.0.borrow();
                buffer.copy_from_slice(&data[offset as usize..offset as usize + buffer.len()]);
                Ok(())
            }
            fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
                let mut data = self.0.borrow_mut();
                data[offset as usize..offset as usize + buffer.len()].copy_from_slice(buffer);
                Ok(())
            }
        }
        let source = Mem(&backing);
        assert!(ApfsScanner::new(&source).is_err());
    }
}
