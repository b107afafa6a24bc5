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

//! Apple sparseimage: a fixed-size logical device backed by a file that
//! only grows as bands are written. A chain of header/index nodes (each
//! 4 KiB, big-endian) maps `band_id -> file_offset`; a zero entry means
//! the band was never allocated and reads as zero.

use std::{
    cell::RefCell,
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use fsdump_device::{ByteSource, DeviceError, Error, ImageError, Result};
use log::debug;
use zerocopy::{
    big_endian::{U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

const SECTOR_SIZE: u64 = 0x200;
const NODE_SIZE: u64 = 0x1000;
const BAND_SIZE: u64 = 0x100000;
const SPRS_SIGNATURE: u32 = 0x7370_7273; // "sprs"
const SPRS_VERSION: u32 = 3;
const SPRS_FLAGS: u32 = 1;

const HEADER_BAND_IDS: usize = 0x3F0;
const INDEX_BAND_IDS: usize = 0x3F2;

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct HeaderNodeWire {
    signature: U32,
    version: U32,
    sectors_per_band: U32,
    flags: U32,
    total_sectors_low: U32,
    next_index_node_offset: U64,
    total_sectors: U64,
    reserved: [u8; 0x1C],
    band_id: [U32; HEADER_BAND_IDS],
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct IndexNodeWire {
    signature: U32,
    index_node_nr: U32,
    flags: U32,
    next_index_node_offset: U64,
    reserved: [u8; 0x24],
    band_id: [U32; INDEX_BAND_IDS],
}

const _: () = assert!(std::mem::size_of::<HeaderNodeWire>() == NODE_SIZE as usize);
const _: () = assert!(std::mem::size_of::<IndexNodeWire>() == NODE_SIZE as usize);

struct State {
    band_offset: Vec<u64>,
    drive_size: u64,
    band_size: u64,
    band_size_shift: u32,
    file_size: u64,
    current_node_offset: u64,
    next_free_band: usize,
    next_index_node_nr: u32,
    header_next_index_node_offset: u64,
    header_band_id: Box<[u32; HEADER_BAND_IDS]>,
    index_node_nr: u32,
    index_next_index_node_offset: u64,
    index_band_id: Box<[u32; INDEX_BAND_IDS]>,
}

/// A band-sparse image file implementing the Apple sparseimage format.
pub struct SparseImageWriter {
    file: File,
    writable: bool,
    state: RefCell<State>,
}

impl SparseImageWriter {
    /// Truncates (or creates) `path` and writes a fresh header node with
    /// no allocated bands, sized to `logical_size` bytes.
    pub fn create(path: impl AsRef<Path>, logical_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(NODE_SIZE)?;

        let total_sectors = logical_size / SECTOR_SIZE;
        let drive_size = total_sectors * SECTOR_SIZE;
        let band_count = (drive_size + BAND_SIZE - 1) / BAND_SIZE;

        let writer = Self {
            file,
            writable: true,
            state: RefCell::new(State {
                band_offset: vec![0; band_count.max(1) as usize],
                drive_size,
                band_size: BAND_SIZE,
                band_size_shift: BAND_SIZE.trailing_zeros(),
                file_size: NODE_SIZE,
                current_node_offset: 0,
                next_free_band: 0,
                next_index_node_nr: 0,
                header_next_index_node_offset: 0,
                header_band_id: Box::new([0; HEADER_BAND_IDS]),
                index_node_nr: 0,
                index_next_index_node_offset: 0,
                index_band_id: Box::new([0; INDEX_BAND_IDS]),
            }),
        };
        writer.write_header(&writer.state.borrow())?;
        debug!("created sparseimage of {drive_size:#x} bytes ({band_count} bands)");
        Ok(writer)
    }

    /// Opens an existing sparseimage, reconstructing the `band_id ->
    /// file_offset` map by walking the header and its index-node chain.
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;

        let mut buf = [0u8; NODE_SIZE as usize];
        file.read_exact_at(&mut buf, 0)?;
        let header =
            HeaderNodeWire::read_from_bytes(&buf[..]).map_err(|_| Error::Image(ImageError::Signature))?;
        if header.signature.get() != SPRS_SIGNATURE {
            return Err(Error::Image(ImageError::Signature));
        }

        let total_sectors = header.total_sectors.get();
        let drive_size = total_sectors * SECTOR_SIZE;
        let band_size = header.sectors_per_band.get() as u64 * SECTOR_SIZE;
        let band_count = (drive_size + band_size - 1) / band_size;
        let mut band_offset = vec![0u64; band_count.max(1) as usize];

        let mut offset = NODE_SIZE;
        let mut next_free_band = 0usize;
        for (n, id) in header.band_id.iter().enumerate() {
            let id = id.get();
            if id == 0 {
                break;
            }
            band_offset[id as usize - 1] = offset;
            offset += band_size;
            next_free_band = n + 1;
        }

        let mut current_node_offset = 0u64;
        let mut next_index_node_nr = 0u32;
        let mut index_node_nr = 0u32;
        let mut index_next_index_node_offset = 0u64;
        let mut index_band_id = Box::new([0u32; INDEX_BAND_IDS]);
        let mut node_offset = header.next_index_node_offset.get();

        while node_offset != 0 {
            current_node_offset = node_offset;
            let mut idx_buf = [0u8; NODE_SIZE as usize];
            file.read_exact_at(&mut idx_buf, node_offset)?;
            let idx = IndexNodeWire::read_from_bytes(&idx_buf[..])
                .map_err(|_| Error::Image(ImageError::Signature))?;
            if idx.signature.get() != SPRS_SIGNATURE {
                return Err(Error::Image(ImageError::Signature));
            }

            offset += NODE_SIZE;
            next_free_band = 0;
            for (n, id) in idx.band_id.iter().enumerate() {
                let id = id.get();
                if id == 0 {
                    break;
                }
                band_offset[id as usize - 1] = offset;
                offset += band_size;
                next_free_band = n + 1;
            }

            index_node_nr = idx.index_node_nr.get();
            index_next_index_node_offset = idx.next_index_node_offset.get();
            index_band_id = Box::new(std::array::from_fn(|i| idx.band_id[i].get()));
            next_index_node_nr = index_node_nr + 1;
            node_offset = idx.next_index_node_offset.get();
        }

        Ok(Self {
            file,
            writable,
            state: RefCell::new(State {
                band_offset,
                drive_size,
                band_size,
                band_size_shift: band_size.trailing_zeros(),
                file_size: offset,
                current_node_offset,
                next_free_band,
                next_index_node_nr,
                header_next_index_node_offset: header.next_index_node_offset.get(),
                header_band_id: Box::new(std::array::from_fn(|i| header.band_id[i].get())),
                index_node_nr,
                index_next_index_node_offset,
                index_band_id,
            }),
        })
    }

    /// Flushes the active node (header or the last index node touched)
    /// so the band map survives a reopen.
    pub fn close(self) -> Result<()> {
        if self.writable {
            let state = self.state.borrow();
            if state.current_node_offset != 0 {
                self.write_index(&state)?;
            } else {
                self.write_header(&state)?;
            }
            self.file.set_len(state.file_size)?;
        }
        Ok(())
    }

    fn write_header(&self, state: &State) -> Result<()> {
        let wire = HeaderNodeWire {
            signature: SPRS_SIGNATURE.into(),
            version: SPRS_VERSION.into(),
            sectors_per_band: ((state.band_size / SECTOR_SIZE) as u32).into(),
            flags: SPRS_FLAGS.into(),
            total_sectors_low: ((state.drive_size / SECTOR_SIZE) as u32).into(),
            next_index_node_offset: state.header_next_index_node_offset.into(),
            total_sectors: (state.drive_size / SECTOR_SIZE).into(),
            reserved: [0; 0x1C],
            band_id: state.header_band_id.map(U32::from),
        };
        self.file.write_all_at(wire.as_bytes(), 0)?;
        Ok(())
    }

    fn write_index(&self, state: &State) -> Result<()> {
        let wire = IndexNodeWire {
            signature: SPRS_SIGNATURE.into(),
            index_node_nr: state.index_node_nr.into(),
            flags: SPRS_FLAGS.into(),
            next_index_node_offset: state.index_next_index_node_offset.into(),
            reserved: [0; 0x24],
            band_id: state.index_band_id.map(U32::from),
        };
        self.file.write_all_at(wire.as_bytes(), state.current_node_offset)?;
        Ok(())
    }

    fn alloc_band(&self, state: &mut State, band_id: usize) -> Result<u64> {
        let capacity = if state.current_node_offset == 0 {
            HEADER_BAND_IDS
        } else {
            INDEX_BAND_IDS
        };

        if state.next_free_band >= capacity {
            if state.current_node_offset == 0 {
                state.header_next_index_node_offset = state.file_size;
                self.write_header(state)?;
            } else {
                state.index_next_index_node_offset = state.file_size;
                self.write_index(state)?;
            }

            state.current_node_offset = state.file_size;
            state.index_node_nr = state.next_index_node_nr;
            state.next_index_node_nr += 1;
            state.index_next_index_node_offset = 0;
            state.index_band_id = Box::new([0; INDEX_BAND_IDS]);
            state.next_free_band = 0;
            state.file_size += NODE_SIZE;
        }

        let off = state.file_size;
        state.file_size += state.band_size;
        self.file.set_len(state.file_size)?;

        if state.current_node_offset == 0 {
            state.header_band_id[state.next_free_band] = band_id as u32 + 1;
        } else {
            state.index_band_id[state.next_free_band] = band_id as u32 + 1;
        }
        state.next_free_band += 1;
        state.band_offset[band_id] = off;
        Ok(off)
    }
}

impl ByteSource for SparseImageWriter {
    fn size(&self) -> u64 {
        self.state.borrow().drive_size
    }

    fn sector_size(&self) -> u64 {
        SECTOR_SIZE
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let state = self.state.borrow();
        let end = offset
            .checked_add(buffer.len() as u64)
            .ok_or(Error::Device(DeviceError::OutOfBounds))?;
        if end > state.drive_size {
            return Err(Error::Device(DeviceError::OutOfBounds));
        }

        let mut off = offset;
        let mut rest = buffer;
        while !rest.is_empty() {
            let band_id = (off >> state.band_size_shift) as usize;
            let offset_in_band = off & (state.band_size - 1);
            let chunk = rest.len().min((state.band_size - offset_in_band) as usize);
            let band_offset = state.band_offset[band_id];
            if band_offset == 0 {
                rest[..chunk].fill(0);
            } else {
                self.file.read_exact_at(&mut rest[..chunk], band_offset + offset_in_band)?;
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

        let mut state = self.state.borrow_mut();
        let end = offset
            .checked_add(buffer.len() as u64)
            .ok_or(Error::Device(DeviceError::OutOfBounds))?;
        if end > state.drive_size {
            return Err(Error::Device(DeviceError::OutOfBounds));
        }

        let mut off = offset;
        let mut rest = buffer;
        while !rest.is_empty() {
            let band_id = (off >> state.band_size_shift) as usize;
            let offset_in_band = off & (state.band_size - 1);
            let chunk = rest.len().min((state.band_size - offset_in_band) as usize);
            let mut band_offset = state.band_offset[band_id];
            if band_offset == 0 {
                band_offset = self.alloc_band(&mut state, band_id)?;
            }
            self.file.write_all_at(&rest[..chunk], band_offset + offset_in_band)?;
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
        std::env::temp_dir().join(format!("fsdump-sparseimage-test-{}-{}", std::process::id(), name))
    }

    #[test]
    fn fresh_image_reads_zero() {
        let path = temp_path("fresh");
        let writer = SparseImageWriter::create(&path, 0x4000_0000).unwrap();
        let mut buf = [0xAAu8; 0x1000];
        writer.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 0x1000]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), NODE_SIZE);
        writer.close().unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn write_allocates_exactly_the_touched_bands() {
        let path = temp_path("alloc");
        let writer = SparseImageWriter::create(&path, 0x4000_0000).unwrap();
        writer.write(0, b"TEST").unwrap();
        writer.write(0x3FFF_F000, b"TEST").unwrap();

        let mut buf = [0u8; 4];
        writer.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"TEST");
        writer.read(0x3FFF_F000, &mut buf).unwrap();
        assert_eq!(&buf, b"TEST");

        let mut zero = [0u8; 4];
        writer.read(4, &mut zero).unwrap();
        assert_eq!(zero, [0u8; 4]);

        writer.close().unwrap();
        let on_disk = std::fs::metadata(&path).unwrap().len();
        assert_eq!(on_disk, NODE_SIZE + 2 * BAND_SIZE);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn round_trips_across_reopen() {
        let path = temp_path("reopen");
        {
            let writer = SparseImageWriter::create(&path, 0x1000_0000).unwrap();
            writer.write(0x1234, b"hello").unwrap();
            writer.close().unwrap();
        }

        let writer = SparseImageWriter::open(&path, false).unwrap();
        let mut buf = [0u8; 5];
        writer.read(0x1234, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn read_only_rejects_writes() {
        let path = temp_path("ro");
        {
            SparseImageWriter::create(&path, 0x1000).unwrap().close().unwrap();
        }
        let writer = SparseImageWriter::open(&path, false).unwrap();
        assert!(matches!(writer.write(0, b"x"), Err(Error::PermissionDenied)));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn write_past_end_is_invalid() {
        let path = temp_path("oob");
        let writer = SparseImageWriter::create(&path, 0x1000).unwrap();
        assert!(writer.write(0x1000, b"x").is_err());
        writer.close().unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn index_node_chain_spans_many_bands() {
        let path = temp_path("chain");
        // Force allocation of more bands than fit a single header node so
        // the index-node chain is exercised.
        let bands = HEADER_BAND_IDS + 4;
        let logical_size = bands as u64 * BAND_SIZE;
        let writer = SparseImageWriter::create(&path, logical_size).unwrap();
        for n in 0..bands {
            let off = n as u64 * BAND_SIZE;
            writer.write(off, &[n as u8]).unwrap();
        }
        writer.close().unwrap();

        let writer = SparseImageWriter::open(&path, false).unwrap();
        for n in 0..bands {
            let off = n as u64 * BAND_SIZE;
            let mut buf = [0u8; 1];
            writer.read(off, &mut buf).unwrap();
            assert_eq!(buf[0], n as u8);
        }
        std::fs::remove_file(&path).unwrap();
    }
}
