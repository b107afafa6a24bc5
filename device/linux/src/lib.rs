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

//! Block-device sizing for Linux, layered on top of [`fsdump_device_std`]
//! so regular image files and `/dev/sdX`-style nodes share one read/write
//! path; only the geometry queries differ.

use std::{os::unix::io::AsRawFd, path::Path};

use fsdump_device::{ByteSource, DeviceError, Error, Result};
use fsdump_device_std::FileSource;
use log::{debug, warn};

// From linux/fs.h: _IOR(0x12, 114, size_t)
const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
// From linux/fs.h: _IO(0x12, 104)
const BLKSSZGET: libc::c_ulong = 0x1268;
// From linux/fs.h: _IO(0x12, 123)
const BLKPBSZGET: libc::c_ulong = 0x127b;

pub struct BlockDevice {
    inner: FileSource,
}

impl BlockDevice {
    /// Opens `path` read-only, querying its size and sector geometry via
    /// `fstat`/`ioctl` when it is a block special file and via `fstat`
    /// alone when it is a regular file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let source = FileSource::open_read_only(path.as_ref())?;
        let fd = source.file().as_raw_fd();

        let mut st: libc::stat64 = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat64(fd, &mut st) } != 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }

        let is_block_device = (st.st_mode & libc::S_IFMT) == libc::S_IFBLK;

        let source = if is_block_device {
            let mut size: u64 = 0;
            if unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut size) } != 0 {
                warn!("BLKGETSIZE64 failed: {}", std::io::Error::last_os_error());
                return Err(Error::Device(DeviceError::GeometryUnavailable));
            }

            let mut logical_sector_size: libc::c_int = 0;
            if unsafe { libc::ioctl(fd, BLKSSZGET, &mut logical_sector_size) } != 0 {
                warn!("BLKSSZGET failed: {}", std::io::Error::last_os_error());
                return Err(Error::Device(DeviceError::GeometryUnavailable));
            }

            // Physical sector size is informational only for this tool; a
            // failure here does not stop us from reading correctly.
            let mut physical_sector_size: libc::c_int = 0;
            if unsafe { libc::ioctl(fd, BLKPBSZGET, &mut physical_sector_size) } != 0 {
                debug!("BLKPBSZGET failed: {}", std::io::Error::last_os_error());
            }

            debug!("block device: {size:#x} bytes, {logical_sector_size} bytes/logical sector, {physical_sector_size} bytes/physical sector");

            source
                .with_size(size)
                .with_sector_size(logical_sector_size as u64)
        } else {
            source
        };

        Ok(Self { inner: source })
    }
}

impl ByteSource for BlockDevice {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn sector_size(&self) -> u64 {
        self.inner.sector_size()
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.inner.read(offset, buffer)
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        self.inner.write(offset, buffer)
    }
}
