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

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use fsdump_device::{ByteSource, Result};

const DEFAULT_SECTOR_SIZE: u64 = 0x200;

/// A [`ByteSource`] backed by a regular file or, on non-Linux Unixes, a
/// device node whose size can be read from `stat(2)` directly.
pub struct FileSource {
    file: File,
    size: u64,
    sector_size: u64,
}

impl FileSource {
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            size,
            sector_size: DEFAULT_SECTOR_SIZE,
        })
    }

    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self {
            file,
            size,
            sector_size: DEFAULT_SECTOR_SIZE,
        })
    }

    pub fn open_read_write(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            size,
            sector_size: DEFAULT_SECTOR_SIZE,
        })
    }

    /// Overrides the logical sector size reported to callers, for backends
    /// (e.g. `fsdump_device_linux`) that learn it from the device itself.
    pub fn with_sector_size(mut self, sector_size: u64) -> Self {
        self.sector_size = sector_size;
        self
    }

    /// Overrides the reported size, for block special files where `stat`
    /// does not report `st_size` and the caller has an `ioctl`-derived size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl ByteSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn sector_size(&self) -> u64 {
        self.sector_size
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buffer, offset)?;
        Ok(())
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        self.file.write_all_at(buffer, offset)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_round_trip() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("fsdump-device-std-test-{}", std::process::id()));
        let src = FileSource::create(&path, 0x1000).unwrap();
        src.write(0x10, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        src.read(0x10, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(src.size(), 0x1000);
        drop(src);
        std::fs::remove_file(&path).unwrap();
    }
}
