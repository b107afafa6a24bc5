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

//! Copies a partition's entire byte range without interpreting any
//! metadata. Used for filesystems this tool does not walk (FAT) and as the
//! fallback when a recognized-but-unparsed layout still needs to land in
//! the destination image.

use fsdump_fs::{ByteSource, FsScanner, Result};
use log::trace;

// Matches the 4 KiB buffer `main.cpp`'s `CopyRaw` used.
const COPY_CHUNK: usize = 0x1000;

/// A scanner that treats the entire partition window as used.
pub struct RawScanner<'a> {
    source: &'a dyn ByteSource,
}

impl<'a> RawScanner<'a> {
    pub fn new(source: &'a dyn ByteSource) -> Self {
        Self { source }
    }
}

impl<'a> FsScanner for RawScanner<'a> {
    fn copy_used(&self, dst: &dyn ByteSource) -> Result<()> {
        let size = self.source.size();
        trace!("copying {size:#x} bytes whole");

        let mut offset = 0u64;
        let mut buf = vec![0u8; COPY_CHUNK.min(size.max(1) as usize)];
        while offset < size {
            let chunk = (size - offset).min(buf.len() as u64) as usize;
            self.source.read(offset, &mut buf[..chunk])?;
            dst.write(offset, &buf[..chunk])?;
            offset += chunk as u64;
        }
        Ok(())
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

    #[test]
    fn copies_entire_window() {
        let src = MemSource(RefCell::new((0u8..=255).cycle().take(0x4321).collect()));
        let dst = MemSource(RefCell::new(vec![0u8; 0x4321]));
        RawScanner::new(&src).copy_used(&dst).unwrap();
        assert_eq!(*src.0.borrow(), *dst.0.borrow());
    }
}
