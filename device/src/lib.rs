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

pub use fsdump_err::*;

/// A byte-addressable source or sink backing a partitioned device or an
/// image being constructed.
pub trait ByteSource {
    /// Total addressable size, in bytes.
    fn size(&self) -> u64;

    /// The smallest unit the backing medium can transfer, in bytes. Reads
    /// and writes are not required to be aligned to it.
    fn sector_size(&self) -> u64;

    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()>;
}

/// A read/write view into a sub-range of a [`ByteSource`], used to narrow a
/// whole-device source down to a single partition.
pub struct Window<'a, S: ByteSource + ?Sized> {
    source: &'a S,
    start: u64,
    length: u64,
}

impl<'a, S: ByteSource + ?Sized> Window<'a, S> {
    pub fn new(source: &'a S, start: u64, length: u64) -> Self {
        Self {
            source,
            start,
            length,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }
}

impl<'a, S: ByteSource + ?Sized> ByteSource for Window<'a, S> {
    fn size(&self) -> u64 {
        self.length
    }

    fn sector_size(&self) -> u64 {
        self.source.sector_size()
    }

    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buffer.len() as u64)
            .ok_or(Error::Device(DeviceError::OutOfBounds))?;
        if end > self.length {
            return Err(Error::Device(DeviceError::OutOfBounds));
        }
        self.source.read(self.start + offset, buffer)
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(buffer.len() as u64)
            .ok_or(Error::Device(DeviceError::OutOfBounds))?;
        if end > self.length {
            return Err(Error::Device(DeviceError::OutOfBounds));
        }
        self.source.write(self.start + offset, buffer)
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
    fn window_translates_offsets() {
        let backing = MemSource(RefCell::new((0u8..16).collect()));
        let window = Window::new(&backing, 8, 4);
        let mut buf = [0u8; 4];
        window.read(0, &mut buf).unwrap();
        assert_eq!(buf, [8, 9, 10, 11]);
    }

    #[test]
    fn window_rejects_out_of_bounds() {
        let backing = MemSource(RefCell::new(vec![0u8; 16]));
        let window = Window::new(&backing, 8, 4);
        let mut buf = [0u8; 8];
        assert!(window.read(0, &mut buf).is_err());
    }
}
