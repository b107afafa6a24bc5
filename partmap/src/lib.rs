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

pub mod gpt;
pub mod guid;
pub mod mbr;

pub use fsdump_device::{Error, PartMapError, Result};
pub use guid::{Guid, PTYPE_APFS};

use fsdump_device::ByteSource;

/// A decoded partition map, preferring GPT and falling back to MBR the way
/// `main.cpp`'s dispatch loop does.
pub enum PartitionMap {
    Gpt(gpt::Gpt),
    Mbr(mbr::Mbr),
}

impl PartitionMap {
    pub fn load(device: &impl ByteSource) -> Result<Self> {
        match gpt::Gpt::load(device) {
            Ok(map) => Ok(PartitionMap::Gpt(map)),
            Err(_) => mbr::Mbr::load(device).map(PartitionMap::Mbr),
        }
    }
}
