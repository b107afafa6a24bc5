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

pub use fsdump_device::*;

/// Something that knows how to find the used blocks of one filesystem and
/// copy them onto a destination image.
///
/// Implementors are constructed over a [`ByteSource`] already narrowed to
/// the partition (see [`Window`]); `dst` is addressed with the same
/// partition-relative offsets.
pub trait FsScanner {
    fn copy_used(&self, dst: &dyn ByteSource) -> Result<()>;
}
