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

//! Sparse-container byte sinks: the destination side of `fsdump`. Both
//! [`sparseimage`] and [`vhdx`] implement [`fsdump_device::ByteSource`] so
//! `fsdump_core` can write into either without caring which it picked.

pub use fsdump_device::*;

pub mod sparseimage;
pub mod vhdx;
