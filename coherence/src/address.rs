// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the unit moved by a load or a store.
pub const WORD_BYTES: usize = 8;

/// A physical byte address.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Address(pub u64);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A block aligned address; the unit of coherence.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct LineAddress(u64);

impl LineAddress {
    pub fn base(&self) -> Address {
        Address(self.0)
    }
}

impl fmt::Display for LineAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Splits addresses into block offset, L2 bank and home directory.
///
/// ```text
///  | ... dir select | l2 select | block offset |
///                               ^ block_bits
/// ```
///
/// The L2 bank is picked by the `l2_bits` directly above the block offset,
/// the home directory by the `dir_bits` above those.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AddressMap {
    block_bits: u32,
    l2_bits: u32,
    dir_bits: u32,
}

impl AddressMap {
    /// All counts must be powers of two; `SystemConfiguration::validate`
    /// checks that before a map is built.
    pub fn new(block_bytes: usize, num_l2: usize, num_dirs: usize) -> Self {
        Self {
            block_bits: block_bytes.trailing_zeros(),
            l2_bits: num_l2.trailing_zeros(),
            dir_bits: num_dirs.trailing_zeros(),
        }
    }

    pub fn block_bytes(&self) -> usize {
        1 << self.block_bits
    }

    pub fn block_bits(&self) -> u32 {
        self.block_bits
    }

    /// First address bit used to index L2 sets, so that a bank's sets are
    /// not wasted on the bank select bits.
    pub fn l2_index_bit(&self) -> u32 {
        self.block_bits + self.l2_bits
    }

    pub fn line(&self, addr: Address) -> LineAddress {
        LineAddress(addr.0 & !((1u64 << self.block_bits) - 1))
    }

    pub fn offset(&self, addr: Address) -> usize {
        (addr.0 & ((1u64 << self.block_bits) - 1)) as usize
    }

    pub fn next_line(&self, line: LineAddress) -> LineAddress {
        LineAddress(line.0.wrapping_add(1 << self.block_bits))
    }

    pub fn l2_bank(&self, line: LineAddress) -> usize {
        ((line.0 >> self.block_bits) & mask(self.l2_bits)) as usize
    }

    pub fn home_directory(&self, line: LineAddress) -> usize {
        ((line.0 >> (self.block_bits + self.l2_bits)) & mask(self.dir_bits)) as usize
    }
}

fn mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}
