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

use bitvec::prelude::*;
use itertools::Itertools;
use std::fmt;

use crate::message::DataBlock;

/// A cache line record: coherence state plus payload.
///
/// The line address is the key under which the record is stored.
#[derive(Clone, Debug)]
pub struct CacheLine<S> {
    pub state: S,
    pub data: DataBlock,
    pub dirty: bool,
}

impl<S> CacheLine<S> {
    pub fn new(state: S, block_bytes: usize) -> Self {
        Self {
            state,
            data: DataBlock::new(block_bytes),
            dirty: false,
        }
    }
}

/// A bitmap over controller indices.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SharerSet {
    bits: BitVec,
}

impl SharerSet {
    pub fn new(size: usize) -> Self {
        Self {
            bits: bitvec![0; size],
        }
    }

    pub fn insert(&mut self, index: usize) {
        self.bits.set(index, true);
    }

    pub fn remove(&mut self, index: usize) {
        self.bits.set(index, false);
    }

    pub fn contains(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    pub fn len(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn clear(&mut self) {
        self.bits.fill(false);
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }
}

impl fmt::Display for SharerSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}}}", self.iter().format(", "))
    }
}

/// Who holds a line below a home: one exclusive owner or a set of sharers.
///
/// The mutators keep the two mutually exclusive: granting ownership drops
/// the sharers, and a sharer can only be added once the owner is gone.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirectoryEntry {
    owner: Option<usize>,
    sharers: SharerSet,
}

impl DirectoryEntry {
    pub fn new(size: usize) -> Self {
        Self {
            owner: None,
            sharers: SharerSet::new(size),
        }
    }

    pub fn owner(&self) -> Option<usize> {
        self.owner
    }

    pub fn sharers(&self) -> &SharerSet {
        &self.sharers
    }

    pub fn set_owner(&mut self, index: usize) {
        self.sharers.clear();
        self.owner = Some(index);
    }

    pub fn clear_owner(&mut self) {
        self.owner = None;
    }

    /// Returns false, leaving the entry unchanged, while an owner exists.
    pub fn add_sharer(&mut self, index: usize) -> bool {
        if self.owner.is_some() {
            return false;
        }
        self.sharers.insert(index);
        true
    }

    pub fn remove_sharer(&mut self, index: usize) {
        self.sharers.remove(index);
    }

    pub fn is_holder(&self, index: usize) -> bool {
        self.owner == Some(index) || self.sharers.contains(index)
    }

    /// The owner, or else every sharer.
    pub fn holders(&self) -> Vec<usize> {
        match self.owner {
            Some(owner) => vec![owner],
            None => self.sharers.iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.owner.is_none() && self.sharers.is_empty()
    }

    /// Owner XOR sharers.
    pub fn is_consistent(&self) -> bool {
        self.owner.is_none() || self.sharers.is_empty()
    }
}

impl fmt::Display for DirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.owner {
            Some(owner) => write!(f, "owner {}", owner),
            None => write!(f, "sharers {}", self.sharers),
        }
    }
}
