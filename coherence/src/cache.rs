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

use crate::config::CacheGeometry;
use crate::{Error, LineAddress};

struct Way<E> {
    line: LineAddress,
    entry: E,
    last_touch: u64,
}

/// A set-associative tag array with LRU replacement.
///
/// Sets are indexed by the address bits starting at `start_index_bit`.
pub struct CacheMemory<E> {
    sets: Vec<Vec<Option<Way<E>>>>,
    start_index_bit: u32,
    clock: u64,
}

impl<E> CacheMemory<E> {
    pub fn new(
        geometry: &CacheGeometry,
        block_bytes: usize,
        start_index_bit: u32,
    ) -> Result<Self, Error> {
        geometry.validate(block_bytes)?;
        let num_sets = geometry.num_sets(block_bytes);
        let sets = (0..num_sets)
            .map(|_| (0..geometry.assoc).map(|_| None).collect())
            .collect();
        Ok(Self {
            sets,
            start_index_bit,
            clock: 0,
        })
    }

    fn set_index(&self, line: LineAddress) -> usize {
        ((line.base().0 >> self.start_index_bit) as usize) & (self.sets.len() - 1)
    }

    fn find(&self, line: LineAddress) -> Option<&Way<E>> {
        self.sets[self.set_index(line)]
            .iter()
            .flatten()
            .find(|way| way.line == line)
    }

    fn find_mut(&mut self, line: LineAddress) -> Option<&mut Way<E>> {
        let set = self.set_index(line);
        self.sets[set]
            .iter_mut()
            .flatten()
            .find(|way| way.line == line)
    }

    pub fn contains(&self, line: LineAddress) -> bool {
        self.find(line).is_some()
    }

    pub fn lookup(&self, line: LineAddress) -> Option<&E> {
        self.find(line).map(|way| &way.entry)
    }

    pub fn lookup_mut(&mut self, line: LineAddress) -> Option<&mut E> {
        self.find_mut(line).map(|way| &mut way.entry)
    }

    /// Marks the line most recently used.
    pub fn touch(&mut self, line: LineAddress) {
        self.clock += 1;
        let clock = self.clock;
        if let Some(way) = self.find_mut(line) {
            way.last_touch = clock;
        }
    }

    /// Whether the set `line` maps to has an empty way.
    pub fn has_free_way(&self, line: LineAddress) -> bool {
        self.sets[self.set_index(line)].iter().any(|way| way.is_none())
    }

    /// Installs `line` in a free way of its set. Returns `None` when the
    /// line is already present or the set is full.
    pub fn allocate(&mut self, line: LineAddress, entry: E) -> Option<&mut E> {
        if self.contains(line) {
            return None;
        }
        let set = self.set_index(line);
        let last_touch = self.clock + 1;
        let slot = self.sets[set].iter_mut().find(|way| way.is_none())?;
        self.clock = last_touch;
        *slot = Some(Way {
            line,
            entry,
            last_touch,
        });
        slot.as_mut().map(|way| &mut way.entry)
    }

    pub fn deallocate(&mut self, line: LineAddress) -> Option<E> {
        let set = self.set_index(line);
        self.sets[set]
            .iter_mut()
            .find(|way| way.as_ref().map(|w| w.line == line).unwrap_or(false))
            .and_then(|slot| slot.take())
            .map(|way| way.entry)
    }

    /// The least recently used line of `line`'s set among those `evictable`
    /// accepts.
    pub fn victim<F>(&self, line: LineAddress, evictable: F) -> Option<LineAddress>
    where
        F: Fn(LineAddress, &E) -> bool,
    {
        self.sets[self.set_index(line)]
            .iter()
            .flatten()
            .filter(|way| evictable(way.line, &way.entry))
            .min_by_key(|way| way.last_touch)
            .map(|way| way.line)
    }

    /// Every line resident in `line`'s set.
    pub fn set_lines(&self, line: LineAddress) -> Vec<LineAddress> {
        self.sets[self.set_index(line)]
            .iter()
            .flatten()
            .map(|way| way.line)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LineAddress, &E)> {
        self.sets
            .iter()
            .flatten()
            .flatten()
            .map(|way| (way.line, &way.entry))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Address, AddressMap};

    #[test]
    fn lru_victim() {
        let map = AddressMap::new(64, 1, 1);
        // 2 sets x 2 ways
        let geometry = CacheGeometry::new(256, 2);
        let mut cache = CacheMemory::<u32>::new(&geometry, 64, map.block_bits()).unwrap();
        let a = map.line(Address(0x000));
        let b = map.line(Address(0x080));
        let c = map.line(Address(0x100));
        let other = map.line(Address(0x040));
        assert!(cache.has_free_way(a));
        cache.allocate(a, 1).unwrap();
        cache.allocate(b, 2).unwrap();
        cache.allocate(other, 3).unwrap();
        assert!(!cache.has_free_way(c));
        assert!(cache.allocate(c, 9).is_none());
        assert!(cache.allocate(a, 9).is_none());
        assert!(cache.has_free_way(other));
        assert_eq!(cache.victim(c, |_, _| true), Some(a));
        cache.touch(a);
        assert_eq!(cache.victim(c, |_, _| true), Some(b));
        assert_eq!(cache.victim(c, |l, _| l != b), Some(a));
        assert_eq!(cache.victim(c, |_, e| *e > 5), None);
        assert_eq!(cache.set_lines(c).len(), 2);
        assert_eq!(cache.deallocate(b), Some(2));
        assert!(cache.has_free_way(c));
        *cache.allocate(c, 4).unwrap() += 1;
        assert_eq!(cache.lookup(c), Some(&5));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn start_index_bit_skips_bank_bits() {
        let map = AddressMap::new(64, 2, 1);
        let geometry = CacheGeometry::new(256, 1);
        let mut cache = CacheMemory::<()>::new(&geometry, 64, map.l2_index_bit()).unwrap();
        // lines of bank 0 only; with the bank bit skipped they fill all 4 sets
        for i in 0..4u64 {
            let line = map.line(Address(i * 128));
            assert_eq!(map.l2_bank(line), 0);
            assert!(cache.has_free_way(line));
            cache.allocate(line, ()).unwrap();
        }
        assert_eq!(cache.len(), 4);
    }
}
