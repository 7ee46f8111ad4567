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

use std::collections::{HashMap, VecDeque};

use crate::message::DataBlock;
use crate::{Cycle, LineAddress};

#[derive(Clone, Debug)]
pub enum MemoryResponse {
    ReadDone(LineAddress, DataBlock),
    WriteDone(LineAddress),
}

/// The backing store behind a directory.
///
/// Requests complete asynchronously; completions are collected with
/// `poll`.
pub trait MemoryInterface {
    fn read_block(&mut self, line: LineAddress, now: Cycle);
    fn write_block(&mut self, line: LineAddress, data: DataBlock, now: Cycle);
    fn poll(&mut self, now: Cycle) -> Option<MemoryResponse>;
    /// Current contents, bypassing timing.
    fn peek_block(&self, line: LineAddress) -> DataBlock;
    fn is_idle(&self) -> bool;
}

enum Pending {
    Read(LineAddress),
    Write(LineAddress, DataBlock),
}

/// A fixed-latency store; unwritten lines read as zero.
pub struct SimpleMemory {
    store: HashMap<LineAddress, DataBlock>,
    pending: VecDeque<(Cycle, Pending)>,
    latency: Cycle,
    block_bytes: usize,
}

impl SimpleMemory {
    pub fn new(latency: Cycle, block_bytes: usize) -> Self {
        Self {
            store: HashMap::new(),
            pending: VecDeque::new(),
            latency,
            block_bytes,
        }
    }
}

impl MemoryInterface for SimpleMemory {
    fn read_block(&mut self, line: LineAddress, now: Cycle) {
        self.pending
            .push_back((now + self.latency, Pending::Read(line)));
    }

    fn write_block(&mut self, line: LineAddress, data: DataBlock, now: Cycle) {
        // directories only write whole lines
        debug_assert_eq!(data.len(), self.block_bytes);
        self.pending
            .push_back((now + self.latency, Pending::Write(line, data)));
    }

    fn poll(&mut self, now: Cycle) -> Option<MemoryResponse> {
        match self.pending.front() {
            Some((ready, _)) if *ready <= now => {}
            _ => return None,
        }
        let (_, request) = self.pending.pop_front()?;
        Some(match request {
            Pending::Read(line) => MemoryResponse::ReadDone(line, self.peek_block(line)),
            Pending::Write(line, data) => {
                self.store.insert(line, data);
                MemoryResponse::WriteDone(line)
            }
        })
    }

    fn peek_block(&self, line: LineAddress) -> DataBlock {
        self.store
            .get(&line)
            .cloned()
            .unwrap_or_else(|| DataBlock::new(self.block_bytes))
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Address, AddressMap};

    #[test]
    fn completes_after_latency() {
        let map = AddressMap::new(64, 1, 1);
        let line = map.line(Address(0x80));
        let mut memory = SimpleMemory::new(3, 64);
        let mut data = DataBlock::new(64);
        data.write_word(0, 42);
        memory.write_block(line, data, 0);
        memory.read_block(line, 1);
        assert!(memory.poll(2).is_none());
        assert_eq!(memory.peek_block(line).read_word(0), 0);
        assert!(matches!(memory.poll(3), Some(MemoryResponse::WriteDone(l)) if l == line));
        match memory.poll(4) {
            Some(MemoryResponse::ReadDone(l, block)) => {
                assert_eq!(l, line);
                assert_eq!(block.read_word(0), 42);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(memory.is_idle());
    }
}
