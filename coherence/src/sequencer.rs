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

use crate::address::WORD_BYTES;
use crate::{Address, AddressMap, Cycle, Error, LineAddress};

pub type RequestId = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestKind {
    Load,
    Store(u64),
    IFetch,
}

#[derive(Clone, Debug)]
pub struct CoreRequest {
    pub id: RequestId,
    pub addr: Address,
    pub kind: RequestKind,
    /// Generated by the prefetcher; never reported back.
    pub prefetch: bool,
    pub issued: Cycle,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Completion {
    pub id: RequestId,
    pub addr: Address,
    pub kind: RequestKind,
    /// The word read, or the word written.
    pub value: u64,
    pub issued: Cycle,
    pub completed: Cycle,
}

/// The core-facing side of an L1.
///
/// Hands out request ids, remembers what is outstanding and queues
/// completions until the core drains them.
pub struct Sequencer {
    version: usize,
    next_id: RequestId,
    outstanding: HashMap<RequestId, CoreRequest>,
    completed: VecDeque<Completion>,
    evictions: Vec<LineAddress>,
    deadlock_threshold: Cycle,
}

impl Sequencer {
    pub fn new(version: usize, deadlock_threshold: Cycle) -> Self {
        Self {
            version,
            next_id: 0,
            outstanding: HashMap::new(),
            completed: VecDeque::new(),
            evictions: Vec::new(),
            deadlock_threshold,
        }
    }

    pub fn version(&self) -> usize {
        self.version
    }

    pub(crate) fn issue(
        &mut self,
        addr: Address,
        kind: RequestKind,
        now: Cycle,
    ) -> Result<CoreRequest, Error> {
        if addr.0 % WORD_BYTES as u64 != 0 {
            return Err(Error::MisalignedAccess(addr));
        }
        let request = CoreRequest {
            id: self.next_id,
            addr,
            kind,
            prefetch: false,
            issued: now,
        };
        self.next_id += 1;
        self.outstanding.insert(request.id, request.clone());
        Ok(request)
    }

    pub(crate) fn complete(&mut self, id: RequestId, value: u64, now: Cycle) {
        match self.outstanding.remove(&id) {
            Some(request) => self.completed.push_back(Completion {
                id,
                addr: request.addr,
                kind: request.kind,
                value,
                issued: request.issued,
                completed: now,
            }),
            None => log::warn!("sequencer {}: unknown request {} completed", self.version, id),
        }
    }

    pub(crate) fn evicted(&mut self, line: LineAddress) {
        self.evictions.push(line);
    }

    pub fn drain_completions(&mut self) -> Vec<Completion> {
        self.completed.drain(..).collect()
    }

    /// Lines lost by the L1 since the last call.
    pub fn drain_evictions(&mut self) -> Vec<LineAddress> {
        std::mem::take(&mut self.evictions)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn oldest(&self) -> Option<&CoreRequest> {
        self.outstanding.values().min_by_key(|r| (r.issued, r.id))
    }

    /// The oldest request outstanding past the deadlock threshold.
    pub fn stuck_request(&self, now: Cycle) -> Option<&CoreRequest> {
        self.outstanding
            .values()
            .filter(|r| now.saturating_sub(r.issued) > self.deadlock_threshold)
            .min_by_key(|r| r.issued)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DmaKind {
    Read(usize),
    Write(Vec<u8>),
}

/// A line sized piece of a DMA transfer.
#[derive(Clone, Debug)]
pub struct DmaChunk {
    pub line: LineAddress,
    pub offset: usize,
    pub len: usize,
    /// Bytes to write; empty for reads.
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DmaCompletion {
    pub id: RequestId,
    pub addr: Address,
    /// The bytes read; empty for writes.
    pub data: Vec<u8>,
    pub issued: Cycle,
    pub completed: Cycle,
}

struct Transfer {
    id: RequestId,
    addr: Address,
    chunks: VecDeque<DmaChunk>,
    in_flight: bool,
    read: Vec<u8>,
    issued: Cycle,
}

/// The device-facing side of a DMA controller.
///
/// Transfers are split at line boundaries and run one chunk at a time, in
/// issue order.
pub struct DmaSequencer {
    map: AddressMap,
    next_id: RequestId,
    transfers: VecDeque<Transfer>,
    completed: VecDeque<DmaCompletion>,
    deadlock_threshold: Cycle,
}

impl DmaSequencer {
    pub fn new(map: AddressMap, deadlock_threshold: Cycle) -> Self {
        Self {
            map,
            next_id: 0,
            transfers: VecDeque::new(),
            completed: VecDeque::new(),
            deadlock_threshold,
        }
    }

    pub(crate) fn issue(
        &mut self,
        addr: Address,
        kind: DmaKind,
        now: Cycle,
    ) -> Result<RequestId, Error> {
        let len = match &kind {
            DmaKind::Read(len) => *len,
            DmaKind::Write(data) => data.len(),
        };
        if len == 0 {
            return Err(Error::InvalidConfiguration("empty DMA transfer".into()));
        }
        let block_bytes = self.map.block_bytes();
        let mut chunks = VecDeque::new();
        let mut done = 0;
        while done < len {
            let at = Address(addr.0 + done as u64);
            let offset = self.map.offset(at);
            let chunk_len = (block_bytes - offset).min(len - done);
            let data = match &kind {
                DmaKind::Read(_) => Vec::new(),
                DmaKind::Write(bytes) => bytes[done..done + chunk_len].to_vec(),
            };
            chunks.push_back(DmaChunk {
                line: self.map.line(at),
                offset,
                len: chunk_len,
                data,
            });
            done += chunk_len;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.transfers.push_back(Transfer {
            id,
            addr,
            chunks,
            in_flight: false,
            read: Vec::new(),
            issued: now,
        });
        Ok(id)
    }

    /// The next chunk to send, unless one is already in flight.
    pub(crate) fn next_chunk(&mut self) -> Option<DmaChunk> {
        let transfer = self.transfers.front_mut()?;
        if transfer.in_flight {
            return None;
        }
        transfer.in_flight = true;
        transfer.chunks.front().cloned()
    }

    /// Retires the chunk in flight; `bytes` are the bytes read, if any.
    pub(crate) fn chunk_done(&mut self, bytes: &[u8], now: Cycle) {
        let finished = match self.transfers.front_mut() {
            Some(transfer) if transfer.in_flight => {
                transfer.in_flight = false;
                transfer.chunks.pop_front();
                transfer.read.extend_from_slice(bytes);
                transfer.chunks.is_empty()
            }
            _ => {
                log::warn!("DMA chunk completed with nothing in flight");
                false
            }
        };
        if finished {
            if let Some(transfer) = self.transfers.pop_front() {
                self.completed.push_back(DmaCompletion {
                    id: transfer.id,
                    addr: transfer.addr,
                    data: transfer.read,
                    issued: transfer.issued,
                    completed: now,
                });
            }
        }
    }

    pub fn drain_completions(&mut self) -> Vec<DmaCompletion> {
        self.completed.drain(..).collect()
    }

    pub fn outstanding(&self) -> usize {
        self.transfers.len()
    }

    /// Line of the chunk in flight or next to go.
    pub fn current_line(&self) -> Option<LineAddress> {
        self.transfers
            .front()
            .and_then(|t| t.chunks.front())
            .map(|c| c.line)
    }

    pub fn is_stuck(&self, now: Cycle) -> bool {
        self.transfers
            .front()
            .map(|t| now.saturating_sub(t.issued) > self.deadlock_threshold)
            .unwrap_or(false)
    }
}
