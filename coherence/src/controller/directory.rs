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

//! The home node of a slice of memory.
//!
//! Tracks which L2 banks hold its lines, serializes requests per line and
//! talks to memory through a `MemoryInterface`. Lines are handed to L2s
//! exclusively; DMA requests recall them.

use serde::Serialize;
use std::collections::HashMap;

use crate::config::{DirectoryConfiguration, CHANNEL_RESERVE};
use crate::controller::{Controller, TransitionLog};
use crate::entry::DirectoryEntry;
use crate::memory::{MemoryInterface, MemoryResponse};
use crate::message::{DataBlock, MachineId, MachineType, Message, MessageType, VirtualNetwork};
use crate::network::Network;
use crate::stall::StallTable;
use crate::{AddressMap, Cycle, Error, LineAddress};

#[derive(Clone, Debug, Eq, PartialEq)]
enum Txn {
    L2Fetch { requestor: usize },
    Writeback { requestor: usize },
    DmaRead { requestor: MachineId, offset: usize, len: usize },
    DmaWrite { requestor: MachineId, offset: usize, bytes: Vec<u8> },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Recalling,
    ReadingMemory,
    WritingMemory,
    WaitingUnblock,
}

struct Tbe {
    txn: Txn,
    phase: Phase,
    pending: usize,
    /// Freshest data returned by a recall.
    data: Option<DataBlock>,
    dirty: bool,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct DirectoryStats {
    pub fetches: usize,
    pub writebacks: usize,
    pub stale_writebacks: usize,
    pub dma_reads: usize,
    pub dma_writes: usize,
    pub recalls: usize,
    pub memory_reads: usize,
    pub memory_writes: usize,
    pub stalls: usize,
}

pub struct DirectoryController {
    id: MachineId,
    version: usize,
    map: AddressMap,
    config: DirectoryConfiguration,
    num_l2: usize,
    entries: HashMap<LineAddress, DirectoryEntry>,
    tbes: HashMap<LineAddress, Tbe>,
    stalls: StallTable<Message>,
    memory: Box<dyn MemoryInterface>,
    history: TransitionLog,
    stats: DirectoryStats,
}

impl DirectoryController {
    pub fn new(
        version: usize,
        config: &DirectoryConfiguration,
        map: AddressMap,
        num_l2: usize,
        memory: Box<dyn MemoryInterface>,
    ) -> Self {
        let id = MachineId::directory(version);
        Self {
            id,
            version,
            map,
            config: config.clone(),
            num_l2,
            entries: HashMap::new(),
            tbes: HashMap::new(),
            stalls: StallTable::new(),
            memory,
            history: TransitionLog::new(id),
            stats: DirectoryStats::default(),
        }
    }

    pub fn stats(&self) -> &DirectoryStats {
        &self.stats
    }

    /// The L2 holders of `line`; None when memory is the only copy.
    pub fn entry(&self, line: LineAddress) -> Option<&DirectoryEntry> {
        self.entries.get(&line)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&LineAddress, &DirectoryEntry)> {
        self.entries.iter()
    }

    pub fn is_busy(&self, line: LineAddress) -> bool {
        self.tbes.contains_key(&line)
    }

    pub fn memory(&self) -> &dyn MemoryInterface {
        self.memory.as_ref()
    }

    fn violation(&self, line: LineAddress, reason: String) -> Error {
        log::error!("{}: {} on line {}", self.id, reason, line);
        Error::violation(self.id, line, reason)
    }

    fn unexpected(&self, msg: &Message) -> Error {
        self.violation(
            msg.addr,
            format!(
                "unexpected {:?} from {} in {}",
                msg.kind,
                msg.sender,
                self.describe_line(msg.addr)
            ),
        )
    }

    fn entry_mut(&mut self, line: LineAddress) -> &mut DirectoryEntry {
        let num_l2 = self.num_l2;
        self.entries
            .entry(line)
            .or_insert_with(|| DirectoryEntry::new(num_l2))
    }

    /// Drops the entry once nobody holds the line.
    fn tidy(&mut self, line: LineAddress) {
        if self.entries.get(&line).map(|e| e.is_empty()).unwrap_or(false) {
            self.entries.remove(&line);
        }
    }

    fn tbe_mut(&mut self, line: LineAddress) -> Result<&mut Tbe, Error> {
        let id = self.id;
        self.tbes
            .get_mut(&line)
            .ok_or_else(|| Error::violation(id, line, "no open transaction"))
    }

    fn l2_sender(&self, msg: &Message) -> Result<usize, Error> {
        match msg.sender.kind {
            MachineType::L2Cache if msg.sender.index < self.num_l2 => Ok(msg.sender.index),
            _ => Err(self.unexpected(msg)),
        }
    }

    fn send(
        &self,
        network: &mut Network,
        now: Cycle,
        kind: MessageType,
        line: LineAddress,
        to: MachineId,
        vnet: VirtualNetwork,
    ) -> Result<(), Error> {
        network.send(Message::new(kind, line, self.id, to, vnet), now)
    }

    fn finish(&mut self, line: LineAddress, now: Cycle, from: &str) {
        self.tbes.remove(&line);
        self.history.record(now, line, "Done", from, self.describe_line(line));
        self.stalls.wake(line);
    }

    /// Recalls every L2 copy; `downgrade` lets the owner keep the line.
    /// Returns the number of recalls sent.
    fn recall(
        &mut self,
        line: LineAddress,
        downgrade: bool,
        now: Cycle,
        network: &mut Network,
    ) -> Result<usize, Error> {
        let holders = self
            .entries
            .get(&line)
            .map(|e| if downgrade { e.owner().into_iter().collect::<Vec<_>>() } else { e.holders() })
            .unwrap_or_default();
        let kind = if downgrade {
            MessageType::RecallDowngrade
        } else {
            MessageType::RecallInv
        };
        for l2 in holders.iter() {
            self.send(network, now, kind, line, MachineId::l2(*l2), VirtualNetwork::Request)?;
            self.stats.recalls += 1;
        }
        Ok(holders.len())
    }

    fn read_memory(&mut self, line: LineAddress, now: Cycle) -> Result<(), Error> {
        self.memory.read_block(line, now);
        self.stats.memory_reads += 1;
        self.tbe_mut(line)?.phase = Phase::ReadingMemory;
        Ok(())
    }

    fn write_memory(&mut self, line: LineAddress, data: DataBlock, now: Cycle) -> Result<(), Error> {
        self.memory.write_block(line, data, now);
        self.stats.memory_writes += 1;
        self.tbe_mut(line)?.phase = Phase::WritingMemory;
        Ok(())
    }

    fn request(&mut self, msg: Message, now: Cycle, network: &mut Network) -> Result<Option<Message>, Error> {
        let line = msg.addr;
        if self.map.home_directory(line) != self.version {
            return Err(Error::AddressMisroute {
                controller: self.id,
                addr: line,
            });
        }
        if self.tbes.contains_key(&line) {
            log::trace!("{}: stall {} on busy line", self.id, msg);
            self.stats.stalls += 1;
            self.stalls.stall(line, msg);
            return Ok(None);
        }
        let before = self.describe_line(line);
        let (txn, downgrade) = match msg.kind {
            MessageType::GetS | MessageType::GetX => {
                let l2 = self.l2_sender(&msg)?;
                if self.entries.get(&line).map(|e| e.is_holder(l2)).unwrap_or(false) {
                    return Err(self.unexpected(&msg));
                }
                self.stats.fetches += 1;
                (Txn::L2Fetch { requestor: l2 }, false)
            }
            MessageType::PutX => {
                self.writeback(msg, now, network)?;
                return Ok(None);
            }
            MessageType::DmaRead => {
                self.stats.dma_reads += 1;
                let txn = Txn::DmaRead {
                    requestor: msg.sender,
                    offset: msg.offset,
                    len: msg.len,
                };
                (txn, true)
            }
            MessageType::DmaWrite => {
                self.stats.dma_writes += 1;
                let bytes = match &msg.data {
                    Some(data) => data.bytes(msg.offset, msg.len).to_vec(),
                    None => return Err(self.violation(line, "DMA write without data".into())),
                };
                let txn = Txn::DmaWrite {
                    requestor: msg.sender,
                    offset: msg.offset,
                    bytes,
                };
                (txn, false)
            }
            _ => return Err(self.unexpected(&msg)),
        };
        self.tbes.insert(
            line,
            Tbe {
                txn,
                phase: Phase::Recalling,
                pending: 0,
                data: None,
                dirty: false,
            },
        );
        let pending = self.recall(line, downgrade, now, network)?;
        if pending > 0 {
            self.tbe_mut(line)?.pending = pending;
        } else {
            self.read_memory(line, now)?;
        }
        self.history
            .record(now, line, msg.kind, before, self.describe_line(line));
        Ok(None)
    }

    fn writeback(&mut self, msg: Message, now: Cycle, network: &mut Network) -> Result<(), Error> {
        let line = msg.addr;
        let l2 = self.l2_sender(&msg)?;
        let owner = self.entries.get(&line).and_then(|e| e.owner()) == Some(l2);
        if owner {
            self.entry_mut(line).clear_owner();
            self.tidy(line);
        }
        match msg.data {
            Some(data) if owner && msg.dirty => {
                self.stats.writebacks += 1;
                self.tbes.insert(
                    line,
                    Tbe {
                        txn: Txn::Writeback { requestor: l2 },
                        phase: Phase::WritingMemory,
                        pending: 0,
                        data: None,
                        dirty: false,
                    },
                );
                self.write_memory(line, data, now)?;
                self.history.record(now, line, msg.kind, l2, "WritingMemory");
            }
            _ => {
                if owner {
                    self.stats.writebacks += 1;
                } else {
                    self.stats.stale_writebacks += 1;
                }
                self.send(network, now, MessageType::WbAck, line, msg.sender, VirtualNetwork::Response)?;
                self.history.record(
                    now,
                    line,
                    if owner { "CleanPutX" } else { "StalePutX" },
                    l2,
                    self.describe_line(line),
                );
            }
        }
        Ok(())
    }

    fn grant(&mut self, line: LineAddress, l2: usize, data: DataBlock, dirty: bool, now: Cycle, network: &mut Network) -> Result<(), Error> {
        self.entry_mut(line).set_owner(l2);
        let msg = Message::new(
            MessageType::DataExclusive,
            line,
            self.id,
            MachineId::l2(l2),
            VirtualNetwork::Response,
        )
        .with_data(data, dirty);
        network.send(msg, now)?;
        self.tbe_mut(line)?.phase = Phase::WaitingUnblock;
        Ok(())
    }

    fn send_dma_data(
        &self,
        line: LineAddress,
        requestor: MachineId,
        offset: usize,
        len: usize,
        data: DataBlock,
        now: Cycle,
        network: &mut Network,
    ) -> Result<(), Error> {
        let msg = Message::new(MessageType::Data, line, self.id, requestor, VirtualNetwork::Response)
            .with_data(data, false)
            .with_range(offset, len);
        network.send(msg, now)
    }

    /// Data for the line is available, from memory or from a recall.
    fn data_ready(
        &mut self,
        line: LineAddress,
        data: DataBlock,
        dirty: bool,
        now: Cycle,
        network: &mut Network,
    ) -> Result<(), Error> {
        let txn = match self.tbes.get(&line) {
            Some(tbe) => tbe.txn.clone(),
            None => return Err(self.violation(line, "data without a transaction".into())),
        };
        match txn {
            Txn::L2Fetch { requestor } => self.grant(line, requestor, data, dirty, now, network),
            Txn::DmaRead {
                requestor,
                offset,
                len,
            } => {
                self.send_dma_data(line, requestor, offset, len, data.clone(), now, network)?;
                if dirty {
                    self.write_memory(line, data, now)
                } else {
                    self.finish(line, now, "DmaRead");
                    Ok(())
                }
            }
            Txn::DmaWrite { offset, bytes, .. } => {
                let mut merged = data;
                merged.write_bytes(offset, &bytes);
                self.write_memory(line, merged, now)
            }
            Txn::Writeback { .. } => Err(self.violation(line, "write-back waiting for data".into())),
        }
    }

    fn memory_response(&mut self, response: MemoryResponse, now: Cycle, network: &mut Network) -> Result<(), Error> {
        match response {
            MemoryResponse::ReadDone(line, data) => {
                match self.tbes.get(&line) {
                    Some(tbe) if tbe.phase == Phase::ReadingMemory => {}
                    _ => return Err(self.violation(line, "unexpected memory read".into())),
                }
                self.data_ready(line, data, false, now, network)
            }
            MemoryResponse::WriteDone(line) => {
                let txn = match self.tbes.get(&line) {
                    Some(tbe) if tbe.phase == Phase::WritingMemory => tbe.txn.clone(),
                    _ => return Err(self.violation(line, "unexpected memory write".into())),
                };
                match txn {
                    Txn::Writeback { requestor } => {
                        self.send(
                            network,
                            now,
                            MessageType::WbAck,
                            line,
                            MachineId::l2(requestor),
                            VirtualNetwork::Response,
                        )?;
                    }
                    Txn::DmaWrite { requestor, .. } => {
                        self.send(network, now, MessageType::DmaAck, line, requestor, VirtualNetwork::Response)?;
                    }
                    Txn::DmaRead { .. } => {}
                    Txn::L2Fetch { .. } => {
                        return Err(self.violation(line, "fetch waiting for a memory write".into()))
                    }
                }
                self.finish(line, now, "WritingMemory");
                Ok(())
            }
        }
    }

    fn response(&mut self, msg: Message, now: Cycle, network: &mut Network) -> Result<(), Error> {
        let line = msg.addr;
        if msg.kind != MessageType::RecallData {
            return Err(self.unexpected(&msg));
        }
        let l2 = self.l2_sender(&msg)?;
        let downgrade = match self.tbes.get(&line) {
            Some(tbe) if tbe.phase == Phase::Recalling && tbe.pending > 0 => {
                matches!(tbe.txn, Txn::DmaRead { .. })
            }
            _ => return Err(self.unexpected(&msg)),
        };
        if !downgrade {
            let entry = self.entry_mut(line);
            if entry.owner() == Some(l2) {
                entry.clear_owner();
            }
            entry.remove_sharer(l2);
            self.tidy(line);
        }
        let tbe = self.tbe_mut(line)?;
        if let Some(data) = msg.data {
            if tbe.data.is_none() || msg.dirty {
                tbe.data = Some(data);
            }
        }
        tbe.dirty |= msg.dirty;
        tbe.pending -= 1;
        if tbe.pending > 0 {
            return Ok(());
        }
        let (data, dirty) = (tbe.data.take(), tbe.dirty);
        self.history.record(now, line, msg.kind, "Recalling", "Recalled");
        match data {
            Some(data) => self.data_ready(line, data, dirty, now, network),
            None => self.read_memory(line, now),
        }
    }

    fn unblock(&mut self, msg: Message, now: Cycle) -> Result<(), Error> {
        let line = msg.addr;
        let l2 = self.l2_sender(&msg)?;
        match self.tbes.get(&line) {
            Some(Tbe {
                txn: Txn::L2Fetch { requestor },
                phase: Phase::WaitingUnblock,
                ..
            }) if *requestor == l2 => {}
            _ => return Err(self.unexpected(&msg)),
        }
        self.finish(line, now, "WaitingUnblock");
        Ok(())
    }
}

impl Controller for DirectoryController {
    fn id(&self) -> MachineId {
        self.id
    }

    fn wakeup(&mut self, now: Cycle, network: &mut Network) -> Result<(), Error> {
        let mut budget = self.config.transitions_per_cycle;
        while budget > 0 {
            budget -= 1;
            let room = network.can_send(
                self.id,
                &[VirtualNetwork::Request, VirtualNetwork::Response],
                CHANNEL_RESERVE,
            );
            if room {
                if let Some(response) = self.memory.poll(now) {
                    self.memory_response(response, now, network)?;
                    continue;
                }
                if let Some(msg) = network.receive(self.id, VirtualNetwork::Response, now) {
                    self.response(msg, now, network)?;
                    continue;
                }
            }
            if let Some(msg) = network.receive(self.id, VirtualNetwork::Unblock, now) {
                self.unblock(msg, now)?;
                continue;
            }
            if !room {
                log::trace!("{}: outbound channels full", self.id);
                break;
            }
            if let Some(msg) = self.stalls.pop_ready() {
                if let Some(msg) = self.request(msg, now, network)? {
                    self.stalls.defer(msg);
                    break;
                }
                continue;
            }
            if let Some(msg) = network.receive(self.id, VirtualNetwork::Request, now) {
                if let Some(msg) = self.request(msg, now, network)? {
                    self.stalls.defer(msg);
                    break;
                }
                continue;
            }
            break;
        }
        Ok(())
    }

    fn is_quiescent(&self) -> bool {
        self.tbes.is_empty() && self.stalls.is_empty() && self.memory.is_idle()
    }

    fn describe_line(&self, line: LineAddress) -> String {
        let mut s = match self.entries.get(&line) {
            Some(entry) => format!("{}", entry),
            None => "memory".to_string(),
        };
        if let Some(tbe) = self.tbes.get(&line) {
            s += &format!(" busy {:?} {:?}", tbe.txn, tbe.phase);
            if tbe.pending > 0 {
                s += &format!(" ({} recalls pending)", tbe.pending);
            }
        }
        let stalled = self.stalls.stalled_on(line).count();
        if stalled > 0 {
            s += &format!(" ({} stalled)", stalled);
        }
        s
    }

    fn history(&self) -> &TransitionLog {
        &self.history
    }
}
