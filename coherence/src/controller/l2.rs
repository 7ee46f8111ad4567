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

//! A bank of the shared, inclusive L2.
//!
//! The bank is the home of its lines for the L1s: it tracks which L1s hold
//! each line, collects invalidation acks itself and keeps a line blocked
//! from grant until the requester unblocks it. Towards the memory
//! directory the bank always holds its lines exclusively.

use serde::Serialize;
use std::collections::HashMap;

use crate::cache::CacheMemory;
use crate::config::{L2Configuration, CHANNEL_RESERVE};
use crate::controller::{Controller, TransitionLog};
use crate::entry::{CacheLine, DirectoryEntry};
use crate::message::{DataBlock, MachineId, MachineType, Message, MessageType, VirtualNetwork};
use crate::network::Network;
use crate::stall::StallTable;
use crate::{Address, AddressMap, Cycle, Error, LineAddress};

/// An L2 line; its state is the record of the L1s holding it.
pub type L2Line = CacheLine<DirectoryEntry>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    FetchingFromDir,
    Invalidating,
    WaitingUnblock,
    WritingBack,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Txn {
    L1Request { requestor: usize, kind: MessageType },
    Replacement,
    DirRecall { invalidate: bool },
}

struct Tbe {
    txn: Txn,
    phase: Phase,
    pending: usize,
    /// Write-back data once the slot is gone.
    data: Option<DataBlock>,
    dirty: bool,
}

impl Tbe {
    fn new(txn: Txn, phase: Phase) -> Self {
        Self {
            txn,
            phase,
            pending: 0,
            data: None,
            dirty: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct L2Stats {
    pub hits: usize,
    pub misses: usize,
    pub replacements: usize,
    pub writebacks_absorbed: usize,
    pub stale_writebacks: usize,
    pub invalidations: usize,
    pub recalls: usize,
    pub stalls: usize,
}

pub struct L2Controller {
    id: MachineId,
    version: usize,
    map: AddressMap,
    config: L2Configuration,
    num_l1: usize,
    cache: CacheMemory<L2Line>,
    tbes: HashMap<LineAddress, Tbe>,
    stalls: StallTable<Message>,
    history: TransitionLog,
    stats: L2Stats,
}

impl L2Controller {
    pub fn new(
        version: usize,
        config: &L2Configuration,
        map: AddressMap,
        num_l1: usize,
    ) -> Result<Self, Error> {
        let id = MachineId::l2(version);
        Ok(Self {
            id,
            version,
            map,
            config: config.clone(),
            num_l1,
            cache: CacheMemory::new(&config.cache, map.block_bytes(), map.l2_index_bit())?,
            tbes: HashMap::new(),
            stalls: StallTable::new(),
            history: TransitionLog::new(id),
            stats: L2Stats::default(),
        })
    }

    pub fn stats(&self) -> &L2Stats {
        &self.stats
    }

    /// The L1 holders of a resident line.
    pub fn entry(&self, line: LineAddress) -> Option<&DirectoryEntry> {
        self.cache.lookup(line).map(|l| &l.state)
    }

    pub fn is_busy(&self, line: LineAddress) -> bool {
        self.tbes.contains_key(&line)
    }

    pub fn lines(&self) -> impl Iterator<Item = (LineAddress, &DirectoryEntry)> {
        self.cache.iter().map(|(line, l)| (line, &l.state))
    }

    pub fn peek_word(&self, addr: Address) -> Option<u64> {
        self.cache
            .lookup(self.map.line(addr))
            .map(|l| l.data.read_word(self.map.offset(addr)))
    }

    fn home(&self, line: LineAddress) -> MachineId {
        MachineId::directory(self.map.home_directory(line))
    }

    fn to_l1(&self, kind: MessageType, line: LineAddress, l1: usize, vnet: VirtualNetwork) -> Message {
        Message::new(kind, line, self.id, MachineId::l1(l1), vnet)
    }

    fn to_dir(&self, kind: MessageType, line: LineAddress, vnet: VirtualNetwork) -> Message {
        Message::new(kind, line, self.id, self.home(line), vnet)
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

    fn l1_sender(&self, msg: &Message) -> Result<usize, Error> {
        match msg.sender.kind {
            MachineType::L1Cache if msg.sender.index < self.num_l1 => Ok(msg.sender.index),
            _ => Err(self.unexpected(msg)),
        }
    }

    fn holders(&self, line: LineAddress) -> Result<&DirectoryEntry, Error> {
        match self.cache.lookup(line) {
            Some(l) => Ok(&l.state),
            None => Err(self.violation(line, "line not resident".into())),
        }
    }

    fn holders_mut(&mut self, line: LineAddress) -> Result<&mut DirectoryEntry, Error> {
        let id = self.id;
        self.cache
            .lookup_mut(line)
            .map(|l| &mut l.state)
            .ok_or_else(|| Error::violation(id, line, "line not resident"))
    }

    fn tbe_mut(&mut self, line: LineAddress) -> Result<&mut Tbe, Error> {
        let id = self.id;
        self.tbes
            .get_mut(&line)
            .ok_or_else(|| Error::violation(id, line, "no open transaction"))
    }

    /// Sends invalidations to `sharers` and an owner recall to `owner`.
    /// Returns the number of acks to wait for.
    fn invalidate(
        &mut self,
        line: LineAddress,
        owner: Option<(usize, MessageType)>,
        sharers: &[usize],
        now: Cycle,
        network: &mut Network,
    ) -> Result<usize, Error> {
        let mut pending = 0;
        if let Some((l1, recall)) = owner {
            network.send(self.to_l1(recall, line, l1, VirtualNetwork::Unblock), now)?;
            self.stats.recalls += 1;
            pending += 1;
        }
        for l1 in sharers {
            network.send(
                self.to_l1(MessageType::Inv, line, *l1, VirtualNetwork::Unblock),
                now,
            )?;
            self.stats.invalidations += 1;
            pending += 1;
        }
        Ok(pending)
    }

    fn request(&mut self, msg: Message, now: Cycle, network: &mut Network) -> Result<Option<Message>, Error> {
        let line = msg.addr;
        if self.map.l2_bank(line) != self.version {
            return Err(Error::AddressMisroute {
                controller: self.id,
                addr: line,
            });
        }
        if msg.kind == MessageType::PutS {
            // a sharer leaving never conflicts
            let l1 = self.l1_sender(&msg)?;
            if let Some(l) = self.cache.lookup_mut(line) {
                l.state.remove_sharer(l1);
            }
            self.history.record(now, line, msg.kind, "-", format!("-{}", l1));
            return Ok(None);
        }
        if let Some(tbe) = self.tbes.get(&line) {
            let recall = matches!(
                msg.kind,
                MessageType::RecallInv | MessageType::RecallDowngrade
            );
            if recall && tbe.phase == Phase::WritingBack {
                return self.recall_during_writeback(msg, now, network).map(|_| None);
            }
            log::trace!("{}: stall {} on busy line", self.id, msg);
            self.stats.stalls += 1;
            self.stalls.stall(line, msg);
            return Ok(None);
        }
        match msg.kind {
            MessageType::GetS | MessageType::GetInstr | MessageType::GetX | MessageType::Upgrade => {
                self.l1_request(msg, now, network)
            }
            MessageType::PutX => self.l1_writeback(msg, now, network).map(|_| None),
            MessageType::RecallInv | MessageType::RecallDowngrade => {
                self.dir_recall(msg, now, network)
            }
            _ => Err(self.unexpected(&msg)),
        }
    }

    fn l1_request(
        &mut self,
        msg: Message,
        now: Cycle,
        network: &mut Network,
    ) -> Result<Option<Message>, Error> {
        let line = msg.addr;
        let requestor = self.l1_sender(&msg)?;
        let txn = Txn::L1Request {
            requestor,
            kind: msg.kind,
        };
        if self.cache.contains(line) {
            if self.tbes.len() >= self.config.max_outstanding {
                return Ok(Some(msg));
            }
            self.cache.touch(line);
            self.stats.hits += 1;
            self.tbes.insert(line, Tbe::new(txn, Phase::Invalidating));
            return self.serve(line, now, network).map(|_| None);
        }

        if !self.cache.has_free_way(line) {
            let tbes = &self.tbes;
            let victim = self.cache.victim(line, |l, _| !tbes.contains_key(&l));
            match victim {
                None => {
                    let busy = self.cache.set_lines(line)[0];
                    self.stats.stalls += 1;
                    self.stalls.stall(busy, msg);
                    return Ok(None);
                }
                Some(victim) => {
                    if self.tbes.len() + 2 > self.config.max_outstanding {
                        return Ok(Some(msg));
                    }
                    self.replace(victim, now, network)?;
                    if !self.cache.has_free_way(line) {
                        self.stalls.stall(victim, msg);
                        return Ok(None);
                    }
                }
            }
        }
        if self.tbes.len() >= self.config.max_outstanding {
            return Ok(Some(msg));
        }

        let fetch = match msg.kind {
            MessageType::GetX | MessageType::Upgrade => MessageType::GetX,
            _ => MessageType::GetS,
        };
        network.send(self.to_dir(fetch, line, VirtualNetwork::Request), now)?;
        let block_bytes = self.map.block_bytes();
        if self
            .cache
            .allocate(line, CacheLine::new(DirectoryEntry::new(self.num_l1), block_bytes))
            .is_none()
        {
            return Err(self.violation(line, "no slot for the missing line".into()));
        }
        self.tbes.insert(line, Tbe::new(txn, Phase::FetchingFromDir));
        self.stats.misses += 1;
        self.history.record(now, line, msg.kind, "NP", "FetchingFromDir");
        Ok(None)
    }

    /// Moves an L1 request on: recall or invalidate conflicting copies, or
    /// grant once there are none.
    fn serve(&mut self, line: LineAddress, now: Cycle, network: &mut Network) -> Result<(), Error> {
        let (requestor, kind) = match self.tbes.get(&line).map(|tbe| tbe.txn) {
            Some(Txn::L1Request { requestor, kind }) => (requestor, kind),
            _ => return Err(self.violation(line, "serving without a request".into())),
        };
        let holders = self.holders(line)?.clone();
        if holders.owner() == Some(requestor) {
            return Err(self.violation(
                line,
                format!("{:?} from the owner L1 {}", kind, requestor),
            ));
        }
        let read = matches!(kind, MessageType::GetS | MessageType::GetInstr);
        let pending = if read {
            let owner = holders
                .owner()
                .map(|o| (o, MessageType::RecallDowngrade));
            self.invalidate(line, owner, &[], now, network)?
        } else {
            let owner = holders.owner().map(|o| (o, MessageType::RecallInv));
            let sharers: Vec<usize> = holders.sharers().iter().filter(|s| *s != requestor).collect();
            self.invalidate(line, owner, &sharers, now, network)?
        };
        if pending > 0 {
            let tbe = self.tbe_mut(line)?;
            tbe.phase = Phase::Invalidating;
            tbe.pending = pending;
            self.history
                .record(now, line, kind, holders, format!("Invalidating({})", pending));
            return Ok(());
        }

        let others = holders.sharers().iter().filter(|s| *s != requestor).count();
        let exclusive = !read || (kind == MessageType::GetS && others == 0);
        let (data, grant) = {
            let l = match self.cache.lookup_mut(line) {
                Some(l) => l,
                None => return Err(self.violation(line, "granting a missing line".into())),
            };
            if exclusive {
                l.state.set_owner(requestor);
            } else {
                l.state.add_sharer(requestor);
            }
            let grant = if exclusive {
                MessageType::DataExclusive
            } else {
                MessageType::Data
            };
            (l.data.clone(), grant)
        };
        self.cache.touch(line);
        let reply = self
            .to_l1(grant, line, requestor, VirtualNetwork::Response)
            .with_data(data, false);
        network.send(reply, now)?;
        self.tbe_mut(line)?.phase = Phase::WaitingUnblock;
        self.history.record(now, line, kind, holders, grant_state(grant));
        Ok(())
    }

    fn l1_writeback(&mut self, msg: Message, now: Cycle, network: &mut Network) -> Result<(), Error> {
        let line = msg.addr;
        let l1 = self.l1_sender(&msg)?;
        let absorbed = match self.cache.lookup_mut(line) {
            Some(l) if l.state.owner() == Some(l1) => {
                if let Some(data) = msg.data {
                    l.data = data;
                }
                l.dirty |= msg.dirty;
                l.state.clear_owner();
                true
            }
            _ => false,
        };
        if absorbed {
            self.stats.writebacks_absorbed += 1;
            self.history.record(now, line, MessageType::PutX, l1, "-");
        } else {
            self.stats.stale_writebacks += 1;
            self.history.record(now, line, "StalePutX", l1, "-");
        }
        network.send(
            self.to_l1(MessageType::WbAck, line, l1, VirtualNetwork::Response),
            now,
        )
    }

    fn replace(&mut self, victim: LineAddress, now: Cycle, network: &mut Network) -> Result<(), Error> {
        let holders = self.holders(victim)?.clone();
        let owner = holders.owner().map(|o| (o, MessageType::RecallInv));
        let sharers: Vec<usize> = holders.sharers().iter().collect();
        self.tbes
            .insert(victim, Tbe::new(Txn::Replacement, Phase::Invalidating));
        self.stats.replacements += 1;
        let pending = self.invalidate(victim, owner, &sharers, now, network)?;
        self.history.record(now, victim, "Replacement", holders, "Invalidating");
        if pending == 0 {
            self.finish_replacement(victim, now, network)
        } else {
            self.tbe_mut(victim)?.pending = pending;
            Ok(())
        }
    }

    fn finish_replacement(&mut self, line: LineAddress, now: Cycle, network: &mut Network) -> Result<(), Error> {
        let l = match self.cache.deallocate(line) {
            Some(l) => l,
            None => return Err(self.violation(line, "replacing a missing line".into())),
        };
        if !l.state.is_empty() {
            return Err(self.violation(line, format!("replaced with L1 copies: {}", l.state)));
        }
        let msg = self
            .to_dir(MessageType::PutX, line, VirtualNetwork::Request)
            .with_data(l.data.clone(), l.dirty);
        network.send(msg, now)?;
        let tbe = self.tbe_mut(line)?;
        tbe.phase = Phase::WritingBack;
        tbe.data = Some(l.data);
        tbe.dirty = l.dirty;
        self.history.record(now, line, MessageType::PutX, "Invalidating", "WritingBack");
        // requests waiting for the slot
        self.stalls.wake(line);
        Ok(())
    }

    fn dir_recall(
        &mut self,
        msg: Message,
        now: Cycle,
        network: &mut Network,
    ) -> Result<Option<Message>, Error> {
        let line = msg.addr;
        if msg.sender != self.home(line) {
            return Err(self.unexpected(&msg));
        }
        let holders = match self.cache.lookup(line) {
            Some(l) => l.state.clone(),
            None => return Err(self.unexpected(&msg)),
        };
        if self.tbes.len() >= self.config.max_outstanding {
            return Ok(Some(msg));
        }
        let invalidate = msg.kind == MessageType::RecallInv;
        self.tbes.insert(
            line,
            Tbe::new(Txn::DirRecall { invalidate }, Phase::Invalidating),
        );
        let pending = if invalidate {
            let owner = holders.owner().map(|o| (o, MessageType::RecallInv));
            let sharers: Vec<usize> = holders.sharers().iter().collect();
            self.invalidate(line, owner, &sharers, now, network)?
        } else {
            let owner = holders
                .owner()
                .map(|o| (o, MessageType::RecallDowngrade));
            self.invalidate(line, owner, &[], now, network)?
        };
        self.history.record(now, line, msg.kind, holders, "Invalidating");
        if pending == 0 {
            self.finish_recall(line, now, network)?;
        } else {
            self.tbe_mut(line)?.pending = pending;
        }
        Ok(None)
    }

    fn finish_recall(&mut self, line: LineAddress, now: Cycle, network: &mut Network) -> Result<(), Error> {
        let invalidate = match self.tbes.get(&line).map(|tbe| tbe.txn) {
            Some(Txn::DirRecall { invalidate }) => invalidate,
            _ => return Err(self.violation(line, "finishing a recall that is not open".into())),
        };
        let (data, dirty) = if invalidate {
            match self.cache.deallocate(line) {
                Some(l) if l.state.is_empty() => (l.data, l.dirty),
                Some(l) => {
                    return Err(self.violation(line, format!("recalled with L1 copies: {}", l.state)))
                }
                None => return Err(self.violation(line, "recalling a missing line".into())),
            }
        } else {
            match self.cache.lookup_mut(line) {
                Some(l) => {
                    let dirty = l.dirty;
                    l.dirty = false;
                    (l.data.clone(), dirty)
                }
                None => return Err(self.violation(line, "recalling a missing line".into())),
            }
        };
        let msg = self
            .to_dir(MessageType::RecallData, line, VirtualNetwork::Response)
            .with_data(data, dirty)
            .with_kept(!invalidate);
        network.send(msg, now)?;
        self.tbes.remove(&line);
        self.history.record(
            now,
            line,
            MessageType::RecallData,
            "Invalidating",
            if invalidate { "NP" } else { "Idle" },
        );
        self.stalls.wake(line);
        Ok(())
    }

    /// A recall that crossed our PUTX: answer from the write-back buffer.
    fn recall_during_writeback(&mut self, msg: Message, now: Cycle, network: &mut Network) -> Result<(), Error> {
        let line = msg.addr;
        let (data, dirty) = match self.tbes.get(&line) {
            Some(Tbe {
                data: Some(data),
                dirty,
                ..
            }) => (data.clone(), *dirty),
            _ => return Err(self.unexpected(&msg)),
        };
        let reply = self
            .to_dir(MessageType::RecallData, line, VirtualNetwork::Response)
            .with_data(data, dirty);
        network.send(reply, now)?;
        self.history.record(now, line, msg.kind, "WritingBack", "WritingBack");
        Ok(())
    }

    /// All acks are in: finish whatever transaction was waiting for them.
    fn acks_done(&mut self, line: LineAddress, now: Cycle, network: &mut Network) -> Result<(), Error> {
        match self.tbes.get(&line).map(|tbe| tbe.txn) {
            Some(Txn::L1Request { .. }) => self.serve(line, now, network),
            Some(Txn::Replacement) => self.finish_replacement(line, now, network),
            Some(Txn::DirRecall { .. }) => self.finish_recall(line, now, network),
            None => Err(self.violation(line, "acks without a transaction".into())),
        }
    }

    fn response(&mut self, msg: Message, now: Cycle, network: &mut Network) -> Result<(), Error> {
        let line = msg.addr;
        match msg.kind {
            MessageType::InvAck | MessageType::RecallData => {
                let l1 = self.l1_sender(&msg)?;
                match self.tbes.get(&line) {
                    Some(tbe) if tbe.phase == Phase::Invalidating && tbe.pending > 0 => {}
                    _ => return Err(self.unexpected(&msg)),
                }
                if msg.kind == MessageType::RecallData {
                    let data = match msg.data {
                        Some(data) => data,
                        None => return Err(self.violation(line, "recall without data".into())),
                    };
                    let l = match self.cache.lookup_mut(line) {
                        Some(l) => l,
                        None => return Err(self.violation(line, "recall data for a missing line".into())),
                    };
                    l.data = data;
                    l.dirty |= msg.dirty;
                    if l.state.owner() == Some(l1) {
                        l.state.clear_owner();
                    }
                    if msg.kept {
                        l.state.add_sharer(l1);
                    }
                } else {
                    self.holders_mut(line)?.remove_sharer(l1);
                }
                let tbe = self.tbe_mut(line)?;
                tbe.pending -= 1;
                if tbe.pending == 0 {
                    self.acks_done(line, now, network)?;
                }
                Ok(())
            }
            MessageType::DataExclusive => {
                match self.tbes.get(&line) {
                    Some(tbe) if tbe.phase == Phase::FetchingFromDir => {}
                    _ => return Err(self.unexpected(&msg)),
                }
                let data = match msg.data {
                    Some(data) => data,
                    None => return Err(self.violation(line, "fill without data".into())),
                };
                match self.cache.lookup_mut(line) {
                    Some(l) => {
                        l.data = data;
                        l.dirty = msg.dirty;
                    }
                    None => return Err(self.violation(line, "fill without a slot".into())),
                }
                network.send(self.to_dir(MessageType::Unblock, line, VirtualNetwork::Unblock), now)?;
                self.tbe_mut(line)?.phase = Phase::Invalidating;
                self.history.record(now, line, msg.kind, "FetchingFromDir", "Idle");
                self.serve(line, now, network)
            }
            MessageType::WbAck => {
                match self.tbes.get(&line) {
                    Some(Tbe {
                        txn: Txn::Replacement,
                        phase: Phase::WritingBack,
                        ..
                    }) => {}
                    _ => return Err(self.unexpected(&msg)),
                }
                self.tbes.remove(&line);
                self.history.record(now, line, msg.kind, "WritingBack", "NP");
                self.stalls.wake(line);
                Ok(())
            }
            _ => Err(self.unexpected(&msg)),
        }
    }

    fn unblock(&mut self, msg: Message, now: Cycle) -> Result<(), Error> {
        let line = msg.addr;
        let l1 = self.l1_sender(&msg)?;
        match self.tbes.get(&line) {
            Some(Tbe {
                txn: Txn::L1Request { requestor, .. },
                phase: Phase::WaitingUnblock,
                ..
            }) if *requestor == l1 => {}
            _ => return Err(self.unexpected(&msg)),
        }
        if msg.kind == MessageType::ExclusiveUnblock && self.holders(line)?.owner() != Some(l1) {
            return Err(self.unexpected(&msg));
        }
        self.tbes.remove(&line);
        self.history.record(now, line, msg.kind, "WaitingUnblock", "Idle");
        self.stalls.wake(line);
        Ok(())
    }
}

fn grant_state(grant: MessageType) -> &'static str {
    match grant {
        MessageType::DataExclusive => "WaitingUnblock(E)",
        _ => "WaitingUnblock(S)",
    }
}

impl Controller for L2Controller {
    fn id(&self) -> MachineId {
        self.id
    }

    fn wakeup(&mut self, now: Cycle, network: &mut Network) -> Result<(), Error> {
        let mut budget = self.config.transitions_per_cycle;
        while budget > 0 {
            budget -= 1;
            let room = network.can_send(self.id, &VirtualNetwork::ALL, CHANNEL_RESERVE);
            if room {
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
                    log::warn!("{}: out of transaction buffers", self.id);
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
        self.tbes.is_empty() && self.stalls.is_empty()
    }

    fn describe_line(&self, line: LineAddress) -> String {
        let mut s = match self.cache.lookup(line) {
            Some(l) => format!("{}{}", l.state, if l.dirty { " dirty" } else { "" }),
            None => "NP".to_string(),
        };
        if let Some(tbe) = self.tbes.get(&line) {
            s += &format!(" busy {:?} {:?}", tbe.txn, tbe.phase);
            if tbe.pending > 0 {
                s += &format!(" ({} acks pending)", tbe.pending);
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
