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

//! The private per-core cache.
//!
//! Split into an instruction and a data array. A line lives in at most one
//! of them; touching it through the other array evicts it first.
//!
//! Stable states are I, S, E and M. A miss allocates its slot up front and
//! waits in IS or IM, a store to a shared line waits in SM, and an evicted
//! exclusive line waits in M_I (slot already freed, data kept in the
//! transaction buffer) until the L2 acknowledges the write-back.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::cache::CacheMemory;
use crate::config::{L1Configuration, CHANNEL_RESERVE};
use crate::controller::{Controller, TransitionLog};
use crate::entry::CacheLine;
use crate::message::{DataBlock, MachineId, Message, MessageType, VirtualNetwork};
use crate::network::Network;
use crate::sequencer::{CoreRequest, RequestId, RequestKind, Sequencer};
use crate::stall::StallTable;
use crate::{Address, AddressMap, Cycle, Error, LineAddress};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum L1State {
    I,
    S,
    E,
    M,
    IS,
    IM,
    SM,
    MI,
}

impl L1State {
    pub fn is_stable(self) -> bool {
        matches!(self, L1State::I | L1State::S | L1State::E | L1State::M)
    }

    pub fn is_exclusive(self) -> bool {
        matches!(self, L1State::E | L1State::M)
    }
}

impl fmt::Display for L1State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            L1State::MI => write!(f, "M_I"),
            other => write!(f, "{:?}", other),
        }
    }
}

struct Tbe {
    state: L1State,
    /// None for prefetches and write-backs.
    demand: Option<CoreRequest>,
    icache: bool,
    /// Write-back buffer of M_I.
    data: Option<DataBlock>,
    dirty: bool,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct L1Stats {
    pub hits: usize,
    pub misses: usize,
    pub upgrades: usize,
    pub evictions: usize,
    pub writebacks: usize,
    pub invalidations: usize,
    pub recalls: usize,
    pub stalls: usize,
    pub prefetches_issued: usize,
    pub prefetches_dropped: usize,
}

type LineArray = CacheMemory<CacheLine<L1State>>;

pub struct L1Controller {
    id: MachineId,
    map: AddressMap,
    config: L1Configuration,
    icache: LineArray,
    dcache: LineArray,
    tbes: HashMap<LineAddress, Tbe>,
    mandatory: VecDeque<CoreRequest>,
    prefetches: VecDeque<CoreRequest>,
    stalls: StallTable<CoreRequest>,
    sequencer: Sequencer,
    history: TransitionLog,
    stats: L1Stats,
}

impl L1Controller {
    pub fn new(version: usize, config: &L1Configuration, map: AddressMap) -> Result<Self, Error> {
        let id = MachineId::l1(version);
        Ok(Self {
            id,
            map,
            config: config.clone(),
            icache: CacheMemory::new(&config.icache, map.block_bytes(), map.block_bits())?,
            dcache: CacheMemory::new(&config.dcache, map.block_bytes(), map.block_bits())?,
            tbes: HashMap::new(),
            mandatory: VecDeque::new(),
            prefetches: VecDeque::new(),
            stalls: StallTable::new(),
            sequencer: Sequencer::new(version, config.deadlock_threshold),
            history: TransitionLog::new(id),
            stats: L1Stats::default(),
        })
    }

    /// Queues a core request; it is processed from the next wakeup on.
    pub fn issue(&mut self, addr: Address, kind: RequestKind, now: Cycle) -> Result<RequestId, Error> {
        let request = self.sequencer.issue(addr, kind, now)?;
        let id = request.id;
        self.mandatory.push_back(request);
        Ok(id)
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn sequencer_mut(&mut self) -> &mut Sequencer {
        &mut self.sequencer
    }

    pub fn stats(&self) -> &L1Stats {
        &self.stats
    }

    pub fn state(&self, line: LineAddress) -> L1State {
        if let Some(tbe) = self.tbes.get(&line) {
            return tbe.state;
        }
        self.locate(line)
            .and_then(|icache| self.array(icache).lookup(line))
            .map(|entry| entry.state)
            .unwrap_or(L1State::I)
    }

    /// Every allocated line with its state.
    pub fn lines(&self) -> Vec<(LineAddress, L1State)> {
        self.icache
            .iter()
            .chain(self.dcache.iter())
            .map(|(line, entry)| (line, entry.state))
            .collect()
    }

    /// The word at `addr` if the line is readable here.
    pub fn peek_word(&self, addr: Address) -> Option<u64> {
        let line = self.map.line(addr);
        let icache = self.locate(line)?;
        let entry = self.array(icache).lookup(line)?;
        match entry.state {
            L1State::S | L1State::E | L1State::M => {
                Some(entry.data.read_word(self.map.offset(addr)))
            }
            _ => None,
        }
    }

    fn array(&self, icache: bool) -> &LineArray {
        if icache {
            &self.icache
        } else {
            &self.dcache
        }
    }

    fn array_mut(&mut self, icache: bool) -> &mut LineArray {
        if icache {
            &mut self.icache
        } else {
            &mut self.dcache
        }
    }

    /// Which array holds `line`: Some(true) for the instruction array.
    fn locate(&self, line: LineAddress) -> Option<bool> {
        if self.icache.contains(line) {
            Some(true)
        } else if self.dcache.contains(line) {
            Some(false)
        } else {
            None
        }
    }

    fn home(&self, line: LineAddress) -> MachineId {
        MachineId::l2(self.map.l2_bank(line))
    }

    fn message(&self, kind: MessageType, line: LineAddress, vnet: VirtualNetwork) -> Message {
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
                self.state(msg.addr)
            ),
        )
    }

    fn can_send(&self, network: &Network, vnet: VirtualNetwork) -> bool {
        network.can_send(self.id, &[vnet], CHANNEL_RESERVE)
    }

    fn complete(&mut self, request: &CoreRequest, icache: bool, line: LineAddress, now: Cycle) {
        let offset = self.map.offset(request.addr);
        let entry = match self.array_mut(icache).lookup_mut(line) {
            Some(entry) => entry,
            None => return,
        };
        let value = match request.kind {
            RequestKind::Load | RequestKind::IFetch => entry.data.read_word(offset),
            RequestKind::Store(value) => {
                entry.data.write_word(offset, value);
                entry.dirty = true;
                value
            }
        };
        if !request.prefetch {
            self.sequencer.complete(request.id, value, now);
        }
    }

    fn forward_eviction(&mut self, line: LineAddress) {
        if self.config.send_evictions {
            self.sequencer.evicted(line);
        }
    }

    fn drop_prefetch(&mut self, request: &CoreRequest, why: &str) {
        log::trace!("{}: dropping prefetch of {}: {}", self.id, request.addr, why);
        self.stats.prefetches_dropped += 1;
    }

    /// Handles a core request. Returns the request back when it has to
    /// wait for a free transaction buffer.
    fn core_request(
        &mut self,
        request: CoreRequest,
        now: Cycle,
        network: &mut Network,
    ) -> Result<Option<CoreRequest>, Error> {
        let line = self.map.line(request.addr);
        let icache = request.kind == RequestKind::IFetch;
        if self.tbes.contains_key(&line) {
            if request.prefetch {
                self.drop_prefetch(&request, "line busy");
            } else {
                log::trace!("{}: stall {:?} on busy line {}", self.id, request.kind, line);
                self.stats.stalls += 1;
                self.stalls.stall(line, request);
            }
            return Ok(None);
        }

        if self.array(!icache).contains(line) {
            if request.prefetch {
                self.drop_prefetch(&request, "line in the other array");
                return Ok(None);
            }
            if self.tbes.len() >= self.config.max_outstanding {
                return Ok(Some(request));
            }
            self.evict(line, !icache, now, network)?;
            if self.tbes.contains_key(&line) {
                self.stalls.stall(line, request);
            } else {
                // the miss may need two more request slots
                self.stalls.defer(request);
            }
            return Ok(None);
        }

        match self.array(icache).lookup(line).map(|entry| entry.state) {
            Some(state) if state.is_stable() => self.hit(request, state, line, icache, now, network),
            Some(state) => Err(self.violation(
                line,
                format!("{} without a transaction buffer", state),
            )),
            None => self.miss(request, line, icache, now, network),
        }
    }

    fn hit(
        &mut self,
        request: CoreRequest,
        state: L1State,
        line: LineAddress,
        icache: bool,
        now: Cycle,
        network: &mut Network,
    ) -> Result<Option<CoreRequest>, Error> {
        if request.prefetch {
            return Ok(None);
        }
        let next = match (state, request.kind) {
            (_, RequestKind::Load) | (_, RequestKind::IFetch) => state,
            (L1State::E, RequestKind::Store(_)) | (L1State::M, RequestKind::Store(_)) => L1State::M,
            (_, RequestKind::Store(_)) => {
                if self.tbes.len() >= self.config.max_outstanding {
                    return Ok(Some(request));
                }
                let msg = self.message(MessageType::Upgrade, line, VirtualNetwork::Request);
                network.send(msg, now)?;
                if let Some(entry) = self.array_mut(icache).lookup_mut(line) {
                    entry.state = L1State::SM;
                }
                self.array_mut(icache).touch(line);
                self.tbes.insert(
                    line,
                    Tbe {
                        state: L1State::SM,
                        demand: Some(request),
                        icache,
                        data: None,
                        dirty: false,
                    },
                );
                self.stats.upgrades += 1;
                self.history
                    .record(now, line, MessageType::Upgrade, state, L1State::SM);
                return Ok(None);
            }
        };
        if next != state {
            if let Some(entry) = self.array_mut(icache).lookup_mut(line) {
                entry.state = next;
            }
            self.history.record(now, line, "Store", state, next);
        }
        self.array_mut(icache).touch(line);
        self.complete(&request, icache, line, now);
        self.stats.hits += 1;
        Ok(None)
    }

    fn miss(
        &mut self,
        request: CoreRequest,
        line: LineAddress,
        icache: bool,
        now: Cycle,
        network: &mut Network,
    ) -> Result<Option<CoreRequest>, Error> {
        if self.tbes.len() >= self.config.max_outstanding {
            if request.prefetch {
                self.drop_prefetch(&request, "no transaction buffer");
                return Ok(None);
            }
            return Ok(Some(request));
        }
        if !self.array(icache).has_free_way(line) {
            let tbes = &self.tbes;
            let victim = self
                .array(icache)
                .victim(line, |l, _| !tbes.contains_key(&l));
            match victim {
                _ if request.prefetch => {
                    self.drop_prefetch(&request, "no free way");
                    return Ok(None);
                }
                None => {
                    // every way is mid-transaction; retry when one resolves
                    let busy = self.array(icache).set_lines(line)[0];
                    self.stats.stalls += 1;
                    self.stalls.stall(busy, request);
                    return Ok(None);
                }
                Some(victim) => {
                    let needs_buffer = self
                        .array(icache)
                        .lookup(victim)
                        .map(|entry| entry.state.is_exclusive())
                        .unwrap_or(false);
                    if needs_buffer && self.tbes.len() + 2 > self.config.max_outstanding {
                        return Ok(Some(request));
                    }
                    self.evict(victim, icache, now, network)?;
                }
            }
        }

        let (kind, state) = match request.kind {
            RequestKind::Load => (MessageType::GetS, L1State::IS),
            RequestKind::IFetch => (MessageType::GetInstr, L1State::IS),
            RequestKind::Store(_) => (MessageType::GetX, L1State::IM),
        };
        let msg = self.message(kind, line, VirtualNetwork::Request);
        network.send(msg, now)?;
        let block_bytes = self.map.block_bytes();
        if self
            .array_mut(icache)
            .allocate(line, CacheLine::new(state, block_bytes))
            .is_none()
        {
            return Err(self.violation(line, "no slot for the missing line".into()));
        }
        self.history.record(now, line, kind, L1State::I, state);
        let prefetch = request.prefetch;
        self.tbes.insert(
            line,
            Tbe {
                state,
                demand: if prefetch { None } else { Some(request) },
                icache,
                data: None,
                dirty: false,
            },
        );
        if prefetch {
            self.stats.prefetches_issued += 1;
        } else {
            self.stats.misses += 1;
            if self.config.enable_prefetch && !icache {
                let next = self.map.next_line(line);
                self.prefetches.push_back(CoreRequest {
                    id: 0,
                    addr: next.base(),
                    kind: RequestKind::Load,
                    prefetch: true,
                    issued: now,
                });
            }
        }
        Ok(None)
    }

    /// Gives up a stable line. Exclusive lines move to M_I.
    fn evict(
        &mut self,
        line: LineAddress,
        icache: bool,
        now: Cycle,
        network: &mut Network,
    ) -> Result<(), Error> {
        let (state, data) = match self.array(icache).lookup(line) {
            Some(entry) => (entry.state, entry.data.clone()),
            None => return Err(self.violation(line, "evicting a missing line".into())),
        };
        let next = match state {
            L1State::S => {
                let msg = self.message(MessageType::PutS, line, VirtualNetwork::Request);
                network.send(msg, now)?;
                L1State::I
            }
            L1State::E | L1State::M => {
                let dirty = state == L1State::M;
                let msg = self
                    .message(MessageType::PutX, line, VirtualNetwork::Request)
                    .with_data(data.clone(), dirty);
                network.send(msg, now)?;
                self.tbes.insert(
                    line,
                    Tbe {
                        state: L1State::MI,
                        demand: None,
                        icache,
                        data: Some(data),
                        dirty,
                    },
                );
                self.stats.writebacks += 1;
                L1State::MI
            }
            _ => {
                return Err(self.violation(line, format!("evicting a line in {}", state)));
            }
        };
        self.array_mut(icache).deallocate(line);
        self.forward_eviction(line);
        self.stats.evictions += 1;
        self.history.record(now, line, "Replacement", state, next);
        Ok(())
    }

    fn response(&mut self, msg: Message, now: Cycle, network: &mut Network) -> Result<(), Error> {
        let line = msg.addr;
        match msg.kind {
            MessageType::Data | MessageType::DataExclusive => self.fill(msg, now, network),
            MessageType::WbAck => match self.tbes.get(&line).map(|tbe| tbe.state) {
                Some(L1State::MI) => {
                    self.tbes.remove(&line);
                    self.history.record(now, line, msg.kind, L1State::MI, L1State::I);
                    self.stalls.wake(line);
                    Ok(())
                }
                _ => Err(self.unexpected(&msg)),
            },
            _ => Err(self.unexpected(&msg)),
        }
    }

    fn fill(&mut self, msg: Message, now: Cycle, network: &mut Network) -> Result<(), Error> {
        let line = msg.addr;
        let exclusive = msg.kind == MessageType::DataExclusive;
        let state = self.tbes.get(&line).map(|tbe| tbe.state);
        let next = match (state, exclusive) {
            (Some(L1State::IS), false) => L1State::S,
            (Some(L1State::IS), true) => L1State::E,
            (Some(L1State::IM), true) | (Some(L1State::SM), true) => L1State::M,
            _ => return Err(self.unexpected(&msg)),
        };
        let data = match msg.data {
            Some(data) => data,
            None => return Err(self.violation(line, format!("{:?} without data", msg.kind))),
        };
        let tbe = match self.tbes.remove(&line) {
            Some(tbe) => tbe,
            None => return Err(self.violation(line, "lost transaction buffer".into())),
        };
        match self.array_mut(tbe.icache).lookup_mut(line) {
            Some(entry) => {
                entry.state = next;
                entry.data = data;
                entry.dirty = false;
            }
            None => return Err(self.violation(line, "fill without an allocated slot".into())),
        }
        let unblock = if exclusive {
            MessageType::ExclusiveUnblock
        } else {
            MessageType::Unblock
        };
        let reply = self.message(unblock, line, VirtualNetwork::Unblock);
        network.send(reply, now)?;
        self.history.record(now, line, msg.kind, tbe.state, next);
        if let Some(request) = tbe.demand {
            self.complete(&request, tbe.icache, line, now);
        }
        self.stalls.wake(line);
        Ok(())
    }

    /// Invalidations and recalls from the L2.
    fn forward(&mut self, msg: Message, now: Cycle, network: &mut Network) -> Result<(), Error> {
        let line = msg.addr;
        let state = self.state(line);
        let next = match msg.kind {
            MessageType::Inv => {
                let next = match state {
                    L1State::S => {
                        if let Some(icache) = self.locate(line) {
                            self.array_mut(icache).deallocate(line);
                        }
                        self.forward_eviction(line);
                        L1State::I
                    }
                    L1State::SM => {
                        if let Some(tbe) = self.tbes.get_mut(&line) {
                            tbe.state = L1State::IM;
                            let icache = tbe.icache;
                            if let Some(entry) = self.array_mut(icache).lookup_mut(line) {
                                entry.state = L1State::IM;
                            }
                        }
                        self.forward_eviction(line);
                        L1State::IM
                    }
                    L1State::I | L1State::IS | L1State::IM | L1State::MI => state,
                    L1State::E | L1State::M => return Err(self.unexpected(&msg)),
                };
                let ack = self
                    .message(MessageType::InvAck, line, VirtualNetwork::Response)
                    .with_requestor(msg.requestor);
                network.send(ack, now)?;
                self.stats.invalidations += 1;
                next
            }
            MessageType::RecallInv | MessageType::RecallDowngrade => {
                let keep = msg.kind == MessageType::RecallDowngrade;
                let (data, dirty, next) = match state {
                    L1State::E | L1State::M => {
                        let icache = match self.locate(line) {
                            Some(icache) => icache,
                            None => return Err(self.unexpected(&msg)),
                        };
                        let dirty = state == L1State::M;
                        let data = if keep {
                            match self.array_mut(icache).lookup_mut(line) {
                                Some(entry) => {
                                    entry.state = L1State::S;
                                    entry.dirty = false;
                                    entry.data.clone()
                                }
                                None => return Err(self.unexpected(&msg)),
                            }
                        } else {
                            match self.array_mut(icache).deallocate(line) {
                                Some(entry) => entry.data,
                                None => return Err(self.unexpected(&msg)),
                            }
                        };
                        if !keep {
                            self.forward_eviction(line);
                        }
                        (data, dirty, if keep { L1State::S } else { L1State::I })
                    }
                    // answered from the write-back buffer; the PUTX in
                    // flight will be acknowledged as stale
                    L1State::MI => match self.tbes.get(&line) {
                        Some(Tbe {
                            data: Some(data),
                            dirty,
                            ..
                        }) => (data.clone(), *dirty, L1State::MI),
                        _ => return Err(self.unexpected(&msg)),
                    },
                    _ => return Err(self.unexpected(&msg)),
                };
                let kept = keep && next == L1State::S;
                let reply = self
                    .message(MessageType::RecallData, line, VirtualNetwork::Response)
                    .with_data(data, dirty)
                    .with_kept(kept);
                network.send(reply, now)?;
                self.stats.recalls += 1;
                next
            }
            _ => return Err(self.unexpected(&msg)),
        };
        self.history.record(now, line, msg.kind, state, next);
        Ok(())
    }
}

impl Controller for L1Controller {
    fn id(&self) -> MachineId {
        self.id
    }

    fn wakeup(&mut self, now: Cycle, network: &mut Network) -> Result<(), Error> {
        let mut budget = self.config.transitions_per_cycle;
        while budget > 0 {
            budget -= 1;
            if self.can_send(network, VirtualNetwork::Unblock) {
                if let Some(msg) = network.receive(self.id, VirtualNetwork::Response, now) {
                    self.response(msg, now, network)?;
                    continue;
                }
            }
            if self.can_send(network, VirtualNetwork::Response) {
                if let Some(msg) = network.receive(self.id, VirtualNetwork::Unblock, now) {
                    self.forward(msg, now, network)?;
                    continue;
                }
            }
            if !self.can_send(network, VirtualNetwork::Request) {
                log::trace!("{}: request network full", self.id);
                break;
            }
            if let Some(request) = self.stalls.pop_ready() {
                if let Some(request) = self.core_request(request, now, network)? {
                    self.stalls.defer(request);
                    break;
                }
                continue;
            }
            if let Some(request) = self.mandatory.pop_front() {
                if let Some(request) = self.core_request(request, now, network)? {
                    log::warn!("{}: out of transaction buffers", self.id);
                    self.mandatory.push_front(request);
                    break;
                }
                continue;
            }
            if let Some(request) = self.prefetches.pop_front() {
                self.core_request(request, now, network)?;
                continue;
            }
            break;
        }
        Ok(())
    }

    fn is_quiescent(&self) -> bool {
        self.tbes.is_empty()
            && self.mandatory.is_empty()
            && self.prefetches.is_empty()
            && self.stalls.is_empty()
    }

    fn describe_line(&self, line: LineAddress) -> String {
        let stalled = self.stalls.stalled_on(line).count();
        if stalled > 0 {
            format!("{} ({} stalled)", self.state(line), stalled)
        } else {
            format!("{}", self.state(line))
        }
    }

    fn history(&self) -> &TransitionLog {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheGeometry, ChannelConfiguration};

    struct Harness {
        l1: L1Controller,
        network: Network,
        map: AddressMap,
        now: Cycle,
    }

    impl Harness {
        fn new(config: L1Configuration) -> Self {
            Self::with_channel(config, ChannelConfiguration::default())
        }

        fn with_channel(config: L1Configuration, channel: ChannelConfiguration) -> Self {
            let map = AddressMap::new(64, 1, 1);
            let mut network = Network::new(0);
            let (l1, l2) = (MachineId::l1(0), MachineId::l2(0));
            for vnet in VirtualNetwork::ALL.iter() {
                network.connect(l1, l2, *vnet, false, &channel).unwrap();
            }
            for vnet in [VirtualNetwork::Response, VirtualNetwork::Unblock].iter() {
                network.connect(l2, l1, *vnet, false, &channel).unwrap();
            }
            Self {
                l1: L1Controller::new(0, &config, map).unwrap(),
                network,
                map,
                now: 0,
            }
        }

        fn tick(&mut self) {
            self.l1.wakeup(self.now, &mut self.network).unwrap();
            self.now += 1;
        }

        /// Everything the L1 sent to the L2, in arrival order.
        fn sent(&mut self) -> Vec<Message> {
            let mut msgs = vec![];
            for _ in 0..4 {
                for vnet in VirtualNetwork::ALL.iter() {
                    while let Some(m) = self.network.receive(MachineId::l2(0), *vnet, self.now) {
                        msgs.push(m);
                    }
                }
                self.now += 1;
            }
            msgs
        }

        fn reply(&mut self, kind: MessageType, addr: u64, data: Option<DataBlock>) {
            self.post(kind, addr, data);
            self.tick();
        }

        fn post(&mut self, kind: MessageType, addr: u64, data: Option<DataBlock>) {
            let vnet = match kind {
                MessageType::Inv | MessageType::RecallInv | MessageType::RecallDowngrade => {
                    VirtualNetwork::Unblock
                }
                _ => VirtualNetwork::Response,
            };
            let mut msg = Message::new(
                kind,
                self.map.line(Address(addr)),
                MachineId::l2(0),
                MachineId::l1(0),
                vnet,
            );
            msg.data = data;
            self.network.send(msg, self.now).unwrap();
            self.now += 1;
        }
    }

    fn small() -> L1Configuration {
        L1Configuration {
            icache: CacheGeometry::new(128, 1),
            dcache: CacheGeometry::new(128, 1),
            ..Default::default()
        }
    }

    fn block(word: u64) -> Option<DataBlock> {
        let mut data = DataBlock::new(64);
        data.write_word(0, word);
        Some(data)
    }

    #[test]
    fn load_miss_then_hit() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let mut h = Harness::new(small());
        let line = h.map.line(Address(0x80));
        h.l1.issue(Address(0x80), RequestKind::Load, h.now).unwrap();
        h.tick();
        assert_eq!(h.l1.state(line), L1State::IS);
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageType::GetS);

        // a second load to the busy line waits
        h.l1.issue(Address(0x88), RequestKind::Load, h.now).unwrap();
        h.tick();
        assert_eq!(h.l1.stats().stalls, 1);

        h.reply(MessageType::DataExclusive, 0x80, block(9));
        assert_eq!(h.l1.state(line), L1State::E);
        let sent = h.sent();
        assert_eq!(sent[0].kind, MessageType::ExclusiveUnblock);
        let done = h.l1.sequencer_mut().drain_completions();
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].value, 9);
        assert_eq!(done[1].value, 0);
        assert!(h.l1.is_quiescent());
    }

    #[test]
    fn store_to_exclusive_is_silent() {
        let mut h = Harness::new(small());
        let line = h.map.line(Address(0));
        h.l1.issue(Address(0), RequestKind::Load, h.now).unwrap();
        h.tick();
        h.sent();
        h.reply(MessageType::DataExclusive, 0, block(1));
        h.sent();
        h.l1.issue(Address(0), RequestKind::Store(2), h.now).unwrap();
        h.tick();
        assert_eq!(h.l1.state(line), L1State::M);
        assert!(h.sent().is_empty());
        assert_eq!(h.l1.peek_word(Address(0)), Some(2));
    }

    #[test]
    fn upgrade_loses_race_to_invalidation() {
        let mut h = Harness::new(small());
        let line = h.map.line(Address(0));
        h.l1.issue(Address(0), RequestKind::Load, h.now).unwrap();
        h.tick();
        h.sent();
        h.reply(MessageType::Data, 0, block(1));
        assert_eq!(h.l1.state(line), L1State::S);
        h.sent();

        h.l1.issue(Address(0), RequestKind::Store(5), h.now).unwrap();
        h.tick();
        assert_eq!(h.l1.state(line), L1State::SM);
        assert_eq!(h.sent()[0].kind, MessageType::Upgrade);

        h.reply(MessageType::Inv, 0, None);
        assert_eq!(h.l1.state(line), L1State::IM);
        assert_eq!(h.sent()[0].kind, MessageType::InvAck);

        h.reply(MessageType::DataExclusive, 0, block(7));
        assert_eq!(h.l1.state(line), L1State::M);
        assert_eq!(h.l1.peek_word(Address(0)), Some(5));
        let done = h.l1.sequencer_mut().drain_completions();
        assert_eq!(done.last().map(|c| c.value), Some(5));
    }

    #[test]
    fn dirty_eviction_goes_through_m_i() {
        let mut h = Harness::new(small());
        // 2 sets x 1 way: 0x0 and 0x80 collide
        let (a, b) = (h.map.line(Address(0)), h.map.line(Address(0x80)));
        h.l1.issue(Address(0), RequestKind::Store(3), h.now).unwrap();
        h.tick();
        h.sent();
        h.reply(MessageType::DataExclusive, 0, block(0));
        h.sent();
        assert_eq!(h.l1.state(a), L1State::M);

        h.l1.issue(Address(0x80), RequestKind::Load, h.now).unwrap();
        h.tick();
        let sent = h.sent();
        // the write-back is on its way before the slot is reused
        assert_eq!(sent[0].kind, MessageType::PutX);
        assert!(sent[0].dirty);
        assert_eq!(sent[0].data.as_ref().map(|d| d.read_word(0)), Some(3));
        assert_eq!(sent[1].kind, MessageType::GetS);
        assert_eq!(h.l1.state(a), L1State::MI);
        assert_eq!(h.l1.state(b), L1State::IS);

        // a recall while in M_I is answered from the write-back buffer
        h.reply(MessageType::RecallInv, 0, None);
        let sent = h.sent();
        assert_eq!(sent[0].kind, MessageType::RecallData);
        assert!(!sent[0].kept);
        assert_eq!(h.l1.state(a), L1State::MI);

        h.reply(MessageType::WbAck, 0, None);
        assert_eq!(h.l1.state(a), L1State::I);
    }

    #[test]
    fn downgrade_keeps_a_shared_copy() {
        let mut config = small();
        config.send_evictions = true;
        let mut h = Harness::new(config);
        let line = h.map.line(Address(0x40));
        h.l1.issue(Address(0x40), RequestKind::Store(11), h.now).unwrap();
        h.tick();
        h.sent();
        h.reply(MessageType::DataExclusive, 0x40, block(0));
        h.sent();
        h.reply(MessageType::RecallDowngrade, 0x40, None);
        assert_eq!(h.l1.state(line), L1State::S);
        let sent = h.sent();
        assert_eq!(sent[0].kind, MessageType::RecallData);
        assert!(sent[0].dirty);
        assert!(sent[0].kept);
        h.reply(MessageType::Inv, 0x40, None);
        assert_eq!(h.l1.state(line), L1State::I);
        assert_eq!(h.sent()[0].kind, MessageType::InvAck);
        assert_eq!(h.l1.sequencer_mut().drain_evictions(), vec![line]);

        // only exclusive copies can be recalled
        h.post(MessageType::RecallInv, 0x40, None);
        assert!(matches!(
            h.l1.wakeup(h.now, &mut h.network),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn instruction_fetch_evicts_data_copy() {
        let mut h = Harness::new(small());
        let line = h.map.line(Address(0));
        h.l1.issue(Address(0), RequestKind::Load, h.now).unwrap();
        h.tick();
        h.sent();
        h.reply(MessageType::Data, 0, block(4));
        h.sent();
        h.l1.issue(Address(0), RequestKind::IFetch, h.now).unwrap();
        h.tick();
        let kinds: Vec<_> = h.sent().iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MessageType::PutS, MessageType::GetInstr]);
        assert_eq!(h.l1.state(line), L1State::IS);
    }

    #[test]
    fn cross_array_miss_waits_for_request_slots() {
        let channel = ChannelConfiguration {
            capacity: 2 * CHANNEL_RESERVE,
            latency: 1,
            jitter: 0,
        };
        let mut h = Harness::with_channel(small(), channel);
        // 0x0 and 0x80 share a set in both arrays
        let (x, y) = (h.map.line(Address(0)), h.map.line(Address(0x80)));
        h.l1.issue(Address(0), RequestKind::IFetch, h.now).unwrap();
        h.tick();
        h.sent();
        h.reply(MessageType::Data, 0, block(4));
        h.sent();
        h.l1.issue(Address(0x80), RequestKind::Load, h.now).unwrap();
        h.tick();
        h.sent();
        h.reply(MessageType::Data, 0x80, block(5));
        h.sent();
        assert_eq!(h.l1.state(x), L1State::S);
        assert_eq!(h.l1.state(y), L1State::S);

        // leave exactly the reserve free on the request channel
        for addr in [0x1000u64, 0x2000].iter() {
            let msg = Message::new(
                MessageType::PutS,
                h.map.line(Address(*addr)),
                MachineId::l1(0),
                MachineId::l2(0),
                VirtualNetwork::Request,
            );
            h.network.send(msg, h.now).unwrap();
        }

        // the data load first evicts the instruction copy, then waits
        h.l1.issue(Address(0), RequestKind::Load, h.now).unwrap();
        h.tick();
        assert_eq!(h.l1.state(x), L1State::I);
        assert_eq!(h.l1.state(y), L1State::S);
        assert!(!h.l1.is_quiescent());
        let kinds: Vec<_> = h.sent().iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![MessageType::PutS, MessageType::PutS, MessageType::PutS]
        );

        h.tick();
        let sent = h.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!((sent[0].kind, sent[0].addr), (MessageType::PutS, y));
        assert_eq!((sent[1].kind, sent[1].addr), (MessageType::GetS, x));
        assert_eq!(h.l1.state(x), L1State::IS);
        assert_eq!(h.l1.state(y), L1State::I);
        h.reply(MessageType::DataExclusive, 0, block(4));
        let done = h.l1.sequencer_mut().drain_completions();
        assert_eq!(done.last().map(|c| c.value), Some(4));
    }

    #[test]
    fn next_line_prefetch() {
        let mut config = small();
        config.enable_prefetch = true;
        let mut h = Harness::new(config);
        h.l1.issue(Address(0), RequestKind::Load, h.now).unwrap();
        h.tick();
        let sent = h.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].addr, h.map.line(Address(0x40)));
        assert_eq!(h.l1.stats().prefetches_issued, 1);
        h.reply(MessageType::Data, 0x40, block(0));
        assert!(h.l1.sequencer_mut().drain_completions().is_empty());
    }
}
