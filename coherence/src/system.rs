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

//! Builds a complete memory system from a `SystemConfiguration` and runs it
//! one cycle at a time.

use itertools::Itertools;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write;

use crate::channel::ChannelStats;
use crate::config::SystemConfiguration;
use crate::controller::directory::{DirectoryController, DirectoryStats};
use crate::controller::dma::{DmaController, DmaStats};
use crate::controller::l1::{L1Controller, L1State, L1Stats};
use crate::controller::l2::{L2Controller, L2Stats};
use crate::controller::Controller;
use crate::error::Violation;
use crate::memory::SimpleMemory;
use crate::message::{MachineId, VirtualNetwork};
use crate::network::{format_messages, Network};
use crate::sequencer::{Completion, DmaCompletion, DmaKind, RequestId, RequestKind, Sequencer};
use crate::{Address, AddressMap, Cycle, Error, LineAddress};

/// Transitions per line included in a diagnostic dump.
const DUMP_HISTORY: usize = 24;

#[derive(Clone, Debug, Serialize)]
pub struct SystemStats {
    pub cycles: Cycle,
    pub l1: Vec<L1Stats>,
    pub l2: Vec<L2Stats>,
    pub directory: Vec<DirectoryStats>,
    pub dma: Vec<DmaStats>,
    pub channels: ChannelStats,
}

pub struct System {
    config: SystemConfiguration,
    map: AddressMap,
    network: Network,
    l1s: Vec<L1Controller>,
    l2s: Vec<L2Controller>,
    directories: Vec<DirectoryController>,
    dmas: Vec<DmaController>,
    now: Cycle,
}

impl System {
    pub fn new(config: SystemConfiguration) -> Result<Self, Error> {
        config.validate()?;
        if config.virtual_networks > VirtualNetwork::ALL.len() {
            log::warn!(
                "{} virtual networks configured, only {} are used",
                config.virtual_networks,
                VirtualNetwork::ALL.len()
            );
        }
        let map = AddressMap::new(config.cacheline_size, config.num_l2caches, config.num_dirs);
        let channel = config.channel;
        let mut network = Network::new(config.seed);
        let num_dma = config.num_dma_controllers();

        for i in 0..config.num_cpus {
            for b in 0..config.num_l2caches {
                let (l1, l2) = (MachineId::l1(i), MachineId::l2(b));
                for vnet in VirtualNetwork::ALL.iter() {
                    network.connect(l1, l2, *vnet, false, &channel)?;
                }
                for vnet in [VirtualNetwork::Response, VirtualNetwork::Unblock].iter() {
                    network.connect(l2, l1, *vnet, false, &channel)?;
                }
            }
        }
        for b in 0..config.num_l2caches {
            for d in 0..config.num_dirs {
                let (l2, dir) = (MachineId::l2(b), MachineId::directory(d));
                for vnet in VirtualNetwork::ALL.iter() {
                    network.connect(l2, dir, *vnet, false, &channel)?;
                }
                for vnet in [VirtualNetwork::Request, VirtualNetwork::Response].iter() {
                    network.connect(dir, l2, *vnet, false, &channel)?;
                }
            }
        }
        for k in 0..num_dma {
            for d in 0..config.num_dirs {
                let (dma, dir) = (MachineId::dma(k), MachineId::directory(d));
                network.connect(dma, dir, VirtualNetwork::Request, false, &channel)?;
                network.connect(dir, dma, VirtualNetwork::Response, true, &channel)?;
            }
        }

        let l1s = (0..config.num_cpus)
            .map(|i| L1Controller::new(i, &config.l1, map))
            .collect::<Result<Vec<_>, _>>()?;
        let l2s = (0..config.num_l2caches)
            .map(|b| L2Controller::new(b, &config.l2, map, config.num_cpus))
            .collect::<Result<Vec<_>, _>>()?;
        let directories = (0..config.num_dirs)
            .map(|d| {
                let memory = SimpleMemory::new(config.directory.memory_latency, map.block_bytes());
                DirectoryController::new(d, &config.directory, map, config.num_l2caches, Box::new(memory))
            })
            .collect();
        let dmas = (0..num_dma)
            .map(|k| DmaController::new(k, &config.dma, map))
            .collect();

        log::info!(
            "system: {} L1s, {} L2 banks, {} directories, {} DMA controllers, {} channels",
            config.num_cpus,
            config.num_l2caches,
            config.num_dirs,
            num_dma,
            network.num_channels()
        );
        log::debug!("{}", network);

        Ok(Self {
            config,
            map,
            network,
            l1s,
            l2s,
            directories,
            dmas,
            now: 0,
        })
    }

    pub fn now(&self) -> Cycle {
        self.now
    }

    pub fn config(&self) -> &SystemConfiguration {
        &self.config
    }

    pub fn map(&self) -> &AddressMap {
        &self.map
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn l1s(&self) -> &[L1Controller] {
        &self.l1s
    }

    pub fn l2s(&self) -> &[L2Controller] {
        &self.l2s
    }

    pub fn directories(&self) -> &[DirectoryController] {
        &self.directories
    }

    pub fn dmas(&self) -> &[DmaController] {
        &self.dmas
    }

    pub fn sequencer_mut(&mut self, cpu: usize) -> Result<&mut Sequencer, Error> {
        self.l1s
            .get_mut(cpu)
            .map(|l1| l1.sequencer_mut())
            .ok_or(Error::UnknownSequencer(cpu))
    }

    pub fn issue(&mut self, cpu: usize, addr: Address, kind: RequestKind) -> Result<RequestId, Error> {
        let now = self.now;
        self.l1s
            .get_mut(cpu)
            .ok_or(Error::UnknownSequencer(cpu))?
            .issue(addr, kind, now)
    }

    pub fn issue_dma(&mut self, port: usize, addr: Address, kind: DmaKind) -> Result<RequestId, Error> {
        let now = self.now;
        let dma = self
            .dmas
            .get_mut(port)
            .ok_or(Error::UnknownSequencer(port))?;
        match kind {
            DmaKind::Read(len) => dma.issue_read(addr, len, now),
            DmaKind::Write(data) => dma.issue_write(addr, data, now),
        }
    }

    /// Completions of every core since the last call, tagged with the core.
    pub fn drain_completions(&mut self) -> Vec<(usize, Completion)> {
        self.l1s
            .iter_mut()
            .enumerate()
            .flat_map(|(i, l1)| {
                l1.sequencer_mut()
                    .drain_completions()
                    .into_iter()
                    .map(move |c| (i, c))
            })
            .collect()
    }

    pub fn drain_dma_completions(&mut self) -> Vec<(usize, DmaCompletion)> {
        self.dmas
            .iter_mut()
            .enumerate()
            .flat_map(|(k, dma)| {
                dma.sequencer_mut()
                    .drain_completions()
                    .into_iter()
                    .map(move |c| (k, c))
            })
            .collect()
    }

    /// Ticks every controller once, then checks the deadlock watchdogs.
    pub fn step(&mut self) -> Result<(), Error> {
        let now = self.now;
        if let Err(e) = self.wakeup_all(now) {
            return Err(self.annotate(e));
        }
        self.watchdog(now)?;
        self.now += 1;
        Ok(())
    }

    fn wakeup_all(&mut self, now: Cycle) -> Result<(), Error> {
        let network = &mut self.network;
        for l1 in self.l1s.iter_mut() {
            l1.wakeup(now, network)?;
        }
        for l2 in self.l2s.iter_mut() {
            l2.wakeup(now, network)?;
        }
        for dir in self.directories.iter_mut() {
            dir.wakeup(now, network)?;
        }
        for dma in self.dmas.iter_mut() {
            dma.wakeup(now, network)?;
        }
        Ok(())
    }

    pub fn run(&mut self, cycles: Cycle) -> Result<(), Error> {
        for _ in 0..cycles {
            self.step()?;
        }
        Ok(())
    }

    /// Steps until nothing is in flight. Returns the number of cycles run.
    pub fn run_until_quiescent(&mut self, max_cycles: Cycle) -> Result<Cycle, Error> {
        let start = self.now;
        while !self.is_quiescent() {
            if self.now - start >= max_cycles {
                return Err(self.deadlock(format!("not quiescent after {} cycles", max_cycles)));
            }
            self.step()?;
        }
        log::info!("quiescent at cycle {} after {} cycles", self.now, self.now - start);
        Ok(self.now - start)
    }

    pub fn is_quiescent(&self) -> bool {
        self.network.is_idle() && self.controllers().iter().all(|c| c.is_quiescent())
    }

    fn controllers(&self) -> Vec<&dyn Controller> {
        self.l1s
            .iter()
            .map(|c| c as &dyn Controller)
            .chain(self.l2s.iter().map(|c| c as &dyn Controller))
            .chain(self.directories.iter().map(|c| c as &dyn Controller))
            .chain(self.dmas.iter().map(|c| c as &dyn Controller))
            .collect()
    }

    fn watchdog(&self, now: Cycle) -> Result<(), Error> {
        for l1 in self.l1s.iter() {
            if let Some(request) = l1.sequencer().stuck_request(now) {
                let line = self.map.line(request.addr);
                let reason = format!(
                    "{:?} of {} outstanding since cycle {}",
                    request.kind, request.addr, request.issued
                );
                return Err(self.deadlock_at(l1.id(), line, reason));
            }
        }
        for dma in self.dmas.iter() {
            if dma.sequencer().is_stuck(now) {
                if let Some(line) = dma.sequencer().current_line() {
                    let reason = format!("transfer stuck in {}", dma.state());
                    return Err(self.deadlock_at(dma.id(), line, reason));
                }
            }
        }
        Ok(())
    }

    fn deadlock_at(&self, controller: MachineId, line: LineAddress, reason: String) -> Error {
        log::error!("{}: {} on line {}", controller, reason, line);
        Error::Deadlock(Box::new(Violation::new(controller, line, reason))).with_dump(self.dump_line(line))
    }

    /// Blames the oldest outstanding request, if there is one.
    fn deadlock(&self, reason: String) -> Error {
        let oldest = self
            .l1s
            .iter()
            .filter_map(|l1| l1.sequencer().oldest().map(|r| (l1.id(), r)))
            .min_by_key(|(_, r)| r.issued)
            .map(|(id, r)| (id, self.map.line(r.addr)));
        let dma = || {
            self.dmas
                .iter()
                .find_map(|d| d.sequencer().current_line().map(|line| (d.id(), line)))
        };
        let (controller, line) = match oldest.or_else(dma) {
            Some(blame) => blame,
            None => {
                let controller = self
                    .controllers()
                    .into_iter()
                    .find(|c| !c.is_quiescent())
                    .map(|c| c.id())
                    .unwrap_or_else(|| MachineId::l1(0));
                (controller, self.map.line(Address(0)))
            }
        };
        self.deadlock_at(controller, line, reason)
    }

    fn annotate(&self, e: Error) -> Error {
        match e.details().map(|v| v.addr) {
            Some(line) => {
                let dump = self.dump_line(line);
                e.with_dump(dump)
            }
            None => e,
        }
    }

    /// Everything known about `line`: the state at every controller, the
    /// messages in flight and the most recent transitions.
    pub fn dump_line(&self, line: LineAddress) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "line {} at cycle {}:", line, self.now);
        for c in self.controllers() {
            let _ = writeln!(out, "  {}: {}", c.id(), c.describe_line(line));
        }
        let messages = self.network.messages_for(line);
        if !messages.is_empty() {
            let _ = writeln!(out, "  in flight:\n{}", format_messages(&messages));
        }
        let history = self
            .controllers()
            .into_iter()
            .flat_map(|c| c.history().for_line(line).map(move |t| (c.id(), t)))
            .sorted_by_key(|(_, t)| t.cycle)
            .collect::<Vec<_>>();
        let skip = history.len().saturating_sub(DUMP_HISTORY);
        let _ = writeln!(out, "  recent transitions:");
        for (id, t) in history.into_iter().skip(skip) {
            let _ = writeln!(out, "    {} {}", id, t);
        }
        out
    }

    /// Checks the coherence invariants across all controllers:
    /// at most one L1 holds a line exclusively and then nobody shares it,
    /// the L2 tracks every L1 copy, owner and sharers never coexist, and
    /// the home directory knows every idle L2 line.
    pub fn check_invariants(&self) -> Result<(), Error> {
        let mut copies: HashMap<LineAddress, (Vec<usize>, Vec<usize>)> = HashMap::new();
        for (i, l1) in self.l1s.iter().enumerate() {
            for (line, state) in l1.lines() {
                let bank = &self.l2s[self.map.l2_bank(line)];
                let tracked = bank.entry(line);
                match state {
                    L1State::E | L1State::M => {
                        copies.entry(line).or_default().0.push(i);
                        if tracked.and_then(|e| e.owner()) != Some(i) {
                            return Err(self.broken(
                                l1.id(),
                                line,
                                format!("{} but the L2 does not list it as owner", state),
                            ));
                        }
                    }
                    L1State::S | L1State::SM => {
                        copies.entry(line).or_default().1.push(i);
                        if !tracked.map(|e| e.is_holder(i)).unwrap_or(false) {
                            return Err(self.broken(
                                l1.id(),
                                line,
                                format!("{} but the L2 does not track it", state),
                            ));
                        }
                    }
                    _ => {}
                }
            }
        }
        for (line, (writers, readers)) in copies.iter() {
            if writers.len() > 1 || (writers.len() == 1 && !readers.is_empty()) {
                return Err(self.broken(
                    MachineId::l1(writers[0]),
                    *line,
                    format!("writers {:?} with readers {:?}", writers, readers),
                ));
            }
        }
        for l2 in self.l2s.iter() {
            for (line, entry) in l2.lines() {
                if !entry.is_consistent() {
                    return Err(self.broken(l2.id(), line, format!("inconsistent entry {}", entry)));
                }
                if l2.is_busy(line) {
                    continue;
                }
                let dir = &self.directories[self.map.home_directory(line)];
                if dir.entry(line).and_then(|e| e.owner()) != Some(l2.id().index) {
                    return Err(self.broken(
                        l2.id(),
                        line,
                        "resident line unknown to its home directory".into(),
                    ));
                }
            }
        }
        for dir in self.directories.iter() {
            for (line, entry) in dir.entries() {
                if !entry.is_consistent() {
                    return Err(self.broken(dir.id(), *line, format!("inconsistent entry {}", entry)));
                }
            }
        }
        Ok(())
    }

    fn broken(&self, controller: MachineId, line: LineAddress, reason: String) -> Error {
        log::error!("{}: invariant broken on line {}: {}", controller, line, reason);
        Error::violation(controller, line, reason).with_dump(self.dump_line(line))
    }

    /// The current value of the word at `addr`: from an exclusive L1 copy,
    /// else the L2, else memory. Exact once the system is quiescent.
    pub fn memory_word(&self, addr: Address) -> u64 {
        let line = self.map.line(addr);
        let exclusive = self
            .l1s
            .iter()
            .filter(|l1| l1.state(line).is_exclusive())
            .find_map(|l1| l1.peek_word(addr));
        if let Some(value) = exclusive {
            return value;
        }
        if let Some(value) = self.l2s[self.map.l2_bank(line)].peek_word(addr) {
            return value;
        }
        self.directories[self.map.home_directory(line)]
            .memory()
            .peek_block(line)
            .read_word(self.map.offset(addr))
    }

    pub fn stats(&self) -> SystemStats {
        SystemStats {
            cycles: self.now,
            l1: self.l1s.iter().map(|c| *c.stats()).collect(),
            l2: self.l2s.iter().map(|c| *c.stats()).collect(),
            directory: self.directories.iter().map(|c| *c.stats()).collect(),
            dma: self.dmas.iter().map(|c| *c.stats()).collect(),
            channels: self.network.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(num_cpus: usize, num_dma_ports: usize) -> SystemConfiguration {
        SystemConfiguration {
            num_cpus,
            num_dma_ports,
            ..Default::default()
        }
    }

    #[test]
    fn builds_every_channel() {
        let system = System::new(config(2, 1)).unwrap();
        // L1<->L2: 2 * 5, L2<->Dir: 5, DMA<->Dir: 2
        assert_eq!(system.network().num_channels(), 17);
        let dma_response = system
            .network()
            .channel(MachineId::directory(0), MachineId::dma(0), VirtualNetwork::Response)
            .unwrap();
        assert!(dma_response.is_ordered());
        assert!(system.is_quiescent());

        let full = SystemConfiguration {
            full_system: true,
            ..config(1, 1)
        };
        assert_eq!(System::new(full).unwrap().dmas().len(), 2);

        // extra virtual networks add no channels
        let wide = SystemConfiguration {
            virtual_networks: 4,
            ..config(2, 1)
        };
        assert_eq!(System::new(wide).unwrap().network().num_channels(), 17);
    }

    #[test]
    fn rejects_bad_configurations() {
        let bad = SystemConfiguration {
            num_l2caches: 3,
            ..config(1, 0)
        };
        assert!(matches!(System::new(bad), Err(Error::InvalidConfiguration(_))));
        let mut system = System::new(config(1, 0)).unwrap();
        assert_eq!(
            system.issue(1, Address(0), RequestKind::Load).unwrap_err(),
            Error::UnknownSequencer(1)
        );
        assert_eq!(
            system.issue_dma(0, Address(0), DmaKind::Read(8)).unwrap_err(),
            Error::UnknownSequencer(0)
        );
    }

    #[test]
    fn store_is_visible_to_another_core() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let mut system = System::new(config(2, 0)).unwrap();
        system.issue(0, Address(0x100), RequestKind::Store(9)).unwrap();
        system.run_until_quiescent(1000).unwrap();
        system.check_invariants().unwrap();
        system.issue(1, Address(0x100), RequestKind::Load).unwrap();
        system.run_until_quiescent(1000).unwrap();
        system.check_invariants().unwrap();

        let done = system.drain_completions();
        assert_eq!(done.len(), 2);
        assert_eq!(done[1].0, 1);
        assert_eq!(done[1].1.value, 9);
        assert_eq!(system.memory_word(Address(0x100)), 9);
        let line = system.map().line(Address(0x100));
        assert_eq!(system.l1s()[0].state(line), L1State::S);
        assert_eq!(system.l1s()[1].state(line), L1State::S);
    }

    #[test]
    fn deadlock_reports_the_stuck_request() {
        let mut cfg = config(1, 0);
        cfg.l1.deadlock_threshold = 5;
        cfg.directory.memory_latency = 50;
        let mut system = System::new(cfg).unwrap();
        system.issue(0, Address(0x40), RequestKind::Load).unwrap();
        let e = system.run(20).unwrap_err();
        match &e {
            Error::Deadlock(v) => {
                assert_eq!(v.controller, MachineId::l1(0));
                assert_eq!(v.addr, system.map().line(Address(0x40)));
                assert!(v.dump.contains("in flight") || v.dump.contains("IS"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
