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

//! Seeded random request streams and a checker for the values they observe.

use anyhow::bail;
use itertools::Itertools;
use rand::Rng;
use rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256StarStar;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::address::WORD_BYTES;
use crate::sequencer::{Completion, DmaKind, RequestId, RequestKind};
use crate::system::System;
use crate::{Address, Cycle};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct TrafficConfiguration {
    /// Requests issued by every core.
    pub requests_per_core: usize,
    /// Distinct lines touched, starting at address 0.
    pub lines: usize,
    /// Words used within each line.
    pub words_per_line: usize,
    pub store_percent: u32,
    pub ifetch_percent: u32,
    /// Outstanding requests per core.
    pub max_in_flight: usize,
    /// Single word DMA transfers, spread over the DMA controllers.
    pub dma_transfers: usize,
    /// Check the coherence invariants after every cycle.
    pub check_invariants: bool,
}

impl Default for TrafficConfiguration {
    fn default() -> Self {
        Self {
            requests_per_core: 1000,
            lines: 64,
            words_per_line: 4,
            store_percent: 40,
            ifetch_percent: 5,
            max_in_flight: 4,
            dma_transfers: 0,
            check_invariants: false,
        }
    }
}

/// Issues random loads, stores and instruction fetches from every core,
/// plus optional DMA traffic, and logs what they observe.
///
/// Store values are unique so that every read can be traced back to the
/// write that produced it.
pub struct RandomTraffic {
    config: TrafficConfiguration,
    rng: Xoshiro256StarStar,
    issued: Vec<usize>,
    in_flight: Vec<usize>,
    next_value: u64,
    dma_issued: usize,
    dma_pending: HashMap<(usize, RequestId), (Address, Option<u64>)>,
    written: HashMap<Address, HashSet<u64>>,
    log: Vec<(usize, Completion)>,
}

impl RandomTraffic {
    pub fn new(config: TrafficConfiguration, seed: u64) -> Self {
        Self {
            config,
            rng: Xoshiro256StarStar::seed_from_u64(seed),
            issued: Vec::new(),
            in_flight: Vec::new(),
            next_value: 0,
            dma_issued: 0,
            dma_pending: HashMap::new(),
            written: HashMap::new(),
            log: Vec::new(),
        }
    }

    /// Completions so far, tagged by source: cores first, then DMA
    /// controllers numbered after the last core. DMA reads are not logged.
    pub fn log(&self) -> &[(usize, Completion)] {
        &self.log
    }

    pub fn is_done(&self) -> bool {
        self.issued.iter().all(|n| *n == self.config.requests_per_core)
            && self.in_flight.iter().all(|n| *n == 0)
            && self.dma_issued == self.config.dma_transfers
            && self.dma_pending.is_empty()
    }

    fn random_address(&mut self, system: &System) -> Address {
        let block_bytes = system.map().block_bytes();
        let words = self.config.words_per_line.clamp(1, block_bytes / WORD_BYTES);
        let line = self.rng.gen_range(0..self.config.lines.max(1));
        let word = self.rng.gen_range(0..words);
        Address((line * block_bytes + word * WORD_BYTES) as u64)
    }

    fn unique_value(&mut self, addr: Address) -> u64 {
        self.next_value += 1;
        self.written.entry(addr).or_default().insert(self.next_value);
        self.next_value
    }

    /// Issues at most one new request per core and DMA controller.
    pub fn issue(&mut self, system: &mut System) -> anyhow::Result<()> {
        let num_cpus = system.l1s().len();
        if self.issued.len() != num_cpus {
            self.issued.resize(num_cpus, 0);
            self.in_flight.resize(num_cpus, 0);
        }
        for cpu in 0..num_cpus {
            if self.issued[cpu] == self.config.requests_per_core
                || self.in_flight[cpu] >= self.config.max_in_flight
            {
                continue;
            }
            let addr = self.random_address(system);
            let roll = self.rng.gen_range(0..100);
            let kind = if roll < self.config.store_percent {
                RequestKind::Store(self.unique_value(addr))
            } else if roll < self.config.store_percent + self.config.ifetch_percent {
                RequestKind::IFetch
            } else {
                RequestKind::Load
            };
            system.issue(cpu, addr, kind)?;
            self.issued[cpu] += 1;
            self.in_flight[cpu] += 1;
        }
        for port in 0..system.dmas().len() {
            if self.dma_issued == self.config.dma_transfers
                || self.dma_pending.keys().any(|(p, _)| *p == port)
                || !self.rng.gen_bool(0.1)
            {
                continue;
            }
            let addr = self.random_address(system);
            let (kind, value) = if self.rng.gen_bool(0.5) {
                let value = self.unique_value(addr);
                (DmaKind::Write(value.to_le_bytes().to_vec()), Some(value))
            } else {
                (DmaKind::Read(WORD_BYTES), None)
            };
            let id = system.issue_dma(port, addr, kind)?;
            self.dma_pending.insert((port, id), (addr, value));
            self.dma_issued += 1;
        }
        Ok(())
    }

    /// Moves completions from the system into the log.
    pub fn collect(&mut self, system: &mut System) -> anyhow::Result<()> {
        for (cpu, completion) in system.drain_completions() {
            self.in_flight[cpu] -= 1;
            self.log.push((cpu, completion));
        }
        let num_cpus = system.l1s().len();
        for (port, done) in system.drain_dma_completions() {
            let (addr, value) = match self.dma_pending.remove(&(port, done.id)) {
                Some(pending) => pending,
                None => bail!("DMA {} completed unknown transfer {}", port, done.id),
            };
            match value {
                Some(value) => self.log.push((
                    num_cpus + port,
                    Completion {
                        id: done.id,
                        addr,
                        kind: RequestKind::Store(value),
                        value,
                        issued: done.issued,
                        completed: done.completed,
                    },
                )),
                None => {
                    let mut word = [0u8; WORD_BYTES];
                    word.copy_from_slice(&done.data[..WORD_BYTES]);
                    let read = u64::from_le_bytes(word);
                    let known = read == 0
                        || self
                            .written
                            .get(&addr)
                            .map(|values| values.contains(&read))
                            .unwrap_or(false);
                    if !known {
                        bail!("DMA {} read {:#x} from {}, which was never written", port, read, addr);
                    }
                }
            }
        }
        Ok(())
    }

    /// Drives the system until every request has completed and the system
    /// is quiescent. Returns the cycles taken.
    pub fn run(&mut self, system: &mut System, max_cycles: Cycle) -> anyhow::Result<Cycle> {
        let start = system.now();
        loop {
            self.issue(system)?;
            if self.is_done() && system.is_quiescent() {
                break;
            }
            if system.now() - start >= max_cycles {
                bail!(
                    "traffic unfinished after {} cycles: {} requests and {} DMA transfers outstanding",
                    max_cycles,
                    self.in_flight.iter().sum::<usize>(),
                    self.dma_pending.len()
                );
            }
            system.step()?;
            self.collect(system)?;
            if self.config.check_invariants {
                system.check_invariants()?;
            }
        }
        log::info!(
            "traffic: {} completions in {} cycles",
            self.log.len(),
            system.now() - start
        );
        Ok(system.now() - start)
    }
}

/// Replays a completion log in completion order and checks that every read
/// returns the most recent write to its word. Memory starts out zero.
pub fn verify_completions(log: &[(usize, Completion)]) -> anyhow::Result<()> {
    let mut memory: HashMap<Address, (u64, usize)> = HashMap::new();
    for (source, c) in log.iter().sorted_by_key(|(_, c)| c.completed) {
        match c.kind {
            RequestKind::Store(value) => {
                if c.value != value {
                    bail!("{} stored {:#x} but reported {:#x}", source, value, c.value);
                }
                memory.insert(c.addr, (value, *source));
            }
            RequestKind::Load | RequestKind::IFetch => {
                let (expected, writer) = memory.get(&c.addr).copied().unwrap_or((0, usize::MAX));
                if c.value != expected {
                    bail!(
                        "{} read {:#x} from {} at cycle {}, but the last write was {:#x} by {}",
                        source,
                        c.value,
                        c.addr,
                        c.completed,
                        expected,
                        writer
                    );
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(kind: RequestKind, value: u64, completed: Cycle) -> Completion {
        Completion {
            id: 0,
            addr: Address(8),
            kind,
            value,
            issued: 0,
            completed,
        }
    }

    #[test]
    fn replay_follows_completion_order() {
        let log = vec![
            (1, completion(RequestKind::Load, 7, 12)),
            (0, completion(RequestKind::Load, 0, 3)),
            (0, completion(RequestKind::Store(7), 7, 10)),
        ];
        verify_completions(&log).unwrap();
    }

    #[test]
    fn stale_read_is_reported() {
        let log = vec![
            (0, completion(RequestKind::Store(7), 7, 10)),
            (0, completion(RequestKind::Store(8), 8, 11)),
            (1, completion(RequestKind::Load, 7, 12)),
        ];
        let e = verify_completions(&log).unwrap_err();
        assert!(e.to_string().contains("last write was 0x8"));
    }

    #[test]
    fn same_seed_same_stream() {
        let config = TrafficConfiguration {
            requests_per_core: 50,
            ..Default::default()
        };
        let mut a = RandomTraffic::new(config.clone(), 3);
        let mut b = RandomTraffic::new(config, 3);
        let system = System::new(Default::default()).unwrap();
        let xs: Vec<Address> = (0..20).map(|_| a.random_address(&system)).collect();
        let ys: Vec<Address> = (0..20).map(|_| b.random_address(&system)).collect();
        assert_eq!(xs, ys);
        assert!(xs.iter().all(|addr| addr.0 % WORD_BYTES as u64 == 0));
    }
}
