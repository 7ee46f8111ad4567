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

//! DMA transfers over lines a core holds exclusively.

use coherence::{Address, Controller, DmaKind, L1State, RequestKind, System, SystemConfiguration};

use crate::shared_line::{stable_path, MAX_CYCLES, SHARED};

pub struct DmaOutcome {
    /// Stable states of the core's L1.
    pub path: Vec<String>,
    /// Events the L1 handled for the line.
    pub events: Vec<String>,
    pub dma_data: Vec<u8>,
    pub directory_recalls: usize,
    /// Whether the L2 and the home directory still track the line.
    pub l2_resident: bool,
    pub directory_owner: Option<usize>,
    pub memory_word: u64,
    pub system: System,
}

fn system_with_dirty_line(value: u64) -> anyhow::Result<System> {
    let config = SystemConfiguration {
        num_cpus: 2,
        num_dma_ports: 1,
        ..Default::default()
    };
    let mut system = System::new(config)?;
    system.issue(0, SHARED, RequestKind::Store(value))?;
    system.run_until_quiescent(MAX_CYCLES)?;
    system.drain_completions();
    Ok(system)
}

fn outcome(mut system: System) -> anyhow::Result<DmaOutcome> {
    system.run_until_quiescent(MAX_CYCLES)?;
    system.check_invariants()?;
    let line = system.map().line(SHARED);
    let home = system.map().home_directory(line);
    let dma_data = system
        .drain_dma_completions()
        .into_iter()
        .flat_map(|(_, c)| c.data)
        .collect();
    let l1 = &system.l1s()[0];
    Ok(DmaOutcome {
        path: stable_path(l1, line),
        events: l1.history().for_line(line).map(|t| t.event.clone()).collect(),
        dma_data,
        directory_recalls: system.directories()[home].stats().recalls,
        l2_resident: system.l2s()[system.map().l2_bank(line)].entry(line).is_some(),
        directory_owner: system.directories()[home].entry(line).and_then(|e| e.owner()),
        memory_word: system.directories()[home]
            .memory()
            .peek_block(line)
            .read_word(system.map().offset(SHARED)),
        system,
    })
}

/// A DMA write over a modified line.
pub fn run_dma_write() -> anyhow::Result<DmaOutcome> {
    let mut system = system_with_dirty_line(0x11)?;
    system.issue_dma(0, SHARED, DmaKind::Write(0x99u64.to_le_bytes().to_vec()))?;
    outcome(system)
}

/// A DMA read of a modified line, one word past it included.
pub fn run_dma_read() -> anyhow::Result<DmaOutcome> {
    let mut system = system_with_dirty_line(0x55)?;
    system.issue_dma(0, SHARED, DmaKind::Read(16))?;
    outcome(system)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dma_write_recalls_the_owner() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let mut outcome = run_dma_write().unwrap();
        assert_eq!(outcome.path, vec!["I", "M", "I"]);
        assert!(outcome.events.iter().any(|e| e == "RecallInv"));
        assert_eq!(outcome.directory_recalls, 1);
        assert!(!outcome.l2_resident);
        assert_eq!(outcome.directory_owner, None);
        assert_eq!(outcome.memory_word, 0x99);
        assert!(outcome.dma_data.is_empty());

        // the core's next access is a clean miss that sees the DMA data
        let system = &mut outcome.system;
        let misses = system.l1s()[0].stats().misses;
        system.issue(0, SHARED, RequestKind::Load).unwrap();
        system.run_until_quiescent(MAX_CYCLES).unwrap();
        let done = system.drain_completions();
        assert_eq!(done[0].1.value, 0x99);
        assert_eq!(system.l1s()[0].stats().misses, misses + 1);
        let line = system.map().line(SHARED);
        assert_eq!(system.l1s()[0].state(line), L1State::E);
    }

    #[test]
    fn dma_read_flushes_the_owner() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let outcome = run_dma_read().unwrap();
        assert_eq!(outcome.path, vec!["I", "M", "S"]);
        assert!(outcome.events.iter().any(|e| e == "RecallDowngrade"));
        let mut expected = 0x55u64.to_le_bytes().to_vec();
        expected.extend_from_slice(&[0; 8]);
        assert_eq!(outcome.dma_data, expected);
        assert!(outcome.l2_resident);
        assert_eq!(outcome.directory_owner, Some(0));
        assert_eq!(outcome.memory_word, 0x55);
        assert_eq!(outcome.system.memory_word(Address(SHARED.0 + 8)), 0);
    }
}
