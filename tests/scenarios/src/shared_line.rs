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

//! Cores taking turns on one line.

use coherence::{Address, Controller, L1Controller, L1State, LineAddress, RequestKind, System};
use coherence::SystemConfiguration;

pub const SHARED: Address = Address(0x1000);
pub const MAX_CYCLES: usize = 10_000;

/// The L2's view of a line: owner and sharers.
pub type Holders = (Option<usize>, Vec<usize>);

pub struct Trace {
    /// Before the first step and after every step.
    pub holders: Vec<Holders>,
    /// Stable states of every L1, transient states left out.
    pub paths: Vec<Vec<String>>,
    /// The word returned by each step.
    pub values: Vec<u64>,
}

pub fn holders(system: &System, line: LineAddress) -> Holders {
    system.l2s()[system.map().l2_bank(line)]
        .entry(line)
        .map(|e| (e.owner(), e.sharers().iter().collect()))
        .unwrap_or((None, vec![]))
}

pub fn stable_path(l1: &L1Controller, line: LineAddress) -> Vec<String> {
    let mut path = vec![L1State::I.to_string()];
    for t in l1.history().for_line(line) {
        let stable = matches!(t.to.as_str(), "I" | "S" | "E" | "M");
        if stable && path.last() != Some(&t.to) {
            path.push(t.to.clone());
        }
    }
    path
}

/// Runs each (core, request) on `SHARED` to quiescence, one after the other,
/// on a three core system.
pub fn run_steps(steps: &[(usize, RequestKind)]) -> anyhow::Result<Trace> {
    let config = SystemConfiguration {
        num_cpus: 3,
        ..Default::default()
    };
    let mut system = System::new(config)?;
    let line = system.map().line(SHARED);
    let mut trace = Trace {
        holders: vec![holders(&system, line)],
        paths: vec![],
        values: vec![],
    };
    for (cpu, kind) in steps.iter() {
        system.issue(*cpu, SHARED, *kind)?;
        system.run_until_quiescent(MAX_CYCLES)?;
        system.check_invariants()?;
        trace.holders.push(holders(&system, line));
        trace
            .values
            .extend(system.drain_completions().into_iter().map(|(_, c)| c.value));
    }
    trace.paths = system.l1s().iter().map(|l1| stable_path(l1, line)).collect();
    Ok(trace)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(states: &[&str]) -> Vec<String> {
        states.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn reader_invalidated_by_writer() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let trace = run_steps(&[(1, RequestKind::IFetch), (2, RequestKind::Store(0x2a))]).unwrap();
        assert_eq!(
            trace.holders,
            vec![(None, vec![]), (None, vec![1]), (Some(2), vec![])]
        );
        assert_eq!(trace.paths[0], path(&["I"]));
        assert_eq!(trace.paths[1], path(&["I", "S", "I"]));
        assert_eq!(trace.paths[2], path(&["I", "M"]));
        assert_eq!(trace.values, vec![0, 0x2a]);
    }

    #[test]
    fn readers_then_upgrade() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let trace = run_steps(&[
            (1, RequestKind::Load),
            (2, RequestKind::Load),
            (2, RequestKind::Store(7)),
            (1, RequestKind::Load),
        ])
        .unwrap();
        assert_eq!(
            trace.holders,
            vec![
                (None, vec![]),
                (Some(1), vec![]),
                (None, vec![1, 2]),
                (Some(2), vec![]),
                (None, vec![1, 2]),
            ]
        );
        assert_eq!(trace.paths[1], path(&["I", "E", "S", "I", "S"]));
        assert_eq!(trace.paths[2], path(&["I", "S", "M", "S"]));
        assert_eq!(trace.values, vec![0, 0, 7, 7]);
    }
}
