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

pub mod directory;
pub mod dma;
pub mod l1;
pub mod l2;

use std::collections::VecDeque;
use std::fmt;

use crate::message::MachineId;
use crate::network::Network;
use crate::{Cycle, Error, LineAddress};

/// Behavior shared by every coherence controller.
pub trait Controller {
    fn id(&self) -> MachineId;

    /// Runs one cycle: consumes deliverable messages and local requests, up
    /// to the per-cycle transition limit.
    fn wakeup(&mut self, now: Cycle, network: &mut Network) -> Result<(), Error>;

    /// No transaction is open and nothing is parked.
    fn is_quiescent(&self) -> bool;

    /// Human readable state of `line`, for diagnostics.
    fn describe_line(&self, line: LineAddress) -> String;

    fn history(&self) -> &TransitionLog;
}

#[derive(Clone, Debug)]
pub struct Transition {
    pub cycle: Cycle,
    pub line: LineAddress,
    pub event: String,
    pub from: String,
    pub to: String,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}: {} -> {}",
            self.cycle, self.line, self.event, self.from, self.to
        )
    }
}

const HISTORY_DEPTH: usize = 64;

/// The most recent transitions of one controller.
pub struct TransitionLog {
    owner: MachineId,
    entries: VecDeque<Transition>,
}

impl TransitionLog {
    pub fn new(owner: MachineId) -> Self {
        Self {
            owner,
            entries: VecDeque::with_capacity(HISTORY_DEPTH),
        }
    }

    pub fn record(
        &mut self,
        cycle: Cycle,
        line: LineAddress,
        event: impl fmt::Debug,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) {
        let transition = Transition {
            cycle,
            line,
            event: format!("{:?}", event),
            from: from.to_string(),
            to: to.to_string(),
        };
        log::debug!("{} {}", self.owner, transition);
        if self.entries.len() == HISTORY_DEPTH {
            self.entries.pop_front();
        }
        self.entries.push_back(transition);
    }

    pub fn for_line(&self, line: LineAddress) -> impl Iterator<Item = &Transition> {
        self.entries.iter().filter(move |t| t.line == line)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        self.entries.iter()
    }
}
