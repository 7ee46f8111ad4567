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

use crate::LineAddress;

/// Requests parked on a busy line.
///
/// `wake` moves everything parked on a line to the ready queue, in arrival
/// order; controllers drain the ready queue before they look at new
/// requests. Items that could not be started for lack of resources are
/// `defer`red to the front of the ready queue.
pub struct StallTable<T> {
    stalled: HashMap<LineAddress, VecDeque<T>>,
    ready: VecDeque<T>,
}

impl<T> StallTable<T> {
    pub fn new() -> Self {
        Self {
            stalled: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn stall(&mut self, line: LineAddress, item: T) {
        self.stalled.entry(line).or_default().push_back(item);
    }

    pub fn wake(&mut self, line: LineAddress) {
        if let Some(items) = self.stalled.remove(&line) {
            self.ready.extend(items);
        }
    }

    pub fn defer(&mut self, item: T) {
        self.ready.push_front(item);
    }

    pub fn pop_ready(&mut self) -> Option<T> {
        self.ready.pop_front()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn is_stalled(&self, line: LineAddress) -> bool {
        self.stalled.contains_key(&line)
    }

    pub fn stalled_on(&self, line: LineAddress) -> impl Iterator<Item = &T> {
        self.stalled.get(&line).into_iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.ready.len() + self.stalled.values().map(|q| q.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
