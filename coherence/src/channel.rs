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

use rand::Rng;
use rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256StarStar;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};

use crate::config::ChannelConfiguration;
use crate::message::Message;
use crate::{Cycle, Error};

struct InFlight {
    ready: Cycle,
    msg: Message,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ChannelStats {
    pub sent: usize,
    pub received: usize,
    /// Sends rejected because the channel was at capacity.
    pub full: usize,
    pub max_occupancy: usize,
}

/// A bounded, point-to-point message queue with delivery latency.
///
/// Messages become visible `latency` cycles after they are sent. Ordered
/// channels deliver strictly in send order. Unordered channels add up to
/// `jitter` cycles of random delay and may deliver messages for different
/// lines out of order, but never two messages for the same line.
pub struct MessageChannel {
    queue: VecDeque<InFlight>,
    capacity: usize,
    latency: Cycle,
    jitter: Cycle,
    ordered: bool,
    rng: Xoshiro256StarStar,
    stats: ChannelStats,
}

impl MessageChannel {
    pub fn new(config: &ChannelConfiguration, ordered: bool, seed: u64) -> Result<Self, Error> {
        if config.latency == 0 {
            return Err(Error::InvalidConfiguration(
                "channel latency must be at least one cycle".into(),
            ));
        }
        Ok(Self {
            queue: VecDeque::with_capacity(config.capacity),
            capacity: config.capacity,
            latency: config.latency,
            jitter: if ordered { 0 } else { config.jitter },
            ordered,
            rng: Xoshiro256StarStar::seed_from_u64(seed),
            stats: ChannelStats::default(),
        })
    }

    pub fn send(&mut self, msg: Message, now: Cycle) -> Result<(), Error> {
        if self.queue.len() >= self.capacity {
            self.stats.full += 1;
            return Err(Error::ChannelFull);
        }
        let mut ready = now + self.latency;
        if self.jitter > 0 {
            ready += self.rng.gen_range(0..=self.jitter);
        }
        if self.ordered {
            // never overtake the tail
            if let Some(tail) = self.queue.back() {
                ready = ready.max(tail.ready);
            }
        }
        self.queue.push_back(InFlight { ready, msg });
        self.stats.sent += 1;
        self.stats.max_occupancy = self.stats.max_occupancy.max(self.queue.len());
        Ok(())
    }

    /// Dequeues the next deliverable message, if any.
    pub fn receive(&mut self, now: Cycle) -> Option<Message> {
        let position = if self.ordered {
            match self.queue.front() {
                Some(head) if head.ready <= now => Some(0),
                _ => None,
            }
        } else {
            let mut blocked = HashSet::new();
            let mut found = None;
            for (i, entry) in self.queue.iter().enumerate() {
                if entry.ready <= now && !blocked.contains(&entry.msg.addr) {
                    found = Some(i);
                    break;
                }
                blocked.insert(entry.msg.addr);
            }
            found
        };
        let entry = self.queue.remove(position?)?;
        self.stats.received += 1;
        Some(entry.msg)
    }

    pub fn has_room(&self, slots: usize) -> bool {
        self.queue.len() + slots <= self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.queue.iter().map(|entry| &entry.msg)
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }
}
