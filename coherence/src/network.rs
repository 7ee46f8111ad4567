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

use itertools::Itertools;
use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::prelude::*;
use std::collections::HashMap;
use std::fmt;

use crate::channel::{ChannelStats, MessageChannel};
use crate::config::ChannelConfiguration;
use crate::message::{MachineId, Message, VirtualNetwork};
use crate::{Cycle, Error, LineAddress};

/// An edge of the topology graph: one channel on one virtual network.
pub struct Link {
    pub vnet: VirtualNetwork,
    pub channel: MessageChannel,
}

/// The topology: controllers are nodes, channels are edges.
///
/// There is exactly one channel per (source, destination, virtual network).
/// Receivers poll their inbound channels of a virtual network round robin.
pub struct Network {
    graph: Graph<MachineId, Link>,
    nodes: HashMap<MachineId, NodeIndex>,
    routes: HashMap<(MachineId, MachineId, VirtualNetwork), EdgeIndex>,
    inbound: HashMap<(MachineId, VirtualNetwork), Vec<EdgeIndex>>,
    outbound: HashMap<(MachineId, VirtualNetwork), Vec<EdgeIndex>>,
    cursors: HashMap<(MachineId, VirtualNetwork), usize>,
    seed: u64,
}

impl Network {
    pub fn new(seed: u64) -> Self {
        Self {
            graph: Graph::new(),
            nodes: HashMap::new(),
            routes: HashMap::new(),
            inbound: HashMap::new(),
            outbound: HashMap::new(),
            cursors: HashMap::new(),
            seed,
        }
    }

    pub fn add_node(&mut self, id: MachineId) -> NodeIndex {
        if let Some(node) = self.nodes.get(&id) {
            return *node;
        }
        let node = self.graph.add_node(id);
        self.nodes.insert(id, node);
        node
    }

    pub fn connect(
        &mut self,
        src: MachineId,
        dst: MachineId,
        vnet: VirtualNetwork,
        ordered: bool,
        config: &ChannelConfiguration,
    ) -> Result<EdgeIndex, Error> {
        if config.latency == 0 {
            return Err(Error::InvalidConfiguration(format!(
                "zero latency channel {} -> {}",
                src, dst
            )));
        }
        if self.routes.contains_key(&(src, dst, vnet)) {
            return Err(Error::InvalidConfiguration(format!(
                "duplicate channel {} -> {} on {:?}",
                src, dst, vnet
            )));
        }
        let from = self.add_node(src);
        let to = self.add_node(dst);
        // every channel gets its own jitter stream
        let seed = self
            .seed
            .wrapping_mul(0x9e37_79b9_7f4a_7c15)
            .wrapping_add(self.graph.edge_count() as u64);
        let edge = self.graph.add_edge(
            from,
            to,
            Link {
                vnet,
                channel: MessageChannel::new(config, ordered, seed)?,
            },
        );
        self.routes.insert((src, dst, vnet), edge);
        self.inbound.entry((dst, vnet)).or_default().push(edge);
        self.outbound.entry((src, vnet)).or_default().push(edge);
        log::trace!(
            "connect {} -> {} on {:?}{}",
            src,
            dst,
            vnet,
            if ordered { " (ordered)" } else { "" }
        );
        Ok(edge)
    }

    pub fn send(&mut self, msg: Message, now: Cycle) -> Result<(), Error> {
        let key = (msg.sender, msg.destination, msg.vnet);
        let edge = *self
            .routes
            .get(&key)
            .ok_or(Error::NoRoute(key.0, key.1, key.2))?;
        log::trace!("[{}] send {}", now, msg);
        self.graph[edge].channel.send(msg, now)
    }

    /// The next deliverable message for `dst` on `vnet`.
    pub fn receive(&mut self, dst: MachineId, vnet: VirtualNetwork, now: Cycle) -> Option<Message> {
        let edges = self.inbound.get(&(dst, vnet))?;
        let cursor = self.cursors.entry((dst, vnet)).or_insert(0);
        for i in 0..edges.len() {
            let k = (*cursor + i) % edges.len();
            if let Some(msg) = self.graph[edges[k]].channel.receive(now) {
                *cursor = (k + 1) % edges.len();
                log::trace!("[{}] recv {}", now, msg);
                return Some(msg);
            }
        }
        None
    }

    /// Whether every channel `src` sends on over `vnets` has at least
    /// `slots` free entries.
    pub fn can_send(&self, src: MachineId, vnets: &[VirtualNetwork], slots: usize) -> bool {
        vnets.iter().all(|vnet| {
            self.outbound
                .get(&(src, *vnet))
                .map(|edges| {
                    edges
                        .iter()
                        .all(|e| self.graph[*e].channel.has_room(slots))
                })
                .unwrap_or(true)
        })
    }

    pub fn channel(
        &self,
        src: MachineId,
        dst: MachineId,
        vnet: VirtualNetwork,
    ) -> Option<&MessageChannel> {
        self.routes
            .get(&(src, dst, vnet))
            .map(|edge| &self.graph[*edge].channel)
    }

    pub fn in_flight(&self) -> usize {
        self.graph
            .edge_indices()
            .map(|e| self.graph[e].channel.len())
            .sum()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }

    /// Every queued message for `line`.
    pub fn messages_for(&self, line: LineAddress) -> Vec<&Message> {
        self.graph
            .edge_indices()
            .flat_map(|e| self.graph[e].channel.iter())
            .filter(|msg| msg.addr == line)
            .collect()
    }

    /// Totals over every channel; `max_occupancy` is the largest seen.
    pub fn stats(&self) -> ChannelStats {
        self.graph
            .edge_indices()
            .map(|e| self.graph[e].channel.stats())
            .fold(ChannelStats::default(), |mut total, s| {
                total.sent += s.sent;
                total.received += s.received;
                total.full += s.full;
                total.max_occupancy = total.max_occupancy.max(s.max_occupancy);
                total
            })
    }

    pub fn num_channels(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &MachineId> {
        self.graph.node_weights()
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "{} controllers, {} channels",
            self.graph.node_count(),
            self.graph.edge_count()
        )?;
        for edge in self.graph.edge_references() {
            let link = edge.weight();
            writeln!(
                f,
                "  {} -> {} {:?}{} [{}/{}]",
                self.graph[edge.source()],
                self.graph[edge.target()],
                link.vnet,
                if link.channel.is_ordered() { " ordered" } else { "" },
                link.channel.len(),
                link.channel.capacity()
            )?;
        }
        Ok(())
    }
}

/// One line per message, for diagnostic dumps.
pub(crate) fn format_messages(messages: &[&Message]) -> String {
    messages.iter().map(|m| format!("    {}", m)).join("\n")
}
