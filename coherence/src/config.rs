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

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::address::WORD_BYTES;
use crate::{Cycle, Error};

/// Free slots a controller needs on every outbound channel before it takes
/// a transition. No transition sends more than this many messages on one
/// channel.
pub const CHANNEL_RESERVE: usize = 2;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CacheGeometry {
    /// in bytes
    pub size: usize,
    pub assoc: usize,
}

impl CacheGeometry {
    pub fn new(size: usize, assoc: usize) -> Self {
        Self { size, assoc }
    }

    pub fn num_sets(&self, block_bytes: usize) -> usize {
        self.size / (block_bytes * self.assoc)
    }

    pub fn validate(&self, block_bytes: usize) -> Result<(), Error> {
        if self.assoc == 0 {
            return Err(Error::InvalidGeometry("associativity must be at least 1".into()));
        }
        if self.size == 0 || self.size % (block_bytes * self.assoc) != 0 {
            return Err(Error::InvalidGeometry(format!(
                "size {} is not a multiple of {} byte lines x {} ways",
                self.size, block_bytes, self.assoc
            )));
        }
        let sets = self.num_sets(block_bytes);
        if !sets.is_power_of_two() {
            return Err(Error::InvalidGeometry(format!(
                "{} sets is not a power of two",
                sets
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct L1Configuration {
    pub icache: CacheGeometry,
    pub dcache: CacheGeometry,
    /// Report evictions and invalidations to the sequencer.
    pub send_evictions: bool,
    /// Next-line prefetch on demand data misses.
    pub enable_prefetch: bool,
    pub transitions_per_cycle: usize,
    /// Number of transaction buffers.
    pub max_outstanding: usize,
    /// Cycles a core request may stay outstanding before it is reported
    /// as a deadlock.
    pub deadlock_threshold: Cycle,
}

impl Default for L1Configuration {
    fn default() -> Self {
        Self {
            icache: CacheGeometry::new(32 * 1024, 2),
            dcache: CacheGeometry::new(64 * 1024, 2),
            send_evictions: false,
            enable_prefetch: false,
            transitions_per_cycle: 4,
            max_outstanding: 16,
            deadlock_threshold: 500_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct L2Configuration {
    /// Geometry of a single bank.
    pub cache: CacheGeometry,
    pub transitions_per_cycle: usize,
    pub max_outstanding: usize,
}

impl Default for L2Configuration {
    fn default() -> Self {
        Self {
            cache: CacheGeometry::new(2 * 1024 * 1024, 8),
            transitions_per_cycle: 4,
            max_outstanding: 64,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct DirectoryConfiguration {
    /// Cycles between a memory request and its completion.
    pub memory_latency: Cycle,
    pub transitions_per_cycle: usize,
}

impl Default for DirectoryConfiguration {
    fn default() -> Self {
        Self {
            memory_latency: 30,
            transitions_per_cycle: 4,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct DmaConfiguration {
    pub deadlock_threshold: Cycle,
}

impl Default for DmaConfiguration {
    fn default() -> Self {
        Self {
            deadlock_threshold: 500_000,
        }
    }
}

/// Parameters shared by every channel of the network.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ChannelConfiguration {
    pub capacity: usize,
    /// Minimum cycles from send to delivery.
    pub latency: Cycle,
    /// Extra random delay (0..=jitter) on unordered channels.
    pub jitter: Cycle,
}

impl Default for ChannelConfiguration {
    fn default() -> Self {
        Self {
            capacity: 64,
            latency: 1,
            jitter: 0,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct SystemConfiguration {
    pub num_cpus: usize,
    pub num_l2caches: usize,
    pub num_dirs: usize,
    pub num_dma_ports: usize,
    /// Adds one IO controller after the DMA ports.
    pub full_system: bool,
    pub cacheline_size: usize,
    /// Lower bound on the virtual networks. The protocol uses request,
    /// response and unblock; networks beyond those are never built.
    pub virtual_networks: usize,
    pub seed: u64,
    pub l1: L1Configuration,
    pub l2: L2Configuration,
    pub directory: DirectoryConfiguration,
    pub dma: DmaConfiguration,
    pub channel: ChannelConfiguration,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            num_cpus: 1,
            num_l2caches: 1,
            num_dirs: 1,
            num_dma_ports: 0,
            full_system: false,
            cacheline_size: 64,
            virtual_networks: 3,
            seed: 0,
            l1: L1Configuration::default(),
            l2: L2Configuration::default(),
            directory: DirectoryConfiguration::default(),
            dma: DmaConfiguration::default(),
            channel: ChannelConfiguration::default(),
        }
    }
}

impl SystemConfiguration {
    pub fn from_file(file_name: &str) -> anyhow::Result<Self> {
        let file = File::open(Path::new(file_name))
            .with_context(|| format!("File {} not found", file_name))?;
        let reader = BufReader::new(file);
        serde_yaml::from_reader(reader)
            .with_context(|| format!("Failed to parse configuration {}", file_name))
    }

    pub fn from_str(config: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(config)?)
    }

    /// DMA controllers, including the IO controller of full-system configurations.
    pub fn num_dma_controllers(&self) -> usize {
        self.num_dma_ports + if self.full_system { 1 } else { 0 }
    }

    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: String| Err(Error::InvalidConfiguration(msg));
        if self.num_cpus == 0 {
            return invalid("at least one L1 is required".into());
        }
        if self.num_l2caches == 0 || !self.num_l2caches.is_power_of_two() {
            return invalid(format!(
                "number of L2 banks ({}) must be a power of two",
                self.num_l2caches
            ));
        }
        if self.num_dirs == 0 || !self.num_dirs.is_power_of_two() {
            return invalid(format!(
                "number of directories ({}) must be a power of two",
                self.num_dirs
            ));
        }
        if !self.cacheline_size.is_power_of_two() || self.cacheline_size < WORD_BYTES {
            return Err(Error::InvalidGeometry(format!(
                "line size {} must be a power of two of at least {} bytes",
                self.cacheline_size, WORD_BYTES
            )));
        }
        if self.virtual_networks < 3 {
            return invalid(format!(
                "{} virtual networks, at least 3 are required",
                self.virtual_networks
            ));
        }
        self.l1.icache.validate(self.cacheline_size)?;
        self.l1.dcache.validate(self.cacheline_size)?;
        self.l2.cache.validate(self.cacheline_size)?;
        if self.channel.latency == 0 {
            return invalid("channel latency must be at least one cycle".into());
        }
        if self.channel.capacity < 2 * CHANNEL_RESERVE {
            return invalid(format!(
                "channel capacity {} is below {}",
                self.channel.capacity,
                2 * CHANNEL_RESERVE
            ));
        }
        if self.l1.transitions_per_cycle == 0
            || self.l2.transitions_per_cycle == 0
            || self.directory.transitions_per_cycle == 0
        {
            return invalid("transitions per cycle must be at least 1".into());
        }
        // a miss may need a second buffer for its victim's write-back
        if self.l1.max_outstanding < 2 || self.l2.max_outstanding < 2 {
            return invalid("at least 2 transaction buffers per cache are required".into());
        }
        if self.directory.memory_latency == 0 {
            return invalid("memory latency must be at least one cycle".into());
        }
        Ok(())
    }
}
