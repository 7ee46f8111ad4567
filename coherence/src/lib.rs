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

mod address;
mod cache;
mod channel;
mod config;
mod controller;
mod entry;
mod error;
mod memory;
mod message;
mod network;
mod sequencer;
mod stall;
mod system;
pub mod traffic;

// Public types
// type to use for cycles
pub type Cycle = usize;

pub use crate::address::{Address, AddressMap, LineAddress, WORD_BYTES};
pub use crate::cache::CacheMemory;
pub use crate::channel::{ChannelStats, MessageChannel};
pub use crate::config::{
    CacheGeometry, ChannelConfiguration, DirectoryConfiguration, DmaConfiguration,
    L1Configuration, L2Configuration, SystemConfiguration, CHANNEL_RESERVE,
};
pub use crate::controller::directory::{DirectoryController, DirectoryStats};
pub use crate::controller::dma::{DmaController, DmaState, DmaStats};
pub use crate::controller::l1::{L1Controller, L1State, L1Stats};
pub use crate::controller::l2::{L2Controller, L2Line, L2Stats};
pub use crate::controller::{Controller, Transition, TransitionLog};
pub use crate::entry::{CacheLine, DirectoryEntry, SharerSet};
pub use crate::error::{Error, Violation};
pub use crate::memory::{MemoryInterface, MemoryResponse, SimpleMemory};
pub use crate::message::{
    DataBlock, MachineId, MachineType, Message, MessageType, VirtualNetwork,
};
pub use crate::network::{Link, Network};
pub use crate::sequencer::{
    Completion, CoreRequest, DmaChunk, DmaCompletion, DmaKind, DmaSequencer, RequestId,
    RequestKind, Sequencer,
};
pub use crate::stall::StallTable;
pub use crate::system::{System, SystemStats};
pub use crate::traffic::{verify_completions, RandomTraffic, TrafficConfiguration};
