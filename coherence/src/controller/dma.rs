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

use serde::Serialize;
use std::fmt;

use crate::config::{DmaConfiguration, CHANNEL_RESERVE};
use crate::controller::{Controller, TransitionLog};
use crate::message::{DataBlock, MachineId, MachineType, Message, MessageType, VirtualNetwork};
use crate::network::Network;
use crate::sequencer::{DmaKind, DmaSequencer, RequestId};
use crate::{Address, AddressMap, Cycle, Error, LineAddress};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DmaState {
    Ready,
    BusyRd,
    BusyWr,
}

impl fmt::Display for DmaState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct DmaStats {
    pub reads: usize,
    pub writes: usize,
    pub bytes_read: usize,
    pub bytes_written: usize,
}

/// Moves device transfers in and out of memory, one line at a time,
/// through the home directories.
pub struct DmaController {
    id: MachineId,
    map: AddressMap,
    state: DmaState,
    /// Line of the chunk in flight.
    line: Option<LineAddress>,
    sequencer: DmaSequencer,
    history: TransitionLog,
    stats: DmaStats,
}

impl DmaController {
    pub fn new(version: usize, config: &DmaConfiguration, map: AddressMap) -> Self {
        let id = MachineId::dma(version);
        Self {
            id,
            map,
            state: DmaState::Ready,
            line: None,
            sequencer: DmaSequencer::new(map, config.deadlock_threshold),
            history: TransitionLog::new(id),
            stats: DmaStats::default(),
        }
    }

    pub fn issue_read(&mut self, addr: Address, len: usize, now: Cycle) -> Result<RequestId, Error> {
        self.sequencer.issue(addr, DmaKind::Read(len), now)
    }

    pub fn issue_write(&mut self, addr: Address, data: Vec<u8>, now: Cycle) -> Result<RequestId, Error> {
        self.sequencer.issue(addr, DmaKind::Write(data), now)
    }

    pub fn state(&self) -> DmaState {
        self.state
    }

    pub fn sequencer(&self) -> &DmaSequencer {
        &self.sequencer
    }

    pub fn sequencer_mut(&mut self) -> &mut DmaSequencer {
        &mut self.sequencer
    }

    pub fn stats(&self) -> &DmaStats {
        &self.stats
    }

    fn unexpected(&self, msg: &Message) -> Error {
        log::error!("{}: unexpected {} in {}", self.id, msg, self.state);
        Error::violation(
            self.id,
            msg.addr,
            format!("unexpected {:?} from {} in {}", msg.kind, msg.sender, self.state),
        )
    }

    fn response(&mut self, msg: Message, now: Cycle) -> Result<(), Error> {
        if msg.sender.kind != MachineType::Directory || self.line != Some(msg.addr) {
            return Err(self.unexpected(&msg));
        }
        match (msg.kind, self.state) {
            (MessageType::Data, DmaState::BusyRd) => {
                let bytes = match &msg.data {
                    Some(data) => data.bytes(msg.offset, msg.len),
                    None => return Err(self.unexpected(&msg)),
                };
                self.stats.bytes_read += bytes.len();
                self.sequencer.chunk_done(bytes, now);
            }
            (MessageType::DmaAck, DmaState::BusyWr) => self.sequencer.chunk_done(&[], now),
            _ => return Err(self.unexpected(&msg)),
        }
        self.history
            .record(now, msg.addr, msg.kind, self.state, DmaState::Ready);
        self.state = DmaState::Ready;
        self.line = None;
        Ok(())
    }

    fn start_chunk(&mut self, now: Cycle, network: &mut Network) -> Result<bool, Error> {
        let chunk = match self.sequencer.next_chunk() {
            Some(chunk) => chunk,
            None => return Ok(false),
        };
        let home = MachineId::directory(self.map.home_directory(chunk.line));
        let (kind, state) = if chunk.data.is_empty() {
            self.stats.reads += 1;
            (MessageType::DmaRead, DmaState::BusyRd)
        } else {
            self.stats.writes += 1;
            self.stats.bytes_written += chunk.len;
            (MessageType::DmaWrite, DmaState::BusyWr)
        };
        let mut msg = Message::new(kind, chunk.line, self.id, home, VirtualNetwork::Request)
            .with_range(chunk.offset, chunk.len);
        if !chunk.data.is_empty() {
            let mut block = DataBlock::new(self.map.block_bytes());
            block.write_bytes(chunk.offset, &chunk.data);
            msg = msg.with_data(block, false);
        }
        network.send(msg, now)?;
        self.history.record(now, chunk.line, kind, self.state, state);
        self.state = state;
        self.line = Some(chunk.line);
        Ok(true)
    }
}

impl Controller for DmaController {
    fn id(&self) -> MachineId {
        self.id
    }

    fn wakeup(&mut self, now: Cycle, network: &mut Network) -> Result<(), Error> {
        if let Some(msg) = network.receive(self.id, VirtualNetwork::Response, now) {
            self.response(msg, now)?;
        }
        if self.state == DmaState::Ready
            && network.can_send(self.id, &[VirtualNetwork::Request], CHANNEL_RESERVE)
        {
            self.start_chunk(now, network)?;
        }
        Ok(())
    }

    fn is_quiescent(&self) -> bool {
        self.state == DmaState::Ready && self.sequencer.outstanding() == 0
    }

    fn describe_line(&self, line: LineAddress) -> String {
        if self.line == Some(line) {
            format!("{}", self.state)
        } else {
            format!("{}", DmaState::Ready)
        }
    }

    fn history(&self) -> &TransitionLog {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfiguration;

    struct Harness {
        dma: DmaController,
        network: Network,
        now: Cycle,
    }

    impl Harness {
        fn new() -> Self {
            let map = AddressMap::new(64, 1, 2);
            let mut network = Network::new(0);
            let channel = ChannelConfiguration::default();
            let dma = MachineId::dma(0);
            for d in 0..2 {
                let dir = MachineId::directory(d);
                network
                    .connect(dma, dir, VirtualNetwork::Request, false, &channel)
                    .unwrap();
                network
                    .connect(dir, dma, VirtualNetwork::Response, true, &channel)
                    .unwrap();
            }
            Self {
                dma: DmaController::new(0, &DmaConfiguration::default(), map),
                network,
                now: 0,
            }
        }

        fn tick(&mut self) {
            self.dma.wakeup(self.now, &mut self.network).unwrap();
            self.now += 1;
        }

        fn sent(&mut self, dir: usize) -> Option<Message> {
            self.network
                .receive(MachineId::directory(dir), VirtualNetwork::Request, self.now)
        }

        fn reply(&mut self, msg: Message) {
            self.network.send(msg, self.now).unwrap();
            self.now += 1;
            self.tick();
        }
    }

    #[test]
    fn write_then_read_across_homes() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let mut h = Harness::new();
        let bytes: Vec<u8> = (1..=16).collect();
        // 0x38..0x48 straddles lines 0x0 (home 0) and 0x40 (home 1)
        let write = h.dma.issue_write(Address(0x38), bytes, 0).unwrap();
        h.tick();
        assert_eq!(h.dma.state(), DmaState::BusyWr);
        h.tick();
        let first = h.sent(0).unwrap();
        assert_eq!(first.kind, MessageType::DmaWrite);
        assert_eq!((first.offset, first.len), (0x38, 8));
        assert_eq!(first.data.as_ref().map(|d| d.read_word(0x38)), Some(0x0807060504030201));
        assert!(h.sent(1).is_none());

        let ack = Message::new(
            MessageType::DmaAck,
            first.addr,
            MachineId::directory(0),
            MachineId::dma(0),
            VirtualNetwork::Response,
        );
        h.reply(ack);
        h.tick();
        let second = h.sent(1).unwrap();
        assert_eq!((second.addr.base(), second.offset, second.len), (Address(0x40), 0, 8));
        let ack = Message::new(
            MessageType::DmaAck,
            second.addr,
            MachineId::directory(1),
            MachineId::dma(0),
            VirtualNetwork::Response,
        );
        h.reply(ack);
        let done = h.dma.sequencer_mut().drain_completions();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, write);
        assert!(h.dma.is_quiescent());

        h.dma.issue_read(Address(0x48), 8, h.now).unwrap();
        h.tick();
        h.tick();
        let read = h.sent(1).unwrap();
        assert_eq!(read.kind, MessageType::DmaRead);
        let mut block = DataBlock::new(64);
        block.write_word(8, 42);
        let data = Message::new(
            MessageType::Data,
            read.addr,
            MachineId::directory(1),
            MachineId::dma(0),
            VirtualNetwork::Response,
        )
        .with_data(block, false)
        .with_range(8, 8);
        h.reply(data);
        let done = h.dma.sequencer_mut().drain_completions();
        assert_eq!(done[0].data, 42u64.to_le_bytes().to_vec());
        assert_eq!(h.dma.stats().bytes_read, 8);
    }

    #[test]
    fn stray_ack_is_a_violation() {
        let mut h = Harness::new();
        let ack = Message::new(
            MessageType::DmaAck,
            AddressMap::new(64, 1, 2).line(Address(0)),
            MachineId::directory(0),
            MachineId::dma(0),
            VirtualNetwork::Response,
        );
        h.network.send(ack, 0).unwrap();
        assert!(matches!(
            h.dma.wakeup(2, &mut h.network),
            Err(Error::ProtocolViolation(_))
        ));
    }
}
