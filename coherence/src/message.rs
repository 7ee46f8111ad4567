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
use std::fmt;

use crate::address::WORD_BYTES;
use crate::LineAddress;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MachineType {
    L1Cache,
    L2Cache,
    Directory,
    Dma,
}

/// Identifies a controller: its kind plus its index among controllers of
/// that kind.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MachineId {
    pub kind: MachineType,
    pub index: usize,
}

impl MachineId {
    pub fn l1(index: usize) -> Self {
        Self {
            kind: MachineType::L1Cache,
            index,
        }
    }
    pub fn l2(index: usize) -> Self {
        Self {
            kind: MachineType::L2Cache,
            index,
        }
    }
    pub fn directory(index: usize) -> Self {
        Self {
            kind: MachineType::Directory,
            index,
        }
    }
    pub fn dma(index: usize) -> Self {
        Self {
            kind: MachineType::Dma,
            index,
        }
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}-{}", self.kind, self.index)
    }
}

/// Message classes, each on its own set of channels so that one class
/// never blocks another.
///
/// The L2 reuses the unblock network for invalidations and recalls it sends
/// to L1s; those travel in the opposite direction to the unblocks.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum VirtualNetwork {
    Request = 0,
    Response = 1,
    Unblock = 2,
}

impl VirtualNetwork {
    pub const ALL: [VirtualNetwork; 3] = [Self::Request, Self::Response, Self::Unblock];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MessageType {
    // requests
    GetS,
    GetInstr,
    GetX,
    Upgrade,
    PutX,
    PutS,
    DmaRead,
    DmaWrite,
    // forwarded requests
    Inv,
    RecallInv,
    RecallDowngrade,
    // responses
    Data,
    DataExclusive,
    InvAck,
    RecallData,
    WbAck,
    DmaAck,
    // unblocks
    Unblock,
    ExclusiveUnblock,
}

/// A cache line worth of bytes.
#[derive(Clone, Eq, PartialEq)]
pub struct DataBlock(Box<[u8]>);

impl DataBlock {
    pub fn new(block_bytes: usize) -> Self {
        Self(vec![0; block_bytes].into_boxed_slice())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn read_word(&self, offset: usize) -> u64 {
        let mut word = [0u8; WORD_BYTES];
        word.copy_from_slice(&self.0[offset..offset + WORD_BYTES]);
        u64::from_le_bytes(word)
    }

    pub fn write_word(&mut self, offset: usize, value: u64) {
        self.0[offset..offset + WORD_BYTES].copy_from_slice(&value.to_le_bytes());
    }

    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.0[offset..offset + len]
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.0[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{}]",
            self.0
                .chunks(WORD_BYTES)
                .map(|w| {
                    let mut word = [0u8; WORD_BYTES];
                    word[..w.len()].copy_from_slice(w);
                    format!("{:x}", u64::from_le_bytes(word))
                })
                .format(" ")
        )
    }
}

#[derive(Clone, Debug)]
pub struct Message {
    pub kind: MessageType,
    pub addr: LineAddress,
    pub sender: MachineId,
    pub destination: MachineId,
    /// The controller on whose behalf the message is sent.
    pub requestor: MachineId,
    pub vnet: VirtualNetwork,
    pub data: Option<DataBlock>,
    pub dirty: bool,
    /// On RECALL_DATA: the responder kept a shared copy.
    pub kept: bool,
    /// Byte range within the line for DMA requests.
    pub offset: usize,
    pub len: usize,
}

impl Message {
    pub fn new(
        kind: MessageType,
        addr: LineAddress,
        sender: MachineId,
        destination: MachineId,
        vnet: VirtualNetwork,
    ) -> Self {
        Self {
            kind,
            addr,
            sender,
            destination,
            requestor: sender,
            vnet,
            data: None,
            dirty: false,
            kept: false,
            offset: 0,
            len: 0,
        }
    }

    pub fn with_data(mut self, data: DataBlock, dirty: bool) -> Self {
        self.data = Some(data);
        self.dirty = dirty;
        self
    }

    pub fn with_requestor(mut self, requestor: MachineId) -> Self {
        self.requestor = requestor;
        self
    }

    pub fn with_kept(mut self, kept: bool) -> Self {
        self.kept = kept;
        self
    }

    pub fn with_range(mut self, offset: usize, len: usize) -> Self {
        self.offset = offset;
        self.len = len;
        self
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?} {} {} -> {} ({:?})",
            self.kind, self.addr, self.sender, self.destination, self.vnet
        )?;
        if self.requestor != self.sender {
            write!(f, " for {}", self.requestor)?;
        }
        if self.dirty {
            write!(f, " dirty")?;
        }
        if self.kept {
            write!(f, " kept")?;
        }
        if cfg!(feature = "trace-message-data") {
            if let Some(data) = &self.data {
                write!(f, " {:?}", data)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_block_words() {
        let mut block = DataBlock::new(64);
        block.write_word(8, 0xdead_beef);
        block.write_word(56, u64::MAX);
        assert_eq!(block.read_word(0), 0);
        assert_eq!(block.read_word(8), 0xdead_beef);
        assert_eq!(block.read_word(56), u64::MAX);
        block.write_bytes(8, &[1, 2]);
        assert_eq!(block.bytes(8, 2), &[1, 2]);
        assert_eq!(block.read_word(8), 0xdead_0201);
    }

    #[test]
    fn machine_id_display() {
        assert_eq!(format!("{}", MachineId::l1(3)), "L1Cache-3");
        assert_eq!(format!("{}", MachineId::dma(0)), "Dma-0");
    }
}
