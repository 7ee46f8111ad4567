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

use std::fmt;

use crate::message::{MachineId, VirtualNetwork};
use crate::{Address, LineAddress};

/// Details attached to fatal runtime errors.
///
/// Controllers fill in what they know locally (`controller`, `addr`,
/// `reason`); the system adds the cross-controller `dump` (states of all
/// participants, in-flight messages, recent transitions) before the error
/// leaves the simulation loop.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Violation {
    pub controller: MachineId,
    pub addr: LineAddress,
    pub reason: String,
    pub dump: String,
}

impl Violation {
    pub fn new(controller: MachineId, addr: LineAddress, reason: impl Into<String>) -> Self {
        Self {
            controller,
            addr,
            reason: reason.into(),
            dump: String::new(),
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    /// The channel is at capacity; the sender must stall and retry.
    ChannelFull,
    /// A coherence invariant was broken. Fatal.
    ProtocolViolation(Box<Violation>),
    /// A message reached a controller that does not own the address.
    AddressMisroute {
        controller: MachineId,
        addr: LineAddress,
    },
    /// No channel connects the two controllers on this virtual network.
    NoRoute(MachineId, MachineId, VirtualNetwork),
    /// A request stayed outstanding past the deadlock threshold.
    Deadlock(Box<Violation>),
    InvalidGeometry(String),
    InvalidConfiguration(String),
    MisalignedAccess(Address),
    UnknownSequencer(usize),
}

impl Error {
    pub(crate) fn violation(
        controller: MachineId,
        addr: LineAddress,
        reason: impl Into<String>,
    ) -> Self {
        Self::ProtocolViolation(Box::new(Violation::new(controller, addr, reason)))
    }

    /// The violation details, for the errors that carry them.
    pub fn details(&self) -> Option<&Violation> {
        match self {
            Self::ProtocolViolation(v) | Self::Deadlock(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn with_dump(self, dump: String) -> Self {
        match self {
            Self::ProtocolViolation(mut v) => {
                v.dump = dump;
                Self::ProtocolViolation(v)
            }
            Self::Deadlock(mut v) => {
                v.dump = dump;
                Self::Deadlock(v)
            }
            other => other,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ProtocolViolation(v) => {
                write!(
                    f,
                    "ERROR: protocol violation at {} for line {}: {}",
                    v.controller, v.addr, v.reason
                )?;
                if !v.dump.is_empty() {
                    write!(f, "\n{}", v.dump)?;
                }
                Ok(())
            }
            Self::Deadlock(v) => {
                write!(
                    f,
                    "ERROR: possible deadlock at {} for line {}: {}",
                    v.controller, v.addr, v.reason
                )?;
                if !v.dump.is_empty() {
                    write!(f, "\n{}", v.dump)?;
                }
                Ok(())
            }
            Self::AddressMisroute { controller, addr } => {
                write!(f, "ERROR: line {} does not belong to {}", addr, controller)
            }
            Self::NoRoute(src, dst, vnet) => {
                write!(f, "ERROR: no channel {} -> {} on {:?}", src, dst, vnet)
            }
            Self::InvalidGeometry(msg) => write!(f, "ERROR: invalid cache geometry: {}", msg),
            Self::InvalidConfiguration(msg) => write!(f, "ERROR: invalid configuration: {}", msg),
            Self::MisalignedAccess(addr) => write!(f, "ERROR: misaligned access to {}", addr),
            _ => write!(f, "{:?}", self),
        }
    }
}

impl std::error::Error for Error {}
