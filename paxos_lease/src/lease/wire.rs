// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fixed-layout header and value records carried through the Paxos engine.
//!
//! The header travels alongside every protocol message: three big-endian
//! `i32` fields `op | clear | leased`, 12 octets. The value agreed per round
//! is `name[NAME_MAX + 1] | owner_be32 | expiry_be32`, zero-padded to
//! [`VALUE_LEN`] octets; an all-zero value denotes a release.

use bytes::{Buf, BufMut};

use crate::lease::TicketName;
use crate::paxos::{NAME_MAX, SiteId};

/// Octets of the value record agreed on per round.
pub const VALUE_LEN: usize = 1024;

/// Octets of the header carried alongside each protocol message.
pub const HEADER_LEN: usize = 12;

/// Octets of the fixed name field inside the value record.
const NAME_FIELD: usize = NAME_MAX + 1;

/// Wire encoding of an absent owner.
const NO_OWNER: i32 = -1;

/// Operation flavor driven through the Paxos machinery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseOp {
    /// Acquire or renew a lease.
    Start,
    /// Release a lease.
    Stop,
}

impl LeaseOp {
    fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(LeaseOp::Start),
            1 => Some(LeaseOp::Stop),
            _ => None,
        }
    }

    fn to_wire(self) -> i32 {
        match self {
            LeaseOp::Start => 0,
            LeaseOp::Stop => 1,
        }
    }
}

/// Whether acceptors may overwrite a locally remembered released lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClearMode {
    /// Overwrite a remembered release.
    ClearRelease,
    /// Preserve a remembered release; the conservative choice for automatic
    /// retries and failover.
    NotClearRelease,
}

impl ClearMode {
    fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(ClearMode::ClearRelease),
            1 => Some(ClearMode::NotClearRelease),
            _ => None,
        }
    }

    fn to_wire(self) -> i32 {
        match self {
            ClearMode::ClearRelease => 0,
            ClearMode::NotClearRelease => 1,
        }
    }
}

/// Lease header carried alongside each protocol message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Operation being driven.
    pub op: LeaseOp,
    /// Release-overwrite mode for this proposal.
    pub clear: ClearMode,
    /// Set by an acceptor that observes a live lease for the ticket.
    pub leased: bool,
}

impl MessageHeader {
    /// Decode a header from the first [`HEADER_LEN`] octets of `buf`.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let mut buf = buf;
        let op = LeaseOp::from_wire(buf.get_i32())?;
        let clear = ClearMode::from_wire(buf.get_i32())?;
        let leased = buf.get_i32() != 0;
        Some(MessageHeader { op, clear, leased })
    }

    /// Encode the header into the first [`HEADER_LEN`] octets of `buf`.
    /// Returns `false` when `buf` is too short.
    pub fn encode(&self, mut buf: &mut [u8]) -> bool {
        if buf.len() < HEADER_LEN {
            return false;
        }
        buf.put_i32(self.op.to_wire());
        buf.put_i32(self.clear.to_wire());
        buf.put_i32(i32::from(self.leased));
        true
    }
}

/// Value record agreed on per round: the ticket, its owner and the lease
/// duration in seconds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseValue {
    /// Ticket name octets; empty in a release value.
    pub name: Vec<u8>,
    /// Proposed owner; `-1` on the wire when absent.
    pub owner: Option<SiteId>,
    /// Lease duration in seconds.
    pub expiry: i32,
}

impl LeaseValue {
    /// Value proposing `owner` as the holder of `name` for `expiry` seconds.
    #[must_use]
    pub fn grant(name: &TicketName, owner: SiteId, expiry: i32) -> Self {
        LeaseValue {
            name: name.as_bytes().to_vec(),
            owner: Some(owner),
            expiry,
        }
    }

    /// The all-zero value denoting a release.
    #[must_use]
    pub fn release() -> Self {
        LeaseValue {
            name: Vec::new(),
            owner: None,
            expiry: 0,
        }
    }

    /// Encode into a zero-padded [`VALUE_LEN`] record.
    #[must_use]
    pub fn encode(&self) -> [u8; VALUE_LEN] {
        let mut buf = [0u8; VALUE_LEN];
        let len = self.name.len().min(NAME_MAX);
        buf[..len].copy_from_slice(&self.name[..len]);
        let owner = match self.owner {
            Some(site) => site,
            // A release value is all zeroes on the wire.
            None if self.name.is_empty() => 0,
            None => NO_OWNER,
        };
        buf[NAME_FIELD..NAME_FIELD + 4].copy_from_slice(&owner.to_be_bytes());
        buf[NAME_FIELD + 4..NAME_FIELD + 8].copy_from_slice(&self.expiry.to_be_bytes());
        buf
    }

    /// Decode from the first [`VALUE_LEN`] octets of `buf`. The name field
    /// is truncated at its first NUL.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < VALUE_LEN {
            return None;
        }
        let len = buf[..NAME_FIELD]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_MAX);
        let name = buf[..len].to_vec();
        let mut rest = &buf[NAME_FIELD..];
        let raw_owner = rest.get_i32();
        let expiry = rest.get_i32();
        let owner = if raw_owner == NO_OWNER || (raw_owner == 0 && name.is_empty()) {
            None
        } else {
            Some(raw_owner)
        };
        Some(LeaseValue { name, owner, expiry })
    }
}
