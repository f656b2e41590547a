// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lease-coordinated ticket state machines and their manager.

use core::fmt;

use thiserror::Error;

use crate::paxos::{self, NAME_MAX, Round, SiteId};

mod manager;
mod protocol;
mod ticket;
pub mod wire;

pub use manager::{
    LeaseManager, ManagerOptions, ManagerOptionsBuilder, TicketConfig, TicketConfigBuilder,
    TicketHandle, TicketStatus,
};
pub use ticket::{CompletionHandler, LeaseState};
pub use wire::{ClearMode, LeaseOp};

/// Represents an error that occurred in the lease layer.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error(#[from] ErrorKind);

impl Error {
    /// Returns the [`ErrorKind`] of the error.
    #[must_use]
    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }
}

/// Represents the kinds of errors that occur in the lease layer.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// The ticket name length must not be zero.
    #[error("ticket name length must not be zero")]
    NameLengthZero,
    /// The ticket name does not fit the wire value record.
    #[error("ticket name exceeds {NAME_MAX} octets")]
    NameTooLong,
    /// No ticket is registered for the given handle.
    #[error("no ticket registered for this handle")]
    UnknownHandle,
    /// Only the owning site may release a ticket.
    #[error("cannot release a ticket owned elsewhere")]
    NotOwner,
    /// The durable store holds no committed state for the ticket.
    #[error("no committed ticket state reachable during catch-up")]
    CatchupMissing,
    /// The lease session has exited and no longer serves requests.
    #[error("lease session has exited")]
    SessionClosed,
    /// An error reported by the Paxos engine. See
    /// [`EngineError`](paxos::EngineError) for more information.
    #[error(transparent)]
    Engine(#[from] paxos::EngineError),
}

/// Identity of a ticket: a non-empty byte string of at most
/// [`NAME_MAX`] octets.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TicketName(Vec<u8>);

impl TicketName {
    /// Validate `name` as a ticket identity.
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`NameLengthZero`](ErrorKind::NameLengthZero)
    /// if `name` is empty, or of kind [`NameTooLong`](ErrorKind::NameTooLong)
    /// if it exceeds [`NAME_MAX`] octets.
    pub fn new(name: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error(ErrorKind::NameLengthZero));
        }
        if name.len() > NAME_MAX {
            return Err(Error(ErrorKind::NameTooLong));
        }
        Ok(Self(name))
    }

    /// The raw octets of the name.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for TicketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        String::from_utf8_lossy(&self.0).fmt(f)
    }
}

impl fmt::Debug for TicketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TicketName({})", String::from_utf8_lossy(&self.0))
    }
}

/// Committed ticket state handed to the store on every commit, expiry and
/// catch-up.
///
/// `owner == None` together with `expires == 0` denotes a released or
/// expired ticket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TicketUpdate {
    /// Ticket identity.
    pub name: TicketName,
    /// Site holding the ticket, if any.
    pub owner: Option<SiteId>,
    /// Unix time after which the grant is no longer trusted.
    pub expires: u64,
    /// Round the state was committed in.
    pub ballot: Round,
}

/// Best-known committed state returned by a catch-up query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CatchupState {
    /// Site holding the ticket, if any.
    pub owner: Option<SiteId>,
    /// Round the state was committed in.
    pub ballot: Round,
    /// Unix time the grant expires.
    pub expires: u64,
}

/// Durable ticket store and cluster notifier, supplied by the embedding
/// application.
///
/// `notify` is best-effort: the store must accept re-ordered ballots and
/// keep the highest; failures are its own responsibility.
pub trait TicketStore {
    /// Persist and gossip a committed ticket result.
    fn notify(&mut self, update: &TicketUpdate);

    /// Contact peers and return the best-known committed state for `name`.
    ///
    /// # Errors
    /// [`struct@Error`] of kind
    /// [`CatchupMissing`](ErrorKind::CatchupMissing) if no committed state
    /// is reachable.
    fn catchup(&mut self, name: &TicketName) -> Result<CatchupState, Error>;
}
