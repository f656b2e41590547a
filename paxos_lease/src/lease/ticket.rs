// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-ticket lease state.

use std::time::Duration;

use crate::lease::TicketName;
use crate::lease::wire::{ClearMode, LeaseOp, LeaseValue};
use crate::paxos::{InstanceHandle, Round, SiteId};
use crate::timer::{TimerHandle, TimerQueue};

/// Whether a valid grant is in effect for a ticket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseState {
    /// A grant is in effect.
    Started,
    /// The ticket was released.
    Stopped,
}

/// Callback invoked when a round this site initiated runs to completion.
pub type CompletionHandler = Box<dyn FnMut(Round, i32) + Send>;

/// The operation to embed in the next outgoing prepare header. Consumed
/// once and cleared so the following round starts clean.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LeaseAction {
    pub op: LeaseOp,
    pub clear: ClearMode,
}

/// Ballot, value and deadline a ticket tracks for one protocol role.
#[derive(Debug, Default)]
pub(crate) struct RoleState {
    pub round: Round,
    pub value: Option<LeaseValue>,
    pub expires: u64,
}

/// Proposer-side timers: the renewal slot doubles as the expiry slot when
/// the lease is not auto-renewed.
#[derive(Debug, Default)]
pub(crate) struct ProposerTimers {
    pub renew: Option<TimerHandle>,
    pub retry: Option<TimerHandle>,
}

/// Acceptor-side timers. A freshly accepted round arms a tentative expiry
/// in `new` without destroying the still-valid expiry of the previously
/// committed lease in `current`; commit/learn promotes new to current.
/// Promotion moves the handle, so the two slots can never alias.
#[derive(Debug, Default)]
pub(crate) struct AcceptorTimers {
    pub new: Option<TimerHandle>,
    pub current: Option<TimerHandle>,
}

pub(crate) struct Ticket {
    pub name: TicketName,
    pub instance: InstanceHandle,
    pub owner: Option<SiteId>,
    pub expiry: Duration,
    pub expires_at: u64,
    pub release_state: LeaseState,
    pub renew: bool,
    pub failover: bool,
    pub pending: Option<LeaseAction>,
    pub proposer: RoleState,
    pub acceptor: RoleState,
    pub proposer_timers: ProposerTimers,
    pub acceptor_timers: AcceptorTimers,
    pub on_completion: Option<CompletionHandler>,
}

impl Ticket {
    pub fn new(name: TicketName, instance: InstanceHandle, expiry: Duration, failover: bool) -> Self {
        Ticket {
            name,
            instance,
            owner: None,
            expiry,
            expires_at: 0,
            // Fresh tickets report Started so a first acquire carrying
            // NotClearRelease is not refused as overwriting a stale release.
            release_state: LeaseState::Started,
            renew: false,
            failover,
            pending: None,
            proposer: RoleState::default(),
            acceptor: RoleState::default(),
            proposer_timers: ProposerTimers::default(),
            acceptor_timers: AcceptorTimers::default(),
            on_completion: None,
        }
    }

    /// Lease duration in whole seconds as carried on the wire.
    pub fn expiry_secs(&self) -> i32 {
        i32::try_from(self.expiry.as_secs()).unwrap_or(i32::MAX)
    }

    /// Seconds after a grant at which the owner renews.
    pub fn renew_after(&self) -> u64 {
        4 * self.expiry.as_secs() / 5
    }

    /// Seconds after an acquire at which an unowned ticket is retried.
    pub fn retry_after(&self) -> u64 {
        self.expiry.as_secs() / 10
    }

    /// Margin before expiry inside which a reconstructed lease skips
    /// renewal and lets the expiry timer drive re-acquisition.
    pub fn renew_margin(&self) -> u64 {
        self.expiry.as_secs() / 5
    }

    /// Cancel every armed timer on the ticket.
    pub fn cancel_all_timers<T>(&mut self, timers: &mut TimerQueue<T>) {
        if let Some(handle) = self.proposer_timers.renew.take() {
            timers.cancel(handle);
        }
        if let Some(handle) = self.proposer_timers.retry.take() {
            timers.cancel(handle);
        }
        self.cancel_acceptor_timers(timers);
    }

    /// Cancel both acceptor-side timers.
    pub fn cancel_acceptor_timers<T>(&mut self, timers: &mut TimerQueue<T>) {
        if let Some(handle) = self.acceptor_timers.new.take() {
            timers.cancel(handle);
        }
        if let Some(handle) = self.acceptor_timers.current.take() {
            timers.cancel(handle);
        }
    }

    /// Promote the tentative acceptor expiry to the confirmed slot,
    /// cancelling the expiry of the superseded lease.
    pub fn promote_acceptor_timer<T>(&mut self, timers: &mut TimerQueue<T>) {
        if let Some(new) = self.acceptor_timers.new.take() {
            if let Some(old) = self.acceptor_timers.current.replace(new) {
                timers.cancel(old);
            }
        }
    }
}
