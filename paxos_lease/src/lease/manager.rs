// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The lease manager: ticket registry, public API and timer orchestration.

use std::collections::HashMap;
use std::time::Duration;

use crate::lease::ticket::{LeaseAction, LeaseState, Ticket};
use crate::lease::wire::{ClearMode, HEADER_LEN, LeaseOp, LeaseValue, VALUE_LEN};
use crate::lease::{CompletionHandler, Error, ErrorKind, TicketName, TicketStore, TicketUpdate};
use crate::paxos::{PaxosEngine, Roles, Round, SiteId, SpaceConfigBuilder, SpaceHandle};
use crate::timer::{Clock, TimerQueue, WallClock};

/// Default name of the Paxos space the manager creates.
const LEASE_SPACE: &str = "paxoslease";

/// Handle to a ticket registered with a [`LeaseManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TicketHandle(u64);

/// Which lease transition a fired timer drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Owner-side renewal ahead of expiry.
    Renew,
    /// One-shot acquire retry.
    Retry,
    /// Lease deadline.
    Expire,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct TimerEvent {
    pub ticket: TicketHandle,
    pub kind: TimerKind,
}

/// Cluster-level parameters for a [`LeaseManager`].
#[derive(Builder, Clone, Debug)]
#[builder(setter(into))]
pub struct ManagerOptions {
    /// Identity of the local site.
    pub site_id: SiteId,
    /// Number of sites in the cluster.
    pub cluster_size: u32,
    /// Roles played by each site, indexed by site id.
    pub roles: Vec<Roles>,
    /// Name of the Paxos space.
    #[builder(default = "LEASE_SPACE.to_string()")]
    pub space_name: String,
}

/// Per-ticket parameters.
#[derive(Builder, Clone, Debug)]
#[builder(setter(into))]
pub struct TicketConfig {
    /// Ticket identity octets.
    pub name: Vec<u8>,
    /// Lease duration.
    pub expiry: Duration,
    /// Whether any site races to re-acquire the ticket after expiry.
    #[builder(default)]
    pub failover: bool,
    /// Per-site proposal priorities forwarded to the engine.
    #[builder(default)]
    pub priorities: Vec<i32>,
}

/// Observable state of a ticket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TicketStatus {
    /// Site currently believed to hold the ticket.
    pub owner: Option<SiteId>,
    /// Whether a valid grant is in effect.
    pub release_state: LeaseState,
    /// Unix time after which the owner is no longer trusted.
    pub expires_at: u64,
    /// Whether the owner auto-renews ahead of expiry.
    pub renew: bool,
    /// Whether expiry triggers re-acquisition.
    pub failover: bool,
    /// Latest round driven as proposer.
    pub proposer_round: Round,
    /// Latest round tracked as acceptor.
    pub acceptor_round: Round,
}

/// Everything the Paxos callbacks operate on, split from the engine so the
/// engine can re-enter the lease layer while the manager drives it.
pub(crate) struct LeaseCore<S, C> {
    pub site_id: SiteId,
    pub tickets: HashMap<TicketHandle, Ticket>,
    pub timers: TimerQueue<TimerEvent>,
    pub store: S,
    pub clock: C,
    next_ticket: u64,
}

/// Drives zero or more ticket state machines through a Paxos engine.
///
/// The manager owns the ticket registry, the engine handle and every timer;
/// all entry points run to completion on the calling thread. Embedding
/// applications serialize calls onto one thread (see
/// [`Session`](crate::session::Session)) and pump [`tick`](Self::tick)
/// whenever [`next_deadline`](Self::next_deadline) passes.
pub struct LeaseManager<E, S, C = WallClock>
where
    E: PaxosEngine,
    S: TicketStore,
    C: Clock,
{
    pub(crate) core: LeaseCore<S, C>,
    pub(crate) engine: E,
    space: SpaceHandle,
}

impl<E, S> LeaseManager<E, S, WallClock>
where
    E: PaxosEngine,
    S: TicketStore,
{
    /// Create a manager over the system wall clock.
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`Engine`](ErrorKind::Engine) if the Paxos
    /// space cannot be created.
    pub fn new(options: ManagerOptions, engine: E, store: S) -> Result<Self, Error> {
        Self::new_with_clock(options, engine, store, WallClock)
    }
}

impl<E, S, C> LeaseManager<E, S, C>
where
    E: PaxosEngine,
    S: TicketStore,
    C: Clock,
{
    /// Create a manager with an explicit clock.
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`Engine`](ErrorKind::Engine) if the Paxos
    /// space cannot be created.
    ///
    /// # Panics
    /// Unreachable: all space parameters are statically provided.
    pub fn new_with_clock(
        options: ManagerOptions,
        mut engine: E,
        store: S,
        clock: C,
    ) -> Result<Self, Error> {
        let config = SpaceConfigBuilder::default()
            .name(options.space_name)
            .node_count(options.cluster_size)
            .header_len(HEADER_LEN)
            .value_len(VALUE_LEN)
            .roles(options.roles)
            .build()
            .expect("all space parameters are statically provided");
        let space = engine.space_init(&config).map_err(ErrorKind::Engine)?;
        Ok(LeaseManager {
            core: LeaseCore {
                site_id: options.site_id,
                tickets: HashMap::new(),
                timers: TimerQueue::new(),
                store,
                clock,
                next_ticket: 1,
            },
            engine,
            space,
        })
    }

    /// Identity of the local site.
    #[must_use]
    pub fn site_id(&self) -> SiteId {
        self.core.site_id
    }

    /// Register a ticket and create its Paxos instance.
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`NameLengthZero`](ErrorKind::NameLengthZero)
    /// or [`NameTooLong`](ErrorKind::NameTooLong) if the configured name is
    /// invalid, or of kind [`Engine`](ErrorKind::Engine) if the instance
    /// cannot be created.
    pub fn add_ticket(&mut self, config: TicketConfig) -> Result<TicketHandle, Error> {
        let name = TicketName::new(config.name)?;
        let instance = self
            .engine
            .instance_init(self.space, name.as_bytes(), &config.priorities)
            .map_err(ErrorKind::Engine)?;
        let handle = TicketHandle(self.core.next_ticket);
        self.core.next_ticket += 1;
        self.core
            .tickets
            .insert(handle, Ticket::new(name, instance, config.expiry, config.failover));
        Ok(handle)
    }

    /// Drop a ticket, cancelling all of its timers.
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`UnknownHandle`](ErrorKind::UnknownHandle)
    /// if no ticket is registered for `handle`.
    pub fn remove_ticket(&mut self, handle: TicketHandle) -> Result<(), Error> {
        let Some(mut ticket) = self.core.tickets.remove(&handle) else {
            return Err(ErrorKind::UnknownHandle.into());
        };
        ticket.cancel_all_timers(&mut self.core.timers);
        Ok(())
    }

    /// Observable state of a ticket.
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`UnknownHandle`](ErrorKind::UnknownHandle)
    /// if no ticket is registered for `handle`.
    pub fn status(&self, handle: TicketHandle) -> Result<TicketStatus, Error> {
        let Some(ticket) = self.core.tickets.get(&handle) else {
            return Err(ErrorKind::UnknownHandle.into());
        };
        Ok(TicketStatus {
            owner: ticket.owner,
            release_state: ticket.release_state,
            expires_at: ticket.expires_at,
            renew: ticket.renew,
            failover: ticket.failover,
            proposer_round: ticket.proposer.round,
            acceptor_round: ticket.acceptor.round,
        })
    }

    /// Initiate a grant proposal naming the local site as owner.
    ///
    /// A retry timer is armed at a tenth of the lease duration: if nobody
    /// has won the ticket by then, one fresh round is started with
    /// [`ClearMode::NotClearRelease`].
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`UnknownHandle`](ErrorKind::UnknownHandle)
    /// if no ticket is registered for `handle`, or of kind
    /// [`Engine`](ErrorKind::Engine) if the engine refuses the round; no
    /// retry timer is armed in that case.
    pub fn acquire(
        &mut self,
        handle: TicketHandle,
        clear: ClearMode,
        renew: bool,
        on_done: Option<CompletionHandler>,
    ) -> Result<Round, Error> {
        let now = self.core.clock.now();
        let site = self.core.site_id;
        let Some(ticket) = self.core.tickets.get_mut(&handle) else {
            return Err(ErrorKind::UnknownHandle.into());
        };
        log::debug!("acquiring ticket [{}] for site {site}", ticket.name);
        ticket.renew = renew;
        ticket.on_completion = on_done;
        ticket.pending = Some(LeaseAction {
            op: LeaseOp::Start,
            clear,
        });
        let instance = ticket.instance;
        let value = LeaseValue::grant(&ticket.name, site, ticket.expiry_secs()).encode();
        let mut acceptor_round = ticket.acceptor.round;
        let retry_at = now + ticket.retry_after();

        let round = self
            .engine
            .round_request(&mut self.core, instance, &value, &mut acceptor_round)
            .map_err(ErrorKind::Engine)?;

        if let Some(ticket) = self.core.tickets.get_mut(&handle) {
            ticket.acceptor.round = acceptor_round;
            ticket.proposer.round = round;
            if let Some(old) = ticket.proposer_timers.retry.take() {
                self.core.timers.cancel(old);
            }
            ticket.proposer_timers.retry = Some(self.core.timers.arm(
                retry_at,
                TimerEvent {
                    ticket: handle,
                    kind: TimerKind::Retry,
                },
            ));
        }
        Ok(round)
    }

    /// Drive a release proposal carrying a zeroed value.
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`UnknownHandle`](ErrorKind::UnknownHandle)
    /// if no ticket is registered for `handle`, of kind
    /// [`NotOwner`](ErrorKind::NotOwner) if the local site does not hold the
    /// ticket, or of kind [`Engine`](ErrorKind::Engine) if the engine
    /// refuses the round.
    pub fn release(
        &mut self,
        handle: TicketHandle,
        on_done: Option<CompletionHandler>,
    ) -> Result<Round, Error> {
        let site = self.core.site_id;
        let Some(ticket) = self.core.tickets.get_mut(&handle) else {
            return Err(ErrorKind::UnknownHandle.into());
        };
        if ticket.owner != Some(site) {
            log::error!(
                "cannot release ticket [{}]: not the lease owner",
                ticket.name
            );
            return Err(ErrorKind::NotOwner.into());
        }
        log::debug!("releasing ticket [{}]", ticket.name);
        ticket.on_completion = on_done;
        ticket.pending = Some(LeaseAction {
            op: LeaseOp::Stop,
            clear: ClearMode::ClearRelease,
        });
        let instance = ticket.instance;
        let value = LeaseValue::release().encode();
        let mut acceptor_round = ticket.acceptor.round;

        let round = self
            .engine
            .round_request(&mut self.core, instance, &value, &mut acceptor_round)
            .map_err(ErrorKind::Engine)?;

        if let Some(ticket) = self.core.tickets.get_mut(&handle) {
            ticket.acceptor.round = acceptor_round;
            ticket.proposer.round = round;
        }
        Ok(round)
    }

    /// Reconstruct ticket state after a restart.
    ///
    /// While the engine reports the instance as recovering, the ticket is
    /// marked for renewal and the engine's catch-up is run; the recovering
    /// flag is cleared on success and kept set otherwise so a later call
    /// retries.
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`UnknownHandle`](ErrorKind::UnknownHandle)
    /// if no ticket is registered for `handle`, or of kind
    /// [`Engine`](ErrorKind::Engine) if catch-up fails.
    pub fn status_recovery(&mut self, handle: TicketHandle) -> Result<(), Error> {
        let Some(ticket) = self.core.tickets.get_mut(&handle) else {
            return Err(ErrorKind::UnknownHandle.into());
        };
        let instance = ticket.instance;
        if !self.engine.recovering(instance) {
            return Ok(());
        }
        ticket.renew = true;
        self.engine
            .catchup(&mut self.core, instance)
            .map_err(ErrorKind::Engine)?;
        self.engine.set_recovering(instance, false);
        Ok(())
    }

    /// Forward an incoming protocol message to the engine.
    ///
    /// # Errors
    /// [`struct@Error`] of kind [`Engine`](ErrorKind::Engine) if the engine
    /// rejects the message.
    pub fn on_receive(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.engine
            .recvmsg(&mut self.core, buf)
            .map_err(ErrorKind::Engine)?;
        Ok(())
    }

    /// Fire every timer whose deadline has passed.
    pub fn tick(&mut self) {
        loop {
            let now = self.core.clock.now();
            let Some(event) = self.core.timers.pop_due(now) else {
                break;
            };
            match event.kind {
                TimerKind::Renew => self.renew_expires(event.ticket),
                TimerKind::Retry => self.lease_retry(event.ticket),
                TimerKind::Expire => self.lease_expires(event.ticket),
            }
        }
    }

    /// Earliest wall-clock deadline among armed timers.
    pub fn next_deadline(&mut self) -> Option<u64> {
        self.core.timers.next_deadline()
    }

    /// Time until the next armed timer fires; zero when one is overdue.
    pub fn until_next_deadline(&mut self) -> Option<Duration> {
        let deadline = self.core.timers.next_deadline()?;
        Some(Duration::from_secs(
            deadline.saturating_sub(self.core.clock.now()),
        ))
    }

    /// Renewal timer: the owner extends its lease by driving a fresh accept
    /// phase. A stale fire on a site that lost or released the ticket is a
    /// no-op.
    fn renew_expires(&mut self, handle: TicketHandle) {
        let site = self.core.site_id;
        let Some(ticket) = self.core.tickets.get_mut(&handle) else {
            return;
        };
        log::debug!("renewing lease on ticket [{}]", ticket.name);
        if ticket.owner != Some(site) {
            log::debug!("cannot renew: not the lease owner");
            return;
        }
        if ticket.release_state != LeaseState::Started {
            log::debug!("cannot renew: no grant in effect");
            return;
        }
        let instance = ticket.instance;
        let round = ticket.proposer.round + 1;
        ticket.proposer.round = round;
        let value = LeaseValue::grant(&ticket.name, site, ticket.expiry_secs()).encode();
        if let Err(error) = self.engine.propose(&mut self.core, instance, &value, round) {
            log::error!("lease renewal was refused: {error}");
            if let Some(ticket) = self.core.tickets.get_mut(&handle) {
                ticket.proposer.round = round - 1;
            }
        }
    }

    /// Acquire retry timer: one fresh round, attempted exactly once, and
    /// only while the ticket is still unowned.
    fn lease_retry(&mut self, handle: TicketHandle) {
        let site = self.core.site_id;
        let Some(ticket) = self.core.tickets.get_mut(&handle) else {
            return;
        };
        log::debug!("acquire retry for ticket [{}]", ticket.name);
        if let Some(old) = ticket.proposer_timers.retry.take() {
            self.core.timers.cancel(old);
        }
        if let Some(owner) = ticket.owner {
            log::debug!("site {owner} already got the lease, no need to retry");
            return;
        }
        // The retry cannot tell a manual grant from failover, so preserving
        // a remembered release is the only safe choice.
        ticket.pending = Some(LeaseAction {
            op: LeaseOp::Start,
            clear: ClearMode::NotClearRelease,
        });
        let instance = ticket.instance;
        let value = LeaseValue::grant(&ticket.name, site, ticket.expiry_secs()).encode();
        let mut acceptor_round = ticket.acceptor.round;
        match self
            .engine
            .round_request(&mut self.core, instance, &value, &mut acceptor_round)
        {
            Ok(round) => {
                if let Some(ticket) = self.core.tickets.get_mut(&handle) {
                    ticket.acceptor.round = acceptor_round;
                    ticket.proposer.round = round;
                }
            }
            Err(error) => log::error!("acquire retry was refused: {error}"),
        }
    }

    /// Expiry timer: clear ownership, publish the cleared state, cancel
    /// every timer and, with failover enabled, race to re-acquire.
    fn lease_expires(&mut self, handle: TicketHandle) {
        let Some(ticket) = self.core.tickets.get_mut(&handle) else {
            return;
        };
        log::info!(
            "lease expired on ticket [{}], owner was {:?}",
            ticket.name,
            ticket.owner
        );
        ticket.owner = None;
        ticket.expires_at = 0;
        let update = TicketUpdate {
            name: ticket.name.clone(),
            owner: None,
            expires: 0,
            ballot: ticket.acceptor.round,
        };
        self.core.store.notify(&update);
        ticket.cancel_all_timers(&mut self.core.timers);
        let failover = ticket.failover;
        if failover {
            log::debug!("failover: racing to re-acquire the expired ticket");
            if let Err(error) = self.acquire(handle, ClearMode::NotClearRelease, true, None) {
                log::error!("failover re-acquisition failed to start: {error}");
            }
        }
    }
}
