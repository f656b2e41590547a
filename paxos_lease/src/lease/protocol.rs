// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The Paxos callback implementations carrying the lease semantics.
//!
//! The engine drives eight callbacks; each resolves the ticket from the
//! instance handle, inspects the operation in the lease header and
//! dispatches to its grant or revoke flavor. Proposer-side callbacks refuse
//! rounds other than the proposer round, acceptor-side callbacks track the
//! acceptor round, and the `promise` grant flavor enforces the master-lease
//! rule: an acceptor that still observes a valid lease drops a competing
//! prepare without replying.

use std::collections::HashMap;
use std::time::Duration;

use crate::lease::manager::{LeaseCore, TicketHandle, TimerEvent, TimerKind};
use crate::lease::ticket::{LeaseAction, LeaseState, Ticket};
use crate::lease::wire::{ClearMode, LeaseOp, LeaseValue, MessageHeader};
use crate::lease::{TicketStore, TicketUpdate};
use crate::paxos::{CallbackError, InstanceHandle, InstanceObserver, Round};
use crate::timer::Clock;

fn lookup(
    tickets: &mut HashMap<TicketHandle, Ticket>,
    instance: InstanceHandle,
) -> Result<(TicketHandle, &mut Ticket), CallbackError> {
    tickets
        .iter_mut()
        .find(|(_, ticket)| ticket.instance == instance)
        .map(|(handle, ticket)| (*handle, ticket))
        .ok_or_else(|| {
            log::error!("could not find the ticket for paxos instance {}", instance.0);
            CallbackError::UnknownInstance(instance.0)
        })
}

fn proposer_round_guard(ticket: &Ticket, round: Round) -> Result<(), CallbackError> {
    if round == ticket.proposer.round {
        return Ok(());
    }
    log::error!(
        "round {round} is not the proposer round {}",
        ticket.proposer.round
    );
    Err(CallbackError::StaleRound {
        got: round,
        want: ticket.proposer.round,
    })
}

fn acceptor_round_guard(ticket: &Ticket, round: Round) -> Result<(), CallbackError> {
    if round == ticket.acceptor.round {
        return Ok(());
    }
    log::error!(
        "round {round} is not the acceptor round {}",
        ticket.acceptor.round
    );
    Err(CallbackError::StaleRound {
        got: round,
        want: ticket.acceptor.round,
    })
}

fn lease_secs(expiry: i32) -> u64 {
    u64::try_from(expiry).unwrap_or(0)
}

impl<S, C> InstanceObserver for LeaseCore<S, C>
where
    S: TicketStore,
    C: Clock,
{
    fn prepare(&mut self, instance: InstanceHandle, header: &mut [u8]) -> Result<(), CallbackError> {
        let (_, ticket) = lookup(&mut self.tickets, instance)?;
        // The pending action only passes arguments into the header; consume
        // it so the next round starts clean.
        let action = ticket.pending.take().unwrap_or(LeaseAction {
            op: LeaseOp::Start,
            clear: ClearMode::ClearRelease,
        });
        let out = MessageHeader {
            op: action.op,
            clear: action.clear,
            leased: false,
        };
        if !out.encode(header) {
            return Err(CallbackError::Malformed);
        }
        Ok(())
    }

    fn is_prepared(
        &mut self,
        instance: InstanceHandle,
        header: &[u8],
    ) -> Result<bool, CallbackError> {
        lookup(&mut self.tickets, instance)?;
        let header = MessageHeader::decode(header).ok_or(CallbackError::Malformed)?;
        match header.op {
            LeaseOp::Stop => Ok(true),
            LeaseOp::Start => Ok(!header.leased),
        }
    }

    fn promise(&mut self, instance: InstanceHandle, header: &mut [u8]) -> Result<(), CallbackError> {
        let (_, ticket) = lookup(&mut self.tickets, instance)?;
        let mut reply = MessageHeader::decode(header).ok_or(CallbackError::Malformed)?;
        match reply.op {
            // A revoke is always promised; the lookup above was the check.
            LeaseOp::Stop => Ok(()),
            LeaseOp::Start => {
                if reply.clear == ClearMode::NotClearRelease
                    && ticket.release_state == LeaseState::Stopped
                {
                    log::debug!("ticket [{}] remembers a release", ticket.name);
                    reply.leased = true;
                } else if ticket.owner.is_none() {
                    log::debug!("ticket [{}] has not been leased", ticket.name);
                    reply.leased = false;
                } else {
                    log::debug!("ticket [{}] has been leased", ticket.name);
                    reply.leased = true;
                }
                if !reply.encode(header) {
                    return Err(CallbackError::Malformed);
                }
                if reply.leased {
                    // Master lease: drop the competing prepare, no reply.
                    log::error!("the proposal collided");
                    return Err(CallbackError::Collision);
                }
                Ok(())
            }
        }
    }

    fn propose(
        &mut self,
        instance: InstanceHandle,
        header: &[u8],
        round: Round,
        value: &[u8],
    ) -> Result<(), CallbackError> {
        let now = self.clock.now();
        let (handle, ticket) = lookup(&mut self.tickets, instance)?;
        let header = MessageHeader::decode(header).ok_or(CallbackError::Malformed)?;
        proposer_round_guard(ticket, round)?;
        let value = LeaseValue::decode(value).ok_or(CallbackError::Malformed)?;
        ticket.proposer.value = Some(value);
        match header.op {
            LeaseOp::Start => {
                if let Some(old) = ticket.proposer_timers.renew.take() {
                    self.timers.cancel(old);
                }
                let (deadline, kind) = if ticket.renew {
                    (now + ticket.renew_after(), TimerKind::Renew)
                } else {
                    (now + ticket.expiry.as_secs(), TimerKind::Expire)
                };
                ticket.proposer_timers.renew = Some(self.timers.arm(
                    deadline,
                    TimerEvent {
                        ticket: handle,
                        kind,
                    },
                ));
                ticket.proposer.expires = deadline;
                Ok(())
            }
            // Release takes effect at commit; no timer change here.
            LeaseOp::Stop => Ok(()),
        }
    }

    fn accepted(
        &mut self,
        instance: InstanceHandle,
        header: &[u8],
        round: Round,
        value: &[u8],
    ) -> Result<(), CallbackError> {
        let now = self.clock.now();
        let (handle, ticket) = lookup(&mut self.tickets, instance)?;
        let header = MessageHeader::decode(header).ok_or(CallbackError::Malformed)?;
        ticket.acceptor.round = round;
        match header.op {
            LeaseOp::Start => {
                if header.clear == ClearMode::NotClearRelease
                    && ticket.release_state == LeaseState::Stopped
                {
                    log::debug!("ticket [{}] remembers a release", ticket.name);
                    return Err(CallbackError::Collision);
                }
                let value = LeaseValue::decode(value).ok_or(CallbackError::Malformed)?;
                ticket.acceptor.value = Some(value);
                // Arm a tentative expiry without destroying the still-valid
                // expiry of the previously committed lease.
                if let Some(old) = ticket.acceptor_timers.new.take() {
                    self.timers.cancel(old);
                }
                let deadline = now + ticket.expiry.as_secs();
                ticket.acceptor_timers.new = Some(self.timers.arm(
                    deadline,
                    TimerEvent {
                        ticket: handle,
                        kind: TimerKind::Expire,
                    },
                ));
                ticket.acceptor.expires = deadline;
                Ok(())
            }
            LeaseOp::Stop => {
                let value = LeaseValue::decode(value).ok_or(CallbackError::Malformed)?;
                ticket.acceptor.value = Some(value);
                Ok(())
            }
        }
    }

    fn commit(
        &mut self,
        instance: InstanceHandle,
        header: &[u8],
        round: Round,
    ) -> Result<(), CallbackError> {
        let now = self.clock.now();
        let (_, ticket) = lookup(&mut self.tickets, instance)?;
        let header = MessageHeader::decode(header).ok_or(CallbackError::Malformed)?;
        proposer_round_guard(ticket, round)?;
        match header.op {
            LeaseOp::Start => {
                let Some(value) = ticket.proposer.value.clone() else {
                    return Err(CallbackError::MissingValue);
                };
                ticket.release_state = LeaseState::Started;
                ticket.owner = value.owner;
                ticket.expiry = Duration::from_secs(lease_secs(value.expiry));
                ticket.promote_acceptor_timer(&mut self.timers);
                ticket.expires_at = now + lease_secs(value.expiry);
                let update = TicketUpdate {
                    name: ticket.name.clone(),
                    owner: value.owner,
                    expires: ticket.expires_at,
                    ballot: round,
                };
                self.store.notify(&update);
                Ok(())
            }
            LeaseOp::Stop => {
                ticket.cancel_all_timers(&mut self.timers);
                ticket.release_state = LeaseState::Stopped;
                ticket.owner = None;
                ticket.expires_at = 0;
                let update = TicketUpdate {
                    name: ticket.name.clone(),
                    owner: None,
                    expires: 0,
                    ballot: round,
                };
                self.store.notify(&update);
                Ok(())
            }
        }
    }

    fn learned(
        &mut self,
        instance: InstanceHandle,
        header: &[u8],
        round: Round,
    ) -> Result<(), CallbackError> {
        let now = self.clock.now();
        let (_, ticket) = lookup(&mut self.tickets, instance)?;
        let header = MessageHeader::decode(header).ok_or(CallbackError::Malformed)?;
        acceptor_round_guard(ticket, round)?;
        let Some(value) = ticket.acceptor.value.clone() else {
            return Err(CallbackError::MissingValue);
        };
        match header.op {
            LeaseOp::Start => {
                ticket.release_state = LeaseState::Started;
                ticket.owner = value.owner;
                ticket.expiry = Duration::from_secs(lease_secs(value.expiry));
                ticket.promote_acceptor_timer(&mut self.timers);
                ticket.expires_at = now + lease_secs(value.expiry);
                let update = TicketUpdate {
                    name: ticket.name.clone(),
                    owner: value.owner,
                    expires: ticket.expires_at,
                    ballot: round,
                };
                self.store.notify(&update);
                Ok(())
            }
            LeaseOp::Stop => {
                // The lease is gone; only the acceptor-side expiries are
                // ours to cancel here.
                ticket.cancel_acceptor_timers(&mut self.timers);
                ticket.release_state = LeaseState::Stopped;
                ticket.owner = None;
                ticket.expires_at = 0;
                let update = TicketUpdate {
                    name: ticket.name.clone(),
                    owner: None,
                    expires: 0,
                    ballot: round,
                };
                self.store.notify(&update);
                Ok(())
            }
        }
    }

    fn catchup(&mut self, instance: InstanceHandle) -> Result<(), CallbackError> {
        let now = self.clock.now();
        let site = self.site_id;
        let (handle, ticket) = lookup(&mut self.tickets, instance)?;
        let state = match self.store.catchup(&ticket.name) {
            Ok(state) => state,
            Err(error) => {
                log::error!("catch-up query failed for ticket [{}]: {error}", ticket.name);
                return Err(CallbackError::CatchupMissing);
            }
        };
        log::debug!(
            "catch-up for ticket [{}]: owner {:?}, ballot {}, expires {}",
            ticket.name,
            state.owner,
            state.ballot,
            state.expires
        );
        ticket.owner = state.owner;
        ticket.acceptor.round = state.ballot;
        ticket.expires_at = state.expires;

        let Some(owner) = state.owner else {
            ticket.release_state = LeaseState::Stopped;
            return Ok(());
        };
        // A held ticket must come back as Started so the holder can renew.
        ticket.release_state = LeaseState::Started;

        if now > state.expires {
            // The remembered lease aged out while this site was away.
            ticket.owner = None;
            ticket.expires_at = 0;
            let update = TicketUpdate {
                name: ticket.name.clone(),
                owner: None,
                expires: 0,
                ballot: state.ballot,
            };
            self.store.notify(&update);
            return Ok(());
        }

        if let Some(old) = ticket.acceptor_timers.current.take() {
            self.timers.cancel(old);
        }
        ticket.acceptor_timers.current = Some(self.timers.arm(
            state.expires,
            TimerEvent {
                ticket: handle,
                kind: TimerKind::Expire,
            },
        ));
        ticket.acceptor.expires = state.expires;

        if owner == site {
            // Renew only when the renewal point is still ahead; otherwise
            // the expiry timer fires first and failover re-acquires.
            let renew_at = state.expires.saturating_sub(ticket.renew_margin());
            if now < renew_at {
                if let Some(old) = ticket.proposer_timers.renew.take() {
                    self.timers.cancel(old);
                }
                ticket.proposer_timers.renew = Some(self.timers.arm(
                    renew_at,
                    TimerEvent {
                        ticket: handle,
                        kind: TimerKind::Renew,
                    },
                ));
            }
        }

        ticket.proposer.round = ticket.acceptor.round;
        let update = TicketUpdate {
            name: ticket.name.clone(),
            owner: Some(owner),
            expires: state.expires,
            ballot: state.ballot,
        };
        self.store.notify(&update);
        Ok(())
    }

    fn round_finished(&mut self, instance: InstanceHandle, round: Round, result: i32) {
        let Ok((_, ticket)) = lookup(&mut self.tickets, instance) else {
            return;
        };
        if round != ticket.proposer.round {
            log::error!(
                "finished round {round} is not the proposer round {}",
                ticket.proposer.round
            );
            return;
        }
        if let Some(on_done) = ticket.on_completion.as_mut() {
            on_done(round, result);
        }
    }
}
