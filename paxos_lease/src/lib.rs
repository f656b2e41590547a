// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! Lease-coordinated tickets for small geographically distributed clusters.
//!
//! A ticket is a named, time-bounded, single-owner resource: at most one
//! site in the cluster holds it at any moment, and ownership is asserted by
//! agreement through a multi-decree Paxos engine rather than by a central
//! authority. This crate provides the per-ticket lease state machine layered
//! on top of such an engine: driving grants and revokes through the protocol
//! phases, scheduling renewal and expiry, reconstructing state after a
//! restart, and arbitrating concurrent proposals with the master-lease rule
//! (an acceptor that still observes a valid lease refuses to promise to a
//! competing proposer).
//!
//! The Paxos engine itself, the message transport and the durable ticket
//! store are collaborators supplied by the embedding application; see the
//! [`paxos`] and [`lease`] modules for their contracts.

pub mod lease;
pub mod paxos;
pub mod session;
pub mod timer;

#[cfg(test)]
pub(crate) mod testkit;

#[macro_use]
extern crate derive_builder;
