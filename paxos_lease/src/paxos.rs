// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Contract between the lease layer and the multi-decree Paxos engine.
//!
//! The engine is supplied by the embedding application. The lease layer
//! consumes it through [`PaxosEngine`] and hands it an [`InstanceObserver`]
//! so the engine can call back into the lease state machines at each
//! protocol step. Headers and values cross this boundary as opaque byte
//! blocks of the lengths fixed in [`SpaceConfig`]; the lease layer owns
//! their layout.

use thiserror::Error;

/// Paxos ballot number for one ticket instance. Monotonically increasing;
/// `0` means no round has been driven yet.
pub type Round = i32;

/// Identity of a cluster member.
pub type SiteId = i32;

/// Longest ticket name, in octets, the engine can carry.
pub const NAME_MAX: usize = 63;

/// Handle to a Paxos space, minted by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SpaceHandle(pub u64);

/// Handle to one ticket's Paxos instance, minted by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstanceHandle(pub u64);

/// Protocol roles a site plays within a space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Roles(u8);

impl Roles {
    /// May initiate proposal rounds.
    pub const PROPOSER: Roles = Roles(0b001);
    /// Takes part in promise/accept quorums.
    pub const ACCEPTOR: Roles = Roles(0b010);
    /// Learns committed values without voting.
    pub const LEARNER: Roles = Roles(0b100);
    /// All three roles.
    pub const ALL: Roles = Roles(0b111);

    /// Whether every role in `other` is present in `self`.
    #[must_use]
    pub fn contains(self, other: Roles) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Roles {
    type Output = Roles;

    fn bitor(self, rhs: Roles) -> Roles {
        Roles(self.0 | rhs.0)
    }
}

/// Parameters for creating a Paxos space.
#[derive(Builder, Clone, Debug)]
#[builder(setter(into))]
pub struct SpaceConfig {
    /// Name of the space.
    pub name: String,
    /// Number of sites in the cluster; quorums are majorities of this.
    pub node_count: u32,
    /// Octets of lease header carried alongside each protocol message.
    pub header_len: usize,
    /// Octets of the opaque value agreed on per round.
    pub value_len: usize,
    /// Roles played by each site, indexed by site id.
    pub roles: Vec<Roles>,
}

/// Unicast/broadcast delivery to cluster peers, supplied by the embedding
/// application and consumed by engine implementations.
pub trait Transport {
    /// Deliver `buf` to a single peer.
    fn send(&mut self, peer: SiteId, buf: &[u8]) -> Result<(), EngineError>;
    /// Deliver `buf` to every site in the cluster, the sender included.
    fn broadcast(&mut self, buf: &[u8]) -> Result<(), EngineError>;
}

/// Represents an error reported by a Paxos engine.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct EngineError(#[from] EngineErrorKind);

impl EngineError {
    /// Returns the [`EngineErrorKind`] of the error.
    #[must_use]
    pub fn kind(&self) -> &EngineErrorKind {
        &self.0
    }
}

/// Represents the kinds of errors a Paxos engine reports.
#[derive(Debug, Error)]
pub enum EngineErrorKind {
    /// The space could not be created.
    #[error("failed to initialize paxos space: {0}")]
    SpaceInit(String),
    /// The per-ticket instance could not be created.
    #[error("failed to initialize paxos instance: {0}")]
    InstanceInit(String),
    /// No instance is registered for the given handle.
    #[error("unknown paxos instance {0}")]
    UnknownInstance(u64),
    /// The engine declined to start or continue a round.
    #[error("round request refused: {0}")]
    RequestRefused(String),
    /// Catch-up could not reconstruct the instance state.
    #[error("catch-up failed: {0}")]
    Catchup(String),
    /// The underlying transport failed.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Refusal returned by an [`InstanceObserver`] callback.
///
/// The engine logs the refusal and treats the triggering message as a drop;
/// no observer state was mutated except where the variant says otherwise.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallbackError {
    /// No ticket is registered for the instance.
    #[error("no ticket registered for paxos instance {0}")]
    UnknownInstance(u64),
    /// The message addresses a round other than the one this role is
    /// tracking.
    #[error("round {got} does not match the tracked round {want}")]
    StaleRound {
        /// Round carried by the message.
        got: Round,
        /// Round the role is tracking.
        want: Round,
    },
    /// Master-lease refusal: a live holder's acceptor silently drops the
    /// competing proposal.
    #[error("proposal collided with a live lease")]
    Collision,
    /// No value was recorded for the round being committed.
    #[error("no value recorded for the round")]
    MissingValue,
    /// The header or value bytes do not parse.
    #[error("malformed lease header or value")]
    Malformed,
    /// The durable store could not answer a catch-up query.
    #[error("no committed ticket state reachable during catch-up")]
    CatchupMissing,
}

/// Callbacks the engine drives into the lease layer, one per protocol step.
///
/// Proposer-side callbacks ([`propose`](Self::propose),
/// [`commit`](Self::commit)) reject rounds other than the proposer round;
/// acceptor-side callbacks ([`accepted`](Self::accepted),
/// [`learned`](Self::learned)) track the acceptor round.
pub trait InstanceObserver {
    /// Fill the outgoing header for a new round's prepare message.
    fn prepare(&mut self, instance: InstanceHandle, header: &mut [u8]) -> Result<(), CallbackError>;

    /// Acceptor-side pre-check on an incoming prepare; `Ok(false)` drops the
    /// message before the promise decision.
    fn is_prepared(&mut self, instance: InstanceHandle, header: &[u8])
    -> Result<bool, CallbackError>;

    /// Acceptor-side promise decision; updates the reply header in place.
    fn promise(&mut self, instance: InstanceHandle, header: &mut [u8]) -> Result<(), CallbackError>;

    /// Proposer enters the accept phase for `round` with `value`.
    fn propose(
        &mut self,
        instance: InstanceHandle,
        header: &[u8],
        round: Round,
        value: &[u8],
    ) -> Result<(), CallbackError>;

    /// Acceptor accepted `value` in `round`.
    fn accepted(
        &mut self,
        instance: InstanceHandle,
        header: &[u8],
        round: Round,
        value: &[u8],
    ) -> Result<(), CallbackError>;

    /// Proposer-side commit after an accept quorum for `round`.
    fn commit(
        &mut self,
        instance: InstanceHandle,
        header: &[u8],
        round: Round,
    ) -> Result<(), CallbackError>;

    /// Acceptor/learner-side notification that `round` committed.
    fn learned(
        &mut self,
        instance: InstanceHandle,
        header: &[u8],
        round: Round,
    ) -> Result<(), CallbackError>;

    /// Reconstruct the instance's lease state during engine recovery.
    fn catchup(&mut self, instance: InstanceHandle) -> Result<(), CallbackError>;

    /// A round this site initiated ran to completion; `result` is `0` on
    /// success, negative on failure.
    fn round_finished(&mut self, instance: InstanceHandle, round: Round, result: i32);
}

/// The multi-decree Paxos engine the lease layer drives.
///
/// Entry points that can re-enter the lease layer take the observer
/// explicitly; the engine must invoke the observer's callbacks synchronously
/// on the calling thread.
pub trait PaxosEngine {
    /// Create a Paxos space.
    fn space_init(&mut self, config: &SpaceConfig) -> Result<SpaceHandle, EngineError>;

    /// Create the per-ticket instance inside `space`.
    fn instance_init(
        &mut self,
        space: SpaceHandle,
        name: &[u8],
        priorities: &[i32],
    ) -> Result<InstanceHandle, EngineError>;

    /// Start a new proposal round for `value`.
    ///
    /// `acceptor_round` carries the highest ballot the caller has accepted;
    /// the engine picks a higher round, writes back any higher ballot it
    /// knows of, and returns the round it started.
    fn round_request(
        &mut self,
        observer: &mut dyn InstanceObserver,
        instance: InstanceHandle,
        value: &[u8],
        acceptor_round: &mut Round,
    ) -> Result<Round, EngineError>;

    /// Drive an accept phase for `round` without a new prepare phase.
    ///
    /// Only meaningful for the site whose lease is being extended: the
    /// master-lease rule would refuse the prepare of any other proposer.
    /// `round` must be ahead of every round the engine has seen for the
    /// instance.
    fn propose(
        &mut self,
        observer: &mut dyn InstanceObserver,
        instance: InstanceHandle,
        value: &[u8],
        round: Round,
    ) -> Result<(), EngineError>;

    /// Run catch-up for the instance, driving
    /// [`InstanceObserver::catchup`].
    fn catchup(
        &mut self,
        observer: &mut dyn InstanceObserver,
        instance: InstanceHandle,
    ) -> Result<(), EngineError>;

    /// Whether the instance is still recovering after a restart.
    fn recovering(&self, instance: InstanceHandle) -> bool;

    /// Mark the instance as recovering or recovered.
    fn set_recovering(&mut self, instance: InstanceHandle, recovering: bool);

    /// Dispatch an incoming protocol message.
    fn recvmsg(
        &mut self,
        observer: &mut dyn InstanceObserver,
        buf: &[u8],
    ) -> Result<(), EngineError>;
}
