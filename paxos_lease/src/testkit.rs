// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bespoke fakes shared by the unit tests: a hand-driven clock, a recording
//! store and a recording engine that hands out scripted rounds without
//! driving any protocol phases.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::lease::wire::HEADER_LEN;
use crate::lease::{
    CatchupState, Error, ErrorKind, LeaseManager, ManagerOptionsBuilder, TicketName, TicketStore,
    TicketUpdate,
};
use crate::paxos::{
    EngineError, EngineErrorKind, InstanceHandle, InstanceObserver, PaxosEngine, Roles, Round,
    SiteId, SpaceConfig, SpaceHandle,
};
use crate::timer::Clock;

/// Wall clock driven by hand.
#[derive(Clone, Debug)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self(Arc::new(AtomicU64::new(now)))
    }

    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// One recorded engine entry point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineCall {
    SpaceInit,
    InstanceInit(Vec<u8>),
    RoundRequest { instance: u64, round: Round },
    Propose { instance: u64, round: Round },
    Catchup(u64),
    Recv(usize),
}

/// Records calls and hands out incrementing rounds. `round_request` still
/// drives the `prepare` callback, like a real engine, so the pending action
/// is consumed; nothing else is simulated.
pub struct RecordingEngine {
    pub calls: Vec<EngineCall>,
    pub refuse_rounds: bool,
    next_round: Round,
    next_instance: u64,
    recovering: HashSet<u64>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            refuse_rounds: false,
            next_round: 1,
            next_instance: 1,
            recovering: HashSet::new(),
        }
    }

    pub fn refusing_rounds() -> Self {
        Self {
            refuse_rounds: true,
            ..Self::new()
        }
    }
}

impl PaxosEngine for RecordingEngine {
    fn space_init(&mut self, _config: &SpaceConfig) -> Result<SpaceHandle, EngineError> {
        self.calls.push(EngineCall::SpaceInit);
        Ok(SpaceHandle(1))
    }

    fn instance_init(
        &mut self,
        _space: SpaceHandle,
        name: &[u8],
        _priorities: &[i32],
    ) -> Result<InstanceHandle, EngineError> {
        self.calls.push(EngineCall::InstanceInit(name.to_vec()));
        let instance = InstanceHandle(self.next_instance);
        self.next_instance += 1;
        Ok(instance)
    }

    fn round_request(
        &mut self,
        observer: &mut dyn InstanceObserver,
        instance: InstanceHandle,
        _value: &[u8],
        acceptor_round: &mut Round,
    ) -> Result<Round, EngineError> {
        if self.refuse_rounds {
            return Err(EngineErrorKind::RequestRefused("scripted refusal".into()).into());
        }
        let round = self.next_round.max(*acceptor_round + 1);
        self.next_round = round + 1;
        let mut header = [0u8; HEADER_LEN];
        observer
            .prepare(instance, &mut header)
            .map_err(|error| EngineErrorKind::RequestRefused(error.to_string()))?;
        self.calls.push(EngineCall::RoundRequest {
            instance: instance.0,
            round,
        });
        Ok(round)
    }

    fn propose(
        &mut self,
        _observer: &mut dyn InstanceObserver,
        instance: InstanceHandle,
        _value: &[u8],
        round: Round,
    ) -> Result<(), EngineError> {
        self.calls.push(EngineCall::Propose {
            instance: instance.0,
            round,
        });
        Ok(())
    }

    fn catchup(
        &mut self,
        observer: &mut dyn InstanceObserver,
        instance: InstanceHandle,
    ) -> Result<(), EngineError> {
        self.calls.push(EngineCall::Catchup(instance.0));
        observer
            .catchup(instance)
            .map_err(|error| EngineErrorKind::Catchup(error.to_string()).into())
    }

    fn recovering(&self, instance: InstanceHandle) -> bool {
        self.recovering.contains(&instance.0)
    }

    fn set_recovering(&mut self, instance: InstanceHandle, recovering: bool) {
        if recovering {
            self.recovering.insert(instance.0);
        } else {
            self.recovering.remove(&instance.0);
        }
    }

    fn recvmsg(
        &mut self,
        _observer: &mut dyn InstanceObserver,
        buf: &[u8],
    ) -> Result<(), EngineError> {
        self.calls.push(EngineCall::Recv(buf.len()));
        Ok(())
    }
}

/// Store that records notifications and answers catch-up from a canned
/// state.
#[derive(Clone, Default)]
pub struct RecordingStore {
    updates: Arc<Mutex<Vec<TicketUpdate>>>,
    catchup_state: Arc<Mutex<Option<CatchupState>>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<TicketUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn last_update(&self) -> Option<TicketUpdate> {
        self.updates.lock().unwrap().last().cloned()
    }

    pub fn set_catchup(&self, state: CatchupState) {
        *self.catchup_state.lock().unwrap() = Some(state);
    }
}

impl TicketStore for RecordingStore {
    fn notify(&mut self, update: &TicketUpdate) {
        self.updates.lock().unwrap().push(update.clone());
    }

    fn catchup(&mut self, _name: &TicketName) -> Result<CatchupState, Error> {
        self.catchup_state
            .lock()
            .unwrap()
            .ok_or_else(|| ErrorKind::CatchupMissing.into())
    }
}

/// A manager over a recording engine, a recording store and a manual clock
/// starting at zero.
pub fn manager_for_tests(
    site: SiteId,
    cluster: u32,
) -> (
    LeaseManager<RecordingEngine, RecordingStore, ManualClock>,
    RecordingStore,
) {
    let store = RecordingStore::new();
    let options = ManagerOptionsBuilder::default()
        .site_id(site)
        .cluster_size(cluster)
        .roles(vec![Roles::ALL; cluster as usize])
        .build()
        .unwrap();
    let manager = LeaseManager::new_with_clock(
        options,
        RecordingEngine::new(),
        store.clone(),
        ManualClock::new(0),
    )
    .unwrap();
    (manager, store)
}
