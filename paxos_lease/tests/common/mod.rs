// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-process cluster harness: a deterministic Paxos engine driving the
//! lease callbacks over a loopback bus, a hand-driven clock and a recording
//! store. Messages are delivered FIFO through `LeaseManager::on_receive`,
//! exactly as a transport sidecar would.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut};
use paxos_lease::lease::wire::{HEADER_LEN, LeaseOp, MessageHeader, VALUE_LEN};
use paxos_lease::lease::{
    CatchupState, ClearMode, Error, ErrorKind, LeaseManager, ManagerOptionsBuilder,
    TicketConfigBuilder, TicketHandle, TicketName, TicketStore, TicketUpdate,
};
use paxos_lease::paxos::{
    EngineError, EngineErrorKind, InstanceHandle, InstanceObserver, PaxosEngine, Roles, Round,
    SiteId, SpaceConfig, SpaceHandle, Transport,
};
use paxos_lease::timer::Clock;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Wall clock driven by hand, shared by every site.
#[derive(Clone, Debug)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self(Arc::new(AtomicU64::new(now)))
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Store recording notifications and answering catch-up from a canned state.
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

/// Pending deliveries, FIFO. Destination site ids are expanded at send time.
pub struct BusState {
    pub queue: VecDeque<(SiteId, Vec<u8>)>,
    pub sites: Vec<SiteId>,
}

/// Loopback [`Transport`]; broadcast reaches every site, the sender
/// included.
pub struct BusTransport {
    bus: Rc<RefCell<BusState>>,
}

impl Transport for BusTransport {
    fn send(&mut self, peer: SiteId, buf: &[u8]) -> Result<(), EngineError> {
        self.bus.borrow_mut().queue.push_back((peer, buf.to_vec()));
        Ok(())
    }

    fn broadcast(&mut self, buf: &[u8]) -> Result<(), EngineError> {
        let mut bus = self.bus.borrow_mut();
        let sites = bus.sites.clone();
        for site in sites {
            bus.queue.push_back((site, buf.to_vec()));
        }
        Ok(())
    }
}

const MSG_PREPARE: u8 = 1;
const MSG_PROMISE: u8 = 2;
const MSG_ACCEPT: u8 = 3;
const MSG_ACCEPTED: u8 = 4;
const MSG_LEARN: u8 = 5;

struct Msg {
    kind: u8,
    from: SiteId,
    round: Round,
    name: Vec<u8>,
    header: [u8; HEADER_LEN],
    value: Vec<u8>,
}

fn encode_msg(
    kind: u8,
    from: SiteId,
    round: Round,
    name: &[u8],
    header: &[u8; HEADER_LEN],
    value: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(11 + name.len() + HEADER_LEN + VALUE_LEN);
    buf.put_u8(kind);
    buf.put_i32(from);
    buf.put_i32(round);
    buf.put_u16(u16::try_from(name.len()).unwrap());
    buf.put_slice(name);
    buf.put_slice(header);
    let mut padded = [0u8; VALUE_LEN];
    let len = value.len().min(VALUE_LEN);
    padded[..len].copy_from_slice(&value[..len]);
    buf.put_slice(&padded);
    buf
}

fn decode_msg(mut buf: &[u8]) -> Option<Msg> {
    if buf.len() < 11 {
        return None;
    }
    let kind = buf.get_u8();
    let from = buf.get_i32();
    let round = buf.get_i32();
    let name_len = buf.get_u16() as usize;
    if buf.len() < name_len + HEADER_LEN + VALUE_LEN {
        return None;
    }
    let name = buf[..name_len].to_vec();
    buf.advance(name_len);
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&buf[..HEADER_LEN]);
    buf.advance(HEADER_LEN);
    let value = buf[..VALUE_LEN].to_vec();
    Some(Msg {
        kind,
        from,
        round,
        name,
        header,
        value,
    })
}

struct Proposal {
    round: Round,
    header: [u8; HEADER_LEN],
    value: Vec<u8>,
    promises: u32,
    accepts: u32,
    proposed: bool,
    committed: bool,
}

struct InstanceState {
    name: Vec<u8>,
    /// Highest round seen anywhere for this instance.
    highest: Round,
    /// Highest round this acceptor promised or accepted.
    promised: Round,
    proposal: Option<Proposal>,
}

/// Single-decree, re-runnable-round Paxos over the loopback bus. Acceptors
/// refuse prepares at or below their promised round and accepts below it;
/// the commit is learned by every other site.
pub struct ClusterEngine {
    site: SiteId,
    transport: BusTransport,
    node_count: u32,
    instances: HashMap<u64, InstanceState>,
    names: HashMap<Vec<u8>, u64>,
    next_instance: u64,
    recovering: Rc<RefCell<HashSet<u64>>>,
}

impl ClusterEngine {
    pub fn new(site: SiteId, bus: Rc<RefCell<BusState>>) -> Self {
        Self {
            site,
            transport: BusTransport { bus },
            node_count: 0,
            instances: HashMap::new(),
            names: HashMap::new(),
            next_instance: 1,
            recovering: Rc::new(RefCell::new(HashSet::new())),
        }
    }

    /// Shared handle to the recovering-instances set, for simulating a
    /// restart from outside the engine.
    pub fn recovering_handle(&self) -> Rc<RefCell<HashSet<u64>>> {
        self.recovering.clone()
    }

    fn quorum(&self) -> u32 {
        self.node_count / 2 + 1
    }

    fn refused(error: paxos_lease::paxos::CallbackError) -> EngineError {
        EngineErrorKind::RequestRefused(error.to_string()).into()
    }
}

impl PaxosEngine for ClusterEngine {
    fn space_init(&mut self, config: &SpaceConfig) -> Result<SpaceHandle, EngineError> {
        assert_eq!(config.header_len, HEADER_LEN);
        assert_eq!(config.value_len, VALUE_LEN);
        self.node_count = config.node_count;
        Ok(SpaceHandle(1))
    }

    fn instance_init(
        &mut self,
        _space: SpaceHandle,
        name: &[u8],
        _priorities: &[i32],
    ) -> Result<InstanceHandle, EngineError> {
        let id = self.next_instance;
        self.next_instance += 1;
        self.instances.insert(
            id,
            InstanceState {
                name: name.to_vec(),
                highest: 0,
                promised: 0,
                proposal: None,
            },
        );
        self.names.insert(name.to_vec(), id);
        Ok(InstanceHandle(id))
    }

    fn round_request(
        &mut self,
        observer: &mut dyn InstanceObserver,
        instance: InstanceHandle,
        value: &[u8],
        acceptor_round: &mut Round,
    ) -> Result<Round, EngineError> {
        let Some(state) = self.instances.get_mut(&instance.0) else {
            return Err(EngineErrorKind::UnknownInstance(instance.0).into());
        };
        let round = state.highest.max(*acceptor_round) + 1;
        state.highest = round;
        let mut header = [0u8; HEADER_LEN];
        observer
            .prepare(instance, &mut header)
            .map_err(Self::refused)?;
        let name = state.name.clone();
        state.proposal = Some(Proposal {
            round,
            header,
            value: value.to_vec(),
            promises: 0,
            accepts: 0,
            proposed: false,
            committed: false,
        });
        let msg = encode_msg(MSG_PREPARE, self.site, round, &name, &header, value);
        self.transport.broadcast(&msg)?;
        Ok(round)
    }

    fn propose(
        &mut self,
        observer: &mut dyn InstanceObserver,
        instance: InstanceHandle,
        value: &[u8],
        round: Round,
    ) -> Result<(), EngineError> {
        let Some(state) = self.instances.get_mut(&instance.0) else {
            return Err(EngineErrorKind::UnknownInstance(instance.0).into());
        };
        if round <= state.promised {
            return Err(
                EngineErrorKind::RequestRefused(format!("round {round} is no longer ahead")).into(),
            );
        }
        state.highest = state.highest.max(round);
        // The accept phase of a renewal runs under the master lease; no
        // prepare is sent, so synthesize the header a prepare would carry.
        let mut header = [0u8; HEADER_LEN];
        assert!(
            MessageHeader {
                op: LeaseOp::Start,
                clear: ClearMode::NotClearRelease,
                leased: false,
            }
            .encode(&mut header)
        );
        observer
            .propose(instance, &header, round, value)
            .map_err(Self::refused)?;
        let name = state.name.clone();
        state.proposal = Some(Proposal {
            round,
            header,
            value: value.to_vec(),
            promises: 0,
            accepts: 0,
            proposed: true,
            committed: false,
        });
        let msg = encode_msg(MSG_ACCEPT, self.site, round, &name, &header, value);
        self.transport.broadcast(&msg)?;
        Ok(())
    }

    fn catchup(
        &mut self,
        observer: &mut dyn InstanceObserver,
        instance: InstanceHandle,
    ) -> Result<(), EngineError> {
        observer
            .catchup(instance)
            .map_err(|error| EngineErrorKind::Catchup(error.to_string()).into())
    }

    fn recovering(&self, instance: InstanceHandle) -> bool {
        self.recovering.borrow().contains(&instance.0)
    }

    fn set_recovering(&mut self, instance: InstanceHandle, recovering: bool) {
        if recovering {
            self.recovering.borrow_mut().insert(instance.0);
        } else {
            self.recovering.borrow_mut().remove(&instance.0);
        }
    }

    fn recvmsg(
        &mut self,
        observer: &mut dyn InstanceObserver,
        buf: &[u8],
    ) -> Result<(), EngineError> {
        let Some(msg) = decode_msg(buf) else {
            return Err(EngineErrorKind::Transport("malformed message".into()).into());
        };
        let Some(&id) = self.names.get(&msg.name) else {
            return Err(EngineErrorKind::Transport("unknown ticket name".into()).into());
        };
        let pih = InstanceHandle(id);
        let quorum = self.quorum();
        let my_site = self.site;
        let peers: Vec<SiteId> = (1..=i32::try_from(self.node_count).unwrap())
            .filter(|&site| site != my_site)
            .collect();
        let state = self.instances.get_mut(&id).unwrap();
        state.highest = state.highest.max(msg.round);
        match msg.kind {
            MSG_PREPARE => {
                if msg.round <= state.promised {
                    return Ok(());
                }
                let mut header = msg.header;
                match observer.is_prepared(pih, &header) {
                    Ok(true) => {}
                    Ok(false) | Err(_) => return Ok(()),
                }
                if observer.promise(pih, &mut header).is_err() {
                    // Refusals (the master-lease collision included) are
                    // silent: no reply reaches the proposer.
                    return Ok(());
                }
                state.promised = msg.round;
                let reply = encode_msg(MSG_PROMISE, my_site, msg.round, &msg.name, &header, &[]);
                self.transport.send(msg.from, &reply)?;
            }
            MSG_PROMISE => {
                let name = state.name.clone();
                let Some(proposal) = state.proposal.as_mut() else {
                    return Ok(());
                };
                if proposal.round != msg.round || proposal.committed {
                    return Ok(());
                }
                proposal.promises += 1;
                if proposal.promises >= quorum && !proposal.proposed {
                    proposal.proposed = true;
                    let header = proposal.header;
                    let value = proposal.value.clone();
                    if observer.propose(pih, &header, msg.round, &value).is_err() {
                        return Ok(());
                    }
                    let accept = encode_msg(MSG_ACCEPT, my_site, msg.round, &name, &header, &value);
                    self.transport.broadcast(&accept)?;
                }
            }
            MSG_ACCEPT => {
                if msg.round < state.promised {
                    return Ok(());
                }
                state.promised = msg.round;
                if observer
                    .accepted(pih, &msg.header, msg.round, &msg.value)
                    .is_err()
                {
                    return Ok(());
                }
                let reply =
                    encode_msg(MSG_ACCEPTED, my_site, msg.round, &msg.name, &msg.header, &[]);
                self.transport.send(msg.from, &reply)?;
            }
            MSG_ACCEPTED => {
                let name = state.name.clone();
                let Some(proposal) = state.proposal.as_mut() else {
                    return Ok(());
                };
                if proposal.round != msg.round || proposal.committed {
                    return Ok(());
                }
                proposal.accepts += 1;
                if proposal.accepts >= quorum {
                    proposal.committed = true;
                    let header = proposal.header;
                    if observer.commit(pih, &header, msg.round).is_err() {
                        return Ok(());
                    }
                    for site in peers {
                        let learn = encode_msg(MSG_LEARN, my_site, msg.round, &name, &header, &[]);
                        self.transport.send(site, &learn)?;
                    }
                    observer.round_finished(pih, msg.round, 0);
                }
            }
            MSG_LEARN => {
                let _ = observer.learned(pih, &msg.header, msg.round);
            }
            _ => {
                return Err(EngineErrorKind::Transport("unknown message kind".into()).into());
            }
        }
        Ok(())
    }
}

pub type SiteManager = LeaseManager<ClusterEngine, RecordingStore, ManualClock>;

pub struct Site {
    pub id: SiteId,
    pub manager: SiteManager,
    pub store: RecordingStore,
    pub recovering: Rc<RefCell<HashSet<u64>>>,
}

/// A cluster of lease managers wired through the loopback bus.
pub struct Cluster {
    pub bus: Rc<RefCell<BusState>>,
    pub clock: ManualClock,
    pub sites: Vec<Site>,
    pub down: HashSet<SiteId>,
}

impl Cluster {
    /// Build `n` sites with ids `1..=n`, all playing every role. The clock
    /// starts at 1000 so aged-out arithmetic never underflows.
    pub fn new(n: u32) -> Self {
        init_logging();
        let bus = Rc::new(RefCell::new(BusState {
            queue: VecDeque::new(),
            sites: (1..=i32::try_from(n).unwrap()).collect(),
        }));
        let clock = ManualClock::new(1_000);
        let mut sites = Vec::new();
        for id in 1..=i32::try_from(n).unwrap() {
            let engine = ClusterEngine::new(id, bus.clone());
            let recovering = engine.recovering_handle();
            let store = RecordingStore::new();
            let options = ManagerOptionsBuilder::default()
                .site_id(id)
                .cluster_size(n)
                .roles(vec![Roles::ALL; n as usize])
                .build()
                .unwrap();
            let manager =
                LeaseManager::new_with_clock(options, engine, store.clone(), clock.clone())
                    .unwrap();
            sites.push(Site {
                id,
                manager,
                store,
                recovering,
            });
        }
        Cluster {
            bus,
            clock,
            sites,
            down: HashSet::new(),
        }
    }

    pub fn site(&self, id: SiteId) -> &Site {
        self.sites.iter().find(|site| site.id == id).unwrap()
    }

    pub fn site_mut(&mut self, id: SiteId) -> &mut Site {
        self.sites.iter_mut().find(|site| site.id == id).unwrap()
    }

    /// Register the same ticket on every site; returns the handles in site
    /// id order.
    pub fn add_ticket_everywhere(
        &mut self,
        name: &str,
        expiry_secs: u64,
        failover: bool,
    ) -> Vec<TicketHandle> {
        self.sites
            .iter_mut()
            .map(|site| {
                site.manager
                    .add_ticket(
                        TicketConfigBuilder::default()
                            .name(name)
                            .expiry(Duration::from_secs(expiry_secs))
                            .failover(failover)
                            .build()
                            .unwrap(),
                    )
                    .unwrap()
            })
            .collect()
    }

    /// Deliver every queued message, FIFO, skipping down sites.
    pub fn pump(&mut self) {
        loop {
            let next = self.bus.borrow_mut().queue.pop_front();
            let Some((dest, buf)) = next else { break };
            if self.down.contains(&dest) {
                continue;
            }
            self.site_mut(dest).manager.on_receive(&buf).unwrap();
        }
    }

    /// Advance the shared clock, then fire timers and deliver messages
    /// until the cluster is quiescent at the new time.
    pub fn advance(&mut self, secs: u64) {
        self.clock.advance(secs);
        self.settle();
    }

    pub fn settle(&mut self) {
        loop {
            let down = self.down.clone();
            for site in &mut self.sites {
                if !down.contains(&site.id) {
                    site.manager.tick();
                }
            }
            self.pump();
            let now = self.clock.now();
            let down = self.down.clone();
            let any_due = self.sites.iter_mut().any(|site| {
                !down.contains(&site.id)
                    && site
                        .manager
                        .next_deadline()
                        .is_some_and(|deadline| deadline <= now)
            });
            if !any_due {
                break;
            }
        }
    }
}
