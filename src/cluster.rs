//! Topology controller: owns the agents of one cluster and the sessions
//! between them, and routes the messages the agents emit.
//!
//! Sessions are created by [`Cluster::connect`] and torn down by
//! [`Cluster::disconnect`]. Disconnecting a concentrator also disconnects its
//! children, since they can no longer reach the root; [`Cluster::reconcile`]
//! re-wires every agent whose desired parent is reachable again.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::agents::{
    AgentEndpoint, Auctioneer, Concentrator, DeviceAgent, MatcherEndpoint, Outbound,
};
use crate::bid::Bid;
use crate::config::{AgentConfig, AgentRole};
use crate::error::{MatcherError, Result};
use crate::events::{EventLog, EventType};
use crate::price::PriceUpdate;
use crate::session::{Session, SharedSession, lock_session};
use crate::transform::{Identity, PriceTransform};
use crate::types::{AgentId, ClusterId, SessionId};

#[derive(Debug, Clone)]
pub enum Node {
    Auctioneer(Arc<Auctioneer>),
    Concentrator(Arc<Concentrator>),
    Device(Arc<DeviceAgent>),
}

impl Node {
    pub fn as_agent(&self) -> Option<&dyn AgentEndpoint> {
        match self {
            Node::Auctioneer(_) => None,
            Node::Concentrator(c) => Some(c.as_ref()),
            Node::Device(d) => Some(d.as_ref()),
        }
    }

    pub fn as_matcher(&self) -> Option<&dyn MatcherEndpoint> {
        match self {
            Node::Auctioneer(a) => Some(a.as_ref()),
            Node::Concentrator(c) => Some(c.as_ref()),
            Node::Device(_) => None,
        }
    }

    pub fn role_name(&self) -> &'static str {
        match self {
            Node::Auctioneer(_) => "auctioneer",
            Node::Concentrator(_) => "concentrator",
            Node::Device(_) => "device",
        }
    }
}

#[derive(Debug, Default)]
struct Topology {
    nodes: BTreeMap<AgentId, Node>,
    desired_parents: BTreeMap<AgentId, AgentId>,
    /// Live upstream session of each connected child.
    sessions: BTreeMap<AgentId, SharedSession>,
    sequence: u64,
}

impl Topology {
    fn children_of(&self, parent_id: &AgentId) -> Vec<AgentId> {
        self.sessions
            .iter()
            .filter(|(_, s)| lock_session(s).parent_id() == parent_id)
            .map(|(child, _)| child.clone())
            .collect()
    }

    fn node(&self, agent_id: &AgentId) -> Result<Node> {
        self.nodes
            .get(agent_id)
            .cloned()
            .ok_or_else(|| MatcherError::UnknownAgent(agent_id.clone()))
    }
}

#[derive(Debug)]
pub struct Cluster {
    cluster_id: ClusterId,
    events: EventLog,
    topology: RwLock<Topology>,
}

impl Cluster {
    pub fn new(cluster_id: ClusterId) -> Self {
        Self::with_events(cluster_id, EventLog::new())
    }

    pub fn with_events(cluster_id: ClusterId, events: EventLog) -> Self {
        Self {
            cluster_id,
            events,
            topology: RwLock::new(Topology::default()),
        }
    }

    /// Builds a cluster from agent configurations and connects everything
    /// that can be connected.
    pub fn from_configs(
        cluster_id: ClusterId,
        configs: &[AgentConfig],
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let cluster = Self::new(cluster_id);
        for config in configs {
            cluster.add_agent(config)?;
        }
        cluster.reconcile(now);
        Ok(cluster)
    }

    fn read(&self) -> RwLockReadGuard<'_, Topology> {
        self.topology.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Topology> {
        self.topology.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Registers an agent. It is not connected until `connect` or `reconcile`.
    pub fn add_agent(&self, config: &AgentConfig) -> Result<()> {
        let mut topology = self.write();
        if topology.nodes.contains_key(&config.agent_id) {
            return Err(MatcherError::DuplicateAgent(config.agent_id.clone()));
        }

        let agent_id = config.agent_id.clone();
        let interval = config.min_time_between_updates();
        let node = match &config.role {
            AgentRole::Auctioneer { market_basis, .. } => {
                market_basis.validate()?;
                Node::Auctioneer(Arc::new(Auctioneer::new(
                    agent_id.clone(),
                    self.cluster_id.clone(),
                    self.events.clone(),
                    market_basis.clone(),
                    interval,
                )))
            }
            AgentRole::Concentrator { peak_shaving, .. } => {
                let transform: Box<dyn PriceTransform> = match peak_shaving {
                    Some(shaving) => Box::new(shaving.build()?),
                    None => Box::new(Identity),
                };
                Node::Concentrator(Arc::new(Concentrator::new(
                    agent_id.clone(),
                    self.cluster_id.clone(),
                    self.events.clone(),
                    transform,
                    interval,
                )))
            }
            AgentRole::Device {} => Node::Device(Arc::new(DeviceAgent::new(
                agent_id.clone(),
                self.cluster_id.clone(),
                self.events.clone(),
            ))),
        };

        log::debug!("added {} {}", node.role_name(), agent_id);
        if let Some(parent) = &config.desired_parent_id {
            topology
                .desired_parents
                .insert(agent_id.clone(), parent.clone());
        }
        topology.nodes.insert(agent_id, node);
        Ok(())
    }

    /// Changes the parent an agent connects to on the next `connect`.
    pub fn set_desired_parent(&self, agent_id: &AgentId, parent_id: AgentId) -> Result<()> {
        let mut topology = self.write();
        topology.node(agent_id)?;
        topology
            .desired_parents
            .insert(agent_id.clone(), parent_id);
        Ok(())
    }

    /// Opens a new session between `child_id` and its desired parent.
    /// Connecting an already connected child is a no-op.
    pub fn connect(&self, child_id: &AgentId, now: DateTime<Utc>) -> Result<()> {
        let (child, session) = {
            let mut topology = self.write();
            if topology.sessions.contains_key(child_id) {
                return Ok(());
            }
            let child = topology.node(child_id)?;
            let parent_id = topology
                .desired_parents
                .get(child_id)
                .cloned()
                .ok_or_else(|| MatcherError::UnknownAgent(child_id.clone()))?;
            let parent = topology.node(&parent_id)?;
            let (Some(_), Some(matcher)) = (child.as_agent(), parent.as_matcher()) else {
                return Err(MatcherError::UnknownAgent(parent_id));
            };
            let market_basis = matcher
                .market_basis()
                .ok_or_else(|| MatcherError::NotReady(parent_id.clone()))?;

            topology.sequence += 1;
            let session_id = SessionId::new(child_id, &parent_id, topology.sequence);
            let mut session = Session::connect(
                session_id.clone(),
                self.cluster_id.clone(),
                child_id.clone(),
                parent_id,
                self.events.clone(),
            );
            matcher.child_connected(child_id, &session_id, now)?;
            session.accept(market_basis, now)?;

            let session = session.into_shared();
            topology.sessions.insert(child_id.clone(), session.clone());
            (child, session)
        };

        let outbound = match child.as_agent() {
            Some(agent) => agent.connected_upstream(session, now),
            None => Vec::new(),
        };
        self.route(outbound, now);
        Ok(())
    }

    /// Connects every agent whose desired parent is ready, parents first.
    /// Returns the number of sessions opened.
    pub fn reconcile(&self, now: DateTime<Utc>) -> usize {
        let mut opened = 0;
        loop {
            let candidates: Vec<AgentId> = {
                let topology = self.read();
                topology
                    .desired_parents
                    .iter()
                    .filter(|(child, parent)| {
                        !topology.sessions.contains_key(*child)
                            && topology.nodes.contains_key(*child)
                            && topology
                                .nodes
                                .get(*parent)
                                .and_then(|p| p.as_matcher())
                                .is_some_and(|m| m.market_basis().is_some())
                    })
                    .map(|(child, _)| child.clone())
                    .collect()
            };

            let mut progress = false;
            for child in candidates {
                match self.connect(&child, now) {
                    Ok(()) => {
                        opened += 1;
                        progress = true;
                    }
                    Err(e) => log::warn!("could not connect {}: {}", child, e),
                }
            }
            if !progress {
                return opened;
            }
        }
    }

    /// Tears down the upstream session of `child_id`, and recursively the
    /// sessions of its own children. Returns false when it was not connected.
    pub fn disconnect(&self, child_id: &AgentId, now: DateTime<Utc>) -> bool {
        let mut outbound = Vec::new();
        let disconnected = {
            let mut topology = self.write();
            Self::disconnect_subtree(&mut topology, child_id, now, &mut outbound)
        };
        self.route(outbound, now);
        disconnected
    }

    fn disconnect_subtree(
        topology: &mut Topology,
        child_id: &AgentId,
        now: DateTime<Utc>,
        outbound: &mut Vec<Outbound>,
    ) -> bool {
        for grandchild in topology.children_of(child_id) {
            Self::disconnect_subtree(topology, &grandchild, now, outbound);
        }

        let Some(session) = topology.sessions.remove(child_id) else {
            return false;
        };
        let parent_id = {
            let mut session = lock_session(&session);
            // already closed sessions are dropped as they are
            let _ = session.begin_disconnect();
            session.parent_id().clone()
        };
        if let Some(matcher) = topology.nodes.get(&parent_id).and_then(Node::as_matcher) {
            outbound.extend(matcher.child_disconnected(child_id, now));
        }
        lock_session(&session).disconnect(now);
        if let Some(agent) = topology.nodes.get(child_id).and_then(Node::as_agent) {
            agent.disconnected_upstream(now);
        }
        true
    }

    /// Disconnects an agent from its parent and its children and forgets it.
    pub fn remove_agent(&self, agent_id: &AgentId, now: DateTime<Utc>) -> Result<()> {
        let mut outbound = Vec::new();
        {
            let mut topology = self.write();
            topology.node(agent_id)?;
            for child in topology.children_of(agent_id) {
                Self::disconnect_subtree(&mut topology, &child, now, &mut outbound);
            }
            Self::disconnect_subtree(&mut topology, agent_id, now, &mut outbound);
            topology.nodes.remove(agent_id);
            topology.desired_parents.remove(agent_id);
        }
        log::info!("removed agent {}", agent_id);
        self.route(outbound, now);
        Ok(())
    }

    /// A device publishes a new bid.
    pub fn update_bid(&self, device_id: &AgentId, bid: Bid, now: DateTime<Utc>) -> Result<()> {
        let device = self.device(device_id)?;
        let outbound = device.update_bid(bid, now)?;
        self.route(outbound, now);
        Ok(())
    }

    /// Lets every matcher flush rate-limited updates.
    pub fn tick(&self, now: DateTime<Utc>) {
        let nodes: Vec<Node> = self.read().nodes.values().cloned().collect();
        let outbound = nodes
            .iter()
            .filter_map(Node::as_matcher)
            .flat_map(|m| m.tick(now))
            .collect();
        self.route(outbound, now);
    }

    fn route(&self, outbound: Vec<Outbound>, now: DateTime<Utc>) {
        let mut queue: VecDeque<Outbound> = outbound.into();
        while let Some(message) = queue.pop_front() {
            log::trace!("routing {}", message);
            match message {
                Outbound::ForwardBid {
                    from,
                    session_id,
                    update,
                } => {
                    let Some((parent, _)) = self.peer(&from, &session_id) else {
                        log::debug!("dropping bid from {}: session {} gone", from, session_id);
                        continue;
                    };
                    let Some(matcher) = parent.as_matcher() else {
                        continue;
                    };
                    match matcher.submit_bid(&from, &session_id, update, now) {
                        Ok(more) => queue.extend(more),
                        Err(e) => log::debug!("bid from {} not accepted: {}", from, e),
                    }
                }
                Outbound::DeliverPrice {
                    from,
                    to,
                    session_id,
                    update,
                } => {
                    queue.extend(self.deliver_price(&from, &to, &session_id, update, now));
                }
            }
        }
    }

    /// Parent node of `child_id` if `session_id` is still its live session.
    fn peer(&self, child_id: &AgentId, session_id: &SessionId) -> Option<(Node, SharedSession)> {
        let topology = self.read();
        let session = topology.sessions.get(child_id)?.clone();
        let parent_id = {
            let session = lock_session(&session);
            if session.id() != session_id {
                return None;
            }
            session.parent_id().clone()
        };
        let parent = topology.nodes.get(&parent_id)?.clone();
        Some((parent, session))
    }

    /// Hands a price to `to` if `session_id` is still its live session.
    /// A price made for a session that has since closed is reported as
    /// rejected and never reaches the child, even if a newer session has
    /// an outstanding bid with the same number.
    fn deliver_price(
        &self,
        from: &AgentId,
        to: &AgentId,
        session_id: &SessionId,
        update: PriceUpdate,
        now: DateTime<Utc>,
    ) -> Vec<Outbound> {
        let (child, session) = {
            let topology = self.read();
            let child = topology.nodes.get(to).cloned();
            let session = topology
                .sessions
                .get(to)
                .filter(|s| lock_session(s).id() == session_id)
                .cloned();
            match (child, session) {
                (Some(child), Some(session)) => (child, session),
                _ => {
                    self.reject_price(to, session_id, update, now);
                    return Vec::new();
                }
            }
        };

        let accepted = {
            let mut session = lock_session(&session);
            if session.parent_id() != from {
                log::debug!("dropping price from {} for {}: not its parent", from, to);
                return Vec::new();
            }
            session.update_price(update, now)
        };

        match (accepted, child.as_agent()) {
            (Ok(update), Some(agent)) => agent.receive_price(update, now),
            _ => Vec::new(),
        }
    }

    fn reject_price(
        &self,
        to: &AgentId,
        session_id: &SessionId,
        update: PriceUpdate,
        now: DateTime<Utc>,
    ) {
        let reason = MatcherError::SessionClosed(session_id.clone());
        log::warn!("{} rejected {}: {}", to, update, reason);
        self.events.log(
            now,
            &self.cluster_id,
            to,
            Some(session_id),
            EventType::PriceRejected {
                price_update: update,
                reason: reason.to_string(),
            },
        );
    }

    pub fn node(&self, agent_id: &AgentId) -> Result<Node> {
        self.read().node(agent_id)
    }

    pub fn device(&self, agent_id: &AgentId) -> Result<Arc<DeviceAgent>> {
        match self.node(agent_id)? {
            Node::Device(device) => Ok(device),
            _ => Err(MatcherError::UnknownAgent(agent_id.clone())),
        }
    }

    pub fn concentrator(&self, agent_id: &AgentId) -> Result<Arc<Concentrator>> {
        match self.node(agent_id)? {
            Node::Concentrator(concentrator) => Ok(concentrator),
            _ => Err(MatcherError::UnknownAgent(agent_id.clone())),
        }
    }

    pub fn auctioneer(&self) -> Option<Arc<Auctioneer>> {
        self.read().nodes.values().find_map(|node| match node {
            Node::Auctioneer(auctioneer) => Some(auctioneer.clone()),
            _ => None,
        })
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.read().nodes.keys().cloned().collect()
    }

    /// Live upstream session of `child_id`.
    pub fn session(&self, child_id: &AgentId) -> Option<SharedSession> {
        self.read().sessions.get(child_id).cloned()
    }

    pub fn session_id(&self, child_id: &AgentId) -> Option<SessionId> {
        self.session(child_id)
            .map(|session| lock_session(&session).id().clone())
    }

    pub fn is_connected(&self, child_id: &AgentId) -> bool {
        self.read().sessions.contains_key(child_id)
    }

    pub fn children(&self, parent_id: &AgentId) -> Vec<AgentId> {
        self.read().children_of(parent_id)
    }

    /// Last price a device received over its current or a previous session.
    pub fn last_price(&self, device_id: &AgentId) -> Option<PriceUpdate> {
        self.device(device_id).ok().and_then(|d| d.last_price())
    }
}
