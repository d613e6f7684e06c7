//! The three agent roles of a cluster.
//!
//! Every role is one or both sides of a session:
//! - [`AgentEndpoint`] is the child side: it produces bids and consumes prices.
//! - [`MatcherEndpoint`] is the parent side: it consumes bids and produces prices.
//!
//! A [`DeviceAgent`] is only a child, an [`Auctioneer`] only a parent and a
//! [`Concentrator`] is both. Agents never call each other; they return
//! [`Outbound`] messages that the cluster routes over the sessions.

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::aggregator::{AggregatedBid, Aggregator, SubmitOutcome};
use crate::bid::Bid;
use crate::equilibrium::{self, Equilibrium};
use crate::error::{MatcherError, Result};
use crate::events::{EventLog, EventType};
use crate::market::MarketBasis;
use crate::price::{BidUpdate, Price, PriceUpdate};
use crate::session::{SharedSession, lock_session};
use crate::transform::PriceTransform;
use crate::types::{AgentId, BidNumber, ClusterId, SessionId};

/// A message leaving an agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A numbered bid for the parent of `from`.
    ForwardBid {
        from: AgentId,
        session_id: SessionId,
        update: BidUpdate,
    },
    /// A price for the child `to` of `from`, valid only on `session_id`.
    DeliverPrice {
        from: AgentId,
        to: AgentId,
        session_id: SessionId,
        update: PriceUpdate,
    },
}

/// Child side of a session.
pub trait AgentEndpoint: Send + Sync {
    fn agent_id(&self) -> &AgentId;

    /// The parent accepted the session; `session` is connected.
    fn connected_upstream(&self, session: SharedSession, now: DateTime<Utc>) -> Vec<Outbound>;

    /// The upstream session is gone.
    fn disconnected_upstream(&self, now: DateTime<Utc>);

    /// A price that passed the session checks.
    fn receive_price(&self, update: PriceUpdate, now: DateTime<Utc>) -> Vec<Outbound>;
}

/// Parent side of a session.
pub trait MatcherEndpoint: Send + Sync {
    fn agent_id(&self) -> &AgentId;

    /// Basis children must bid in. `None` until the matcher itself is connected.
    fn market_basis(&self) -> Option<MarketBasis>;

    fn child_connected(
        &self,
        child_id: &AgentId,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>>;

    fn child_disconnected(&self, child_id: &AgentId, now: DateTime<Utc>) -> Vec<Outbound>;

    fn submit_bid(
        &self,
        child_id: &AgentId,
        session_id: &SessionId,
        update: BidUpdate,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>>;

    /// Flushes updates held back by the rate limit.
    fn tick(&self, now: DateTime<Utc>) -> Vec<Outbound>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Identity and monitoring handle shared by all roles.
#[derive(Debug, Clone)]
struct AgentContext {
    agent_id: AgentId,
    cluster_id: ClusterId,
    events: EventLog,
}

impl AgentContext {
    fn log(&self, now: DateTime<Utc>, session_id: Option<&SessionId>, event_type: EventType) {
        self.events
            .log(now, &self.cluster_id, &self.agent_id, session_id, event_type);
    }

    /// Runs a child bid through the aggregator and reports the outcome.
    /// Returns whether the aggregate changed.
    fn accept_bid(
        &self,
        aggregator: &mut Aggregator,
        child_id: &AgentId,
        session_id: &SessionId,
        update: BidUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let outcome =
            aggregator.submit_child_bid(child_id, session_id, &update.bid, update.bid_number);
        match outcome {
            Ok(SubmitOutcome::Accepted) => {
                log::debug!(
                    "{} accepted bid {} from {}",
                    self.agent_id,
                    update.bid_number,
                    child_id
                );
                self.log(
                    now,
                    Some(session_id),
                    EventType::IncomingBidUpdate {
                        child_id: child_id.clone(),
                        bid_update: update,
                    },
                );
                Ok(true)
            }
            Ok(SubmitOutcome::Replayed) => {
                log::debug!(
                    "{} ignored replay of bid {} from {}",
                    self.agent_id,
                    update.bid_number,
                    child_id
                );
                Ok(false)
            }
            Ok(SubmitOutcome::Outdated) => {
                log::debug!(
                    "{} ignored outdated bid {} from {}",
                    self.agent_id,
                    update.bid_number,
                    child_id
                );
                self.log(
                    now,
                    Some(session_id),
                    EventType::BidRejected {
                        child_id: child_id.clone(),
                        bid_number: Some(update.bid_number),
                        reason: "outdated bid number".to_string(),
                    },
                );
                Ok(false)
            }
            Err(e) => {
                log::warn!(
                    "{} rejected bid {} from {}: {}",
                    self.agent_id,
                    update.bid_number,
                    child_id,
                    e
                );
                self.log(
                    now,
                    Some(session_id),
                    EventType::BidRejected {
                        child_id: child_id.clone(),
                        bid_number: Some(update.bid_number),
                        reason: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Turns a price into one delivery per referenced child.
    fn fan_out(
        &self,
        aggregator: &Aggregator,
        bid_number: BidNumber,
        price: &Price,
        now: DateTime<Utc>,
    ) -> Vec<Outbound> {
        let Some(deliveries) = aggregator.distribute(bid_number, price) else {
            log::warn!(
                "{} has no forwarded bid {}, price {} dropped",
                self.agent_id,
                bid_number,
                price
            );
            return Vec::new();
        };

        deliveries
            .into_iter()
            .map(|(child_id, session_id, update)| {
                self.log(
                    now,
                    Some(&session_id),
                    EventType::OutgoingPriceUpdate {
                        child_id: child_id.clone(),
                        price_update: update.clone(),
                    },
                );
                Outbound::DeliverPrice {
                    from: self.agent_id.clone(),
                    to: child_id,
                    session_id,
                    update,
                }
            })
            .collect()
    }
}

/// Outgoing rate limit: at most one update per `min_interval`.
#[derive(Debug, Clone)]
struct RateLimiter {
    min_interval: Duration,
    last_sent: Option<DateTime<Utc>>,
    pending: bool,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: None,
            pending: false,
        }
    }

    fn mark_pending(&mut self) {
        self.pending = true;
    }

    fn ready(&self, now: DateTime<Utc>) -> bool {
        self.pending
            && self
                .last_sent
                .is_none_or(|last| now - last >= self.min_interval)
    }

    fn sent(&mut self, now: DateTime<Utc>) {
        self.pending = false;
        self.last_sent = Some(now);
    }

    fn reset(&mut self) {
        self.pending = false;
        self.last_sent = None;
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    upstream: Option<SharedSession>,
    current_bid: Option<Bid>,
    last_price: Option<PriceUpdate>,
}

/// A leaf agent bidding on behalf of an appliance.
#[derive(Debug)]
pub struct DeviceAgent {
    context: AgentContext,
    state: Mutex<DeviceState>,
}

impl DeviceAgent {
    pub fn new(agent_id: AgentId, cluster_id: ClusterId, events: EventLog) -> Self {
        Self {
            context: AgentContext {
                agent_id,
                cluster_id,
                events,
            },
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// Sends a new bid over the upstream session.
    ///
    /// A bid that cannot be sent because there is no live session is kept
    /// as the device's current bid and re-sent when a new session is
    /// established. A bid on a foreign market basis is refused and leaves
    /// the current bid as it was.
    pub fn update_bid(&self, bid: Bid, now: DateTime<Utc>) -> Result<Vec<Outbound>> {
        let mut state = lock(&self.state);
        let Some(session) = state.upstream.clone() else {
            state.current_bid = Some(bid);
            return Err(MatcherError::NotReady(self.context.agent_id.clone()));
        };
        let mut session = lock_session(&session);
        if let Some(basis) = session.market_basis() {
            basis.ensure_compatible(bid.market_basis())?;
        }
        match session.update_bid(bid.clone(), now) {
            Ok(update) => {
                state.current_bid = Some(bid);
                Ok(vec![Outbound::ForwardBid {
                    from: self.context.agent_id.clone(),
                    session_id: session.id().clone(),
                    update,
                }])
            }
            Err(MatcherError::SessionClosed(session_id)) => {
                state.current_bid = Some(bid);
                Err(MatcherError::SessionClosed(session_id))
            }
            Err(e) => Err(e),
        }
    }

    pub fn current_bid(&self) -> Option<Bid> {
        lock(&self.state).current_bid.clone()
    }

    /// Last price delivered to this device.
    pub fn last_price(&self) -> Option<PriceUpdate> {
        lock(&self.state).last_price.clone()
    }
}

impl AgentEndpoint for DeviceAgent {
    fn agent_id(&self) -> &AgentId {
        &self.context.agent_id
    }

    fn connected_upstream(&self, session: SharedSession, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut state = lock(&self.state);
        state.upstream = Some(session.clone());
        state.last_price = None;

        let Some(bid) = state.current_bid.clone() else {
            return Vec::new();
        };
        let mut session = lock_session(&session);
        match session.update_bid(bid, now) {
            Ok(update) => vec![Outbound::ForwardBid {
                from: self.context.agent_id.clone(),
                session_id: session.id().clone(),
                update,
            }],
            Err(e) => {
                log::warn!(
                    "{} could not resend its bid on {}: {}",
                    self.context.agent_id,
                    session.id(),
                    e
                );
                Vec::new()
            }
        }
    }

    fn disconnected_upstream(&self, _now: DateTime<Utc>) {
        // the closed session stays so that late bids fail with SessionClosed
        log::debug!("{} lost its parent", self.context.agent_id);
    }

    fn receive_price(&self, update: PriceUpdate, _now: DateTime<Utc>) -> Vec<Outbound> {
        log::debug!("{} priced at {}", self.context.agent_id, update);
        lock(&self.state).last_price = Some(update);
        Vec::new()
    }
}

#[derive(Debug)]
struct ConcentratorState {
    upstream: Option<SharedSession>,
    aggregator: Option<Aggregator>,
    limiter: RateLimiter,
}

/// Aggregates the bids of its children into one bid for its own parent and
/// splits the prices coming back.
#[derive(Debug)]
pub struct Concentrator {
    context: AgentContext,
    transform: Box<dyn PriceTransform>,
    state: Mutex<ConcentratorState>,
}

impl Concentrator {
    pub fn new(
        agent_id: AgentId,
        cluster_id: ClusterId,
        events: EventLog,
        transform: Box<dyn PriceTransform>,
        min_time_between_bid_updates: Duration,
    ) -> Self {
        Self {
            context: AgentContext {
                agent_id,
                cluster_id,
                events,
            },
            transform,
            state: Mutex::new(ConcentratorState {
                upstream: None,
                aggregator: None,
                limiter: RateLimiter::new(min_time_between_bid_updates),
            }),
        }
    }

    /// Current untransformed aggregate of the children.
    pub fn aggregate(&self) -> Option<AggregatedBid> {
        lock(&self.state).aggregator.as_ref().map(Aggregator::aggregate)
    }

    /// Last aggregate sent upstream, before transformation.
    pub fn last_forwarded(&self) -> Option<(BidNumber, AggregatedBid)> {
        let state = lock(&self.state);
        state
            .aggregator
            .as_ref()
            .and_then(|a| a.last_forwarded())
            .map(|(n, aggregated)| (n, aggregated.clone()))
    }

    pub fn connected_children(&self) -> Vec<AgentId> {
        lock(&self.state)
            .aggregator
            .as_ref()
            .map(Aggregator::connected_children)
            .unwrap_or_default()
    }

    fn try_forward(&self, state: &mut ConcentratorState, now: DateTime<Utc>) -> Vec<Outbound> {
        if !state.limiter.ready(now) {
            return Vec::new();
        }
        let (Some(session), Some(aggregator)) = (state.upstream.as_ref(), state.aggregator.as_mut())
        else {
            return Vec::new();
        };

        let aggregated = aggregator.aggregate();
        let shaved = self.transform.transform_bid(aggregated.bid());
        let mut session = lock_session(session);
        match session.update_bid(Bid::from(shaved), now) {
            Ok(update) => {
                log::debug!(
                    "{} forwarded bid {} covering {} children",
                    self.context.agent_id,
                    update.bid_number,
                    aggregated.references().len()
                );
                aggregator.record_forwarded(update.bid_number, aggregated);
                state.limiter.sent(now);
                vec![Outbound::ForwardBid {
                    from: self.context.agent_id.clone(),
                    session_id: session.id().clone(),
                    update,
                }]
            }
            Err(e) => {
                log::warn!("{} could not forward: {}", self.context.agent_id, e);
                Vec::new()
            }
        }
    }
}

impl AgentEndpoint for Concentrator {
    fn agent_id(&self) -> &AgentId {
        &self.context.agent_id
    }

    fn connected_upstream(&self, session: SharedSession, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut state = lock(&self.state);
        let Some(basis) = lock_session(&session).market_basis().cloned() else {
            return Vec::new();
        };
        state.upstream = Some(session);
        state.aggregator = Some(Aggregator::new(basis));
        state.limiter.reset();
        state.limiter.mark_pending();
        self.try_forward(&mut state, now)
    }

    fn disconnected_upstream(&self, _now: DateTime<Utc>) {
        let mut state = lock(&self.state);
        state.upstream = None;
        state.aggregator = None;
        state.limiter.reset();
        log::debug!("{} lost its parent", self.context.agent_id);
    }

    fn receive_price(&self, update: PriceUpdate, now: DateTime<Utc>) -> Vec<Outbound> {
        let state = lock(&self.state);
        let Some(aggregator) = state.aggregator.as_ref() else {
            return Vec::new();
        };
        let Some(original) = aggregator.forwarded(update.bid_number) else {
            log::warn!(
                "{} has no forwarded bid {}, price dropped",
                self.context.agent_id,
                update.bid_number
            );
            return Vec::new();
        };
        let price = self.transform.transform_price(&update.price, original.bid());
        self.context.fan_out(aggregator, update.bid_number, &price, now)
    }
}

impl MatcherEndpoint for Concentrator {
    fn agent_id(&self) -> &AgentId {
        &self.context.agent_id
    }

    fn market_basis(&self) -> Option<MarketBasis> {
        let state = lock(&self.state);
        state
            .aggregator
            .as_ref()
            .map(|a| a.market_basis().clone())
    }

    fn child_connected(
        &self,
        child_id: &AgentId,
        session_id: &SessionId,
        _now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>> {
        let mut state = lock(&self.state);
        let aggregator = state
            .aggregator
            .as_mut()
            .ok_or_else(|| MatcherError::NotReady(self.context.agent_id.clone()))?;
        aggregator.child_connected(child_id.clone(), session_id.clone());
        Ok(Vec::new())
    }

    fn child_disconnected(&self, child_id: &AgentId, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut state = lock(&self.state);
        let Some(aggregator) = state.aggregator.as_mut() else {
            return Vec::new();
        };
        let contributed = aggregator.current_bid(child_id).is_some();
        if aggregator.child_disconnected(child_id) && contributed {
            state.limiter.mark_pending();
            return self.try_forward(&mut state, now);
        }
        Vec::new()
    }

    fn submit_bid(
        &self,
        child_id: &AgentId,
        session_id: &SessionId,
        update: BidUpdate,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>> {
        let mut state = lock(&self.state);
        let aggregator = state
            .aggregator
            .as_mut()
            .ok_or_else(|| MatcherError::SessionClosed(session_id.clone()))?;
        if self
            .context
            .accept_bid(aggregator, child_id, session_id, update, now)?
        {
            state.limiter.mark_pending();
            return Ok(self.try_forward(&mut state, now));
        }
        Ok(Vec::new())
    }

    fn tick(&self, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut state = lock(&self.state);
        self.try_forward(&mut state, now)
    }
}

#[derive(Debug)]
struct AuctioneerState {
    aggregator: Aggregator,
    round: Option<BidNumber>,
    last_equilibrium: Option<Equilibrium>,
    limiter: RateLimiter,
}

/// Root of a cluster: owns the market basis and computes the equilibrium.
#[derive(Debug)]
pub struct Auctioneer {
    context: AgentContext,
    market_basis: MarketBasis,
    state: Mutex<AuctioneerState>,
}

impl Auctioneer {
    pub fn new(
        agent_id: AgentId,
        cluster_id: ClusterId,
        events: EventLog,
        market_basis: MarketBasis,
        min_time_between_price_updates: Duration,
    ) -> Self {
        Self {
            context: AgentContext {
                agent_id,
                cluster_id,
                events,
            },
            state: Mutex::new(AuctioneerState {
                aggregator: Aggregator::new(market_basis.clone()),
                round: None,
                last_equilibrium: None,
                limiter: RateLimiter::new(min_time_between_price_updates),
            }),
            market_basis,
        }
    }

    pub fn last_equilibrium(&self) -> Option<Equilibrium> {
        lock(&self.state).last_equilibrium.clone()
    }

    pub fn aggregate(&self) -> AggregatedBid {
        lock(&self.state).aggregator.aggregate()
    }

    pub fn connected_children(&self) -> Vec<AgentId> {
        lock(&self.state).aggregator.connected_children()
    }

    fn try_publish(&self, state: &mut AuctioneerState, now: DateTime<Utc>) -> Vec<Outbound> {
        if !state.limiter.ready(now) {
            return Vec::new();
        }

        let round = state.round.map_or(BidNumber::FIRST, BidNumber::next);
        state.round = Some(round);
        let aggregated = state.aggregator.aggregate();
        let equilibrium = equilibrium::solve(&aggregated, round);
        state.aggregator.record_forwarded(round, aggregated);
        state.limiter.sent(now);

        log::info!(
            "{} equilibrium {} ({:?})",
            self.context.agent_id,
            equilibrium.price_update,
            equilibrium.clearing
        );
        self.context.log(
            now,
            None,
            EventType::EquilibriumComputed {
                price_update: equilibrium.price_update.clone(),
                clearing: equilibrium.clearing,
            },
        );

        let deliveries = self.context.fan_out(
            &state.aggregator,
            round,
            &equilibrium.price_update.price,
            now,
        );
        state.last_equilibrium = Some(equilibrium);
        deliveries
    }
}

impl MatcherEndpoint for Auctioneer {
    fn agent_id(&self) -> &AgentId {
        &self.context.agent_id
    }

    fn market_basis(&self) -> Option<MarketBasis> {
        Some(self.market_basis.clone())
    }

    fn child_connected(
        &self,
        child_id: &AgentId,
        session_id: &SessionId,
        _now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>> {
        lock(&self.state)
            .aggregator
            .child_connected(child_id.clone(), session_id.clone());
        Ok(Vec::new())
    }

    fn child_disconnected(&self, child_id: &AgentId, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut state = lock(&self.state);
        let contributed = state.aggregator.current_bid(child_id).is_some();
        if state.aggregator.child_disconnected(child_id) && contributed {
            state.limiter.mark_pending();
            return self.try_publish(&mut state, now);
        }
        Vec::new()
    }

    fn submit_bid(
        &self,
        child_id: &AgentId,
        session_id: &SessionId,
        update: BidUpdate,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outbound>> {
        let mut state = lock(&self.state);
        if self
            .context
            .accept_bid(&mut state.aggregator, child_id, session_id, update, now)?
        {
            state.limiter.mark_pending();
            return Ok(self.try_publish(&mut state, now));
        }
        Ok(Vec::new())
    }

    fn tick(&self, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut state = lock(&self.state);
        self.try_publish(&mut state, now)
    }
}

impl fmt::Display for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outbound::ForwardBid { from, update, .. } => {
                write!(f, "bid {} from {}", update.bid_number, from)
            }
            Outbound::DeliverPrice {
                from,
                to,
                session_id,
                update,
            } => write!(f, "price {} from {} to {} on {}", update, from, to, session_id),
        }
    }
}
