//! Sessions: the logical link between a child agent and its parent matcher.
//!
//! A session numbers the bids its child sends and only lets through prices
//! that answer the child's outstanding bid number. Once disconnected it stays
//! disconnected; reconnecting creates a new session with a fresh id and a
//! fresh bid-number space.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::bid::Bid;
use crate::error::{MatcherError, Result};
use crate::events::{EventLog, EventType};
use crate::market::MarketBasis;
use crate::price::{BidUpdate, PriceUpdate};
use crate::types::{AgentId, BidNumber, ClusterId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Session shared by the two endpoints it links.
pub type SharedSession = Arc<Mutex<Session>>;

pub fn lock_session(session: &SharedSession) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    cluster_id: ClusterId,
    child_id: AgentId,
    parent_id: AgentId,
    market_basis: Option<MarketBasis>,
    state: SessionState,
    outstanding: Option<BidNumber>,
    events: EventLog,
}

impl Session {
    /// Starts a connect attempt. The session is usable once the parent accepts.
    pub fn connect(
        id: SessionId,
        cluster_id: ClusterId,
        child_id: AgentId,
        parent_id: AgentId,
        events: EventLog,
    ) -> Self {
        log::debug!("session {} connecting {} -> {}", id, child_id, parent_id);
        Self {
            id,
            cluster_id,
            child_id,
            parent_id,
            market_basis: None,
            state: SessionState::Connecting,
            outstanding: None,
            events,
        }
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }

    pub fn child_id(&self) -> &AgentId {
        &self.child_id
    }

    pub fn parent_id(&self) -> &AgentId {
        &self.parent_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn market_basis(&self) -> Option<&MarketBasis> {
        self.market_basis.as_ref()
    }

    /// Bid number the next price must answer.
    pub fn outstanding_bid_number(&self) -> Option<BidNumber> {
        self.outstanding
    }

    fn closed(&self) -> MatcherError {
        MatcherError::SessionClosed(self.id.clone())
    }

    /// The parent accepted the child; the session carries the parent's basis.
    pub fn accept(&mut self, market_basis: MarketBasis, now: DateTime<Utc>) -> Result<()> {
        if self.state != SessionState::Connecting {
            return Err(self.closed());
        }
        self.market_basis = Some(market_basis);
        self.state = SessionState::Connected;
        log::info!(
            "session {} connected {} -> {}",
            self.id,
            self.child_id,
            self.parent_id
        );
        self.events.log(
            now,
            &self.cluster_id,
            &self.child_id,
            Some(&self.id),
            EventType::SessionConnected {
                parent_id: self.parent_id.clone(),
            },
        );
        Ok(())
    }

    /// Numbers a new bid from the child.
    pub fn update_bid(&mut self, bid: Bid, now: DateTime<Utc>) -> Result<BidUpdate> {
        if self.state != SessionState::Connected {
            return Err(self.closed());
        }
        let basis = self.market_basis.as_ref().ok_or_else(|| self.closed())?;
        basis.ensure_compatible(bid.market_basis())?;

        let bid_number = self.outstanding.map_or(BidNumber::FIRST, BidNumber::next);
        self.outstanding = Some(bid_number);
        let update = BidUpdate::new(bid, bid_number);

        log::debug!("{} sent bid {} on {}", self.child_id, bid_number, self.id);
        self.events.log(
            now,
            &self.cluster_id,
            &self.child_id,
            Some(&self.id),
            EventType::OutgoingBidUpdate {
                bid_update: update.clone(),
            },
        );
        Ok(update)
    }

    /// Checks a price from the parent before it reaches the child.
    ///
    /// Only a price answering the outstanding bid number passes. Everything
    /// else is reported on the event log as rejected and returned as an error.
    pub fn update_price(&mut self, update: PriceUpdate, now: DateTime<Utc>) -> Result<PriceUpdate> {
        let verdict = self.check_price(&update);
        match &verdict {
            Ok(()) => {
                log::debug!("{} received {}", self.child_id, update);
                self.events.log(
                    now,
                    &self.cluster_id,
                    &self.child_id,
                    Some(&self.id),
                    EventType::IncomingPriceUpdate {
                        price_update: update.clone(),
                    },
                );
            }
            Err(e) => {
                log::warn!("{} rejected {}: {}", self.child_id, update, e);
                self.events.log(
                    now,
                    &self.cluster_id,
                    &self.child_id,
                    Some(&self.id),
                    EventType::PriceRejected {
                        price_update: update.clone(),
                        reason: e.to_string(),
                    },
                );
            }
        }
        verdict.map(|()| update)
    }

    fn check_price(&self, update: &PriceUpdate) -> Result<()> {
        if self.state != SessionState::Connected {
            return Err(self.closed());
        }
        let basis = self.market_basis.as_ref().ok_or_else(|| self.closed())?;
        basis.ensure_compatible(update.price.market_basis())?;
        if self.outstanding != Some(update.bid_number) {
            return Err(MatcherError::StalePrice {
                session_id: self.id.clone(),
                expected: self.outstanding,
                received: update.bid_number,
            });
        }
        Ok(())
    }

    /// First half of a disconnect: no more bids or prices pass.
    pub fn begin_disconnect(&mut self) -> Result<()> {
        match self.state {
            SessionState::Connecting | SessionState::Connected => {
                self.state = SessionState::Disconnecting;
                Ok(())
            }
            SessionState::Disconnecting => Ok(()),
            SessionState::Disconnected => Err(self.closed()),
        }
    }

    /// Moves to the terminal state. Returns false when already disconnected.
    pub fn disconnect(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == SessionState::Disconnected {
            return false;
        }
        let was_connected = self.market_basis.is_some();
        self.state = SessionState::Disconnected;
        self.outstanding = None;
        log::info!(
            "session {} disconnected {} -> {}",
            self.id,
            self.child_id,
            self.parent_id
        );
        if was_connected {
            self.events.log(
                now,
                &self.cluster_id,
                &self.child_id,
                Some(&self.id),
                EventType::SessionDisconnected {
                    parent_id: self.parent_id.clone(),
                },
            );
        }
        true
    }
}
