//! Monitoring events.
//!
//! Every accepted bid and every delivered or rejected price is published as
//! an [`Event`] onto an [`EventLog`], an append-only queue shared by all
//! agents of a cluster. External observers (tests, dashboards, the CLI) read
//! the queue; the matching logic never reads it back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::equilibrium::Clearing;
use crate::price::{BidUpdate, PriceUpdate};
use crate::types::{AgentId, BidNumber, ClusterId, SessionId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub cluster_id: ClusterId,
    pub agent_id: AgentId,
    pub session_id: Option<SessionId>,
    pub event_type: EventType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventType {
    SessionConnected {
        parent_id: AgentId,
    },
    SessionDisconnected {
        parent_id: AgentId,
    },
    /// A bid left this agent towards its parent.
    OutgoingBidUpdate {
        bid_update: BidUpdate,
    },
    /// A matcher accepted a bid from one of its children.
    IncomingBidUpdate {
        child_id: AgentId,
        bid_update: BidUpdate,
    },
    BidRejected {
        child_id: AgentId,
        bid_number: Option<BidNumber>,
        reason: String,
    },
    /// A matcher sent a price towards one of its children.
    OutgoingPriceUpdate {
        child_id: AgentId,
        price_update: PriceUpdate,
    },
    /// A price was delivered to this agent.
    IncomingPriceUpdate {
        price_update: PriceUpdate,
    },
    /// A price addressed to this agent was dropped.
    PriceRejected {
        price_update: PriceUpdate,
        reason: String,
    },
    EquilibriumComputed {
        price_update: PriceUpdate,
        clearing: Clearing,
    },
}

impl EventType {
    pub fn name(&self) -> &'static str {
        match self {
            EventType::SessionConnected { .. } => "SessionConnected",
            EventType::SessionDisconnected { .. } => "SessionDisconnected",
            EventType::OutgoingBidUpdate { .. } => "OutgoingBidUpdate",
            EventType::IncomingBidUpdate { .. } => "IncomingBidUpdate",
            EventType::BidRejected { .. } => "BidRejected",
            EventType::OutgoingPriceUpdate { .. } => "OutgoingPriceUpdate",
            EventType::IncomingPriceUpdate { .. } => "IncomingPriceUpdate",
            EventType::PriceRejected { .. } => "PriceRejected",
            EventType::EquilibriumComputed { .. } => "EquilibriumComputed",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}: ",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.cluster_id,
            self.agent_id
        )?;

        match &self.event_type {
            EventType::SessionConnected { parent_id } => {
                write!(f, "connected to {}", parent_id)
            }
            EventType::SessionDisconnected { parent_id } => {
                write!(f, "disconnected from {}", parent_id)
            }
            EventType::OutgoingBidUpdate { bid_update } => {
                write!(
                    f,
                    "sent bid {} {:?}",
                    bid_update.bid_number,
                    bid_update.bid.to_array_bid().demand()
                )
            }
            EventType::IncomingBidUpdate {
                child_id,
                bid_update,
            } => {
                write!(
                    f,
                    "accepted bid {} from {}",
                    bid_update.bid_number, child_id
                )
            }
            EventType::BidRejected {
                child_id,
                bid_number,
                reason,
            } => match bid_number {
                Some(n) => write!(f, "rejected bid {} from {}: {}", n, child_id, reason),
                None => write!(f, "rejected bid from {}: {}", child_id, reason),
            },
            EventType::OutgoingPriceUpdate {
                child_id,
                price_update,
            } => {
                write!(f, "sent price {} to {}", price_update, child_id)
            }
            EventType::IncomingPriceUpdate { price_update } => {
                write!(f, "received price {}", price_update)
            }
            EventType::PriceRejected {
                price_update,
                reason,
            } => {
                write!(f, "rejected price {}: {}", price_update, reason)
            }
            EventType::EquilibriumComputed {
                price_update,
                clearing,
            } => {
                write!(f, "equilibrium {} ({:?})", price_update, clearing)
            }
        }
    }
}

/// Cloneable handle on an append-only event queue.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<Event>> {
        // a panicking observer must not take monitoring down with it
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn publish(&self, event: Event) {
        log::trace!("{}", event);
        self.guard().push(event);
    }

    pub fn log(
        &self,
        timestamp: DateTime<Utc>,
        cluster_id: &ClusterId,
        agent_id: &AgentId,
        session_id: Option<&SessionId>,
        event_type: EventType,
    ) {
        self.publish(Event {
            timestamp,
            cluster_id: cluster_id.clone(),
            agent_id: agent_id.clone(),
            session_id: session_id.cloned(),
            event_type,
        });
    }

    /// Snapshot of everything published so far.
    pub fn events(&self) -> Vec<Event> {
        self.guard().clone()
    }

    /// Take everything published so far, leaving the queue empty.
    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.guard())
    }

    pub fn clear(&self) {
        self.guard().clear();
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn events_for(&self, agent_id: &AgentId) -> Vec<Event> {
        self.guard()
            .iter()
            .filter(|e| &e.agent_id == agent_id)
            .cloned()
            .collect()
    }

    pub fn outgoing_bid_updates(&self, agent_id: &AgentId) -> Vec<BidUpdate> {
        self.guard()
            .iter()
            .filter(|e| &e.agent_id == agent_id)
            .filter_map(|e| match &e.event_type {
                EventType::OutgoingBidUpdate { bid_update } => Some(bid_update.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn incoming_bid_updates(&self, agent_id: &AgentId) -> Vec<(AgentId, BidUpdate)> {
        self.guard()
            .iter()
            .filter(|e| &e.agent_id == agent_id)
            .filter_map(|e| match &e.event_type {
                EventType::IncomingBidUpdate {
                    child_id,
                    bid_update,
                } => Some((child_id.clone(), bid_update.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn incoming_price_updates(&self, agent_id: &AgentId) -> Vec<PriceUpdate> {
        self.guard()
            .iter()
            .filter(|e| &e.agent_id == agent_id)
            .filter_map(|e| match &e.event_type {
                EventType::IncomingPriceUpdate { price_update } => Some(price_update.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn rejected_price_updates(&self, agent_id: &AgentId) -> Vec<PriceUpdate> {
        self.guard()
            .iter()
            .filter(|e| &e.agent_id == agent_id)
            .filter_map(|e| match &e.event_type {
                EventType::PriceRejected { price_update, .. } => Some(price_update.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn save_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(&*self.guard())?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load_from_file(path: &str) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let events: Vec<Event> = serde_json::from_str(&json)?;
        Ok(Self {
            events: Arc::new(Mutex::new(events)),
        })
    }
}
