use rust_decimal::Decimal;
use std::error::Error;
use std::fmt;

use crate::types::{AgentId, BidNumber, SessionId};

pub type Result<T> = std::result::Result<T, MatcherError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatcherError {
    /// Two values built on different market bases were combined.
    IncompatibleMarketBasis,
    /// Market basis parameters are unusable (too few steps, empty range).
    InvalidMarketBasis(String),
    /// Demand curve is malformed or increases with price.
    InvalidBidShape(String),
    /// Price value lies outside the market basis range.
    PriceOutOfRange(Decimal),
    /// Operation on a session (or child slot) that is no longer connected.
    SessionClosed(SessionId),
    /// Price answers a bid number that is not outstanding.
    StalePrice {
        session_id: SessionId,
        expected: Option<BidNumber>,
        received: BidNumber,
    },
    /// A bid number was replayed carrying a different bid.
    ConflictingBidNumber { agent_id: AgentId, bid_number: BidNumber },
    /// Transform bounds are misconfigured.
    InvalidRange { floor: Decimal, ceiling: Decimal },
    UnknownAgent(AgentId),
    DuplicateAgent(AgentId),
    /// The parent is not connected upstream and has no market basis yet.
    NotReady(AgentId),
}

impl fmt::Display for MatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatcherError::IncompatibleMarketBasis => write!(f, "incompatible market basis"),
            MatcherError::InvalidMarketBasis(msg) => write!(f, "invalid market basis: {}", msg),
            MatcherError::InvalidBidShape(msg) => write!(f, "invalid bid shape: {}", msg),
            MatcherError::PriceOutOfRange(p) => write!(f, "price {} outside market basis", p),
            MatcherError::SessionClosed(id) => write!(f, "session {} is closed", id),
            MatcherError::StalePrice {
                session_id,
                expected,
                received,
            } => match expected {
                Some(expected) => write!(
                    f,
                    "stale price on session {}: bid number {} (outstanding {})",
                    session_id, received, expected
                ),
                None => write!(
                    f,
                    "stale price on session {}: bid number {} (no outstanding bid)",
                    session_id, received
                ),
            },
            MatcherError::ConflictingBidNumber {
                agent_id,
                bid_number,
            } => write!(
                f,
                "agent {} replayed bid number {} with a different bid",
                agent_id, bid_number
            ),
            MatcherError::InvalidRange { floor, ceiling } => {
                write!(f, "invalid range: floor {} > ceiling {}", floor, ceiling)
            }
            MatcherError::UnknownAgent(id) => write!(f, "unknown agent {}", id),
            MatcherError::DuplicateAgent(id) => write!(f, "agent {} already registered", id),
            MatcherError::NotReady(id) => write!(f, "agent {} has no market basis yet", id),
        }
    }
}

impl Error for MatcherError {}
