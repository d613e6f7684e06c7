//! Bid aggregation with per-child provenance.
//!
//! The aggregator keeps one slot per connected child, addressed by the child's
//! agent id. Each slot remembers which session instance it belongs to and the
//! last bid accepted over that session. Aggregation sums the current bids of
//! all slots; because it works from the slot table alone, the result does not
//! depend on the order in which updates arrived.
//!
//! Every aggregate that is forwarded upward is recorded under the bid number
//! it was sent with, so that a price answering that number can later be
//! attributed to exactly the child bids it covered.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::bid::{ArrayBid, Bid};
use crate::error::{MatcherError, Result};
use crate::market::MarketBasis;
use crate::price::{Price, PriceUpdate};
use crate::types::{AgentId, BidNumber, SessionId};

/// Number of forwarded aggregates kept for price attribution.
pub const FORWARDED_HISTORY: usize = 32;

/// A combined bid plus the bid number each contributing child supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedBid {
    bid: ArrayBid,
    references: BTreeMap<AgentId, BidNumber>,
}

impl AggregatedBid {
    pub fn new(bid: ArrayBid, references: BTreeMap<AgentId, BidNumber>) -> Self {
        Self { bid, references }
    }

    pub fn bid(&self) -> &ArrayBid {
        &self.bid
    }

    pub fn references(&self) -> &BTreeMap<AgentId, BidNumber> {
        &self.references
    }

    pub fn references_agent(&self, agent_id: &AgentId) -> bool {
        self.references.contains_key(agent_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The bid replaced the child's previous contribution.
    Accepted,
    /// Same bid number and bid as the current one; nothing changed.
    Replayed,
    /// Older than the current bid; ignored.
    Outdated,
}

impl SubmitOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted)
    }
}

#[derive(Debug, Clone)]
struct ChildSlot {
    session_id: SessionId,
    current: Option<(BidNumber, ArrayBid)>,
}

#[derive(Debug, Clone)]
struct Forwarded {
    bid_number: BidNumber,
    aggregated: AggregatedBid,
    sessions: BTreeMap<AgentId, SessionId>,
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    market_basis: MarketBasis,
    slots: BTreeMap<AgentId, ChildSlot>,
    forwarded: VecDeque<Forwarded>,
}

impl Aggregator {
    pub fn new(market_basis: MarketBasis) -> Self {
        Self {
            market_basis,
            slots: BTreeMap::new(),
            forwarded: VecDeque::new(),
        }
    }

    pub fn market_basis(&self) -> &MarketBasis {
        &self.market_basis
    }

    /// Opens a slot for a child session. A previous slot for the same child
    /// is discarded together with its bid.
    pub fn child_connected(&mut self, child_id: AgentId, session_id: SessionId) {
        if let Some(old) = self.slots.insert(
            child_id.clone(),
            ChildSlot {
                session_id,
                current: None,
            },
        ) {
            log::debug!(
                "child {} reconnected, dropping slot of session {}",
                child_id,
                old.session_id
            );
        }
    }

    /// Removes the child's slot. Returns whether the child was connected.
    pub fn child_disconnected(&mut self, child_id: &AgentId) -> bool {
        self.slots.remove(child_id).is_some()
    }

    pub fn is_connected(&self, child_id: &AgentId) -> bool {
        self.slots.contains_key(child_id)
    }

    pub fn connected_children(&self) -> Vec<AgentId> {
        self.slots.keys().cloned().collect()
    }

    pub fn session_of(&self, child_id: &AgentId) -> Option<&SessionId> {
        self.slots.get(child_id).map(|slot| &slot.session_id)
    }

    pub fn current_bid(&self, child_id: &AgentId) -> Option<(BidNumber, &ArrayBid)> {
        self.slots
            .get(child_id)
            .and_then(|slot| slot.current.as_ref())
            .map(|(n, bid)| (*n, bid))
    }

    /// Stores a child's bid.
    ///
    /// The session id ties the bid to the slot it was produced for; a bid
    /// from a session that has since been replaced fails with
    /// `SessionClosed`. Replaying the current bid is a no-op and older bid
    /// numbers are ignored, so redelivery is harmless.
    pub fn submit_child_bid(
        &mut self,
        child_id: &AgentId,
        session_id: &SessionId,
        bid: &Bid,
        bid_number: BidNumber,
    ) -> Result<SubmitOutcome> {
        self.market_basis.ensure_compatible(bid.market_basis())?;

        let slot = match self.slots.get_mut(child_id) {
            Some(slot) if &slot.session_id == session_id => slot,
            _ => return Err(MatcherError::SessionClosed(session_id.clone())),
        };

        let bid = bid.to_array_bid();
        if let Some((current_number, current_bid)) = &slot.current {
            if bid_number < *current_number {
                return Ok(SubmitOutcome::Outdated);
            }
            if bid_number == *current_number {
                if *current_bid == bid {
                    return Ok(SubmitOutcome::Replayed);
                }
                return Err(MatcherError::ConflictingBidNumber {
                    agent_id: child_id.clone(),
                    bid_number,
                });
            }
        }

        slot.current = Some((bid_number, bid));
        Ok(SubmitOutcome::Accepted)
    }

    /// Sum of the current bids of all contributing children.
    pub fn aggregate(&self) -> AggregatedBid {
        let mut demand = ArrayBid::zero(self.market_basis.clone());
        let mut references = BTreeMap::new();

        for (child_id, slot) in &self.slots {
            if let Some((bid_number, bid)) = &slot.current {
                // bases were checked on submit
                if let Ok(sum) = demand.add(bid) {
                    demand = sum;
                    references.insert(child_id.clone(), *bid_number);
                }
            }
        }

        AggregatedBid::new(demand, references)
    }

    /// Remembers an aggregate as sent upward under `bid_number`.
    pub fn record_forwarded(&mut self, bid_number: BidNumber, aggregated: AggregatedBid) {
        let sessions = aggregated
            .references()
            .keys()
            .filter_map(|child_id| {
                self.slots
                    .get(child_id)
                    .map(|slot| (child_id.clone(), slot.session_id.clone()))
            })
            .collect();

        self.forwarded.push_back(Forwarded {
            bid_number,
            aggregated,
            sessions,
        });
        while self.forwarded.len() > FORWARDED_HISTORY {
            self.forwarded.pop_front();
        }
    }

    pub fn forwarded(&self, bid_number: BidNumber) -> Option<&AggregatedBid> {
        self.forwarded
            .iter()
            .rev()
            .find(|f| f.bid_number == bid_number)
            .map(|f| &f.aggregated)
    }

    pub fn last_forwarded(&self) -> Option<(BidNumber, &AggregatedBid)> {
        self.forwarded
            .back()
            .map(|f| (f.bid_number, &f.aggregated))
    }

    /// Forgets every forwarded aggregate; their bid numbers are void.
    pub fn clear_forwarded(&mut self) {
        self.forwarded.clear();
    }

    /// Splits a price answering `bid_number` into one price update per child
    /// referenced by that aggregate, each tagged with the child's own bid
    /// number and the session that bid was made on. Children that left or
    /// reconnected since are skipped.
    ///
    /// Returns `None` when no aggregate was forwarded under `bid_number`.
    pub fn distribute(
        &self,
        bid_number: BidNumber,
        price: &Price,
    ) -> Option<Vec<(AgentId, SessionId, PriceUpdate)>> {
        let forwarded = self
            .forwarded
            .iter()
            .rev()
            .find(|f| f.bid_number == bid_number)?;

        let deliveries = forwarded
            .aggregated
            .references()
            .iter()
            .filter_map(|(child_id, child_bid_number)| {
                let current = self.slots.get(child_id).map(|slot| &slot.session_id);
                match forwarded.sessions.get(child_id) {
                    Some(session_id) if current == Some(session_id) => Some((
                        child_id.clone(),
                        session_id.clone(),
                        PriceUpdate::new(price.clone(), *child_bid_number),
                    )),
                    _ => {
                        log::debug!(
                            "skipping price for {}: left since bid {}",
                            child_id,
                            bid_number
                        );
                        None
                    }
                }
            })
            .collect();

        Some(deliveries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn basis() -> MarketBasis {
        MarketBasis::new("electricity", "EUR", 5, dec!(0), dec!(4)).unwrap()
    }

    fn bid(values: &[i64]) -> Bid {
        Bid::from_demand(basis(), values.iter().map(|v| Decimal::from(*v)).collect()).unwrap()
    }

    fn session(child: &str, n: u64) -> SessionId {
        SessionId::new(&AgentId::from(child), &AgentId::from("concentrator"), n)
    }

    fn connected(children: &[&str]) -> Aggregator {
        let mut aggregator = Aggregator::new(basis());
        for child in children {
            aggregator.child_connected(AgentId::from(*child), session(child, 1));
        }
        aggregator
    }

    #[test]
    fn test_aggregation_is_order_independent() {
        let submissions = vec![
            ("a", bid(&[4, 3, 2, 1, 0]), BidNumber(1)),
            ("b", bid(&[1, 1, 0, -1, -1]), BidNumber(1)),
            ("c", bid(&[0, 0, -2, -2, -5]), BidNumber(1)),
            ("a", bid(&[5, 3, 3, 0, 0]), BidNumber(2)),
        ];

        let mut forward = connected(&["a", "b", "c"]);
        for (child, b, n) in &submissions {
            forward
                .submit_child_bid(&AgentId::from(*child), &session(child, 1), b, *n)
                .unwrap();
        }

        let mut reversed = connected(&["c", "b", "a"]);
        for (child, b, n) in submissions.iter().rev() {
            reversed
                .submit_child_bid(&AgentId::from(*child), &session(child, 1), b, *n)
                .unwrap();
        }

        assert_eq!(forward.aggregate(), reversed.aggregate());
        assert_eq!(
            forward.aggregate().bid().demand(),
            &[dec!(6), dec!(4), dec!(1), dec!(-3), dec!(-6)]
        );
        assert_eq!(forward.aggregate().references()[&AgentId::from("a")], BidNumber(2));
    }

    #[test]
    fn test_disconnect_matches_never_connected() {
        let mut with_b = connected(&["a", "b"]);
        with_b
            .submit_child_bid(&"a".into(), &session("a", 1), &bid(&[2, 1, 0, 0, 0]), BidNumber(1))
            .unwrap();
        with_b
            .submit_child_bid(&"b".into(), &session("b", 1), &bid(&[3, 3, 3, 3, 3]), BidNumber(1))
            .unwrap();
        assert!(with_b.child_disconnected(&"b".into()));

        let mut without_b = connected(&["a"]);
        without_b
            .submit_child_bid(&"a".into(), &session("a", 1), &bid(&[2, 1, 0, 0, 0]), BidNumber(1))
            .unwrap();

        assert_eq!(with_b.aggregate(), without_b.aggregate());
        assert!(!with_b.aggregate().references_agent(&"b".into()));
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut aggregator = connected(&["a"]);
        let b = bid(&[2, 1, 0, 0, 0]);
        let first = aggregator
            .submit_child_bid(&"a".into(), &session("a", 1), &b, BidNumber(3))
            .unwrap();
        let snapshot = aggregator.aggregate();
        let second = aggregator
            .submit_child_bid(&"a".into(), &session("a", 1), &b, BidNumber(3))
            .unwrap();

        assert_eq!(first, SubmitOutcome::Accepted);
        assert_eq!(second, SubmitOutcome::Replayed);
        assert_eq!(aggregator.aggregate(), snapshot);
    }

    #[test]
    fn test_outdated_and_conflicting_bids() {
        let mut aggregator = connected(&["a"]);
        aggregator
            .submit_child_bid(&"a".into(), &session("a", 1), &bid(&[2, 1, 0, 0, 0]), BidNumber(3))
            .unwrap();

        let outdated = aggregator
            .submit_child_bid(&"a".into(), &session("a", 1), &bid(&[9, 9, 9, 9, 9]), BidNumber(2))
            .unwrap();
        assert_eq!(outdated, SubmitOutcome::Outdated);

        let conflict =
            aggregator.submit_child_bid(&"a".into(), &session("a", 1), &bid(&[1, 1, 1, 1, 1]), BidNumber(3));
        assert!(matches!(conflict, Err(MatcherError::ConflictingBidNumber { .. })));
        assert_eq!(aggregator.current_bid(&"a".into()).unwrap().0, BidNumber(3));
        assert_eq!(
            aggregator.aggregate().bid().demand(),
            &[dec!(2), dec!(1), dec!(0), dec!(0), dec!(0)]
        );
    }

    #[test]
    fn test_bid_after_disconnect_is_rejected() {
        let mut aggregator = connected(&["a"]);
        aggregator.child_disconnected(&"a".into());
        let result =
            aggregator.submit_child_bid(&"a".into(), &session("a", 1), &bid(&[1, 0, 0, 0, 0]), BidNumber(1));
        assert!(matches!(result, Err(MatcherError::SessionClosed(_))));
        assert!(aggregator.aggregate().references().is_empty());
    }

    #[test]
    fn test_bid_from_replaced_session_is_rejected() {
        let mut aggregator = connected(&["a"]);
        aggregator.child_connected("a".into(), session("a", 2));
        let result =
            aggregator.submit_child_bid(&"a".into(), &session("a", 1), &bid(&[1, 0, 0, 0, 0]), BidNumber(5));
        assert!(matches!(result, Err(MatcherError::SessionClosed(_))));
    }

    #[test]
    fn test_incompatible_basis_is_rejected() {
        let mut aggregator = connected(&["a"]);
        let other = MarketBasis::new("electricity", "EUR", 5, dec!(0), dec!(8)).unwrap();
        let foreign = Bid::from_demand(other, vec![Decimal::ONE; 5]).unwrap();
        let result = aggregator.submit_child_bid(&"a".into(), &session("a", 1), &foreign, BidNumber(1));
        assert_eq!(result, Err(MatcherError::IncompatibleMarketBasis));
    }

    #[test]
    fn test_children_without_bid_do_not_contribute() {
        let aggregator = connected(&["a", "b"]);
        let aggregated = aggregator.aggregate();
        assert!(aggregated.references().is_empty());
        assert_eq!(aggregated.bid(), &ArrayBid::zero(basis()));
    }

    #[test]
    fn test_distribute_follows_references() {
        let mut aggregator = connected(&["a", "b"]);
        aggregator
            .submit_child_bid(&"a".into(), &session("a", 1), &bid(&[2, 1, 0, 0, 0]), BidNumber(4))
            .unwrap();
        aggregator
            .submit_child_bid(&"b".into(), &session("b", 1), &bid(&[1, 1, 0, -1, -1]), BidNumber(9))
            .unwrap();
        aggregator.record_forwarded(BidNumber(1), aggregator.aggregate());

        // joins after bid 1 went out
        aggregator.child_connected("c".into(), session("c", 1));
        aggregator
            .submit_child_bid(&"c".into(), &session("c", 1), &bid(&[1, 0, 0, 0, 0]), BidNumber(1))
            .unwrap();

        let price = Price::at_step(basis(), 2);
        let deliveries = aggregator.distribute(BidNumber(1), &price).unwrap();
        assert_eq!(
            deliveries,
            vec![
                (
                    AgentId::from("a"),
                    session("a", 1),
                    PriceUpdate::new(price.clone(), BidNumber(4))
                ),
                (
                    AgentId::from("b"),
                    session("b", 1),
                    PriceUpdate::new(price.clone(), BidNumber(9))
                ),
            ]
        );
        assert!(aggregator.distribute(BidNumber(2), &price).is_none());
    }

    #[test]
    fn test_distribute_skips_departed_and_reconnected_children() {
        let mut aggregator = connected(&["a", "b"]);
        aggregator
            .submit_child_bid(&"a".into(), &session("a", 1), &bid(&[2, 1, 0, 0, 0]), BidNumber(1))
            .unwrap();
        aggregator
            .submit_child_bid(&"b".into(), &session("b", 1), &bid(&[2, 1, 0, 0, 0]), BidNumber(1))
            .unwrap();
        aggregator.record_forwarded(BidNumber(1), aggregator.aggregate());

        aggregator.child_disconnected(&"a".into());
        aggregator.child_disconnected(&"b".into());
        aggregator.child_connected("b".into(), session("b", 2));

        let deliveries = aggregator
            .distribute(BidNumber(1), &Price::at_step(basis(), 1))
            .unwrap();
        assert!(deliveries.is_empty());
    }

    #[test]
    fn test_forwarded_history_is_bounded() {
        let mut aggregator = connected(&[]);
        for n in 1..=(FORWARDED_HISTORY as u64 + 5) {
            aggregator.record_forwarded(BidNumber(n), aggregator.aggregate());
        }
        assert!(aggregator.forwarded(BidNumber(1)).is_none());
        assert!(aggregator.forwarded(BidNumber(FORWARDED_HISTORY as u64 + 5)).is_some());
        aggregator.clear_forwarded();
        assert!(aggregator.last_forwarded().is_none());
    }
}
