//! Clearing price search on a fully aggregated demand curve.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatedBid;
use crate::bid::ArrayBid;
use crate::price::{Price, PriceUpdate};
use crate::types::BidNumber;

/// How a crossing was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Clearing {
    Cleared,
    /// Demand stays above the target at every price; clamped to the maximum.
    UnboundedAbove,
    /// Demand stays below the target at every price; clamped to the minimum.
    UnboundedBelow,
}

impl Clearing {
    pub fn is_unbounded(&self) -> bool {
        !matches!(self, Clearing::Cleared)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crossing {
    pub price: Decimal,
    pub clearing: Clearing,
}

/// Lowest price at which the demand curve reaches `target`.
///
/// Demand exactly equal to the target over several steps resolves to the
/// lowest of them. A crossing strictly between two steps is interpolated
/// linearly. Curves that never reach the target clamp to the matching end
/// of the price range.
pub fn find_crossing(bid: &ArrayBid, target: Decimal) -> Crossing {
    let mb = bid.market_basis();
    let demand = bid.demand();

    if bid.minimum_demand() > target {
        return Crossing {
            price: mb.maximum_price(),
            clearing: Clearing::UnboundedAbove,
        };
    }
    if bid.maximum_demand() < target {
        return Crossing {
            price: mb.minimum_price(),
            clearing: Clearing::UnboundedBelow,
        };
    }

    // exists: the last value is <= target
    let step = demand
        .iter()
        .position(|d| *d <= target)
        .unwrap_or(demand.len() - 1);

    let price = if demand[step] == target || step == 0 {
        mb.price_of_step(step)
    } else {
        let (high, low) = (demand[step - 1], demand[step]);
        let lower_price = mb.price_of_step(step - 1);
        let upper_price = mb.price_of_step(step);
        lower_price + (upper_price - lower_price) * (high - target) / (high - low)
    };

    Crossing {
        price,
        clearing: Clearing::Cleared,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Equilibrium {
    pub price_update: PriceUpdate,
    pub clearing: Clearing,
}

/// Equilibrium price for an aggregated bid: where aggregated demand is zero.
pub fn solve(aggregated: &AggregatedBid, bid_number: BidNumber) -> Equilibrium {
    let crossing = find_crossing(aggregated.bid(), Decimal::ZERO);
    let market_basis = aggregated.bid().market_basis().clone();
    let price = Price::bounded(market_basis, crossing.price);

    if crossing.clearing.is_unbounded() {
        log::warn!(
            "no equilibrium within the price range for bid {}, clamped to {} ({:?})",
            bid_number,
            price,
            crossing.clearing
        );
    }

    Equilibrium {
        price_update: PriceUpdate::new(price, bid_number),
        clearing: crossing.clearing,
    }
}
