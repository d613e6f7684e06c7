//! Bid/price transforms applied by a concentrator between its children and
//! its parent.
//!
//! A transform rewrites the aggregated bid before it goes upstream and maps
//! the price coming back down before it is distributed to the children.

use rust_decimal::Decimal;
use std::fmt;

use crate::bid::ArrayBid;
use crate::equilibrium::find_crossing;
use crate::error::{MatcherError, Result};
use crate::price::Price;

pub trait PriceTransform: Send + Sync + fmt::Debug {
    /// Bid sent upstream in place of the aggregate of the children.
    fn transform_bid(&self, bid: &ArrayBid) -> ArrayBid;

    /// Price handed to the children. `original` is the untransformed
    /// aggregate the received price answers.
    fn transform_price(&self, price: &Price, original: &ArrayBid) -> Price;
}

/// Passes bids and prices through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl PriceTransform for Identity {
    fn transform_bid(&self, bid: &ArrayBid) -> ArrayBid {
        bid.clone()
    }

    fn transform_price(&self, price: &Price, _original: &ArrayBid) -> Price {
        price.clone()
    }
}

/// Limits the demand of a subtree to `[floor, ceiling]`.
///
/// Upstream sees the demand clamped into the band, so from the parent's
/// view the subtree never draws more than `ceiling` nor supplies more than
/// `-floor`. On the way down the price is moved to where the real aggregate
/// sits on the band edge it would otherwise cross.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeakShaving {
    floor: Decimal,
    ceiling: Decimal,
}

impl PeakShaving {
    pub fn new(floor: Decimal, ceiling: Decimal) -> Result<Self> {
        if floor > ceiling {
            return Err(MatcherError::InvalidRange { floor, ceiling });
        }
        Ok(Self { floor, ceiling })
    }

    pub fn floor(&self) -> Decimal {
        self.floor
    }

    pub fn ceiling(&self) -> Decimal {
        self.ceiling
    }
}

impl PriceTransform for PeakShaving {
    fn transform_bid(&self, bid: &ArrayBid) -> ArrayBid {
        bid.clamp_demand(self.floor, self.ceiling)
    }

    fn transform_price(&self, price: &Price, original: &ArrayBid) -> Price {
        let demand = original.demand_at(price.value());
        let target = if demand > self.ceiling {
            self.ceiling
        } else if demand < self.floor {
            self.floor
        } else {
            return price.clone();
        };

        let crossing = find_crossing(original, target);
        let shaved = Price::bounded(price.market_basis().clone(), crossing.price);
        log::debug!(
            "peak shaving moved {} to {} (demand {} outside [{}, {}])",
            price,
            shaved,
            demand,
            self.floor,
            self.ceiling
        );
        shaved
    }
}
