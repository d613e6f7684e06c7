//! Prices and the bid/price update messages exchanged over a session.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::bid::Bid;
use crate::error::{MatcherError, Result};
use crate::market::MarketBasis;
use crate::types::BidNumber;

/// A point on the price axis of a market basis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    market_basis: MarketBasis,
    value: Decimal,
}

impl Price {
    pub fn new(market_basis: MarketBasis, value: Decimal) -> Result<Self> {
        if !market_basis.contains_price(value) {
            return Err(MatcherError::PriceOutOfRange(value));
        }
        Ok(Self {
            market_basis,
            value,
        })
    }

    /// Price at a step of the basis, always in range.
    pub fn at_step(market_basis: MarketBasis, step: usize) -> Self {
        let value = market_basis.price_of_step(step);
        Self {
            market_basis,
            value,
        }
    }

    /// Build a price, clamping the value into the basis range.
    pub fn bounded(market_basis: MarketBasis, value: Decimal) -> Self {
        let value = market_basis.bound_price(value);
        Self {
            market_basis,
            value,
        }
    }

    pub fn market_basis(&self) -> &MarketBasis {
        &self.market_basis
    }

    pub fn value(&self) -> Decimal {
        self.value
    }

    pub fn price_step(&self) -> usize {
        self.market_basis.step_of_price(self.value)
    }
}

impl PartialOrd for Price {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Price {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .cmp(&other.value)
            .then_with(|| self.market_basis.cmp(&other.market_basis))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.market_basis.currency())
    }
}

/// A bid tagged with the number its session assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidUpdate {
    pub bid: Bid,
    pub bid_number: BidNumber,
}

impl BidUpdate {
    pub fn new(bid: Bid, bid_number: BidNumber) -> Self {
        Self { bid, bid_number }
    }
}

/// A price answering one specific bid number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub price: Price,
    pub bid_number: BidNumber,
}

impl PriceUpdate {
    pub fn new(price: Price, bid_number: BidNumber) -> Self {
        Self { price, bid_number }
    }
}

impl fmt::Display for PriceUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} for bid {}", self.price, self.bid_number)
    }
}
