//! Market basis: the commodity and price axis every bid and price refers to.

use rust_decimal::RoundingStrategy;
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{MatcherError, Result};

/// Immutable description of the traded commodity.
///
/// All arithmetic on bids and prices is defined relative to one basis. The
/// price axis is divided into `price_steps` evenly spaced steps, step 0 being
/// `minimum_price` and the last step `maximum_price`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarketBasis {
    commodity: String,
    currency: String,
    price_steps: usize,
    minimum_price: Decimal,
    maximum_price: Decimal,
}

impl MarketBasis {
    pub fn new(
        commodity: impl Into<String>,
        currency: impl Into<String>,
        price_steps: usize,
        minimum_price: Decimal,
        maximum_price: Decimal,
    ) -> Result<Self> {
        let basis = Self {
            commodity: commodity.into(),
            currency: currency.into(),
            price_steps,
            minimum_price,
            maximum_price,
        };
        basis.validate()?;
        Ok(basis)
    }

    /// Checks the invariants. Needed after deserialization, which bypasses `new`.
    pub fn validate(&self) -> Result<()> {
        if self.price_steps < 2 {
            return Err(MatcherError::InvalidMarketBasis(format!(
                "need at least 2 price steps, got {}",
                self.price_steps
            )));
        }
        if self.minimum_price >= self.maximum_price {
            return Err(MatcherError::InvalidMarketBasis(format!(
                "minimum price {} must be below maximum price {}",
                self.minimum_price, self.maximum_price
            )));
        }
        Ok(())
    }

    pub fn commodity(&self) -> &str {
        &self.commodity
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn price_steps(&self) -> usize {
        self.price_steps
    }

    pub fn minimum_price(&self) -> Decimal {
        self.minimum_price
    }

    pub fn maximum_price(&self) -> Decimal {
        self.maximum_price
    }

    /// Distance between two adjacent price steps.
    pub fn price_increment(&self) -> Decimal {
        (self.maximum_price - self.minimum_price) / Decimal::from(self.price_steps - 1)
    }

    pub fn price_of_step(&self, step: usize) -> Decimal {
        let step = step.min(self.price_steps - 1);
        if step == self.price_steps - 1 {
            // avoid accumulating the rounding of a non-terminating increment
            return self.maximum_price;
        }
        self.minimum_price + self.price_increment() * Decimal::from(step)
    }

    /// Nearest price step for a price, clamped to the basis.
    pub fn step_of_price(&self, price: Decimal) -> usize {
        let bounded = self.bound_price(price);
        let steps = ((bounded - self.minimum_price) / self.price_increment())
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        steps
            .to_usize()
            .unwrap_or(0)
            .min(self.price_steps - 1)
    }

    /// Fractional step position of a price, used for interpolation.
    pub fn step_position(&self, price: Decimal) -> Decimal {
        (self.bound_price(price) - self.minimum_price) / self.price_increment()
    }

    pub fn bound_price(&self, price: Decimal) -> Decimal {
        price.max(self.minimum_price).min(self.maximum_price)
    }

    pub fn contains_price(&self, price: Decimal) -> bool {
        price >= self.minimum_price && price <= self.maximum_price
    }

    pub fn ensure_compatible(&self, other: &MarketBasis) -> Result<()> {
        if self == other {
            Ok(())
        } else {
            Err(MatcherError::IncompatibleMarketBasis)
        }
    }
}

impl fmt::Display for MarketBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in {} [{}, {}] x{}",
            self.commodity, self.currency, self.minimum_price, self.maximum_price, self.price_steps
        )
    }
}
