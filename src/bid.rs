//! Demand curves.
//!
//! A bid is a non-increasing demand-versus-price curve. It comes in two
//! interchangeable shapes: [`ArrayBid`] holds one demand value per price step
//! of the market basis, [`PointBid`] holds sparse break points with linear
//! interpolation in between. Equality is always judged on the price-step
//! (array) form.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::error::{MatcherError, Result};
use crate::market::MarketBasis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    pub price: Decimal,
    pub demand: Decimal,
}

impl PricePoint {
    pub fn new(price: Decimal, demand: Decimal) -> Self {
        Self { price, demand }
    }
}

// Linear interpolation between two break points with a.price < b.price.
// Both the sparse lookup and the dense-to-sparse reduction go through here so
// that a reduced curve reproduces the dense values exactly.
fn interpolate(a: &PricePoint, b: &PricePoint, price: Decimal) -> Decimal {
    a.demand + (b.demand - a.demand) * (price - a.price) / (b.price - a.price)
}

fn ensure_non_increasing(demand: impl Iterator<Item = Decimal>) -> Result<()> {
    let mut previous: Option<Decimal> = None;
    for (i, d) in demand.enumerate() {
        if let Some(p) = previous {
            if d > p {
                return Err(MatcherError::InvalidBidShape(format!(
                    "demand rises from {} to {} at index {}",
                    p, d, i
                )));
            }
        }
        previous = Some(d);
    }
    Ok(())
}

#[derive(Deserialize)]
struct ArrayBidFields {
    market_basis: MarketBasis,
    demand: Vec<Decimal>,
}

impl TryFrom<ArrayBidFields> for ArrayBid {
    type Error = MatcherError;

    fn try_from(fields: ArrayBidFields) -> Result<Self> {
        fields.market_basis.validate()?;
        ArrayBid::new(fields.market_basis, fields.demand)
    }
}

#[derive(Deserialize)]
struct PointBidFields {
    market_basis: MarketBasis,
    points: Vec<PricePoint>,
}

impl TryFrom<PointBidFields> for PointBid {
    type Error = MatcherError;

    fn try_from(fields: PointBidFields) -> Result<Self> {
        fields.market_basis.validate()?;
        PointBid::new(fields.market_basis, fields.points)
    }
}

/// Dense bid: one demand value per price step.
///
/// Deserialization goes through [`ArrayBid::new`], so a bid read from a file
/// holds the same invariants as one built in code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ArrayBidFields")]
pub struct ArrayBid {
    market_basis: MarketBasis,
    demand: Vec<Decimal>,
}

impl ArrayBid {
    pub fn new(market_basis: MarketBasis, demand: Vec<Decimal>) -> Result<Self> {
        if demand.len() != market_basis.price_steps() {
            return Err(MatcherError::InvalidBidShape(format!(
                "expected {} demand values, got {}",
                market_basis.price_steps(),
                demand.len()
            )));
        }
        ensure_non_increasing(demand.iter().copied())?;
        Ok(Self {
            market_basis,
            demand,
        })
    }

    /// Same demand at every price.
    pub fn flat(market_basis: MarketBasis, demand: Decimal) -> Self {
        let demand = vec![demand; market_basis.price_steps()];
        Self {
            market_basis,
            demand,
        }
    }

    pub fn zero(market_basis: MarketBasis) -> Self {
        Self::flat(market_basis, Decimal::ZERO)
    }

    pub fn market_basis(&self) -> &MarketBasis {
        &self.market_basis
    }

    pub fn demand(&self) -> &[Decimal] {
        &self.demand
    }

    pub fn demand_at_step(&self, step: usize) -> Decimal {
        self.demand[step.min(self.demand.len() - 1)]
    }

    pub fn maximum_demand(&self) -> Decimal {
        self.demand[0]
    }

    pub fn minimum_demand(&self) -> Decimal {
        self.demand[self.demand.len() - 1]
    }

    /// Demand at any price, interpolating between the neighbouring steps.
    pub fn demand_at(&self, price: Decimal) -> Decimal {
        let mb = &self.market_basis;
        let position = mb.step_position(price);
        let lower = position.floor().to_usize().unwrap_or(0);
        if lower >= self.demand.len() - 1 {
            return self.minimum_demand();
        }
        let a = PricePoint::new(mb.price_of_step(lower), self.demand[lower]);
        let b = PricePoint::new(mb.price_of_step(lower + 1), self.demand[lower + 1]);
        let price = mb.bound_price(price);
        if price == a.price {
            return a.demand;
        }
        interpolate(&a, &b, price)
    }

    /// Point-wise sum; the economic superposition of two demand curves.
    pub fn add(&self, other: &ArrayBid) -> Result<ArrayBid> {
        self.market_basis.ensure_compatible(&other.market_basis)?;
        let demand = self
            .demand
            .iter()
            .zip(other.demand.iter())
            .map(|(a, b)| a + b)
            .collect();
        // sums of non-increasing curves stay non-increasing
        Ok(ArrayBid {
            market_basis: self.market_basis.clone(),
            demand,
        })
    }

    /// Clamp every demand value into `[floor, ceiling]`.
    pub fn clamp_demand(&self, floor: Decimal, ceiling: Decimal) -> ArrayBid {
        ArrayBid {
            market_basis: self.market_basis.clone(),
            demand: self
                .demand
                .iter()
                .map(|d| (*d).max(floor).min(ceiling))
                .collect(),
        }
    }

    /// Sparse form with redundant interior points removed. Every dropped point
    /// is reproduced exactly by interpolation, so the conversion is lossless.
    pub fn to_point_bid(&self) -> PointBid {
        let mb = &self.market_basis;
        let all: Vec<PricePoint> = self
            .demand
            .iter()
            .enumerate()
            .map(|(step, d)| PricePoint::new(mb.price_of_step(step), *d))
            .collect();

        let mut points = vec![all[0]];
        let mut anchor = 0;
        let mut candidate = 1;
        while candidate < all.len() - 1 {
            let next = candidate + 1;
            let spans = (anchor + 1..next)
                .all(|i| interpolate(&all[anchor], &all[next], all[i].price) == all[i].demand);
            if !spans {
                points.push(all[candidate]);
                anchor = candidate;
            }
            candidate += 1;
        }
        points.push(all[all.len() - 1]);

        PointBid {
            market_basis: mb.clone(),
            points,
        }
    }
}

/// Sparse bid: break points ordered by price.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "PointBidFields")]
pub struct PointBid {
    market_basis: MarketBasis,
    points: Vec<PricePoint>,
}

impl PointBid {
    pub fn new(market_basis: MarketBasis, points: Vec<PricePoint>) -> Result<Self> {
        if points.is_empty() {
            return Err(MatcherError::InvalidBidShape(
                "a point bid needs at least one point".to_string(),
            ));
        }
        for (i, point) in points.iter().enumerate() {
            if !market_basis.contains_price(point.price) {
                return Err(MatcherError::InvalidBidShape(format!(
                    "point {} has price {} outside the market basis",
                    i, point.price
                )));
            }
        }
        if points.windows(2).any(|w| w[1].price < w[0].price) {
            return Err(MatcherError::InvalidBidShape(
                "points must be ordered by price".to_string(),
            ));
        }
        ensure_non_increasing(points.iter().map(|p| p.demand))?;
        Ok(Self {
            market_basis,
            points,
        })
    }

    pub fn market_basis(&self) -> &MarketBasis {
        &self.market_basis
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    /// Linear interpolation between the surrounding points, flat beyond the
    /// first and last point. At a vertical segment the lower demand wins.
    pub fn demand_at(&self, price: Decimal) -> Decimal {
        let last = self.points.len() - 1;
        match self.points.iter().rposition(|p| p.price <= price) {
            None => self.points[0].demand,
            Some(i) if i == last => self.points[last].demand,
            Some(i) => {
                let (a, b) = (&self.points[i], &self.points[i + 1]);
                if a.price == price {
                    a.demand
                } else {
                    interpolate(a, b, price)
                }
            }
        }
    }

    pub fn to_array_bid(&self) -> ArrayBid {
        let mb = &self.market_basis;
        let demand = (0..mb.price_steps())
            .map(|step| self.demand_at(mb.price_of_step(step)))
            .collect();
        ArrayBid {
            market_basis: mb.clone(),
            demand,
        }
    }
}

impl PartialEq for PointBid {
    fn eq(&self, other: &Self) -> bool {
        self.to_array_bid() == other.to_array_bid()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Bid {
    Array(ArrayBid),
    Point(PointBid),
}

impl Bid {
    pub fn from_demand(market_basis: MarketBasis, demand: Vec<Decimal>) -> Result<Self> {
        Ok(Bid::Array(ArrayBid::new(market_basis, demand)?))
    }

    pub fn from_points(market_basis: MarketBasis, points: Vec<PricePoint>) -> Result<Self> {
        Ok(Bid::Point(PointBid::new(market_basis, points)?))
    }

    pub fn market_basis(&self) -> &MarketBasis {
        match self {
            Bid::Array(b) => b.market_basis(),
            Bid::Point(b) => b.market_basis(),
        }
    }

    pub fn demand_at(&self, price: Decimal) -> Decimal {
        match self {
            Bid::Array(b) => b.demand_at(price),
            Bid::Point(b) => b.demand_at(price),
        }
    }

    pub fn to_array_bid(&self) -> ArrayBid {
        match self {
            Bid::Array(b) => b.clone(),
            Bid::Point(b) => b.to_array_bid(),
        }
    }

    pub fn to_point_bid(&self) -> PointBid {
        match self {
            Bid::Array(b) => b.to_point_bid(),
            Bid::Point(b) => b.clone(),
        }
    }
}

impl PartialEq for Bid {
    fn eq(&self, other: &Self) -> bool {
        self.to_array_bid() == other.to_array_bid()
    }
}

impl From<ArrayBid> for Bid {
    fn from(bid: ArrayBid) -> Self {
        Bid::Array(bid)
    }
}

impl From<PointBid> for Bid {
    fn from(bid: PointBid) -> Self {
        Bid::Point(bid)
    }
}
