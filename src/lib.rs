pub mod agents;
pub mod aggregator;
pub mod bid;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod equilibrium;
pub mod error;
pub mod events;
pub mod market;
pub mod metrics;
pub mod price;
pub mod query;
pub mod runner;
pub mod scenario;
pub mod session;
pub mod transform;
pub mod types;

pub use bid::{ArrayBid, Bid, PointBid, PricePoint};
pub use cluster::Cluster;
pub use error::{MatcherError, Result};
pub use market::MarketBasis;
pub use price::{BidUpdate, Price, PriceUpdate};

#[cfg(test)]
mod events_test;
#[cfg(test)]
mod scenario_test;
