use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::market::MarketBasis;
use crate::transform::PeakShaving;
use crate::types::AgentId;

pub const DEFAULT_MIN_TIME_BETWEEN_BID_UPDATES_MS: i64 = 1_000;
pub const DEFAULT_MIN_TIME_BETWEEN_PRICE_UPDATES_MS: i64 = 1_000;

/// Static description of one agent of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: AgentId,
    /// Parent the agent tries to connect to. `None` only for the auctioneer.
    #[serde(default)]
    pub desired_parent_id: Option<AgentId>,
    pub role: AgentRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentRole {
    Auctioneer {
        market_basis: MarketBasis,
        #[serde(default = "default_price_interval")]
        min_time_between_price_updates_ms: i64,
    },
    Concentrator {
        #[serde(default = "default_bid_interval")]
        min_time_between_bid_updates_ms: i64,
        #[serde(default)]
        peak_shaving: Option<PeakShavingConfig>,
    },
    Device {},
}

fn default_bid_interval() -> i64 {
    DEFAULT_MIN_TIME_BETWEEN_BID_UPDATES_MS
}

fn default_price_interval() -> i64 {
    DEFAULT_MIN_TIME_BETWEEN_PRICE_UPDATES_MS
}

impl AgentRole {
    pub fn name(&self) -> &'static str {
        match self {
            AgentRole::Auctioneer { .. } => "auctioneer",
            AgentRole::Concentrator { .. } => "concentrator",
            AgentRole::Device {} => "device",
        }
    }

    pub fn is_auctioneer(&self) -> bool {
        matches!(self, AgentRole::Auctioneer { .. })
    }

    /// Whether other agents may connect to this one.
    pub fn is_matcher(&self) -> bool {
        !matches!(self, AgentRole::Device {})
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeakShavingConfig {
    pub floor: Decimal,
    pub ceiling: Decimal,
}

impl PeakShavingConfig {
    pub fn build(&self) -> Result<PeakShaving> {
        PeakShaving::new(self.floor, self.ceiling)
    }
}

impl AgentConfig {
    pub fn auctioneer(agent_id: &str, market_basis: MarketBasis) -> Self {
        Self {
            agent_id: AgentId::from(agent_id),
            desired_parent_id: None,
            role: AgentRole::Auctioneer {
                market_basis,
                min_time_between_price_updates_ms: DEFAULT_MIN_TIME_BETWEEN_PRICE_UPDATES_MS,
            },
        }
    }

    pub fn concentrator(agent_id: &str, parent_id: &str) -> Self {
        Self {
            agent_id: AgentId::from(agent_id),
            desired_parent_id: Some(AgentId::from(parent_id)),
            role: AgentRole::Concentrator {
                min_time_between_bid_updates_ms: DEFAULT_MIN_TIME_BETWEEN_BID_UPDATES_MS,
                peak_shaving: None,
            },
        }
    }

    pub fn device(agent_id: &str, parent_id: &str) -> Self {
        Self {
            agent_id: AgentId::from(agent_id),
            desired_parent_id: Some(AgentId::from(parent_id)),
            role: AgentRole::Device {},
        }
    }

    /// Concentrator only; other roles are returned unchanged.
    pub fn with_peak_shaving(mut self, floor: Decimal, ceiling: Decimal) -> Self {
        if let AgentRole::Concentrator { peak_shaving, .. } = &mut self.role {
            *peak_shaving = Some(PeakShavingConfig { floor, ceiling });
        }
        self
    }

    /// Sets the rate limit of a concentrator or an auctioneer.
    pub fn with_min_interval_ms(mut self, interval_ms: i64) -> Self {
        match &mut self.role {
            AgentRole::Concentrator {
                min_time_between_bid_updates_ms,
                ..
            } => *min_time_between_bid_updates_ms = interval_ms,
            AgentRole::Auctioneer {
                min_time_between_price_updates_ms,
                ..
            } => *min_time_between_price_updates_ms = interval_ms,
            AgentRole::Device {} => {}
        }
        self
    }

    pub fn min_time_between_updates(&self) -> Duration {
        match &self.role {
            AgentRole::Auctioneer {
                min_time_between_price_updates_ms,
                ..
            } => Duration::milliseconds(*min_time_between_price_updates_ms),
            AgentRole::Concentrator {
                min_time_between_bid_updates_ms,
                ..
            } => Duration::milliseconds(*min_time_between_bid_updates_ms),
            AgentRole::Device {} => Duration::zero(),
        }
    }

    /// Checks the parts of the configuration that do not depend on other agents.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.agent_id.as_str().is_empty() {
            return Err("Agent id must not be empty".to_string());
        }
        match &self.role {
            AgentRole::Auctioneer {
                market_basis,
                min_time_between_price_updates_ms,
            } => {
                if self.desired_parent_id.is_some() {
                    return Err(format!("Auctioneer {} must not have a parent", self.agent_id));
                }
                market_basis
                    .validate()
                    .map_err(|e| format!("Auctioneer {}: {}", self.agent_id, e))?;
                if *min_time_between_price_updates_ms < 0 {
                    return Err(format!(
                        "Auctioneer {} has a negative update interval",
                        self.agent_id
                    ));
                }
            }
            AgentRole::Concentrator {
                min_time_between_bid_updates_ms,
                peak_shaving,
            } => {
                if self.desired_parent_id.is_none() {
                    return Err(format!("Concentrator {} needs a parent", self.agent_id));
                }
                if *min_time_between_bid_updates_ms < 0 {
                    return Err(format!(
                        "Concentrator {} has a negative update interval",
                        self.agent_id
                    ));
                }
                if let Some(shaving) = peak_shaving {
                    shaving
                        .build()
                        .map_err(|e| format!("Concentrator {}: {}", self.agent_id, e))?;
                }
            }
            AgentRole::Device {} => {
                if self.desired_parent_id.is_none() {
                    return Err(format!("Device {} needs a parent", self.agent_id));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.agent_id, self.role.name())?;
        if let Some(parent) = &self.desired_parent_id {
            write!(f, " -> {}", parent)?;
        }
        if let AgentRole::Concentrator {
            peak_shaving: Some(shaving),
            ..
        } = &self.role
        {
            write!(f, " shaving [{}, {}]", shaving.floor, shaving.ceiling)?;
        }
        Ok(())
    }
}
