use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use crate::bid::PricePoint;
use crate::config::{AgentConfig, AgentRole};
use crate::market::MarketBasis;
use crate::types::{AgentId, ClusterId};

pub const DEFAULT_STEP_INTERVAL_MS: i64 = 1_000;
/// Longest time a single step may advance the clock: one year.
pub const MAX_STEP_INTERVAL_MS: i64 = 365 * 24 * 60 * 60 * 1_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterScenario {
    pub name: String,
    pub description: String,
    pub cluster_id: ClusterId,
    pub agents: Vec<AgentConfig>,
    pub steps: Vec<ScenarioStep>,
    /// Simulated time between two steps.
    #[serde(default = "default_step_interval")]
    pub step_interval_ms: i64,
    pub random_seed: Option<u64>,
}

fn default_step_interval() -> i64 {
    DEFAULT_STEP_INTERVAL_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ScenarioStep {
    /// Dense demand curve, one value per price step.
    Bid { agent: AgentId, demand: Vec<Decimal> },
    /// Sparse demand curve given as (price, demand) break points.
    PointBid {
        agent: AgentId,
        points: Vec<PricePoint>,
    },
    /// Random non-increasing curve for one device, or every device if `agent`
    /// is not set.
    RandomBid {
        #[serde(default)]
        agent: Option<AgentId>,
    },
    Disconnect { agent: AgentId },
    /// Reconnect, optionally to a new parent, and re-wire the subtree.
    Reconnect {
        agent: AgentId,
        #[serde(default)]
        parent: Option<AgentId>,
    },
    Remove { agent: AgentId },
    /// Advance the clock and flush rate-limited updates.
    Tick {
        #[serde(default)]
        advance_ms: i64,
    },
}

impl ScenarioStep {
    pub fn agent(&self) -> Option<&AgentId> {
        match self {
            ScenarioStep::Bid { agent, .. }
            | ScenarioStep::PointBid { agent, .. }
            | ScenarioStep::Disconnect { agent }
            | ScenarioStep::Reconnect { agent, .. }
            | ScenarioStep::Remove { agent } => Some(agent),
            ScenarioStep::RandomBid { agent } => agent.as_ref(),
            ScenarioStep::Tick { .. } => None,
        }
    }
}

impl fmt::Display for ScenarioStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioStep::Bid { agent, demand } => write!(f, "{} bids {:?}", agent, demand),
            ScenarioStep::PointBid { agent, points } => {
                write!(f, "{} bids {} points", agent, points.len())
            }
            ScenarioStep::RandomBid { agent: Some(agent) } => write!(f, "{} bids randomly", agent),
            ScenarioStep::RandomBid { agent: None } => write!(f, "all devices bid randomly"),
            ScenarioStep::Disconnect { agent } => write!(f, "{} disconnects", agent),
            ScenarioStep::Reconnect {
                agent,
                parent: Some(parent),
            } => write!(f, "{} reconnects to {}", agent, parent),
            ScenarioStep::Reconnect { agent, parent: None } => write!(f, "{} reconnects", agent),
            ScenarioStep::Remove { agent } => write!(f, "{} is removed", agent),
            ScenarioStep::Tick { advance_ms } => write!(f, "tick +{}ms", advance_ms),
        }
    }
}

impl ClusterScenario {
    pub fn new(name: String) -> Self {
        Self {
            cluster_id: ClusterId::new(name.clone()),
            name,
            description: String::new(),
            agents: Vec::new(),
            steps: Vec::new(),
            step_interval_ms: DEFAULT_STEP_INTERVAL_MS,
            random_seed: None,
        }
    }

    pub fn add_agent(&mut self, config: AgentConfig) {
        self.agents.push(config);
    }

    pub fn add_step(&mut self, step: ScenarioStep) {
        self.steps.push(step);
    }

    pub fn market_basis(&self) -> Option<&MarketBasis> {
        self.agents.iter().find_map(|a| match &a.role {
            AgentRole::Auctioneer { market_basis, .. } => Some(market_basis),
            _ => None,
        })
    }

    pub fn devices(&self) -> Vec<AgentId> {
        self.agents
            .iter()
            .filter(|a| matches!(a.role, AgentRole::Device {}))
            .map(|a| a.agent_id.clone())
            .collect()
    }

    pub fn save_to_file(&self, path: &str) -> std::io::Result<()> {
        let text = if is_yaml(path) {
            serde_yaml::to_string(self).map_err(std::io::Error::other)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Loads a scenario from JSON, or YAML for `.yaml`/`.yml` files.
    pub fn load_from_file(path: &str) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let scenario: Self = if is_yaml(path) {
            serde_yaml::from_str(&text).map_err(std::io::Error::other)?
        } else {
            serde_json::from_str(&text)?
        };
        Ok(scenario)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.agents.is_empty() {
            return Err("Scenario must have at least one agent".to_string());
        }
        if self.step_interval_ms < 0 {
            return Err("Step interval must not be negative".to_string());
        }
        if self.step_interval_ms > MAX_STEP_INTERVAL_MS {
            return Err(format!(
                "Step interval must be at most {} ms",
                MAX_STEP_INTERVAL_MS
            ));
        }

        let auctioneers = self.agents.iter().filter(|a| a.role.is_auctioneer()).count();
        if auctioneers != 1 {
            return Err(format!(
                "Scenario must have exactly one auctioneer, found {}",
                auctioneers
            ));
        }

        let mut roles: BTreeMap<&AgentId, &AgentRole> = BTreeMap::new();
        for agent in &self.agents {
            agent.validate()?;
            if roles.insert(&agent.agent_id, &agent.role).is_some() {
                return Err(format!("Agent {} is defined twice", agent.agent_id));
            }
        }

        let parents: BTreeMap<&AgentId, &AgentId> = self
            .agents
            .iter()
            .filter_map(|a| a.desired_parent_id.as_ref().map(|p| (&a.agent_id, p)))
            .collect();
        for (child, parent) in &parents {
            match roles.get(parent) {
                None => return Err(format!("Agent {} has unknown parent {}", child, parent)),
                Some(role) if !role.is_matcher() => {
                    return Err(format!("Agent {} cannot be the parent of {}", parent, child));
                }
                Some(_) => {}
            }
        }

        for start in parents.keys() {
            let mut seen = BTreeSet::new();
            let mut current = *start;
            while let Some(parent) = parents.get(current) {
                if !seen.insert(current) {
                    return Err(format!("Agent {} is part of a parent cycle", start));
                }
                current = *parent;
            }
        }

        let price_steps = self.market_basis().map(|mb| mb.price_steps());
        for (index, step) in self.steps.iter().enumerate() {
            if let Some(agent) = step.agent() {
                if !roles.contains_key(agent) {
                    return Err(format!("Step {} refers to unknown agent {}", index + 1, agent));
                }
            }
            match step {
                ScenarioStep::Bid { agent, demand } => {
                    if !matches!(roles.get(agent), Some(AgentRole::Device {})) {
                        return Err(format!("Step {}: {} is not a device", index + 1, agent));
                    }
                    if Some(demand.len()) != price_steps {
                        return Err(format!(
                            "Step {}: bid of {} has {} values",
                            index + 1,
                            agent,
                            demand.len()
                        ));
                    }
                }
                ScenarioStep::PointBid { agent, .. } => {
                    if !matches!(roles.get(agent), Some(AgentRole::Device {})) {
                        return Err(format!("Step {}: {} is not a device", index + 1, agent));
                    }
                }
                ScenarioStep::Reconnect {
                    parent: Some(parent),
                    ..
                } if !roles.get(parent).is_some_and(|r| r.is_matcher()) => {
                    return Err(format!(
                        "Step {}: {} cannot be a parent",
                        index + 1,
                        parent
                    ));
                }
                ScenarioStep::Tick { advance_ms } if *advance_ms < 0 => {
                    return Err(format!("Step {}: time cannot go backwards", index + 1));
                }
                ScenarioStep::Tick { advance_ms } if *advance_ms > MAX_STEP_INTERVAL_MS => {
                    return Err(format!(
                        "Step {}: tick of {} ms exceeds {} ms",
                        index + 1,
                        advance_ms,
                        MAX_STEP_INTERVAL_MS
                    ));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

fn is_yaml(path: &str) -> bool {
    matches!(
        Path::new(path).extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

impl fmt::Display for ClusterScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Scenario: {}", self.name)?;
        writeln!(f, "Description: {}", self.description)?;
        writeln!(f, "Cluster: {}", self.cluster_id)?;
        if let Some(mb) = self.market_basis() {
            writeln!(f, "Market: {}", mb)?;
        }

        writeln!(f, "\nAgents:")?;
        for agent in &self.agents {
            writeln!(f, "  {}", agent)?;
        }

        writeln!(f, "\nSteps ({} ms apart):", self.step_interval_ms)?;
        for (index, step) in self.steps.iter().enumerate() {
            writeln!(f, "  {:>3}. {}", index + 1, step)?;
        }

        Ok(())
    }
}

fn electricity() -> Option<MarketBasis> {
    MarketBasis::new(
        "electricity",
        "EUR",
        11,
        Decimal::ZERO,
        Decimal::from(10),
    )
    .ok()
}

fn demand(values: &[i64]) -> Vec<Decimal> {
    values.iter().map(|v| Decimal::from(*v)).collect()
}

fn bid(agent: &str, values: &[i64]) -> ScenarioStep {
    ScenarioStep::Bid {
        agent: AgentId::from(agent),
        demand: demand(values),
    }
}

pub fn create_standard_scenarios() -> HashMap<String, ClusterScenario> {
    let mut scenarios = HashMap::new();
    let Some(market_basis) = electricity() else {
        return scenarios;
    };

    let mut basic = ClusterScenario::new("basic".to_string());
    basic.description = "One concentrator with a pv panel and a freezer".to_string();
    basic.add_agent(
        AgentConfig::auctioneer("auctioneer", market_basis.clone()).with_min_interval_ms(0),
    );
    basic.add_agent(
        AgentConfig::concentrator("concentrator", "auctioneer").with_min_interval_ms(0),
    );
    basic.add_agent(AgentConfig::device("pv_panel", "concentrator"));
    basic.add_agent(AgentConfig::device("freezer", "concentrator"));
    basic.add_step(bid("pv_panel", &[0, -1, -2, -3, -4, -5, -6, -7, -8, -9, -10]));
    basic.add_step(bid("freezer", &[2, 2, 2, 2, 2, 1, 1, 1, 0, 0, 0]));
    basic.add_step(bid("freezer", &[2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2]));
    scenarios.insert("basic".to_string(), basic);

    let mut shaving = ClusterScenario::new("peak_shaving".to_string());
    shaving.description = "A concentrator limiting its subtree to [-1, 1]".to_string();
    shaving.add_agent(
        AgentConfig::auctioneer("auctioneer", market_basis.clone()).with_min_interval_ms(0),
    );
    shaving.add_agent(
        AgentConfig::concentrator("shaver", "auctioneer")
            .with_min_interval_ms(0)
            .with_peak_shaving(Decimal::NEGATIVE_ONE, Decimal::ONE),
    );
    shaving.add_agent(AgentConfig::device("heat_pump", "shaver"));
    shaving.add_agent(AgentConfig::device("factory", "auctioneer"));
    shaving.add_step(bid("heat_pump", &[2, 1, 0, -1, -2, -3, -4, -5, -6, -7, -8]));
    shaving.add_step(bid("factory", &[10; 11]));
    scenarios.insert("peak_shaving".to_string(), shaving);

    let mut churn = ClusterScenario::new("churn".to_string());
    churn.description = "Devices and a concentrator dropping out and coming back".to_string();
    churn.add_agent(
        AgentConfig::auctioneer("auctioneer", market_basis.clone()).with_min_interval_ms(0),
    );
    for concentrator in ["north", "south"] {
        churn.add_agent(
            AgentConfig::concentrator(concentrator, "auctioneer").with_min_interval_ms(0),
        );
    }
    churn.add_agent(AgentConfig::device("boiler", "north"));
    churn.add_agent(AgentConfig::device("ev_charger", "north"));
    churn.add_agent(AgentConfig::device("battery", "south"));
    churn.add_step(bid("boiler", &[3, 3, 2, 2, 1, 1, 0, 0, 0, 0, 0]));
    churn.add_step(bid("ev_charger", &[5, 5, 5, 4, 3, 2, 1, 0, 0, 0, 0]));
    churn.add_step(bid("battery", &[4, 3, 2, 1, 0, -1, -2, -3, -4, -5, -6]));
    churn.add_step(ScenarioStep::Disconnect {
        agent: AgentId::from("ev_charger"),
    });
    churn.add_step(ScenarioStep::Disconnect {
        agent: AgentId::from("north"),
    });
    churn.add_step(bid("boiler", &[1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0]));
    churn.add_step(ScenarioStep::Reconnect {
        agent: AgentId::from("north"),
        parent: None,
    });
    churn.add_step(ScenarioStep::Reconnect {
        agent: AgentId::from("ev_charger"),
        parent: Some(AgentId::from("south")),
    });
    churn.add_step(bid("ev_charger", &[6, 5, 4, 3, 2, 1, 0, 0, 0, 0, 0]));
    scenarios.insert("churn".to_string(), churn);

    let mut load = ClusterScenario::new("load".to_string());
    load.description = "Many devices under rate-limited concentrators".to_string();
    load.random_seed = Some(42);
    load.add_agent(AgentConfig::auctioneer("auctioneer", market_basis).with_min_interval_ms(0));
    for c in 0..4 {
        let concentrator = format!("concentrator_{}", c);
        load.add_agent(
            AgentConfig::concentrator(&concentrator, "auctioneer").with_min_interval_ms(2_000),
        );
        for d in 0..8 {
            load.add_agent(AgentConfig::device(&format!("device_{}_{}", c, d), &concentrator));
        }
    }
    for _ in 0..10 {
        load.add_step(ScenarioStep::RandomBid { agent: None });
        load.add_step(ScenarioStep::Tick { advance_ms: 1_000 });
    }
    scenarios.insert("load".to_string(), load);

    scenarios
}
