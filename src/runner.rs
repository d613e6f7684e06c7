//! Plays a [`ClusterScenario`] against a live [`Cluster`] on a simulated clock.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

use crate::bid::{ArrayBid, Bid};
use crate::cluster::Cluster;
use crate::error::Result;
use crate::events::EventLog;
use crate::market::MarketBasis;
use crate::scenario::{ClusterScenario, ScenarioStep};
use crate::types::AgentId;

/// Outcome of a scenario run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub scenario: String,
    pub steps_played: usize,
    /// Steps the cluster refused, with the reason.
    pub failed_steps: Vec<(usize, String)>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub events: EventLog,
}

pub struct ScenarioRunner {
    scenario: ClusterScenario,
    cluster: Cluster,
    market_basis: MarketBasis,
    rng: StdRng,
    clock: DateTime<Utc>,
    started_at: DateTime<Utc>,
}

impl ScenarioRunner {
    pub fn new(scenario: ClusterScenario, start: DateTime<Utc>) -> std::result::Result<Self, String> {
        scenario.validate()?;
        let market_basis = scenario
            .market_basis()
            .cloned()
            .ok_or_else(|| "Scenario has no market basis".to_string())?;
        let cluster = Cluster::from_configs(scenario.cluster_id.clone(), &scenario.agents, start)
            .map_err(|e| format!("Could not build cluster: {}", e))?;
        let rng = match scenario.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        log::info!(
            "Scenario {}: {} agents, {} steps",
            scenario.name,
            scenario.agents.len(),
            scenario.steps.len()
        );
        Ok(Self {
            scenario,
            cluster,
            market_basis,
            rng,
            clock: start,
            started_at: start,
        })
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock
    }

    /// Plays every step. Refused steps are reported, not fatal.
    pub fn run(mut self) -> RunReport {
        let steps = std::mem::take(&mut self.scenario.steps);
        let interval = Duration::milliseconds(self.scenario.step_interval_ms);
        let mut failed_steps = Vec::new();

        for (index, step) in steps.iter().enumerate() {
            if index > 0 {
                self.advance(interval);
            }
            log::debug!("step {}: {}", index + 1, step);
            if let Err(e) = self.play(step) {
                log::warn!("step {} ({}) failed: {}", index + 1, step, e);
                failed_steps.push((index + 1, e.to_string()));
            }
        }
        // let rate-limited concentrators catch up
        self.advance(interval);
        self.cluster.tick(self.clock);

        RunReport {
            scenario: self.scenario.name.clone(),
            steps_played: steps.len(),
            failed_steps,
            started_at: self.started_at,
            finished_at: self.clock,
            events: self.cluster.events().clone(),
        }
    }

    pub fn play(&mut self, step: &ScenarioStep) -> Result<()> {
        let now = self.clock;
        match step {
            ScenarioStep::Bid { agent, demand } => {
                let bid = Bid::from_demand(self.market_basis.clone(), demand.clone())?;
                self.cluster.update_bid(agent, bid, now)
            }
            ScenarioStep::PointBid { agent, points } => {
                let bid = Bid::from_points(self.market_basis.clone(), points.clone())?;
                self.cluster.update_bid(agent, bid, now)
            }
            ScenarioStep::RandomBid { agent: Some(agent) } => {
                let bid = self.random_bid();
                self.cluster.update_bid(agent, bid, now)
            }
            ScenarioStep::RandomBid { agent: None } => {
                for device in self.scenario.devices() {
                    let bid = self.random_bid();
                    if let Err(e) = self.cluster.update_bid(&device, bid, now) {
                        log::debug!("{} skipped: {}", device, e);
                    }
                }
                Ok(())
            }
            ScenarioStep::Disconnect { agent } => {
                if !self.cluster.disconnect(agent, now) {
                    log::debug!("{} was not connected", agent);
                }
                Ok(())
            }
            ScenarioStep::Reconnect { agent, parent } => {
                if let Some(parent) = parent {
                    self.cluster.disconnect(agent, now);
                    self.cluster.set_desired_parent(agent, parent.clone())?;
                }
                self.cluster.connect(agent, now)?;
                self.cluster.reconcile(now);
                Ok(())
            }
            ScenarioStep::Remove { agent } => self.cluster.remove_agent(agent, now),
            ScenarioStep::Tick { advance_ms } => {
                self.advance(Duration::try_milliseconds(*advance_ms).unwrap_or(Duration::MAX));
                self.cluster.tick(self.clock);
                Ok(())
            }
        }
    }

    /// Moves the simulated clock forward. A step past the end of the
    /// representable time range leaves the clock where it is.
    fn advance(&mut self, delta: Duration) {
        match self.clock.checked_add_signed(delta) {
            Some(next) => self.clock = next,
            None => log::warn!("clock cannot advance by {} from {}", delta, self.clock),
        }
    }

    /// Random non-increasing demand curve, one decimal of precision.
    fn random_bid(&mut self) -> Bid {
        let steps = self.market_basis.price_steps();
        let mut demand = Vec::with_capacity(steps);
        let mut current = Decimal::new(self.rng.random_range(-20..=80), 1);
        for _ in 0..steps {
            demand.push(current);
            current -= Decimal::new(self.rng.random_range(0..=15), 1);
        }
        // non-increasing by construction
        Bid::from_demand(self.market_basis.clone(), demand)
            .unwrap_or_else(|_| Bid::from(ArrayBid::zero(self.market_basis.clone())))
    }
}

pub fn run_scenario(
    scenario: ClusterScenario,
    start: DateTime<Utc>,
) -> std::result::Result<RunReport, String> {
    Ok(ScenarioRunner::new(scenario, start)?.run())
}

/// Ids of the devices that got at least one price during the run.
pub fn priced_devices(report: &RunReport, devices: &[AgentId]) -> Vec<AgentId> {
    devices
        .iter()
        .filter(|d| !report.events.incoming_price_updates(d).is_empty())
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::create_standard_scenarios;
    use rust_decimal_macros::dec;

    fn scenario(name: &str) -> ClusterScenario {
        create_standard_scenarios().get(name).unwrap().clone()
    }

    #[test]
    fn test_basic_scenario_prices_every_device() {
        let report = run_scenario(scenario("basic"), Utc::now()).unwrap();
        assert!(report.failed_steps.is_empty(), "{:?}", report.failed_steps);
        assert_eq!(
            priced_devices(&report, &["pv_panel".into(), "freezer".into()]).len(),
            2
        );
    }

    #[test]
    fn test_basic_scenario_final_price() {
        let report = run_scenario(scenario("basic"), Utc::now()).unwrap();
        // pv [0..-10] plus a flat freezer at 2 crosses zero at 2
        let last = report
            .events
            .incoming_price_updates(&"freezer".into())
            .last()
            .cloned()
            .unwrap();
        assert_eq!(last.price.value(), dec!(2));
    }

    #[test]
    fn test_load_scenario_is_reproducible() {
        let start = Utc::now();
        let first = run_scenario(scenario("load"), start).unwrap();
        let second = run_scenario(scenario("load"), start).unwrap();
        let prices = |report: &RunReport| report.events.incoming_price_updates(&"device_0_0".into());
        assert!(!prices(&first).is_empty());
        assert_eq!(prices(&first), prices(&second));
    }

    #[test]
    fn test_oversized_tick_leaves_the_clock() {
        let start = Utc::now();
        let mut runner = ScenarioRunner::new(scenario("basic"), start).unwrap();
        runner
            .play(&ScenarioStep::Tick {
                advance_ms: i64::MAX,
            })
            .unwrap();
        assert_eq!(runner.now(), start);
        runner
            .play(&ScenarioStep::Tick { advance_ms: 1_000 })
            .unwrap();
        assert_eq!(runner.now(), start + Duration::seconds(1));
    }

    #[test]
    fn test_invalid_scenario_is_refused() {
        let mut broken = scenario("basic");
        broken.agents.retain(|a| !a.role.is_auctioneer());
        assert!(ScenarioRunner::new(broken, Utc::now()).is_err());
    }
}
