#[cfg(test)]
mod tests {
    use super::super::config::AgentConfig;
    use super::super::market::MarketBasis;
    use super::super::scenario::*;
    use super::super::types::AgentId;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn basis() -> MarketBasis {
        MarketBasis::new("electricity", "EUR", 3, dec!(0), dec!(2)).unwrap()
    }

    fn small_scenario() -> ClusterScenario {
        let mut scenario = ClusterScenario::new("small".to_string());
        scenario.add_agent(AgentConfig::auctioneer("root", basis()));
        scenario.add_agent(AgentConfig::concentrator("c", "root"));
        scenario.add_agent(AgentConfig::device("d", "c"));
        scenario.add_step(ScenarioStep::Bid {
            agent: AgentId::from("d"),
            demand: vec![dec!(1), dec!(0), dec!(-1)],
        });
        scenario
    }

    #[test]
    fn test_scenario_creation() {
        let scenario = small_scenario();
        assert_eq!(scenario.agents.len(), 3);
        assert_eq!(scenario.name, "small");
        assert_eq!(scenario.devices(), vec![AgentId::from("d")]);
        assert_eq!(scenario.market_basis(), Some(&basis()));
        assert!(scenario.validate().is_ok());
    }

    #[test]
    fn test_scenario_validation() {
        let mut scenario = ClusterScenario::new("invalid".to_string());
        assert!(scenario.validate().is_err());

        scenario.add_agent(AgentConfig::device("d", "c"));
        assert!(scenario.validate().unwrap_err().contains("auctioneer"));

        let mut twice = small_scenario();
        twice.add_agent(AgentConfig::device("d", "c"));
        assert!(twice.validate().unwrap_err().contains("twice"));

        let mut orphan = small_scenario();
        orphan.add_agent(AgentConfig::device("e", "nowhere"));
        assert!(orphan.validate().unwrap_err().contains("unknown parent"));

        let mut leaf_parent = small_scenario();
        leaf_parent.add_agent(AgentConfig::device("e", "d"));
        assert!(leaf_parent.validate().is_err());

        let mut short_bid = small_scenario();
        short_bid.add_step(ScenarioStep::Bid {
            agent: AgentId::from("d"),
            demand: vec![Decimal::ONE],
        });
        assert!(short_bid.validate().is_err());

        let mut bad_range = small_scenario();
        bad_range.add_agent(
            AgentConfig::concentrator("shaver", "root").with_peak_shaving(dec!(1), dec!(-1)),
        );
        assert!(bad_range.validate().is_err());
    }

    #[test]
    fn test_clock_steps_are_bounded() {
        let mut slow = small_scenario();
        slow.step_interval_ms = MAX_STEP_INTERVAL_MS + 1;
        assert!(slow.validate().unwrap_err().contains("at most"));

        let mut long_tick = small_scenario();
        long_tick.add_step(ScenarioStep::Tick {
            advance_ms: i64::MAX,
        });
        assert!(long_tick.validate().unwrap_err().contains("exceeds"));

        let mut year = small_scenario();
        year.add_step(ScenarioStep::Tick {
            advance_ms: MAX_STEP_INTERVAL_MS,
        });
        assert!(year.validate().is_ok());
    }

    #[test]
    fn test_parent_cycles_are_rejected() {
        let mut scenario = small_scenario();
        scenario.add_agent(AgentConfig::concentrator("x", "y"));
        scenario.add_agent(AgentConfig::concentrator("y", "x"));
        assert!(scenario.validate().unwrap_err().contains("cycle"));
    }

    #[test]
    fn test_standard_scenarios_are_valid() {
        let scenarios = create_standard_scenarios();
        for name in ["basic", "peak_shaving", "churn", "load"] {
            let scenario = scenarios.get(name).unwrap();
            assert!(
                scenario.validate().is_ok(),
                "{}: {:?}",
                name,
                scenario.validate()
            );
        }
    }

    #[test]
    fn test_scenario_serialization() {
        let scenario = create_standard_scenarios().get("churn").unwrap().clone();

        let json = serde_json::to_string_pretty(&scenario).unwrap();
        let from_json: ClusterScenario = serde_json::from_str(&json).unwrap();
        assert_eq!(from_json.agents, scenario.agents);
        assert_eq!(from_json.steps, scenario.steps);

        let yaml = serde_yaml::to_string(&scenario).unwrap();
        let from_yaml: ClusterScenario = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(from_yaml.steps, scenario.steps);
    }

    #[test]
    fn test_yaml_scenario_file() {
        let yaml = r#"
name: from_yaml
description: hand written
cluster_id: yaml
random_seed: 7
agents:
  - agent_id: root
    role:
      type: Auctioneer
      market_basis:
        commodity: electricity
        currency: EUR
        price_steps: 3
        minimum_price: "0"
        maximum_price: "2"
  - agent_id: d
    desired_parent_id: root
    role:
      type: Device
steps:
  - type: Bid
    agent: d
    demand: ["1", "0", "-1"]
  - type: Tick
"#;
        let path = std::env::temp_dir().join("gridmatch_scenario_test.yaml");
        let path = path.to_str().unwrap();
        std::fs::write(path, yaml).unwrap();

        let scenario = ClusterScenario::load_from_file(path).unwrap();
        assert_eq!(scenario.step_interval_ms, DEFAULT_STEP_INTERVAL_MS);
        assert_eq!(scenario.steps[1], ScenarioStep::Tick { advance_ms: 0 });
        assert!(scenario.validate().is_ok());

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_scenario_display() {
        let scenarios = create_standard_scenarios();
        let display = format!("{}", scenarios.get("peak_shaving").unwrap());

        assert!(display.contains("Scenario: peak_shaving"));
        assert!(display.contains("shaver (concentrator) -> auctioneer shaving [-1, 1]"));
        assert!(display.contains("heat_pump bids"));
    }
}
