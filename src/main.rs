use chrono::Utc;
use gridmatch::cli::{self, CliArgs, Command};
use gridmatch::events::EventLog;
use gridmatch::metrics::MetricsCalculator;
use gridmatch::query;
use gridmatch::runner::ScenarioRunner;
use gridmatch::scenario::{ClusterScenario, create_standard_scenarios};
use std::path::Path;
use std::process;

fn main() {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Try 'gridmatch-sim --help' for more information.");
            process::exit(2);
        }
    };

    env_logger::Builder::new()
        .filter_level(cli::log_level(&args))
        .parse_env("RUST_LOG")
        .format_timestamp_millis()
        .init();

    let result = match &args.command {
        Command::Run => run_simulation(&args),
        Command::List => {
            list_scenarios();
            Ok(())
        }
        Command::Analyze { file, timeline } => analyze(file, timeline.as_deref()),
        Command::Query { file, filters, csv } => {
            query::query_events(file, filters).and_then(|events| {
                print!("{}", query::format_query_results(&events, args.verbose));
                match csv {
                    Some(path) => {
                        query::export_to_csv(&events, path)?;
                        println!("Exported {} events to {}", events.len(), path.display());
                        Ok(())
                    }
                    None => Ok(()),
                }
            })
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_scenario(args: &CliArgs) -> Result<ClusterScenario, String> {
    let mut scenario = match &args.scenario_file {
        Some(path) => ClusterScenario::load_from_file(&path.to_string_lossy())
            .map_err(|e| format!("Failed to load scenario {}: {}", path.display(), e))?,
        None => create_standard_scenarios()
            .remove(&args.scenario_name)
            .ok_or_else(|| {
                format!(
                    "Unknown scenario '{}', see 'gridmatch-sim list'",
                    args.scenario_name
                )
            })?,
    };
    cli::apply_overrides(&mut scenario, args);
    Ok(scenario)
}

fn run_simulation(args: &CliArgs) -> Result<(), String> {
    let scenario = load_scenario(args)?;
    if !args.quiet {
        println!("{}", scenario);
    }

    let report = ScenarioRunner::new(scenario, Utc::now())?.run();
    let events = report.events.events();

    if args.verbose {
        for event in &events {
            println!("{}", event);
        }
    }
    for (step, reason) in &report.failed_steps {
        println!("Step {} refused: {}", step, reason);
    }

    let metrics = MetricsCalculator::calculate_cluster_metrics(&events);
    println!("{}", metrics);

    if let Some(path) = &args.output_file {
        report
            .events
            .save_to_file(&path.to_string_lossy())
            .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
        println!("Events written to {}", path.display());
    }
    Ok(())
}

fn list_scenarios() {
    let scenarios = create_standard_scenarios();
    let mut names: Vec<&String> = scenarios.keys().collect();
    names.sort();
    println!("Built-in scenarios:");
    for name in names {
        let scenario = &scenarios[name];
        println!(
            "  {:<14} {} ({} agents, {} steps)",
            name,
            scenario.description,
            scenario.agents.len(),
            scenario.steps.len()
        );
    }
}

fn analyze(file: &Path, timeline: Option<&str>) -> Result<(), String> {
    let log = EventLog::load_from_file(&file.to_string_lossy())
        .map_err(|e| format!("Failed to read {}: {}", file.display(), e))?;
    let events = log.events();

    let metrics = MetricsCalculator::calculate_cluster_metrics(&events);
    println!("{}", metrics);

    let mut agents: Vec<_> = metrics.agents.values().collect();
    agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
    for agent in agents {
        println!("{}", agent);
    }

    if let Some(agent_id) = timeline {
        println!("{}", query::price_timeline(&events, agent_id, 60));
    }
    Ok(())
}
