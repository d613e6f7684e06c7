//! Command-line interface for the cluster simulator.

use crate::scenario::ClusterScenario;
use lexopt::prelude::*;
use std::path::PathBuf;

/// Command-line arguments for the simulator.
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub command: Command,
    pub scenario_name: String,
    pub scenario_file: Option<PathBuf>,
    pub random_seed: Option<u64>,
    pub step_interval_ms: Option<i64>,
    pub debug: bool,
    pub verbose: bool,
    pub quiet: bool,
    pub output_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run,
    List,
    Analyze {
        file: PathBuf,
        timeline: Option<String>,
    },
    Query {
        file: PathBuf,
        filters: QueryFilters,
        csv: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilters {
    pub agent: Option<String>,
    pub event_type: Option<String>,
    pub session: Option<String>,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            command: Command::Run,
            scenario_name: "basic".to_string(),
            scenario_file: None,
            random_seed: None,
            step_interval_ms: None,
            debug: false,
            verbose: false,
            quiet: false,
            output_file: None,
        }
    }
}

pub fn parse_args() -> Result<CliArgs, lexopt::Error> {
    parse_from(lexopt::Parser::from_env())
}

pub fn parse_from(mut args: lexopt::Parser) -> Result<CliArgs, lexopt::Error> {
    let mut cli_args = CliArgs::default();
    let mut subcommand = None;
    let mut input_file = None;
    let mut timeline = None;
    let mut csv = None;
    let mut query_filters = QueryFilters::default();

    while let Some(arg) = args.next()? {
        match arg {
            Value(val) => {
                let val_str = val.string()?;
                if subcommand.is_none() {
                    subcommand = Some(val_str);
                } else {
                    input_file = Some(PathBuf::from(val_str));
                }
            }
            Long("scenario") => {
                cli_args.scenario_name = args.value()?.string()?;
            }
            Long("scenario-file") => {
                cli_args.scenario_file = Some(PathBuf::from(args.value()?.string()?));
            }
            Long("seed") => {
                cli_args.random_seed = Some(args.value()?.parse()?);
            }
            Long("step-interval") => {
                cli_args.step_interval_ms = Some(args.value()?.parse()?);
            }
            Long("debug") => cli_args.debug = true,
            Long("verbose") | Short('v') => cli_args.verbose = true,
            Long("quiet") | Short('q') => cli_args.quiet = true,
            Long("output") | Short('o') => {
                cli_args.output_file = Some(PathBuf::from(args.value()?.string()?));
            }
            Long("agent") => {
                query_filters.agent = Some(args.value()?.string()?);
            }
            Long("event-type") => {
                query_filters.event_type = Some(args.value()?.string()?);
            }
            Long("session") => {
                query_filters.session = Some(args.value()?.string()?);
            }
            Long("timeline") => {
                timeline = Some(args.value()?.string()?);
            }
            Long("csv") => {
                csv = Some(PathBuf::from(args.value()?.string()?));
            }
            Long("help") | Short('h') => {
                print_help();
                std::process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }

    cli_args.command = match subcommand.as_deref() {
        Some("analyze") => Command::Analyze {
            file: input_file.unwrap_or_else(|| PathBuf::from("cluster_events.json")),
            timeline,
        },
        Some("query") => match input_file {
            Some(file) => Command::Query {
                file,
                filters: query_filters,
                csv,
            },
            None => return Err(lexopt::Error::from("query command requires a file")),
        },
        Some("list") => Command::List,
        Some("run") | None => Command::Run,
        Some(cmd) => return Err(lexopt::Error::from(format!("Unknown command: {}", cmd))),
    };

    Ok(cli_args)
}

/// Apply CLI overrides to a scenario.
pub fn apply_overrides(scenario: &mut ClusterScenario, args: &CliArgs) {
    if let Some(seed) = args.random_seed {
        scenario.random_seed = Some(seed);
    }
    if let Some(interval) = args.step_interval_ms {
        scenario.step_interval_ms = interval;
    }
}

/// Level for `env_logger` unless `RUST_LOG` says otherwise.
pub fn log_level(args: &CliArgs) -> log::LevelFilter {
    if args.debug {
        log::LevelFilter::Debug
    } else if args.quiet {
        log::LevelFilter::Warn
    } else {
        log::LevelFilter::Info
    }
}

fn print_help() {
    println!("\nGridmatch Cluster Simulator\n");
    println!("USAGE:");
    println!("    gridmatch-sim [COMMAND] [OPTIONS]\n");

    println!("COMMANDS:");
    println!("    run              Run a cluster scenario (default)");
    println!("    list             List the built-in scenarios");
    println!("    analyze [FILE]   Compute metrics from an event file");
    println!("    query FILE       Query and filter cluster events\n");

    println!("RUN OPTIONS:");
    println!("    --scenario <NAME>          Use a built-in scenario (default: basic)");
    println!("    --scenario-file <FILE>     Load scenario from a JSON or YAML file");
    println!("    --seed <N>                 Random seed for reproducible runs");
    println!("    --step-interval <MS>       Simulated time between scenario steps\n");

    println!("OUTPUT OPTIONS:");
    println!("    -o, --output <FILE>        Write events to the specified file");
    println!("    --debug                    Enable debug logging");
    println!("    -v, --verbose              Print every event");
    println!("    -q, --quiet                Only log warnings");
    println!("    -h, --help                 Print help information\n");

    println!("ANALYZE OPTIONS:");
    println!("    --timeline <AGENT>         Chart the prices an agent received\n");

    println!("QUERY OPTIONS:");
    println!("    --agent <ID>               Filter by agent id");
    println!("    --event-type <TYPE>        Filter by event type (e.g. price, bid, stale)");
    println!("    --session <ID>             Filter by session id");
    println!("    --csv <FILE>               Export the matching events as CSV\n");

    println!("EXAMPLES:");
    println!("    gridmatch-sim run --scenario churn -o churn.json");
    println!("    gridmatch-sim analyze churn.json --timeline boiler");
    println!("    gridmatch-sim query churn.json --event-type stale -v");
}
