//! `worldline` - offline tooling for recorded turn logs

mod commands;
mod config;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use commands::AuditInput;
use config::EngineConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};
use worldline_state::Version;
use worldline_whatif::{OptionRanking, RuleTable};

fn log_arg() -> Arg {
    Arg::new("log")
        .value_parser(value_parser!(PathBuf))
        .help("JSON-lines turn log (defaults to [log].path from the config)")
}

fn version_arg(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .value_parser(value_parser!(u64))
        .help(help)
}

fn cli() -> Command {
    Command::new("worldline")
        .version(worldline_whatif::VERSION)
        .about("Verify, replay, inspect and branch recorded world turn logs")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Engine configuration TOML"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit diagnostics as JSON lines on stderr"),
        )
        .subcommand(
            Command::new("verify")
                .about("Check log structure and replay it, comparing every state hash")
                .arg(log_arg()),
        )
        .subcommand(
            Command::new("replay")
                .about("Rebuild the store from a log and list its versions")
                .arg(log_arg())
                .arg(
                    Arg::new("out")
                        .long("out")
                        .value_parser(value_parser!(PathBuf))
                        .help("Write the rebuilt log to a new file"),
                ),
        )
        .subcommand(
            Command::new("inspect")
                .about("Print one snapshot as enveloped JSON")
                .arg(log_arg())
                .arg(version_arg("version", "Version to print (defaults to head)")),
        )
        .subcommand(
            Command::new("what-if")
                .about("Branch single-variable siblings off a historical version and append them to the log")
                .arg(log_arg())
                .arg(
                    Arg::new("catalog")
                        .long("catalog")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Variable catalog TOML"),
                )
                .arg(
                    Arg::new("decision-point")
                        .long("decision-point")
                        .required(true)
                        .help("Decision point the siblings are generated for"),
                )
                .arg(version_arg("base", "Base version (defaults to head)"))
                .arg(
                    Arg::new("k")
                        .short('k')
                        .long("k")
                        .value_parser(value_parser!(usize))
                        .help("Number of siblings"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("sequential")
                        .long("sequential")
                        .action(ArgAction::SetTrue)
                        .help("Materialize siblings one at a time"),
                )
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .action(ArgAction::SetTrue)
                        .help("Branch in memory only; do not append the siblings to the log"),
                )
                .arg(
                    Arg::new("out")
                        .long("out")
                        .value_parser(value_parser!(PathBuf))
                        .help("Also write the sibling records to this JSON file"),
                ),
        )
        .subcommand(
            Command::new("audit")
                .about("Compare recorded decisions across a base and its siblings")
                .arg(
                    Arg::new("perturbations")
                        .long("perturbations")
                        .required_unless_present("show-rules")
                        .value_parser(value_parser!(PathBuf))
                        .help("Sibling records written by what-if --out"),
                )
                .arg(
                    Arg::new("decisions")
                        .long("decisions")
                        .required_unless_present("show-rules")
                        .value_parser(value_parser!(PathBuf))
                        .help("Decision records, one JSON object per line"),
                )
                .arg(
                    Arg::new("decision-point")
                        .long("decision-point")
                        .required_unless_present("show-rules"),
                )
                .arg(version_arg("base", "Base version").required_unless_present("show-rules"))
                .arg(
                    Arg::new("ranking")
                        .long("ranking")
                        .value_delimiter(',')
                        .required_unless_present("show-rules")
                        .help("Options from least to most aggressive, comma separated"),
                )
                .arg(
                    Arg::new("catalog")
                        .long("catalog")
                        .value_parser(value_parser!(PathBuf))
                        .help("Catalog carrying variable profiles"),
                )
                .arg(
                    Arg::new("rules")
                        .long("rules")
                        .value_parser(value_parser!(PathBuf))
                        .help("Replacement rule table TOML"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                )
                .arg(
                    Arg::new("show-rules")
                        .long("show-rules")
                        .action(ArgAction::SetTrue)
                        .help("Print the active rule table and exit"),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

/// Apply a log path given on the command line over the configured one
fn with_log_arg(config: EngineConfig, args: &ArgMatches) -> EngineConfig {
    match args.try_get_one::<PathBuf>("log").ok().flatten() {
        Some(path) => config.with_log_path(path),
        None => config,
    }
}

fn log_path(config: &EngineConfig) -> Result<&Path> {
    config
        .log
        .path
        .as_deref()
        .context("no log file given and none configured under [log].path")
}

fn version(args: &ArgMatches, name: &str) -> Option<Version> {
    args.get_one::<u64>(name).copied().map(Version)
}

fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::new(),
    };
    tracing::debug!(?config, "configuration loaded");

    let Some((name, args)) = matches.subcommand() else {
        return Ok(());
    };
    let config = with_log_arg(config, args);
    tracing::debug!(command = name, log = ?config.log.path, "starting");

    match (name, args) {
        ("verify", _) => {
            let summary = commands::verify(log_path(&config)?)?;
            println!("{summary}");
        }
        ("replay", args) => {
            let out = args.get_one::<PathBuf>("out").map(PathBuf::as_path);
            let engine = commands::replay(log_path(&config)?, out)?;
            print!("{}", commands::history(&engine)?);
        }
        ("inspect", args) => {
            let engine = commands::replay(log_path(&config)?, None)?;
            println!("{}", commands::inspect(&engine, version(args, "version"))?);
        }
        ("what-if", args) => {
            let log = log_path(&config)?;
            let engine = if args.get_flag("dry-run") {
                commands::replay(log, None)?
            } else {
                commands::extend(log)?
            };
            let mut whatif = config.whatif.clone();
            if let Some(k) = args.get_one::<usize>("k") {
                whatif = whatif.with_k(*k);
            }
            if let Some(seed) = args.get_one::<u64>("seed") {
                whatif = whatif.with_seed(*seed);
            }
            if args.get_flag("sequential") {
                whatif = whatif.with_parallel(false);
            }
            let config = config.with_whatif(whatif);
            config.validate()?;

            let siblings = commands::what_if(
                &engine,
                version(args, "base"),
                required(args, "decision-point")?,
                required_path(args, "catalog")?,
                config.whatif.clone(),
            )?;
            let json = serde_json::to_string_pretty(&siblings)?;
            if let Some(out) = args.get_one::<PathBuf>("out") {
                std::fs::write(out, &json)
                    .with_context(|| format!("writing {}", out.display()))?;
            }
            println!("{json}");
        }
        ("audit", args) => {
            if args.get_flag("show-rules") {
                let rules = match args.get_one::<PathBuf>("rules") {
                    Some(path) => RuleTable::from_toml_str(&std::fs::read_to_string(path)?)?,
                    None => RuleTable::default(),
                };
                print!("{rules}");
                return Ok(());
            }
            let ranking = OptionRanking::ordered(
                args.get_many::<String>("ranking")
                    .context("--ranking is required")?
                    .cloned(),
            );
            let report = commands::audit(&AuditInput {
                base: version(args, "base").context("--base is required")?,
                decision_point: required(args, "decision-point")?,
                perturbations: required_path(args, "perturbations")?,
                decisions: required_path(args, "decisions")?,
                ranking,
                catalog: args.get_one::<PathBuf>("catalog").map(PathBuf::as_path),
                rules: args.get_one::<PathBuf>("rules").map(PathBuf::as_path),
            })?;
            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{report}");
            }
        }
        _ => {}
    }
    Ok(())
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
    args.get_one::<String>(name)
        .map(String::as_str)
        .with_context(|| format!("--{name} is required"))
}

fn required_path<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a Path> {
    args.get_one::<PathBuf>(name)
        .map(PathBuf::as_path)
        .with_context(|| format!("--{name} is required"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn audit_ranking_splits_on_commas() {
        let m = cli()
            .try_get_matches_from([
                "worldline",
                "audit",
                "--perturbations",
                "p.json",
                "--decisions",
                "d.jsonl",
                "--decision-point",
                "dp-1",
                "--base",
                "0",
                "--ranking",
                "hold,deliberate,aggressive",
            ])
            .unwrap();
        let (_, args) = m.subcommand().unwrap();
        let ranking: Vec<&String> = args.get_many::<String>("ranking").unwrap().collect();
        assert_eq!(ranking, ["hold", "deliberate", "aggressive"]);
        assert_eq!(version(args, "base"), Some(Version(0)));
    }

    #[test]
    fn show_rules_needs_nothing_else() {
        assert!(cli()
            .try_get_matches_from(["worldline", "audit", "--show-rules"])
            .is_ok());
        assert!(cli().try_get_matches_from(["worldline", "audit"]).is_err());
    }

    #[test]
    fn config_flag_is_global() {
        let m = cli()
            .try_get_matches_from(["worldline", "verify", "turns.jsonl", "--config", "engine.toml"])
            .unwrap();
        assert_eq!(
            m.get_one::<PathBuf>("config"),
            Some(&PathBuf::from("engine.toml"))
        );
    }
}
