use anyhow::Context;
use clap::parser::ValueSource;
use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::Colorize;
use log::{info, warn};
use ppr::{
    CommandExecutor, Config, EventReporter, PPR_VERSION, PkgSettings, Renderer, RepairError,
    Sequencer, SystemExecutor, Theme, default_registry, event_queue,
    utils::{format_duration, parse_duration},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::main]
async fn main() {
    let matches = match build_cli().try_get_matches() {
        Ok(matches) => matches,
        Err(e) => e.exit(),
    };

    let default_level = if matches.get_flag("verbose") {
        "debug"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let start_time = Instant::now();
    let code = match run(&matches).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            e.downcast_ref::<RepairError>()
                .map(RepairError::exit_code)
                .unwrap_or(1)
        }
    };
    info!(
        "Finished in {} with exit code {}",
        format_duration(start_time.elapsed().as_secs()),
        code
    );
    std::process::exit(code);
}

fn build_cli() -> Command {
    Command::new("ppr")
        .version(PPR_VERSION)
        .about("Repairs a broken pkg setup: checks repositories, clears stale catalogs, forces an update and verifies the local package database.")
        .arg(Arg::new("dry-run")
            .long("dry-run")
            .action(ArgAction::SetTrue)
            .help("Report what would change without modifying anything"))
        .arg(Arg::new("compact")
            .long("compact")
            .action(ArgAction::SetTrue)
            .help("Print one line per stage without details"))
        .arg(Arg::new("report-json")
            .long("report-json")
            .value_name("PATH")
            .value_parser(clap::value_parser!(PathBuf))
            .help("Write all stage events to PATH as a JSON array"))
        .arg(Arg::new("timeout")
            .long("timeout")
            .value_name("DURATION")
            .default_value("20m")
            .value_parser(parse_timeout)
            .help("Deadline for each stage, e.g. 90s, 5m, 1h30m"))
        .arg(Arg::new("config")
            .short('c')
            .long("config")
            .value_name("CONFIG")
            .value_parser(clap::value_parser!(PathBuf))
            .help("Settings file (default: $PPR_CONFIG or ~/.config/ppr/ppr.toml)"))
        .arg(Arg::new("verbose")
            .short('v')
            .long("verbose")
            .action(ArgAction::SetTrue)
            .help("Enable debug logging"))
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
    parse_duration(value).map_err(|e| e.to_string())
}

fn build_config(matches: &ArgMatches) -> Config {
    Config {
        dry_run: matches.get_flag("dry-run"),
        compact: matches.get_flag("compact"),
        report_path: matches.get_one::<PathBuf>("report-json").cloned(),
        timeout: matches
            .get_one::<Duration>("timeout")
            .copied()
            .unwrap_or(ppr::config::DEFAULT_TIMEOUT),
    }
}

async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn run(matches: &ArgMatches) -> anyhow::Result<i32> {
    let settings = PkgSettings::load(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))
        .context("could not load settings")?;
    let config = build_config(matches);

    if matches.value_source("timeout") == Some(ValueSource::CommandLine) {
        warn!(
            "--timeout {} applies to each stage separately; a full run may take up to {} times as long",
            format_duration(config.timeout.as_secs()),
            ppr::STAGE_ORDER.len()
        );
    }
    if config.dry_run {
        info!("Dry run: no files will be removed and no pkg commands that modify state will run");
    }

    let executor: Arc<dyn CommandExecutor> = Arc::new(SystemExecutor);
    let registry = default_registry(executor, Arc::new(settings))
        .context("could not set up the repair stages")?;

    let tx = event_queue();
    let reporter = tokio::spawn(EventReporter::new(config.report_path.clone()).consume(tx.subscribe()));
    let renderer = tokio::spawn(Renderer::new(Theme::default(), config.compact).consume(tx.subscribe()));

    let sequencer = Sequencer::new(config, registry, tx);
    let outcome = tokio::select! {
        outcome = sequencer.run() => Some(outcome),
        _ = interrupted() => {
            warn!("Interrupted, stopping the current stage");
            None
        }
    };

    // The sequencer owned the only sender, so both consumers see the queue
    // close once it is gone.
    reporter.await.context("report writer stopped unexpectedly")?;
    renderer.await.context("renderer stopped unexpectedly")?;

    Ok(outcome.map(|o| o.exit_code()).unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let matches = build_cli().try_get_matches_from(["ppr"]).unwrap();
        let config = build_config(&matches);
        assert_eq!(config, Config::default());
        assert_eq!(matches.value_source("timeout"), Some(ValueSource::DefaultValue));
    }

    #[test]
    fn test_all_flags() {
        let matches = build_cli()
            .try_get_matches_from([
                "ppr",
                "--dry-run",
                "--compact",
                "--report-json",
                "/tmp/ppr.json",
                "--timeout",
                "90s",
            ])
            .unwrap();
        let config = build_config(&matches);
        assert!(config.dry_run);
        assert!(config.compact);
        assert_eq!(config.report_path, Some(PathBuf::from("/tmp/ppr.json")));
        assert_eq!(config.timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_invalid_arguments_exit_with_two() {
        let err = build_cli()
            .try_get_matches_from(["ppr", "--timeout", "soon"])
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);

        let err = build_cli()
            .try_get_matches_from(["ppr", "--timeout", "6000000000000000h"])
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);

        let err = build_cli()
            .try_get_matches_from(["ppr", "--frobnicate"])
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_cli_is_well_formed() {
        build_cli().debug_assert();
    }
}
