// IPS Harness - Main Entry Point
//
// Command-line front end for the validation harness:
// - run:         full protocol against a subject (requires root)
// - rules:       show the parsed NFQUEUE rules for the configured queue
// - baseline:    loopback rounds only, no rule and no subject
// - show-config: print the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ips_harness::config::Config;
use ips_harness::firewall::{FirewallRuleController, IptablesBackend};
use ips_harness::harness::{Harness, HarnessOptions};
use ips_harness::report::{ResultAccumulator, RunReport};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// Black-box validation harness for NFQUEUE intrusion prevention
#[derive(Parser, Debug)]
#[command(name = "ips-harness")]
#[command(author = "IPS Harness Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Validates an NFQUEUE intrusion-prevention program over loopback", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full validation protocol
    Run {
        /// Subject executable
        #[arg(long)]
        subject: Option<PathBuf>,

        /// TCP port used for the echo rounds
        #[arg(long)]
        port: Option<u16>,

        /// NFQUEUE number the subject listens on
        #[arg(long)]
        queue: Option<u16>,

        /// Write a JSON report to this path
        #[arg(long)]
        report: Option<PathBuf>,

        /// Do not require root (only useful with a non-iptables binary)
        #[arg(long)]
        skip_privilege_check: bool,
    },
    /// List the redirect rules for the configured queue
    Rules,
    /// Run the loopback rounds without a rule or subject
    Baseline {
        /// TCP port used for the echo rounds (0 picks a free port)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = ips_harness::logging::init(&config.logging, args.verbose) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    match dispatch(args.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
}

async fn dispatch(command: Commands, mut config: Config) -> Result<()> {
    match command {
        Commands::Run {
            subject,
            port,
            queue,
            report,
            skip_privilege_check,
        } => {
            if let Some(subject) = subject {
                config.subject.executable = Some(subject);
            }
            if let Some(port) = port {
                config.rounds.port = port;
            }
            if let Some(queue) = queue {
                config.firewall.queue_num = queue;
            }
            config.validate()?;
            run(config, report, skip_privilege_check).await
        }
        Commands::Rules => list_rules(&config).await,
        Commands::Baseline { port } => {
            if let Some(port) = port {
                config.rounds.port = port;
            }
            config.validate()?;
            baseline(config).await
        }
        Commands::ShowConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run(config: Config, report: Option<PathBuf>, skip_privilege_check: bool) -> Result<()> {
    info!(
        "Validating subject on port {} via queue {}",
        config.rounds.port, config.firewall.queue_num
    );

    let backend = Arc::new(IptablesBackend::new(&config.firewall));
    let harness = Harness::new(
        config,
        backend,
        HarnessOptions {
            skip_privilege_check,
        },
    );

    let acc = harness.run().await?;
    finish(&acc, report.as_deref())
}

async fn baseline(config: Config) -> Result<()> {
    let backend = Arc::new(IptablesBackend::new(&config.firewall));
    let harness = Harness::new(config, backend, HarnessOptions::default());

    let acc = harness.run_baseline_only().await?;
    finish(&acc, None)
}

async fn list_rules(config: &Config) -> Result<()> {
    let backend = Arc::new(IptablesBackend::new(&config.firewall));
    let controller = FirewallRuleController::new(backend, &config.firewall);

    let rules = controller
        .list_rules()
        .await
        .context("Failed to read firewall rules")?;

    println!(
        "Queue {} ({}): {} rule line(s), {} port(s)",
        controller.queue_num(),
        controller.backend_name(),
        rules.marker_lines(),
        rules.len()
    );
    for rule in rules.rules() {
        println!("  port {:<5} {:?}", rule.port, rule.direction);
    }
    for anomaly in rules.anomalies() {
        println!("  line {}: {} ({})", anomaly.line_number, anomaly.reason, anomaly.line);
    }

    Ok(())
}

fn finish(acc: &ResultAccumulator, report: Option<&std::path::Path>) -> Result<()> {
    println!("{}", acc.summary().render());

    if let Some(path) = report {
        RunReport::from_accumulator(acc).write_to(path)?;
        info!("Report written to {:?}", path);
    }

    Ok(())
}
