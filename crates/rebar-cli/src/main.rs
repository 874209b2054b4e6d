//! `rebar-resize`: enlarge GPU BARs behind PCIe switch chains.
//!
//! ```text
//! USAGE:
//!   rebar-resize                     Diagnose, confirm, resize, verify (root)
//!   rebar-resize --diagnose          Print current state only
//!   rebar-resize --force             Skip the confirmation prompt
//!   rebar-resize --config <path>     Topology and settings (TOML)
//!   rebar-resize --target-index <n>  Override the size index (15 = 32 GB)
//!   rebar-resize --simulate          Rehearse against a simulated bus
//! ```
//!
//! Exit status: 0 on success, diagnose-only or a declined prompt; 1 on a
//! fatal error; 2 when the procedure ran but verification failed.

use anyhow::{Context, Result};
use clap::Parser;
use rebar_chip::{format_size, SizeIndex};
use rebar_driver::{diagnostics, preflight, BusOperator, BusPort, Config, MemoryBus, SysfsBus};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Exit status when the procedure completed but verification failed
const EXIT_NOT_VERIFIED: u8 = 2;

/// Size index the simulated GPUs start at (256 MB)
const SIMULATED_START_INDEX: u8 = 8;

#[derive(Parser)]
#[command(
    name = "rebar-resize",
    about = "Resize GPU BARs and rebuild the bridge windows above them",
    version
)]
struct Cli {
    /// Print diagnostics and exit without changing anything.
    #[arg(long)]
    diagnose: bool,

    /// Do not ask for confirmation.
    #[arg(long)]
    force: bool,

    /// Configuration file (TOML). Falls back to $REBAR_CONFIG, then built-in defaults.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Target size index (bytes = 1 MB << index).
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u8).range(0..=63))]
    target_index: Option<u8>,

    /// Run against an in-memory bus built from the configuration.
    #[arg(long)]
    simulate: bool,
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(index) = cli.target_index {
        config = config.with_target(index)?;
    }

    if cli.simulate {
        tracing::info!("Simulation: no hardware will be touched");
        let start = SizeIndex::new(SIMULATED_START_INDEX)?;
        let mut bus = MemoryBus::from_config(&config, start);
        return execute(&mut bus, &config, &cli, true);
    }

    if !cli.diagnose {
        preflight::check(&config).context("preflight")?;
    }
    let mut bus = SysfsBus::from_paths(&config.paths);
    execute(&mut bus, &config, &cli, cli.force)
}

fn execute<P: BusPort>(
    bus: &mut P,
    config: &Config,
    cli: &Cli,
    skip_prompt: bool,
) -> Result<ExitCode> {
    let before = diagnostics::diagnose(&*bus, config);
    if cli.diagnose {
        return Ok(ExitCode::SUCCESS);
    }

    if !skip_prompt && !confirm(config)? {
        tracing::info!("Aborted, nothing changed");
        return Ok(ExitCode::SUCCESS);
    }

    let report = BusOperator::new(bus, config)
        .run(&before)
        .context("resize procedure failed")?;

    for write in &report.writes {
        let after = write.after.map_or_else(|| "?".to_string(), |i| i.to_string());
        match &write.reason {
            Some(reason) => println!("{}  index {after}  ({reason})", write.address),
            None => println!("{}  index {after}", write.address),
        }
    }
    println!(
        "{} of {} GPU(s) present, {} resized",
        report.verification.found,
        report.verification.expected,
        report
            .verification
            .devices
            .iter()
            .filter(|d| d.verdict.passed())
            .count()
    );

    if report.passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_NOT_VERIFIED))
    }
}

fn confirm(config: &Config) -> Result<bool> {
    let mut stderr = std::io::stderr();
    write!(
        stderr,
        "Resize {} GPU(s) to {} and rebuild their bridges? [y/N] ",
        config.topology.gpu_devices().len(),
        format_size(config.target.bytes())
    )?;
    stderr.flush()?;

    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("reading confirmation")?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "Yes" | "YES"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn target_index_is_range_checked() {
        assert!(Cli::try_parse_from(["rebar-resize", "--target-index", "15"]).is_ok());
        assert!(Cli::try_parse_from(["rebar-resize", "--target-index", "64"]).is_err());
    }
}
