use edgefuzz_core::config::{
    ConfigInputDelivery, EdgefuzzConfig, ExecutorType as ConfigExecutorType,
};
use edgefuzz_core::executor::{
    CommandExecutor, CommandExecutorConfig, Executor, InProcessExecutor,
    InputDelivery as CoreInputDelivery,
};
use edgefuzz_core::{Engine, StdFileSystem};

use clap::Parser;
use log::{info, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Seed directory.
    #[clap(short, long)]
    input_dir: Option<PathBuf>,
    /// Findings directory.
    #[clap(short, long)]
    output_dir: Option<PathBuf>,
    /// Dictionary file or directory of token files.
    #[clap(short = 'x', long)]
    extras: Option<PathBuf>,
    /// Execution timeout in milliseconds.
    #[clap(short, long)]
    timeout_ms: Option<u64>,
    #[clap(long)]
    max_execs: Option<u64>,
    #[clap(long)]
    max_cycles: Option<u64>,
    /// RNG seed; a time-based seed is used when absent.
    #[clap(long)]
    seed: Option<u64>,
    /// Skip the deterministic stages.
    #[clap(short = 'd', long)]
    skip_deterministic: bool,
    /// Fuzz without coverage feedback.
    #[clap(short = 'n', long)]
    dumb_mode: bool,
    /// Keep fuzzing into the existing output directory.
    #[clap(long)]
    resume: bool,
    #[clap(long)]
    target_command: Option<String>,
}

/// Demo target: a few nested byte checks, with coverage recorded per matched prefix.
fn demo_harness(data: &[u8], trace: &mut [u8]) {
    trace[0] = trace[0].wrapping_add(1);
    let depth = b"BAD!"
        .iter()
        .zip(data)
        .take_while(|(want, got)| want == got)
        .count();
    for level in 0..depth {
        trace[1 + level] = trace[1 + level].wrapping_add(1);
    }
    if depth == 4 {
        panic!("BAD input detected by harness!");
    }
    if data.starts_with(b"CRAS") {
        panic!("CRASH input detected by harness!");
    }
}

fn load_config(cli: &Cli) -> Result<EdgefuzzConfig, anyhow::Error> {
    match &cli.config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            EdgefuzzConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                info!("No config file specified via CLI, loading default: {default_config_path:?}");
                EdgefuzzConfig::load_from_file(&default_config_path)
            } else {
                info!(
                    "No config file specified and default 'config.toml' not found, using built-in defaults."
                );
                Ok(EdgefuzzConfig::default())
            }
        }
    }
}

fn apply_overrides(config: &mut EdgefuzzConfig, cli: Cli) {
    let fuzzer = &mut config.fuzzer;
    if let Some(dir) = cli.input_dir {
        fuzzer.input_dir = dir;
    }
    if let Some(dir) = cli.output_dir {
        fuzzer.output_dir = dir;
    }
    if cli.extras.is_some() {
        fuzzer.extras = cli.extras;
    }
    if cli.timeout_ms.is_some() {
        fuzzer.timeout_ms = cli.timeout_ms;
    }
    if cli.max_execs.is_some() {
        fuzzer.max_execs = cli.max_execs;
    }
    if cli.max_cycles.is_some() {
        fuzzer.max_cycles = cli.max_cycles;
    }
    if cli.seed.is_some() {
        fuzzer.seed = cli.seed;
    }
    fuzzer.skip_deterministic |= cli.skip_deterministic;
    fuzzer.dumb_mode |= cli.dumb_mode;
    fuzzer.resume |= cli.resume;

    if let Some(target_cmd_str) = cli.target_command {
        if config.executor.executor_type == ConfigExecutorType::Command {
            let cmd_settings = config.executor.command_settings.get_or_insert_with(|| {
                edgefuzz_core::config::CommandExecutorSettings {
                    command: Vec::new(),
                    input_delivery: ConfigInputDelivery::StdIn,
                    working_dir: None,
                    crash_on_nonzero_exit: true,
                }
            });
            if !cmd_settings.command.is_empty() {
                cmd_settings.command[0] = target_cmd_str;
            } else {
                cmd_settings.command.push(target_cmd_str);
            }
        } else {
            warn!("--target-command specified but executor type is not 'command'. Override ignored.");
        }
    }
}

fn build_executor(config: &EdgefuzzConfig) -> Result<Box<dyn Executor>, anyhow::Error> {
    match config.executor.executor_type {
        ConfigExecutorType::InProcess => Ok(Box::new(InProcessExecutor::new(demo_harness))),
        ConfigExecutorType::Command => {
            let cmd_settings = config.executor.command_settings.clone().ok_or_else(|| {
                anyhow::anyhow!("Command settings missing for CommandExecutor type in config")
            })?;
            if cmd_settings.command.is_empty() {
                return Err(anyhow::anyhow!("Target command is empty"));
            }

            let core_input_delivery = match cmd_settings.input_delivery {
                ConfigInputDelivery::StdIn => CoreInputDelivery::StdIn,
                ConfigInputDelivery::File { template } => CoreInputDelivery::File(template),
            };

            let exec_config = CommandExecutorConfig {
                command: cmd_settings.command,
                input_delivery: core_input_delivery,
                working_dir: cmd_settings.working_dir,
                crash_on_nonzero_exit: cmd_settings.crash_on_nonzero_exit,
            };
            let executor = CommandExecutor::new(exec_config)
                .map_err(|e| anyhow::anyhow!("Failed to set up target executor: {e}"))?;
            Ok(Box::new(executor))
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let command_line = std::env::args().collect::<Vec<_>>().join(" ");
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;
    apply_overrides(&mut config, cli);
    log::debug!("Effective configuration: {config:#?}");

    let seed = config.fuzzer.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default()
    });
    info!("RNG seed: {seed}");
    let rng = ChaCha8Rng::seed_from_u64(seed);

    let executor = build_executor(&config)?;
    let mut engine = Engine::new(config.fuzzer, executor, Box::new(StdFileSystem), rng)?;
    engine.set_command_line(command_line);

    let stop = engine.stop_handle();
    ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
        .map_err(|e| anyhow::anyhow!("Failed to install Ctrl-C handler: {e}"))?;

    engine.run()?;

    let counters = engine.counters();
    info!(
        "Fuzzing finished: {} execs, {} paths, {} unique crashes, {} unique hangs, {} cycles done",
        counters.execs_done,
        engine.queue().len(),
        counters.unique_crashes,
        counters.unique_hangs,
        engine.queue_cycle().saturating_sub(1)
    );
    info!("Findings are in {}", engine.layout().out_dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_config_values() {
        let cli = Cli::parse_from([
            "edgefuzz",
            "-i",
            "seeds",
            "-o",
            "findings",
            "--timeout-ms",
            "40",
            "--seed",
            "7",
            "-d",
            "--target-command",
            "./target",
        ]);
        let mut config = EdgefuzzConfig::default();
        apply_overrides(&mut config, cli);
        assert_eq!(config.fuzzer.input_dir, PathBuf::from("seeds"));
        assert_eq!(config.fuzzer.output_dir, PathBuf::from("findings"));
        assert_eq!(config.fuzzer.timeout_ms, Some(40));
        assert_eq!(config.fuzzer.seed, Some(7));
        assert!(config.fuzzer.skip_deterministic);
        assert!(!config.fuzzer.dumb_mode);
        let cmd = config.executor.command_settings.unwrap();
        assert_eq!(cmd.command, vec!["./target".to_string()]);
    }

    #[test]
    fn demo_harness_records_prefix_depth() {
        let mut trace = vec![0u8; 8];
        demo_harness(b"BAx", &mut trace);
        assert_eq!(&trace[..4], &[1, 1, 1, 0]);
        let crashed = std::panic::catch_unwind(|| demo_harness(b"BAD!", &mut vec![0u8; 8]));
        assert!(crashed.is_err());
    }

    #[test]
    fn command_executor_needs_a_command() {
        let config = EdgefuzzConfig::default();
        assert!(build_executor(&config).is_err());
    }
}
