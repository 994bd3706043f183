//! CLI for thermoguard — thermodynamic side-channel security engine.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "thermoguard")]
#[command(about = "thermoguard — PUF authentication and side-channel attack detection")]
#[command(version = thermoguard_core::VERSION)]
struct Cli {
    /// JSON engine configuration (missing fields take defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding signatures, baselines and the event log
    #[arg(long, global = true, default_value = "thermoguard-data")]
    store: PathBuf,

    /// Read the local machine through sysfs instead of the simulated sensor
    #[arg(long, global = true)]
    hardware: bool,

    /// Seed for the simulated sensor
    #[arg(long, global = true, default_value = "42")]
    seed: u64,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a device: record its thermodynamic fingerprint
    Enroll {
        device: String,

        /// Samples per channel (default: configured enrollment samples)
        #[arg(long)]
        samples: Option<usize>,
    },

    /// Authenticate a device against its enrolled fingerprint
    Authenticate {
        device: String,

        /// Take a fresh measurement instead of replaying the enrolled features
        #[arg(long)]
        fresh: bool,
    },

    /// Compare two enrolled devices for physical cloning
    CloneCheck {
        device_a: String,
        device_b: String,

        /// In simulation, make device_b a physical copy of device_a first
        #[arg(long)]
        simulate_clone: bool,
    },

    /// Establish power and thermal baselines for a device
    Baseline {
        device: String,

        /// Operation the power baseline describes
        #[arg(long, default_value = "aes_encrypt")]
        operation: String,

        /// Power traces to collect
        #[arg(long, default_value = "200")]
        traces: usize,

        /// Seconds of thermal sampling
        #[arg(long, default_value = "10")]
        thermal_secs: u64,
    },

    /// Watch a device for power and thermal attacks, printing every event
    Monitor {
        device: String,

        #[arg(long, default_value = "aes_encrypt")]
        operation: String,

        /// Seconds to run (default: until Ctrl+C)
        #[arg(long)]
        duration: Option<u64>,

        /// Attack to stage against the simulated device once monitoring starts
        #[arg(long, value_parser = ["spa", "dpa", "cold-boot"])]
        simulate_attack: Option<String>,

        /// Print each event as a JSON line
        #[arg(long)]
        json: bool,
    },

    /// Quantify information leakage from one or every side channel
    Leakage {
        device: String,

        #[arg(long, default_value = "aes_encrypt")]
        operation: String,

        /// Channel to measure: power, electromagnetic, timing, acoustic, thermal
        #[arg(long, conflicts_with = "all")]
        channel: Option<String>,

        /// Sweep every leakage channel
        #[arg(long)]
        all: bool,

        /// Size of the protected secret
        #[arg(long, default_value = "128")]
        secret_bits: f64,

        #[arg(long)]
        json: bool,
    },

    /// Security health of a device
    Health {
        device: String,

        #[arg(long)]
        json: bool,
    },

    /// Active (non-false-positive) threats, most severe first
    Threats {
        /// Minimum severity: low, medium, high, critical (default: medium)
        #[arg(long)]
        severity: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP query server
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value = "8088")]
        port: u16,

        /// Also monitor these devices while serving (needs existing baselines)
        #[arg(long, value_delimiter = ',')]
        monitor: Vec<String>,

        #[arg(long, default_value = "aes_encrypt")]
        operation: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let ctx = commands::Context::open(&commands::EngineOptions {
        config: cli.config.as_deref(),
        store: &cli.store,
        hardware: cli.hardware,
        seed: cli.seed,
    });

    match cli.command {
        Commands::Enroll { device, samples } => commands::enroll::run(&ctx, &device, samples),
        Commands::Authenticate { device, fresh } => commands::authenticate::run(&ctx, &device, fresh),
        Commands::CloneCheck {
            device_a,
            device_b,
            simulate_clone,
        } => commands::clone_check::run(&ctx, &device_a, &device_b, simulate_clone),
        Commands::Baseline {
            device,
            operation,
            traces,
            thermal_secs,
        } => commands::baseline::run(&ctx, &device, &operation, traces, thermal_secs),
        Commands::Monitor {
            device,
            operation,
            duration,
            simulate_attack,
            json,
        } => commands::monitor::run(commands::monitor::MonitorCommandConfig {
            ctx: &ctx,
            device: &device,
            operation: &operation,
            duration,
            simulate_attack: simulate_attack.as_deref(),
            json,
        }),
        Commands::Leakage {
            device,
            operation,
            channel,
            all,
            secret_bits,
            json,
        } => commands::leakage::run(commands::leakage::LeakageCommandConfig {
            ctx: &ctx,
            device: &device,
            operation: &operation,
            channel: if all { None } else { channel.as_deref() },
            secret_bits,
            json,
        }),
        Commands::Health { device, json } => commands::health::run(&ctx, &device, json),
        Commands::Threats { severity, json } => commands::threats::run(&ctx, severity.as_deref(), json),
        Commands::Serve {
            host,
            port,
            monitor,
            operation,
        } => commands::serve::run(ctx, &host, port, &monitor, &operation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from(["thermoguard", "authenticate", "hsm-01", "--fresh", "--seed", "7"]).unwrap();
        assert_eq!(cli.seed, 7);
        assert_eq!(cli.store, PathBuf::from("thermoguard-data"));
        assert!(matches!(cli.command, Commands::Authenticate { fresh: true, .. }));
    }

    #[test]
    fn leakage_channel_conflicts_with_all() {
        assert!(Cli::try_parse_from(["thermoguard", "leakage", "d", "--channel", "power", "--all"]).is_err());
    }

    #[test]
    fn monitor_rejects_unknown_attack() {
        assert!(Cli::try_parse_from(["thermoguard", "monitor", "d", "--simulate-attack", "rowhammer"]).is_err());
        let cli = Cli::try_parse_from(["thermoguard", "monitor", "d", "--simulate-attack", "cold-boot"]).unwrap();
        match cli.command {
            Commands::Monitor { simulate_attack, .. } => assert_eq!(simulate_attack.as_deref(), Some("cold-boot")),
            _ => panic!("expected monitor"),
        }
    }
}
