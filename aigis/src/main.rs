// src/main.rs
//
// CLI entrypoint for Aigis.
//
// Subcommands:
// - baseline       run the empty-config baseline and print metrics/limits
// - run            drive the environment with a seeded uniform policy
// - best           pick the highest-reward configuration from a step log
// - reset-session  end a session left open on the harness
//
// Configuration comes from AIGIS_* env vars; CLI flags override them.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use aigis::config::{config_hash, EnvConfig, EnvMode};
use aigis::env::AigisEnv;
use aigis::harness::{reset_stale_session, HttpHarnessClient};
use aigis::policy::UniformPolicy;
use aigis::telemetry::best_record;
use aigis::{ActionCodec, Catalog, TunableSet};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ModeArg {
    Single,
    Multi,
}

impl From<ModeArg> for EnvMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Single => EnvMode::Single,
            ModeArg::Multi => EnvMode::Multi,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "aigis",
    about = "RL environment for tuning ledger configuration against a load-test harness",
    version
)]
struct Args {
    /// Harness base URL (overrides AIGIS_HARNESS_URL).
    #[arg(long, global = true)]
    harness_url: Option<String>,

    /// Configuration-limits document (overrides AIGIS_LIMITS_PATH).
    #[arg(long, global = true)]
    limits: Option<PathBuf>,

    /// Environment mode (overrides AIGIS_MODE).
    #[arg(long, value_enum, global = true)]
    mode: Option<ModeArg>,

    /// Verbosity: -v, -vv (ignored when RUST_LOG is set).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Measure the baseline with an empty configuration.
    Baseline,
    /// Step the environment with a seeded uniform-random policy.
    Run {
        #[arg(long, default_value_t = 10)]
        steps: u64,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// JSONL step log (overrides AIGIS_TELEMETRY_PATH).
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Print the best configuration recorded in a step log.
    Best {
        #[arg(long)]
        log: PathBuf,
        /// Write the configuration as a sectioned YAML document.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// End a session left open on the harness.
    ResetSession,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "aigis=info",
        1 => "aigis=debug",
        _ => "aigis=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut cfg = EnvConfig::from_env();
    if let Some(url) = args.harness_url {
        cfg.harness_url = url;
    }
    if let Some(path) = args.limits {
        cfg.limits_path = path;
    }
    if let Some(mode) = args.mode {
        cfg.mode = mode.into();
    }
    if let Command::Run { log: Some(log), .. } = &args.command {
        cfg.telemetry_path = Some(log.clone());
    }
    cfg.validate().context("invalid configuration")?;

    info!(
        harness = %cfg.harness_url,
        limits = %cfg.limits_path.display(),
        mode = %cfg.mode,
        cfg_hash = %format!("0x{:016x}", config_hash(&cfg)),
        "aigis starting"
    );

    match args.command {
        Command::Baseline => baseline(&cfg),
        Command::Run { steps, seed, .. } => run(&cfg, steps, seed),
        Command::Best { log, out } => best(&cfg, &log, out.as_deref()),
        Command::ResetSession => reset_session(&cfg),
    }
}

fn baseline(cfg: &EnvConfig) -> Result<()> {
    let mut env = AigisEnv::from_config(cfg).context("building environment")?;
    let source = env.boot();
    let state = env.state();
    println!(
        "baseline ({source:?}): throughput={:.2} latency={:.4} success_rate={:.4} | limits: throughput={:.1} latency={:.2}",
        state.initial.throughput,
        state.initial.latency,
        state.initial.success_rate,
        state.limits.throughput,
        state.limits.latency,
    );
    Ok(())
}

fn run(cfg: &EnvConfig, steps: u64, seed: u64) -> Result<()> {
    let mut env = AigisEnv::from_config(cfg).context("building environment")?;
    let mut policy = UniformPolicy::new(seed);
    let dims = env.action_dims();
    env.reset();

    let mut best: Option<(u64, f64)> = None;
    let mut failures = 0u64;
    for _ in 0..steps {
        let action = policy.sample(env.mode(), &dims);
        let result = env.step(&action);
        let reward = result.reward();
        match &result.info.metrics {
            Some(m) => println!(
                "step {:>4} | reward {:>10.4} | tps {:>9.2} | lat {:>7.4} | sr {:.3} | attempts {}",
                result.info.step, reward, m.throughput, m.latency, m.success_rate, result.info.attempts
            ),
            None => {
                failures += 1;
                println!(
                    "step {:>4} | reward {:>10.4} | FAILED ({})",
                    result.info.step,
                    reward,
                    result.info.failure.as_deref().unwrap_or("unknown")
                );
            }
        }
        if !result.failed() && best.map_or(true, |(_, r)| reward > r) {
            best = Some((result.info.step, reward));
        }
    }

    match best {
        Some((step, reward)) => println!("best step {step} reward {reward:.4} ({failures} failed)"),
        None => println!("no successful steps ({failures} failed)"),
    }
    Ok(())
}

fn best(cfg: &EnvConfig, log: &Path, out: Option<&Path>) -> Result<()> {
    let Some(record) =
        best_record(log).with_context(|| format!("reading step log {}", log.display()))?
    else {
        bail!("no successful steps in {}", log.display());
    };
    println!(
        "best step {} reward {:.4} (mode {})",
        record.step, record.reward, record.mode
    );
    if let Some(m) = &record.metrics {
        println!(
            "  throughput={:.2} latency={:.4} success_rate={:.4}",
            m.throughput, m.latency, m.success_rate
        );
    }

    let catalog = Catalog::load(&cfg.limits_path)
        .with_context(|| format!("loading limits {}", cfg.limits_path.display()))?;
    let codec = ActionCodec::new(&catalog, &TunableSet::from_importance(cfg.act_importance));
    let yaml = codec
        .sectioned_yaml(&record.config)
        .context("rendering configuration")?;

    match out {
        Some(path) => {
            fs::write(path, &yaml).with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {}", path.display());
        }
        None => print!("{yaml}"),
    }
    Ok(())
}

fn reset_session(cfg: &EnvConfig) -> Result<()> {
    let client = HttpHarnessClient::new(cfg.harness_url.clone(), cfg.request_timeout)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting runtime")?;
    match runtime.block_on(reset_stale_session(&client))? {
        Some(id) => println!("terminated session {id}"),
        None => println!("no active session"),
    }
    Ok(())
}
