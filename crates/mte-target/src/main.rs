use anyhow::{anyhow, Context, Result};
use clap::Parser;
use mte_core::layout::{EXIT_ERROR, EXIT_SUCCESS, REMOTE_LOG};
use mte_core::BucketCounts;
use mte_target::{ConstableMonitor, Runner, RunnerTimings, SystemShell, TargetEnv, Validator};
use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mte-target", version, about = "Runs staged conformance tests on the target")]
struct Args {
    /// Working directory holding the staged manifest; defaults to the
    /// directory of this executable.
    #[arg(long)]
    root: Option<PathBuf>,
    #[arg(long, default_value_t = 3000)]
    suite_pause_ms: u64,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let root = match resolve_root(args.root) {
        Ok(root) => root,
        Err(err) => {
            eprintln!("mte-target: {:#}", err);
            return ExitCode::FAILURE;
        }
    };
    let env = TargetEnv::new(root);
    if let Err(err) = init_logging(&env) {
        eprintln!("mte-target: {:#}", err);
    }

    let timings = RunnerTimings {
        suite_pause: std::time::Duration::from_millis(args.suite_pause_ms),
        ..RunnerTimings::default()
    };
    let (marker, code) = match run(&env, timings) {
        Ok(counts) => {
            info!(
                passed = counts.success,
                failed = counts.failed,
                partial = counts.partial,
                "testing complete"
            );
            (EXIT_SUCCESS, ExitCode::SUCCESS)
        }
        Err(err) => {
            error!(error = %format!("{:#}", err), "test run failed");
            (EXIT_ERROR, ExitCode::FAILURE)
        }
    };
    if let Err(err) = env.record_exit(marker) {
        error!(error = %format!("{:#}", err), "failed to record exit marker");
        return ExitCode::FAILURE;
    }
    code
}

fn run(env: &TargetEnv, timings: RunnerTimings) -> Result<BucketCounts> {
    info!("running setup");
    env.setup()?;
    env.validate()?;
    let tests = env.load_tests()?;
    info!(tests = tests.len(), "tests loaded");

    let validator = Validator::new(env)?;
    let shell = SystemShell::new(env.root());
    let monitor = ConstableMonitor::new(env.monitor_command());
    let mut runner = Runner::new(env.clone(), shell, monitor, validator, timings);
    runner.run_all(tests)
}

fn resolve_root(root: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(root) = root {
        return Ok(root);
    }
    let exe = std::env::current_exe().context("current_exe_unavailable")?;
    exe.parent()
        .map(|p| p.to_path_buf())
        .ok_or_else(|| anyhow!("executable has no parent directory"))
}

fn init_logging(env: &TargetEnv) -> Result<()> {
    let file = File::create(env.path(REMOTE_LOG))
        .with_context(|| format!("log_open_failed: {}", env.path(REMOTE_LOG).display()))?;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .map_err(|e| anyhow!("log_init_failed: {}", e))
}
