use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use mte_core::report::ResultsSummary;
use mte_core::TestDescriptor;
use mte_orchestrator::{init_file_log, Config, LogContext, Orchestrator, OutputSink, TestRepository};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const CONNECT_POLL: Duration = Duration::from_millis(100);
const EXECUTE_POLL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "mte", version, about = "Medusa conformance test environment")]
struct Cli {
    #[arg(long, global = true, default_value = "mte.yaml")]
    config: PathBuf,
    /// Echo debug messages to the terminal.
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show every test found under the tests directory.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Stage, run and collect the selected tests on the target.
    Run {
        /// Only tests from this suite (definition file name); repeatable.
        #[arg(long = "suite")]
        suites: Vec<String>,
        /// Only the test with this name; repeatable.
        #[arg(long = "test")]
        tests: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print the last downloaded results.
    Results {
        #[arg(long)]
        json: bool,
    },
    /// Remove everything staged on the target.
    Clean,
}

/// Terminal side of the log context. In JSON mode progress goes to stderr so
/// stdout carries only the payload.
struct ShellApp {
    json: bool,
}

impl OutputSink for ShellApp {
    fn out(&self, message: &str) {
        if self.json {
            eprintln!("{}", message);
        } else {
            println!("{}", message);
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli, json_mode) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(cli: Cli, json_mode: bool) -> Result<Option<Value>> {
    let config = Config::load(&cli.config)?;
    let deployment = config.deployment();
    init_file_log(&deployment.log_file)?;
    let log = LogContext::new(Arc::new(ShellApp { json: json_mode }), cli.debug);

    match cli.command {
        Commands::List { json } => {
            let tests = TestRepository::new(&deployment, log).list_tests()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "list",
                    "tests": tests.iter().map(test_to_json).collect::<Vec<_>>(),
                })));
            }
            print_tests(&tests);
        }
        Commands::Run {
            suites,
            tests,
            json,
        } => {
            let all = TestRepository::new(&deployment, log.clone()).list_tests()?;
            let selected = select_tests(all, &suites, &tests)?;
            let names: Vec<String> = selected.iter().map(|t| t.name.clone()).collect();

            let mut orchestrator = Orchestrator::new(&config, log)?;
            orchestrator.establish_connection()?;
            while !orchestrator.check_connection_status()? {
                thread::sleep(CONNECT_POLL);
            }
            if !orchestrator.execute(selected) {
                let reason = orchestrator
                    .connection_error()
                    .unwrap_or_else(|| "target not connected".to_string());
                bail!("connection_failed: {}", reason);
            }
            while !orchestrator.check_execution_status()? {
                thread::sleep(EXECUTE_POLL);
            }
            let report = match orchestrator.execution_outcome() {
                Some(Ok(report)) => report.clone(),
                Some(Err(err)) => return Err(anyhow!("run_failed: {:#}", err)),
                None => bail!("run_failed: execution task did not finish"),
            };
            let text = report.results.unwrap_or_default();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run_id": report.run_id,
                    "selected": names,
                    "results": results_to_json(&text),
                })));
            }
            print!("{}", text);
        }
        Commands::Results { json } => {
            let text = TestRepository::new(&deployment, log).load_results()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "results",
                    "results": text.as_deref().map(results_to_json),
                })));
            }
            match text {
                Some(text) => print!("{}", text),
                None => println!("no results downloaded yet"),
            }
        }
        Commands::Clean => {
            Orchestrator::new(&config, log)?.clean_target()?;
        }
    }
    Ok(None)
}

/// Keeps tests matching any suite filter and any name filter; an empty
/// filter matches everything.
fn select_tests(
    all: Vec<TestDescriptor>,
    suites: &[String],
    names: &[String],
) -> Result<Vec<TestDescriptor>> {
    let selected: Vec<TestDescriptor> = all
        .into_iter()
        .map(|mut test| {
            test.selected = (suites.is_empty() || suites.contains(&test.suite))
                && (names.is_empty() || names.contains(&test.name));
            test
        })
        .filter(|test| test.selected)
        .collect();
    if selected.is_empty() {
        bail!("no_tests_selected: nothing matches the given --suite/--test filters");
    }
    Ok(selected)
}

fn print_tests(tests: &[TestDescriptor]) {
    let mut suite = None;
    for test in tests {
        if suite != Some(&test.src) {
            println!("{}", test.src);
            suite = Some(&test.src);
        }
        let origin = if test.requires_corpus() { " [corpus]" } else { "" };
        println!("  {}{}", test.name, origin);
    }
}

fn test_to_json(test: &TestDescriptor) -> Value {
    json!({
        "name": test.name,
        "suite": test.suite,
        "src": test.src,
        "corpus": test.requires_corpus(),
        "use_constable": test.use_constable,
    })
}

fn results_to_json(text: &str) -> Value {
    let summary = ResultsSummary::parse(text);
    json!({
        "counts": summary.counts.map(|c| json!({
            "passed": c.success,
            "failed": c.failed,
            "partial": c.partial,
        })),
        "lines": summary.lines,
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::List { json }
        | Commands::Run { json, .. }
        | Commands::Results { json } => *json,
        Commands::Clean => false,
    }
}
