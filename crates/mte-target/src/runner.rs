use crate::env::TargetEnv;
use crate::monitor::PolicyMonitor;
use crate::shell::Shell;
use crate::validator::Validator;
use anyhow::{anyhow, bail, Context, Result};
use mte_core::descriptor::Phase;
use mte_core::{atomic_write_bytes, BucketCounts, Evidence, TestDescriptor};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const KERNEL_LOG_READ: &str = "dmesg -c";
/// No-op filesystem access that makes the monitor flush its decision log.
pub const FLUSH_PROBE: &str = "mkdir helper/probe && rmdir helper/probe";

#[derive(Debug, Clone, Copy)]
pub struct RunnerTimings {
    pub monitor_warmup: Duration,
    pub flush_wait: Duration,
    pub suite_pause: Duration,
}

impl Default for RunnerTimings {
    fn default() -> Self {
        Self {
            monitor_warmup: Duration::from_millis(500),
            flush_wait: Duration::from_millis(500),
            suite_pause: Duration::from_secs(3),
        }
    }
}

impl RunnerTimings {
    pub fn immediate() -> Self {
        Self {
            monitor_warmup: Duration::ZERO,
            flush_wait: Duration::ZERO,
            suite_pause: Duration::ZERO,
        }
    }
}

fn pause(d: Duration) {
    if !d.is_zero() {
        thread::sleep(d);
    }
}

pub struct Runner<S: Shell, M: PolicyMonitor> {
    env: TargetEnv,
    shell: S,
    monitor: M,
    validator: Validator,
    timings: RunnerTimings,
}

impl<S: Shell, M: PolicyMonitor> Runner<S, M> {
    pub fn new(
        env: TargetEnv,
        shell: S,
        monitor: M,
        validator: Validator,
        timings: RunnerTimings,
    ) -> Self {
        Self {
            env,
            shell,
            monitor,
            validator,
            timings,
        }
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn shell(&self) -> &S {
        &self.shell
    }

    /// Runs corpus tests one by one, then local tests batched per source
    /// file, and prepends the summary to the results file.
    pub fn run_all(&mut self, tests: Vec<TestDescriptor>) -> Result<BucketCounts> {
        self.read_kernel_log()?;
        info!("cleared kernel log");

        let (corpus, local): (Vec<_>, Vec<_>) =
            tests.into_iter().partition(|t| t.requires_corpus());
        if !corpus.is_empty() {
            self.run_corpus_tests(&corpus)?;
        }

        let root = self.env.root().to_path_buf();
        for (i, (src, batch)) in group_by_source(local).iter().enumerate() {
            if i > 0 {
                pause(self.timings.suite_pause);
            }
            info!(suite = %src, tests = batch.len(), "running suite");
            self.run_batch(batch, &root)?;
        }

        self.validator.dump_results()?;
        Ok(self.validator.counts())
    }

    fn run_corpus_tests(&mut self, tests: &[TestDescriptor]) -> Result<()> {
        let cwd = self.env.corpus_dir();
        if !cwd.is_dir() {
            let err = anyhow!("corpus_missing: {}", cwd.display());
            for test in tests {
                self.validator.failed(test, &err)?;
            }
            return Ok(());
        }
        for (i, test) in tests.iter().enumerate() {
            if i > 0 {
                pause(self.timings.suite_pause);
            }
            info!(test = %test.name, "running corpus test");
            self.run_single(test, &cwd)?;
        }
        Ok(())
    }

    /// Runs one test with its own monitor instance. Any failure aborts the
    /// test and is recorded as a hard failure.
    pub fn run_single(&mut self, test: &TestDescriptor, cwd: &Path) -> Result<()> {
        let mut started = false;
        match self.single_phases(test, cwd, &mut started) {
            Ok(evidence) => {
                self.validator.validate(test, &evidence)?;
            }
            Err(err) => {
                warn!(test = %test.name, error = %format!("{:#}", err), "test aborted");
                if started {
                    if let Err(e) = self.monitor.stop() {
                        warn!(error = %e, "failed to stop policy monitor");
                    }
                }
                self.validator.failed(test, &err)?;
            }
        }
        Ok(())
    }

    fn single_phases(
        &mut self,
        test: &TestDescriptor,
        cwd: &Path,
        started: &mut bool,
    ) -> Result<Evidence> {
        self.run_phase(test, Phase::Setup, cwd)?;
        if test.use_constable {
            self.write_monitor_config(test.monitor_snippet())?;
            self.monitor.start()?;
            *started = true;
            pause(self.timings.monitor_warmup);
        }
        self.run_phase(test, Phase::PreExecution, cwd)?;
        let evidence = self.capture(test, cwd)?;
        self.run_phase(test, Phase::PostExecution, cwd)?;
        if *started {
            self.monitor.stop()?;
            *started = false;
        }
        self.run_phase(test, Phase::Cleanup, cwd)?;
        Ok(evidence)
    }

    /// One monitor instance spans the whole batch. Setup and cleanup
    /// failures stay local to the test that caused them.
    pub fn run_batch(&mut self, tests: &[TestDescriptor], cwd: &Path) -> Result<()> {
        let mut live = vec![true; tests.len()];
        let mut snippets = Vec::new();
        for (i, test) in tests.iter().enumerate() {
            match self.run_phase(test, Phase::Setup, cwd) {
                Ok(()) => snippets.extend(test.monitor_snippet()),
                Err(err) => {
                    warn!(test = %test.name, error = %format!("{:#}", err), "setup failed");
                    live[i] = false;
                    self.validator.failed(test, &err)?;
                }
            }
        }

        let use_monitor = tests
            .iter()
            .zip(&live)
            .any(|(t, alive)| *alive && t.use_constable);
        if use_monitor {
            let started = self
                .write_monitor_config(snippets)
                .and_then(|_| self.monitor.start());
            if let Err(err) = started {
                warn!(error = %format!("{:#}", err), "policy monitor unavailable for batch");
                for (test, alive) in tests.iter().zip(live.iter_mut()) {
                    if *alive {
                        *alive = false;
                        self.validator.failed(test, &err)?;
                    }
                }
                return Ok(());
            }
            pause(self.timings.monitor_warmup);
        }

        for (test, alive) in tests.iter().zip(live.iter_mut()) {
            if !*alive {
                continue;
            }
            match self.batch_execute(test, cwd) {
                Ok(evidence) => {
                    self.validator.validate(test, &evidence)?;
                }
                Err(err) => {
                    warn!(test = %test.name, error = %format!("{:#}", err), "test aborted");
                    *alive = false;
                    self.validator.failed(test, &err)?;
                }
            }
        }

        if use_monitor {
            if let Err(e) = self.monitor.stop() {
                warn!(error = %e, "failed to stop policy monitor");
            }
        }

        for (test, alive) in tests.iter().zip(&live) {
            if !*alive {
                continue;
            }
            if let Err(err) = self.run_phase(test, Phase::Cleanup, cwd) {
                warn!(test = %test.name, error = %format!("{:#}", err), "cleanup failed");
            }
        }
        Ok(())
    }

    fn batch_execute(&mut self, test: &TestDescriptor, cwd: &Path) -> Result<Evidence> {
        self.run_phase(test, Phase::PreExecution, cwd)?;
        let evidence = self.capture(test, cwd)?;
        self.run_phase(test, Phase::PostExecution, cwd)?;
        Ok(evidence)
    }

    fn capture(&mut self, test: &TestDescriptor, cwd: &Path) -> Result<Evidence> {
        self.read_kernel_log()?;
        if self.monitor.is_running() {
            self.monitor.read();
        }
        self.flush_probe(cwd)?;
        info!(test = %test.name, "executing");
        let process = self.shell.run(&test.execution.command, cwd)?;
        self.flush_probe(cwd)?;
        pause(self.timings.flush_wait);
        let monitor = if self.monitor.is_running() {
            self.monitor.read()
        } else {
            String::new()
        };
        let kernel = self.read_kernel_log()?;
        Ok(Evidence {
            process,
            monitor,
            kernel,
        })
    }

    fn run_phase(&self, test: &TestDescriptor, phase: Phase, cwd: &Path) -> Result<()> {
        let commands = test.commands(phase);
        if commands.is_empty() {
            return Ok(());
        }
        debug!(test = %test.name, phase = %phase, "running phase");
        for command in commands {
            let result = self.shell.run(command, cwd)?;
            if !result.success() {
                bail!(
                    "{} failed for {}: `{}` exited with {}: {}",
                    phase,
                    test.name,
                    command,
                    result
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string()),
                    result.stderr.trim()
                );
            }
        }
        Ok(())
    }

    fn read_kernel_log(&self) -> Result<String> {
        let result = self.shell.run(KERNEL_LOG_READ, self.env.root())?;
        if !result.success() {
            bail!("kernel_log_read_failed: {}", result.stderr.trim());
        }
        Ok(result.stdout)
    }

    fn flush_probe(&self, cwd: &Path) -> Result<()> {
        self.shell
            .run(FLUSH_PROBE, cwd)
            .map(|_| ())
            .context("flush_probe_failed")
    }

    fn write_monitor_config<'a, I>(&self, snippets: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let template = self.env.monitor_template();
        let mut content = fs::read_to_string(&template)
            .with_context(|| format!("monitor_template_missing: {}", template.display()))?;
        for snippet in snippets {
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(snippet);
        }
        atomic_write_bytes(&self.env.monitor_config(), content.as_bytes())
    }
}

/// Groups tests by source file, keeping first-appearance order.
pub fn group_by_source(tests: Vec<TestDescriptor>) -> Vec<(String, Vec<TestDescriptor>)> {
    let mut groups: Vec<(String, Vec<TestDescriptor>)> = Vec::new();
    for test in tests {
        match groups.iter_mut().find(|(src, _)| *src == test.src) {
            Some((_, batch)) => batch.push(test),
            None => groups.push((test.src.clone(), vec![test])),
        }
    }
    groups
}
