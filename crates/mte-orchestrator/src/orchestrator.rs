//! Coordinates one connection attempt and one test run at a time, each on
//! its own thread, observed through non-blocking status polls.

use crate::channel::{elevated, shell_quote, OpenSshTransport, SshTarget, TransferChannel};
use crate::config::Config;
use crate::hypervisor::VBoxManage;
use crate::logging::LogContext;
use crate::repository::{GitCorpus, TestRepository};
use crate::target::{TargetManager, VirtualMachine};
use crate::task::TaskHandle;
use anyhow::{Context, Result};
use chrono::Utc;
use mte_core::layout::{is_success_marker, RemoteLayout, RUNNER_BINARY};
use mte_core::TestDescriptor;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const PROCESS_PROBE: &str = "pgrep -x mte-target";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    ConnectFailed = 3,
    Running = 4,
    Done = 5,
}

impl RunState {
    const ALL: [RunState; 6] = [
        RunState::Idle,
        RunState::Connecting,
        RunState::Connected,
        RunState::ConnectFailed,
        RunState::Running,
        RunState::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Connecting => "connecting",
            RunState::Connected => "connected",
            RunState::ConnectFailed => "connect_failed",
            RunState::Running => "running",
            RunState::Done => "done",
        }
    }
}

/// The run state, changed only through [`StateCell::transition`].
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(RunState::Idle as u8))
    }

    fn get(&self) -> RunState {
        decode(self.0.load(Ordering::SeqCst))
    }

    /// Moves to `to` if the current state is one of `from`; otherwise
    /// reports the state that blocked the move.
    fn transition(&self, from: &[RunState], to: RunState) -> Result<(), RunState> {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            let state = decode(current);
            if !from.contains(&state) {
                return Err(state);
            }
            match self
                .0
                .compare_exchange(current, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }
}

fn decode(raw: u8) -> RunState {
    RunState::ALL
        .get(raw as usize)
        .copied()
        .unwrap_or(RunState::Done)
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("another operation is in progress (state: {})", .0.as_str())]
    Busy(RunState),
    #[error("operation has not been started")]
    NotStarted,
    #[error("remote test run failed (exit marker {0:?})")]
    RunFailed(String),
    #[error("test runner still active after {0:?}")]
    WatchdogExpired(Duration),
    #[error("could not start background task: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogPolicy {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub probe_timeout: Duration,
    /// `None` waits for as long as the runner is alive.
    pub max_wait: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub remote: RemoteLayout,
    pub sudo: bool,
    pub command_timeout: Duration,
    pub watchdog: WatchdogPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: String,
    pub results: Option<String>,
}

struct Shared {
    state: StateCell,
    channel: Mutex<TransferChannel>,
    target: TargetManager,
    repository: TestRepository,
    settings: RunSettings,
    log: LogContext,
}

impl Shared {
    fn lock_channel(&self) -> MutexGuard<'_, TransferChannel> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ends every run the same way: session closed, state `Done`.
struct RunGuard<'a> {
    shared: &'a Shared,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock_channel().disconnect();
        if let Err(state) = self
            .shared
            .state
            .transition(&[RunState::Running], RunState::Done)
        {
            self.shared
                .log
                .debug(format!("Run ended in unexpected state {}", state.as_str()));
        }
    }
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    connect_task: Option<TaskHandle<()>>,
    execute_task: Option<TaskHandle<RunReport>>,
}

impl Orchestrator {
    /// Wires the OpenSSH channel, the optional VirtualBox handle and the
    /// repository from `config`, and refreshes the external corpus once.
    pub fn new(config: &Config, log: LogContext) -> Result<Self> {
        let deployment = config.deployment();
        let transport = OpenSshTransport::new(SshTarget {
            host: config.target.host.clone(),
            port: config.target.port,
            username: config.target.username.clone(),
            password: config.target.password.clone(),
            identity_file: config.target.identity_file.clone(),
        });
        let channel = TransferChannel::new(
            Box::new(transport),
            deployment.local_paths(),
            log.clone(),
        );

        let vm = config.vm_name().map(|name| VirtualMachine {
            name: name.to_string(),
            hypervisor: Arc::new(VBoxManage::new(&config.target.vm_frontend)),
        });
        let target = TargetManager::new(vm, config.timing.readiness(), log.clone()).map_err(|e| {
            let message = e.to_string();
            log.error(e, Some(&message))
        })?;

        let repository = TestRepository::new(&deployment, log.clone());
        repository.refresh_corpus(&GitCorpus::new(&config.env.corpus_url));

        let settings = RunSettings {
            remote: RemoteLayout::new(&config.env.environment_dir),
            sudo: config.env.sudo,
            command_timeout: config.timing.command_timeout(),
            watchdog: config.timing.watchdog(),
        };
        Ok(Self::from_parts(channel, target, repository, settings, log))
    }

    pub fn from_parts(
        channel: TransferChannel,
        target: TargetManager,
        repository: TestRepository,
        settings: RunSettings,
        log: LogContext,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: StateCell::new(),
                channel: Mutex::new(channel),
                target,
                repository,
                settings,
                log,
            }),
            connect_task: None,
            execute_task: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.shared.state.get()
    }

    /// Starts the connect task and returns immediately.
    pub fn establish_connection(&mut self) -> Result<(), OrchestratorError> {
        self.shared
            .state
            .transition(
                &[
                    RunState::Idle,
                    RunState::Connected,
                    RunState::ConnectFailed,
                    RunState::Done,
                ],
                RunState::Connecting,
            )
            .map_err(OrchestratorError::Busy)?;

        let shared = Arc::clone(&self.shared);
        let spawned = TaskHandle::spawn("mte-connect", move || {
            shared.log.info("Connecting to target...");
            let outcome = shared.target.connect(&mut shared.lock_channel());
            match outcome {
                Ok(()) => {
                    let _ = shared
                        .state
                        .transition(&[RunState::Connecting], RunState::Connected);
                    shared.log.info("Connected to target.");
                    Ok(())
                }
                Err(err) => {
                    let _ = shared
                        .state
                        .transition(&[RunState::Connecting], RunState::ConnectFailed);
                    let message = format!("Connection to target failed: {}", err);
                    Err(shared.log.error(err, Some(&message)))
                }
            }
        });
        match spawned {
            Ok(task) => {
                self.connect_task = Some(task);
                Ok(())
            }
            Err(err) => {
                let _ = self
                    .shared
                    .state
                    .transition(&[RunState::Connecting], RunState::ConnectFailed);
                Err(OrchestratorError::Spawn(err))
            }
        }
    }

    /// True once the connect task has finished, whatever its outcome.
    pub fn check_connection_status(&mut self) -> Result<bool, OrchestratorError> {
        match self.connect_task.as_mut() {
            Some(task) => Ok(task.poll().is_some()),
            None => Err(OrchestratorError::NotStarted),
        }
    }

    pub fn connection_error(&mut self) -> Option<String> {
        match self.connect_task.as_mut()?.poll()? {
            Ok(()) => None,
            Err(err) => Some(format!("{:#}", err)),
        }
    }

    /// Starts the execution task. Returns false without side effects unless
    /// the last connect task finished successfully and no run has used that
    /// connection yet.
    pub fn execute(&mut self, selected: Vec<TestDescriptor>) -> bool {
        let connected = self
            .connect_task
            .as_mut()
            .map_or(false, |task| task.succeeded());
        if !connected {
            self.shared
                .log
                .debug("Execution not started: no successful connection");
            return false;
        }
        if let Err(state) = self
            .shared
            .state
            .transition(&[RunState::Connected], RunState::Running)
        {
            self.shared.log.debug(format!(
                "Execution not started: state is {}",
                state.as_str()
            ));
            return false;
        }

        let run_id = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S%.3f"));
        let shared = Arc::clone(&self.shared);
        let spawned = TaskHandle::spawn("mte-execute", move || {
            let _guard = RunGuard { shared: &shared };
            run_execution(&shared, selected, &run_id)
        });
        match spawned {
            Ok(task) => {
                self.execute_task = Some(task);
                true
            }
            Err(err) => {
                let _ = self
                    .shared
                    .state
                    .transition(&[RunState::Running], RunState::Done);
                self.shared.log.error(err, None);
                false
            }
        }
    }

    /// True once the execution task has finished, whatever its outcome.
    pub fn check_execution_status(&mut self) -> Result<bool, OrchestratorError> {
        match self.execute_task.as_mut() {
            Some(task) => Ok(task.poll().is_some()),
            None => Err(OrchestratorError::NotStarted),
        }
    }

    pub fn execution_outcome(&mut self) -> Option<&Result<RunReport>> {
        self.execute_task.as_mut()?.poll()
    }

    pub fn get_results(&self) -> Result<Option<String>> {
        self.shared.repository.load_results()
    }

    /// Connects, removes everything staged on the target, disconnects.
    /// Synchronous; refused while a task owns the session. Afterwards the
    /// orchestrator is `Idle`: a run needs a fresh `establish_connection`.
    pub fn clean_target(&mut self) -> Result<()> {
        let state = self.shared.state.get();
        if matches!(state, RunState::Connecting | RunState::Running) {
            return Err(OrchestratorError::Busy(state).into());
        }
        let outcome = clean_remote(&self.shared);
        let _ = self.shared.state.transition(
            &[RunState::Connected, RunState::ConnectFailed, RunState::Done],
            RunState::Idle,
        );
        self.connect_task = None;
        outcome
    }
}

fn clean_remote(shared: &Shared) -> Result<()> {
    let mut channel = shared.lock_channel();
    shared.log.info("Connecting to target...");
    shared.target.connect(&mut channel).map_err(|e| {
        let message = format!("Connection to target failed: {}", e);
        shared.log.error(e, Some(&message))
    })?;
    shared.log.info("Cleaning target...");
    let cleaned = channel.clean_target(&shared.settings.remote, shared.settings.sudo);
    channel.disconnect();
    cleaned.map_err(|e| shared.log.error(e, Some("Could not clean the target.")))?;
    shared.log.info("Target cleaned.");
    Ok(())
}

/// Runner output from a previous elevated run is root-owned, so the
/// permission fix-up runs elevated as well.
fn permissions_command(remote: &RemoteLayout, sudo: bool) -> String {
    format!(
        "{} && {}",
        elevated(format!("chmod -R u+rwX,go+rX {}", shell_quote(remote.root())), sudo),
        elevated(format!("chmod 755 {}", shell_quote(&remote.runner())), sudo)
    )
}

fn launch_command(remote: &RemoteLayout, sudo: bool) -> String {
    let root = shell_quote(remote.root());
    let elevate = if sudo { "sudo -n " } else { "" };
    format!("cd {} && {}./{} --root {}", root, elevate, RUNNER_BINARY, root)
}

fn run_execution(
    shared: &Shared,
    selected: Vec<TestDescriptor>,
    run_id: &str,
) -> Result<RunReport> {
    let log = &shared.log;
    let settings = &shared.settings;
    let remote = &settings.remote;
    tracing::info!(run_id, tests = selected.len(), "execution started");
    let mut channel = shared.lock_channel();

    log.info("Preparing selected tests for transfer...");
    let manifest = shared
        .repository
        .prepare_tests(selected, remote.root())
        .map_err(|e| log.error(e, Some("Could not stage the selected tests.")))?;

    log.info("Preparing environment on remote...");
    channel
        .prepare_environment(remote, manifest.requires_corpus())
        .map_err(|e| log.error(e, Some("Could not transfer the test environment.")))?;
    channel
        .exec(
            &permissions_command(remote, settings.sudo),
            Some(settings.command_timeout),
        )
        .map_err(|e| log.error(e, None))?;

    log.info("Started testing...");
    channel
        .exec_async(
            &launch_command(remote, settings.sudo),
            Some(settings.command_timeout),
        )
        .map_err(|e| log.error(e, Some("Could not start the test runner.")))?;

    if let Err(err) = watch_runner(&mut channel, &settings.watchdog, log) {
        force_download(&mut channel, remote, log);
        return Err(log.error(err, Some("Gave up waiting for the test runner.")));
    }

    let marker = channel
        .exec(
            &format!("cat {}", shell_quote(&remote.exit_marker())),
            Some(settings.command_timeout),
        )
        .unwrap_or_else(|err| {
            log.debug(format!("Exit marker unreadable: {}", err));
            String::new()
        });
    if !is_success_marker(&marker) {
        force_download(&mut channel, remote, log);
        return Err(log.error(
            OrchestratorError::RunFailed(marker),
            Some("Testing failed on the target. See log file for more information."),
        ));
    }

    log.info("Downloading results...");
    channel
        .download_results(remote, false)
        .map_err(|e| log.error(e, Some("Could not download results.")))?;
    log.info("Testing has finished.");
    let results = shared.repository.load_results().context("results_unreadable")?;
    tracing::info!(run_id, "execution finished");
    Ok(RunReport {
        run_id: run_id.to_string(),
        results,
    })
}

/// Waits for the remote runner to exit. Every check opens a fresh session
/// and drops it again; a check that times out or loses the session means
/// the target is busy, not that the run is over. Returns with the session
/// of the final check still open.
fn watch_runner(
    channel: &mut TransferChannel,
    policy: &WatchdogPolicy,
    log: &LogContext,
) -> Result<(), OrchestratorError> {
    channel.disconnect();
    thread::sleep(policy.initial_delay);
    let started = Instant::now();
    loop {
        if let Some(limit) = policy.max_wait {
            if started.elapsed() >= limit {
                return Err(OrchestratorError::WatchdogExpired(limit));
            }
        }
        match channel.connect() {
            Err(err) => log.debug(format!("Target unreachable, still waiting: {}", err)),
            Ok(()) => match channel.exec(PROCESS_PROBE, Some(policy.probe_timeout)) {
                Err(err) if err.is_command_failure() => {
                    log.debug("Test runner exited");
                    return Ok(());
                }
                Ok(_) => log.debug("Test runner still active"),
                Err(err) if err.is_timeout() => log.debug("Runner check timed out; target busy"),
                Err(err) => log.warn(format!("Runner check failed, will retry: {}", err)),
            },
        }
        channel.disconnect();
        thread::sleep(policy.interval);
    }
}

/// Fetches whatever the runner left behind after a failed run.
fn force_download(channel: &mut TransferChannel, remote: &RemoteLayout, log: &LogContext) {
    if !channel.is_connected() {
        if let Err(err) = channel.connect() {
            log.warn(format!("Could not reconnect to fetch the runner log: {}", err));
            return;
        }
    }
    if let Err(err) = channel.download_results(remote, true) {
        log.warn(format!("Runner log unavailable: {}", err));
        return;
    }
    if let Err(err) = channel.download_results(remote, false) {
        log.debug(format!("No complete results to download: {}", err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Deployment;
    use crate::target::ReadinessPolicy;
    use crate::testing::{scratch_dir, FakeReply, FakeTransport, RecordingSink};
    use mte_core::ensure_dir;
    use std::fs;
    use std::path::{Path, PathBuf};

    const SUITE: &str = r#"
- name: read_allowed
  execution:
    command: cat allowed/file
    results:
      return_code: 0
- name: corpus_exec
  type: GIT
  execution:
    command: ./exec_test
    results: {}
"#;

    struct Rig {
        orchestrator: Orchestrator,
        fake: FakeTransport,
        sink: Arc<RecordingSink>,
        root: PathBuf,
    }

    impl Rig {
        fn tests(&self) -> Vec<TestDescriptor> {
            let deployment = Deployment::at(&self.root, self.root.join("bin").join(RUNNER_BINARY));
            TestRepository::new(&deployment, LogContext::silent())
                .list_tests()
                .expect("list")
        }

        fn local_tests(&self) -> Vec<TestDescriptor> {
            self.tests()
                .into_iter()
                .filter(|t| !t.requires_corpus())
                .collect()
        }

        fn connect(&mut self) {
            self.orchestrator.establish_connection().expect("establish");
            wait_until(|| self.orchestrator.check_connection_status().expect("status"));
        }

        fn run(&mut self, tests: Vec<TestDescriptor>) {
            assert!(self.orchestrator.execute(tests), "execute refused");
            wait_until(|| self.orchestrator.check_execution_status().expect("status"));
        }
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            ensure_dir(parent).expect("parent");
        }
        fs::write(path, content).expect("write");
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "background task did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn watchdog() -> WatchdogPolicy {
        WatchdogPolicy {
            initial_delay: Duration::ZERO,
            interval: Duration::ZERO,
            probe_timeout: Duration::from_secs(10),
            max_wait: None,
        }
    }

    fn rig(tag: &str, watchdog: WatchdogPolicy) -> Rig {
        let root = scratch_dir(tag);
        write(&root.join("tests/fs/access.yaml"), SUITE);
        write(&root.join("tests/constable.conf"), "config \"{@TEST_ENV}/medusa.conf\";\n");
        write(&root.join("tests/medusa-template.conf"), "tree \"fs\" of file;\n");
        write(&root.join("bin").join(RUNNER_BINARY), "#!runner");

        let deployment = Deployment::at(&root, root.join("bin").join(RUNNER_BINARY));
        let sink = Arc::new(RecordingSink::default());
        let log = LogContext::new(sink.clone(), false);
        let fake = FakeTransport::new();
        let channel =
            TransferChannel::new(Box::new(fake.clone()), deployment.local_paths(), log.clone());
        let readiness = ReadinessPolicy {
            attempts: 3,
            backoff: Duration::ZERO,
            boot_settle: Duration::ZERO,
            probe_timeout: Duration::from_secs(10),
        };
        let target = TargetManager::new(None, readiness, log.clone()).expect("target");
        let repository = TestRepository::new(&deployment, log.clone());
        let settings = RunSettings {
            remote: RemoteLayout::new("/srv/env"),
            sudo: true,
            command_timeout: Duration::from_secs(10),
            watchdog,
        };
        Rig {
            orchestrator: Orchestrator::from_parts(channel, target, repository, settings, log),
            fake,
            sink,
            root,
        }
    }

    fn runner_writes(fake: &FakeTransport, marker: &str) {
        fake.on_spawn_write("/srv/env/exit", marker);
        fake.on_spawn_write("/srv/env/log", "runner log\n");
        fake.on_spawn_write(
            "/srv/env/results/results",
            "Testing complete: 1 passed, 0 failed, 0 partial\nread_allowed: output:PASSED constable:IGNORED dmesg:IGNORED\n",
        );
        fake.on_spawn_write("/srv/env/results/details/read_allowed", "read_allowed ----\n");
    }

    #[test]
    fn status_polls_before_start_are_rejected() {
        let mut rig = rig("not_started", watchdog());
        assert!(matches!(
            rig.orchestrator.check_connection_status(),
            Err(OrchestratorError::NotStarted)
        ));
        assert!(matches!(
            rig.orchestrator.check_execution_status(),
            Err(OrchestratorError::NotStarted)
        ));
        let tests = rig.local_tests();
        assert!(!rig.orchestrator.execute(tests));
        assert_eq!(rig.orchestrator.state(), RunState::Idle);
    }

    #[test]
    fn unreachable_target_ends_in_connect_failed() {
        let mut rig = rig("unreachable", watchdog());
        rig.fake.refuse_opens(usize::MAX);
        rig.connect();

        assert_eq!(rig.orchestrator.state(), RunState::ConnectFailed);
        assert_eq!(rig.fake.open_attempts(), 3);
        assert!(rig
            .orchestrator
            .connection_error()
            .expect("error")
            .contains("3 attempts"));
        let tests = rig.local_tests();
        assert!(!rig.orchestrator.execute(tests));
        assert!(matches!(
            rig.orchestrator.check_execution_status(),
            Err(OrchestratorError::NotStarted)
        ));
        assert!(rig.fake.spawned().is_empty());
    }

    #[test]
    fn successful_run_survives_check_timeout_and_lost_session() {
        let mut rig = rig("success", watchdog());
        runner_writes(&rig.fake, "SUCCESS\n");
        rig.fake.script(PROCESS_PROBE, FakeReply::Exit(0, "4242\n".into()));
        rig.fake.script(PROCESS_PROBE, FakeReply::Timeout);
        rig.fake.script(PROCESS_PROBE, FakeReply::Lost);

        rig.connect();
        assert_eq!(rig.orchestrator.state(), RunState::Connected);
        let tests = rig.local_tests();
        rig.run(tests);

        let report = rig
            .orchestrator
            .execution_outcome()
            .expect("finished")
            .as_ref()
            .expect("run succeeded")
            .clone();
        assert!(report.run_id.starts_with("run_"));
        assert!(report
            .results
            .expect("results")
            .starts_with("Testing complete: 1 passed"));
        assert_eq!(rig.orchestrator.state(), RunState::Done);

        let probes = rig
            .fake
            .commands()
            .iter()
            .filter(|c| c.as_str() == PROCESS_PROBE)
            .count();
        assert_eq!(probes, 4);
        // One session for the connect task, then a fresh one per runner check.
        assert_eq!(rig.fake.open_attempts(), 5);
        assert!(rig
            .fake
            .commands()
            .iter()
            .any(|c| c.starts_with("sudo -n chmod -R u+rwX,go+rX /srv/env")));
        assert_eq!(
            rig.fake.spawned(),
            vec!["cd /srv/env && sudo -n ./mte-target --root /srv/env".to_string()]
        );
        assert!(rig.fake.file("/srv/env/tests.json").is_some());
        assert_eq!(
            rig.fake.file("/srv/env/constable.conf").as_deref(),
            Some("config \"/srv/env/medusa.conf\";\n")
        );
        assert!(!rig.fake.has_dir("/srv/env/medusa-tests"));
        assert!(rig.root.join("results/details/read_allowed").is_file());
        assert!(!rig.fake.is_open_now());
        assert!(rig.sink.lines().iter().any(|l| l == "Testing has finished."));
    }

    #[test]
    fn finished_run_requires_a_fresh_connection() {
        let mut rig = rig("reconnect", watchdog());
        runner_writes(&rig.fake, "SUCCESS");
        rig.connect();
        let tests = rig.local_tests();
        rig.run(tests.clone());
        assert!(!rig.orchestrator.execute(tests.clone()));

        runner_writes(&rig.fake, "SUCCESS");
        rig.connect();
        rig.run(tests);
        assert_eq!(rig.fake.spawned().len(), 2);
        assert!(rig
            .orchestrator
            .get_results()
            .expect("results")
            .is_some());
    }

    #[test]
    fn error_marker_forces_download_and_records_failure() {
        let mut rig = rig("error_marker", watchdog());
        rig.fake.on_spawn_write("/srv/env/exit", "ERROR\n");
        rig.fake.on_spawn_write("/srv/env/log", "manifest_missing\n");
        rig.connect();
        let tests = rig.local_tests();
        rig.run(tests);

        let err = rig
            .orchestrator
            .execution_outcome()
            .expect("finished")
            .as_ref()
            .expect_err("run failed");
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::RunFailed(marker)) if marker == "ERROR"
        ));
        assert_eq!(rig.orchestrator.state(), RunState::Done);
        assert_eq!(
            fs::read_to_string(rig.root.join("results/log")).expect("log"),
            "manifest_missing\n"
        );
        assert!(!rig.root.join("results/results").exists());
        assert!(rig
            .sink
            .lines()
            .iter()
            .any(|l| l.starts_with("Testing failed on the target")));
    }

    #[test]
    fn corpus_is_pushed_only_for_corpus_tests() {
        let mut rig = rig("corpus", watchdog());
        write(&rig.root.join("tests/medusa-tests/exec_test"), "#!/bin/sh\n");
        runner_writes(&rig.fake, "SUCCESS");
        rig.connect();
        let tests = rig.tests();
        rig.run(tests);

        assert!(rig
            .orchestrator
            .execution_outcome()
            .expect("finished")
            .is_ok());
        assert!(rig.fake.file("/srv/env/medusa-tests/exec_test").is_some());
    }

    #[test]
    fn missing_corpus_aborts_before_launch() {
        let mut rig = rig("corpus_missing", watchdog());
        rig.connect();
        let tests = rig.tests();
        rig.run(tests);

        let err = rig
            .orchestrator
            .execution_outcome()
            .expect("finished")
            .as_ref()
            .expect_err("corpus missing");
        assert!(format!("{:#}", err).contains("medusa-tests"));
        assert!(rig.fake.spawned().is_empty());
        assert_eq!(rig.orchestrator.state(), RunState::Done);
        assert!(!rig.fake.is_open_now());
    }

    #[test]
    fn watchdog_bound_gives_up_and_fetches_log() {
        let mut rig = rig(
            "watchdog_bound",
            WatchdogPolicy {
                max_wait: Some(Duration::ZERO),
                ..watchdog()
            },
        );
        runner_writes(&rig.fake, "SUCCESS");
        rig.connect();
        let tests = rig.local_tests();
        rig.run(tests);

        let err = rig
            .orchestrator
            .execution_outcome()
            .expect("finished")
            .as_ref()
            .expect_err("gave up");
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::WatchdogExpired(_))
        ));
        assert!(rig.root.join("results/log").is_file());
    }

    #[test]
    fn clean_target_connects_cleans_and_disconnects() {
        let mut rig = rig("clean", watchdog());
        rig.fake.put_file("/srv/env/tests.json", "[]");
        rig.fake.put_file("/srv/env/results/results", "r");

        rig.orchestrator.clean_target().expect("clean");
        assert!(rig.fake.file("/srv/env/tests.json").is_none());
        assert!(!rig.fake.has_dir("/srv/env"));
        assert!(!rig.fake.is_open_now());
        rig.orchestrator.clean_target().expect("clean again");
    }

    #[test]
    fn clean_after_connect_requires_reconnecting_before_a_run() {
        let mut rig = rig("clean_then_run", watchdog());
        rig.connect();
        assert_eq!(rig.orchestrator.state(), RunState::Connected);

        rig.orchestrator.clean_target().expect("clean");
        assert_eq!(rig.orchestrator.state(), RunState::Idle);
        assert!(matches!(
            rig.orchestrator.check_connection_status(),
            Err(OrchestratorError::NotStarted)
        ));
        let tests = rig.local_tests();
        assert!(!rig.orchestrator.execute(tests.clone()));
        assert!(rig.fake.spawned().is_empty());

        runner_writes(&rig.fake, "SUCCESS");
        rig.connect();
        rig.run(tests);
        assert!(rig
            .orchestrator
            .execution_outcome()
            .expect("finished")
            .is_ok());
    }

    #[test]
    fn elevated_runs_fix_permissions_and_clean_through_sudo() {
        let mut rig = rig("elevated", watchdog());
        runner_writes(&rig.fake, "SUCCESS");
        rig.connect();
        let tests = rig.local_tests();
        rig.run(tests);
        assert!(rig.fake.commands().contains(
            &"sudo -n chmod -R u+rwX,go+rX /srv/env && sudo -n chmod 755 /srv/env/mte-target"
                .to_string()
        ));

        rig.orchestrator.clean_target().expect("clean");
        let commands = rig.fake.commands();
        assert!(commands.contains(&"sudo -n rm -rf /srv/env/results".to_string()));
        assert!(commands.contains(&"sudo -n rm -f /srv/env/exit".to_string()));
        assert!(!commands.iter().any(|c| c.starts_with("rm ")));
    }

    #[test]
    fn unelevated_permissions_command_has_no_sudo() {
        let remote = RemoteLayout::new("/srv/env");
        assert_eq!(
            permissions_command(&remote, false),
            "chmod -R u+rwX,go+rX /srv/env && chmod 755 /srv/env/mte-target"
        );
    }

    #[test]
    fn state_cell_only_moves_from_allowed_states() {
        let cell = StateCell::new();
        assert_eq!(
            cell.transition(&[RunState::Connected], RunState::Running),
            Err(RunState::Idle)
        );
        cell.transition(&[RunState::Idle], RunState::Connecting)
            .expect("connect");
        cell.transition(&[RunState::Connecting], RunState::Connected)
            .expect("connected");
        cell.transition(&[RunState::Connected], RunState::Running)
            .expect("run");
        assert_eq!(
            cell.transition(&[RunState::Idle, RunState::Done], RunState::Connecting),
            Err(RunState::Running)
        );
        assert_eq!(cell.get(), RunState::Running);
        assert_eq!(decode(RunState::ConnectFailed as u8), RunState::ConnectFailed);
    }

    #[test]
    fn launch_command_honours_sudo_setting() {
        let remote = RemoteLayout::new("/home/t/mte env");
        assert_eq!(
            launch_command(&remote, false),
            "cd '/home/t/mte env' && ./mte-target --root '/home/t/mte env'"
        );
        assert!(launch_command(&remote, true).contains("sudo -n ./mte-target"));
    }
}
