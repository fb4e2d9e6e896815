use crate::monitor::PolicyMonitor;
use crate::shell::Shell;
use anyhow::{anyhow, Result};
use chrono::Utc;
use mte_core::{Execution, Expectations, Origin, ProcessResult, TestDescriptor};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "mte_target_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    std::fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

pub fn descriptor(name: &str, src: &str) -> TestDescriptor {
    TestDescriptor {
        name: name.to_string(),
        suite: src.rsplit('/').next().unwrap_or(src).to_string(),
        src: src.to_string(),
        origin: Origin::Local,
        setup: Vec::new(),
        pre_execution: Vec::new(),
        execution: Execution {
            command: format!("exec {}", name),
            results: Expectations::default(),
        },
        post_execution: Vec::new(),
        cleanup: Vec::new(),
        constable: None,
        use_constable: true,
        selected: false,
    }
}

/// Ordered record of everything the runner did, shared by the fakes.
pub type Journal = Rc<RefCell<Vec<String>>>;

pub fn journal() -> Journal {
    Rc::new(RefCell::new(Vec::new()))
}

pub struct RecordingShell {
    journal: Journal,
    failures: Vec<(String, i32)>,
    responses: Vec<(String, String)>,
    cwds: RefCell<Vec<PathBuf>>,
}

impl RecordingShell {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            failures: Vec::new(),
            responses: Vec::new(),
            cwds: RefCell::new(Vec::new()),
        }
    }

    pub fn fail_on(mut self, command: &str, code: i32) -> Self {
        self.failures.push((command.to_string(), code));
        self
    }

    pub fn respond(mut self, command: &str, stdout: &str) -> Self {
        self.responses.push((command.to_string(), stdout.to_string()));
        self
    }

    pub fn cwd_of(&self, command: &str) -> Option<PathBuf> {
        let journal = self.journal.borrow();
        let cwds = self.cwds.borrow();
        journal
            .iter()
            .filter(|e| !e.starts_with("monitor:"))
            .zip(cwds.iter())
            .find(|(e, _)| e.as_str() == command)
            .map(|(_, cwd)| cwd.clone())
    }
}

impl Shell for RecordingShell {
    fn run(&self, command: &str, cwd: &Path) -> Result<ProcessResult> {
        self.journal.borrow_mut().push(command.to_string());
        self.cwds.borrow_mut().push(cwd.to_path_buf());
        let exit_code = self
            .failures
            .iter()
            .find(|(c, _)| c == command)
            .map(|(_, code)| *code)
            .unwrap_or(0);
        let stdout = self
            .responses
            .iter()
            .find(|(c, _)| c == command)
            .map(|(_, out)| out.clone())
            .unwrap_or_default();
        Ok(ProcessResult {
            exit_code: Some(exit_code),
            stdout,
            stderr: if exit_code == 0 {
                String::new()
            } else {
                format!("{} failed", command)
            },
        })
    }
}

pub struct ScriptedMonitor {
    journal: Journal,
    output: String,
    running: bool,
    fail_start: bool,
}

impl ScriptedMonitor {
    pub fn new(journal: Journal, output: &str) -> Self {
        Self {
            journal,
            output: output.to_string(),
            running: false,
            fail_start: false,
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail_start = true;
        self
    }
}

impl PolicyMonitor for ScriptedMonitor {
    fn start(&mut self) -> Result<()> {
        self.journal.borrow_mut().push("monitor:start".to_string());
        if self.fail_start {
            return Err(anyhow!("monitor_spawn_failed: scripted"));
        }
        self.running = true;
        Ok(())
    }

    fn read(&mut self) -> String {
        self.output.clone()
    }

    fn stop(&mut self) -> Result<()> {
        if self.running {
            self.journal.borrow_mut().push("monitor:stop".to_string());
        }
        self.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }
}
