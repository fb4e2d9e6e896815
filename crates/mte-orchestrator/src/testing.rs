use crate::channel::{elevated, shell_quote, ChannelError, Transport};
use crate::hypervisor::{Hypervisor, MachineState};
use crate::logging::OutputSink;
use crate::target::TargetError;
use chrono::Utc;
use mte_core::ProcessResult;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "mte_host_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

#[derive(Default)]
pub struct RecordingSink {
    lines: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("sink").clone()
    }
}

impl OutputSink for RecordingSink {
    fn out(&self, message: &str) {
        self.lines.lock().expect("sink").push(message.to_string());
    }
}

#[derive(Debug, Clone)]
pub enum FakeReply {
    Exit(i32, String),
    Timeout,
    Lost,
}

#[derive(Default)]
struct FakeState {
    open: bool,
    open_attempts: usize,
    refused_opens: usize,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    commands: Vec<String>,
    spawned: Vec<String>,
    replies: HashMap<String, VecDeque<FakeReply>>,
    on_spawn: Vec<(String, Vec<u8>)>,
}

impl FakeState {
    fn add_parents(&mut self, path: &str) {
        let mut end = path.len();
        while let Some(idx) = path[..end].rfind('/') {
            if idx == 0 {
                break;
            }
            self.dirs.insert(path[..idx].to_string());
            end = idx;
        }
    }

    fn put(&mut self, path: &str, bytes: Vec<u8>) {
        self.add_parents(path);
        self.files.insert(path.to_string(), bytes);
    }

    fn has_children(&self, dir: &str) -> bool {
        let prefix = format!("{}/", dir);
        self.files.keys().any(|k| k.starts_with(&prefix))
            || self.dirs.iter().any(|d| d.starts_with(&prefix))
    }
}

/// In-memory remote host. Clones share state, so a test keeps one handle
/// while the channel owns another.
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake transport")
    }

    pub fn refuse_opens(&self, count: usize) {
        self.state().refused_opens = count;
    }

    pub fn open_attempts(&self) -> usize {
        self.state().open_attempts
    }

    /// Queues a reply for the next run of exactly `command`.
    pub fn script(&self, command: &str, reply: FakeReply) {
        self.state()
            .replies
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Files that appear on the remote once something is spawned.
    pub fn on_spawn_write(&self, path: &str, content: &str) {
        self.state()
            .on_spawn
            .push((path.to_string(), content.as_bytes().to_vec()));
    }

    pub fn put_file(&self, path: &str, content: &str) {
        self.state().put(path, content.as_bytes().to_vec());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state()
            .files
            .get(path)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn is_open_now(&self) -> bool {
        self.state().open
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state().dirs.contains(path)
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn spawned(&self) -> Vec<String> {
        self.state().spawned.clone()
    }
}

impl Transport for FakeTransport {
    fn open(&mut self) -> Result<(), ChannelError> {
        let mut state = self.state();
        state.open_attempts += 1;
        if state.refused_opens > 0 {
            state.refused_opens -= 1;
            return Err(ChannelError::Connect {
                target: "fake".to_string(),
                message: "Connection refused".to_string(),
            });
        }
        state.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.state().open = false;
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    /// Unscripted `cat <path>` reads the in-memory file; unscripted `pgrep`
    /// finds nothing; anything else succeeds silently.
    fn run(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ProcessResult, ChannelError> {
        let mut state = self.state();
        if !state.open {
            return Err(ChannelError::NotConnected);
        }
        state.commands.push(command.to_string());
        let scripted = state
            .replies
            .get_mut(command)
            .and_then(|queue| queue.pop_front());
        let (code, stdout) = match scripted {
            Some(FakeReply::Exit(code, stdout)) => (code, stdout),
            Some(FakeReply::Timeout) => {
                return Err(ChannelError::Timeout {
                    command: command.to_string(),
                    after: timeout.unwrap_or_default(),
                })
            }
            Some(FakeReply::Lost) => {
                state.open = false;
                return Err(ChannelError::SessionLost("connection reset".to_string()));
            }
            None => match command.strip_prefix("cat ") {
                Some(path) => match state.files.get(path.trim_matches('\'')) {
                    Some(bytes) => (0, String::from_utf8_lossy(bytes).into_owned()),
                    None => (1, String::new()),
                },
                None if command.starts_with("pgrep ") => (1, String::new()),
                None => (0, String::new()),
            },
        };
        Ok(ProcessResult {
            exit_code: Some(code),
            stdout,
            stderr: if code == 0 { String::new() } else { "failed".to_string() },
        })
    }

    fn upload(&mut self, local: &Path, remote: &str) -> Result<(), ChannelError> {
        let bytes = fs::read(local)?;
        let mut state = self.state();
        if !state.open {
            return Err(ChannelError::NotConnected);
        }
        state.put(remote, bytes);
        Ok(())
    }

    fn download(&mut self, remote: &str, local: &Path) -> Result<(), ChannelError> {
        let bytes = {
            let state = self.state();
            if !state.open {
                return Err(ChannelError::NotConnected);
            }
            state.files.get(remote).cloned()
        };
        let bytes = bytes.ok_or_else(|| ChannelError::Transfer {
            path: remote.to_string(),
            message: "No such file or directory".to_string(),
        })?;
        fs::write(local, bytes)?;
        Ok(())
    }

    fn spawn(&mut self, command: &str, _timeout: Option<Duration>) -> Result<(), ChannelError> {
        let mut state = self.state();
        if !state.open {
            return Err(ChannelError::NotConnected);
        }
        state.spawned.push(command.to_string());
        for (path, bytes) in std::mem::take(&mut state.on_spawn) {
            state.put(&path, bytes);
        }
        Ok(())
    }

    fn exists(&mut self, remote: &str) -> Result<bool, ChannelError> {
        let state = self.state();
        Ok(state.files.contains_key(remote) || state.dirs.contains(remote))
    }

    fn mkdir(&mut self, remote: &str) -> Result<(), ChannelError> {
        let mut state = self.state();
        state.add_parents(remote);
        state.dirs.insert(remote.to_string());
        Ok(())
    }

    fn list_dir(&mut self, remote: &str) -> Result<Vec<String>, ChannelError> {
        let state = self.state();
        let prefix = format!("{}/", remote);
        let names: BTreeSet<String> = state
            .files
            .keys()
            .chain(state.dirs.iter())
            .filter_map(|p| p.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect();
        Ok(names.into_iter().collect())
    }

    /// Removals act in memory but are recorded as the command they stand for.
    fn remove_file(&mut self, remote: &str, elevate: bool) -> Result<(), ChannelError> {
        let mut state = self.state();
        state
            .commands
            .push(elevated(format!("rm -f {}", shell_quote(remote)), elevate));
        state.files.remove(remote);
        Ok(())
    }

    fn remove_tree(&mut self, remote: &str, elevate: bool) -> Result<(), ChannelError> {
        let mut state = self.state();
        state
            .commands
            .push(elevated(format!("rm -rf {}", shell_quote(remote)), elevate));
        let prefix = format!("{}/", remote);
        state
            .files
            .retain(|k, _| k != remote && !k.starts_with(&prefix));
        state
            .dirs
            .retain(|d| d != remote && !d.starts_with(&prefix));
        Ok(())
    }

    fn remove_empty_dir(&mut self, remote: &str, elevate: bool) -> Result<(), ChannelError> {
        let mut state = self.state();
        state
            .commands
            .push(elevated(format!("rmdir {}", shell_quote(remote)), elevate));
        if !state.dirs.contains(remote) || state.has_children(remote) {
            return Err(ChannelError::Command {
                command: format!("rmdir {}", remote),
                code: 1,
                stderr: "Directory not empty or missing".to_string(),
            });
        }
        state.dirs.remove(remote);
        Ok(())
    }
}

pub struct ScriptedHypervisor {
    registered: bool,
    state: Mutex<MachineState>,
    launches: AtomicUsize,
}

impl ScriptedHypervisor {
    pub fn new(state: MachineState) -> Self {
        Self {
            registered: true,
            state: Mutex::new(state),
            launches: AtomicUsize::new(0),
        }
    }

    pub fn unregistered() -> Self {
        Self {
            registered: false,
            ..Self::new(MachineState::PoweredOff)
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl Hypervisor for ScriptedHypervisor {
    fn ensure_registered(&self, name: &str) -> Result<(), TargetError> {
        if self.registered {
            Ok(())
        } else {
            Err(TargetError::VmNotFound(name.to_string()))
        }
    }

    fn state(&self, _name: &str) -> Result<MachineState, TargetError> {
        Ok(self.state.lock().expect("vm state").clone())
    }

    fn launch(&self, _name: &str) -> Result<(), TargetError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().expect("vm state") = MachineState::Running;
        Ok(())
    }
}
