//! Remote command execution and directory transfer over a [`Transport`].

mod openssh;
mod transport;

pub use openssh::{OpenSshTransport, SshTarget};
pub use transport::{elevated, require_success, Transport};

use crate::logging::LogContext;
use mte_core::layout::{join_remote, RemoteLayout, SCRATCH_DIRS, STAGED_FILES};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Directory names never copied to the target.
pub const TRANSFER_DENYLIST: [&str; 6] = [".git", ".svn", ".hg", ".idea", ".vscode", "__pycache__"];

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("not connected to the target")]
    NotConnected,
    #[error("connection to {target} failed: {message}")]
    Connect { target: String, message: String },
    #[error("authentication to {target} failed: {message}")]
    Auth { target: String, message: String },
    #[error("remote session lost: {0}")]
    SessionLost(String),
    #[error("remote command `{command}` exited with status {code}: {stderr}")]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("remote command `{command}` gave no response within {after:?}")]
    Timeout { command: String, after: Duration },
    #[error("transfer source does not exist: {0}")]
    MissingSource(PathBuf),
    #[error("transfer of {path} failed: {message}")]
    Transfer { path: String, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChannelError::Timeout { .. })
    }

    /// The command ran to completion and reported failure; the session is
    /// still usable.
    pub fn is_command_failure(&self) -> bool {
        matches!(self, ChannelError::Command { .. })
    }
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=@".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Host-side directories the channel reads from and writes into.
#[derive(Debug, Clone)]
pub struct LocalPaths {
    pub staging_dir: PathBuf,
    pub corpus_dir: PathBuf,
    pub results_dir: PathBuf,
}

pub struct TransferChannel {
    transport: Box<dyn Transport>,
    paths: LocalPaths,
    log: LogContext,
}

impl TransferChannel {
    pub fn new(transport: Box<dyn Transport>, paths: LocalPaths, log: LogContext) -> Self {
        Self {
            transport,
            paths,
            log,
        }
    }

    pub fn connect(&mut self) -> Result<(), ChannelError> {
        self.transport.open()
    }

    pub fn disconnect(&mut self) {
        self.transport.close();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    fn require_connected(&self) -> Result<(), ChannelError> {
        if self.transport.is_open() {
            Ok(())
        } else {
            Err(ChannelError::NotConnected)
        }
    }

    /// Runs `command` and returns its stdout without the trailing newline.
    /// A non-zero exit is a [`ChannelError::Command`]; no response within
    /// `timeout` is a [`ChannelError::Timeout`].
    pub fn exec(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String, ChannelError> {
        self.require_connected()?;
        self.log.debug(format!("remote: {}", command));
        let result = self.transport.run(command, timeout)?;
        let result = require_success(command, result)?;
        Ok(result.stdout.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Launches `command` detached and returns without waiting for it.
    pub fn exec_async(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<(), ChannelError> {
        self.require_connected()?;
        self.log.debug(format!("remote (detached): {}", command));
        self.transport.spawn(command, timeout)
    }

    /// Copies a local file or directory tree to `dest`. A directory lands as
    /// `dest/<name>`, or with `contents_only` its children land directly in
    /// `dest`. Existing remote files are overwritten.
    pub fn transfer(
        &mut self,
        source: &Path,
        dest: &str,
        contents_only: bool,
    ) -> Result<(), ChannelError> {
        self.require_connected()?;
        if !source.exists() {
            return Err(ChannelError::MissingSource(source.to_path_buf()));
        }
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.transport.mkdir(dest)?;
        if source.is_file() {
            return self.transport.upload(source, &join_remote(dest, &name));
        }

        let root = if contents_only {
            dest.to_string()
        } else {
            let root = join_remote(dest, &name);
            self.transport.mkdir(&root)?;
            root
        };
        self.log.debug(format!("Transferring {} to {}", source.display(), root));
        let walker = walkdir::WalkDir::new(source)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                !(e.file_type().is_dir()
                    && TRANSFER_DENYLIST
                        .iter()
                        .any(|denied| e.file_name() == *denied))
            });
        for entry in walker {
            let entry = entry.map_err(|e| ChannelError::Transfer {
                path: source.display().to_string(),
                message: e.to_string(),
            })?;
            let rel = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| ChannelError::Transfer {
                    path: entry.path().display().to_string(),
                    message: e.to_string(),
                })?;
            let remote = rel
                .components()
                .fold(root.clone(), |acc, c| join_remote(&acc, &c.as_os_str().to_string_lossy()));
            if entry.file_type().is_dir() {
                self.transport.mkdir(&remote)?;
            } else if entry.path().is_file() {
                self.transport.upload(entry.path(), &remote)?;
            } else {
                self.log
                    .debug(format!("Skipping {}: not a regular file", entry.path().display()));
            }
        }
        Ok(())
    }

    /// Pushes the staging tree into the remote working directory, plus the
    /// external corpus when any selected test needs it.
    pub fn prepare_environment(
        &mut self,
        env: &RemoteLayout,
        include_corpus: bool,
    ) -> Result<(), ChannelError> {
        let staging = self.paths.staging_dir.clone();
        self.transfer(&staging, env.root(), true)?;
        if include_corpus {
            let corpus = self.paths.corpus_dir.clone();
            if !corpus.is_dir() {
                return Err(ChannelError::MissingSource(corpus));
            }
            self.log.info("Transferring external test corpus...");
            self.transfer(&corpus, env.root(), false)?;
        }
        Ok(())
    }

    /// Fetches the runner log, and unless `log_only` the results file and
    /// the per-test details, which replace any local copy.
    pub fn download_results(
        &mut self,
        env: &RemoteLayout,
        log_only: bool,
    ) -> Result<(), ChannelError> {
        self.require_connected()?;
        let local = self.paths.results_dir.clone();
        fs::create_dir_all(&local)?;
        self.transport
            .download(&env.log(), &local.join(mte_core::layout::REMOTE_LOG))?;
        if log_only {
            return Ok(());
        }
        self.transport.download(
            &env.results_file(),
            &local.join(mte_core::layout::RESULTS_FILE),
        )?;

        let details = local.join(mte_core::layout::DETAILS_DIR);
        if details.exists() {
            fs::remove_dir_all(&details)?;
        }
        fs::create_dir_all(&details)?;
        let remote_details = env.details_dir();
        if !self.transport.exists(&remote_details)? {
            return Ok(());
        }
        for name in self.transport.list_dir(&remote_details)? {
            self.transport
                .download(&join_remote(&remote_details, &name), &details.join(&name))?;
        }
        Ok(())
    }

    /// Removes everything staging and the runner placed under the remote
    /// working directory, then the directory itself if it is empty. Safe to
    /// repeat. `elevate` must match how the runner was launched, since its
    /// output is owned by the user it ran as.
    pub fn clean_target(&mut self, env: &RemoteLayout, elevate: bool) -> Result<(), ChannelError> {
        self.require_connected()?;
        for name in STAGED_FILES {
            self.transport.remove_file(&env.path(name), elevate)?;
        }
        self.transport.remove_tree(&env.results_dir(), elevate)?;
        for dir in SCRATCH_DIRS {
            self.transport.remove_tree(&env.path(dir), elevate)?;
        }
        if let Err(err) = self.transport.remove_tree(&env.corpus(), elevate) {
            self.log
                .warn(format!("Could not remove test corpus from target: {}", err));
        }
        if let Err(err) = self.transport.remove_empty_dir(env.root(), elevate) {
            self.log
                .debug(format!("Working directory {} left in place: {}", env.root(), err));
        }
        Ok(())
    }
}
