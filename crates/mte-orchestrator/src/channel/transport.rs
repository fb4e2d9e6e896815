use super::{shell_quote, ChannelError};
use mte_core::ProcessResult;
use std::path::Path;
use std::time::Duration;

/// A session-oriented remote endpoint: commands, file copies and a handful of
/// filesystem primitives. The filesystem helpers are expressed as shell
/// commands by default; in-memory transports override them.
pub trait Transport: Send {
    fn open(&mut self) -> Result<(), ChannelError>;

    /// Idempotent.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Runs `command` and reports its exit status without judging it.
    /// A session failure is an error; a non-zero exit is not.
    fn run(&mut self, command: &str, timeout: Option<Duration>)
        -> Result<ProcessResult, ChannelError>;

    fn upload(&mut self, local: &Path, remote: &str) -> Result<(), ChannelError>;

    fn download(&mut self, remote: &str, local: &Path) -> Result<(), ChannelError>;

    /// Starts `command` detached from the session; returns once launched.
    fn spawn(&mut self, command: &str, timeout: Option<Duration>) -> Result<(), ChannelError> {
        let detached = format!("nohup sh -c {} > /dev/null 2>&1 &", shell_quote(command));
        self.run(&detached, timeout)
            .and_then(|result| require_success(&detached, result))
            .map(|_| ())
    }

    fn exists(&mut self, remote: &str) -> Result<bool, ChannelError> {
        let command = format!("test -e {}", shell_quote(remote));
        let result = self.run(&command, None)?;
        match result.exit_code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => require_success(&command, result).map(|_| false),
        }
    }

    /// Creates `remote` and any missing parents.
    fn mkdir(&mut self, remote: &str) -> Result<(), ChannelError> {
        self.checked(&format!("mkdir -p {}", shell_quote(remote)))
    }

    fn list_dir(&mut self, remote: &str) -> Result<Vec<String>, ChannelError> {
        let command = format!("ls -1A {}", shell_quote(remote));
        let result = self.run(&command, None)?;
        let result = require_success(&command, result)?;
        Ok(result
            .stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Succeeds when the file is already absent. With `elevate` the removal
    /// runs under `sudo -n`, for files the elevated runner created.
    fn remove_file(&mut self, remote: &str, elevate: bool) -> Result<(), ChannelError> {
        self.checked(&elevated(format!("rm -f {}", shell_quote(remote)), elevate))
    }

    /// Succeeds when the tree is already absent.
    fn remove_tree(&mut self, remote: &str, elevate: bool) -> Result<(), ChannelError> {
        self.checked(&elevated(format!("rm -rf {}", shell_quote(remote)), elevate))
    }

    /// Fails when the directory is absent or not empty.
    fn remove_empty_dir(&mut self, remote: &str, elevate: bool) -> Result<(), ChannelError> {
        self.checked(&elevated(format!("rmdir {}", shell_quote(remote)), elevate))
    }

    fn checked(&mut self, command: &str) -> Result<(), ChannelError> {
        let result = self.run(command, None)?;
        require_success(command, result).map(|_| ())
    }
}

/// Prefixes `command` with non-interactive sudo when `elevate` is set.
pub fn elevated(command: String, elevate: bool) -> String {
    if elevate {
        format!("sudo -n {}", command)
    } else {
        command
    }
}

pub fn require_success(
    command: &str,
    result: ProcessResult,
) -> Result<ProcessResult, ChannelError> {
    if result.success() {
        return Ok(result);
    }
    Err(ChannelError::Command {
        command: command.to_string(),
        code: result.exit_code.unwrap_or(-1),
        stderr: result.stderr.trim().to_string(),
    })
}
