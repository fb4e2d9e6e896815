//! Transport over the system OpenSSH client. One master connection is kept
//! per session (`ControlMaster`); every command and copy multiplexes over it.
//! Password logins go through `sshpass -e` with the secret in the
//! environment, never on the command line.

use super::transport::Transport;
use super::ChannelError;
use mte_core::ProcessResult;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Exit status the ssh client reserves for its own failures.
const SSH_FAILURE: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
}

impl SshTarget {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

pub struct OpenSshTransport {
    target: SshTarget,
    control_path: PathBuf,
    open: bool,
}

impl OpenSshTransport {
    pub fn new(target: SshTarget) -> Self {
        let control_path = std::env::temp_dir().join(format!(
            "mte-{}-{}-{}.sock",
            std::process::id(),
            target.host.replace(['/', ':'], "_"),
            target.port
        ));
        Self {
            target,
            control_path,
            open: false,
        }
    }

    fn error_log(&self) -> PathBuf {
        self.control_path.with_extension("err")
    }

    fn common_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", CONNECT_TIMEOUT.as_secs()),
            "-o".to_string(),
            "ServerAliveInterval=5".to_string(),
        ];
        if self.target.password.is_none() {
            opts.push("-o".to_string());
            opts.push("BatchMode=yes".to_string());
        }
        if let Some(identity) = &self.target.identity_file {
            opts.push("-i".to_string());
            opts.push(identity.display().to_string());
        }
        opts
    }

    fn ssh_args(&self, extra: &[&str], command: Option<&str>) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.target.port.to_string()];
        args.extend(self.common_options());
        args.extend(extra.iter().map(|s| s.to_string()));
        args.push(self.target.destination());
        if let Some(command) = command {
            args.push("--".to_string());
            args.push(command.to_string());
        }
        args
    }

    fn scp_args(&self, from: &str, to: &str) -> Vec<String> {
        let mut args = vec![
            "-q".to_string(),
            "-P".to_string(),
            self.target.port.to_string(),
        ];
        args.extend(self.common_options());
        args.push(from.to_string());
        args.push(to.to_string());
        args
    }

    fn remote_spec(&self, path: &str) -> String {
        format!("{}:{}", self.target.destination(), path)
    }

    fn command(&self, program: &str, args: &[String]) -> Command {
        match &self.target.password {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(program).args(args).env("SSHPASS", password);
                cmd
            }
            None => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        }
    }

    fn copy(&self, from: &str, to: &str, label: &str) -> Result<(), ChannelError> {
        let cmd = self.command("scp", &self.scp_args(from, to));
        let result = run_captured(cmd, label, None)?;
        if result.success() {
            return Ok(());
        }
        Err(ChannelError::Transfer {
            path: label.to_string(),
            message: result.stderr.trim().to_string(),
        })
    }
}

impl Transport for OpenSshTransport {
    fn open(&mut self) -> Result<(), ChannelError> {
        if self.open {
            return Ok(());
        }
        let _ = fs::remove_file(&self.control_path);
        let _ = fs::remove_file(self.error_log());
        let error_log = self.error_log().display().to_string();
        let args = self.ssh_args(
            &[
                "-o",
                "ControlMaster=yes",
                "-o",
                "ControlPersist=yes",
                "-E",
                error_log.as_str(),
                "-f",
                "-N",
            ],
            None,
        );
        // The master forks into the background after authenticating and would
        // hold captured pipes open, so nothing is captured here.
        let mut cmd = self.command("ssh", &args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = cmd.spawn()?;
        let status = wait_with_deadline(&mut child, "ssh", Some(CONNECT_TIMEOUT))?;
        if status.success() {
            self.open = true;
            return Ok(());
        }
        let message = fs::read_to_string(self.error_log())
            .unwrap_or_default()
            .trim()
            .to_string();
        Err(classify_open_failure(&self.target, message))
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        let args = self.ssh_args(&["-O", "exit"], None);
        let mut cmd = self.command("ssh", &args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Ok(mut child) = cmd.spawn() {
            let _ = wait_with_deadline(&mut child, "ssh -O exit", Some(CONNECT_TIMEOUT));
        }
        let _ = fs::remove_file(&self.control_path);
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn run(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ProcessResult, ChannelError> {
        if !self.open {
            return Err(ChannelError::NotConnected);
        }
        let cmd = self.command("ssh", &self.ssh_args(&[], Some(command)));
        let result = run_captured(cmd, command, timeout)?;
        if result.exit_code == Some(SSH_FAILURE) {
            return Err(ChannelError::SessionLost(result.stderr.trim().to_string()));
        }
        Ok(result)
    }

    fn upload(&mut self, local: &Path, remote: &str) -> Result<(), ChannelError> {
        if !self.open {
            return Err(ChannelError::NotConnected);
        }
        let from = local.display().to_string();
        self.copy(&from, &self.remote_spec(remote), &from)
    }

    fn download(&mut self, remote: &str, local: &Path) -> Result<(), ChannelError> {
        if !self.open {
            return Err(ChannelError::NotConnected);
        }
        let to = local.display().to_string();
        self.copy(&self.remote_spec(remote), &to, remote)
    }
}

impl Drop for OpenSshTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn classify_open_failure(target: &SshTarget, message: String) -> ChannelError {
    let endpoint = format!("{}:{}", target.destination(), target.port);
    if message.contains("Permission denied") || message.contains("Too many authentication failures")
    {
        ChannelError::Auth {
            target: endpoint,
            message,
        }
    } else {
        ChannelError::Connect {
            target: endpoint,
            message,
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn wait_with_deadline(
    child: &mut Child,
    label: &str,
    timeout: Option<Duration>,
) -> Result<ExitStatus, ChannelError> {
    let Some(limit) = timeout else {
        return Ok(child.wait()?);
    };
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ChannelError::Timeout {
                command: label.to_string(),
                after: limit,
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn run_captured(
    mut cmd: Command,
    label: &str,
    timeout: Option<Duration>,
) -> Result<ProcessResult, ChannelError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    // On timeout the readers are left to finish once the killed client's
    // pipes close.
    let status = wait_with_deadline(&mut child, label, timeout)?;
    Ok(ProcessResult {
        exit_code: status.code(),
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}
