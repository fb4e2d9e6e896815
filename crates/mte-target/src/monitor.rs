use anyhow::{anyhow, Context, Result};
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// The policy monitor companion process whose decision log is one of the
/// graded evidence channels.
pub trait PolicyMonitor {
    fn start(&mut self) -> Result<()>;
    /// Returns everything buffered since the previous read and clears it.
    fn read(&mut self) -> String;
    fn stop(&mut self) -> Result<()>;
    fn is_running(&self) -> bool;
}

pub struct ConstableMonitor {
    command: Vec<String>,
    child: Option<Child>,
    buffer: Arc<Mutex<String>>,
    readers: Vec<JoinHandle<()>>,
}

impl ConstableMonitor {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            child: None,
            buffer: Arc::new(Mutex::new(String::new())),
            readers: Vec::new(),
        }
    }

    fn drain_into<R: Read + Send + 'static>(&mut self, stream: R) {
        let buffer = Arc::clone(&self.buffer);
        self.readers.push(thread::spawn(move || {
            // Kernel paths are not always UTF-8; keep reading past them.
            let mut reader = BufReader::new(stream);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
                if let Ok(mut buf) = buffer.lock() {
                    buf.push_str(&String::from_utf8_lossy(&line));
                    if !buf.ends_with('\n') {
                        buf.push('\n');
                    }
                }
            }
        }));
    }
}

impl PolicyMonitor for ConstableMonitor {
    fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Err(anyhow!("monitor_already_running"));
        }
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("monitor_command_empty"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("monitor_spawn_failed: {}", self.command.join(" ")))?;
        if let Some(out) = child.stdout.take() {
            self.drain_into(out);
        }
        if let Some(err) = child.stderr.take() {
            self.drain_into(err);
        }
        debug!(pid = child.id(), "policy monitor started");
        self.child = Some(child);
        Ok(())
    }

    fn read(&mut self) -> String {
        match self.buffer.lock() {
            Ok(mut buf) => std::mem::take(&mut *buf),
            Err(_) => String::new(),
        }
    }

    fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if let Err(e) = child.kill() {
            warn!(error = %e, "policy monitor kill failed");
        }
        child.wait().context("monitor_wait_failed")?;
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        debug!("policy monitor stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.child.is_some()
    }
}

impl Drop for ConstableMonitor {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
