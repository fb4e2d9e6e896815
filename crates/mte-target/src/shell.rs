use anyhow::{Context, Result};
use mte_core::layout::SCRATCH_DIRS;
use mte_core::ProcessResult;
use std::path::Path;
use std::process::Command;

pub trait Shell {
    fn run(&self, command: &str, cwd: &Path) -> Result<ProcessResult>;
}

/// Runs commands through `sh -c`, rewriting scratch-directory references
/// to absolute paths under the environment root.
#[derive(Debug, Clone)]
pub struct SystemShell {
    root: String,
}

impl SystemShell {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_string_lossy().trim_end_matches('/').to_string(),
        }
    }
}

impl Shell for SystemShell {
    fn run(&self, command: &str, cwd: &Path) -> Result<ProcessResult> {
        let expanded = expand_scratch_paths(command, &self.root);
        let output = Command::new("sh")
            .arg("-c")
            .arg(&expanded)
            .current_dir(cwd)
            .output()
            .with_context(|| format!("spawn_failed: {}", expanded))?;
        Ok(ProcessResult {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

fn starts_token(prev: Option<char>) -> bool {
    match prev {
        None => true,
        Some(c) => c.is_whitespace() || "'\"=(;|&<>".contains(c),
    }
}

fn ends_token(next: Option<char>) -> bool {
    match next {
        None => true,
        Some(c) => c == '/' || c.is_whitespace() || "'\";|&<>)".contains(c),
    }
}

/// Rewrites `allowed/x` style tokens to `<root>/allowed/x`. Only whole path
/// segments at the start of a token are touched, so `not_allowed` stays.
pub fn expand_scratch_paths(command: &str, root: &str) -> String {
    let mut out = String::with_capacity(command.len());
    let mut prev: Option<char> = None;
    let mut i = 0;
    while i < command.len() {
        let rest = &command[i..];
        let hit = if starts_token(prev) {
            SCRATCH_DIRS.iter().copied().find(|name| {
                rest.starts_with(name) && ends_token(rest[name.len()..].chars().next())
            })
        } else {
            None
        };
        if let Some(name) = hit {
            out.push_str(root);
            out.push('/');
            out.push_str(name);
            i += name.len();
            prev = name.chars().last();
            continue;
        }
        let Some(c) = rest.chars().next() else {
            break;
        };
        out.push(c);
        prev = Some(c);
        i += c.len_utf8();
    }
    out
}
