use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Origin {
    #[default]
    #[serde(rename = "LOCAL")]
    Local,
    #[serde(rename = "EXTERNAL-CORPUS", alias = "GIT")]
    ExternalCorpus,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "LOCAL",
            Origin::ExternalCorpus => "EXTERNAL-CORPUS",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected evidence for one test. A `None` channel is not graded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expectations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dmesg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub command: String,
    pub results: Expectations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    PreExecution,
    Execution,
    PostExecution,
    Cleanup,
}

impl Phase {
    pub const ORDER: [Phase; 5] = [
        Phase::Setup,
        Phase::PreExecution,
        Phase::Execution,
        Phase::PostExecution,
        Phase::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::PreExecution => "pre-execution",
            Phase::Execution => "execution",
            Phase::PostExecution => "post-execution",
            Phase::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One conformance test as authored in a definition file.
///
/// `suite` and `src` are filled in by discovery, not by the author.
/// `selected` is caller state only and never serialized, so a staged
/// manifest never carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDescriptor {
    pub name: String,
    #[serde(default)]
    pub suite: String,
    #[serde(default)]
    pub src: String,
    #[serde(rename = "type", default)]
    pub origin: Origin,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub setup: Vec<String>,
    #[serde(rename = "pre-execution", default, deserialize_with = "null_as_empty")]
    pub pre_execution: Vec<String>,
    pub execution: Execution,
    #[serde(rename = "post-execution", default, deserialize_with = "null_as_empty")]
    pub post_execution: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub cleanup: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constable: Option<String>,
    #[serde(default = "default_true")]
    pub use_constable: bool,
    #[serde(skip)]
    pub selected: bool,
}

fn default_true() -> bool {
    true
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl TestDescriptor {
    pub fn tagged(mut self, suite: &str, src: &str) -> Self {
        self.suite = suite.to_string();
        self.src = src.to_string();
        self.selected = true;
        self
    }

    /// Commands for a list phase. `Execution` yields the single main command.
    pub fn commands(&self, phase: Phase) -> &[String] {
        match phase {
            Phase::Setup => &self.setup,
            Phase::PreExecution => &self.pre_execution,
            Phase::Execution => std::slice::from_ref(&self.execution.command),
            Phase::PostExecution => &self.post_execution,
            Phase::Cleanup => &self.cleanup,
        }
    }

    pub fn expectations(&self) -> &Expectations {
        &self.execution.results
    }

    pub fn requires_corpus(&self) -> bool {
        self.origin == Origin::ExternalCorpus
    }

    /// Monitor config snippet, if the test both uses the monitor and ships one.
    pub fn monitor_snippet(&self) -> Option<&str> {
        if !self.use_constable {
            return None;
        }
        self.constable.as_deref().filter(|s| !s.trim().is_empty())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("invalid_test: empty name in {}", self.src);
        }
        if self.execution.command.trim().is_empty() {
            anyhow::bail!("invalid_test: {} has no execution command", self.name);
        }
        Ok(())
    }
}
