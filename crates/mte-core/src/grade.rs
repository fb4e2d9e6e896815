use crate::descriptor::Expectations;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome for one evidence channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Grade {
    Passed,
    Failed,
    Ignored,
}

impl Grade {
    fn from_match(expected: bool, matched: bool) -> Self {
        match (expected, matched) {
            (false, _) => Grade::Ignored,
            (true, true) => Grade::Passed,
            (true, false) => Grade::Failed,
        }
    }

    /// `Ignored` counts as satisfied when bucketing.
    pub fn is_satisfied(&self) -> bool {
        !matches!(self, Grade::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::Passed => "PASSED",
            Grade::Failed => "FAILED",
            Grade::Ignored => "IGNORED",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Success,
    Partial,
    Failed,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Success => "success",
            Bucket::Partial => "partial",
            Bucket::Failed => "failed",
        }
    }
}

/// Captured result of one shell command. `exit_code` is `None` when the
/// process was terminated by a signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// The evidence triple captured around one test execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evidence {
    pub process: ProcessResult,
    pub monitor: String,
    pub kernel: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeSet {
    pub output: Grade,
    pub constable: Grade,
    pub dmesg: Grade,
}

impl GradeSet {
    /// Grades each channel independently. When the monitor was not running
    /// for the test, its channel is ignored regardless of the expectation.
    pub fn grade(expect: &Expectations, evidence: &Evidence, monitor_used: bool) -> Self {
        let output = Grade::from_match(
            expect.return_code.is_some(),
            expect.return_code.is_some() && expect.return_code == evidence.process.exit_code,
        );
        let constable = match expect.constable.as_deref() {
            Some(needle) if monitor_used => {
                Grade::from_match(true, evidence.monitor.contains(needle))
            }
            _ => Grade::Ignored,
        };
        let dmesg = match expect.dmesg.as_deref() {
            Some(needle) => Grade::from_match(true, evidence.kernel.contains(needle)),
            None => Grade::Ignored,
        };
        Self {
            output,
            constable,
            dmesg,
        }
    }

    pub fn all(&self) -> [Grade; 3] {
        [self.output, self.constable, self.dmesg]
    }

    pub fn bucket(&self) -> Bucket {
        match self.all().iter().filter(|g| g.is_satisfied()).count() {
            3 => Bucket::Success,
            0 => Bucket::Failed,
            _ => Bucket::Partial,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCounts {
    pub success: usize,
    pub failed: usize,
    pub partial: usize,
}

impl BucketCounts {
    pub fn record(&mut self, bucket: Bucket) {
        match bucket {
            Bucket::Success => self.success += 1,
            Bucket::Partial => self.partial += 1,
            Bucket::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.success + self.failed + self.partial
    }
}
