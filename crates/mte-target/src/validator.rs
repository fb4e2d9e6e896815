use crate::env::TargetEnv;
use anyhow::{Context, Result};
use mte_core::report::{details, failure_details, failure_line, results_line, summary_line};
use mte_core::{atomic_write_bytes, ensure_dir, Bucket, BucketCounts, Evidence, GradeSet};
use mte_core::TestDescriptor;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

/// Grades evidence and persists the aggregate and per-test reports.
pub struct Validator {
    results_file: PathBuf,
    details_dir: PathBuf,
    counts: BucketCounts,
}

impl Validator {
    pub fn new(env: &TargetEnv) -> Result<Self> {
        let details_dir = env.details_dir();
        ensure_dir(&details_dir)?;
        Ok(Self {
            results_file: env.results_file(),
            details_dir,
            counts: BucketCounts::default(),
        })
    }

    pub fn counts(&self) -> BucketCounts {
        self.counts
    }

    pub fn validate(&mut self, test: &TestDescriptor, evidence: &Evidence) -> Result<GradeSet> {
        let grades = GradeSet::grade(test.expectations(), evidence, test.use_constable);
        let bucket = grades.bucket();
        self.counts.record(bucket);
        info!(
            test = %test.name,
            output = %grades.output,
            constable = %grades.constable,
            dmesg = %grades.dmesg,
            bucket = bucket.as_str(),
            "graded"
        );
        self.append_results(&results_line(&test.name, &grades))?;
        self.write_details(&test.name, &details(&test.name, evidence))?;
        Ok(grades)
    }

    /// Records a hard failure: the test never produced gradeable evidence.
    pub fn failed(&mut self, test: &TestDescriptor, error: &anyhow::Error) -> Result<()> {
        self.counts.record(Bucket::Failed);
        info!(test = %test.name, error = %error, "recorded hard failure");
        self.append_results(&failure_line(&test.name))?;
        self.write_details(&test.name, &failure_details(&test.name, &format!("{:#}", error)))
    }

    pub fn dump_results(&self) -> Result<()> {
        let existing = match fs::read_to_string(&self.results_file) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let content = format!("{}{}", summary_line(&self.counts), existing);
        atomic_write_bytes(&self.results_file, content.as_bytes())
    }

    fn append_results(&self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.results_file)
            .with_context(|| format!("results_write_failed: {}", self.results_file.display()))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn write_details(&self, name: &str, body: &str) -> Result<()> {
        atomic_write_bytes(&self.details_dir.join(detail_file_name(name)), body.as_bytes())
    }
}

/// Test names become file names; path separators would escape `details/`.
pub fn detail_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect()
}
