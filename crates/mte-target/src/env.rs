use anyhow::{anyhow, Context, Result};
use mte_core::layout::{
    CORPUS_DIR, DETAILS_DIR, EXIT_MARKER, MANIFEST_FILE, MONITOR_BASE_CONFIG,
    MONITOR_BASE_TEMPLATE, MONITOR_PROCESS_CONFIG, RESULTS_DIR, RESULTS_FILE, SCRATCH_DIRS,
};
use mte_core::{atomic_write_bytes, ensure_dir, StagingManifest, TestDescriptor};
use std::fs;
use std::path::{Path, PathBuf};

/// The staged working directory on the target.
#[derive(Debug, Clone)]
pub struct TargetEnv {
    root: PathBuf,
}

impl TargetEnv {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join(RESULTS_DIR)
    }

    pub fn results_file(&self) -> PathBuf {
        self.results_dir().join(RESULTS_FILE)
    }

    pub fn details_dir(&self) -> PathBuf {
        self.results_dir().join(DETAILS_DIR)
    }

    pub fn corpus_dir(&self) -> PathBuf {
        self.root.join(CORPUS_DIR)
    }

    pub fn monitor_template(&self) -> PathBuf {
        self.root.join(MONITOR_BASE_TEMPLATE)
    }

    pub fn monitor_config(&self) -> PathBuf {
        self.root.join(MONITOR_BASE_CONFIG)
    }

    pub fn monitor_command(&self) -> Vec<String> {
        vec![
            "constable".to_string(),
            self.root.join(MONITOR_PROCESS_CONFIG).to_string_lossy().to_string(),
        ]
    }

    /// Clears results of a previous run and recreates the scratch tree.
    pub fn setup(&self) -> Result<()> {
        let marker = self.root.join(EXIT_MARKER);
        if marker.exists() {
            fs::remove_file(&marker)?;
        }
        let results = self.results_dir();
        if results.exists() {
            fs::remove_dir_all(&results)
                .with_context(|| format!("clear_failed: {}", results.display()))?;
        }
        for name in SCRATCH_DIRS {
            let dir = self.root.join(name);
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("clear_failed: {}", dir.display()))?;
            }
            ensure_dir(&dir)?;
        }
        ensure_dir(&self.details_dir())
    }

    pub fn validate(&self) -> Result<()> {
        for name in SCRATCH_DIRS {
            if !self.root.join(name).is_dir() {
                return Err(anyhow!("env_invalid: missing {} dir", name));
            }
        }
        for name in [MONITOR_BASE_TEMPLATE, MONITOR_PROCESS_CONFIG] {
            if !self.root.join(name).is_file() {
                return Err(anyhow!("env_invalid: missing configuration {}", name));
            }
        }
        Ok(())
    }

    pub fn load_tests(&self) -> Result<Vec<TestDescriptor>> {
        Ok(StagingManifest::load(&self.root.join(MANIFEST_FILE))?.into_tests())
    }

    pub fn record_exit(&self, marker: &str) -> Result<()> {
        atomic_write_bytes(&self.root.join(EXIT_MARKER), marker.as_bytes())
    }
}
