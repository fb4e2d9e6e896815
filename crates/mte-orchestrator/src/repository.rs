//! Local test definitions, the external corpus checkout, and the staging
//! tree handed to the channel.

use crate::channel::TRANSFER_DENYLIST;
use crate::config::Deployment;
use crate::logging::LogContext;
use anyhow::{anyhow, bail, Context, Result};
use mte_core::layout::{
    ENV_PLACEHOLDER, MANIFEST_FILE, MONITOR_BASE_TEMPLATE, MONITOR_PROCESS_CONFIG, RESULTS_FILE,
    RUNNER_BINARY,
};
use mte_core::{ensure_dir, StagingManifest, TestDescriptor};
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Templated documents shipped alongside the definitions.
const TEMPLATES: [&str; 2] = [MONITOR_PROCESS_CONFIG, MONITOR_BASE_TEMPLATE];

/// Keeps the external corpus checkout current.
pub trait CorpusSource {
    fn update(&self, checkout: &Path) -> Result<()>;
    fn fetch(&self, checkout: &Path) -> Result<()>;
}

/// Corpus hosted in a git repository, driven through the `git` CLI.
pub struct GitCorpus {
    url: String,
}

impl GitCorpus {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

fn git(args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .output()
        .context("failed to run git")?;
    if output.status.success() {
        return Ok(());
    }
    Err(anyhow!(
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr).trim()
    ))
}

impl CorpusSource for GitCorpus {
    fn update(&self, checkout: &Path) -> Result<()> {
        let dir = checkout.display().to_string();
        git(&["-C", &dir, "pull", "--ff-only"])
    }

    fn fetch(&self, checkout: &Path) -> Result<()> {
        let dir = checkout.display().to_string();
        git(&["clone", "--depth", "1", &self.url, &dir])
    }
}

pub struct TestRepository {
    tests_dir: PathBuf,
    corpus_dir: PathBuf,
    staging_dir: PathBuf,
    results_dir: PathBuf,
    runner_binary: PathBuf,
    log: LogContext,
}

impl TestRepository {
    pub fn new(deployment: &Deployment, log: LogContext) -> Self {
        Self {
            tests_dir: deployment.tests_dir.clone(),
            corpus_dir: deployment.corpus_dir.clone(),
            staging_dir: deployment.staging_dir.clone(),
            results_dir: deployment.results_dir.clone(),
            runner_binary: deployment.runner_binary.clone(),
            log,
        }
    }

    /// Pulls an existing checkout or clones a missing one. Failures are
    /// reported and otherwise ignored; the run decides later whether it
    /// needs the corpus at all.
    pub fn refresh_corpus(&self, source: &dyn CorpusSource) {
        let outcome = if self.corpus_dir.join(".git").exists() {
            self.log.debug("Updating external test corpus...");
            source.update(&self.corpus_dir)
        } else {
            self.log.info("Fetching external test corpus...");
            if let Some(parent) = self.corpus_dir.parent() {
                if let Err(err) = ensure_dir(parent) {
                    self.log
                        .warn(format!("Could not prepare corpus directory: {:#}", err));
                    return;
                }
            }
            source.fetch(&self.corpus_dir)
        };
        if let Err(err) = outcome {
            self.log
                .warn(format!("External test corpus not refreshed: {:#}", err));
        }
    }

    /// Every definition under the tests directory, tagged with its suite and
    /// source path and selected. The corpus checkout is not descended into.
    pub fn list_tests(&self) -> Result<Vec<TestDescriptor>> {
        let corpus = self.corpus_dir.clone();
        let walker = walkdir::WalkDir::new(&self.tests_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| {
                if e.path() == corpus {
                    return false;
                }
                !(e.depth() > 0
                    && e.file_type().is_dir()
                    && TRANSFER_DENYLIST
                        .iter()
                        .any(|denied| e.file_name() == *denied))
            });

        let mut tests = Vec::new();
        for entry in walker {
            let entry = entry.with_context(|| {
                format!("tests_dir_unreadable: {}", self.tests_dir.display())
            })?;
            if !entry.file_type().is_file() || !is_definition(entry.path()) {
                continue;
            }
            tests.extend(self.load_definition(entry.path())?);
        }
        self.log.debug(format!("Found {} tests", tests.len()));
        Ok(tests)
    }

    fn load_definition(&self, path: &Path) -> Result<Vec<TestDescriptor>> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("definition_unreadable: {}", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        let parsed: Option<Vec<TestDescriptor>> = serde_yaml::from_str(&raw)
            .with_context(|| format!("definition_parse_failed: {}", path.display()))?;
        let suite = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let src = path
            .strip_prefix(&self.tests_dir)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        let mut seen = BTreeSet::new();
        let mut tests = Vec::new();
        for test in parsed.unwrap_or_default() {
            let test = test.tagged(&suite, &src);
            test.validate()?;
            if !seen.insert(test.name.clone()) {
                bail!("duplicate_test: {} defined twice in {}", test.name, src);
            }
            tests.push(test);
        }
        Ok(tests)
    }

    /// Rebuilds the staging tree for one run: the rendered templates, the
    /// runner binary, and the manifest of `selected`.
    pub fn prepare_tests<I>(&self, selected: I, remote_root: &str) -> Result<StagingManifest>
    where
        I: IntoIterator<Item = TestDescriptor>,
    {
        match fs::remove_dir_all(&self.staging_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("staging_reset_failed: {}", self.staging_dir.display())
                })
            }
        }
        ensure_dir(&self.staging_dir)?;

        for name in TEMPLATES {
            let source = self.tests_dir.join(name);
            let template = fs::read_to_string(&source)
                .with_context(|| format!("template_missing: {}", source.display()))?;
            fs::write(
                self.staging_dir.join(name),
                template.replace(ENV_PLACEHOLDER, remote_root),
            )
            .with_context(|| format!("template_render_failed: {}", name))?;
        }

        if !self.runner_binary.is_file() {
            bail!("runner_binary_missing: {}", self.runner_binary.display());
        }
        fs::copy(&self.runner_binary, self.staging_dir.join(RUNNER_BINARY)).with_context(|| {
            format!("runner_copy_failed: {}", self.runner_binary.display())
        })?;

        let manifest = StagingManifest::from_selected(selected);
        manifest.write(&self.staging_dir.join(MANIFEST_FILE))?;
        self.log.debug(format!(
            "Staged {} tests in {}",
            manifest.tests().len(),
            self.staging_dir.display()
        ));
        Ok(manifest)
    }

    /// Aggregate results text from the last download, if any.
    pub fn load_results(&self) -> Result<Option<String>> {
        let path = self.results_dir.join(RESULTS_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("results_unreadable: {}", path.display())),
        }
    }
}

fn is_definition(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}
