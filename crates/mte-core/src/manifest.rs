use crate::atomic_write_bytes;
use crate::descriptor::TestDescriptor;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// The selected tests as staged onto the target: a JSON array of
/// descriptors, `selected` stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingManifest {
    tests: Vec<TestDescriptor>,
}

impl StagingManifest {
    pub fn from_selected<I>(tests: I) -> Self
    where
        I: IntoIterator<Item = TestDescriptor>,
    {
        let tests = tests
            .into_iter()
            .map(|mut t| {
                t.selected = false;
                t
            })
            .collect();
        Self { tests }
    }

    pub fn tests(&self) -> &[TestDescriptor] {
        &self.tests
    }

    pub fn into_tests(self) -> Vec<TestDescriptor> {
        self.tests
    }

    pub fn requires_corpus(&self) -> bool {
        self.tests.iter().any(|t| t.requires_corpus())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.tests)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let tests: Vec<TestDescriptor> =
            serde_json::from_slice(bytes).context("manifest_parse_failed")?;
        Ok(Self { tests })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        atomic_write_bytes(path, &self.to_bytes()?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("manifest_missing: {}", path.display()))?;
        Self::from_slice(&bytes)
    }
}
