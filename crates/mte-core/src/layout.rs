//! Names of everything the stager and the runner place in the remote
//! working directory. The cleaner removes exactly this set.

pub const MANIFEST_FILE: &str = "tests.json";
pub const MONITOR_PROCESS_CONFIG: &str = "constable.conf";
pub const MONITOR_BASE_TEMPLATE: &str = "medusa-template.conf";
pub const MONITOR_BASE_CONFIG: &str = "medusa.conf";
pub const RUNNER_BINARY: &str = "mte-target";
pub const EXIT_MARKER: &str = "exit";
pub const REMOTE_LOG: &str = "log";
pub const RESULTS_DIR: &str = "results";
pub const RESULTS_FILE: &str = "results";
pub const DETAILS_DIR: &str = "details";
pub const CORPUS_DIR: &str = "medusa-tests";

pub const EXIT_SUCCESS: &str = "SUCCESS";
pub const EXIT_ERROR: &str = "ERROR";

/// Token in the templated configs replaced by the remote working directory.
pub const ENV_PLACEHOLDER: &str = "{@TEST_ENV}";

/// Scratch directories test commands refer to by relative name.
pub const SCRATCH_DIRS: [&str; 3] = ["allowed", "restricted", "helper"];

pub const STAGED_FILES: [&str; 7] = [
    MANIFEST_FILE,
    MONITOR_PROCESS_CONFIG,
    MONITOR_BASE_TEMPLATE,
    MONITOR_BASE_CONFIG,
    RUNNER_BINARY,
    EXIT_MARKER,
    REMOTE_LOG,
];

pub fn is_success_marker(content: &str) -> bool {
    content.trim_end_matches(['\r', '\n']) == EXIT_SUCCESS
}

/// Remote paths are always POSIX, independent of the host platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    root: String,
}

impl RemoteLayout {
    pub fn new(root: &str) -> Self {
        let trimmed = root.trim_end_matches('/');
        Self {
            root: if trimmed.is_empty() {
                "/".to_string()
            } else {
                trimmed.to_string()
            },
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn path(&self, name: &str) -> String {
        join_remote(&self.root, name)
    }

    pub fn results_dir(&self) -> String {
        self.path(RESULTS_DIR)
    }

    pub fn results_file(&self) -> String {
        join_remote(&self.results_dir(), RESULTS_FILE)
    }

    pub fn details_dir(&self) -> String {
        join_remote(&self.results_dir(), DETAILS_DIR)
    }

    pub fn exit_marker(&self) -> String {
        self.path(EXIT_MARKER)
    }

    pub fn log(&self) -> String {
        self.path(REMOTE_LOG)
    }

    pub fn corpus(&self) -> String {
        self.path(CORPUS_DIR)
    }

    pub fn runner(&self) -> String {
        self.path(RUNNER_BINARY)
    }
}

pub fn join_remote(base: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_posix_joined() {
        let layout = RemoteLayout::new("/home/tester/env/");
        assert_eq!(layout.root(), "/home/tester/env");
        assert_eq!(layout.results_file(), "/home/tester/env/results/results");
        assert_eq!(layout.details_dir(), "/home/tester/env/results/details");
        assert_eq!(layout.corpus(), "/home/tester/env/medusa-tests");
    }

    #[test]
    fn success_marker_tolerates_trailing_newline_only() {
        assert!(is_success_marker("SUCCESS"));
        assert!(is_success_marker("SUCCESS\n"));
        assert!(!is_success_marker("ERROR"));
        assert!(!is_success_marker(" SUCCESS"));
        assert!(!is_success_marker(""));
    }
}
