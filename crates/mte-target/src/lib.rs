//! Runs staged conformance tests on the target machine, drives the policy
//! monitor around each execution and grades the captured evidence.

pub mod env;
pub mod monitor;
pub mod runner;
pub mod shell;
pub mod validator;

pub use env::TargetEnv;
pub use monitor::{ConstableMonitor, PolicyMonitor};
pub use runner::{Runner, RunnerTimings};
pub use shell::{Shell, SystemShell};
pub use validator::Validator;

#[cfg(test)]
pub(crate) mod testing;
