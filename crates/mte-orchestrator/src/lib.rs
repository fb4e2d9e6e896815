//! Host side of the conformance test environment: target lifecycle, the
//! remote command and transfer channel, test discovery and staging, and the
//! background connect/execute coordinator.

pub mod channel;
pub mod config;
pub mod hypervisor;
pub mod logging;
pub mod orchestrator;
pub mod repository;
pub mod target;
pub mod task;

pub use channel::{
    ChannelError, LocalPaths, OpenSshTransport, SshTarget, TransferChannel, Transport,
};
pub use config::{Config, Deployment};
pub use hypervisor::{Hypervisor, MachineState, VBoxManage};
pub use logging::{init_file_log, LogContext, OutputSink};
pub use orchestrator::{
    Orchestrator, OrchestratorError, RunReport, RunSettings, RunState, WatchdogPolicy,
};
pub use repository::{CorpusSource, GitCorpus, TestRepository};
pub use target::{ReadinessPolicy, TargetError, TargetManager, VirtualMachine};
pub use task::TaskHandle;

#[cfg(test)]
pub(crate) mod testing;
