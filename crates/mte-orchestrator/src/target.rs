//! Brings the target machine to a state where it accepts remote sessions.

use crate::channel::TransferChannel;
use crate::hypervisor::Hypervisor;
use crate::logging::LogContext;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

const PROBE_COMMAND: &str = "true";

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("virtual machine {0} does not exist on host system")]
    VmNotFound(String),
    #[error("hypervisor error: {0}")]
    Hypervisor(String),
    #[error("target did not accept a session after {attempts} attempts")]
    NotReady { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    /// Extra wait after a freshly booted machine first answers, so boot-time
    /// services finish starting.
    pub boot_settle: Duration,
    pub probe_timeout: Duration,
}

pub struct VirtualMachine {
    pub name: String,
    pub hypervisor: Arc<dyn Hypervisor>,
}

pub struct TargetManager {
    vm: Option<VirtualMachine>,
    policy: ReadinessPolicy,
    log: LogContext,
}

impl TargetManager {
    /// Fails fast when the configured machine is unknown to the hypervisor.
    pub fn new(
        vm: Option<VirtualMachine>,
        policy: ReadinessPolicy,
        log: LogContext,
    ) -> Result<Self, TargetError> {
        if let Some(vm) = &vm {
            vm.hypervisor.ensure_registered(&vm.name)?;
        }
        Ok(Self { vm, policy, log })
    }

    /// Leaves `channel` holding a verified session on success.
    pub fn connect(&self, channel: &mut TransferChannel) -> Result<(), TargetError> {
        let Some(vm) = &self.vm else {
            return self.wait_ready(channel);
        };
        vm.hypervisor.ensure_registered(&vm.name)?;
        if vm.hypervisor.state(&vm.name)?.is_running() {
            self.log.debug(format!("Virtual machine {} is running", vm.name));
            return self.wait_ready(channel);
        }

        self.log.info(format!("Starting virtual machine {}...", vm.name));
        vm.hypervisor.launch(&vm.name)?;
        self.wait_booted(channel);
        if !self.policy.boot_settle.is_zero() {
            self.log.debug(format!(
                "Waiting {:?} for boot to settle",
                self.policy.boot_settle
            ));
            thread::sleep(self.policy.boot_settle);
        }
        if self.probe(channel) {
            Ok(())
        } else {
            self.wait_ready(channel)
        }
    }

    fn wait_ready(&self, channel: &mut TransferChannel) -> Result<(), TargetError> {
        for attempt in 1..=self.policy.attempts {
            self.log.debug(format!(
                "Connecting to target (attempt {}/{})",
                attempt, self.policy.attempts
            ));
            if self.probe(channel) {
                return Ok(());
            }
            if attempt < self.policy.attempts {
                thread::sleep(self.policy.backoff);
            }
        }
        Err(TargetError::NotReady {
            attempts: self.policy.attempts,
        })
    }

    /// A booting machine is given as long as it needs.
    fn wait_booted(&self, channel: &mut TransferChannel) {
        while !self.probe(channel) {
            thread::sleep(self.policy.backoff);
        }
    }

    /// Opens a fresh session and runs a trivial command on it. Any failure
    /// means "not ready yet" and leaves the channel disconnected.
    fn probe(&self, channel: &mut TransferChannel) -> bool {
        channel.disconnect();
        let outcome = channel
            .connect()
            .and_then(|_| channel.exec(PROBE_COMMAND, Some(self.policy.probe_timeout)));
        match outcome {
            Ok(_) => true,
            Err(err) => {
                self.log.debug(format!("Target not ready: {}", err));
                channel.disconnect();
                false
            }
        }
    }
}
