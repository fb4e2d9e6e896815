use crate::target::TargetError;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineState {
    Running,
    Paused,
    PoweredOff,
    Saved,
    Aborted,
    Other(String),
}

impl MachineState {
    fn parse(raw: &str) -> Self {
        match raw {
            "running" => MachineState::Running,
            "paused" => MachineState::Paused,
            "poweroff" => MachineState::PoweredOff,
            "saved" => MachineState::Saved,
            "aborted" => MachineState::Aborted,
            other => MachineState::Other(other.to_string()),
        }
    }

    /// Whether the hypervisor counts the machine among its running VMs.
    pub fn is_running(&self) -> bool {
        matches!(self, MachineState::Running | MachineState::Paused)
    }
}

/// Control surface of the virtualization product hosting the target.
pub trait Hypervisor: Send + Sync {
    /// Fails with [`TargetError::VmNotFound`] for unknown machines.
    fn ensure_registered(&self, name: &str) -> Result<(), TargetError>;

    fn state(&self, name: &str) -> Result<MachineState, TargetError>;

    fn launch(&self, name: &str) -> Result<(), TargetError>;
}

/// VirtualBox through its `VBoxManage` command line.
pub struct VBoxManage {
    program: String,
    frontend: String,
}

impl VBoxManage {
    pub fn new(frontend: &str) -> Self {
        Self {
            program: "VBoxManage".to_string(),
            frontend: frontend.to_string(),
        }
    }

    fn vm_info(&self, name: &str) -> Result<String, TargetError> {
        let output = Command::new(&self.program)
            .args(["showvminfo", name, "--machinereadable"])
            .output()
            .map_err(|e| {
                TargetError::Hypervisor(format!("failed to run {}: {}", self.program, e))
            })?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Could not find a registered machine") {
            return Err(TargetError::VmNotFound(name.to_string()));
        }
        Err(TargetError::Hypervisor(stderr.trim().to_string()))
    }
}

impl Hypervisor for VBoxManage {
    fn ensure_registered(&self, name: &str) -> Result<(), TargetError> {
        self.vm_info(name).map(|_| ())
    }

    fn state(&self, name: &str) -> Result<MachineState, TargetError> {
        let info = self.vm_info(name)?;
        parse_vm_state(&info)
            .ok_or_else(|| TargetError::Hypervisor(format!("no VMState reported for {}", name)))
    }

    fn launch(&self, name: &str) -> Result<(), TargetError> {
        let output = Command::new(&self.program)
            .args(["startvm", name, "--type", &self.frontend])
            .output()
            .map_err(|e| {
                TargetError::Hypervisor(format!("failed to run {}: {}", self.program, e))
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TargetError::Hypervisor(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

fn parse_vm_state(info: &str) -> Option<MachineState> {
    info.lines()
        .find_map(|line| line.strip_prefix("VMState="))
        .map(|raw| MachineState::parse(raw.trim().trim_matches('"')))
}
