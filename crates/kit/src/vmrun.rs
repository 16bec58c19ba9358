//! Typed operations on VMware Fusion guests, built on `vmrun`.
//!
//! All operations are blocking one-shot invocations of the control tool.
//! Nothing here caches hypervisor state: snapshot existence is re-read from
//! `vmrun listSnapshots` every time it is asked for.

use std::net::IpAddr;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::command_run::{SubprocessRunner, ToolError, ToolOutcome, ToolRunner};

/// Host type passed to every `vmrun` invocation via `-T`.
const HOST_TYPE: &str = "fusion";

/// A guest identified by the path to its `.vmx` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VirtualMachine {
    path: Utf8PathBuf,
}

impl VirtualMachine {
    pub(crate) fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The descriptor's file name without its extension.
    pub(crate) fn name(&self) -> &str {
        self.path.file_stem().unwrap_or_default()
    }

    /// Whether the descriptor exists on disk.
    pub(crate) fn exists(&self) -> bool {
        self.path.exists()
    }
}

impl std::fmt::Display for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle on the `vmrun` control tool.
#[derive(Debug)]
pub(crate) struct Vmrun<R = SubprocessRunner> {
    executable: Utf8PathBuf,
    runner: R,
}

impl Vmrun<SubprocessRunner> {
    /// Use the `vmrun` shipped inside a VMware Fusion application bundle.
    pub(crate) fn from_application(vmware_fusion: &Utf8Path) -> Self {
        Self::with_runner(
            vmware_fusion.join("Contents").join("Public").join("vmrun"),
            SubprocessRunner,
        )
    }
}

impl<R: ToolRunner> Vmrun<R> {
    pub(crate) fn with_runner(executable: impl Into<Utf8PathBuf>, runner: R) -> Self {
        Self {
            executable: executable.into(),
            runner,
        }
    }

    #[cfg(test)]
    pub(crate) fn runner(&self) -> &R {
        &self.runner
    }

    fn vmrun(&self, args: &[&str]) -> ToolOutcome {
        let mut argv = vec!["-T", HOST_TYPE];
        argv.extend_from_slice(args);
        debug!("vmrun {}", argv.join(" "));
        let result = self.runner.invoke(&self.executable, &argv);
        let stdout = match &result {
            Ok(out) => Some(out),
            Err(ToolError::Execution { stdout, .. }) => Some(stdout),
            Err(_) => None,
        };
        if let Some(out) = stdout.filter(|o| !o.is_empty()) {
            debug!("stdout: {}", out.trim_end());
        }
        if let Some(err) = result.as_ref().err().and_then(ToolError::stderr) {
            debug!("stderr: {}", err.trim_end());
        }
        result
    }

    /// Snapshot names of `vm`, in tool order. Any failure yields no names.
    pub(crate) fn list_snapshots(&self, vm: &VirtualMachine) -> Vec<String> {
        match self.vmrun(&["listSnapshots", vm.path().as_str()]) {
            Ok(stdout) => parse_snapshot_list(&stdout),
            Err(e) => {
                debug!("Listing snapshots of {} failed: {e}", vm.path());
                Vec::new()
            }
        }
    }

    pub(crate) fn has_snapshot(&self, vm: &VirtualMachine, name: &str) -> bool {
        self.list_snapshots(vm).iter().any(|s| s == name)
    }

    pub(crate) fn snapshot(&self, vm: &VirtualMachine, name: &str) -> Result<(), ToolError> {
        self.vmrun(&["snapshot", vm.path().as_str(), name])
            .map(drop)
    }

    /// Create snapshot `name` on `vm` unless it is already listed. `role`
    /// describes the guest in the progress line, e.g. "base guest".
    ///
    /// Returns whether a snapshot was created.
    pub(crate) fn ensure_snapshot(
        &self,
        vm: &VirtualMachine,
        name: &str,
        role: &str,
    ) -> Result<bool, ToolError> {
        if self.has_snapshot(vm, name) {
            debug!("Snapshot \"{name}\" already present in {vm}");
            return Ok(false);
        }
        println!("{}", snapshot_progress(name, role, vm));
        self.snapshot(vm, name)?;
        Ok(true)
    }

    /// Make a linked clone of `source` at `destination`, backed by `snapshot`.
    pub(crate) fn clone_linked(
        &self,
        source: &VirtualMachine,
        destination: &Utf8Path,
        clone_name: &str,
        snapshot: &str,
    ) -> Result<VirtualMachine, ToolError> {
        let snapshot_arg = format!("-snapshot={snapshot}");
        let name_arg = format!("-cloneName={clone_name}");
        self.vmrun(&[
            "clone",
            source.path().as_str(),
            destination.as_str(),
            "linked",
            &snapshot_arg,
            &name_arg,
        ])?;
        Ok(VirtualMachine::new(destination))
    }

    pub(crate) fn revert(&self, vm: &VirtualMachine, snapshot: &str) -> Result<(), ToolError> {
        self.vmrun(&["revertToSnapshot", vm.path().as_str(), snapshot])
            .map(drop)
    }

    pub(crate) fn start(&self, vm: &VirtualMachine, headless: bool) -> Result<(), ToolError> {
        let mode = if headless { "nogui" } else { "gui" };
        self.vmrun(&["start", vm.path().as_str(), mode]).map(drop)
    }

    pub(crate) fn stop(&self, vm: &VirtualMachine) -> Result<(), ToolError> {
        self.vmrun(&["stop", vm.path().as_str(), "hard"]).map(drop)
    }

    /// IP address reported by the guest additions.
    ///
    /// `vmrun` itself blocks until the guest reports an address. Anything
    /// that does not parse as an IPv4 or IPv6 address means "no IP yet".
    pub(crate) fn guest_ip_address(&self, vm: &VirtualMachine) -> Option<String> {
        match self.vmrun(&["getGuestIPAddress", vm.path().as_str(), "-wait"]) {
            Ok(stdout) => {
                let ip = stdout.trim();
                validate_ip_address(ip).then(|| ip.to_owned())
            }
            Err(e) => {
                debug!("No IP address for {vm}: {e}");
                None
            }
        }
    }
}

/// Progress line announcing a new snapshot of `vm`.
pub(crate) fn snapshot_progress(name: &str, role: &str, vm: &VirtualMachine) -> String {
    format!("Creating snapshot \"{name}\" in {role} \"{vm}\"...")
}

/// Parse `vmrun listSnapshots` output: a header line followed by one
/// snapshot name per line.
pub(crate) fn parse_snapshot_list(stdout: &str) -> Vec<String> {
    stdout
        .split('\n')
        .filter(|line| !line.is_empty())
        .skip(1)
        .map(str::to_owned)
        .collect()
}

/// Whether `candidate` is a literal IPv4 or IPv6 address.
pub(crate) fn validate_ip_address(candidate: &str) -> bool {
    candidate.parse::<IpAddr>().is_ok()
}
