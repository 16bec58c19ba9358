//! Provisioning of the per-slot linked clone.
//!
//! Every step inspects hypervisor or filesystem state first and only does
//! the work that is missing, so `prepare` can be re-run for the same slot:
//!
//! 1. The base guest gets a root snapshot.
//! 2. The base guest gets a slot snapshot, taken from the root snapshot.
//! 3. A linked clone of the slot snapshot is created unless it exists.
//! 4. The clone is reverted to its own snapshot, or that snapshot is taken
//!    on first use.
//! 5. The clone is started and its IP address resolved.

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::{debug, info};

use crate::ci::{CiContext, ROOT_SNAPSHOT};
use crate::command_run::ToolRunner;
use crate::vmrun::{snapshot_progress, VirtualMachine, Vmrun};

/// How progress lines refer to the guest being cloned.
const BASE_ROLE: &str = "base guest";

/// A started clone with a resolved address.
#[derive(Debug)]
pub(crate) struct ProvisionedGuest {
    pub clone: VirtualMachine,
    pub ip: String,
}

/// Drives the provisioning steps for one CI slot.
pub(crate) struct Provisioner<'a, R> {
    vmrun: &'a Vmrun<R>,
    ci: &'a CiContext,
    images_dir: &'a Utf8Path,
}

impl<'a, R: ToolRunner> Provisioner<'a, R> {
    pub(crate) fn new(vmrun: &'a Vmrun<R>, ci: &'a CiContext, images_dir: &'a Utf8Path) -> Self {
        Self {
            vmrun,
            ci,
            images_dir,
        }
    }

    /// Bring the slot's clone to a clean, running state.
    pub(crate) fn provision(&self, base: &VirtualMachine, headless: bool) -> Result<ProvisionedGuest> {
        let slot_snapshot = self.ensure_base_snapshots(base)?;
        let clone = self.ensure_clone(base, &slot_snapshot)?;
        self.reset_clone(&clone)?;

        println!("Starting guest \"{clone}\"...");
        self.vmrun
            .start(&clone, headless)
            .with_context(|| format!("Failed to start {}", clone.path()))?;

        println!("Waiting for guest \"{clone}\" to become responsive...");
        let ip = self
            .vmrun
            .guest_ip_address(&clone)
            .ok_or_else(|| eyre!("Guest \"{clone}\" never reported an IP address"))?;
        info!("Guest {clone} is at {ip}");

        Ok(ProvisionedGuest { clone, ip })
    }

    /// Ensure the root and slot snapshots exist on the base guest and
    /// return the slot snapshot name.
    fn ensure_base_snapshots(&self, base: &VirtualMachine) -> Result<String> {
        self.vmrun
            .ensure_snapshot(base, ROOT_SNAPSHOT, BASE_ROLE)
            .with_context(|| format!("Failed to snapshot base guest {}", base.path()))?;

        let slot_snapshot = self.ci.slot_snapshot();
        if !self.vmrun.has_snapshot(base, &slot_snapshot) {
            println!("{}", snapshot_progress(&slot_snapshot, BASE_ROLE, base));
            // Take the slot snapshot from the known-clean root state.
            self.vmrun
                .revert(base, ROOT_SNAPSHOT)
                .with_context(|| format!("Failed to revert {} to {ROOT_SNAPSHOT}", base.path()))?;
            self.vmrun
                .snapshot(base, &slot_snapshot)
                .with_context(|| format!("Failed to snapshot base guest {}", base.path()))?;
        }
        Ok(slot_snapshot)
    }

    fn ensure_clone(&self, base: &VirtualMachine, slot_snapshot: &str) -> Result<VirtualMachine> {
        let clone = self.ci.clone_of(self.images_dir, base);
        if clone.exists() {
            debug!("Reusing existing clone {}", clone.path());
            return Ok(clone);
        }

        let clone_name = self.ci.clone_name(base);
        println!(
            "Cloning from snapshot \"{slot_snapshot}\" in base guest \"{base}\" to \"{clone_name}\"..."
        );
        self.vmrun
            .clone_linked(base, clone.path(), &clone_name, slot_snapshot)
            .with_context(|| format!("Failed to clone {} to {}", base.path(), clone.path()))
    }

    /// Reset the clone's disk to its per-slot baseline.
    fn reset_clone(&self, clone: &VirtualMachine) -> Result<()> {
        let snapshot = clone.name();
        if self.vmrun.has_snapshot(clone, snapshot) {
            println!("Restoring guest \"{clone}\" from snapshot \"{snapshot}\"...");
            self.vmrun
                .revert(clone, snapshot)
                .with_context(|| format!("Failed to revert {} to {snapshot}", clone.path()))?;
        } else {
            println!("{}", snapshot_progress(snapshot, "guest", clone));
            self.vmrun
                .snapshot(clone, snapshot)
                .with_context(|| format!("Failed to snapshot {}", clone.path()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::command_run::scripted::{Fixture, ScriptedRunner};

    type Snapshots = Rc<RefCell<HashMap<String, Vec<String>>>>;

    /// A fake hypervisor keeping snapshot lists in memory and creating clone
    /// descriptors on disk.
    fn fake_fusion(snapshots: Snapshots, ip: &'static str, failing: Option<&'static str>) -> ScriptedRunner {
        ScriptedRunner::new(move |args| {
            let verb = args[2].as_str();
            if failing == Some(verb) {
                return Fixture::failed(255, "Error: The operation was canceled");
            }
            let vm = args[3].clone();
            match verb {
                "listSnapshots" => {
                    let all = snapshots.borrow();
                    let listed = all.get(&vm).cloned().unwrap_or_default();
                    let mut out = format!("Total snapshots: {}\n", listed.len());
                    for name in listed {
                        out.push_str(&name);
                        out.push('\n');
                    }
                    Fixture::ok(&out)
                }
                "snapshot" => {
                    snapshots
                        .borrow_mut()
                        .entry(vm)
                        .or_default()
                        .push(args[4].clone());
                    Fixture::ok("")
                }
                "clone" => {
                    let dest = Utf8PathBuf::from(&args[4]);
                    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
                    std::fs::write(&dest, "config.version = \"8\"\n").unwrap();
                    Fixture::ok("")
                }
                "getGuestIPAddress" => Fixture::ok(ip),
                _ => Fixture::ok(""),
            }
        })
    }

    fn context() -> CiContext {
        CiContext {
            server_host: "gitlab.example.com".into(),
            runner_id: 1,
            concurrent_project_id: 0,
            project_path: "group/project".into(),
        }
    }

    /// Verb and target of each recorded call, plus the snapshot argument.
    fn verbs(runner: &ScriptedRunner) -> Vec<String> {
        runner
            .calls()
            .iter()
            .map(|c| {
                let target = Utf8Path::new(&c[3]).file_stem().unwrap_or_default().to_owned();
                match c.get(4) {
                    Some(arg) if c[2] != "clone" => format!("{} {} {}", c[2], target, arg),
                    _ => format!("{} {}", c[2], target),
                }
            })
            .collect()
    }

    #[test]
    fn test_first_run_creates_everything() {
        let dir = tempfile::tempdir().unwrap();
        let images = Utf8Path::from_path(dir.path()).unwrap();
        let snapshots = Snapshots::default();
        let vmrun = Vmrun::with_runner(
            "/a/vmrun",
            fake_fusion(Rc::clone(&snapshots), "192.168.64.7\n", None),
        );
        let ci = context();
        let base = VirtualMachine::new("/vms/base.vmwarevm/base.vmx");

        let guest = Provisioner::new(&vmrun, &ci, images)
            .provision(&base, true)
            .unwrap();

        let clone = "base-gitlab.example.com-runner-1-concurrent-0";
        assert_eq!(guest.ip, "192.168.64.7");
        assert_eq!(guest.clone.name(), clone);
        assert!(guest.clone.exists());
        assert_eq!(
            verbs(vmrun.runner()),
            vec![
                "listSnapshots base".to_owned(),
                format!("snapshot base {ROOT_SNAPSHOT}"),
                "listSnapshots base".to_owned(),
                format!("revertToSnapshot base {ROOT_SNAPSHOT}"),
                "snapshot base gitlab.example.com-runner-1-concurrent-0".to_owned(),
                "clone base".to_owned(),
                format!("listSnapshots {clone}"),
                format!("snapshot {clone} {clone}"),
                format!("start {clone} nogui"),
                format!("getGuestIPAddress {clone} -wait"),
            ]
        );
        let clone_call = &vmrun.runner().calls_to("clone")[0];
        assert_eq!(clone_call[4], guest.clone.path().as_str());
        assert_eq!(clone_call[6], "-snapshot=gitlab.example.com-runner-1-concurrent-0");
        assert_eq!(clone_call[7], format!("-cloneName={clone}"));
    }

    #[test]
    fn test_second_run_reuses_and_reverts() {
        let dir = tempfile::tempdir().unwrap();
        let images = Utf8Path::from_path(dir.path()).unwrap();
        let snapshots = Snapshots::default();
        let ci = context();
        let base = VirtualMachine::new("/vms/base.vmwarevm/base.vmx");

        let first = Vmrun::with_runner("/a/vmrun", fake_fusion(Rc::clone(&snapshots), "10.0.0.2", None));
        Provisioner::new(&first, &ci, images)
            .provision(&base, true)
            .unwrap();

        let second = Vmrun::with_runner("/a/vmrun", fake_fusion(Rc::clone(&snapshots), "10.0.0.2", None));
        Provisioner::new(&second, &ci, images)
            .provision(&base, false)
            .unwrap();

        let clone = "base-gitlab.example.com-runner-1-concurrent-0";
        assert_eq!(
            verbs(second.runner()),
            vec![
                "listSnapshots base".to_owned(),
                "listSnapshots base".to_owned(),
                format!("listSnapshots {clone}"),
                format!("revertToSnapshot {clone} {clone}"),
                format!("start {clone} gui"),
                format!("getGuestIPAddress {clone} -wait"),
            ]
        );
        assert!(second.runner().calls_to("snapshot").is_empty());
        assert!(second.runner().calls_to("clone").is_empty());
    }

    #[test]
    fn test_tool_failure_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let images = Utf8Path::from_path(dir.path()).unwrap();
        let vmrun = Vmrun::with_runner(
            "/a/vmrun",
            fake_fusion(Snapshots::default(), "10.0.0.2", Some("start")),
        );
        let ci = context();
        let err = Provisioner::new(&vmrun, &ci, images)
            .provision(&VirtualMachine::new("/vms/base.vmx"), true)
            .unwrap_err();
        assert!(format!("{err:#}").contains("The operation was canceled"), "{err:#}");
        assert!(vmrun.runner().calls_to("getGuestIPAddress").is_empty());
    }

    #[test]
    fn test_clone_failure_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let images = Utf8Path::from_path(dir.path()).unwrap();
        let vmrun = Vmrun::with_runner(
            "/a/vmrun",
            fake_fusion(Snapshots::default(), "10.0.0.2", Some("clone")),
        );
        let ci = context();
        let err = Provisioner::new(&vmrun, &ci, images)
            .provision(&VirtualMachine::new("/vms/base.vmx"), true)
            .unwrap_err();
        assert!(err.to_string().starts_with("Failed to clone"), "{err}");
        assert!(vmrun.runner().calls_to("start").is_empty());
    }

    #[test]
    fn test_missing_ip_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let images = Utf8Path::from_path(dir.path()).unwrap();
        let vmrun = Vmrun::with_runner("/a/vmrun", fake_fusion(Snapshots::default(), "\n", None));
        let ci = context();
        let err = Provisioner::new(&vmrun, &ci, images)
            .provision(&VirtualMachine::new("/vms/base.vmx"), true)
            .unwrap_err();
        assert!(err.to_string().contains("never reported an IP address"));
    }
}
