//! CI job context and the deterministic names derived from it.
//!
//! GitLab Runner hands the job's predefined variables to custom executors
//! prefixed with `CUSTOM_ENV_`. Every stage is a separate process, so the
//! clone that `prepare` creates is found again by `run` and `cleanup` purely
//! by recomputing its name from these values.

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;

use crate::vmrun::VirtualMachine;

/// Label of the snapshot taken on the base guest before anything else.
pub(crate) const ROOT_SNAPSHOT: &str = "io.github.fusion-executor";

/// Identity of the runner slot a job executes in.
#[derive(Debug, Clone, Default, Parser)]
pub(crate) struct CiContext {
    /// Host name of the GitLab instance
    #[clap(long, env = "CUSTOM_ENV_CI_SERVER_HOST", default_value = "", hide = true)]
    pub server_host: String,

    /// Unique ID of the runner being used
    #[clap(long, env = "CUSTOM_ENV_CI_RUNNER_ID", default_value_t = 0, hide = true)]
    pub runner_id: u64,

    /// Unique ID of the build execution within a single executor and project
    #[clap(
        long,
        env = "CUSTOM_ENV_CI_CONCURRENT_PROJECT_ID",
        default_value_t = 0,
        hide = true
    )]
    pub concurrent_project_id: u64,

    /// Namespace with project name
    #[clap(long, env = "CUSTOM_ENV_CI_PROJECT_PATH", default_value = "", hide = true)]
    pub project_path: String,
}

impl CiContext {
    /// Name of the per-slot snapshot taken on the base guest.
    pub(crate) fn slot_snapshot(&self) -> String {
        format!(
            "{}-runner-{}-concurrent-{}",
            self.server_host, self.runner_id, self.concurrent_project_id
        )
    }

    /// Name of the linked clone serving this slot.
    pub(crate) fn clone_name(&self, base: &VirtualMachine) -> String {
        format!("{}-{}", base.name(), self.slot_snapshot())
    }

    /// Descriptor path of the linked clone serving this slot.
    pub(crate) fn clone_path(&self, images_dir: &Utf8Path, base: &VirtualMachine) -> Utf8PathBuf {
        let name = self.clone_name(base);
        images_dir
            .join(format!("{name}.vmwarevm"))
            .join(format!("{name}.vmx"))
    }

    pub(crate) fn clone_of(&self, images_dir: &Utf8Path, base: &VirtualMachine) -> VirtualMachine {
        VirtualMachine::new(self.clone_path(images_dir, base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> CiContext {
        CiContext {
            server_host: "gitlab.example.com".into(),
            runner_id: 42,
            concurrent_project_id: 3,
            project_path: "group/project".into(),
        }
    }

    #[test]
    fn test_clone_identity() {
        let base = VirtualMachine::new("/vms/macos-11.vmwarevm/macos-11.vmx");
        let ci = context();
        assert_eq!(ci.slot_snapshot(), "gitlab.example.com-runner-42-concurrent-3");
        assert_eq!(
            ci.clone_name(&base),
            "macos-11-gitlab.example.com-runner-42-concurrent-3"
        );
        assert_eq!(
            ci.clone_path(Utf8Path::new("/images"), &base),
            "/images/macos-11-gitlab.example.com-runner-42-concurrent-3.vmwarevm/macos-11-gitlab.example.com-runner-42-concurrent-3.vmx"
        );
    }

    #[test]
    fn test_clone_identity_is_deterministic() {
        let base = VirtualMachine::new("/vms/base.vmx");
        let images = Utf8Path::new("/images");
        let first = context().clone_of(images, &base);
        let second = context().clone_of(images, &base);
        assert_eq!(first, second);
        assert_eq!(first.name(), second.name());

        let other_slot = CiContext {
            concurrent_project_id: 4,
            ..context()
        };
        assert_ne!(other_slot.clone_of(images, &base), first);
    }

    #[test]
    fn test_parse_flags() {
        let ci = CiContext::try_parse_from([
            "ci",
            "--server-host",
            "ci.example.org",
            "--runner-id",
            "7",
            "--concurrent-project-id",
            "1",
        ])
        .unwrap();
        assert_eq!(ci.slot_snapshot(), "ci.example.org-runner-7-concurrent-1");
        assert!(CiContext::try_parse_from(["ci", "--runner-id", "seven"]).is_err());
    }
}
