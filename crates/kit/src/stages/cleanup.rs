//! The `cleanup` stage: stop the job's guest.
//!
//! See <https://docs.gitlab.com/runner/executors/custom.html#cleanup>.

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::{eyre::Context as _, Result};
use tracing::{debug, info};

use super::options::StageOpts;
use crate::command_run::ToolRunner;
use crate::vmrun::{VirtualMachine, Vmrun};

/// Stop the cloned guest. The clone itself is kept for the next job.
#[derive(Parser, Debug)]
pub(crate) struct CleanupOpts {
    #[clap(flatten)]
    pub stage: StageOpts,

    /// Fully qualified path to the base VMware Fusion guest
    pub base_vm_path: Utf8PathBuf,
}

pub(crate) fn run(opts: CleanupOpts) -> Result<()> {
    let vmrun = opts.stage.vmrun();
    run_with(&vmrun, &opts)
}

fn run_with<R: ToolRunner>(vmrun: &Vmrun<R>, opts: &CleanupOpts) -> Result<()> {
    info!("Cleanup stage is starting");
    let images_dir = opts.stage.images_dir()?;
    let base = VirtualMachine::new(&opts.base_vm_path);
    let clone = opts.stage.ci.clone_of(&images_dir, &base);
    debug!("The cloned guest is {}", clone.path());

    vmrun
        .stop(&clone)
        .with_context(|| format!("Could not stop guest \"{clone}\""))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_run::scripted::{Fixture, ScriptedRunner};

    fn opts() -> CleanupOpts {
        CleanupOpts::try_parse_from([
            "cleanup",
            "--vm-images-path",
            "/images",
            "--server-host",
            "ci.example.org",
            "--runner-id",
            "4",
            "--concurrent-project-id",
            "1",
            "/vms/macos.vmwarevm/macos.vmx",
        ])
        .unwrap()
    }

    #[test]
    fn test_stops_the_clone() {
        let vmrun = Vmrun::with_runner("/a/vmrun", ScriptedRunner::new(|_| Fixture::ok("")));
        run_with(&vmrun, &opts()).unwrap();
        let name = "macos-ci.example.org-runner-4-concurrent-1";
        assert_eq!(
            vmrun.runner().calls(),
            vec![vec![
                "-T".to_owned(),
                "fusion".to_owned(),
                "stop".to_owned(),
                format!("/images/{name}.vmwarevm/{name}.vmx"),
                "hard".to_owned(),
            ]]
        );
    }

    #[test]
    fn test_stop_failure_is_reported() {
        let vmrun = Vmrun::with_runner(
            "/a/vmrun",
            ScriptedRunner::new(|_| Fixture::failed(255, "Error: The virtual machine is not powered on")),
        );
        let err = run_with(&vmrun, &opts()).unwrap_err();
        assert!(err.to_string().starts_with("Could not stop guest"));
        assert!(format!("{err:#}").contains("not powered on"));
        assert!(!crate::exit_code::is_build_failure(&err));
    }
}
