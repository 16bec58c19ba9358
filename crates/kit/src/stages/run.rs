//! The `run` stage: execute one of the runner's scripts inside the guest.
//!
//! See <https://docs.gitlab.com/runner/executors/custom.html#run>.

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::eyre::{eyre, Context as _};
use color_eyre::Result;
use tracing::{debug, error, info};

use super::options::{SshOpts, StageOpts};
use crate::command_run::ToolRunner;
use crate::exit_code::BuildFailure;
use crate::ssh::RemoteSession;
use crate::vmrun::{VirtualMachine, Vmrun};

/// Execute a script created by GitLab Runner in the prepared guest.
///
/// Safe to call any number of times once `prepare` has succeeded.
#[derive(Parser)]
pub(crate) struct RunOpts {
    #[clap(flatten)]
    pub stage: StageOpts,

    #[clap(flatten)]
    pub ssh: SshOpts,

    /// Fully qualified path to the base VMware Fusion guest
    pub base_vm_path: Utf8PathBuf,

    /// Script created by GitLab Runner for the executor to run
    pub script_file: Utf8PathBuf,

    /// Name of the sub-stage, e.g. `build_script`
    pub sub_stage: String,
}

pub(crate) fn run(opts: RunOpts) -> Result<()> {
    let vmrun = opts.stage.vmrun();
    run_with(&vmrun, &opts)
}

fn run_with<R: ToolRunner>(vmrun: &Vmrun<R>, opts: &RunOpts) -> Result<()> {
    info!("Run stage {} is starting", opts.sub_stage);
    let images_dir = opts.stage.images_dir()?;
    let base = VirtualMachine::new(&opts.base_vm_path);
    let clone = opts.stage.ci.clone_of(&images_dir, &base);
    debug!("The cloned guest is {}", clone.path());

    let ip = vmrun
        .guest_ip_address(&clone)
        .ok_or_else(|| eyre!("Guest \"{clone}\" never resolved an IP address"))?;
    let script = std::fs::read_to_string(&opts.script_file)
        .with_context(|| format!("Reading {}", opts.script_file))?;
    debug!("Running script:\n{script}");

    let credentials = opts.ssh.credentials()?;
    let session = RemoteSession::connect(&ip, opts.ssh.ssh_port, &opts.ssh.ssh_username)?;
    session.authenticate(&credentials)?;
    let mut channel = session.open_channel()?;
    let status = channel.execute(
        &script,
        &mut std::io::stdout().lock(),
        &mut std::io::stderr().lock(),
    )?;

    script_outcome(&opts.sub_stage, status)
}

/// Map the remote exit status to the stage result.
fn script_outcome(sub_stage: &str, status: i32) -> Result<()> {
    if status == 0 {
        info!("Run stage {sub_stage} returned {status}");
        return Ok(());
    }
    error!("Run stage {sub_stage} returned {status}");
    Err(BuildFailure {
        sub_stage: sub_stage.to_owned(),
        status,
    }
    .into())
}
