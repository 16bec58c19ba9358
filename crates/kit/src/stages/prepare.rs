//! The `prepare` stage: provision a clean guest for the job.
//!
//! See <https://docs.gitlab.com/runner/executors/custom.html#prepare>.

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use color_eyre::eyre::{eyre, Context as _};
use color_eyre::{Report, Result};
use rustix::fs::Access;
use tracing::{debug, info, warn};

use super::options::{SshOpts, StageOpts};
use crate::command_run::ToolRunner;
use crate::provision::Provisioner;
use crate::readiness::{create_progress_spinner, wait_for_readiness};
use crate::ssh::{self, Credentials, SshError};
use crate::vmrun::{VirtualMachine, Vmrun};

/// Command run to prove the guest accepts shell sessions.
const NOOP_COMMAND: &str = "echo -n 2>&1";

/// Provision a linked clone of the base guest and wait until it is reachable.
///
/// Snapshots and the clone are only created when missing; the clone is
/// reverted to its own snapshot on every run so each job starts clean.
#[derive(Parser)]
pub(crate) struct PrepareOpts {
    #[clap(flatten)]
    pub stage: StageOpts,

    /// Fully qualified path to the base VMware Fusion guest
    pub base_vm_path: Utf8PathBuf,

    /// Start the guest with its console window
    #[clap(long)]
    pub gui: bool,

    #[clap(flatten)]
    pub ssh: SshOpts,
}

pub(crate) fn run(opts: PrepareOpts) -> Result<()> {
    let vmrun = opts.stage.vmrun();
    run_with(&vmrun, &opts)
}

fn run_with<R: ToolRunner>(vmrun: &Vmrun<R>, opts: &PrepareOpts) -> Result<()> {
    info!("Prepare stage is starting");
    let images_dir = opts.stage.images_dir()?;
    validate_images_dir(&images_dir)?;
    let credentials = opts.ssh.credentials()?;

    let base = VirtualMachine::new(&opts.base_vm_path);
    debug!("The base guest is {}", base.path());
    let guest = Provisioner::new(vmrun, &opts.stage.ci, &images_dir).provision(&base, !opts.gui)?;

    let progress = create_progress_spinner();
    let message = format!("Waiting for SSH on {}:{}", guest.ip, opts.ssh.ssh_port);
    let result = wait_for_readiness(&progress, &message, opts.ssh.readiness_policy(), |_| {
        probe_guest(&guest.ip, &opts.ssh, &credentials)
    });
    progress.finish_and_clear();
    let attempts = result.with_context(|| {
        format!("Guest \"{}\" never accepted a shell session", guest.clone)
    })?;

    info!("Guest {} is ready after {attempts} attempt(s)", guest.clone);
    Ok(())
}

/// The images directory must exist and be writable before anything is
/// cloned into it.
fn validate_images_dir(dir: &Utf8Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(eyre!("{dir} does not exist or is not a directory"));
    }
    rustix::fs::access(dir.as_std_path(), Access::WRITE_OK)
        .with_context(|| format!("{dir} is not writable"))?;
    Ok(())
}

/// One readiness attempt on a brand-new session.
fn probe_guest(ip: &str, opts: &SshOpts, credentials: &Credentials) -> Result<bool> {
    match ssh::probe(ip, opts.ssh_port, &opts.ssh_username, credentials, NOOP_COMMAND) {
        Ok(0) => Ok(true),
        Ok(status) => {
            debug!("No-op command exited with {status}");
            Ok(false)
        }
        // Protocol level failures are worth a warning but still only mean
        // "not yet".
        Err(e @ (SshError::Channel { .. } | SshError::ProtocolRead { .. })) => {
            warn!("{:#}", Report::new(e));
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}
