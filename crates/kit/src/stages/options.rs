//! Options shared between stages.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;

use crate::ci::CiContext;
use crate::readiness::{ReadinessPolicy, DEFAULT_ATTEMPTS, DEFAULT_RETRY_INTERVAL};
use crate::ssh::Credentials;
use crate::vmrun::Vmrun;

/// Default location of the VMware Fusion application bundle.
pub(crate) const DEFAULT_VMWARE_FUSION: &str = "/Applications/VMware Fusion.app";

/// Default directory, relative to the home directory, holding the clones.
const DEFAULT_IMAGES_DIR: &str = "Virtual Machines.localized";

/// Default identity, relative to the user data directory.
const DEFAULT_IDENTITY: &str = "fusion-executor/id_ed25519";

/// Options understood by every stage.
#[derive(Parser, Debug, Clone)]
pub(crate) struct StageOpts {
    /// Fully qualified path to the VMware Fusion application
    #[clap(long, default_value = DEFAULT_VMWARE_FUSION)]
    pub vmware_fusion: Utf8PathBuf,

    /// Directory the linked clones are stored in [default: ~/Virtual Machines.localized]
    #[clap(long)]
    pub vm_images_path: Option<Utf8PathBuf>,

    #[clap(flatten)]
    pub ci: CiContext,
}

impl StageOpts {
    pub(crate) fn vmrun(&self) -> Vmrun {
        Vmrun::from_application(&self.vmware_fusion)
    }

    /// The application's version descriptor.
    pub(crate) fn info_plist(&self) -> Utf8PathBuf {
        self.vmware_fusion.join("Contents").join("Info.plist")
    }

    pub(crate) fn images_dir(&self) -> Result<Utf8PathBuf> {
        match &self.vm_images_path {
            Some(path) => Ok(path.clone()),
            None => Ok(home_dir()?.join(DEFAULT_IMAGES_DIR)),
        }
    }
}

fn home_dir() -> Result<Utf8PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| eyre!("Could not determine the home directory"))?;
    utf8(home)
}

fn utf8(path: std::path::PathBuf) -> Result<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(path).map_err(|p| eyre!("Path is not valid UTF-8: {}", p.display()))
}

/// Secure shell options used to reach the guest.
#[derive(Parser, Clone)]
pub(crate) struct SshOpts {
    /// User to log into the guest as
    #[clap(long, default_value = "buildbot")]
    pub ssh_username: String,

    /// Private key to authenticate with [default: <data dir>/fusion-executor/id_ed25519]
    #[clap(long)]
    pub ssh_identity_file: Option<Utf8PathBuf>,

    /// Authenticate with this password instead of a private key
    #[clap(long, env = "FUSION_SSH_PASSWORD", hide_env_values = true)]
    pub ssh_password: Option<String>,

    /// Port of the guest's SSH server
    #[clap(long, default_value_t = 22)]
    pub ssh_port: u16,

    /// How many times to try reaching the guest's SSH server
    #[clap(long, default_value_t = DEFAULT_ATTEMPTS, value_parser = clap::value_parser!(u32).range(1..))]
    pub ssh_connect_attempts: u32,

    /// Seconds to wait between two attempts
    #[clap(long, default_value_t = DEFAULT_RETRY_INTERVAL.as_secs())]
    pub ssh_retry_interval: u64,
}

impl SshOpts {
    pub(crate) fn credentials(&self) -> Result<Credentials> {
        if let Some(password) = &self.ssh_password {
            return Ok(Credentials::Password(password.clone()));
        }
        let identity = match &self.ssh_identity_file {
            Some(path) => path.clone(),
            None => default_identity()?,
        };
        Ok(Credentials::Identity(identity))
    }

    pub(crate) fn readiness_policy(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            attempts: self.ssh_connect_attempts,
            interval: Duration::from_secs(self.ssh_retry_interval),
        }
    }
}

fn default_identity() -> Result<Utf8PathBuf> {
    let data = dirs::data_dir().ok_or_else(|| eyre!("Could not determine the data directory"))?;
    Ok(utf8(data)?.join(Utf8Path::new(DEFAULT_IDENTITY)))
}
