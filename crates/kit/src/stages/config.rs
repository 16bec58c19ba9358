//! The `config` stage: describe the executor to GitLab Runner.
//!
//! See <https://docs.gitlab.com/runner/executors/custom.html#config>.

use camino::{Utf8Path, Utf8PathBuf};
use clap::{ArgAction, Parser};
use color_eyre::{eyre::Context as _, Result};
use serde::Serialize;
use tracing::{debug, info};

use super::options::StageOpts;
use crate::ci::CiContext;

const DRIVER_NAME: &str = "fusion-executor";

/// Print the executor configuration as JSON
#[derive(Parser, Debug)]
pub(crate) struct ConfigOpts {
    #[clap(flatten)]
    pub stage: StageOpts,

    /// Base directory for the job's working directory inside the guest
    #[clap(long)]
    pub builds_dir: Option<String>,

    /// Base directory for the local cache inside the guest
    #[clap(long)]
    pub cache_dir: Option<String>,

    /// Whether the builds directory is shared between concurrent jobs
    #[clap(long, action = ArgAction::Set, default_value_t = false)]
    pub builds_dir_is_shared: bool,

    /// Hostname to associate with the job's metadata [default: local host name]
    #[clap(long)]
    pub hostname: Option<String>,
}

/// The document printed on stdout. Fields are declared in key order.
#[derive(Debug, Serialize, PartialEq, Eq)]
struct ExecutorConfig {
    builds_dir: String,
    builds_dir_is_shared: bool,
    cache_dir: String,
    driver: Driver,
    hostname: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct Driver {
    name: String,
    version: String,
}

pub(crate) fn run(opts: ConfigOpts) -> Result<()> {
    info!("Configuration stage is starting");
    let fusion_version = read_fusion_version(&opts.stage.info_plist());
    let hostname = opts.hostname.clone().unwrap_or_else(local_hostname);
    let config = executor_config(&opts, fusion_version.as_deref(), hostname);
    let json = serde_json::to_string_pretty(&config).context("Serializing configuration")?;
    debug!("{json}");
    println!("{json}");
    Ok(())
}

fn executor_config(opts: &ConfigOpts, fusion_version: Option<&str>, hostname: String) -> ExecutorConfig {
    let ci = &opts.stage.ci;
    ExecutorConfig {
        builds_dir: opts
            .builds_dir
            .clone()
            .unwrap_or_else(|| job_dir("/Users/buildbot/builds", ci).into_string()),
        builds_dir_is_shared: opts.builds_dir_is_shared,
        cache_dir: opts
            .cache_dir
            .clone()
            .unwrap_or_else(|| job_dir("/Users/buildbot/cache", ci).into_string()),
        driver: Driver {
            name: DRIVER_NAME.to_owned(),
            version: driver_version(fusion_version),
        },
        hostname,
    }
}

/// `<root>/runner-<id>/concurrent-<cid>/<project path>`
fn job_dir(root: &str, ci: &CiContext) -> Utf8PathBuf {
    let mut dir = Utf8Path::new(root)
        .join(format!("runner-{}", ci.runner_id))
        .join(format!("concurrent-{}", ci.concurrent_project_id));
    if !ci.project_path.is_empty() {
        dir.push(&ci.project_path);
    }
    dir
}

fn driver_version(fusion_version: Option<&str>) -> String {
    format!(
        "{} - VMware Fusion {}",
        env!("CARGO_PKG_VERSION"),
        fusion_version.unwrap_or("unknown")
    )
}

fn read_fusion_version(info_plist: &Utf8Path) -> Option<String> {
    match std::fs::read_to_string(info_plist) {
        Ok(contents) => bundle_short_version(&contents).map(str::to_owned),
        Err(e) => {
            debug!("Reading {info_plist}: {e}");
            None
        }
    }
}

/// Value of `CFBundleShortVersionString` in an XML property list.
///
/// Only the XML form Fusion ships is understood, with the value in a
/// `<string>` element right after its key. Binary property lists and any
/// other markup yield `None`, which is reported as an unknown version.
fn bundle_short_version(plist: &str) -> Option<&str> {
    let (_, rest) = plist.split_once("<key>CFBundleShortVersionString</key>")?;
    let rest = rest.trim_start().strip_prefix("<string>")?;
    let (value, _) = rest.split_once("</string>")?;
    Some(value.trim()).filter(|v| !v.is_empty())
}

fn local_hostname() -> String {
    rustix::system::uname()
        .nodename()
        .to_string_lossy()
        .into_owned()
}
