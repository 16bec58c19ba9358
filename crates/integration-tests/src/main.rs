//! Integration tests for fusion-executor
//!
//! The binary under test is driven exactly as GitLab Runner drives it. A
//! shell script stands in for `vmrun`, logging every invocation, so no
//! hypervisor is required.

use std::os::unix::fs::PermissionsExt;
use std::process::Output;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use indoc::{formatdoc, indoc};
use libtest_mimic::{Arguments, Trial};
use xshell::{Cmd, Shell};

pub(crate) use integration_tests::{integration_test, INTEGRATION_TESTS};

mod tests {
    pub mod cleanup;
    pub mod config;
    pub mod prepare;
    pub mod run;
}

/// Get the path to the fusion-executor binary, checking FUSION_EXECUTOR_PATH
/// first, then falling back to "fusion-executor"
pub(crate) fn get_executor_command() -> Result<String> {
    if let Ok(path) = std::env::var("FUSION_EXECUTOR_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/fusion-executor", "target/release/fusion-executor"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set FUSION_EXECUTOR_PATH={path} to run using this binary"
        ));
    }
    Ok("fusion-executor".to_owned())
}

/// Captured output from a command with decoded stdout/stderr strings
pub(crate) struct CapturedOutput {
    pub output: Output,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn new(output: Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Self {
            output,
            stdout,
            stderr,
        }
    }

    /// Fail with the command's stderr unless it exited with `expected`
    pub fn expect_exit_code(&self, expected: i32, context: &str) -> Result<()> {
        match self.output.status.code() {
            Some(code) if code == expected => Ok(()),
            other => Err(eyre!(
                "{context}: expected exit code {expected}, got {other:?}\nstdout: {}\nstderr: {}",
                self.stdout,
                self.stderr
            )),
        }
    }
}

/// The stand-in for `vmrun`.
///
/// Every invocation is appended to `vmrun.log`. `listSnapshots` reports no
/// snapshots, `clone` creates the destination descriptor and
/// `getGuestIPAddress` prints `$FAKE_VMRUN_IP` (127.0.0.1 when unset). The
/// verb named by `$FAKE_VMRUN_FAIL` fails with status 255.
const FAKE_VMRUN: &str = indoc! {r#"
    #!/bin/sh
    echo "$*" >> "$(dirname "$0")/vmrun.log"
    if [ -n "$FAKE_VMRUN_FAIL" ] && [ "$3" = "$FAKE_VMRUN_FAIL" ]; then
        echo "Error: simulated $3 failure" >&2
        exit 255
    fi
    case "$3" in
        listSnapshots) printf 'Total snapshots: 0\n' ;;
        clone) mkdir -p "$(dirname "$5")" && : > "$5" ;;
        getGuestIPAddress) printf '%s\n' "${FAKE_VMRUN_IP-127.0.0.1}" ;;
    esac
"#};

/// A VMware Fusion application bundle whose `vmrun` is [`FAKE_VMRUN`],
/// together with an images directory.
pub(crate) struct FakeFusion {
    _dir: tempfile::TempDir,
    pub app: Utf8PathBuf,
    pub images: Utf8PathBuf,
}

impl FakeFusion {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = Utf8Path::from_path(dir.path())
            .ok_or_else(|| eyre!("Temporary directory is not UTF-8"))?
            .to_owned();
        let app = root.join("Fake Fusion.app");
        let public = app.join("Contents").join("Public");
        std::fs::create_dir_all(&public)?;
        let vmrun = public.join("vmrun");
        std::fs::write(&vmrun, FAKE_VMRUN)?;
        std::fs::set_permissions(&vmrun, std::fs::Permissions::from_mode(0o755))?;

        let images = root.join("Virtual Machines");
        std::fs::create_dir(&images)?;
        Ok(Self {
            _dir: dir,
            app,
            images,
        })
    }

    pub fn write_info_plist(&self, version: &str) -> Result<()> {
        let plist = formatdoc! {r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <plist version="1.0">
            <dict>
                <key>CFBundleShortVersionString</key>
                <string>{version}</string>
            </dict>
            </plist>
        "#};
        std::fs::write(self.app.join("Contents").join("Info.plist"), plist)?;
        Ok(())
    }

    /// Invocations of the fake tool, in order, without the `-T fusion` prefix.
    pub fn calls(&self) -> Result<Vec<String>> {
        let log = self.app.join("Contents").join("Public").join("vmrun.log");
        if !log.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&log).with_context(|| format!("Reading {log}"))?;
        contents
            .lines()
            .map(|l| {
                l.strip_prefix("-T fusion ")
                    .map(str::to_owned)
                    .ok_or_else(|| eyre!("Unexpected invocation: {l}"))
            })
            .collect()
    }

    /// Descriptor path of the clone for `base` in the default CI slot.
    pub fn clone_path(&self, base: &str, slot: &str) -> Utf8PathBuf {
        let name = format!("{base}-{slot}");
        self.images
            .join(format!("{name}.vmwarevm"))
            .join(format!("{name}.vmx"))
    }
}

/// Variables of the calling environment that would leak into a test
const SCRUBBED_ENV: &[&str] = &[
    "CUSTOM_ENV_CI_SERVER_HOST",
    "CUSTOM_ENV_CI_RUNNER_ID",
    "CUSTOM_ENV_CI_CONCURRENT_PROJECT_ID",
    "CUSTOM_ENV_CI_PROJECT_PATH",
    "BUILD_FAILURE_EXIT_CODE",
    "SYSTEM_FAILURE_EXIT_CODE",
    "FUSION_SSH_PASSWORD",
    "FAKE_VMRUN_FAIL",
    "FAKE_VMRUN_IP",
];

/// Build a fusion-executor invocation with a scrubbed CI environment
pub(crate) fn executor<'a>(sh: &'a Shell, args: &[&str]) -> Result<Cmd<'a>> {
    let bin = get_executor_command()?;
    let mut cmd = sh.cmd(bin).args(args);
    for var in SCRUBBED_ENV {
        cmd = cmd.env_remove(var);
    }
    Ok(cmd)
}

/// Run a prepared invocation, capturing output regardless of exit status
pub(crate) fn run_captured(cmd: Cmd<'_>) -> Result<CapturedOutput> {
    let output = cmd.ignore_status().output()?;
    Ok(CapturedOutput::new(output))
}

fn main() {
    let args = Arguments::from_args();

    let tests: Vec<Trial> = INTEGRATION_TESTS
        .iter()
        .map(|test| {
            let name = test.name;
            let f = test.f;
            Trial::test(name, move || f().map_err(|e| format!("{:?}", e).into()))
        })
        .collect();

    libtest_mimic::run(&args, tests).exit();
}
