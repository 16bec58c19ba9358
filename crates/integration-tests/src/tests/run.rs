//! Integration tests for the run stage
//!
//! Executing a script needs a guest with an SSH server, so these only cover
//! the paths that fail before a session is opened.

use color_eyre::Result;
use xshell::Shell;

use crate::{executor, integration_test, run_captured, FakeFusion};

fn test_run_without_ip_is_system_failure() -> Result<()> {
    let sh = Shell::new()?;
    let fusion = FakeFusion::new()?;
    let script = fusion.images.join("script.sh");
    std::fs::write(&script, "echo hello\n")?;

    let cmd = executor(
        &sh,
        &[
            "run",
            "--vmware-fusion",
            fusion.app.as_str(),
            "--vm-images-path",
            fusion.images.as_str(),
            "/vms/base.vmwarevm/base.vmx",
            script.as_str(),
            "build_script",
        ],
    )?
    .env("FAKE_VMRUN_IP", "")
    .env("BUILD_FAILURE_EXIT_CODE", "5");
    let output = run_captured(cmd)?;
    output.expect_exit_code(2, "run without a guest IP")?;
    assert!(output.stderr.contains("never resolved an IP address"), "{}", output.stderr);

    let clone = fusion.clone_path("base", "-runner-0-concurrent-0");
    assert_eq!(fusion.calls()?, vec![format!("getGuestIPAddress {clone} -wait")]);
    Ok(())
}
integration_test!(test_run_without_ip_is_system_failure);

fn test_run_unreachable_guest_is_system_failure() -> Result<()> {
    let sh = Shell::new()?;
    let fusion = FakeFusion::new()?;
    let script = fusion.images.join("script.sh");
    std::fs::write(&script, "exit 1\n")?;
    let port = closed_port()?;

    let cmd = executor(
        &sh,
        &[
            "run",
            "--vmware-fusion",
            fusion.app.as_str(),
            "--vm-images-path",
            fusion.images.as_str(),
            "--ssh-port",
            port.as_str(),
            "--ssh-password",
            "buildbot",
            "/vms/base.vmwarevm/base.vmx",
            script.as_str(),
            "build_script",
        ],
    )?;
    let output = run_captured(cmd)?;
    output.expect_exit_code(2, "run against a closed port")?;
    assert!(output.stderr.contains("Unable to connect"), "{}", output.stderr);
    Ok(())
}
integration_test!(test_run_unreachable_guest_is_system_failure);

/// A local TCP port with nothing listening on it
pub(crate) fn closed_port() -> Result<String> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port.to_string())
}
