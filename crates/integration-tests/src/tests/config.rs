//! Integration tests for the config stage

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use serde_json::Value;
use xshell::Shell;

use crate::{executor, integration_test, run_captured, FakeFusion};

fn parse_config(stdout: &str) -> Result<Value> {
    let config: Value = serde_json::from_str(stdout).context("Failed to parse JSON output")?;
    if !config.is_object() {
        return Err(eyre!("Expected a JSON object, got: {stdout}"));
    }
    Ok(config)
}

fn test_config_prints_json() -> Result<()> {
    let sh = Shell::new()?;
    let fusion = FakeFusion::new()?;
    fusion.write_info_plist("12.1.2")?;
    let app = fusion.app.as_str();

    let cmd = executor(&sh, &["config", "--vmware-fusion", app])?
        .env("CUSTOM_ENV_CI_RUNNER_ID", "7")
        .env("CUSTOM_ENV_CI_CONCURRENT_PROJECT_ID", "2")
        .env("CUSTOM_ENV_CI_PROJECT_PATH", "group/project");
    let output = run_captured(cmd)?;
    output.expect_exit_code(0, "config")?;

    let config = parse_config(&output.stdout)?;
    assert_eq!(
        config["builds_dir"],
        "/Users/buildbot/builds/runner-7/concurrent-2/group/project"
    );
    assert_eq!(
        config["cache_dir"],
        "/Users/buildbot/cache/runner-7/concurrent-2/group/project"
    );
    assert_eq!(config["builds_dir_is_shared"], false);
    assert_eq!(config["driver"]["name"], "fusion-executor");
    let version = config["driver"]["version"]
        .as_str()
        .ok_or_else(|| eyre!("driver.version is not a string: {config}"))?;
    assert!(version.ends_with(" - VMware Fusion 12.1.2"), "{version}");
    assert!(config["hostname"].as_str().is_some_and(|h| !h.is_empty()));
    Ok(())
}
integration_test!(test_config_prints_json);

fn test_config_overrides() -> Result<()> {
    let sh = Shell::new()?;
    let output = run_captured(executor(
        &sh,
        &[
            "config",
            "--vmware-fusion",
            "/nonexistent/VMware Fusion.app",
            "--builds-dir",
            "/Volumes/builds",
            "--builds-dir-is-shared",
            "true",
            "--hostname",
            "mac-mini-3",
        ],
    )?)?;
    output.expect_exit_code(0, "config with overrides")?;

    let config = parse_config(&output.stdout)?;
    assert_eq!(config["builds_dir"], "/Volumes/builds");
    assert_eq!(config["builds_dir_is_shared"], true);
    assert_eq!(config["hostname"], "mac-mini-3");
    assert_eq!(config["cache_dir"], "/Users/buildbot/cache/runner-0/concurrent-0");
    let version = config["driver"]["version"].as_str().unwrap_or_default();
    assert!(version.ends_with("VMware Fusion unknown"), "{version}");
    Ok(())
}
integration_test!(test_config_overrides);
