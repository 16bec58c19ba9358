//! Process exit codes understood by GitLab Runner.
//!
//! The runner tells the executor which codes to use for a failed job and for
//! a failed infrastructure through the environment. Any stage error that is
//! not a [`BuildFailure`] is a system failure, which makes the runner retry
//! the stage.

use color_eyre::Report;
use thiserror::Error;

const BUILD_FAILURE_VAR: &str = "BUILD_FAILURE_EXIT_CODE";
const SYSTEM_FAILURE_VAR: &str = "SYSTEM_FAILURE_EXIT_CODE";

const DEFAULT_BUILD_FAILURE: i32 = 1;
const DEFAULT_SYSTEM_FAILURE: i32 = 2;

/// The job's own script ran and exited nonzero.
#[derive(Debug, Error)]
#[error("Job script of stage {sub_stage} exited with status {status}")]
pub(crate) struct BuildFailure {
    pub sub_stage: String,
    pub status: i32,
}

/// Parse an exit code override, falling back to `default` when it is unset
/// or not an integer.
fn exit_code_from(value: Option<&str>, default: i32) -> i32 {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub(crate) fn is_build_failure(report: &Report) -> bool {
    report.chain().any(|e| e.is::<BuildFailure>())
}

/// Exit code for a stage that failed with `report`, reading overrides
/// through `var`.
fn exit_code_for(report: &Report, var: impl Fn(&str) -> Option<String>) -> i32 {
    let (name, default) = if is_build_failure(report) {
        (BUILD_FAILURE_VAR, DEFAULT_BUILD_FAILURE)
    } else {
        (SYSTEM_FAILURE_VAR, DEFAULT_SYSTEM_FAILURE)
    };
    exit_code_from(var(name).as_deref(), default)
}

/// Exit code for a stage that failed with `report`.
pub(crate) fn for_report(report: &Report) -> i32 {
    exit_code_for(report, |name| std::env::var(name).ok())
}
