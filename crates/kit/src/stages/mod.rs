//! GitLab Runner custom executor stages.
//!
//! Each stage is a separate process invocation configured through
//! `config_exec`, `prepare_exec`, `run_exec` and `cleanup_exec`.

pub(crate) mod cleanup;
pub(crate) mod config;
mod options;
pub(crate) mod prepare;
pub(crate) mod run;
