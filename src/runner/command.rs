//! IPED command line construction.

use std::process::Stdio;

use tokio::process::Command;

use super::config::{ToolConfig, MODE_FLAGS};
use crate::job::Job;

/// Builds the tool's argument vector (everything after the JVM launcher).
///
/// `-d` receives only the evidence's file name: the command runs from the
/// evidence's parent directory, so relative and absolute `-o` values resolve
/// the same way.
pub fn build_args(job: &Job, config: &ToolConfig) -> Vec<String> {
    let mut args = config.jvm_options.clone();
    args.extend([
        "-Djava.awt.headless=true".to_string(),
        format!("-Xmx{}", config.memory),
        "-jar".to_string(),
        config.jar.display().to_string(),
        "-d".to_string(),
        job.evidence_name(),
        "-o".to_string(),
        job.output(),
    ]);
    args.extend(MODE_FLAGS.iter().map(|flag| flag.to_string()));

    let profile = match job.profile.trim() {
        "" => config.default_profile.as_str(),
        profile => profile,
    };
    if !profile.is_empty() {
        args.push("-profile".to_string());
        args.push(profile.to_string());
    }

    args.extend(job.extra_args().into_iter().map(str::to_string));

    for path in job.extra_paths() {
        args.push("-d".to_string());
        args.push(path.to_string());
    }

    args
}

/// Builds the ready-to-spawn command with both output streams piped.
pub fn build_command(job: &Job, config: &ToolConfig) -> Command {
    let mut cmd = Command::new(&config.java);
    cmd.args(build_args(job, config))
        .current_dir(job.working_dir())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}
