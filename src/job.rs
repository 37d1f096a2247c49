//! Job definition.
//!
//! A `Job` is one evidence-processing request. It is built by a dispatch
//! source (command line, HTTP body, polling response), handed to the
//! coordinator, and discarded after a single execution attempt.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Suffix appended to the evidence name when a job has no output path.
pub const DEFAULT_OUTPUT_SUFFIX: &str = "_IPED";

/// One evidence-processing request.
///
/// All fields are optional on the wire; only `evidence_path` is required
/// by [`Job::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Job {
    /// Input data set.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub evidence_path: String,
    /// Output directory, absolute or relative to the evidence's parent.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output_path: String,
    /// Tool profile; the configured default applies when empty.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub profile: String,
    /// Extra tool arguments, split on whitespace.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub additional_args: String,
    /// Extra evidence sources, one per line.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub additional_paths: String,
    /// Where to move the output tree after a successful run.
    #[serde(rename = "mvPath", skip_serializing_if = "String::is_empty")]
    pub relocate_path: String,
}

impl Job {
    /// Creates a job for `evidence_path` with every optional field unset.
    pub fn new(evidence_path: impl Into<String>) -> Self {
        Self {
            evidence_path: evidence_path.into(),
            ..Default::default()
        }
    }

    /// Sets the output path.
    pub fn with_output(mut self, output_path: impl Into<String>) -> Self {
        self.output_path = output_path.into();
        self
    }

    /// Sets the profile.
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    /// Sets additional tool arguments.
    pub fn with_additional_args(mut self, args: impl Into<String>) -> Self {
        self.additional_args = args.into();
        self
    }

    /// Sets additional evidence sources (newline separated).
    pub fn with_additional_paths(mut self, paths: impl Into<String>) -> Self {
        self.additional_paths = paths.into();
        self
    }

    /// Sets the relocation target.
    pub fn with_relocate_path(mut self, path: impl Into<String>) -> Self {
        self.relocate_path = path.into();
        self
    }

    /// Checks the job can be attempted: the evidence path is set and exists.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.evidence_path.trim().is_empty() {
            return Err(JobError::Validation("evidencePath is required".to_string()));
        }
        if !self.evidence().exists() {
            return Err(JobError::Validation(format!(
                "evidence not found: {}",
                self.evidence_path
            )));
        }
        Ok(())
    }

    /// Evidence location.
    pub fn evidence(&self) -> &Path {
        Path::new(&self.evidence_path)
    }

    /// Directory the tool runs in: the evidence's parent.
    pub fn working_dir(&self) -> PathBuf {
        match self.evidence().parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Final component of the evidence path, as passed to `-d`.
    pub fn evidence_name(&self) -> String {
        self.evidence()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.evidence_path.clone())
    }

    /// Output path as given to the tool (`-o`), defaulted when empty.
    pub fn output(&self) -> String {
        if self.output_path.trim().is_empty() {
            format!("{}{}", self.evidence_name(), DEFAULT_OUTPUT_SUFFIX)
        } else {
            self.output_path.clone()
        }
    }

    /// Absolute output directory: relative outputs resolve against the
    /// evidence's parent.
    pub fn output_dir(&self) -> PathBuf {
        let output = PathBuf::from(self.output());
        if output.is_absolute() {
            output
        } else {
            self.working_dir().join(output)
        }
    }

    /// Additional tool arguments. Arguments containing spaces are not
    /// supported.
    pub fn extra_args(&self) -> Vec<&str> {
        self.additional_args.split_whitespace().collect()
    }

    /// Additional evidence sources, blank lines skipped.
    pub fn extra_paths(&self) -> Vec<&str> {
        self.additional_paths
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect()
    }

    /// Relocation target, if any.
    pub fn relocate_to(&self) -> Option<PathBuf> {
        let trimmed = self.relocate_path.trim();
        (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
    }
}
