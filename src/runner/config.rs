//! Configuration for tool invocations.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default JVM heap size.
pub const DEFAULT_MEMORY: &str = "8G";

/// Profile used when a job does not name one.
pub const DEFAULT_PROFILE: &str = "forensic";

/// Name of the audit log written inside the output directory.
pub const LOG_FILE_NAME: &str = "IPED.log";

/// Flags that keep IPED non-interactive and self-contained.
pub const MODE_FLAGS: [&str; 3] = ["--nologfile", "--nogui", "--portable"];

/// How the external tool is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// JVM launcher.
    pub java: String,
    /// Options passed to the launcher before any IPED argument.
    #[serde(default)]
    pub jvm_options: Vec<String>,
    /// Path to the IPED jar.
    pub jar: PathBuf,
    /// Heap size passed as `-Xmx`.
    pub memory: String,
    /// Profile used when a job has none.
    pub default_profile: String,
    /// Host identity written to the log header.
    pub hostname: String,
}

impl ToolConfig {
    /// Creates a configuration for `jar` with defaults.
    pub fn new(jar: impl Into<PathBuf>) -> Self {
        Self {
            java: "java".to_string(),
            jvm_options: Vec::new(),
            jar: jar.into(),
            memory: DEFAULT_MEMORY.to_string(),
            default_profile: DEFAULT_PROFILE.to_string(),
            hostname: "localhost".to_string(),
        }
    }

    /// Sets the JVM launcher.
    pub fn with_java(mut self, java: impl Into<String>) -> Self {
        self.java = java.into();
        self
    }

    /// Appends a launcher option.
    pub fn with_jvm_option(mut self, option: impl Into<String>) -> Self {
        self.jvm_options.push(option.into());
        self
    }

    /// Sets the heap size.
    pub fn with_memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = memory.into();
        self
    }

    /// Sets the fallback profile.
    pub fn with_default_profile(mut self, profile: impl Into<String>) -> Self {
        self.default_profile = profile.into();
        self
    }

    /// Sets the host identity.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }
}
