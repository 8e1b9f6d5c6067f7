use std::{path::PathBuf, time::Duration};
use thiserror::Error;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_SIZE: usize = 256 * 1024;
pub const DEFAULT_MAX_OUTPUT: usize = 1024 * 1024;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Built-ins that reach outside the policy document. Content using them is
/// never handed to the tool.
pub const DEFAULT_DENYLIST: &[&str] = &["http.send", "opa.runtime", "net.lookup_ip_addr"];

#[derive(Clone, Debug)]
pub struct ValidatorConfig {
    /// The validator executable.
    pub tool: PathBuf,

    /// Arguments placed before the subcommand, e.g. a script path when the
    /// tool is an interpreter.
    pub tool_args: Vec<String>,

    pub timeout: Duration,
    pub max_size: usize,

    /// Per-stream limit on captured tool output.
    pub max_output: usize,

    pub denylist: Vec<String>,
    pub cache_ttl: Duration,
    pub concurrency: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("validation timeout must be positive")]
    ZeroTimeout,

    #[error("validation concurrency must be positive")]
    ZeroConcurrency,

    #[error("maximum policy size must be positive")]
    ZeroMaxSize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            tool: PathBuf::from("regal"),
            tool_args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            max_size: DEFAULT_MAX_SIZE,
            max_output: DEFAULT_MAX_OUTPUT,
            denylist: DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect(),
            cache_ttl: DEFAULT_CACHE_TTL,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl ValidatorConfig {
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.max_size == 0 {
            return Err(ConfigError::ZeroMaxSize);
        }
        Ok(())
    }
}
