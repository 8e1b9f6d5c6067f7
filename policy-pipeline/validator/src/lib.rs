#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Validates policy documents with an external linter.
//!
//! Each lint or format run gets its own process group and a hard deadline.
//! Verdicts are cached by `(content fingerprint, tool version)` and
//! concurrent requests for the same content share a single execution.

mod cache;
mod config;
mod metrics;
mod process;
mod report;
mod result;


pub use self::{
    config::{ConfigError, ValidatorConfig, DEFAULT_DENYLIST},
    metrics::{ValidatorMetrics, ValidatorStats},
    result::{Finding, Location, Severity, ValidationResult, ValidationStatus},
};

use self::{
    cache::{CacheKey, Claim, ResultCache},
    metrics::Counters,
    process::RunError,
};
use chrono::{offset::Utc, DateTime};
use policy_pipeline_core::Fingerprint;
use serde::Serialize;
use std::{
    ffi::OsString,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, info, warn};

const POLICY_FILE: &str = "policy.rego";
const UNKNOWN_VERSION: &str = "unknown";

/// A trivial policy the tool must always accept.
const HEALTH_PROBE: &str = "package health\n\ndefault allow := false\n";

#[derive(Clone, Debug)]
pub struct Validator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: ValidatorConfig,
    cache: Arc<ResultCache>,
    limit: Semaphore,
    tool_version: OnceCell<Arc<str>>,
    counters: Counters,
    metrics: ValidatorMetrics,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("policy content is empty")]
    Empty,

    #[error("policy content is {size} bytes; the limit is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("policy content contains forbidden text {0:?}")]
    Denied(String),
}

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("rejected before validation: {0}")]
    Rejected(#[from] Rejection),

    #[error("validator timed out after {0:?}")]
    Timeout(Duration),

    #[error("validator tool failed: {0}")]
    Tool(String),

    #[error("failed to stage policy file: {0}")]
    Io(#[from] std::io::Error),

    #[error("validator is shutting down")]
    Closed,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub probe: ValidationStatus,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
    pub tool_version: String,
    pub stats: ValidatorStats,
    pub cached_results: usize,
    pub checked_at: DateTime<Utc>,
}

// === impl Validator ===

impl Validator {
    pub fn new(config: ValidatorConfig, metrics: ValidatorMetrics) -> Result<Self, ConfigError> {
        config.check()?;
        Ok(Self {
            inner: Arc::new(Inner {
                cache: ResultCache::new(config.cache_ttl),
                limit: Semaphore::new(config.concurrency),
                tool_version: OnceCell::new(),
                counters: Counters::default(),
                metrics,
                config,
            }),
        })
    }

    /// Validates a policy document.
    ///
    /// Never fails: rejected input, timeouts and tool failures are reported
    /// through the result status. Dropping the returned future kills the
    /// tool if it is running.
    pub async fn validate(&self, content: &str) -> ValidationResult {
        let fingerprint = Fingerprint::of(content);

        if let Err(rejection) = self.check_input(content) {
            debug!(%rejection, fingerprint = %fingerprint.short(), "Rejected policy");
            let result = ValidationResult {
                status: ValidationStatus::Error,
                findings: vec![Finding::error(ValidatorError::from(rejection).to_string())],
                fingerprint,
                tool_version: String::new(),
                elapsed: Duration::ZERO,
                cache_hit: false,
            };
            self.record(&result);
            return result;
        }

        let tool_version = self.tool_version().await;
        let key = CacheKey {
            fingerprint,
            tool_version,
        };
        let start = Instant::now();
        loop {
            match self.inner.cache.claim(key.clone()) {
                Claim::Cached(mut result) => {
                    result.cache_hit = true;
                    result.elapsed = start.elapsed();
                    self.record(&result);
                    return result;
                }

                Claim::Pending(mut rx) => {
                    let published = rx.wait_for(Option::is_some).await.ok().and_then(|r| r.clone());
                    if let Some(mut result) = published {
                        result.cache_hit = true;
                        result.elapsed = start.elapsed();
                        self.record(&result);
                        return result;
                    }
                    // The leader went away without a result.
                }

                Claim::Leader(flight) => {
                    let result = self.execute(content, &key).await;
                    flight.complete(&result);
                    self.record(&result);
                    return result;
                }
            }
        }
    }

    /// Rewrites a policy document in the tool's canonical style.
    pub async fn format(&self, content: &str) -> Result<String, ValidatorError> {
        self.check_input(content)?;
        let _permit = self
            .inner
            .limit
            .acquire()
            .await
            .map_err(|_| ValidatorError::Closed)?;

        let dir = tempfile::Builder::new().prefix("policy-fmt-").tempdir()?;
        let path = dir.path().join(POLICY_FILE);
        tokio::fs::write(&path, content).await?;

        let output = self
            .run(&[OsString::from("format"), path.into_os_string()])
            .await
            .map_err(|e| match e {
                RunError::Timeout(t) => ValidatorError::Timeout(t),
                e => ValidatorError::Tool(e.to_string()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ValidatorError::Tool(format!(
                "format exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        let formatted = String::from_utf8(output.stdout)
            .map_err(|_| ValidatorError::Tool("formatted output is not UTF-8".to_string()))?;
        if formatted.trim().is_empty() {
            return Err(ValidatorError::Tool("format produced no output".to_string()));
        }
        Ok(formatted)
    }

    /// Runs a known-good policy through the uncached path.
    pub async fn health(&self) -> HealthReport {
        let tool_version = self.tool_version().await;
        let key = CacheKey {
            fingerprint: Fingerprint::of(HEALTH_PROBE),
            tool_version: tool_version.clone(),
        };
        let probe = self.check(HEALTH_PROBE, &key).await;
        let healthy = probe.status == ValidationStatus::Valid;
        if !healthy {
            warn!(status = %probe.status, "Validator health probe failed");
        }
        HealthReport {
            healthy,
            probe: probe.status,
            findings: probe.findings,
            tool_version: tool_version.to_string(),
            stats: self.stats(),
            cached_results: self.inner.cache.len(),
            checked_at: Utc::now(),
        }
    }

    pub fn stats(&self) -> ValidatorStats {
        self.inner.counters.snapshot()
    }

    pub fn purge_expired(&self) -> usize {
        let evicted = self.inner.cache.purge_expired();
        if evicted > 0 {
            debug!(evicted, "Purged expired validation results");
        }
        evicted
    }

    /// Fails all queued and future executions.
    pub fn close(&self) {
        self.inner.limit.close();
    }

    pub fn timeout(&self) -> Duration {
        self.inner.config.timeout
    }

    fn check_input(&self, content: &str) -> Result<(), Rejection> {
        let config = &self.inner.config;
        if content.trim().is_empty() {
            return Err(Rejection::Empty);
        }
        if content.len() > config.max_size {
            return Err(Rejection::TooLarge {
                size: content.len(),
                limit: config.max_size,
            });
        }
        if let Some(denied) = config
            .denylist
            .iter()
            .find(|d| !d.is_empty() && content.contains(d.as_str()))
        {
            return Err(Rejection::Denied(denied.clone()));
        }
        Ok(())
    }

    async fn execute(&self, content: &str, key: &CacheKey) -> ValidationResult {
        let result = self.check(content, key).await;
        self.inner.counters.record_execution(result.elapsed);
        self.inner.metrics.observe_execution(result.elapsed);
        result
    }

    /// Lints without counting the run in the execution statistics.
    async fn check(&self, content: &str, key: &CacheKey) -> ValidationResult {
        let start = Instant::now();
        let (status, findings) = match self.lint(content).await {
            Ok(classified) => (classified.status, classified.findings),
            Err(ValidatorError::Timeout(timeout)) => (
                ValidationStatus::Timeout,
                vec![Finding::error(format!(
                    "validation did not complete within {timeout:?}; the tool was terminated"
                ))],
            ),
            Err(error) => (ValidationStatus::Error, vec![Finding::error(error.to_string())]),
        };
        let elapsed = start.elapsed();
        debug!(
            %status,
            fingerprint = %key.fingerprint.short(),
            elapsed_ms = elapsed.as_millis(),
            "Validated policy"
        );
        ValidationResult {
            status,
            findings,
            fingerprint: key.fingerprint.clone(),
            tool_version: key.tool_version.to_string(),
            elapsed,
            cache_hit: false,
        }
    }

    async fn lint(&self, content: &str) -> Result<report::Classified, ValidatorError> {
        let _permit = self
            .inner
            .limit
            .acquire()
            .await
            .map_err(|_| ValidatorError::Closed)?;

        // Removed on drop, whatever happens below.
        let dir = tempfile::Builder::new().prefix("policy-lint-").tempdir()?;
        let path = dir.path().join(POLICY_FILE);
        tokio::fs::write(&path, content).await?;

        let output = self
            .run(&[
                OsString::from("lint"),
                OsString::from("--format=json"),
                path.into_os_string(),
            ])
            .await
            .map_err(|e| match e {
                RunError::Timeout(t) => ValidatorError::Timeout(t),
                e => ValidatorError::Tool(e.to_string()),
            })?;

        Ok(report::classify(
            output.status.success(),
            &output.stdout,
            &output.stderr,
        ))
    }

    async fn tool_version(&self) -> Arc<str> {
        self.inner
            .tool_version
            .get_or_init(|| async {
                let version = match self.run(&[OsString::from("version")]).await {
                    Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                        .lines()
                        .map(str::trim)
                        .find(|l| !l.is_empty())
                        .map(str::to_string),
                    Ok(out) => {
                        warn!(status = %out.status, "Validator version probe failed");
                        None
                    }
                    Err(error) => {
                        warn!(%error, "Validator version probe failed");
                        None
                    }
                };
                let version = version.unwrap_or_else(|| UNKNOWN_VERSION.to_string());
                info!(tool = %self.inner.config.tool.display(), %version, "Validator ready");
                Arc::from(version)
            })
            .await
            .clone()
    }

    async fn run(&self, args: &[OsString]) -> Result<process::Output, RunError> {
        let config = &self.inner.config;
        let args = config
            .tool_args
            .iter()
            .map(OsString::from)
            .chain(args.iter().cloned());
        process::run(
            &config.tool,
            args,
            config.timeout,
            config.max_output,
        )
        .await
    }

    fn record(&self, result: &ValidationResult) {
        self.inner.counters.record(result.status, result.cache_hit);
        self.inner.metrics.observe(result.status, result.cache_hit);
    }
}
