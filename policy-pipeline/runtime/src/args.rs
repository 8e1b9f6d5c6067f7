use crate::{admin::Admin, authoring::AuthoringPipeline, sweep};
use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use futures::prelude::*;
use policy_pipeline_api::{self as api, Api, ApiConfig, HttpMetrics};
use policy_pipeline_core::{Catalog, Environment, MemoryCatalog};
use policy_pipeline_planner::{Planner, PlannerMetrics};
use policy_pipeline_postgres::PgCatalog;
use policy_pipeline_store::{
    github::{GitHubConfig, GitHubRepository, DEFAULT_API_URL},
    memory::MemoryRepository,
    MemoryJournal, MoveJournal, PolicyStore, RemoteRepository, RetryPolicy, StoreMetrics,
};
use policy_pipeline_validator::{Validator, ValidatorConfig, ValidatorMetrics};
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{
    signal::unix::{signal, SignalKind},
    time::{self, Duration},
};
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

/// Read from the environment only, so that it never appears in a process
/// listing.
const GITHUB_TOKEN_ENV: &str = "POLICY_PIPELINE_GITHUB_TOKEN";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[clap(
    name = "policy-pipeline",
    about = "Validates, stores and distributes authorization policies"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "policy_pipeline=info,warn",
        env = "POLICY_PIPELINE_LOG"
    )]
    log_level: String,

    #[clap(long, value_enum, default_value = "plain")]
    log_format: LogFormat,

    #[clap(long, default_value = "0.0.0.0:9990")]
    admin_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:8080")]
    api_addr: SocketAddr,

    /// Requests taking longer are answered with 503.
    #[clap(long, default_value = "30000")]
    api_timeout_ms: u64,

    /// The longest a distribution request may wait for a new revision.
    #[clap(long, default_value = "20000")]
    api_max_wait_ms: u64,

    #[clap(long, default_value = "regal", env = "POLICY_PIPELINE_VALIDATOR")]
    validator: PathBuf,

    /// Arguments placed before the validator subcommand. May be repeated.
    #[clap(long = "validator-arg")]
    validator_args: Vec<String>,

    /// Must be shorter than the API timeout.
    #[clap(long, default_value = "5000")]
    validation_timeout_ms: u64,

    #[clap(long, default_value = "262144")]
    max_policy_bytes: usize,

    #[clap(
        long,
        value_delimiter = ',',
        default_value = "http.send,opa.runtime,net.lookup_ip_addr"
    )]
    validation_denylist: Vec<String>,

    #[clap(long, default_value = "3600")]
    validation_cache_ttl_secs: u64,

    #[clap(long, default_value = "4")]
    validation_concurrency: usize,

    #[clap(long, value_enum, default_value = "github")]
    repository: RepositoryBackend,

    #[clap(long, default_value = DEFAULT_API_URL)]
    github_api_url: String,

    #[clap(long, default_value = "", env = "POLICY_PIPELINE_GITHUB_OWNER")]
    github_owner: String,

    #[clap(long, default_value = "", env = "POLICY_PIPELINE_GITHUB_REPO")]
    github_repo: String,

    #[clap(long, default_value = "main")]
    github_branch: String,

    #[clap(long, default_value = "10000")]
    github_timeout_ms: u64,

    /// Total attempts for retryable repository operations.
    #[clap(long, default_value = "3")]
    store_retry_attempts: u32,

    /// Without a database, state is kept in memory and lost on restart.
    #[clap(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[clap(long, default_value = "10")]
    database_max_connections: u32,

    #[clap(long, default_value = "10")]
    reconcile_period_secs: u64,

    #[clap(long, default_value = "300")]
    drift_period_secs: u64,

    /// Resource folders checked for unauthorized files, in addition to those
    /// found in the repository and the catalog.
    #[clap(long, value_delimiter = ',')]
    drift_resources: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Plain,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum RepositoryBackend {
    Github,
    Memory,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            admin_addr,
            api_addr,
            api_timeout_ms,
            api_max_wait_ms,
            validator,
            validator_args,
            validation_timeout_ms,
            max_policy_bytes,
            validation_denylist,
            validation_cache_ttl_secs,
            validation_concurrency,
            repository,
            github_api_url,
            github_owner,
            github_repo,
            github_branch,
            github_timeout_ms,
            store_retry_attempts,
            database_url,
            database_max_connections,
            reconcile_period_secs,
            drift_period_secs,
            drift_resources,
        } = self;

        let api_timeout = Duration::from_millis(api_timeout_ms);
        let validation_timeout = Duration::from_millis(validation_timeout_ms);
        let max_wait = Duration::from_millis(api_max_wait_ms);
        check_timeouts(api_timeout, validation_timeout, max_wait)?;
        if store_retry_attempts == 0 {
            bail!("--store-retry-attempts must be at least 1");
        }

        init_log(&log_level, log_format)?;

        let mut prom = <Registry>::default();
        let validator_metrics = ValidatorMetrics::register(prom.sub_registry_with_prefix("validator"));
        let planner_metrics = PlannerMetrics::register(prom.sub_registry_with_prefix("planner"));
        let store_metrics = StoreMetrics::register(prom.sub_registry_with_prefix("store"));
        let http_metrics = HttpMetrics::register(prom.sub_registry_with_prefix("http"));

        let validator = Validator::new(
            ValidatorConfig {
                tool: validator,
                tool_args: validator_args,
                timeout: validation_timeout,
                max_size: max_policy_bytes,
                denylist: validation_denylist
                    .into_iter()
                    .filter(|s| !s.trim().is_empty())
                    .collect(),
                cache_ttl: Duration::from_secs(validation_cache_ttl_secs),
                concurrency: validation_concurrency,
                ..ValidatorConfig::default()
            },
            validator_metrics,
        )
        .context("invalid validator configuration")?;

        let (catalog, journal): (Arc<dyn Catalog>, Arc<dyn MoveJournal>) = match database_url {
            Some(url) => {
                let pg = Arc::new(PgCatalog::connect(&url, database_max_connections).await?);
                pg.migrate().await?;
                (pg.clone() as Arc<dyn Catalog>, pg as Arc<dyn MoveJournal>)
            }
            None => {
                warn!("No database configured; catalog state is kept in memory");
                (
                    Arc::new(MemoryCatalog::default()) as Arc<dyn Catalog>,
                    Arc::new(MemoryJournal::default()) as Arc<dyn MoveJournal>,
                )
            }
        };

        let repo: Arc<dyn RemoteRepository> = match repository {
            RepositoryBackend::Github => Arc::new(
                GitHubRepository::new(GitHubConfig {
                    api_url: github_api_url,
                    owner: github_owner,
                    repo: github_repo,
                    branch: github_branch,
                    token: std::env::var(GITHUB_TOKEN_ENV).ok().filter(|t| !t.is_empty()),
                    timeout: Duration::from_millis(github_timeout_ms),
                })
                .context("invalid GitHub configuration")?,
            ),
            RepositoryBackend::Memory => {
                warn!("Policy content is stored in memory");
                Arc::new(MemoryRepository::default())
            }
        };
        let store = Arc::new(PolicyStore::new(
            repo,
            journal,
            RetryPolicy {
                max_attempts: store_retry_attempts,
                ..RetryPolicy::default()
            },
            store_metrics,
        ));

        let planner = Arc::new(Planner::new(catalog.clone(), planner_metrics));
        for env in Environment::ALL {
            // The reconcile loop retries on its first tick.
            if let Err(error) = planner.reconcile(env).await {
                warn!(%error, environment = %env, "Initial reconcile failed");
            }
        }

        let (drain_tx, drain_rx) = drain::channel();

        let reconcile_period = Duration::from_secs(reconcile_period_secs);
        tokio::spawn(
            planner
                .clone()
                .reconcile_every(reconcile_period, drain_rx.clone())
                .instrument(info_span!("reconcile")),
        );
        tokio::spawn(
            sweep::detect_drift_every(
                store.clone(),
                catalog.clone(),
                drift_resources,
                Duration::from_secs(drift_period_secs),
                drain_rx.clone(),
            )
            .instrument(info_span!("drift")),
        );
        tokio::spawn(
            sweep::purge_validations_every(validator.clone(), reconcile_period, drain_rx.clone())
                .instrument(info_span!("validation_cache")),
        );

        let api = Api::new(
            planner.reader(),
            validator.clone(),
            ApiConfig {
                request_timeout: api_timeout,
                max_wait,
            },
            http_metrics,
            drain_rx.clone(),
        );
        tokio::spawn(
            api::serve(api_addr, api, drain_rx.clone())
                .map_err(|error| error!(%error, "Distribution API failed"))
                .instrument(info_span!("api")),
        );

        let authoring = AuthoringPipeline::new(catalog, store, validator.clone(), planner);
        let admin = Admin::new(prom, validator.clone(), authoring);
        tokio::spawn(
            api::serve(admin_addr, admin.clone(), drain_rx)
                .map_err(|error| error!(%error, "Admin server failed"))
                .instrument(info_span!("admin")),
        );
        admin.set_ready();
        info!(%api_addr, %admin_addr, "Policy pipeline started");

        shutdown_signal().await?;
        validator.close();
        if time::timeout(SHUTDOWN_GRACE, drain_tx.drain()).await.is_err() {
            bail!("Aborted after {SHUTDOWN_GRACE:?}");
        }
        info!("Shut down");
        Ok(())
    }
}

/// Both validation and long-polls run inside an API request, so each must
/// finish before the request times out.
fn check_timeouts(api: Duration, validation: Duration, max_wait: Duration) -> Result<()> {
    if validation >= api {
        bail!("validation timeout ({validation:?}) must be shorter than the API timeout ({api:?})");
    }
    if max_wait >= api {
        bail!("maximum wait ({max_wait:?}) must be shorter than the API timeout ({api:?})");
    }
    Ok(())
}

fn init_log(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_new(level).context("invalid log level")?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let res = match format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    res.map_err(|e| anyhow::anyhow!(e))
}

async fn shutdown_signal() -> Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    info!("Received shutdown signal");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_must_finish_within_the_api_timeout() {
        let args = Args::try_parse_from([
            "policy-pipeline",
            "--repository=memory",
            "--api-timeout-ms=1000",
            "--validation-timeout-ms=1000",
        ])
        .unwrap();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let error = rt.block_on(args.run()).unwrap_err();
        assert!(error.to_string().contains("must be shorter"), "{error}");
    }

    #[test]
    fn long_polls_must_finish_within_the_api_timeout() {
        let args = Args::try_parse_from([
            "policy-pipeline",
            "--repository=memory",
            "--api-timeout-ms=1000",
            "--validation-timeout-ms=500",
            "--api-max-wait-ms=5000",
        ])
        .unwrap();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let error = rt.block_on(args.run()).unwrap_err();
        assert!(error.to_string().contains("maximum wait"), "{error}");
    }

    #[test]
    fn timeouts_are_checked_against_the_api_timeout() {
        let api = Duration::from_secs(30);
        assert!(check_timeouts(api, Duration::from_secs(5), Duration::from_secs(20)).is_ok());
        assert!(check_timeouts(api, Duration::from_secs(30), Duration::from_secs(20)).is_err());
        assert!(check_timeouts(api, Duration::from_secs(5), Duration::from_secs(30)).is_err());
        assert!(check_timeouts(api, Duration::from_secs(5), Duration::from_secs(45)).is_err());
    }

    #[test]
    fn parses_lists() {
        let args = Args::try_parse_from([
            "policy-pipeline",
            "--drift-resources=orders,billing",
            "--validator-arg=/opt/lint.sh",
            "--validator-arg=--strict",
        ])
        .unwrap();
        assert_eq!(args.drift_resources, ["orders", "billing"]);
        assert_eq!(args.validator_args, ["/opt/lint.sh", "--strict"]);
        assert_eq!(args.repository, RepositoryBackend::Github);
        assert_eq!(args.validation_denylist.len(), 3);

        let args = Args::try_parse_from(["policy-pipeline"]).unwrap();
        assert!(args.drift_resources.is_empty());
    }
}
