use crate::{environment::duration_secs, Environment, EnvironmentScope, Fingerprint, PolicyId};
use anyhow::Result;
use chrono::{offset::Utc, DateTime};
use futures::prelude::*;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, pin::Pin, str::FromStr, time::Duration};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnforcementPointId(pub i64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataConnectionId(pub i64);

/// A remote deployment that enforces policies and pulls its configuration
/// from the pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementPoint {
    pub id: EnforcementPointId,
    pub name: String,
    pub environment: Environment,

    /// Limits distribution to policies governing a single resource.
    pub resource_scope: Option<String>,
}

/// An upstream data source that policies may consult at decision time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataConnection {
    pub id: DataConnectionId,
    pub name: String,
    pub environment: EnvironmentScope,
    pub sandbox_endpoint: Option<String>,
    pub production_endpoint: Option<String>,

    /// Used when no endpoint is declared for a specific environment.
    pub default_endpoint: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResolvedDataSource {
    pub id: DataConnectionId,
    pub name: String,
    pub endpoint: String,
}

/// Describes which policy records an enforcement point may receive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySelector {
    pub environment: Environment,
    pub resource_scope: Option<String>,
}

/// Describes which data connections an enforcement point may receive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceSelector {
    pub environment: Environment,
}

/// The derived configuration for one enforcement point. It holds no
/// authority of its own and can always be recomputed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionConfig {
    pub enforcement_point: EnforcementPointId,
    pub policy_selector: PolicySelector,
    pub data_source_selector: DataSourceSelector,

    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,
    pub rate_limit: u32,
}

/// The last configuration computed for an enforcement point, as persisted
/// in the catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDistribution {
    pub config: DistributionConfig,
    pub revision: u64,
    pub policies: BTreeMap<PolicyId, Fingerprint>,
    pub data_sources: BTreeMap<DataConnectionId, String>,

    /// Set when the computed state changed and the enforcement point has not
    /// yet pulled the new revision.
    pub resync_required: bool,
    pub acknowledged_revision: Option<u64>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedPolicy {
    pub id: PolicyId,
    pub resource_name: Option<String>,
    pub fingerprint: Fingerprint,
    pub content: String,
}

/// What an enforcement point observes when it pulls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    pub enforcement_point: EnforcementPointId,
    pub environment: Environment,
    pub revision: u64,

    #[serde(rename = "cache_ttl_seconds", with = "duration_secs")]
    pub cache_ttl: Duration,
    pub rate_limit: u32,
    pub policies: Vec<DistributedPolicy>,
    pub data_sources: Vec<ResolvedDataSource>,
}

/// Models distribution discovery for enforcement points.
#[async_trait::async_trait]
pub trait DiscoverDistribution {
    async fn get_distribution(&self, id: EnforcementPointId) -> Result<Option<Distribution>>;

    async fn watch_distribution(
        &self,
        id: EnforcementPointId,
    ) -> Result<Option<DistributionStream>>;

    /// Records that the enforcement point has observed `revision`.
    async fn acknowledge(&self, id: EnforcementPointId, revision: u64) -> Result<()>;
}

pub type DistributionStream = Pin<Box<dyn Stream<Item = Distribution> + Send + Sync + 'static>>;

// === impl EnforcementPointId ===

impl fmt::Display for EnforcementPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EnforcementPointId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

// === impl DataConnectionId ===

impl fmt::Display for DataConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl DataConnection ===

impl DataConnection {
    /// Returns the endpoint this connection exposes to `env`, if any.
    ///
    /// An environment-specific endpoint always wins over the default one.
    /// Connections that are not available to `env` never resolve.
    pub fn endpoint_for(&self, env: Environment) -> Option<&str> {
        if !self.environment.includes(env) {
            return None;
        }
        let specific = match env {
            Environment::Sandbox => self.sandbox_endpoint.as_deref(),
            Environment::Production => self.production_endpoint.as_deref(),
        };
        specific
            .or(self.default_endpoint.as_deref())
            .filter(|e| !e.trim().is_empty())
    }
}

// === impl AppliedDistribution ===

impl AppliedDistribution {
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_revision == Some(self.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(
        environment: EnvironmentScope,
        sandbox: Option<&str>,
        production: Option<&str>,
        default: Option<&str>,
    ) -> DataConnection {
        DataConnection {
            id: DataConnectionId(1),
            name: "users".to_string(),
            environment,
            sandbox_endpoint: sandbox.map(Into::into),
            production_endpoint: production.map(Into::into),
            default_endpoint: default.map(Into::into),
        }
    }

    #[test]
    fn specific_endpoint_wins_over_default() {
        let conn = connection(
            EnvironmentScope::Both,
            Some("http://sandbox"),
            None,
            Some("http://shared"),
        );
        assert_eq!(conn.endpoint_for(Environment::Sandbox), Some("http://sandbox"));
        assert_eq!(
            conn.endpoint_for(Environment::Production),
            Some("http://shared")
        );
    }

    #[test]
    fn unresolvable_connections_are_excluded() {
        let conn = connection(EnvironmentScope::Both, Some("http://sandbox"), None, None);
        assert_eq!(conn.endpoint_for(Environment::Production), None);

        let conn = connection(EnvironmentScope::Both, None, None, Some("  "));
        assert_eq!(conn.endpoint_for(Environment::Sandbox), None);
    }

    #[test]
    fn connections_outside_scope_never_resolve() {
        let conn = connection(
            EnvironmentScope::Sandbox,
            None,
            Some("http://prod"),
            Some("http://shared"),
        );
        assert_eq!(conn.endpoint_for(Environment::Production), None);
        assert_eq!(conn.endpoint_for(Environment::Sandbox), Some("http://shared"));
    }
}
