use crate::{
    distribution::{AppliedDistribution, DataConnection, EnforcementPoint, EnforcementPointId},
    drift::DriftReport,
    Environment, PolicyId, PolicyRecord,
};
use ahash::AHashMap as HashMap;
use anyhow::Result;
use std::collections::BTreeSet;

/// A consistent view of everything the planner needs for one environment,
/// read at a single point in time.
#[derive(Clone, Debug, Default)]
pub struct CatalogSnapshot {
    pub records: Vec<PolicyRecord>,
    pub data_connections: Vec<DataConnection>,

    /// Active enforcement points registered in the environment.
    pub enforcement_points: Vec<EnforcementPoint>,

    pub applied: HashMap<EnforcementPointId, AppliedDistribution>,

    /// Enforcement points that still have an applied distribution computed
    /// for the environment but are no longer active or registered.
    pub retired: BTreeSet<EnforcementPointId>,
}

/// The system-of-record database.
///
/// Policy records and enforcement points are owned by administrative
/// surfaces outside this pipeline. The pipeline reads them, keeps record
/// content and lifecycle state in step with the repository, and owns the
/// applied distributions and drift log.
#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    /// Reads all state relevant to `env` in one consistent read.
    async fn snapshot(&self, env: Environment) -> Result<CatalogSnapshot>;

    async fn get_record(&self, id: PolicyId) -> Result<Option<PolicyRecord>>;

    async fn update_record(&self, record: &PolicyRecord) -> Result<()>;

    /// Returns false if no such record existed.
    async fn remove_record(&self, id: PolicyId) -> Result<bool>;

    /// Ids of every record stored under the given resource folder.
    async fn known_ids(&self, resource: &str) -> Result<BTreeSet<PolicyId>>;

    /// Names of every resource folder that holds at least one record.
    async fn resources(&self) -> Result<BTreeSet<String>>;

    async fn get_enforcement_point(&self, id: EnforcementPointId)
        -> Result<Option<EnforcementPoint>>;

    async fn get_applied(&self, id: EnforcementPointId) -> Result<Option<AppliedDistribution>>;

    /// Replaces the applied distribution for an enforcement point.
    async fn store_applied(&self, applied: &AppliedDistribution) -> Result<()>;

    /// Stores the distribution only if none exists yet. Returns whether it
    /// was stored.
    async fn store_applied_if_absent(&self, applied: &AppliedDistribution) -> Result<bool>;

    /// Marks `revision` as observed. Returns false if the enforcement point
    /// has no applied distribution at that revision.
    async fn acknowledge(&self, id: EnforcementPointId, revision: u64) -> Result<bool>;

    async fn remove_applied(&self, id: EnforcementPointId) -> Result<()>;

    /// Stores the latest report for the report's resource, replacing any
    /// earlier one.
    async fn record_drift(&self, report: &DriftReport) -> Result<()>;
}
