use crate::{
    catalog::{Catalog, CatalogSnapshot},
    distribution::{AppliedDistribution, DataConnection, EnforcementPoint, EnforcementPointId},
    drift::DriftReport,
    paths::DEFAULT_RESOURCE,
    Environment, PolicyId, PolicyRecord,
};
use anyhow::Result;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

/// A `Catalog` held in process memory.
///
/// Used when no database is configured and throughout tests.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<PolicyId, PolicyRecord>,
    data_connections: Vec<DataConnection>,
    enforcement_points: BTreeMap<EnforcementPointId, EnforcementPoint>,
    applied: BTreeMap<EnforcementPointId, AppliedDistribution>,
    drift: BTreeMap<String, DriftReport>,
}

// === impl MemoryCatalog ===

impl MemoryCatalog {
    pub fn insert_record(&self, record: PolicyRecord) {
        self.state.write().records.insert(record.id, record);
    }

    pub fn insert_data_connection(&self, conn: DataConnection) {
        let mut state = self.state.write();
        state.data_connections.retain(|c| c.id != conn.id);
        state.data_connections.push(conn);
    }

    pub fn insert_enforcement_point(&self, ep: EnforcementPoint) {
        self.state.write().enforcement_points.insert(ep.id, ep);
    }

    pub fn remove_enforcement_point(&self, id: EnforcementPointId) {
        self.state.write().enforcement_points.remove(&id);
    }

    /// The latest report for each resource.
    pub fn drift_reports(&self) -> Vec<DriftReport> {
        self.state.read().drift.values().cloned().collect()
    }
}

#[async_trait::async_trait]
impl Catalog for MemoryCatalog {
    async fn snapshot(&self, env: Environment) -> Result<CatalogSnapshot> {
        let state = self.state.read();
        let enforcement_points = state
            .enforcement_points
            .values()
            .filter(|ep| ep.environment == env)
            .cloned()
            .collect::<Vec<_>>();
        let applied = enforcement_points
            .iter()
            .filter_map(|ep| Some((ep.id, state.applied.get(&ep.id)?.clone())))
            .collect();
        let retired = state
            .applied
            .values()
            .filter(|a| a.config.policy_selector.environment == env)
            .map(|a| a.config.enforcement_point)
            .filter(|id| !state.enforcement_points.contains_key(id))
            .collect();
        Ok(CatalogSnapshot {
            records: state.records.values().cloned().collect(),
            data_connections: state.data_connections.clone(),
            enforcement_points,
            applied,
            retired,
        })
    }

    async fn get_record(&self, id: PolicyId) -> Result<Option<PolicyRecord>> {
        Ok(self.state.read().records.get(&id).cloned())
    }

    async fn update_record(&self, record: &PolicyRecord) -> Result<()> {
        let mut state = self.state.write();
        match state.records.get_mut(&record.id) {
            Some(r) => {
                *r = record.clone();
                Ok(())
            }
            None => anyhow::bail!("policy {} does not exist", record.id),
        }
    }

    async fn remove_record(&self, id: PolicyId) -> Result<bool> {
        Ok(self.state.write().records.remove(&id).is_some())
    }

    async fn known_ids(&self, resource: &str) -> Result<BTreeSet<PolicyId>> {
        Ok(self
            .state
            .read()
            .records
            .values()
            .filter(|r| r.resource_name.as_deref().unwrap_or(DEFAULT_RESOURCE) == resource)
            .map(|r| r.id)
            .collect())
    }

    async fn resources(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .state
            .read()
            .records
            .values()
            .map(|r| r.resource_name.as_deref().unwrap_or(DEFAULT_RESOURCE).to_string())
            .collect())
    }

    async fn get_enforcement_point(
        &self,
        id: EnforcementPointId,
    ) -> Result<Option<EnforcementPoint>> {
        Ok(self.state.read().enforcement_points.get(&id).cloned())
    }

    async fn get_applied(&self, id: EnforcementPointId) -> Result<Option<AppliedDistribution>> {
        Ok(self.state.read().applied.get(&id).cloned())
    }

    async fn store_applied(&self, applied: &AppliedDistribution) -> Result<()> {
        self.state
            .write()
            .applied
            .insert(applied.config.enforcement_point, applied.clone());
        Ok(())
    }

    async fn store_applied_if_absent(&self, applied: &AppliedDistribution) -> Result<bool> {
        let mut state = self.state.write();
        let id = applied.config.enforcement_point;
        if state.applied.contains_key(&id) {
            return Ok(false);
        }
        state.applied.insert(id, applied.clone());
        Ok(true)
    }

    async fn acknowledge(&self, id: EnforcementPointId, revision: u64) -> Result<bool> {
        let mut state = self.state.write();
        match state.applied.get_mut(&id) {
            Some(applied) if applied.revision == revision => {
                applied.acknowledged_revision = Some(revision);
                applied.resync_required = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_applied(&self, id: EnforcementPointId) -> Result<()> {
        self.state.write().applied.remove(&id);
        Ok(())
    }

    async fn record_drift(&self, report: &DriftReport) -> Result<()> {
        self.state
            .write()
            .drift
            .insert(report.resource.clone(), report.clone());
        Ok(())
    }
}
