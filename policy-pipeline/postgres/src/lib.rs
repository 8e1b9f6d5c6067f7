#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The catalog and move journal on PostgreSQL.

mod rows;

#[cfg(test)]
mod tests;

use self::rows::{
    AppliedColumns, AppliedRow, DataConnectionRow, EnforcementPointRow, MoveRow, PolicyRow,
};
use ahash::AHashMap as HashMap;
use anyhow::{Context, Result};
use policy_pipeline_core::{
    catalog::{Catalog, CatalogSnapshot},
    distribution::{AppliedDistribution, DataConnection, EnforcementPoint, EnforcementPointId},
    drift::{DriftReport, Severity},
    paths::DEFAULT_RESOURCE,
    Environment, PolicyId, PolicyRecord,
};
use policy_pipeline_store::{MoveEntry, MoveJournal};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{collections::BTreeSet, time::Duration};
use tracing::{debug, info, instrument};

#[derive(Clone, Debug)]
pub struct PgCatalog {
    pool: PgPool,
}

const POLICY_COLUMNS: &str = "id, environment, lifecycle_stage, promoted_from_sandbox, \
     resource_name, content, content_fingerprint";

const ENFORCEMENT_POINT_COLUMNS: &str = "id, name, environment, resource_scope";

const APPLIED_COLUMNS: &str = "config, revision, policies, data_sources, resync_required, \
     acknowledged_revision, computed_at";

// === impl PgCatalog ===

impl PgCatalog {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .context("failed to connect to the catalog database")?;
        info!(max_connections, "Connected to catalog database");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to apply catalog migrations")?;
        debug!("Catalog schema is current");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Catalog for PgCatalog {
    /// Reads the environment's state within one repeatable-read transaction
    /// so that every table reflects the same point in time.
    #[instrument(skip(self), fields(environment = %env))]
    async fn snapshot(&self, env: Environment) -> Result<CatalogSnapshot> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let records = sqlx::query_as::<_, PolicyRow>(&format!(
            "SELECT {POLICY_COLUMNS} FROM policy_records ORDER BY id"
        ))
        .fetch_all(&mut *tx)
        .await
        .context("failed to read policy records")?
        .into_iter()
        .map(PolicyRecord::try_from)
        .collect::<Result<Vec<_>>>()?;

        let data_connections = sqlx::query_as::<_, DataConnectionRow>(
            "SELECT id, name, environment, sandbox_endpoint, production_endpoint, default_endpoint \
             FROM data_connections ORDER BY id",
        )
        .fetch_all(&mut *tx)
        .await
        .context("failed to read data connections")?
        .into_iter()
        .map(DataConnection::try_from)
        .collect::<Result<Vec<_>>>()?;

        let enforcement_points = sqlx::query_as::<_, EnforcementPointRow>(&format!(
            "SELECT {ENFORCEMENT_POINT_COLUMNS} FROM enforcement_points \
             WHERE active AND environment = $1 ORDER BY id"
        ))
        .bind(env.as_str())
        .fetch_all(&mut *tx)
        .await
        .context("failed to read enforcement points")?
        .into_iter()
        .map(EnforcementPoint::try_from)
        .collect::<Result<Vec<_>>>()?;

        let applied = sqlx::query_as::<_, AppliedRow>(&format!(
            "SELECT {APPLIED_COLUMNS} FROM applied_distributions a \
             JOIN enforcement_points e ON e.id = a.enforcement_point_id \
             WHERE e.active AND e.environment = $1"
        ))
        .bind(env.as_str())
        .fetch_all(&mut *tx)
        .await
        .context("failed to read applied distributions")?
        .into_iter()
        .map(|row| {
            let applied = AppliedDistribution::try_from(row)?;
            Ok((applied.config.enforcement_point, applied))
        })
        .collect::<Result<HashMap<_, _>>>()?;

        // Rows of deleted enforcement points cascade away; inactive ones stay
        // until the planner revokes them.
        let retired = sqlx::query_scalar::<_, i64>(
            "SELECT a.enforcement_point_id FROM applied_distributions a \
             JOIN enforcement_points e ON e.id = a.enforcement_point_id \
             WHERE NOT e.active AND a.config -> 'policy_selector' ->> 'environment' = $1",
        )
        .bind(env.as_str())
        .fetch_all(&mut *tx)
        .await
        .context("failed to read retired distributions")?
        .into_iter()
        .map(EnforcementPointId)
        .collect();

        tx.commit().await?;
        Ok(CatalogSnapshot {
            records,
            data_connections,
            enforcement_points,
            applied,
            retired,
        })
    }

    async fn get_record(&self, id: PolicyId) -> Result<Option<PolicyRecord>> {
        sqlx::query_as::<_, PolicyRow>(&format!(
            "SELECT {POLICY_COLUMNS} FROM policy_records WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to read policy {id}"))?
        .map(PolicyRecord::try_from)
        .transpose()
    }

    async fn update_record(&self, record: &PolicyRecord) -> Result<()> {
        let res = sqlx::query(
            "UPDATE policy_records SET environment = $2, lifecycle_stage = $3, \
             promoted_from_sandbox = $4, content = $5, content_fingerprint = $6, \
             updated_at = NOW() WHERE id = $1",
        )
        .bind(record.id.0)
        .bind(record.environment.as_str())
        .bind(record.lifecycle_stage.as_str())
        .bind(record.promoted_from_sandbox)
        .bind(&record.content)
        .bind(record.content_fingerprint.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update policy {}", record.id))?;
        if res.rows_affected() == 0 {
            anyhow::bail!("policy {} does not exist", record.id);
        }
        Ok(())
    }

    async fn remove_record(&self, id: PolicyId) -> Result<bool> {
        let res = sqlx::query("DELETE FROM policy_records WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to remove policy {id}"))?;
        Ok(res.rows_affected() > 0)
    }

    async fn known_ids(&self, resource: &str) -> Result<BTreeSet<PolicyId>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM policy_records WHERE COALESCE(resource_name, $2) = $1",
        )
        .bind(resource)
        .bind(DEFAULT_RESOURCE)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list policies for {resource}"))?;
        Ok(ids.into_iter().map(PolicyId).collect())
    }

    async fn resources(&self) -> Result<BTreeSet<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT COALESCE(resource_name, $1) FROM policy_records",
        )
        .bind(DEFAULT_RESOURCE)
        .fetch_all(&self.pool)
        .await
        .context("failed to list resources")?;
        Ok(names.into_iter().collect())
    }

    async fn get_enforcement_point(
        &self,
        id: EnforcementPointId,
    ) -> Result<Option<EnforcementPoint>> {
        sqlx::query_as::<_, EnforcementPointRow>(&format!(
            "SELECT {ENFORCEMENT_POINT_COLUMNS} FROM enforcement_points WHERE id = $1 AND active"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to read enforcement point {id}"))?
        .map(EnforcementPoint::try_from)
        .transpose()
    }

    async fn get_applied(&self, id: EnforcementPointId) -> Result<Option<AppliedDistribution>> {
        sqlx::query_as::<_, AppliedRow>(&format!(
            "SELECT {APPLIED_COLUMNS} FROM applied_distributions WHERE enforcement_point_id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to read the distribution for {id}"))?
        .map(AppliedDistribution::try_from)
        .transpose()
    }

    async fn store_applied(&self, applied: &AppliedDistribution) -> Result<()> {
        let c = AppliedColumns::try_from(applied)?;
        sqlx::query(
            "INSERT INTO applied_distributions (enforcement_point_id, config, revision, policies, \
             data_sources, resync_required, acknowledged_revision, computed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (enforcement_point_id) DO UPDATE SET config = EXCLUDED.config, \
             revision = EXCLUDED.revision, policies = EXCLUDED.policies, \
             data_sources = EXCLUDED.data_sources, resync_required = EXCLUDED.resync_required, \
             acknowledged_revision = EXCLUDED.acknowledged_revision, \
             computed_at = EXCLUDED.computed_at",
        )
        .bind(c.enforcement_point_id)
        .bind(c.config)
        .bind(c.revision)
        .bind(c.policies)
        .bind(c.data_sources)
        .bind(c.resync_required)
        .bind(c.acknowledged_revision)
        .bind(c.computed_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store the distribution for {}", c.enforcement_point_id))?;
        Ok(())
    }

    async fn store_applied_if_absent(&self, applied: &AppliedDistribution) -> Result<bool> {
        let c = AppliedColumns::try_from(applied)?;
        let res = sqlx::query(
            "INSERT INTO applied_distributions (enforcement_point_id, config, revision, policies, \
             data_sources, resync_required, acknowledged_revision, computed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (enforcement_point_id) DO NOTHING",
        )
        .bind(c.enforcement_point_id)
        .bind(c.config)
        .bind(c.revision)
        .bind(c.policies)
        .bind(c.data_sources)
        .bind(c.resync_required)
        .bind(c.acknowledged_revision)
        .bind(c.computed_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store the distribution for {}", c.enforcement_point_id))?;
        Ok(res.rows_affected() == 1)
    }

    async fn acknowledge(&self, id: EnforcementPointId, revision: u64) -> Result<bool> {
        let revision = i64::try_from(revision).context("revision out of range")?;
        let res = sqlx::query(
            "UPDATE applied_distributions SET acknowledged_revision = revision, \
             resync_required = FALSE WHERE enforcement_point_id = $1 AND revision = $2",
        )
        .bind(id.0)
        .bind(revision)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to acknowledge revision {revision} for {id}"))?;
        Ok(res.rows_affected() > 0)
    }

    async fn remove_applied(&self, id: EnforcementPointId) -> Result<()> {
        sqlx::query("DELETE FROM applied_distributions WHERE enforcement_point_id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to remove the distribution for {id}"))?;
        Ok(())
    }

    async fn record_drift(&self, report: &DriftReport) -> Result<()> {
        let critical = i32::try_from(report.count(Severity::Critical)).unwrap_or(i32::MAX);
        let high = i32::try_from(report.count(Severity::High)).unwrap_or(i32::MAX);
        sqlx::query(
            "INSERT INTO drift_reports (resource, checked_at, critical, high, report) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (resource) DO UPDATE SET \
             checked_at = EXCLUDED.checked_at, critical = EXCLUDED.critical, \
             high = EXCLUDED.high, report = EXCLUDED.report",
        )
        .bind(&report.resource)
        .bind(report.checked_at)
        .bind(critical)
        .bind(high)
        .bind(serde_json::to_value(report)?)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to record drift for {}", report.resource))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MoveJournal for PgCatalog {
    async fn load(&self, record: PolicyId) -> Result<Option<MoveEntry>> {
        sqlx::query_as::<_, MoveRow>(
            "SELECT record_id, from_path, to_path, state, updated_at FROM move_journal \
             WHERE record_id = $1",
        )
        .bind(record.0)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load the move journal for policy {record}"))?
        .map(MoveEntry::try_from)
        .transpose()
    }

    async fn save(&self, entry: &MoveEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO move_journal (record_id, from_path, to_path, state, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (record_id) DO UPDATE SET from_path = EXCLUDED.from_path, \
             to_path = EXCLUDED.to_path, state = EXCLUDED.state, updated_at = EXCLUDED.updated_at",
        )
        .bind(entry.record.0)
        .bind(&entry.from)
        .bind(&entry.to)
        .bind(entry.state.as_str())
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save the move journal for policy {}", entry.record))?;
        Ok(())
    }

    async fn clear(&self, record: PolicyId) -> Result<()> {
        sqlx::query("DELETE FROM move_journal WHERE record_id = $1")
            .bind(record.0)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to clear the move journal for policy {record}"))?;
        Ok(())
    }
}
