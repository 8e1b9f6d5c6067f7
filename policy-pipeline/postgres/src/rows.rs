use anyhow::{Context, Result};
use chrono::{offset::Utc, DateTime};
use policy_pipeline_core::{
    distribution::{
        AppliedDistribution, DataConnection, DataConnectionId, DistributionConfig,
        EnforcementPoint, EnforcementPointId,
    },
    Fingerprint, PolicyId, PolicyRecord,
};
use policy_pipeline_store::{MoveEntry, MoveState};
use std::collections::BTreeMap;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PolicyRow {
    pub id: i64,
    pub environment: String,
    pub lifecycle_stage: String,
    pub promoted_from_sandbox: bool,
    pub resource_name: Option<String>,
    pub content: String,
    pub content_fingerprint: String,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct DataConnectionRow {
    pub id: i64,
    pub name: String,
    pub environment: String,
    pub sandbox_endpoint: Option<String>,
    pub production_endpoint: Option<String>,
    pub default_endpoint: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EnforcementPointRow {
    pub id: i64,
    pub name: String,
    pub environment: String,
    pub resource_scope: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AppliedRow {
    pub config: serde_json::Value,
    pub revision: i64,
    pub policies: serde_json::Value,
    pub data_sources: serde_json::Value,
    pub resync_required: bool,
    pub acknowledged_revision: Option<i64>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct MoveRow {
    pub record_id: i64,
    pub from_path: String,
    pub to_path: String,
    pub state: String,
    pub updated_at: DateTime<Utc>,
}

/// Column values for an applied distribution, ready to bind.
#[derive(Debug, PartialEq)]
pub(crate) struct AppliedColumns {
    pub enforcement_point_id: i64,
    pub config: serde_json::Value,
    pub revision: i64,
    pub policies: serde_json::Value,
    pub data_sources: serde_json::Value,
    pub resync_required: bool,
    pub acknowledged_revision: Option<i64>,
    pub computed_at: DateTime<Utc>,
}

// === impl PolicyRow ===

impl TryFrom<PolicyRow> for PolicyRecord {
    type Error = anyhow::Error;

    fn try_from(row: PolicyRow) -> Result<Self> {
        Ok(Self {
            id: PolicyId(row.id),
            environment: row.environment.parse()?,
            lifecycle_stage: row.lifecycle_stage.parse()?,
            promoted_from_sandbox: row.promoted_from_sandbox,
            resource_name: row.resource_name,
            content: row.content,
            content_fingerprint: Fingerprint::from_hex(row.content_fingerprint),
        })
    }
}

// === impl DataConnectionRow ===

impl TryFrom<DataConnectionRow> for DataConnection {
    type Error = anyhow::Error;

    fn try_from(row: DataConnectionRow) -> Result<Self> {
        Ok(Self {
            id: DataConnectionId(row.id),
            name: row.name,
            environment: row.environment.parse()?,
            sandbox_endpoint: row.sandbox_endpoint,
            production_endpoint: row.production_endpoint,
            default_endpoint: row.default_endpoint,
        })
    }
}

// === impl EnforcementPointRow ===

impl TryFrom<EnforcementPointRow> for EnforcementPoint {
    type Error = anyhow::Error;

    fn try_from(row: EnforcementPointRow) -> Result<Self> {
        Ok(Self {
            id: EnforcementPointId(row.id),
            name: row.name,
            environment: row.environment.parse()?,
            resource_scope: row.resource_scope,
        })
    }
}

// === impl AppliedRow ===

impl TryFrom<AppliedRow> for AppliedDistribution {
    type Error = anyhow::Error;

    fn try_from(row: AppliedRow) -> Result<Self> {
        let config: DistributionConfig =
            serde_json::from_value(row.config).context("invalid distribution config")?;
        let policies: BTreeMap<PolicyId, Fingerprint> =
            serde_json::from_value(row.policies).context("invalid applied policies")?;
        let data_sources: BTreeMap<DataConnectionId, String> =
            serde_json::from_value(row.data_sources).context("invalid applied data sources")?;
        Ok(Self {
            config,
            revision: u64::try_from(row.revision).context("negative revision")?,
            policies,
            data_sources,
            resync_required: row.resync_required,
            acknowledged_revision: row
                .acknowledged_revision
                .map(u64::try_from)
                .transpose()
                .context("negative acknowledged revision")?,
            computed_at: row.computed_at,
        })
    }
}

// === impl AppliedColumns ===

impl TryFrom<&AppliedDistribution> for AppliedColumns {
    type Error = anyhow::Error;

    fn try_from(applied: &AppliedDistribution) -> Result<Self> {
        Ok(Self {
            enforcement_point_id: applied.config.enforcement_point.0,
            config: serde_json::to_value(&applied.config)?,
            revision: i64::try_from(applied.revision).context("revision out of range")?,
            policies: serde_json::to_value(&applied.policies)?,
            data_sources: serde_json::to_value(&applied.data_sources)?,
            resync_required: applied.resync_required,
            acknowledged_revision: applied
                .acknowledged_revision
                .map(i64::try_from)
                .transpose()
                .context("acknowledged revision out of range")?,
            computed_at: applied.computed_at,
        })
    }
}

// === impl MoveRow ===

impl TryFrom<MoveRow> for MoveEntry {
    type Error = anyhow::Error;

    fn try_from(row: MoveRow) -> Result<Self> {
        Ok(Self {
            record: PolicyId(row.record_id),
            from: row.from_path,
            to: row.to_path,
            state: row.state.parse::<MoveState>()?,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use policy_pipeline_core::{
        distribution::{DataSourceSelector, PolicySelector},
        Environment, EnvironmentScope, LifecycleStage,
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn policy_row(environment: &str, stage: &str) -> PolicyRow {
        PolicyRow {
            id: 7,
            environment: environment.to_string(),
            lifecycle_stage: stage.to_string(),
            promoted_from_sandbox: true,
            resource_name: Some("orders".to_string()),
            content: "package orders\n".to_string(),
            content_fingerprint: Fingerprint::of("package orders\n").to_string(),
        }
    }

    #[test]
    fn maps_policy_rows() {
        let record = PolicyRecord::try_from(policy_row("both", "enabled")).unwrap();
        assert_eq!(record.id, PolicyId(7));
        assert_eq!(record.environment, EnvironmentScope::Both);
        assert_eq!(record.lifecycle_stage, LifecycleStage::Enabled);
        assert_eq!(record.content_fingerprint, Fingerprint::of("package orders\n"));
        assert!(record.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_enumerations() {
        assert!(PolicyRecord::try_from(policy_row("staging", "enabled")).is_err());
        assert!(PolicyRecord::try_from(policy_row("sandbox", "archived")).is_err());
    }

    #[test]
    fn enforcement_points_belong_to_one_environment() {
        let row = |environment: &str| EnforcementPointRow {
            id: 3,
            name: "edge".to_string(),
            environment: environment.to_string(),
            resource_scope: None,
        };
        let ep = EnforcementPoint::try_from(row("production")).unwrap();
        assert_eq!(ep.environment, Environment::Production);
        assert!(EnforcementPoint::try_from(row("both")).is_err());
    }

    #[test]
    fn applied_distributions_survive_storage() {
        let applied = AppliedDistribution {
            config: DistributionConfig {
                enforcement_point: EnforcementPointId(3),
                policy_selector: PolicySelector {
                    environment: Environment::Production,
                    resource_scope: Some("orders".to_string()),
                },
                data_source_selector: DataSourceSelector {
                    environment: Environment::Production,
                },
                cache_ttl: Duration::from_secs(300),
                rate_limit: 100,
            },
            revision: 4,
            policies: btreemap! { PolicyId(7) => Fingerprint::of("package orders\n") },
            data_sources: btreemap! { DataConnectionId(2) => "https://ledger.internal".to_string() },
            resync_required: true,
            acknowledged_revision: Some(3),
            computed_at: Utc::now(),
        };

        let columns = AppliedColumns::try_from(&applied).unwrap();
        assert_eq!(columns.enforcement_point_id, 3);
        assert_eq!(columns.revision, 4);

        let row = AppliedRow {
            config: columns.config,
            revision: columns.revision,
            policies: columns.policies,
            data_sources: columns.data_sources,
            resync_required: columns.resync_required,
            acknowledged_revision: columns.acknowledged_revision,
            computed_at: columns.computed_at,
        };
        assert_eq!(AppliedDistribution::try_from(row).unwrap(), applied);
    }

    #[test]
    fn maps_journal_rows() {
        let entry = MoveEntry::try_from(MoveRow {
            record_id: 7,
            from_path: "policies/orders/sandbox/enabled/policy_7.rego".to_string(),
            to_path: "policies/orders/production/enabled/policy_7.rego".to_string(),
            state: "destination_written".to_string(),
            updated_at: Utc::now(),
        })
        .unwrap();
        assert_eq!(entry.state, MoveState::DestinationWritten);

        assert!(MoveEntry::try_from(MoveRow {
            record_id: 7,
            from_path: String::new(),
            to_path: String::new(),
            state: "rolled_back".to_string(),
            updated_at: Utc::now(),
        })
        .is_err());
    }
}
