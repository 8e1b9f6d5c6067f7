use super::*;
use chrono::{DateTime, Utc};
use maplit::btreeset;
use policy_pipeline_core::distribution::{DataSourceSelector, DistributionConfig, PolicySelector};
use policy_pipeline_store::MoveState;
use pretty_assertions::assert_eq;

async fn seed(pool: &PgPool) -> Result<()> {
    for statement in [
        "INSERT INTO policy_records (id, environment, lifecycle_stage, resource_name, content, \
         content_fingerprint) VALUES (1, 'sandbox', 'enabled', 'orders', 'package a', 'x')",
        "INSERT INTO policy_records (id, environment, lifecycle_stage, resource_name, content, \
         content_fingerprint) VALUES (2, 'sandbox', 'draft', NULL, 'package b', 'y')",
        "INSERT INTO enforcement_points (id, name, environment) VALUES (1, 'a', 'sandbox')",
        "INSERT INTO enforcement_points (id, name, environment) VALUES (2, 'b', 'production')",
        "INSERT INTO enforcement_points (id, name, environment, active) \
         VALUES (3, 'c', 'sandbox', FALSE)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn applied(id: i64, environment: Environment, revision: u64) -> AppliedDistribution {
    AppliedDistribution {
        config: DistributionConfig {
            enforcement_point: EnforcementPointId(id),
            policy_selector: PolicySelector {
                environment,
                resource_scope: None,
            },
            data_source_selector: DataSourceSelector { environment },
            cache_ttl: Duration::from_secs(30),
            rate_limit: 1000,
        },
        revision,
        policies: Default::default(),
        data_sources: Default::default(),
        resync_required: true,
        acknowledged_revision: None,
        computed_at: Utc::now(),
    }
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires a PostgreSQL DATABASE_URL"]
async fn snapshot_reads_active_points_in_one_environment(pool: PgPool) -> Result<()> {
    seed(&pool).await?;
    let catalog = PgCatalog::from_pool(pool);
    catalog.store_applied(&applied(1, Environment::Sandbox, 1)).await?;
    catalog.store_applied(&applied(2, Environment::Production, 1)).await?;
    catalog.store_applied(&applied(3, Environment::Sandbox, 5)).await?;

    let sandbox = catalog.snapshot(Environment::Sandbox).await?;
    assert_eq!(sandbox.records.len(), 2);
    assert_eq!(
        sandbox.enforcement_points.iter().map(|ep| ep.id).collect::<Vec<_>>(),
        vec![EnforcementPointId(1)]
    );
    assert_eq!(sandbox.applied.len(), 1);
    assert!(sandbox.applied.contains_key(&EnforcementPointId(1)));
    assert_eq!(sandbox.retired, btreeset! { EnforcementPointId(3) });

    let production = catalog.snapshot(Environment::Production).await?;
    assert!(production.applied.contains_key(&EnforcementPointId(2)));
    assert!(production.retired.is_empty());
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires a PostgreSQL DATABASE_URL"]
async fn first_applied_distribution_wins(pool: PgPool) -> Result<()> {
    seed(&pool).await?;
    let catalog = PgCatalog::from_pool(pool);
    assert!(catalog.store_applied_if_absent(&applied(1, Environment::Sandbox, 1)).await?);
    assert!(!catalog.store_applied_if_absent(&applied(1, Environment::Sandbox, 7)).await?);
    let stored = catalog.get_applied(EnforcementPointId(1)).await?;
    assert_eq!(stored.map(|a| a.revision), Some(1));

    catalog.store_applied(&applied(1, Environment::Sandbox, 2)).await?;
    let stored = catalog.get_applied(EnforcementPointId(1)).await?;
    assert_eq!(stored.map(|a| a.revision), Some(2));

    catalog.remove_applied(EnforcementPointId(1)).await?;
    assert_eq!(catalog.get_applied(EnforcementPointId(1)).await?, None);
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires a PostgreSQL DATABASE_URL"]
async fn acknowledge_requires_current_revision(pool: PgPool) -> Result<()> {
    seed(&pool).await?;
    let catalog = PgCatalog::from_pool(pool);
    catalog.store_applied(&applied(1, Environment::Sandbox, 3)).await?;
    assert!(!catalog.acknowledge(EnforcementPointId(1), 2).await?);
    assert!(!catalog.acknowledge(EnforcementPointId(2), 3).await?);
    assert!(catalog.acknowledge(EnforcementPointId(1), 3).await?);

    let stored = catalog
        .get_applied(EnforcementPointId(1))
        .await?
        .expect("distribution must be stored");
    assert_eq!(stored.acknowledged_revision, Some(3));
    assert!(!stored.resync_required);
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires a PostgreSQL DATABASE_URL"]
async fn records_group_by_resource_folder(pool: PgPool) -> Result<()> {
    seed(&pool).await?;
    let catalog = PgCatalog::from_pool(pool);
    assert_eq!(
        catalog.resources().await?,
        btreeset! { DEFAULT_RESOURCE.to_string(), "orders".to_string() }
    );
    assert_eq!(catalog.known_ids("orders").await?, btreeset! { PolicyId(1) });
    assert_eq!(catalog.known_ids(DEFAULT_RESOURCE).await?, btreeset! { PolicyId(2) });

    let mut record = catalog.get_record(PolicyId(2)).await?.expect("record must exist");
    record.content = "package c".to_string();
    catalog.update_record(&record).await?;
    assert_eq!(catalog.get_record(PolicyId(2)).await?.map(|r| r.content), Some(record.content.clone()));

    assert!(catalog.remove_record(PolicyId(2)).await?);
    assert!(!catalog.remove_record(PolicyId(2)).await?);
    assert!(catalog.update_record(&record).await.is_err());
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires a PostgreSQL DATABASE_URL"]
async fn drift_keeps_the_latest_report_per_resource(pool: PgPool) -> Result<()> {
    let catalog = PgCatalog::from_pool(pool.clone());
    for _ in 0..3 {
        catalog.record_drift(&DriftReport::new("orders")).await?;
    }
    catalog.record_drift(&DriftReport::new("billing")).await?;

    let rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM drift_reports")
        .fetch_one(&pool)
        .await?;
    assert_eq!(rows, 2);
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires a PostgreSQL DATABASE_URL"]
async fn move_journal_tracks_progress(pool: PgPool) -> Result<()> {
    let catalog = PgCatalog::from_pool(pool);
    let mut entry = MoveEntry::new(
        PolicyId(1),
        "policies/orders/sandbox/draft/policy_1.rego".to_string(),
        "policies/orders/sandbox/enabled/policy_1.rego".to_string(),
    );
    // Stored with microsecond precision.
    entry.updated_at = DateTime::from_timestamp(1_780_000_000, 0).expect("valid timestamp");

    assert_eq!(catalog.load(PolicyId(1)).await?, None);
    catalog.save(&entry).await?;
    assert_eq!(catalog.load(PolicyId(1)).await?, Some(entry.clone()));

    entry.state = MoveState::DestinationWritten;
    catalog.save(&entry).await?;
    assert_eq!(
        catalog.load(PolicyId(1)).await?.map(|e| e.state),
        Some(MoveState::DestinationWritten)
    );

    catalog.clear(PolicyId(1)).await?;
    assert_eq!(catalog.load(PolicyId(1)).await?, None);
    Ok(())
}
