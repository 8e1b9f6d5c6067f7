use super::*;
use policy_pipeline_core::{
    distribution::{DiscoverDistribution, EnforcementPoint, EnforcementPointId},
    MemoryCatalog,
};
use policy_pipeline_planner::PlannerMetrics;
use policy_pipeline_store::{
    memory::{MemoryRepository, Op},
    MemoryJournal, RetryPolicy, StoreError, StoreMetrics,
};
use policy_pipeline_validator::{ValidationStatus, ValidatorConfig, ValidatorMetrics};
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use tempfile::TempDir;

const TOOL: &str = r#"[ "$1" = version ] && { echo "fake-lint 2.0.0"; exit 0; }
if grep -q shadow "$3"; then
  echo '{"violations":[{"level":"error","title":"rule-shadows-builtin","location":{"row":2,"col":1}}]}'
  exit 3
fi
echo '{"violations":[]}'
"#;

const DRAFT: &str = "package orders\n";
const CONTENT: &str = "package orders\n\ndefault allow := false\n";

struct Fixture {
    catalog: Arc<MemoryCatalog>,
    repo: Arc<MemoryRepository>,
    planner: Arc<Planner>,
    pipeline: AuthoringPipeline,
    _tool: TempDir,
}

async fn fixture() -> Fixture {
    let catalog = Arc::new(MemoryCatalog::default());
    for (id, environment) in [(1, Environment::Sandbox), (2, Environment::Production)] {
        catalog.insert_enforcement_point(EnforcementPoint {
            id: EnforcementPointId(id),
            name: format!("orders-{environment}"),
            environment,
            resource_scope: Some("orders".to_string()),
        });
    }
    catalog.insert_record(PolicyRecord::draft(
        1,
        Some("orders".to_string()),
        DRAFT.to_string(),
    ));

    let planner = Arc::new(Planner::new(catalog.clone(), PlannerMetrics::default()));
    for id in [1, 2] {
        planner.register(EnforcementPointId(id)).await.unwrap();
    }

    let repo = Arc::new(MemoryRepository::default());
    let store = Arc::new(PolicyStore::new(
        repo.clone(),
        Arc::new(MemoryJournal::default()),
        RetryPolicy::none(),
        StoreMetrics::default(),
    ));

    let tool = TempDir::new().unwrap();
    let script = tool.path().join("tool.sh");
    std::fs::write(&script, TOOL).unwrap();
    let validator = Validator::new(
        ValidatorConfig {
            tool: PathBuf::from("/bin/sh"),
            tool_args: vec![script.display().to_string()],
            ..ValidatorConfig::default()
        },
        ValidatorMetrics::default(),
    )
    .unwrap();

    let pipeline = AuthoringPipeline::new(catalog.clone(), store, validator, planner.clone());
    Fixture {
        catalog,
        repo,
        planner,
        pipeline,
        _tool: tool,
    }
}

async fn record(catalog: &MemoryCatalog, id: i64) -> Option<PolicyRecord> {
    catalog.get_record(PolicyId(id)).await.unwrap()
}

async fn distributed(planner: &Planner, ep: i64) -> Vec<PolicyId> {
    planner
        .reader()
        .get_distribution(EnforcementPointId(ep))
        .await
        .unwrap()
        .unwrap()
        .policies
        .into_iter()
        .map(|p| p.id)
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_stores_content_then_records_it() {
    let Fixture {
        catalog,
        repo,
        pipeline,
        _tool, ..
    } = fixture().await;

    let submitted = pipeline.submit(PolicyId(1), CONTENT.to_string()).await.unwrap();
    assert_eq!(submitted.path, "policies/orders/sandbox/draft/policy_1.rego");
    assert!(submitted.changed);
    assert_eq!(submitted.validation.status, ValidationStatus::Valid);
    assert_eq!(
        repo.contents().get("policies/orders/sandbox/draft/policy_1.rego").map(String::as_str),
        Some(CONTENT)
    );

    let stored = record(&catalog, 1).await.unwrap();
    assert_eq!(stored.content, CONTENT);
    assert_eq!(stored, submitted.record);
    assert!(stored.validate().is_ok());

    let again = pipeline.submit(PolicyId(1), CONTENT.to_string()).await.unwrap();
    assert!(!again.changed);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_content_changes_nothing() {
    let Fixture {
        catalog,
        repo,
        pipeline,
        _tool, ..
    } = fixture().await;

    let error = pipeline
        .submit(PolicyId(1), "package orders\nshadowed := input\n".to_string())
        .await
        .unwrap_err();
    assert_eq!(error.stage, Stage::Validate);
    let rejection = error.rejection().expect("must carry the verdict");
    assert_eq!(rejection.status, ValidationStatus::Invalid);
    assert_eq!(rejection.findings[0].message, "rule-shadows-builtin");
    assert_eq!(
        error.source.to_string(),
        "policy is invalid with 1 error(s)"
    );

    assert!(repo.contents().is_empty());
    assert_eq!(record(&catalog, 1).await.unwrap().content, DRAFT);
}

#[tokio::test(flavor = "multi_thread")]
async fn repository_failures_leave_the_record_unchanged() {
    let Fixture {
        catalog,
        repo,
        pipeline,
        _tool, ..
    } = fixture().await;

    repo.fail_next(Op::Create, StoreError::Transient("502 bad gateway".to_string()));
    let error = pipeline
        .submit(PolicyId(1), CONTENT.to_string())
        .await
        .unwrap_err();
    assert_eq!(error.stage, Stage::Commit);
    assert!(error.rejection().is_none());
    assert_eq!(record(&catalog, 1).await.unwrap().content, DRAFT);

    pipeline.submit(PolicyId(1), CONTENT.to_string()).await.unwrap();
    repo.fail_next(Op::Create, StoreError::Conflict("policy_1.rego".to_string()));
    let error = pipeline
        .transition(PolicyId(1), LifecycleStage::Enabled)
        .await
        .unwrap_err();
    assert_eq!(error.stage, Stage::Move);
    assert_eq!(
        record(&catalog, 1).await.unwrap().lifecycle_stage,
        LifecycleStage::Draft
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn enabled_policies_are_promoted_to_production() {
    let Fixture {
        catalog,
        repo,
        planner,
        pipeline,
        _tool, ..
    } = fixture().await;

    pipeline.submit(PolicyId(1), CONTENT.to_string()).await.unwrap();
    assert!(distributed(&planner, 1).await.is_empty());

    let moved = pipeline
        .transition(PolicyId(1), LifecycleStage::Enabled)
        .await
        .unwrap();
    assert_eq!(moved.to, "policies/orders/sandbox/enabled/policy_1.rego");
    assert_eq!(distributed(&planner, 1).await, vec![PolicyId(1)]);
    assert!(distributed(&planner, 2).await.is_empty());

    let promoted = pipeline.promote(PolicyId(1)).await.unwrap();
    assert_eq!(promoted.from, "policies/orders/sandbox/enabled/policy_1.rego");
    assert_eq!(promoted.to, "policies/orders/production/enabled/policy_1.rego");
    assert_eq!(
        repo.contents().keys().cloned().collect::<Vec<_>>(),
        vec!["policies/orders/production/enabled/policy_1.rego".to_string()]
    );

    let stored = record(&catalog, 1).await.unwrap();
    assert_eq!(stored.environment, EnvironmentScope::Production);
    assert!(stored.promoted_from_sandbox);
    assert_eq!(distributed(&planner, 2).await, vec![PolicyId(1)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn only_enabled_sandbox_policies_are_promoted() {
    let Fixture {
        catalog,
        repo,
        pipeline,
        _tool, ..
    } = fixture().await;

    pipeline.submit(PolicyId(1), CONTENT.to_string()).await.unwrap();
    let error = pipeline.promote(PolicyId(1)).await.unwrap_err();
    assert_eq!(error.stage, Stage::Validate);
    assert_eq!(
        repo.contents().keys().cloned().collect::<Vec<_>>(),
        vec!["policies/orders/sandbox/draft/policy_1.rego".to_string()]
    );
    assert_eq!(
        record(&catalog, 1).await.unwrap().environment,
        EnvironmentScope::Sandbox
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn removal_deletes_the_file_then_the_record() {
    let Fixture {
        catalog,
        repo,
        pipeline,
        _tool, ..
    } = fixture().await;

    pipeline.submit(PolicyId(1), CONTENT.to_string()).await.unwrap();
    let removed = pipeline.remove(PolicyId(1)).await.unwrap();
    assert!(removed.deleted);
    assert!(repo.contents().is_empty());
    assert_eq!(record(&catalog, 1).await, None);

    let error = pipeline.remove(PolicyId(1)).await.unwrap_err();
    assert_eq!(error.stage, Stage::Catalog);
    assert!(error.is_unknown_policy());
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_failures_keep_the_record() {
    let Fixture {
        catalog,
        repo,
        pipeline,
        _tool, ..
    } = fixture().await;

    pipeline.submit(PolicyId(1), CONTENT.to_string()).await.unwrap();
    repo.fail_next(Op::Delete, StoreError::Transient("timeout".to_string()));
    let error = pipeline.remove(PolicyId(1)).await.unwrap_err();
    assert_eq!(error.stage, Stage::Delete);
    assert!(record(&catalog, 1).await.is_some());
    assert_eq!(repo.contents().len(), 1);
}

#[test]
fn errors_name_the_failed_stage() {
    let error = PipelineError {
        record: PolicyId(4),
        stage: Stage::Move,
        source: anyhow!("policy 4 has an unfinished move"),
    };
    assert_eq!(
        error.to_string(),
        "move failed for policy 4: policy 4 has an unfinished move"
    );
}
