use super::*;
use crate::memory::{MemoryRepository, Op};
use maplit::{btreemap, btreeset};
use policy_pipeline_core::{Environment, LifecycleStage};
use pretty_assertions::assert_eq;

struct Fixture {
    repo: Arc<MemoryRepository>,
    journal: Arc<MemoryJournal>,
    store: PolicyStore,
}

fn fixture() -> Fixture {
    let repo = Arc::new(MemoryRepository::default());
    let journal = Arc::new(MemoryJournal::default());
    let store = PolicyStore::new(
        repo.clone(),
        journal.clone(),
        RetryPolicy::default(),
        StoreMetrics::default(),
    );
    Fixture {
        repo,
        journal,
        store,
    }
}

fn path(id: i64, env: Environment, stage: LifecycleStage) -> RepositoryPath {
    RepositoryPath::new(ResourceName::new("orders").unwrap(), env, stage, PolicyId(id)).unwrap()
}

fn sandbox(id: i64, stage: LifecycleStage) -> RepositoryPath {
    path(id, Environment::Sandbox, stage)
}

const CONTENT: &str = "package orders\n\ndefault allow := false\n";

#[tokio::test(start_paused = true)]
async fn commit_twice_is_an_unchanged_update() {
    let Fixture { repo, store, .. } = fixture();
    let target = sandbox(1, LifecycleStage::Draft);

    let first = store.commit(PolicyId(1), CONTENT, &target, "create").await.unwrap();
    assert_eq!(first.outcome, CommitOutcome::Created);
    assert!(first.changed);

    let second = store.commit(PolicyId(1), CONTENT, &target, "again").await.unwrap();
    assert_eq!(second.outcome, CommitOutcome::Updated);
    assert!(!second.changed);
    assert_eq!(second.version, first.version);

    assert_eq!(
        repo.contents(),
        btreemap! { target.to_string() => CONTENT.to_string() }
    );
    assert_eq!(repo.calls(Op::Update), 0);
}

#[tokio::test(start_paused = true)]
async fn commit_updates_changed_content() {
    let Fixture { repo, store, .. } = fixture();
    let target = sandbox(1, LifecycleStage::Draft);
    repo.insert(target.to_string(), "package old\n");

    let res = store.commit(PolicyId(1), CONTENT, &target, "edit").await.unwrap();
    assert_eq!(res.outcome, CommitOutcome::Updated);
    assert!(res.changed);
    assert_eq!(repo.contents()[&target.to_string()], CONTENT);
}

#[tokio::test(start_paused = true)]
async fn commit_retries_transient_failures() {
    let Fixture { repo, store, .. } = fixture();
    let target = sandbox(1, LifecycleStage::Draft);
    repo.fail_next(Op::Get, StoreError::Transient("502".into()));

    let res = store.commit(PolicyId(1), CONTENT, &target, "create").await.unwrap();
    assert_eq!(res.outcome, CommitOutcome::Created);
    assert_eq!(repo.calls(Op::Get), 2);
}

#[tokio::test(start_paused = true)]
async fn commit_observes_a_lost_create_response() {
    let Fixture { repo, store, .. } = fixture();
    let target = sandbox(1, LifecycleStage::Draft);
    repo.fail_next_after_apply(Op::Create, StoreError::Transient("timeout".into()));

    let res = store.commit(PolicyId(1), CONTENT, &target, "create").await.unwrap();
    assert_eq!(res.outcome, CommitOutcome::Updated);
    assert!(!res.changed);
    assert_eq!(repo.calls(Op::Create), 1);
    assert_eq!(repo.contents().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn commit_gives_up_after_max_attempts() {
    let Fixture { repo, store, .. } = fixture();
    let target = sandbox(1, LifecycleStage::Draft);
    for _ in 0..3 {
        repo.fail_next(Op::Get, StoreError::Transient("503".into()));
    }

    let err = store
        .commit(PolicyId(1), CONTENT, &target, "create")
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(repo.calls(Op::Get), 3);
    assert!(repo.contents().is_empty());
}

#[tokio::test(start_paused = true)]
async fn commit_does_not_retry_conflicts() {
    let Fixture { repo, store, .. } = fixture();
    let target = sandbox(1, LifecycleStage::Draft);
    repo.insert(target.to_string(), "package old\n");
    repo.fail_next(Op::Update, StoreError::Conflict(target.to_string()));

    let err = store
        .commit(PolicyId(1), CONTENT, &target, "edit")
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::Conflict(target.to_string()));
    assert_eq!(repo.calls(Op::Update), 1);
}

#[tokio::test]
async fn commit_rejects_another_records_path() {
    let Fixture { repo, store, .. } = fixture();
    let err = store
        .commit(PolicyId(2), CONTENT, &sandbox(1, LifecycleStage::Draft), "create")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Path(_)));
    assert_eq!(repo.calls(Op::Get), 0);
}

#[tokio::test(start_paused = true)]
async fn move_relocates_content() {
    let Fixture { repo, journal, store } = fixture();
    let from = sandbox(1, LifecycleStage::Draft);
    let to = sandbox(1, LifecycleStage::Enabled);
    repo.insert(from.to_string(), CONTENT);

    let res = store.move_record(PolicyId(1), &from, &to, "enable").await.unwrap();
    assert!(res.changed);
    assert!(!res.resumed);
    assert_eq!(
        repo.contents(),
        btreemap! { to.to_string() => CONTENT.to_string() }
    );
    assert_eq!(journal.load(PolicyId(1)).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn move_resumes_after_failing_before_the_delete() {
    let Fixture { repo, journal, store } = fixture();
    let from = sandbox(1, LifecycleStage::Enabled);
    let to = path(1, Environment::Production, LifecycleStage::Enabled);
    repo.insert(from.to_string(), CONTENT);
    repo.fail_next(Op::Delete, StoreError::Transient("connection reset".into()));

    let err = store
        .move_record(PolicyId(1), &from, &to, "promote")
        .await
        .unwrap_err();
    assert!(matches!(err, MoveError::Store(StoreError::Transient(_))));
    assert_eq!(repo.contents().len(), 2, "content is at both locations");
    assert_eq!(
        journal.load(PolicyId(1)).await.unwrap().map(|e| e.state),
        Some(MoveState::DestinationWritten)
    );

    let res = store.move_record(PolicyId(1), &from, &to, "promote").await.unwrap();
    assert!(res.resumed);
    assert_eq!(
        repo.contents(),
        btreemap! { to.to_string() => CONTENT.to_string() }
    );
    assert_eq!(repo.calls(Op::Create), 1);
    assert_eq!(journal.load(PolicyId(1)).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn move_is_idempotent_once_complete() {
    let Fixture { repo, store, .. } = fixture();
    let from = sandbox(1, LifecycleStage::Draft);
    let to = sandbox(1, LifecycleStage::Enabled);
    repo.insert(to.to_string(), CONTENT);

    let res = store.move_record(PolicyId(1), &from, &to, "enable").await.unwrap();
    assert!(!res.changed);
    assert_eq!(repo.calls(Op::Delete), 0);
    assert_eq!(repo.calls(Op::Create), 0);
}

#[tokio::test(start_paused = true)]
async fn move_finishes_when_destination_already_matches() {
    let Fixture { repo, store, .. } = fixture();
    let from = sandbox(1, LifecycleStage::Draft);
    let to = sandbox(1, LifecycleStage::Enabled);
    repo.insert(from.to_string(), CONTENT);
    repo.insert(to.to_string(), CONTENT);

    store.move_record(PolicyId(1), &from, &to, "enable").await.unwrap();
    assert_eq!(
        repo.contents(),
        btreemap! { to.to_string() => CONTENT.to_string() }
    );
    assert_eq!(repo.calls(Op::Create) + repo.calls(Op::Update), 0);
}

#[tokio::test(start_paused = true)]
async fn move_overwrites_stale_destination() {
    let Fixture { repo, store, .. } = fixture();
    let from = sandbox(1, LifecycleStage::Draft);
    let to = sandbox(1, LifecycleStage::Enabled);
    repo.insert(from.to_string(), CONTENT);
    repo.insert(to.to_string(), "package stale\n");

    store.move_record(PolicyId(1), &from, &to, "enable").await.unwrap();
    assert_eq!(
        repo.contents(),
        btreemap! { to.to_string() => CONTENT.to_string() }
    );
}

#[tokio::test(start_paused = true)]
async fn move_of_missing_content_fails() {
    let Fixture { journal, store, .. } = fixture();
    let from = sandbox(1, LifecycleStage::Draft);
    let to = sandbox(1, LifecycleStage::Enabled);

    let err = store
        .move_record(PolicyId(1), &from, &to, "enable")
        .await
        .unwrap_err();
    assert!(matches!(err, MoveError::Missing { id: PolicyId(1), .. }));
    assert_eq!(journal.load(PolicyId(1)).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn move_refuses_to_interleave_with_an_unfinished_move() {
    let Fixture { repo, journal, store } = fixture();
    let draft = sandbox(1, LifecycleStage::Draft);
    let enabled = sandbox(1, LifecycleStage::Enabled);
    let disabled = sandbox(1, LifecycleStage::Disabled);
    repo.insert(draft.to_string(), CONTENT);
    journal
        .save(&MoveEntry::new(
            PolicyId(1),
            draft.to_string(),
            enabled.to_string(),
        ))
        .await
        .unwrap();

    let err = store
        .move_record(PolicyId(1), &draft, &disabled, "disable")
        .await
        .unwrap_err();
    match err {
        MoveError::InFlight { id, to, .. } => {
            assert_eq!(id, PolicyId(1));
            assert_eq!(to, enabled.to_string());
        }
        err => panic!("unexpected error: {err}"),
    }
    assert_eq!(repo.calls(Op::Create), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_moves_of_one_record_are_serialized() {
    let Fixture { repo, store, .. } = fixture();
    let from = sandbox(1, LifecycleStage::Draft);
    let to = sandbox(1, LifecycleStage::Enabled);
    repo.insert(from.to_string(), CONTENT);

    let (a, b) = tokio::join!(
        store.move_record(PolicyId(1), &from, &to, "enable"),
        store.move_record(PolicyId(1), &from, &to, "enable"),
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(
        repo.contents(),
        btreemap! { to.to_string() => CONTENT.to_string() }
    );
    assert_eq!(repo.calls(Op::Create), 1);
    assert_eq!(repo.calls(Op::Delete), 1);
}

#[tokio::test(start_paused = true)]
async fn delete_is_idempotent() {
    let Fixture { repo, store, .. } = fixture();
    let target = sandbox(1, LifecycleStage::Disabled);
    repo.insert(target.to_string(), CONTENT);

    assert!(store.delete(PolicyId(1), &target, "remove").await.unwrap().deleted);
    assert!(!store.delete(PolicyId(1), &target, "remove").await.unwrap().deleted);
    assert!(repo.contents().is_empty());
}

#[tokio::test(start_paused = true)]
async fn delete_failures_are_not_retried() {
    let Fixture { repo, store, .. } = fixture();
    let target = sandbox(1, LifecycleStage::Disabled);
    repo.insert(target.to_string(), CONTENT);
    repo.fail_next(Op::Delete, StoreError::Transient("503".into()));

    let err = store.delete(PolicyId(1), &target, "remove").await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(repo.calls(Op::Delete), 1);
    assert_eq!(repo.contents().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn folder_structure_reports_missing_folders() {
    let Fixture { repo, store, .. } = fixture();
    repo.insert("policies/orders/sandbox/draft/.gitkeep", "");
    repo.insert(sandbox(3, LifecycleStage::Enabled).to_string(), CONTENT);

    let report = store.validate_folder_structure("orders").await.unwrap();
    assert_eq!(report.present, vec!["sandbox/draft", "sandbox/enabled"]);
    assert_eq!(
        report.missing,
        vec!["sandbox/disabled", "production/enabled", "production/disabled"]
    );

    assert!(matches!(
        store.validate_folder_structure("../etc").await,
        Err(StoreError::Path(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn resources_are_listed_from_the_policy_root() {
    let Fixture { repo, store, .. } = fixture();
    assert!(store.list_resources().await.unwrap().is_empty());

    repo.insert(sandbox(1, LifecycleStage::Draft).to_string(), CONTENT);
    repo.insert("policies/billing/production/enabled/policy_2.rego", CONTENT);
    repo.insert("policies/README.md", "layout\n");
    assert_eq!(
        store.list_resources().await.unwrap(),
        btreeset! { "billing".to_string(), "orders".to_string() }
    );
}

#[tokio::test(start_paused = true)]
async fn drift_flags_unknown_ids_and_ignores_other_files() {
    let Fixture { repo, store, .. } = fixture();
    let enabled = sandbox(1, LifecycleStage::Enabled).to_string();
    let promoted = path(1, Environment::Production, LifecycleStage::Enabled).to_string();
    repo.insert(&enabled, CONTENT);
    repo.insert(&promoted, CONTENT);
    repo.insert("policies/orders/sandbox/draft/policy_99.rego", CONTENT);
    repo.insert("policies/orders/sandbox/draft/notes.txt", "hello");

    let report = store
        .detect_unauthorized_files("orders", &btreeset! { PolicyId(1), PolicyId(2) })
        .await
        .unwrap();

    assert_eq!(
        report.findings,
        vec![DriftFinding::new(
            "policies/orders/sandbox/draft/policy_99.rego",
            DriftKind::UnknownId { id: PolicyId(99) },
        )]
    );
    assert_eq!(report.count(Severity::Critical), 1);
    assert_eq!(report.count(Severity::High), 0);
    assert_eq!(report.duplicates, btreemap! { PolicyId(1) => vec![enabled, promoted] });
    assert_eq!(report.scanned.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn drift_flags_naming_violations() {
    let Fixture { repo, store, .. } = fixture();
    repo.insert("policies/orders/sandbox/draft/allow_all.rego", CONTENT);
    repo.insert("policies/orders/sandbox/draft/policy_abc.rego", CONTENT);
    repo.insert("policies/orders/sandbox/draft/policy_007.rego", CONTENT);
    repo.insert("policies/orders/production/enabled/nested/policy_1.rego", CONTENT);

    let report = store
        .detect_unauthorized_files("orders", &btreeset! { PolicyId(1), PolicyId(7) })
        .await
        .unwrap();

    assert_eq!(
        report.findings,
        vec![
            DriftFinding::new(
                "policies/orders/sandbox/draft/allow_all.rego",
                DriftKind::NonConforming
            ),
            DriftFinding::new(
                "policies/orders/sandbox/draft/policy_007.rego",
                DriftKind::MalformedId
            ),
            DriftFinding::new(
                "policies/orders/sandbox/draft/policy_abc.rego",
                DriftKind::MalformedId
            ),
            DriftFinding::new(
                "policies/orders/production/enabled/nested",
                DriftKind::NonConforming
            ),
        ]
    );
    assert_eq!(report.count(Severity::High), 4);
    assert!(report.duplicates.is_empty());
}

#[tokio::test(start_paused = true)]
async fn drift_of_an_empty_resource_is_clean() {
    let Fixture { store, .. } = fixture();
    let report = store
        .detect_unauthorized_files("orders", &BTreeSet::new())
        .await
        .unwrap();
    assert!(report.is_clean());
    assert_eq!(report.resource, "orders");
}

#[tokio::test(start_paused = true)]
async fn drift_surfaces_listing_failures() {
    let Fixture { repo, store, .. } = fixture();
    repo.fail_next(Op::List, StoreError::Configuration("bad credentials".into()));
    let err = store
        .detect_unauthorized_files("orders", &BTreeSet::new())
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::Configuration("bad credentials".into()));
}
