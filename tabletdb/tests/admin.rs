//! The admin CLI path against persisted instance state: what a
//! `tabletdb admin --data-dir ...` invocation does after a standalone
//! instance saved its state there.

use std::sync::Arc;
use std::time::Duration;

use tabletdb::admin::{run_fate, store_admitted};
use tabletdb::cli::FateArgs;
use tabletdb::standalone::{open_stores, persist_stores, StandaloneInstance};
use tabletdb_common::{FateInstanceType, SystemConfig};
use tabletdb_coordination::paths;
use tabletdb_fate::{FateStore, TStatus, ZooKv};
use tabletdb_manager::upgrade::prepare_upgrade;
use tabletdb_manager::Step;
use tabletdb_metadata::InMemoryAmple;

fn fate_args() -> FateArgs {
    FateArgs {
        summary: false,
        print: false,
        json: false,
        states: Vec::new(),
        instance_type: None,
        cancel: false,
        fail: false,
        delete: false,
        fate_ids: Vec::new(),
    }
}

fn user_store(ample: &InMemoryAmple) -> FateStore<Step> {
    FateStore::new(ample.system_kv(), FateInstanceType::User)
}

#[tokio::test]
async fn admin_sees_transactions_persisted_by_an_instance() {
    let dir = tempfile::tempdir().unwrap();
    let instance = StandaloneInstance::start(
        dir.path(),
        1,
        SystemConfig {
            table_suspend_duration: Duration::ZERO,
            ..SystemConfig::default()
        },
    )
    .await
    .unwrap();

    // the instance leaves a NEW transaction behind and saves its state
    let left_behind = instance
        .manager
        .user_fate()
        .store()
        .create()
        .await
        .unwrap();
    instance.persist().unwrap();

    // a separate "process": open the same data dir and summarize
    let (_, ample) = open_stores(dir.path()).unwrap();
    let store = user_store(&ample);
    let mut args = fate_args();
    args.summary = true;
    let outcome = run_fate(&args, &store).await.unwrap();
    assert_eq!(outcome.exit_code, 0);
    let text = outcome.output.join("\n");
    assert!(text.contains("NEW"), "{text}");

    let listed = store.list().await.unwrap();
    assert!(listed.contains(&left_behind));
}

#[tokio::test]
async fn admin_mutations_survive_reopening_the_state() {
    let dir = tempfile::tempdir().unwrap();

    // seed state directly through the persistence helpers
    let (coordination, ample) = open_stores(dir.path()).unwrap();
    let store = user_store(&ample);
    let id = store.create().await.unwrap();
    persist_stores(dir.path(), &coordination, &ample).unwrap();

    // invocation one: cancel, then persist (as main does for mutations)
    let (coordination, ample) = open_stores(dir.path()).unwrap();
    let store = user_store(&ample);
    let mut args = fate_args();
    args.cancel = true;
    args.fate_ids = vec![id.to_string()];
    let outcome = run_fate(&args, &store).await.unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.output[0].contains("cancelled"));
    persist_stores(dir.path(), &coordination, &ample).unwrap();

    // invocation two: the cancellation is still there
    let (_, ample) = open_stores(dir.path()).unwrap();
    let store = user_store(&ample);
    assert_eq!(store.status(&id).await.unwrap(), Some(TStatus::Failed));
}

#[tokio::test]
async fn upgrade_prepare_works_over_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let (coordination, ample) = open_stores(dir.path()).unwrap();
    let store = user_store(&ample);
    let meta_store: FateStore<Step> = FateStore::new(
        Arc::new(ZooKv::new(Arc::new(coordination.clone()), paths::FATE_ROOT)),
        FateInstanceType::Meta,
    );

    // a lingering transaction blocks the upgrade
    let id = store.create().await.unwrap();
    assert!(
        prepare_upgrade(Arc::new(coordination.clone()), &meta_store, &store)
            .await
            .is_err()
    );

    // delete it through the admin surface, then the upgrade goes through
    let mut args = fate_args();
    args.delete = true;
    args.fate_ids = vec![id.to_string()];
    let outcome = run_fate(&args, &store).await.unwrap();
    assert_eq!(outcome.exit_code, 0);
    prepare_upgrade(Arc::new(coordination.clone()), &meta_store, &store)
        .await
        .unwrap();
    persist_stores(dir.path(), &coordination, &ample).unwrap();

    // the marker survives a reopen
    let (coordination, _) = open_stores(dir.path()).unwrap();
    use tabletdb_coordination::store::CoordinationStore;
    assert!(coordination
        .exists(paths::PREPARE_FOR_UPGRADE)
        .await
        .unwrap());
}

#[test]
fn type_filter_controls_which_stores_run() {
    assert!(store_admitted(None, FateInstanceType::User));
    assert!(store_admitted(Some("user"), FateInstanceType::User));
    assert!(!store_admitted(Some("META"), FateInstanceType::User));
}
