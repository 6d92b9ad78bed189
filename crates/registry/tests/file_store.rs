use std::sync::Arc;

use dispatch::{
    CiEndpoint, EventKind, JobName, Registration, RegistrationStore, RegistrationWriter,
    RepositoryName, StoreError,
};
use futures::TryStreamExt;
use registry::FileRegistrationStore;

fn registration(kind: EventKind, repo: &str, job: &str) -> Registration {
    Registration::new(
        kind,
        RepositoryName::new(repo).unwrap(),
        JobName::new(job).unwrap(),
        CiEndpoint::new("https://ci.example.com").unwrap(),
    )
}

async fn find(
    store: &FileRegistrationStore,
    kind: EventKind,
    repo: &str,
) -> Vec<Registration> {
    let repo = RepositoryName::new(repo).unwrap();
    store.find(kind, &repo).try_collect().await.unwrap()
}

#[tokio::test]
async fn missing_document_opens_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileRegistrationStore::open(dir.path().join("registry.json"))
        .await
        .unwrap();

    assert!(store.is_empty().unwrap());
    assert!(find(&store, EventKind::Push, "octo/widgets").await.is_empty());
}

#[tokio::test]
async fn find_filters_by_kind_and_repository() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileRegistrationStore::open(dir.path().join("registry.json"))
        .await
        .unwrap();
    store.upsert(registration(EventKind::Push, "octo/widgets", "build")).await.unwrap();
    store.upsert(registration(EventKind::Push, "octo/widgets", "lint")).await.unwrap();
    store.upsert(registration(EventKind::Tag, "octo/widgets", "publish")).await.unwrap();
    store.upsert(registration(EventKind::Push, "octo/gadgets", "build")).await.unwrap();

    let mut jobs: Vec<String> = find(&store, EventKind::Push, "octo/widgets")
        .await
        .into_iter()
        .map(|r| r.job_name.to_string())
        .collect();
    jobs.sort();

    assert_eq!(jobs, vec!["build", "lint"]);
    assert_eq!(store.len().unwrap(), 4);
}

#[tokio::test]
async fn upsert_replaces_by_identity() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileRegistrationStore::open(dir.path().join("registry.json"))
        .await
        .unwrap();
    let mut reg = registration(EventKind::Push, "octo/widgets", "build");
    store.upsert(reg.clone()).await.unwrap();

    reg.branch_restrictions.insert("main".into());
    store.upsert(reg.clone()).await.unwrap();

    let found = find(&store, EventKind::Push, "octo/widgets").await;
    assert_eq!(found, vec![reg]);
}

#[tokio::test]
async fn registrations_survive_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("registry.json");
    {
        let store = FileRegistrationStore::open(&path).await.unwrap();
        let mut reg = registration(EventKind::Labeled, "octo/widgets", "deploy");
        reg.label_restrictions.insert("deploy".into());
        store.upsert(reg).await.unwrap();
    }

    let reopened = FileRegistrationStore::open(&path).await.unwrap();
    let found = find(&reopened, EventKind::Labeled, "octo/widgets").await;

    assert_eq!(found.len(), 1);
    assert!(found[0].label_restrictions.contains("deploy"));

    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert!(raw["updated_at"].is_string());
    assert_eq!(raw["registrations"][0]["event_kind"], "labeled");
}

#[tokio::test]
async fn remove_reports_whether_anything_was_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileRegistrationStore::open(dir.path().join("registry.json"))
        .await
        .unwrap();
    let reg = registration(EventKind::Push, "octo/widgets", "build");
    store.upsert(reg.clone()).await.unwrap();

    assert!(store.remove(&reg.identity()).await.unwrap());
    assert!(!store.remove(&reg.identity()).await.unwrap());
    assert!(find(&store, EventKind::Push, "octo/widgets").await.is_empty());
}

#[tokio::test]
async fn legacy_documents_load_leniently() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.json");
    std::fs::write(
        &path,
        r#"{
            "updated_at": "2024-05-01T10:00:00Z",
            "registrations": [{
                "event_kind": "push",
                "repository": "octo/widgets",
                "job_name": "build",
                "ci_endpoint": "https://ci.example.com",
                "requested_params": ["branch", "retired_param"]
            }]
        }"#,
    )
    .unwrap();

    let store = FileRegistrationStore::open(&path).await.unwrap();
    let found = find(&store, EventKind::Push, "octo/widgets").await;

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].requested_params[1].name(), "retired_param");
}

#[tokio::test]
async fn corrupt_documents_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = FileRegistrationStore::open(&path).await.unwrap_err();

    assert!(matches!(err, StoreError::Corrupt(_)));
}

#[tokio::test]
async fn concurrent_upserts_are_all_kept() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.json");
    let store = Arc::new(FileRegistrationStore::open(&path).await.unwrap());

    let writers: Vec<_> = (0..16)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .upsert(registration(EventKind::Push, "octo/widgets", &format!("job-{i}")))
                    .await
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    assert_eq!(store.len().unwrap(), 16);
    let reopened = FileRegistrationStore::open(&path).await.unwrap();
    assert_eq!(reopened.len().unwrap(), 16);
}

#[tokio::test]
async fn lookups_see_the_registrations_present_when_they_started() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileRegistrationStore::open(dir.path().join("registry.json"))
        .await
        .unwrap();
    store.upsert(registration(EventKind::Push, "octo/widgets", "build")).await.unwrap();

    let repo = RepositoryName::new("octo/widgets").unwrap();
    let pending = store.find(EventKind::Push, &repo);
    store.upsert(registration(EventKind::Push, "octo/widgets", "lint")).await.unwrap();
    let seen: Vec<Registration> = pending.try_collect().await.unwrap();

    assert_eq!(seen, vec![registration(EventKind::Push, "octo/widgets", "build")]);
    assert_eq!(find(&store, EventKind::Push, "octo/widgets").await.len(), 2);
}
