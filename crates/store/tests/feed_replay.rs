#![forbid(unsafe_code)]

use berth_core::{ChangeKind, Kind, ObjectRef, Record, RecordMeta, RegistrySpec, Spec, UserSpec};
use berth_store::{Coalescer, MemoryStore, RecordStore, StoreError};

fn registry(name: &str, url: &str) -> Record {
    Record::new(
        RecordMeta::new("ns", name),
        Spec::Registry(RegistrySpec { parent: "inst1".into(), url: url.into(), ..Default::default() }),
    )
}

fn user(name: &str) -> Record {
    Record::new(
        RecordMeta::new("ns", name),
        Spec::User(UserSpec { parent: "inst1".into(), email: format!("{}@example.com", name), ..Default::default() }),
    )
}

#[tokio::test]
async fn bursts_of_edits_coalesce_to_one_key_each() {
    let (store, mut feed) = MemoryStore::with_feed();
    for i in 0..5 {
        store.put(registry("r1", &format!("https://r{}.example.com", i)));
    }
    store.put(user("alice"));
    store.put(registry("r2", "https://hub.docker.com"));
    store.put(user("alice"));

    let mut q = Coalescer::with_capacity(16);
    while let Ok(n) = feed.try_recv() {
        q.push(n.target);
    }
    assert_eq!(
        std::iter::from_fn(|| q.pop_where(|_| true)).collect::<Vec<_>>(),
        vec![
            ObjectRef::new(Kind::Registry, "ns", "r1"),
            ObjectRef::new(Kind::User, "ns", "alice"),
            ObjectRef::new(Kind::Registry, "ns", "r2"),
        ]
    );
    let r1 = store.snapshot(&ObjectRef::new(Kind::Registry, "ns", "r1")).unwrap();
    assert_eq!(r1.metadata.generation, Some(5));
}

#[tokio::test]
async fn identical_put_keeps_generation() {
    let store = MemoryStore::new();
    store.put(registry("r1", "https://a"));
    let again = store.put(registry("r1", "https://a"));
    assert_eq!(again.metadata.generation, Some(1));
}

#[tokio::test]
async fn status_writes_are_silent_and_counted() {
    let (store, mut feed) = MemoryStore::with_feed();
    let mut rec = store.put(registry("r1", "https://a"));
    let _ = feed.try_recv();
    rec.status.message = "hello".into();
    let rec = store.update_status(&rec).await.unwrap();
    assert!(feed.try_recv().is_err());
    assert_eq!(store.status_write_count(), 1);
    assert_eq!(store.update_count(), 0);
    assert_eq!(rec.status.message, "hello");
}

#[tokio::test]
async fn deleting_without_finalizers_removes_at_once() {
    let (store, mut feed) = MemoryStore::with_feed();
    store.put(registry("r1", "https://a"));
    let target = ObjectRef::new(Kind::Registry, "ns", "r1");
    assert!(store.request_delete(&target));
    assert!(!store.contains(&target));
    assert!(!store.request_delete(&target));
    let changes: Vec<ChangeKind> = std::iter::from_fn(|| feed.try_recv().ok()).map(|n| n.change).collect();
    assert_eq!(changes, vec![ChangeKind::Applied, ChangeKind::Removed]);
    let rec = registry("r1", "https://a");
    assert!(matches!(store.update(&rec).await, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn list_is_scoped_and_sorted() {
    let store = MemoryStore::new();
    store.put(registry("zeta", "https://z"));
    store.put(registry("alpha", "https://a"));
    store.put(user("alpha"));
    let mut other = registry("beta", "https://b");
    other.metadata.namespace = "other".into();
    store.put(other);
    let names: Vec<String> =
        store.list(Kind::Registry, "ns").await.unwrap().into_iter().map(|r| r.metadata.name).collect();
    assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
}
