use std::{collections::BTreeSet, fs, path::Path, sync::Arc};

use stash::{
    catalog::CatalogStore,
    db,
    engine::{
        delivery::{DeliveryError, DeliveryService},
        reconciler::{FsChange, Reconciler},
        scanner::{walk_root, ScanOptions},
    },
    models::{FileKey, Identity},
};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

async fn setup(root: &Path, owner: &str) -> (Arc<Reconciler>, DeliveryService, db::DbHandle) {
    let db = db::init_memory().await.unwrap();
    let store: Arc<dyn CatalogStore> = Arc::new(db.clone());
    let reconciler = Arc::new(Reconciler::new(store.clone(), root.to_path_buf(), ScanOptions::default(), owner));
    let delivery = DeliveryService::new(store, root.to_path_buf());
    (reconciler, delivery, db)
}

fn disk_keys(root: &Path) -> BTreeSet<FileKey> {
    walk_root(root, &ScanOptions::default(), &CancellationToken::new()).unwrap().files
}

#[tokio::test]
async fn catalog_follows_disk_and_serves_owner() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    fs::create_dir_all(root.join("docs")).unwrap();
    fs::create_dir_all(root.join("images")).unwrap();
    fs::write(root.join("docs/readme.txt"), "0123456789").unwrap();
    fs::write(root.join("images/a.png"), vec![0u8; 500]).unwrap();

    let (reconciler, delivery, db) = setup(root, "u1").await;

    let report = reconciler.reconcile().await.unwrap();
    assert_eq!(report.added.len(), 2);
    assert_eq!(db.list_all().await.unwrap(), disk_keys(root));

    let file = delivery.deliver(&Identity::new("u1"), "docs", "readme.txt").await.unwrap();
    assert_eq!(file.size, 10);
    let mut bytes = Vec::new();
    file.into_reader().read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes, b"0123456789");

    let err = delivery.deliver(&Identity::new("u2"), "docs", "readme.txt").await.unwrap_err();
    assert!(matches!(err, DeliveryError::NotFound));

    // removed on disk but not yet reconciled
    fs::remove_file(root.join("images/a.png")).unwrap();
    let err = delivery.deliver(&Identity::new("u1"), "images", "a.png").await.unwrap_err();
    assert!(matches!(err, DeliveryError::StaleCatalogEntry(_)));

    let report = reconciler.reconcile().await.unwrap();
    assert_eq!(report.removed, vec![FileKey::new("images", "a.png")]);
    assert_eq!(db.list_all().await.unwrap(), [FileKey::new("docs", "readme.txt")].into_iter().collect());

    let err = delivery.deliver(&Identity::new("u1"), "images", "a.png").await.unwrap_err();
    assert!(matches!(err, DeliveryError::NotFound));

    assert!(reconciler.reconcile().await.unwrap().is_noop());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_passes_and_events_converge() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    for dir in ["a", "b", "c"] {
        fs::create_dir_all(root.join(dir)).unwrap();
        for i in 0..10 {
            fs::write(root.join(dir).join(format!("{i}.txt")), "x").unwrap();
        }
    }
    let (reconciler, _delivery, db) = setup(root, "admin").await;
    reconciler.reconcile().await.unwrap();

    // settle the disk: drop folder b, add folder d
    fs::remove_dir_all(root.join("b")).unwrap();
    fs::create_dir_all(root.join("d")).unwrap();
    for i in 0..10 {
        fs::write(root.join("d").join(format!("{i}.txt")), "x").unwrap();
    }

    let mut events = Vec::new();
    for i in 0..10 {
        events.push(FsChange::Removed(FileKey::new("b", format!("{i}.txt"))));
        events.push(FsChange::Created(FileKey::new("d", format!("{i}.txt"))));
    }
    // duplicated and reversed delivery of the same notifications
    let mut replay = events.clone();
    replay.reverse();
    events.extend(replay);

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let reconciler = reconciler.clone();
        tasks.push(tokio::spawn(async move {
            reconciler.reconcile().await.unwrap();
        }));
    }
    for chunk in events.chunks(5) {
        let reconciler = reconciler.clone();
        let chunk = chunk.to_vec();
        tasks.push(tokio::spawn(async move {
            for change in &chunk {
                reconciler.apply(change).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(db.list_all().await.unwrap(), disk_keys(root));
}
