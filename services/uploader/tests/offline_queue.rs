//! End-to-end behaviour against an in-process receiver.

use chrono::{TimeZone, Utc};
use media_receiver::ServerConfig;
use media_uploader::config::{EndpointConfig, StoreConfig};
use media_uploader::{
    Connectivity, ConnectivityMonitor, DrainOutcome, DurableStore, FailureKind, HttpTransport,
    MediaRecord, Phase, QueueEngine, RecordId, SqliteStore, StatusEvent, SubmitOutcome,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

struct Receiver {
    url: String,
    upload_dir: PathBuf,
}

async fn spawn_receiver(dir: &Path) -> Receiver {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let config = ServerConfig {
        public_base_url: base.clone(),
        upload_dir: dir.join("uploads"),
        ..ServerConfig::default()
    };

    let router = media_receiver::create_router(&config);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    Receiver {
        url: format!("{base}/upload"),
        upload_dir: config.upload_dir,
    }
}

fn transport(url: &str, field_name: &str) -> Arc<HttpTransport> {
    let config = EndpointConfig {
        url: url.to_string(),
        field_name: field_name.to_string(),
        request_timeout_secs: 5,
        connect_timeout_secs: 1,
    };
    Arc::new(HttpTransport::new(&config, Duration::from_secs(5), Duration::from_secs(1)).unwrap())
}

async fn sqlite_store(dir: &TempDir) -> Arc<SqliteStore> {
    let config = StoreConfig {
        database_url: format!("sqlite://{}", dir.path().join("queue.db").display()),
        ..StoreConfig::default()
    };
    Arc::new(SqliteStore::new(&config).await.unwrap())
}

async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}/upload")
}

async fn next_delivered(events: &mut broadcast::Receiver<StatusEvent>) -> String {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let StatusEvent::Delivered { filename, .. } = events.recv().await.unwrap() {
                return filename;
            }
        }
    })
    .await
    .expect("timed out waiting for a delivery")
}

fn stored_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[tokio::test]
async fn test_offline_capture_is_delivered_after_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = spawn_receiver(dir.path()).await;
    let store = sqlite_store(&dir).await;

    let engine = Arc::new(
        QueueEngine::open(
            store.clone(),
            transport(&receiver.url, "mediaFile"),
            ConnectivityMonitor::new(Connectivity::Offline),
        )
        .await
        .unwrap(),
    );
    let _subscription = engine.watch_connectivity();
    let mut events = engine.subscribe();

    let image = vec![0xAB; 10 * 1024];
    let outcome = engine.submit(image.clone(), "image/png", Some("X.png")).await;
    assert!(matches!(outcome, SubmitOutcome::Queued { persisted: true, .. }));

    let persisted = store.load().await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].filename, "X.png");

    engine.connectivity().set(Connectivity::Online);
    assert_eq!(next_delivered(&mut events).await, "X.png");

    assert!(store.load().await.unwrap().is_empty());
    let files = stored_files(&receiver.upload_dir);
    assert_eq!(files.len(), 1);
    assert!(files[0].ends_with("-X.png"));
    assert_eq!(std::fs::read(receiver.upload_dir.join(&files[0])).unwrap(), image);
}

#[tokio::test]
async fn test_rejected_upload_is_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = spawn_receiver(dir.path()).await;
    let store = sqlite_store(&dir).await;

    // the receiver answers 400 when the file is not under its field
    let engine = QueueEngine::open(
        store.clone(),
        transport(&receiver.url, "attachment"),
        ConnectivityMonitor::new(Connectivity::Online),
    )
    .await
    .unwrap();

    let outcome = engine.submit(b"not media".to_vec(), "text/plain", Some("Y.txt")).await;

    assert!(matches!(
        outcome,
        SubmitOutcome::Failed {
            reason: FailureKind::Rejected,
            ..
        }
    ));
    assert!(store.load().await.unwrap().is_empty());
    assert_eq!(engine.pending().await, 0);
    assert_eq!(engine.status().phase, Phase::Failed);
}

#[tokio::test]
async fn test_connection_failure_falls_back_to_queue() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;

    let engine = QueueEngine::open(
        store.clone(),
        transport(&closed_port_url().await, "mediaFile"),
        ConnectivityMonitor::new(Connectivity::Online),
    )
    .await
    .unwrap();

    let outcome = engine.submit(b"zzz".to_vec(), "image/jpeg", Some("Z.jpg")).await;

    assert!(matches!(outcome, SubmitOutcome::Queued { persisted: true, .. }));
    let persisted = store.load().await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].filename, "Z.jpg");
    assert_eq!(persisted[0].content_type, "image/jpeg");
}

#[tokio::test]
async fn test_restart_replays_persisted_queue_oldest_first() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = spawn_receiver(dir.path()).await;

    {
        let store = sqlite_store(&dir).await;
        let queued: Vec<MediaRecord> = [(1_000, "A.png"), (2_000, "B.png")]
            .into_iter()
            .map(|(id, name)| {
                MediaRecord::new(
                    RecordId(id),
                    name.as_bytes(),
                    "image/png",
                    Some(name),
                    Utc.timestamp_millis_opt(id).unwrap(),
                )
            })
            .collect();
        store.save(&queued).await.unwrap();
    }

    let store = sqlite_store(&dir).await;
    let engine = Arc::new(
        QueueEngine::open(
            store.clone(),
            transport(&receiver.url, "mediaFile"),
            ConnectivityMonitor::new(Connectivity::Offline),
        )
        .await
        .unwrap(),
    );
    assert_eq!(engine.pending().await, 2);

    let _subscription = engine.watch_connectivity();
    let mut events = engine.subscribe();
    engine.connectivity().set(Connectivity::Online);

    assert_eq!(next_delivered(&mut events).await, "A.png");
    assert_eq!(next_delivered(&mut events).await, "B.png");
    assert!(store.load().await.unwrap().is_empty());
    assert_eq!(engine.drain().await, DrainOutcome::Idle);
}

#[tokio::test]
async fn test_endpoint_outage_stops_drain_and_keeps_queue() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;

    let engine = QueueEngine::open(
        store.clone(),
        transport(&closed_port_url().await, "mediaFile"),
        ConnectivityMonitor::new(Connectivity::Offline),
    )
    .await
    .unwrap();

    engine.submit(b"a".to_vec(), "image/png", Some("A.png")).await;
    engine.submit(b"b".to_vec(), "image/png", Some("B.png")).await;
    let before = store.load().await.unwrap();

    // the platform believes it is online but the endpoint is unreachable
    engine.connectivity().set(Connectivity::Online);
    let outcome = engine.drain().await;

    assert_eq!(
        outcome,
        DrainOutcome::Stopped {
            delivered: 0,
            remaining: 2,
            reason: FailureKind::Network
        }
    );
    assert_eq!(store.load().await.unwrap(), before);
}

#[tokio::test]
async fn test_rejected_replay_is_dropped_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = spawn_receiver(dir.path()).await;
    let store = sqlite_store(&dir).await;

    // the receiver refuses every request sent under the wrong field
    let engine = QueueEngine::open(
        store.clone(),
        transport(&receiver.url, "attachment"),
        ConnectivityMonitor::new(Connectivity::Offline),
    )
    .await
    .unwrap();

    engine.submit(b"a".to_vec(), "image/png", Some("A.png")).await;
    engine.connectivity().set(Connectivity::Online);

    assert_eq!(
        engine.drain().await,
        DrainOutcome::Stopped {
            delivered: 0,
            remaining: 0,
            reason: FailureKind::Rejected
        }
    );
    assert!(store.load().await.unwrap().is_empty());
    assert_eq!(engine.drain().await, DrainOutcome::Idle);
}

#[tokio::test]
async fn test_untyped_submission_never_blocks_later_uploads() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = spawn_receiver(dir.path()).await;
    let store = sqlite_store(&dir).await;

    let engine = QueueEngine::open(
        store.clone(),
        transport(&receiver.url, "mediaFile"),
        ConnectivityMonitor::new(Connectivity::Offline),
    )
    .await
    .unwrap();

    let bad = engine.submit(b"x".to_vec(), "image", Some("A")).await;
    let good = engine.submit(b"y".to_vec(), "image/png", Some("B.png")).await;

    assert!(matches!(
        bad,
        SubmitOutcome::Failed {
            reason: FailureKind::Encoding,
            ..
        }
    ));
    assert!(matches!(good, SubmitOutcome::Queued { .. }));

    engine.connectivity().set(Connectivity::Online);
    assert_eq!(
        engine.drain().await,
        DrainOutcome::Completed {
            delivered: 1,
            skipped: 0
        }
    );
    assert!(store.load().await.unwrap().is_empty());
    assert_eq!(stored_files(&receiver.upload_dir).len(), 1);
}
