//! End-to-end test from a spool file to the endpoint.
//!
//! A spool file written before the watcher starts is read as backlog, its
//! lines go through the listener's filter, and the dispatcher forwards the
//! accepted ones.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use notirelay_agent::config::{ConfigHandle, ForwardingConfig, PackageFilter};
use notirelay_agent::dispatcher::{Dispatcher, DispatcherConfig};
use notirelay_agent::listener::{CaptureListener, SpoolProgress};
use notirelay_agent::retry::RetryPolicy;
use notirelay_agent::store::DeliveryStore;
use notirelay_agent::types::{DeliveryState, LogKind};
use notirelay_agent::watcher::{SpoolWatcher, WatchEvent};
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn spool_backlog_is_filtered_and_delivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "sourcePackage": "com.whatsapp" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let spool = tempfile::tempdir().unwrap();
    let spool_file = spool.path().join("bridge.jsonl");
    std::fs::write(
        &spool_file,
        concat!(
            r#"{"packageName":"com.whatsapp","title":"Alice","text":"hi"}"#,
            "\n",
            r#"{"packageName":"com.spam","title":"Deal","text":"buy"}"#,
            "\n",
            "not json\n",
        ),
    )
    .unwrap();

    let store = DeliveryStore::open_in_memory().await.unwrap();
    let mut forwarding = ForwardingConfig::new(format!("{}/hook", server.uri()));
    forwarding.filter_packages = PackageFilter::parse("com.whatsapp");
    let handle = ConfigHandle::new(forwarding);
    let wake = Arc::new(Notify::new());
    let listener = CaptureListener::new(store.clone(), handle.clone(), Arc::clone(&wake));

    let (tx, mut rx) = mpsc::channel(16);
    let _watcher = SpoolWatcher::new(spool.path().to_path_buf(), HashMap::new(), tx).unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let WatchEvent::LinesAdded { path, lines, offset } = event else {
        panic!("expected lines, got {event:?}");
    };
    assert_eq!(lines.len(), 3);

    let progress = listener.on_spool_lines(&path, &lines, offset).await;
    assert!(matches!(progress, SpoolProgress::Complete { .. }));
    store
        .save_spool_offset(&path, progress.offset(), Utc::now())
        .await
        .unwrap();
    assert_eq!(store.list_deliveries(None).await.unwrap().len(), 1);

    let dispatcher = Dispatcher::new(
        store.clone(),
        handle,
        DispatcherConfig {
            retry: RetryPolicy::fast_for_tests(),
            ..DispatcherConfig::default()
        },
        wake,
    )
    .unwrap();
    let done = dispatcher.process_due().await.unwrap().unwrap();
    assert_eq!(done.state, DeliveryState::Delivered);
    assert_eq!(done.payload.title, "Alice");
    assert!(dispatcher.process_due().await.unwrap().is_none());

    let kinds: Vec<LogKind> = store
        .list_logs()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![LogKind::Success, LogKind::Queued]);

    let offsets = store.spool_offsets().await.unwrap();
    assert_eq!(
        offsets.get(&spool_file),
        Some(&std::fs::metadata(&spool_file).unwrap().len())
    );
}
