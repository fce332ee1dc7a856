//! OpCapture against a durable store.

use std::sync::Arc;
use std::time::Duration;

use tandem_core::capture::{CaptureConfig, MemoryOpStore, OpCapture, OpStore};
use tandem_core::clock::ManualClock;
use tandem_core::doc::MemoryDoc;
use tandem_core::error::CaptureError;
use tandem_core::id::StructuralId;
use tandem_core::origin::OriginTag;

fn capture_with(
    doc: &Arc<MemoryDoc>,
    store: &MemoryOpStore,
    clock: &Arc<ManualClock>,
) -> OpCapture<MemoryDoc> {
    OpCapture::builder(
        doc.clone(),
        CaptureConfig::new(["body"]).with_capture_timeout(Duration::from_millis(100)),
    )
    .with_store(Arc::new(store.clone()))
    .with_clock(clock.clone())
    .build()
    .unwrap()
}

#[tokio::test]
async fn test_entries_are_appended_updated_and_removed() {
    let doc = Arc::new(MemoryDoc::new(1));
    let store = MemoryOpStore::new();
    let clock = Arc::new(ManualClock::new(0));
    let capture = capture_with(&doc, &store, &clock);

    doc.transact(OriginTag::Local, |txn| txn.insert("body", 0, "hel"));
    clock.advance(Duration::from_millis(20));
    doc.transact(OriginTag::Local, |txn| txn.insert("body", 3, "lo"));
    clock.advance(Duration::from_secs(1));
    doc.transact(OriginTag::Local, |txn| txn.insert("body", 5, "!"));
    capture.flush().await.unwrap();

    assert_eq!(store.len(), 2);
    let entries = capture.entries();
    assert!(entries.iter().all(|e| e.storage_key().is_some()));

    capture.reverse(&[entries[1].id()]).unwrap();
    capture.flush().await.unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(doc.text("body"), "hello");
}

#[tokio::test]
async fn test_removal_issued_before_append_lands() {
    let doc = Arc::new(MemoryDoc::new(1));
    let store = MemoryOpStore::new();
    let clock = Arc::new(ManualClock::new(0));
    let capture = capture_with(&doc, &store, &clock);

    doc.transact(OriginTag::Local, |txn| txn.insert("body", 0, "x"));
    // No await in between: the append is still queued.
    let id = capture.entries()[0].id();
    capture.drop(&[id]).unwrap();
    capture.flush().await.unwrap();

    assert!(store.is_empty());
}

#[tokio::test]
async fn test_restore_from_store_rebuilds_log_and_keeps() {
    let doc = Arc::new(MemoryDoc::new(1));
    doc.transact(OriginTag::Remote, |txn| txn.insert("body", 0, "draft"));
    let store = MemoryOpStore::new();
    let clock = Arc::new(ManualClock::new(0));

    {
        let capture = capture_with(&doc, &store, &clock);
        doc.transact(OriginTag::Local, |txn| txn.remove_range("body", 0, 5));
        capture.flush().await.unwrap();
        capture.destroy().unwrap();
    }
    assert_eq!(store.len(), 1);
    assert!(doc.is_collectable(StructuralId::new(1, 0)));

    // A record that no longer decodes is skipped.
    store.append(vec![0xFF, 0x00, 0x13]).await.unwrap();

    let capture = capture_with(&doc, &store, &clock);
    assert_eq!(capture.restore_from_store().await.unwrap(), 1);
    assert!(!doc.is_collectable(StructuralId::new(1, 0)));
    assert!(capture.entries()[0].storage_key().is_some());

    let ids: Vec<_> = capture.entries().iter().map(|e| e.id()).collect();
    capture.reverse(&ids).unwrap();
    capture.flush().await.unwrap();
    assert_eq!(doc.text("body"), "draft");
    assert_eq!(store.len(), 1, "only the malformed record remains");
}

#[tokio::test]
async fn test_clear_wipes_store() {
    let doc = Arc::new(MemoryDoc::new(1));
    let store = MemoryOpStore::new();
    let clock = Arc::new(ManualClock::new(0));
    let capture = capture_with(&doc, &store, &clock);

    for i in 0..4 {
        clock.advance(Duration::from_secs(1));
        doc.transact(OriginTag::Local, |txn| txn.insert("body", i, "z"));
    }
    capture.flush().await.unwrap();
    assert_eq!(store.len(), 4);

    assert_eq!(capture.clear().unwrap(), 4);
    capture.flush().await.unwrap();
    assert!(store.is_empty());
}

#[test]
fn test_store_requires_runtime() {
    let doc = Arc::new(MemoryDoc::new(1));
    let result = OpCapture::builder(doc, CaptureConfig::new(["body"]))
        .with_store(Arc::new(MemoryOpStore::new()))
        .build();
    assert!(matches!(result, Err(CaptureError::NoRuntime)));
}

#[test]
fn test_restore_from_store_without_store() {
    let doc = Arc::new(MemoryDoc::new(1));
    let capture = OpCapture::new(doc, CaptureConfig::new(["body"]));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let result = runtime.block_on(capture.restore_from_store());
    assert!(matches!(result, Err(CaptureError::NoStore)));
}
