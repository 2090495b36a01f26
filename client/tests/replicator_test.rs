//! Integration tests for replicator event ordering and replication
//! conflict resolution.

mod common;

use common::{conflict_resolved, make_conflict, open, wait_until, Gate, ManualEngine, TIMEOUT};
use harbor::{
    resolver_fn, ActivityLevel, ConflictCause, ConflictResolver, Database, Document,
    DocumentEnded, DocumentReplication, Error, Replicator, ReplicatorConfig, ReplicatorStatus,
    ServiceState, MAX_CONFLICT_RETRIES,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Status(u64),
    Document(String),
}

fn replicator(
    db: &Database,
    resolver: Option<Arc<dyn ConflictResolver>>,
) -> (Replicator, Arc<ManualEngine>) {
    let engine = ManualEngine::new();
    let replicator = Replicator::new(
        db,
        engine.clone(),
        ReplicatorConfig {
            conflict_resolver: resolver,
        },
    )
    .unwrap();
    replicator.start().unwrap();
    (replicator, engine)
}

/// Record statuses (by completed progress) and document events in
/// delivery order.
fn observe(replicator: &Replicator) -> mpsc::Receiver<Seen> {
    let (tx, rx) = mpsc::channel();
    let statuses = tx.clone();
    replicator.add_change_listener(move |status: &ReplicatorStatus| {
        let _ = statuses.send(Seen::Status(status.progress.completed));
    });
    replicator.add_document_listener(move |replication: &DocumentReplication| {
        for document in &replication.documents {
            let _ = tx.send(Seen::Document(document.id.clone()));
        }
    });
    rx
}

fn ended(replicator: &Replicator) -> mpsc::Receiver<DocumentEnded> {
    let (tx, rx) = mpsc::channel();
    replicator.add_document_listener(move |replication: &DocumentReplication| {
        for document in &replication.documents {
            let _ = tx.send(document.clone());
        }
    });
    rx
}

fn busy(completed: u64) -> ReplicatorStatus {
    ReplicatorStatus::new(ActivityLevel::Busy).with_progress(completed, 10)
}

// ============================================================================
// Event Ordering
// ============================================================================

#[test]
fn test_pushed_documents_are_delivered_in_order() {
    let db = open("repl-push");
    let (replicator, engine) = replicator(&db, None);
    let rx = observe(&replicator);
    let callbacks = engine.callbacks();

    callbacks.status_changed(busy(1));
    callbacks.documents_ended(true, vec![DocumentEnded::new("a"), DocumentEnded::new("b")]);
    callbacks.status_changed(busy(2));

    let seen: Vec<Seen> = (0..4).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
    assert_eq!(
        seen,
        vec![
            Seen::Status(1),
            Seen::Document("a".into()),
            Seen::Document("b".into()),
            Seen::Status(2),
        ]
    );
    assert_eq!(replicator.status().progress.completed, 2);
}

#[test]
fn test_status_waits_for_pending_conflict() {
    let db = open("repl-order");
    make_conflict(&db, "doc", json!({"side": "local"}), json!({"side": "remote"}));

    let gate = Gate::new();
    let blocker = gate.clone();
    let resolver = resolver_fn(move |conflict| {
        blocker.wait();
        Ok(conflict.remote().cloned())
    });
    let (replicator, engine) = replicator(&db, Some(Arc::new(resolver)));
    let rx = observe(&replicator);
    let callbacks = engine.callbacks();

    callbacks.status_changed(busy(1));
    callbacks.documents_ended(false, vec![DocumentEnded::conflicted("doc")]);
    callbacks.status_changed(busy(2));

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Seen::Status(1));
    // Status 2 is held while the resolution is blocked.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(replicator.status().progress.completed, 1);

    gate.open();
    callbacks.status_changed(busy(3));

    let rest: Vec<Seen> = (0..3).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
    assert_eq!(
        rest,
        vec![Seen::Document("doc".into()), Seen::Status(2), Seen::Status(3)]
    );
    assert!(conflict_resolved(&db, "doc"));
}

#[test]
fn test_engine_error_is_reported_in_status() {
    let db = open("repl-error");
    let (replicator, engine) = replicator(&db, None);
    let (tx, rx) = mpsc::channel();
    replicator.add_change_listener(move |status: &ReplicatorStatus| {
        let _ = tx.send(status.clone());
    });

    let unreachable = Error::Replication {
        code: 503,
        message: "remote unreachable".into(),
    };
    let offline = ReplicatorStatus::new(ActivityLevel::Offline).with_error(unreachable.clone());
    engine.callbacks().status_changed(offline);

    let status = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(status.activity, ActivityLevel::Offline);
    assert_eq!(status.error, Some(unreachable.clone()));
    assert_eq!(status.error.as_ref().map(Error::code), Some(503));
    assert_eq!(replicator.status().error, Some(unreachable));
    // Offline is not stopped.
    assert_eq!(db.active_process_count(), 1);
}

#[test]
fn test_stopped_replicator_releases_database() {
    let db = open("repl-stop");
    let (replicator, _engine) = replicator(&db, None);
    assert_eq!(db.active_process_count(), 1);

    replicator.stop();
    assert!(wait_until(|| db.active_process_count() == 0));
    assert_eq!(replicator.status().activity, ActivityLevel::Stopped);
}

// ============================================================================
// Conflict Resolution
// ============================================================================

#[test]
fn test_default_resolver_prefers_higher_generation() {
    let db = open("repl-default");
    let mut local = make_conflict(&db, "doc", json!({"v": "local-1"}), json!({"v": "remote"}));
    local.set("v", "local-2");
    db.save(&mut local).unwrap();

    let (replicator, engine) = replicator(&db, None);
    let rx = ended(&replicator);
    engine
        .callbacks()
        .documents_ended(false, vec![DocumentEnded::conflicted("doc")]);

    let document = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(document.error, None);
    assert!(!document.conflicted);
    assert!(conflict_resolved(&db, "doc"));
    assert_eq!(
        db.get_document("doc").unwrap().unwrap().get("v"),
        Some(&json!("local-2"))
    );
}

#[test]
fn test_resolver_returning_none_deletes() {
    let db = open("repl-delete");
    make_conflict(&db, "doc", json!({"v": 1}), json!({"v": 2}));

    let (replicator, engine) = replicator(&db, Some(Arc::new(resolver_fn(|_| Ok(None)))));
    let rx = ended(&replicator);
    engine
        .callbacks()
        .documents_ended(false, vec![DocumentEnded::conflicted("doc")]);

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().error, None);
    assert!(db.get_document("doc").unwrap().is_none());
    assert!(conflict_resolved(&db, "doc"));
}

#[test]
fn test_deletions_on_both_sides_skip_resolver() {
    let db = open("repl-both-deleted");
    let mut doc = Document::with_body("doc", json!({"v": 1}));
    db.save(&mut doc).unwrap();
    db.delete(&mut doc).unwrap();
    db.with_storage(|store| store.insert_remote_revision("doc", json!({}), true, None))
        .unwrap()
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let resolver = resolver_fn(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    });
    let (replicator, engine) = replicator(&db, Some(Arc::new(resolver)));
    let rx = ended(&replicator);
    engine
        .callbacks()
        .documents_ended(false, vec![DocumentEnded::conflicted("doc")]);

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().error, None);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(conflict_resolved(&db, "doc"));
}

#[test]
fn test_resolver_failure_is_reported_on_document() {
    let db = open("repl-fail");
    make_conflict(&db, "doc", json!({"v": 1}), json!({"v": 2}));

    let resolver = resolver_fn(|_| Err("cannot decide".into()));
    let (replicator, engine) = replicator(&db, Some(Arc::new(resolver)));
    let rx = ended(&replicator);
    engine
        .callbacks()
        .documents_ended(false, vec![DocumentEnded::conflicted("doc")]);

    let document = rx.recv_timeout(TIMEOUT).unwrap();
    match document.error {
        Some(Error::Conflict {
            cause: ConflictCause::ResolverFailed(message),
            ..
        }) => assert!(message.contains("cannot decide")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!conflict_resolved(&db, "doc"));
}

#[test]
fn test_resolver_answer_with_other_id_keeps_body() {
    let db = open("repl-rename");
    make_conflict(&db, "doc", json!({"v": 1}), json!({"v": 2}));

    let resolver = resolver_fn(|_| Ok(Some(Document::with_body("elsewhere", json!({"v": 3})))));
    let (replicator, engine) = replicator(&db, Some(Arc::new(resolver)));
    let rx = ended(&replicator);
    engine
        .callbacks()
        .documents_ended(false, vec![DocumentEnded::conflicted("doc")]);

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().error, None);
    assert_eq!(
        db.get_document("doc").unwrap().unwrap().get("v"),
        Some(&json!(3))
    );
    assert!(db.get_document("elsewhere").unwrap().is_none());
}

#[test]
fn test_resolver_answer_from_other_database_is_rejected() {
    let db = open("repl-foreign");
    let other = open("repl-foreign-other");
    make_conflict(&db, "doc", json!({"v": 1}), json!({"v": 2}));
    let mut foreign = Document::with_body("doc", json!({"v": 9}));
    other.save(&mut foreign).unwrap();

    let resolver = resolver_fn(move |_| Ok(Some(foreign.clone())));
    let (replicator, engine) = replicator(&db, Some(Arc::new(resolver)));
    let rx = ended(&replicator);
    engine
        .callbacks()
        .documents_ended(false, vec![DocumentEnded::conflicted("doc")]);

    let document = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(matches!(document.error, Some(Error::Unexpected(_))));
    assert!(!conflict_resolved(&db, "doc"));
}

#[test]
fn test_local_edit_during_resolution_is_reread() {
    let db = open("repl-local-edit");
    make_conflict(&db, "doc", json!({"v": "local"}), json!({"v": "remote"}));

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let editor = db.clone();
    let resolver = resolver_fn(move |conflict| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            let mut local = editor.get_document("doc").unwrap().unwrap();
            local.set("v", "third");
            editor.save(&mut local).unwrap();
        }
        Ok(conflict.local().cloned())
    });
    let (replicator, engine) = replicator(&db, Some(Arc::new(resolver)));
    let rx = ended(&replicator);
    engine
        .callbacks()
        .documents_ended(false, vec![DocumentEnded::conflicted("doc")]);

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().error, None);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(conflict_resolved(&db, "doc"));
    assert_eq!(
        db.get_document("doc").unwrap().unwrap().get("v"),
        Some(&json!("third"))
    );
}

#[test]
fn test_resolution_gives_up_when_local_keeps_changing() {
    let db = open("repl-local-churn");
    make_conflict(&db, "doc", json!({"v": 0}), json!({"v": "remote"}));

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let editor = db.clone();
    let resolver = resolver_fn(move |conflict| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        let mut local = editor.get_document("doc").unwrap().unwrap();
        local.set("v", n + 1);
        editor.save(&mut local).unwrap();
        Ok(conflict.local().cloned())
    });
    let (replicator, engine) = replicator(&db, Some(Arc::new(resolver)));
    let rx = ended(&replicator);
    engine
        .callbacks()
        .documents_ended(false, vec![DocumentEnded::conflicted("doc")]);

    let document = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(matches!(document.error, Some(Error::Unexpected(_))), "{:?}", document.error);
    assert_eq!(calls.load(Ordering::SeqCst), MAX_CONFLICT_RETRIES);
    assert!(!conflict_resolved(&db, "doc"));
}

#[test]
fn test_racing_resolutions_persist_once() {
    let db = open("repl-race");
    make_conflict(&db, "doc", json!({"v": "local"}), json!({"v": "remote"}));
    let before = db.get_document("doc").unwrap().unwrap().generation();

    // Both tasks read the conflict before either writes.
    let barrier = Arc::new(Barrier::new(2));
    let resolver = resolver_fn(move |conflict| {
        barrier.wait();
        let mut merged = conflict.remote().cloned().expect("remote side");
        merged.set("v", "merged");
        Ok(Some(merged))
    });
    let (replicator, engine) = replicator(&db, Some(Arc::new(resolver)));
    let rx = ended(&replicator);
    engine.callbacks().documents_ended(
        false,
        vec![DocumentEnded::conflicted("doc"), DocumentEnded::conflicted("doc")],
    );

    for _ in 0..2 {
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().error, None);
    }
    assert!(conflict_resolved(&db, "doc"));

    let resolved = db.get_document("doc").unwrap().unwrap();
    assert_eq!(resolved.get("v"), Some(&json!("merged")));
    // One merge revision on top of the remote branch.
    assert_eq!(resolved.generation(), before + 1);
}

// ============================================================================
// Resolver Service Shutdown
// ============================================================================

/// Five conflicted documents whose resolutions are all blocked on `gate`.
fn blocked_resolutions(name: &str, gate: &Arc<Gate>) -> (Database, Replicator) {
    let db = open(name);
    let ids: Vec<String> = (0..5).map(|i| format!("doc-{i}")).collect();
    for id in &ids {
        make_conflict(&db, id, json!({"v": 1}), json!({"v": 2}));
    }

    let blocker = gate.clone();
    let resolver = resolver_fn(move |conflict| {
        blocker.wait();
        Ok(conflict.remote().cloned())
    });
    let (replicator, engine) = replicator(&db, Some(Arc::new(resolver)));
    engine.callbacks().documents_ended(
        false,
        ids.iter().map(DocumentEnded::conflicted).collect(),
    );
    assert!(wait_until(|| gate.waiting() == 5));
    (db, replicator)
}

#[test]
fn test_shutdown_waits_for_in_flight_resolutions() {
    let gate = Gate::new();
    let (db, _replicator) = blocked_resolutions("service-wait", &gate);
    let service = db.resolver_service().clone();
    assert_eq!(service.in_flight().len(), 5);

    let (tx, rx) = mpsc::channel();
    let observer = service.clone();
    assert!(service.shutdown(true, move || {
        let _ = tx.send((observer.in_flight().len(), observer.state()));
    }));
    assert_eq!(service.state(), ServiceState::Stopping);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(service.in_flight().iter().all(|task| !task.is_cancelled()));

    gate.open();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (0, ServiceState::Stopped));
    for i in 0..5 {
        assert!(conflict_resolved(&db, &format!("doc-{i}")));
    }

    // Already shut down.
    assert!(!service.shutdown(true, || {}));
}

#[test]
fn test_shutdown_without_wait_cancels_in_flight_resolutions() {
    let gate = Gate::new();
    let (db, replicator) = blocked_resolutions("service-cancel", &gate);
    let rx = ended(&replicator);
    let service = db.resolver_service().clone();

    let tasks = service.in_flight();
    assert_eq!(tasks.len(), 5);
    let (tx, finished) = mpsc::channel();
    assert!(service.shutdown(false, move || {
        let _ = tx.send(());
    }));
    assert!(tasks.iter().all(|task| task.is_cancelled()));

    gate.open();
    finished.recv_timeout(TIMEOUT).unwrap();
    assert!(service.wait_stopped(TIMEOUT));
    assert_eq!(service.state(), ServiceState::Stopped);

    // Every document still gets its ended event.
    for _ in 0..5 {
        rx.recv_timeout(TIMEOUT).unwrap();
    }
}

#[test]
fn test_conflicts_after_shutdown_are_cancelled() {
    let db = open("service-stopped");
    make_conflict(&db, "doc", json!({"v": 1}), json!({"v": 2}));
    assert!(db.resolver_service().shutdown(true, || {}));

    let (replicator, engine) = replicator(&db, None);
    let rx = ended(&replicator);
    engine
        .callbacks()
        .documents_ended(false, vec![DocumentEnded::conflicted("doc")]);

    let document = rx.recv_timeout(TIMEOUT).unwrap();
    assert!(matches!(document.error, Some(Error::Cancelled(_))));
    assert!(!conflict_resolved(&db, "doc"));
}
