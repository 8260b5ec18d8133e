//! Integration tests for the run lifecycle: admission, live tracking,
//! events, cancellation and cleanup.
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Gate, StepEngine, eventually, step_manager};
use macrobox::{
    Diagnostic, Error, ExecuteParams, ExecutionDescriptor, ExecutionId, InMemoryScriptSource,
    LanguageKind, SandboxManager, Transpiler,
};

type Seen = Arc<Mutex<Vec<Arc<ExecutionDescriptor>>>>;

fn record(emitter: &macrobox::EventEmitter<Arc<ExecutionDescriptor>>) -> (Seen, macrobox::Subscription) {
    let seen: Seen = Arc::default();
    let sink = seen.clone();
    let subscription = emitter.subscribe(move |descriptor| {
        sink.lock().unwrap().push(descriptor.clone());
    });
    (seen, subscription)
}

fn ids(seen: &Seen) -> Vec<String> {
    seen.lock()
        .unwrap()
        .iter()
        .map(|d| d.id().to_string())
        .collect()
}

#[tokio::test]
async fn singleton_rejects_overlapping_runs() {
    let gate = Gate::new();
    let (manager, source) = step_manager(&gate);
    source.open("/m/solo.rhai", "// @macro:singleton\nwait\n");
    let executor = manager.ensure_executor("/m/solo.rhai");
    let (started, _sub) = record(executor.on_execution_start());

    let first = tokio::spawn({
        let executor = executor.clone();
        async move { executor.execute(ExecuteParams::default()).await }
    });
    eventually(|| executor.running_count() == 1).await;

    let err = executor.execute(ExecuteParams::default()).await.unwrap_err();
    assert!(matches!(&err, Error::SingletonConflict { script } if script == "solo"));
    assert_eq!(err.to_string(), "macro 'solo' is already running");
    assert_eq!(executor.running_count(), 1);

    gate.open();
    first.await.unwrap().unwrap();
    assert_eq!(executor.running_count(), 0);

    executor.execute(ExecuteParams::default()).await.unwrap();
    // The rejected request consumed no index.
    assert_eq!(ids(&started), ["solo@001", "solo@002"]);
}

#[tokio::test]
async fn singleton_rejection_applies_to_descriptors_too() {
    let gate = Gate::new();
    let (manager, source) = step_manager(&gate);
    source.open("/m/solo.rhai", "// @macro:singleton\nwait\n");
    let executor = manager.ensure_executor("/m/solo.rhai");

    let prepared = executor.create_descriptor(ExecuteParams::default()).await.unwrap();
    let first = tokio::spawn({
        let executor = executor.clone();
        async move { executor.execute(ExecuteParams::default()).await }
    });
    eventually(|| executor.running_count() == 1).await;

    let err = executor.execute_descriptor(prepared.clone()).await.unwrap_err();
    assert!(matches!(err, Error::SingletonConflict { .. }));
    assert!(executor.descriptor(prepared.id()).is_none());

    gate.open();
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn singleton_is_read_from_the_requested_snapshot() {
    let gate = Gate::new();
    let (manager, source) = step_manager(&gate);
    source.open("/m/edit.rhai", "wait\n");
    let executor = manager.ensure_executor("/m/edit.rhai");

    let first = tokio::spawn({
        let executor = executor.clone();
        async move { executor.execute(ExecuteParams::default()).await }
    });
    eventually(|| executor.running_count() == 1).await;

    // The unsaved edit turns the macro into a singleton: the new request sees it.
    source.update("/m/edit.rhai", "// @macro:singleton\nwait\n");
    let err = executor.execute(ExecuteParams::default()).await.unwrap_err();
    assert!(matches!(err, Error::SingletonConflict { .. }));

    // Dropping the directive again lets overlapping runs in.
    source.update("/m/edit.rhai", "wait\n");
    let second = tokio::spawn({
        let executor = executor.clone();
        async move { executor.execute(ExecuteParams::default()).await }
    });
    eventually(|| executor.running_count() == 2).await;

    gate.open();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
}

#[tokio::test]
async fn non_singleton_runs_overlap() {
    let gate = Gate::new();
    let (manager, source) = step_manager(&gate);
    source.open("/m/many.rhai", "wait\n");
    let executor = manager.ensure_executor("/m/many.rhai");

    let runs: Vec<_> = (0..5)
        .map(|_| {
            let executor = executor.clone();
            tokio::spawn(async move { executor.execute(ExecuteParams::default()).await })
        })
        .collect();
    eventually(|| executor.running_count() == 5).await;

    let live: Vec<_> = executor
        .descriptors()
        .iter()
        .map(|d| d.id().to_string())
        .collect();
    assert_eq!(live, ["many@001", "many@002", "many@003", "many@004", "many@005"]);

    gate.open();
    for result in futures::future::join_all(runs).await {
        result.unwrap().unwrap();
    }
    assert_eq!(executor.running_count(), 0);
}

#[tokio::test]
async fn disposal_runs_once_for_every_outcome() {
    let gate = Gate::new();
    let (manager, source) = step_manager(&gate);
    let executor = manager.ensure_executor("/m/outcome.rhai");
    let (ended, _sub) = record(executor.on_execution_end());

    source.open("/m/outcome.rhai", "set x 1\n");
    executor.execute(ExecuteParams::default()).await.unwrap();

    source.update("/m/outcome.rhai", "fail nope\n");
    executor.execute(ExecuteParams::default()).await.unwrap_err();

    source.update("/m/outcome.rhai", "wait\n");
    let cancelled = tokio::spawn({
        let executor = executor.clone();
        async move { executor.execute(ExecuteParams::default()).await }
    });
    eventually(|| executor.running_count() == 1).await;
    assert_eq!(executor.cancel(None).len(), 1);
    let result = cancelled.await.unwrap().unwrap();
    assert_eq!(result.value, serde_json::Value::Null);

    let ended = ended.lock().unwrap();
    assert_eq!(ended.len(), 3);
    assert!(ended.iter().all(|d| d.is_disposed()));
    assert_eq!(executor.running_count(), 0);
}

#[tokio::test]
async fn dropped_run_is_still_cleaned_up() {
    let gate = Gate::new();
    let (manager, source) = step_manager(&gate);
    source.open("/m/abandon.rhai", "wait\n");
    let executor = manager.ensure_executor("/m/abandon.rhai");
    let (ended, _sub) = record(executor.on_execution_end());

    let run = tokio::spawn({
        let executor = executor.clone();
        async move { executor.execute(ExecuteParams::default()).await }
    });
    eventually(|| executor.running_count() == 1).await;
    let descriptor = executor.descriptors().remove(0);

    run.abort();
    assert!(run.await.unwrap_err().is_cancelled());

    assert_eq!(executor.running_count(), 0);
    assert_eq!(ended.lock().unwrap().len(), 1);
    assert!(descriptor.is_disposed());
}

#[tokio::test]
async fn start_and_end_listeners_see_the_updated_live_set() {
    let gate = Gate::new();
    gate.open();
    let (manager, source) = step_manager(&gate);
    source.open("/m/order.rhai", "set x 1\n");
    let executor = manager.ensure_executor("/m/order.rhai");

    let log: Arc<Mutex<Vec<String>>> = Arc::default();
    let weak = Arc::downgrade(&executor);
    let sink = log.clone();
    let _start = executor.on_execution_start().subscribe(move |d| {
        let present = weak.upgrade().unwrap().descriptor(d.id()).is_some();
        sink.lock().unwrap().push(format!("start {} live={present}", d.id()));
    });
    let weak = Arc::downgrade(&executor);
    let sink = log.clone();
    let _end = executor.on_execution_end().subscribe(move |d| {
        let present = weak.upgrade().unwrap().descriptor(d.id()).is_some();
        sink.lock().unwrap().push(format!("end {} live={present} disposed={}", d.id(), d.is_disposed()));
    });

    executor.execute(ExecuteParams::default()).await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        [
            "start order@001 live=true",
            "end order@001 live=false disposed=false",
        ]
    );
}

#[tokio::test]
async fn retained_run_lives_until_cancelled() {
    let gate = Gate::new();
    let (manager, source) = step_manager(&gate);
    source.open("/m/keep.rhai", "// @macro:retained\nset x 1\n");
    let executor = manager.ensure_executor("/m/keep.rhai");

    let run = tokio::spawn({
        let executor = executor.clone();
        async move { executor.execute(ExecuteParams::default()).await }
    });
    eventually(|| executor.running_count() == 1).await;
    let descriptor = executor.descriptors().remove(0);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!run.is_finished());
    assert!(!descriptor.is_disposed());
    assert_eq!(executor.running_count(), 1);

    let cancelled = manager.cancel("/m/keep.rhai");
    assert_eq!(cancelled.len(), 1);
    run.await.unwrap().unwrap();
    assert!(descriptor.is_disposed());
    assert_eq!(executor.running_count(), 0);
}

#[tokio::test]
async fn retained_run_fails_fast_when_its_body_fails() {
    let gate = Gate::new();
    let (manager, source) = step_manager(&gate);
    source.open("/m/keep.rhai", "// @macro:retained\nfail early\n");

    let err = manager
        .run("/m/keep.rhai", ExecuteParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Script { ref message, .. } if message == "early"));
}

#[tokio::test]
async fn cancel_targets_one_run_by_id() {
    let gate = Gate::new();
    let (manager, source) = step_manager(&gate);
    source.open("/m/pair.rhai", "wait\n");
    let executor = manager.ensure_executor("/m/pair.rhai");

    let runs: Vec<_> = (0..2)
        .map(|_| {
            let executor = executor.clone();
            tokio::spawn(async move { executor.execute(ExecuteParams::default()).await })
        })
        .collect();
    eventually(|| executor.running_count() == 2).await;

    let target: ExecutionId = "pair@002".parse().unwrap();
    let cancelled = executor.cancel(Some(&target));
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id(), &target);
    eventually(|| executor.running_count() == 1).await;
    assert!(executor.descriptor(&target).is_none());

    let missing: ExecutionId = "pair@099".parse().unwrap();
    assert!(executor.cancel(Some(&missing)).is_empty());

    gate.open();
    for result in futures::future::join_all(runs).await {
        result.unwrap().unwrap();
    }
}

#[tokio::test]
async fn sequential_ids_count_up_per_macro() {
    let gate = Gate::new();
    gate.open();
    let (manager, source) = step_manager(&gate);
    source.open("/m/foo.rhai", "set x 1\n");
    source.open("/m/bar.rhai", "set x 1\n");
    let (started, _sub) = record(manager.on_execution_start());

    for script in ["/m/foo.rhai", "/m/foo.rhai", "/m/bar.rhai", "/m/foo.rhai"] {
        manager.run(script, ExecuteParams::default()).await.unwrap();
    }

    assert_eq!(ids(&started), ["foo@001", "foo@002", "bar@001", "foo@003"]);
}

#[tokio::test]
async fn concurrent_startup_runs_get_distinct_ids() {
    let gate = Gate::new();
    let (manager, source) = step_manager(&gate);
    source.open("/m/boot.rhai", "wait\n");
    let executor = manager.ensure_executor("/m/boot.rhai");

    let a = executor.create_descriptor(ExecuteParams::startup()).await.unwrap();
    let b = executor.create_descriptor(ExecuteParams::startup()).await.unwrap();
    assert_ne!(a.id(), b.id());
    assert!(a.is_startup() && b.is_startup());
    assert_eq!(a.id().to_string(), "boot@startup");
    assert_eq!(b.id().to_string(), "boot@startup(2)");

    let runs = [a.clone(), b.clone()].map(|descriptor| {
        let executor = executor.clone();
        tokio::spawn(async move { executor.execute_descriptor(descriptor).await })
    });
    eventually(|| executor.running_count() == 2).await;

    let found = manager.find_descriptor(&b.id().to_string().parse().unwrap()).unwrap();
    assert!(Arc::ptr_eq(&found, &b));
    assert_eq!(manager.descriptors().len(), 2);

    gate.open();
    for result in futures::future::join_all(runs).await {
        result.unwrap().unwrap();
    }
}

#[tokio::test]
async fn script_error_wins_over_cleanup_error() {
    let gate = Gate::new();
    let (manager, source) = step_manager(&gate);
    source.open("/m/both.rhai", "dispose_fail cleanup\nfail script\n");

    let err = manager
        .run("/m/both.rhai", ExecuteParams::default())
        .await
        .unwrap_err();
    match err {
        Error::Script { id, message, .. } => {
            assert_eq!(id.to_string(), "both@001");
            assert_eq!(message, "script");
        }
        other => panic!("expected script error, got {other:?}"),
    }
}

#[tokio::test]
async fn cleanup_error_surfaces_after_successful_run() {
    let gate = Gate::new();
    let (manager, source) = step_manager(&gate);
    source.open("/m/leak.rhai", "dispose_fail first\ndispose_fail second\nset x 1\n");

    let err = manager
        .run("/m/leak.rhai", ExecuteParams::default())
        .await
        .unwrap_err();
    let Error::Dispose(dispose) = err else {
        panic!("expected dispose error, got {err:?}");
    };
    assert_eq!(dispose.failures().len(), 2);
    assert_eq!(dispose.to_string(), "2 disposable(s) failed: [first] [second]");
}

struct RejectAll;

impl Transpiler for RejectAll {
    fn transpile(
        &self,
        _source: &str,
        _language: &LanguageKind,
        _location: Option<&Path>,
    ) -> Result<String, Vec<Diagnostic>> {
        Err(vec![Diagnostic::new(3, 1, "unexpected end of input").recoverable()])
    }
}

#[tokio::test]
async fn transpile_failure_runs_nothing() {
    let gate = Gate::new();
    let source = InMemoryScriptSource::new();
    source.open("/m/broken.rhai", "set x 1\n");
    let manager = SandboxManager::builder()
        .with_engine(StepEngine::new(gate))
        .with_source(source)
        .with_transpiler(RejectAll)
        .build();
    let executor = manager.ensure_executor("/m/broken.rhai");
    let (ended, _sub) = record(executor.on_execution_end());

    let err = executor.execute(ExecuteParams::default()).await.unwrap_err();
    assert!(err.is_recoverable());
    assert!(matches!(&err, Error::Compilation { diagnostics, .. } if diagnostics[0].line == 3));
    assert!(executor.shared_globals().is_none());
    assert_eq!(ended.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn unreadable_macro_is_a_source_error() {
    let gate = Gate::new();
    let (manager, _source) = step_manager(&gate);
    let err = manager
        .run("/m/missing.rhai", ExecuteParams::default())
        .await
        .unwrap_err();
    assert!(matches!(&err, Error::Source { script, .. } if script == "missing"));
    assert_eq!(manager.running_count(), 0);
}

#[tokio::test]
async fn removed_executor_cancels_runs_and_rejects_new_ones() {
    let gate = Gate::new();
    let (manager, source) = step_manager(&gate);
    source.open("/m/gone.rhai", "wait\n");
    let executor = manager.ensure_executor("/m/gone.rhai");
    let (started, _start) = record(manager.on_execution_start());
    let (ended, _end) = record(manager.on_execution_end());

    let run = tokio::spawn({
        let executor = executor.clone();
        async move { executor.execute(ExecuteParams::default()).await }
    });
    eventually(|| executor.running_count() == 1).await;

    let removed = manager.remove_executor("/m/gone.rhai").unwrap();
    assert!(Arc::ptr_eq(&removed, &executor));
    run.await.unwrap().unwrap();

    // The cancelled run's end still reaches the manager, then relaying stops.
    assert_eq!(ids(&started), ["gone@001"]);
    assert_eq!(ids(&ended), ["gone@001"]);
    assert_eq!(executor.on_execution_start().listener_count(), 0);
    assert_eq!(executor.on_execution_end().listener_count(), 0);

    let err = executor.execute(ExecuteParams::default()).await.unwrap_err();
    assert!(matches!(err, Error::ExecutorDisposed { .. }));
    assert!(manager.executor("/m/gone.rhai").is_none());
}

#[tokio::test]
async fn shutdown_cancels_every_live_run() {
    let gate = Gate::new();
    let (manager, source) = step_manager(&gate);
    source.open("/m/a.rhai", "wait\n");
    source.open("/m/b.rhai", "// @macro:retained\nset x 1\n");
    let manager = Arc::new(manager);
    let (started, _start) = record(manager.on_execution_start());
    let (ended, _end) = record(manager.on_execution_end());

    let runs = ["/m/a.rhai", "/m/b.rhai"].map(|script| {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run(script, ExecuteParams::default()).await })
    });
    eventually(|| manager.running_count() == 2).await;

    manager.shutdown();
    for result in futures::future::join_all(runs).await {
        result.unwrap().unwrap();
    }
    assert!(manager.executors().is_empty());

    let mut started = ids(&started);
    let mut ended = ids(&ended);
    started.sort();
    ended.sort();
    assert_eq!(started, ["a@001", "b@001"]);
    assert_eq!(ended, started);
}

#[tokio::test]
async fn live_descriptor_cannot_be_started_twice() {
    let gate = Gate::new();
    let (manager, source) = step_manager(&gate);
    source.open("/m/twice.rhai", "wait\n");
    let executor = manager.ensure_executor("/m/twice.rhai");
    let (started, _start) = record(executor.on_execution_start());
    let (ended, _end) = record(executor.on_execution_end());

    let prepared = executor.create_descriptor(ExecuteParams::default()).await.unwrap();
    let first = tokio::spawn({
        let executor = executor.clone();
        let prepared = prepared.clone();
        async move { executor.execute_descriptor(prepared).await }
    });
    eventually(|| executor.running_count() == 1).await;

    let err = executor.execute_descriptor(prepared.clone()).await.unwrap_err();
    assert!(matches!(&err, Error::DescriptorInUse { id } if id == prepared.id()));
    assert_eq!(err.to_string(), "run twice@001 is already running");
    assert!(!prepared.is_cancelled());

    gate.open();
    first.await.unwrap().unwrap();
    assert_eq!(ids(&started), ["twice@001"]);
    assert_eq!(ids(&ended), ["twice@001"]);
}

#[tokio::test]
async fn finished_or_disposed_descriptors_are_rejected() {
    let gate = Gate::new();
    gate.open();
    let (manager, source) = step_manager(&gate);
    source.open("/m/once.rhai", "set x 1\nreturn x\n");
    let executor = manager.ensure_executor("/m/once.rhai");
    let (started, _start) = record(executor.on_execution_start());

    let prepared = executor.create_descriptor(ExecuteParams::default()).await.unwrap();
    let result = executor.execute_descriptor(prepared.clone()).await.unwrap();
    assert_eq!(result.value, serde_json::json!(1));

    let err = executor.execute_descriptor(prepared.clone()).await.unwrap_err();
    assert!(matches!(&err, Error::DescriptorFinished { id } if id == prepared.id()));

    let discarded = executor.create_descriptor(ExecuteParams::default()).await.unwrap();
    discarded.dispose().unwrap();
    let err = executor.execute_descriptor(discarded).await.unwrap_err();
    assert!(matches!(err, Error::DescriptorFinished { .. }));

    assert_eq!(ids(&started), ["once@001"]);
    assert_eq!(executor.running_count(), 0);
}

#[tokio::test]
async fn descriptor_from_another_macro_is_rejected() {
    let gate = Gate::new();
    let (manager, source) = step_manager(&gate);
    source.open("/m/mine.rhai", "set x 1\n");
    source.open("/m/theirs.rhai", "set x 2\n");
    let mine = manager.ensure_executor("/m/mine.rhai");
    let theirs = manager.ensure_executor("/m/theirs.rhai");

    let prepared = theirs.create_descriptor(ExecuteParams::default()).await.unwrap();
    let err = mine.execute_descriptor(prepared.clone()).await.unwrap_err();
    assert!(
        matches!(&err, Error::ForeignDescriptor { id, script } if id == prepared.id() && script == "mine")
    );

    // The rejection left the descriptor usable by its own executor.
    theirs.execute_descriptor(prepared).await.unwrap();
}
