#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end orchestration tests against the scripted substrate.
//!
//! Covers the batch-level guarantees: one result per worker, classification
//! of mixed outcomes, per-worker ordering in the merged stream, cancellation,
//! and both deadlines.

use fanout_core::*;
use fanout_orchestrator::*;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn settings(worker_timeout: Duration) -> WorkerSettings {
    WorkerSettings {
        timeout: worker_timeout,
        terminate_grace: Duration::from_millis(200),
        event_buffer: 8,
    }
}

fn launcher(substrate: &Arc<ScriptedSubstrate>, worker_timeout: Duration) -> WorkerPoolLauncher {
    WorkerPoolLauncher::new(substrate.clone(), 3, settings(worker_timeout))
}

async fn run(
    substrate: &Arc<ScriptedSubstrate>,
    agents: usize,
) -> (Arc<OrchestrationSession>, OrchestrationOutcome) {
    let launcher = launcher(substrate, Duration::from_secs(30));
    let session = OrchestrationSession::new(Task::new("summarize X", agents).unwrap());
    session.launch(&launcher).await.unwrap();
    let outcome = session.wait_outcome(Duration::from_secs(10)).await.unwrap();
    (session, outcome)
}

// ---------------------------------------------------------------------------
// 1. Exactly N results for every valid N
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_valid_count_yields_one_result_per_worker() {
    for n in MIN_AGENTS..=MAX_AGENTS {
        let substrate = Arc::new(ScriptedSubstrate::new(
            WorkerScript::succeed("ok").with_chunks(["working"]),
        ));
        let (_, outcome) = run(&substrate, n).await;
        let keys: Vec<usize> = outcome.results.keys().copied().collect();
        assert_eq!(keys, (0..n).collect::<Vec<_>>(), "n={n}");
        assert_eq!(outcome.state, SessionState::Completed);
        assert_eq!(substrate.spawn_count(), n);
    }
}

#[tokio::test]
async fn out_of_range_counts_spawn_nothing() {
    let substrate = Arc::new(ScriptedSubstrate::new(WorkerScript::succeed("ok")));
    let orchestrator = Orchestrator::new(substrate.clone(), OrchestratorConfig::default());
    for n in [0, 11] {
        let err = orchestrator.task("summarize X", n).unwrap_err();
        assert!(matches!(err, FanoutError::Validation(_)));
    }
    assert_eq!(substrate.spawn_count(), 0);
    assert!(orchestrator.registry().is_empty().await);
}

// ---------------------------------------------------------------------------
// 2. Classification of mixed outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_failing_worker_gives_partially_failed() {
    for k in 0..4 {
        let substrate = Arc::new(
            ScriptedSubstrate::new(WorkerScript::succeed("ok"))
                .with_script(k, WorkerScript::fail("exit status 1")),
        );
        let (_, outcome) = run(&substrate, 4).await;
        assert_eq!(outcome.state, SessionState::PartiallyFailed, "k={k}");
        assert_eq!(outcome.results.len(), 4);
        for (index, result) in &outcome.results {
            if *index == k {
                assert_eq!(result.status, WorkerState::Failed);
                assert_eq!(result.error, Some(WorkerError::runtime("exit status 1")));
            } else {
                assert!(result.is_success());
            }
        }
    }
}

#[tokio::test]
async fn all_failing_workers_give_failed() {
    let substrate = Arc::new(
        ScriptedSubstrate::new(WorkerScript::fail("boom"))
            .with_script(2, WorkerScript::spawn_failure("no capacity")),
    );
    let (_, outcome) = run(&substrate, 3).await;
    assert_eq!(outcome.state, SessionState::Failed);
    assert_eq!(
        outcome.results[&2].error,
        Some(WorkerError::spawn("no capacity"))
    );
}

#[tokio::test]
async fn spawn_failure_is_recorded_and_siblings_continue() {
    let substrate = Arc::new(
        ScriptedSubstrate::new(WorkerScript::succeed("ok"))
            .with_script(0, WorkerScript::spawn_failure("image missing")),
    );
    let (session, outcome) = run(&substrate, 3).await;
    assert_eq!(outcome.state, SessionState::PartiallyFailed);
    assert_eq!(outcome.results[&0].status, WorkerState::Failed);
    assert!(outcome.results[&1].is_success());
    assert!(outcome.results[&2].is_success());
    assert!(session.handles()[0].execution_id().is_none());
}

// ---------------------------------------------------------------------------
// 3. Merged stream ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn merged_stream_keeps_each_workers_sequence_order() {
    let chunks: Vec<String> = (0..12).map(|i| format!("c{i}")).collect();
    let mut substrate = ScriptedSubstrate::new(
        WorkerScript::succeed("done")
            .with_chunks(chunks.clone())
            .with_chunk_delay(Duration::from_millis(1)),
    );
    substrate = substrate.with_script(
        3,
        WorkerScript::succeed("done")
            .with_chunks(chunks)
            .with_chunk_delay(Duration::from_millis(3)),
    );
    let substrate = Arc::new(substrate);
    let launcher = launcher(&substrate, Duration::from_secs(30));
    let session = OrchestrationSession::new(Task::new("summarize X", 5).unwrap());
    session.launch(&launcher).await.unwrap();

    let records: Vec<StreamRecord> = session.subscribe().collect().await;
    assert!(matches!(records[0], StreamRecord::Start { agent_count: 5, .. }));
    assert!(records.last().unwrap().is_summary());

    let mut per_worker: HashMap<usize, Vec<OutputEvent>> = HashMap::new();
    for record in records {
        if let StreamRecord::Event(event) = record {
            per_worker.entry(event.worker_index).or_default().push(event);
        }
    }
    assert_eq!(per_worker.len(), 5);
    for (index, events) in per_worker {
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (0..13).collect::<Vec<u64>>(), "worker {index}");
        assert!(events.last().unwrap().is_terminal());
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }
}

#[tokio::test]
async fn live_and_late_subscribers_see_the_same_records() {
    let substrate = Arc::new(ScriptedSubstrate::new(
        WorkerScript::succeed("ok")
            .with_chunks(["a", "b", "c"])
            .with_chunk_delay(Duration::from_millis(5)),
    ));
    let launcher = launcher(&substrate, Duration::from_secs(30));
    let session = OrchestrationSession::new(Task::new("summarize X", 3).unwrap());
    session.launch(&launcher).await.unwrap();

    let live = tokio::spawn({
        let stream = session.subscribe();
        async move { stream.collect::<Vec<StreamRecord>>().await }
    });
    session.wait_terminal().await;
    let late: Vec<StreamRecord> = session.subscribe().collect().await;
    let live = live.await.unwrap();

    assert_eq!(
        serde_json::to_string(&live).unwrap(),
        serde_json::to_string(&late).unwrap()
    );
}

// ---------------------------------------------------------------------------
// 4. Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelling_a_running_session_stops_every_worker() {
    let substrate = Arc::new(
        ScriptedSubstrate::new(WorkerScript::hang().with_chunks(["started"]))
            .with_script(1, WorkerScript::succeed("quick"))
            .with_script(2, WorkerScript::hang().ignoring_terminate()),
    );
    let launcher = launcher(&substrate, Duration::from_secs(60));
    let session = OrchestrationSession::new(Task::new("summarize X", 4).unwrap());
    session.launch(&launcher).await.unwrap();
    session.handles()[1].wait_terminal().await;
    // Let the hanging workers emit their first chunk.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.state(), SessionState::Running);

    let cancelled = tokio::time::timeout(Duration::from_millis(200), session.cancel())
        .await
        .unwrap();
    assert!(cancelled);
    assert_eq!(session.state(), SessionState::Cancelled);
    for handle in session.handles() {
        assert!(handle.state().is_terminal());
    }

    let outcome = session.outcome().unwrap();
    assert!(outcome.results[&1].is_success());
    assert_eq!(outcome.results[&0].error, Some(WorkerError::Cancelled));
    assert_eq!(outcome.results[&0].output.as_deref(), Some("started"));

    // The worker that ignores the cooperative stop is force-killed after the grace period.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(substrate.killed().len(), 1);
    assert_eq!(substrate.terminated().len(), 3);

    assert!(!session.cancel().await);
}

// ---------------------------------------------------------------------------
// 5. Deadlines
// ---------------------------------------------------------------------------

#[tokio::test]
async fn summarize_x_with_one_worker_timing_out() {
    let substrate = Arc::new(
        ScriptedSubstrate::new(
            WorkerScript::succeed("summary").with_chunks(["reading X... "]),
        )
        .with_script(1, WorkerScript::hang().with_chunks(["reading X... "])),
    );
    let launcher = launcher(&substrate, Duration::from_millis(300));
    let session = OrchestrationSession::new(Task::new("summarize X", 3).unwrap());
    session.launch(&launcher).await.unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        session.wait_outcome(Duration::from_secs(10)),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(outcome.state, SessionState::PartiallyFailed);
    assert_eq!(outcome.results[&0], FinalResult::succeeded("summary"));
    assert_eq!(outcome.results[&2], FinalResult::succeeded("summary"));
    let timed_out = &outcome.results[&1];
    assert_eq!(timed_out.status, WorkerState::TimedOut);
    assert_eq!(timed_out.error, Some(WorkerError::TimedOut { after_ms: 300 }));
    assert_eq!(timed_out.output.as_deref(), Some("reading X... "));
}

#[tokio::test]
async fn session_deadline_expires_stragglers() {
    let substrate = Arc::new(
        ScriptedSubstrate::new(WorkerScript::succeed("ok"))
            .with_script(0, WorkerScript::hang()),
    );
    let launcher = launcher(&substrate, Duration::from_secs(60));
    let session = OrchestrationSession::new(Task::new("summarize X", 2).unwrap());
    session.launch(&launcher).await.unwrap();

    let outcome = session
        .wait_outcome(Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(outcome.state, SessionState::PartiallyFailed);
    assert_eq!(
        outcome.results[&0].error,
        Some(WorkerError::TimedOut { after_ms: 200 })
    );
    assert!(outcome.results[&1].is_success());
}

// ---------------------------------------------------------------------------
// 6. Admission control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn spawn_ceiling_is_respected_across_concurrent_sessions() {
    let substrate = Arc::new(
        ScriptedSubstrate::new(WorkerScript::succeed("ok"))
            .with_spawn_latency(Duration::from_millis(20)),
    );
    let launcher = Arc::new(launcher(&substrate, Duration::from_secs(30)));

    let mut runs = Vec::new();
    for _ in 0..3 {
        let launcher = launcher.clone();
        runs.push(tokio::spawn(async move {
            let session = OrchestrationSession::new(Task::new("summarize X", 4).unwrap());
            session.launch(&launcher).await.unwrap();
            session.wait_outcome(Duration::from_secs(10)).await.unwrap()
        }));
    }
    for run in runs {
        assert_eq!(run.await.unwrap().state, SessionState::Completed);
    }
    assert_eq!(substrate.spawn_count(), 12);
    assert!(substrate.peak_in_flight() <= 3);
}

#[tokio::test]
async fn unavailable_substrate_fails_the_whole_batch() {
    let substrate = Arc::new(ScriptedSubstrate::new(WorkerScript::succeed("ok")));
    substrate.set_available(false);
    let orchestrator = Orchestrator::new(substrate.clone(), OrchestratorConfig::default());

    let err = orchestrator
        .run(orchestrator.task("summarize X", 5).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, FanoutError::SubstrateUnavailable(_)));
    assert_eq!(substrate.spawn_count(), 0);
    assert!(orchestrator.registry().is_empty().await);
}
