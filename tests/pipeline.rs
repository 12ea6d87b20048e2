//! End-to-end pipeline: coordinator + broker connection + in-process broker.

use std::sync::Arc;
use std::time::Duration;

use job_dispatch::broker::{BrokerConnection, ConnectionState, MemoryTransport};
use job_dispatch::config::ReconnectPolicy;
use job_dispatch::dispatch::{
    BrokerPublisher, DispatchCoordinator, DispatchStatus, JobRequest, spawn_drain_task,
};
use job_dispatch::error::DispatchError;
use job_dispatch::results::{ResultRouter, SseResultSink};
use job_dispatch::store::{JobStore, MemoryJobStore};

const JOBS: &str = "jobs_out";
const RESULTS: &str = "results_in";

struct Pipeline {
    transport: MemoryTransport,
    connection: Arc<BrokerConnection>,
    coordinator: Arc<DispatchCoordinator>,
    store: Arc<MemoryJobStore>,
    sink: Arc<SseResultSink>,
}

async fn pipeline(max_active: usize) -> Pipeline {
    let transport = MemoryTransport::new();
    let connection = BrokerConnection::new(
        Arc::new(transport.clone()),
        vec![JOBS.to_string(), RESULTS.to_string()],
        ReconnectPolicy {
            base_delay: Duration::from_secs(2),
            max_attempts: 5,
        },
    );
    connection.initialize().await.unwrap();

    let coordinator = Arc::new(DispatchCoordinator::new(
        max_active,
        Arc::new(BrokerPublisher::new(Arc::clone(&connection), JOBS)),
    ));
    let store = Arc::new(MemoryJobStore::new());
    let sink = Arc::new(SseResultSink::new());
    let router = ResultRouter::new(coordinator.clone(), store.clone(), sink.clone());
    connection.consume(RESULTS, Arc::new(router)).await.unwrap();

    Pipeline {
        transport,
        connection,
        coordinator,
        store,
        sink,
    }
}

async fn wait_for_state(connection: &BrokerConnection, target: ConnectionState) {
    let mut rx = connection.watch_state();
    tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| *s == target))
        .await
        .expect("state not reached")
        .expect("state channel closed");
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn published_sessions(transport: &MemoryTransport) -> Vec<String> {
    transport
        .messages_json(JOBS)
        .iter()
        .filter_map(|m| m["sessionId"].as_str().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn fourth_session_waits_for_a_result_then_drains() {
    let p = pipeline(3).await;

    for i in 1..=3 {
        let result = p
            .coordinator
            .submit(JobRequest::new("a lighthouse", format!("s{i}")).with_job_id(format!("job-{i}")))
            .await
            .unwrap();
        assert_eq!(result.status, DispatchStatus::Submitted);
    }
    let queued = p
        .coordinator
        .submit(JobRequest::new("a lighthouse", "s4").with_job_id("job-4"))
        .await
        .unwrap();
    assert_eq!(queued.status, DispatchStatus::Queued);
    assert_eq!(published_sessions(&p.transport), vec!["s1", "s2", "s3"]);

    // Worker finishes job-1
    let listener = p.sink.register("job-1");
    p.transport.deliver(
        RESULTS,
        br#"{"jobID":"job-1","cdnLink":"https://cdn/1.png","userId":"u1"}"#.to_vec(),
    );
    let payload = tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload["cdnLink"], "https://cdn/1.png");
    wait_until(|| p.coordinator.active_count() == 2).await;

    let report = p.coordinator.drain_step().await;
    assert_eq!(report.dispatched, 1);
    assert_eq!(p.coordinator.active_count(), 3);
    assert_eq!(p.coordinator.buffered(), 0);
    assert_eq!(published_sessions(&p.transport), vec!["s1", "s2", "s3", "s4"]);
    assert_eq!(p.transport.messages_json(JOBS)[3]["jobID"], "job-4");

    let record = p.store.get("job-1").await.unwrap().unwrap();
    assert_eq!(record["status"], "completed");
}

#[tokio::test(start_paused = true)]
async fn submissions_during_reconnect_fail_fast_and_roll_back() {
    let p = pipeline(3).await;
    p.transport.fail_next_connects(1);

    p.transport.sever("connection reset by peer");
    wait_for_state(&p.connection, ConnectionState::Reconnecting).await;

    let err = p
        .coordinator
        .submit(JobRequest::new("t", "s1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::ChannelUnavailable { .. }));
    assert_eq!(p.coordinator.active_count(), 0);
    assert_eq!(p.coordinator.buffered(), 0);

    wait_for_state(&p.connection, ConnectionState::Connected).await;
    let result = p
        .coordinator
        .submit(JobRequest::new("t", "s1").with_job_id("job-1"))
        .await
        .unwrap();
    assert_eq!(result.status, DispatchStatus::Submitted);

    // The result consumer came back with the new session
    p.transport
        .deliver(RESULTS, br#"{"jobID":"job-1","cdnLink":"x","userId":"u"}"#.to_vec());
    wait_until(|| p.coordinator.active_count() == 0).await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnect_budget_leaves_pipeline_failed() {
    let p = pipeline(3).await;
    p.coordinator
        .submit(JobRequest::new("t", "s1"))
        .await
        .unwrap();
    let attempts_before = p.transport.connect_attempts().len();

    p.transport.fail_next_connects(100);
    p.transport.sever("broker restarted");
    wait_for_state(&p.connection, ConnectionState::Failed).await;

    assert_eq!(p.transport.connect_attempts().len() - attempts_before, 5);
    assert_eq!(p.coordinator.connection_state(), ConnectionState::Failed);

    // New submissions are refused and their reservations rolled back
    for id in ["s2", "s3"] {
        let err = p.coordinator.submit(JobRequest::new("t", id)).await.unwrap_err();
        assert!(matches!(err, DispatchError::ChannelUnavailable { .. }));
    }
    assert_eq!(p.coordinator.active_count(), 1);
    let report = p.coordinator.drain_step().await;
    assert_eq!(report.dispatched, 0);
}

#[tokio::test(start_paused = true)]
async fn drain_task_promotes_buffered_work_after_release() {
    let p = pipeline(1).await;
    p.coordinator
        .submit(JobRequest::new("t", "s1"))
        .await
        .unwrap();
    p.coordinator
        .submit(JobRequest::new("t", "s2"))
        .await
        .unwrap();

    let drain = spawn_drain_task(Arc::clone(&p.coordinator), Duration::from_secs(10));
    p.coordinator.release("s1");
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert_eq!(p.coordinator.buffered(), 0);
    assert_eq!(published_sessions(&p.transport), vec!["s1", "s2"]);

    drain.stop().await;
    p.connection.close().await.unwrap();
    assert_eq!(p.connection.state(), ConnectionState::Disconnected);
}
