//! Dispatch coordinator: admission, overflow and publish tied together.
//!
//! Shared state (gate, buffer, in-flight jobs) lives behind `std::sync::Mutex`
//! guards that are never held across an `.await`. The capacity check and the
//! reservation happen under one guard (`AdmissionGate::try_reserve`).
//!
//! Only the drain step removes from the buffer head, and only one drain step
//! runs at a time, so the head peeked at the start of an attempt is still the
//! head when it is dequeued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{DispatchResult, JobPublisher, JobRequest};
use crate::admission::{AdmissionGate, Reservation, validate_session_id};
use crate::broker::{ConnectionState, OutboundJob};
use crate::error::DispatchError;
use crate::overflow::{OverflowBuffer, QueuedSubmission};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of one drain cycle.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Buffered submissions handed to the broker in this cycle.
    pub dispatched: usize,
    /// Buffer length when the cycle ended.
    pub remaining: usize,
    /// Another cycle was in flight, so this one did nothing.
    pub skipped: bool,
    /// The failure that stopped the cycle early, if any.
    pub failure: Option<DispatchError>,
}

/// Admits, buffers and dispatches job submissions.
pub struct DispatchCoordinator {
    gate: Mutex<AdmissionGate>,
    buffer: Mutex<OverflowBuffer>,
    publisher: Arc<dyn JobPublisher>,
    /// Dispatched job id → session id, used to release on completion.
    in_flight: Mutex<HashMap<String, String>>,
    /// Held for the duration of a drain cycle.
    drain_lock: tokio::sync::Mutex<()>,
}

impl DispatchCoordinator {
    pub fn new(max_active_sessions: usize, publisher: Arc<dyn JobPublisher>) -> Self {
        Self {
            gate: Mutex::new(AdmissionGate::new(max_active_sessions)),
            buffer: Mutex::new(OverflowBuffer::new()),
            publisher,
            in_flight: Mutex::new(HashMap::new()),
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Submit a job: dispatch it now if a session slot is free, otherwise buffer it.
    ///
    /// A failed publish rolls the reservation back and is reported to the caller.
    pub async fn submit(&self, request: JobRequest) -> Result<DispatchResult, DispatchError> {
        validate_session_id(&request.session_id)?;

        let reservation = lock(&self.gate).try_reserve(&request.session_id)?;
        let Some(reservation) = reservation else {
            let queued = QueuedSubmission {
                text: request.text,
                session_id: request.session_id,
                job_id: request.job_id.clone(),
                enqueued_at: Utc::now(),
            };
            let session_id = queued.session_id.clone();
            let buffered = {
                let mut buffer = lock(&self.buffer);
                buffer.enqueue(queued);
                buffer.len()
            };
            info!(
                session_id = %session_id,
                buffered,
                "Max active sessions reached, job added to overflow queue"
            );
            return Ok(DispatchResult::queued(request.job_id));
        };

        self.dispatch(
            &request.text,
            &request.session_id,
            request.job_id.as_deref(),
            reservation,
        )
        .await?;

        info!(
            session_id = %request.session_id,
            job_id = ?request.job_id,
            "Job submitted to broker"
        );
        Ok(DispatchResult::submitted(request.job_id))
    }

    /// Promote buffered submissions while capacity allows.
    ///
    /// Stops at the first failure and leaves the head in place for the next tick.
    pub async fn drain_step(&self) -> DrainReport {
        let Ok(_cycle) = self.drain_lock.try_lock() else {
            debug!("Drain cycle already in flight, skipping");
            return DrainReport {
                skipped: true,
                remaining: self.buffered(),
                ..DrainReport::default()
            };
        };

        let mut report = DrainReport::default();
        loop {
            let head = lock(&self.buffer).peek().cloned();
            let Some(head) = head else {
                break;
            };

            // Buffered ids were validated on submit, so an error here cannot happen
            let Ok(Some(reservation)) = lock(&self.gate).try_reserve(&head.session_id) else {
                break;
            };

            match self
                .dispatch(
                    &head.text,
                    &head.session_id,
                    head.job_id.as_deref(),
                    reservation,
                )
                .await
            {
                Ok(()) => {
                    let removed = lock(&self.buffer).dequeue();
                    debug_assert_eq!(removed.as_ref(), Some(&head));
                    report.dispatched += 1;

                    let waited_ms = (Utc::now() - head.enqueued_at).num_milliseconds();
                    info!(
                        session_id = %head.session_id,
                        job_id = ?head.job_id,
                        waited_ms,
                        "Buffered job dispatched"
                    );
                }
                Err(e) => {
                    warn!(
                        session_id = %head.session_id,
                        error = %e,
                        "Drain dispatch failed, will retry next tick"
                    );
                    report.failure = Some(e);
                    break;
                }
            }
        }

        report.remaining = self.buffered();
        if report.dispatched > 0 {
            debug!(
                dispatched = report.dispatched,
                remaining = report.remaining,
                "Drain cycle finished"
            );
        }
        report
    }

    /// Release a session slot. No-op if the session is not active.
    pub fn release(&self, session_id: &str) -> bool {
        let released = lock(&self.gate).release(session_id);
        lock(&self.in_flight).retain(|_, session| session != session_id);
        if released {
            info!(session_id = %session_id, "Session released");
        }
        released
    }

    /// Mark the job `job_id` finished. Its session is released once no other
    /// job of that session is still in flight.
    ///
    /// Returns the job's session id, or `None` if the job is unknown.
    pub fn complete(&self, job_id: &str) -> Option<String> {
        let mut in_flight = lock(&self.in_flight);
        let session_id = in_flight.remove(job_id)?;
        let pending = in_flight.values().filter(|s| **s == session_id).count();
        if pending > 0 {
            debug!(
                job_id = %job_id,
                session_id = %session_id,
                pending,
                "Job completed, session still busy"
            );
            return Some(session_id);
        }
        lock(&self.gate).release(&session_id);
        drop(in_flight);
        info!(job_id = %job_id, session_id = %session_id, "Job completed, session released");
        Some(session_id)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.gate).active_count()
    }

    pub fn has_capacity(&self) -> bool {
        lock(&self.gate).has_capacity()
    }

    pub fn max_active_sessions(&self) -> usize {
        lock(&self.gate).max_active()
    }

    /// Number of buffered submissions.
    pub fn buffered(&self) -> usize {
        lock(&self.buffer).len()
    }

    /// Buffered submissions in drain order.
    pub fn buffer_snapshot(&self) -> Vec<QueuedSubmission> {
        lock(&self.buffer).snapshot()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.publisher.connection_state()
    }

    /// Publish one job under an already-taken reservation, rolling back on failure.
    async fn dispatch(
        &self,
        text: &str,
        session_id: &str,
        job_id: Option<&str>,
        reservation: Reservation,
    ) -> Result<(), DispatchError> {
        let job = OutboundJob {
            text: text.to_string(),
            session_id: session_id.to_string(),
            job_id: job_id.map(str::to_string),
        };

        // Tracked before publishing: a worker may answer before publish returns
        if let Some(job_id) = job_id {
            lock(&self.in_flight).insert(job_id.to_string(), session_id.to_string());
        }

        match self.publisher.publish_job(&job).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(job_id) = job_id {
                    lock(&self.in_flight).remove(job_id);
                }
                if reservation.needs_rollback() {
                    lock(&self.gate).release(session_id);
                }
                warn!(
                    session_id = %session_id,
                    error = %e,
                    "Failed to submit job, reservation rolled back"
                );
                Err(DispatchError::from_publish(session_id, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::dispatch::DispatchStatus;
    use crate::error::BrokerError;

    /// Scripted publisher: records jobs, fails according to a queue of outcomes.
    #[derive(Default)]
    struct FakePublisher {
        sent: Mutex<Vec<OutboundJob>>,
        outcomes: Mutex<VecDeque<Result<(), BrokerError>>>,
        delay: Option<Duration>,
    }

    impl FakePublisher {
        fn failing_next(self, errors: Vec<BrokerError>) -> Self {
            *lock(&self.outcomes) = errors.into_iter().map(Err).collect();
            self
        }

        fn sent_sessions(&self) -> Vec<String> {
            lock(&self.sent).iter().map(|j| j.session_id.clone()).collect()
        }
    }

    #[async_trait]
    impl JobPublisher for FakePublisher {
        async fn publish_job(&self, job: &OutboundJob) -> Result<(), BrokerError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let outcome = lock(&self.outcomes).pop_front().unwrap_or(Ok(()));
            if outcome.is_ok() {
                lock(&self.sent).push(job.clone());
            }
            outcome
        }

        fn connection_state(&self) -> ConnectionState {
            ConnectionState::Connected
        }
    }

    fn transport_error() -> BrokerError {
        BrokerError::Publish {
            queue: "jobs".into(),
            reason: "socket reset".into(),
        }
    }

    fn coordinator(publisher: FakePublisher) -> (DispatchCoordinator, Arc<FakePublisher>) {
        let publisher = Arc::new(publisher);
        (DispatchCoordinator::new(3, publisher.clone()), publisher)
    }

    fn buffered_ids(coordinator: &DispatchCoordinator) -> Vec<String> {
        coordinator
            .buffer_snapshot()
            .into_iter()
            .map(|s| s.session_id)
            .collect()
    }

    #[tokio::test]
    async fn submits_until_ceiling_then_queues_in_order() {
        let (coordinator, publisher) = coordinator(FakePublisher::default());

        for id in ["s1", "s2", "s3"] {
            let result = coordinator.submit(JobRequest::new("t", id)).await.unwrap();
            assert_eq!(result.status, DispatchStatus::Submitted);
        }
        for id in ["a", "b", "c"] {
            let result = coordinator.submit(JobRequest::new("t", id)).await.unwrap();
            assert_eq!(result.status, DispatchStatus::Queued);
        }

        assert_eq!(coordinator.active_count(), 3);
        assert_eq!(buffered_ids(&coordinator), vec!["a", "b", "c"]);
        assert_eq!(publisher.sent_sessions(), vec!["s1", "s2", "s3"]);
    }

    #[tokio::test]
    async fn empty_session_id_is_rejected() {
        let (coordinator, publisher) = coordinator(FakePublisher::default());

        let err = coordinator.submit(JobRequest::new("t", "")).await.unwrap_err();

        assert!(matches!(err, DispatchError::InvalidArgument(_)));
        assert_eq!(coordinator.active_count(), 0);
        assert_eq!(coordinator.buffered(), 0);
        assert!(publisher.sent_sessions().is_empty());
    }

    #[tokio::test]
    async fn failed_publish_rolls_back_exactly() {
        let (coordinator, _) =
            coordinator(FakePublisher::default().failing_next(vec![transport_error()]));
        let before = coordinator.active_count();

        let err = coordinator.submit(JobRequest::new("t", "s1")).await.unwrap_err();

        assert!(matches!(err, DispatchError::DispatchFailed { .. }));
        assert_eq!(coordinator.active_count(), before);
        assert_eq!(coordinator.buffered(), 0);
    }

    #[tokio::test]
    async fn unavailable_channel_is_reported_and_rolled_back() {
        let (coordinator, _) = coordinator(FakePublisher::default().failing_next(vec![
            BrokerError::ChannelUnavailable {
                state: ConnectionState::Reconnecting,
            },
        ]));

        let err = coordinator.submit(JobRequest::new("t", "s1")).await.unwrap_err();

        assert!(matches!(err, DispatchError::ChannelUnavailable { .. }));
        assert_eq!(coordinator.active_count(), 0);
    }

    #[tokio::test]
    async fn failed_publish_for_active_session_keeps_its_slot() {
        let (coordinator, publisher) = coordinator(FakePublisher::default());
        coordinator.submit(JobRequest::new("first", "s1")).await.unwrap();
        *lock(&publisher.outcomes) = VecDeque::from(vec![Err(transport_error())]);

        assert!(coordinator.submit(JobRequest::new("second", "s1")).await.is_err());

        assert_eq!(coordinator.active_count(), 1);
    }

    #[tokio::test]
    async fn drain_promotes_head_after_release() {
        let (coordinator, publisher) = coordinator(FakePublisher::default());
        for id in ["s1", "s2", "s3", "s4"] {
            coordinator.submit(JobRequest::new("t", id)).await.unwrap();
        }
        assert_eq!(coordinator.buffered(), 1);

        assert!(coordinator.release("s1"));
        let report = coordinator.drain_step().await;

        assert_eq!(report.dispatched, 1);
        assert_eq!(report.remaining, 0);
        assert!(report.failure.is_none());
        assert_eq!(coordinator.active_count(), 3);
        assert_eq!(publisher.sent_sessions().last().map(String::as_str), Some("s4"));
    }

    #[tokio::test]
    async fn drain_stops_at_capacity_and_keeps_order() {
        let (coordinator, _) = coordinator(FakePublisher::default());
        for id in ["s1", "s2", "s3", "a", "b", "c"] {
            coordinator.submit(JobRequest::new("t", id)).await.unwrap();
        }

        coordinator.release("s1");
        let report = coordinator.drain_step().await;

        assert_eq!(report.dispatched, 1);
        assert_eq!(buffered_ids(&coordinator), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn failed_drain_leaves_buffer_untouched() {
        let (coordinator, publisher) = coordinator(FakePublisher::default());
        for id in ["s1", "s2", "s3", "a", "b"] {
            coordinator.submit(JobRequest::new("t", id)).await.unwrap();
        }
        coordinator.release("s1");
        *lock(&publisher.outcomes) = VecDeque::from(vec![Err(transport_error())]);

        let report = coordinator.drain_step().await;

        assert_eq!(report.dispatched, 0);
        assert!(matches!(
            report.failure,
            Some(DispatchError::DispatchFailed { .. })
        ));
        assert_eq!(buffered_ids(&coordinator), vec!["a", "b"]);
        assert_eq!(coordinator.active_count(), 2);

        // Next tick succeeds
        let report = coordinator.drain_step().await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(buffered_ids(&coordinator), vec!["b"]);
    }

    #[tokio::test]
    async fn drain_on_empty_buffer_is_noop() {
        let (coordinator, _) = coordinator(FakePublisher::default());
        let report = coordinator.drain_step().await;
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.remaining, 0);
        assert!(!report.skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_drain_cycles_are_skipped() {
        let publisher = FakePublisher {
            delay: Some(Duration::from_secs(1)),
            ..FakePublisher::default()
        };
        let publisher = Arc::new(publisher);
        let coordinator = Arc::new(DispatchCoordinator::new(1, publisher.clone()));
        coordinator.submit(JobRequest::new("t", "s1")).await.unwrap();
        coordinator.submit(JobRequest::new("t", "s2")).await.unwrap();
        coordinator.release("s1");

        let first = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.drain_step().await }
        });
        tokio::task::yield_now().await;
        let second = coordinator.drain_step().await;

        assert!(second.skipped);
        let first = first.await.unwrap();
        assert_eq!(first.dispatched, 1);
        assert_eq!(publisher.sent_sessions(), vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn concurrent_submits_never_exceed_ceiling() {
        let publisher = Arc::new(FakePublisher {
            delay: Some(Duration::from_millis(5)),
            ..FakePublisher::default()
        });
        let coordinator = Arc::new(DispatchCoordinator::new(3, publisher));

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    let result = coordinator
                        .submit(JobRequest::new("t", format!("s{i}")))
                        .await
                        .unwrap();
                    assert!(coordinator.active_count() <= 3);
                    result.status
                })
            })
            .collect();

        let mut submitted = 0;
        for handle in handles {
            if handle.await.unwrap() == DispatchStatus::Submitted {
                submitted += 1;
            }
        }
        assert_eq!(submitted, 3);
        assert_eq!(coordinator.active_count(), 3);
        assert_eq!(coordinator.buffered(), 17);
    }

    #[tokio::test]
    async fn complete_releases_session_of_job() {
        let (coordinator, _) = coordinator(FakePublisher::default());
        coordinator
            .submit(JobRequest::new("t", "s1").with_job_id("job-1"))
            .await
            .unwrap();

        assert_eq!(coordinator.complete("job-1").as_deref(), Some("s1"));
        assert_eq!(coordinator.active_count(), 0);
        assert!(coordinator.complete("job-1").is_none());
    }

    #[tokio::test]
    async fn session_stays_active_until_its_last_job_completes() {
        let (coordinator, _) = coordinator(FakePublisher::default());
        for job in ["job-1", "job-2"] {
            coordinator
                .submit(JobRequest::new("t", "s1").with_job_id(job))
                .await
                .unwrap();
        }
        assert_eq!(coordinator.active_count(), 1);

        assert_eq!(coordinator.complete("job-1").as_deref(), Some("s1"));
        assert_eq!(coordinator.active_count(), 1);

        assert_eq!(coordinator.complete("job-2").as_deref(), Some("s1"));
        assert_eq!(coordinator.active_count(), 0);
    }

    #[tokio::test]
    async fn queued_result_carries_correlation_id() {
        let (coordinator, _) = coordinator(FakePublisher::default());
        for id in ["s1", "s2", "s3"] {
            coordinator.submit(JobRequest::new("t", id)).await.unwrap();
        }

        let result = coordinator
            .submit(JobRequest::new("t", "s4").with_job_id("job-4"))
            .await
            .unwrap();

        assert_eq!(result.status, DispatchStatus::Queued);
        assert_eq!(result.correlation_id.as_deref(), Some("job-4"));
        assert_eq!(
            coordinator.buffer_snapshot()[0].job_id.as_deref(),
            Some("job-4")
        );
    }
}
