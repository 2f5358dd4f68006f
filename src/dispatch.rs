//! Rate-limited dispatch of annotation calls.
//!
//! The limiter is the only state shared between in-flight calls. Dispatch is
//! sequential when the concurrency bound is 1, otherwise a semaphore caps the
//! number of tasks in a `JoinSet`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use crate::annotation::{AnnotationRequest, Annotator};
use crate::error::AnnotationError;
use crate::models::Annotation;

pub type Outcome = (usize, Result<Annotation, AnnotationError>);

/// Leaky-bucket scheduler: each caller reserves the next free slot and
/// waits for it. Slots are `interval` apart.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn per_minute(requests: u32) -> Self {
        Self::new(Duration::from_secs(60) / requests.max(1))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot
        };
        sleep_until(slot).await;
    }
}

pub struct AnnotationDispatcher {
    annotator: Arc<dyn Annotator>,
    limiter: Arc<RateLimiter>,
    concurrency: usize,
    stop: Arc<AtomicBool>,
}

impl AnnotationDispatcher {
    pub fn new(annotator: Arc<dyn Annotator>, limiter: Arc<RateLimiter>, concurrency: usize) -> Self {
        Self {
            annotator,
            limiter,
            concurrency: concurrency.max(1),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares an externally owned stop flag, e.g. one set by a signal handler.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Returns one outcome per request. Once stop is requested no new calls
    /// are issued and the remaining students are marked cancelled. Outcome
    /// order is unspecified when running in parallel.
    pub async fn dispatch(&self, requests: Vec<(usize, AnnotationRequest)>) -> Vec<Outcome> {
        let total = requests.len();
        info!(total, concurrency = self.concurrency, "dispatching annotations");
        let outcomes = if self.concurrency == 1 {
            self.dispatch_sequential(requests).await
        } else {
            self.dispatch_parallel(requests).await
        };
        let failed = outcomes.iter().filter(|(_, r)| r.is_err()).count();
        info!(total, failed, "annotation dispatch complete");
        outcomes
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    async fn dispatch_sequential(&self, requests: Vec<(usize, AnnotationRequest)>) -> Vec<Outcome> {
        let total = requests.len();
        let mut outcomes = Vec::with_capacity(total);
        for (done, (student_id, request)) in requests.into_iter().enumerate() {
            if self.stopped() {
                outcomes.push((student_id, Err(AnnotationError::Cancelled)));
                continue;
            }
            self.limiter.acquire().await;
            // the stop flag may flip while waiting for a rate-limit slot
            if self.stopped() {
                outcomes.push((student_id, Err(AnnotationError::Cancelled)));
                continue;
            }
            let result = self.annotator.annotate(&request).await;
            if let Err(err) = &result {
                warn!(student_id, error = %err, "annotation failed");
            }
            outcomes.push((student_id, result));
            if (done + 1) % 10 == 0 {
                info!("annotated {}/{} students", done + 1, total);
            }
        }
        outcomes
    }

    async fn dispatch_parallel(&self, requests: Vec<(usize, AnnotationRequest)>) -> Vec<Outcome> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut outcomes = Vec::with_capacity(requests.len());
        let mut pending = Vec::new();

        for (student_id, request) in requests {
            if self.stopped() {
                outcomes.push((student_id, Err(AnnotationError::Cancelled)));
                continue;
            }
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    outcomes.push((student_id, Err(AnnotationError::Cancelled)));
                    continue;
                }
            };
            // the stop flag may flip while waiting for a permit
            if self.stopped() {
                outcomes.push((student_id, Err(AnnotationError::Cancelled)));
                continue;
            }
            let annotator = Arc::clone(&self.annotator);
            let limiter = Arc::clone(&self.limiter);
            let stop = Arc::clone(&self.stop);
            let handle = tasks.spawn(async move {
                let _permit = permit;
                limiter.acquire().await;
                if stop.load(Ordering::Relaxed) {
                    return (student_id, Err(AnnotationError::Cancelled));
                }
                (student_id, annotator.annotate(&request).await)
            });
            pending.push((handle.id(), student_id));
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, (student_id, result))) => {
                    if let Err(err) = &result {
                        warn!(student_id, error = %err, "annotation failed");
                    }
                    outcomes.push((student_id, result));
                }
                Err(join_err) => {
                    let task_id = join_err.id();
                    if let Some((_, student_id)) = pending.iter().find(|(id, _)| *id == task_id) {
                        warn!(student_id = *student_id, error = %join_err, "annotation task aborted");
                        outcomes.push((
                            *student_id,
                            Err(AnnotationError::Transport(join_err.to_string())),
                        ));
                    }
                }
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::models::RiskLevel;

    struct CountingAnnotator {
        calls: AtomicUsize,
        fail_on: Option<usize>,
        stop_after: Option<(usize, Arc<AtomicBool>)>,
    }

    impl CountingAnnotator {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on: None,
                stop_after: None,
            }
        }
    }

    #[async_trait]
    impl Annotator for CountingAnnotator {
        async fn annotate(&self, request: &AnnotationRequest) -> Result<Annotation, AnnotationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((after, flag)) = &self.stop_after {
                if call >= *after {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            if self.fail_on == Some(request.missing_assignments as usize) {
                return Err(AnnotationError::Malformed("garbage".to_string()));
            }
            Ok(Annotation {
                risk_score: request.final_grade,
                risk_level: RiskLevel::Low,
                key_risk_reasons: Vec::new(),
                interventions: Vec::new(),
            })
        }
    }

    fn requests(n: usize) -> Vec<(usize, AnnotationRequest)> {
        (0..n)
            .map(|i| {
                (
                    i,
                    AnnotationRequest {
                        attendance_pct: 100.0,
                        final_grade: i as f64,
                        trend_recent: 0.0,
                        missing_assignments: 0,
                    },
                )
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_spaces_calls_by_interval() {
        let limiter = RateLimiter::per_minute(15);
        assert_eq!(limiter.interval(), Duration::from_secs(4));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_secs(8));
        assert!(start.elapsed() < Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_dispatch_preserves_order() {
        let annotator = Arc::new(CountingAnnotator::new());
        let dispatcher = AnnotationDispatcher::new(
            annotator.clone(),
            Arc::new(RateLimiter::new(Duration::from_secs(4))),
            1,
        );
        let outcomes = dispatcher.dispatch(requests(4)).await;
        let ids: Vec<usize> = outcomes.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(outcomes.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(annotator.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_dispatch_covers_every_student_under_the_rate_limit() {
        let annotator = Arc::new(CountingAnnotator::new());
        let dispatcher = AnnotationDispatcher::new(
            annotator,
            Arc::new(RateLimiter::new(Duration::from_secs(4))),
            3,
        );
        let start = Instant::now();
        let outcomes = dispatcher.dispatch(requests(6)).await;
        let ids: HashSet<usize> = outcomes.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids.len(), 6);
        assert!(start.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_stay_per_student() {
        let mut annotator = CountingAnnotator::new();
        annotator.fail_on = Some(1);
        let mut reqs = requests(3);
        reqs[1].1.missing_assignments = 1;
        let dispatcher = AnnotationDispatcher::new(
            Arc::new(annotator),
            Arc::new(RateLimiter::new(Duration::from_millis(10))),
            1,
        );
        let outcomes = dispatcher.dispatch(reqs).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].1.is_ok());
        assert!(outcomes[1].1.is_err());
        assert!(outcomes[2].1.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flag_cancels_remaining_students() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut annotator = CountingAnnotator::new();
        annotator.stop_after = Some((2, Arc::clone(&stop)));
        let annotator = Arc::new(annotator);
        let dispatcher = AnnotationDispatcher::new(
            annotator.clone(),
            Arc::new(RateLimiter::new(Duration::from_millis(10))),
            1,
        )
        .with_stop_flag(stop);

        let outcomes = dispatcher.dispatch(requests(5)).await;
        assert_eq!(outcomes.len(), 5);
        assert_eq!(annotator.calls.load(Ordering::SeqCst), 2);
        let cancelled = outcomes
            .iter()
            .filter(|(_, r)| matches!(r, Err(AnnotationError::Cancelled)))
            .count();
        assert_eq!(cancelled, 3);
    }

    fn stop_while_waiting(after: Duration) -> Arc<AtomicBool> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            flag.store(true, Ordering::SeqCst);
        });
        stop
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_rate_limit_wait_skips_the_call() {
        let annotator = Arc::new(CountingAnnotator::new());
        let dispatcher = AnnotationDispatcher::new(
            annotator.clone(),
            Arc::new(RateLimiter::new(Duration::from_secs(4))),
            1,
        )
        .with_stop_flag(stop_while_waiting(Duration::from_secs(1)));

        let outcomes = dispatcher.dispatch(requests(2)).await;
        assert_eq!(annotator.calls.load(Ordering::SeqCst), 1);
        assert!(outcomes[0].1.is_ok());
        assert!(matches!(outcomes[1].1, Err(AnnotationError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_stop_during_rate_limit_wait_skips_the_call() {
        let annotator = Arc::new(CountingAnnotator::new());
        let dispatcher = AnnotationDispatcher::new(
            annotator.clone(),
            Arc::new(RateLimiter::new(Duration::from_secs(4))),
            2,
        )
        .with_stop_flag(stop_while_waiting(Duration::from_secs(1)));

        let outcomes = dispatcher.dispatch(requests(2)).await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(annotator.calls.load(Ordering::SeqCst), 1);
        let cancelled = outcomes
            .iter()
            .filter(|(_, r)| matches!(r, Err(AnnotationError::Cancelled)))
            .count();
        assert_eq!(cancelled, 1);
    }
}
