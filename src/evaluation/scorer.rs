//! Background scorer: a pool of workers draining waiting feedbacks from the
//! metrics store.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{HarnessError, Result};
use crate::scoring::{self, FeedbackOutcome, ScoringError, ScoringProvider};
use crate::store::{ClaimedFeedback, MetricsStore};

#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub workers: usize,
    pub idle_poll: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub call_timeout: Duration,
}

impl ScorerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.scorer_workers,
            idle_poll: Duration::from_millis(config.scorer_idle_poll_ms),
            max_attempts: config.scoring_max_attempts,
            retry_backoff: Duration::from_millis(config.scoring_retry_backoff_ms),
            call_timeout: Duration::from_secs(config.scoring_timeout_secs),
        }
    }

    #[cfg(test)]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[cfg(test)]
    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    #[cfg(test)]
    pub fn with_retries(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_backoff = backoff;
        self
    }
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            idle_poll: Duration::from_millis(250),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            call_timeout: Duration::from_secs(120),
        }
    }
}

pub struct Scorer {
    store: Arc<MetricsStore>,
    provider: Arc<dyn ScoringProvider>,
    config: ScorerConfig,
}

impl Scorer {
    pub fn new(
        store: Arc<MetricsStore>,
        provider: Arc<dyn ScoringProvider>,
        config: ScorerConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Start the worker pool.
    pub fn spawn(self) -> Result<ScorerHandle> {
        let recovered = self.store.recover_stalled()?;
        if recovered > 0 {
            info!(recovered = %recovered, "Requeued stalled feedbacks");
        }

        let cancel = CancellationToken::new();
        let workers = (0..self.config.workers.max(1))
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    store: Arc::clone(&self.store),
                    provider: Arc::clone(&self.provider),
                    config: self.config.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect::<Vec<_>>();

        info!(
            provider = %self.provider.name(),
            workers = %workers.len(),
            "Scorer started"
        );
        Ok(ScorerHandle { cancel, workers })
    }
}

pub struct ScorerHandle {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl ScorerHandle {
    /// Signal workers without waiting for them.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Signal every worker to halt and wait up to `grace` for them.
    pub async fn stop(self, grace: Duration) -> Result<()> {
        self.cancel.cancel();
        let total = self.workers.len();

        match tokio::time::timeout(grace, futures::future::join_all(self.workers)).await {
            Ok(results) => {
                let panicked = results.iter().filter(|r| r.is_err()).count();
                if panicked > 0 {
                    return Err(HarnessError::ScorerShutdown(format!(
                        "{} of {} workers panicked",
                        panicked, total
                    )));
                }
                info!(workers = %total, "Scorer stopped");
                Ok(())
            }
            Err(_) => Err(HarnessError::ScorerShutdown(format!(
                "workers did not stop within {:?}",
                grace
            ))),
        }
    }
}

struct Worker {
    id: usize,
    store: Arc<MetricsStore>,
    provider: Arc<dyn ScoringProvider>,
    config: ScorerConfig,
    cancel: CancellationToken,
}

enum Attempt {
    Finished(std::result::Result<FeedbackOutcome, ScoringError>),
    Cancelled,
}

impl Worker {
    async fn run(self) {
        debug!(worker = %self.id, "Scorer worker started");
        while !self.cancel.is_cancelled() {
            match self.store.claim_next() {
                Ok(Some(job)) => self.score(job).await,
                Ok(None) => {
                    if !self.idle().await {
                        break;
                    }
                }
                Err(e) => {
                    error!(worker = %self.id, error = %e, "Failed to claim feedback");
                    if !self.idle().await {
                        break;
                    }
                }
            }
        }
        debug!(worker = %self.id, "Scorer worker stopped");
    }

    /// Sleep one idle period. Returns false when cancelled.
    async fn idle(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.idle_poll) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    async fn attempt(&self, job: &ClaimedFeedback) -> Attempt {
        let call = scoring::evaluate(self.provider.as_ref(), job.kind, &job.input);
        tokio::select! {
            res = tokio::time::timeout(self.config.call_timeout, call) => match res {
                Ok(outcome) => Attempt::Finished(outcome),
                Err(_) => Attempt::Finished(Err(ScoringError::Timeout(self.config.call_timeout))),
            },
            _ = self.cancel.cancelled() => Attempt::Cancelled,
        }
    }

    async fn score(&self, job: ClaimedFeedback) {
        let mut attempt_no = job.attempts;
        loop {
            let result = match self.attempt(&job).await {
                Attempt::Finished(result) => result,
                Attempt::Cancelled => {
                    self.write(self.store.release(job.id), job.id);
                    return;
                }
            };

            match result {
                Ok(FeedbackOutcome::Score(score)) => {
                    debug!(
                        feedback = %job.kind,
                        record_id = %job.record_id,
                        score = %score,
                        "Feedback done"
                    );
                    self.write(self.store.complete(job.id, score), job.id);
                    return;
                }
                Ok(FeedbackOutcome::Skip(reason)) => {
                    debug!(
                        feedback = %job.kind,
                        record_id = %job.record_id,
                        reason = %reason,
                        "Feedback skipped"
                    );
                    self.write(self.store.skip(job.id, &reason), job.id);
                    return;
                }
                Err(e) if attempt_no < self.config.max_attempts => {
                    warn!(
                        feedback = %job.kind,
                        record_id = %job.record_id,
                        attempt = %attempt_no,
                        error = %e,
                        "Feedback attempt failed, retrying"
                    );
                    attempt_no += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_backoff) => {}
                        _ = self.cancel.cancelled() => {
                            self.write(self.store.release(job.id), job.id);
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!(
                        feedback = %job.kind,
                        record_id = %job.record_id,
                        attempts = %attempt_no,
                        error = %e,
                        "Feedback failed"
                    );
                    self.write(self.store.fail(job.id, &e.to_string()), job.id);
                    return;
                }
            }
        }
    }

    fn write(&self, result: Result<()>, feedback_id: i64) {
        if let Err(e) = result {
            error!(worker = %self.id, feedback_id = %feedback_id, error = %e, "Failed to write feedback status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::{FeedbackKind, LexicalProvider};
    use crate::store::{FeedbackStatus, NewRecord, StatusCounts};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type ScoreResult = std::result::Result<f64, ScoringError>;

    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl ScoringProvider for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn answer_correctness(&self, _: &str, _: &str, _: &str) -> ScoreResult {
            self.next()
        }

        async fn answer_relevance(&self, _: &str, _: &str) -> ScoreResult {
            self.next()
        }

        async fn context_relevance(&self, _: &str, _: &str) -> ScoreResult {
            self.next()
        }

        async fn groundedness(&self, _: &[String], _: &str) -> ScoreResult {
            self.next()
        }
    }

    impl Flaky {
        fn next(&self) -> ScoreResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(ScoringError::Response("rate limited".into()))
            } else {
                Ok(0.5)
            }
        }
    }

    fn fast_config() -> ScorerConfig {
        ScorerConfig::default()
            .with_workers(2)
            .with_idle_poll(Duration::from_millis(5))
            .with_retries(2, Duration::from_millis(1))
    }

    fn seed_store(queries: usize) -> Arc<MetricsStore> {
        let store = Arc::new(MetricsStore::open_in_memory().unwrap());
        let contexts = vec!["the harbor froze".to_string()];
        for i in 0..queries {
            let input = format!("when did the harbor freeze {}", i);
            store
                .insert_record(
                    &NewRecord {
                        app_id: "Essays",
                        run_id: "run",
                        input: &input,
                        output: Some("the harbor froze in january"),
                        contexts: &contexts,
                        expected: Some("january"),
                        error: None,
                        latency_ms: 1,
                    },
                    &FeedbackKind::ALL,
                    FeedbackStatus::Waiting,
                )
                .unwrap();
        }
        store
    }

    async fn wait_for_finished(store: &MetricsStore, expected: u64) -> StatusCounts {
        for _ in 0..500 {
            let counts = store.status_counts().unwrap();
            if counts.finished() >= expected {
                return counts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scorer did not finish: {:?}", store.status_counts().unwrap());
    }

    #[tokio::test]
    async fn test_scores_all_waiting() {
        let store = seed_store(3);
        let provider = Arc::new(LexicalProvider::new());
        let handle = Scorer::new(Arc::clone(&store), provider, fast_config())
            .spawn()
            .unwrap();

        let counts = wait_for_finished(&store, 12).await;
        assert_eq!(counts.done, 12);
        handle.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let store = seed_store(1);
        let provider = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 1,
        });
        let handle = Scorer::new(Arc::clone(&store), provider, fast_config().with_workers(1))
            .spawn()
            .unwrap();

        let counts = wait_for_finished(&store, 4).await;
        assert_eq!(counts.done, 4);
        assert_eq!(counts.failed, 0);
        handle.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fail() {
        let store = seed_store(1);
        let provider = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
        });
        let handle = Scorer::new(Arc::clone(&store), provider, fast_config())
            .spawn()
            .unwrap();

        let counts = wait_for_finished(&store, 4).await;
        assert_eq!(counts.failed, 4);
        handle.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_idle_scorer() {
        let store = Arc::new(MetricsStore::open_in_memory().unwrap());
        let handle = Scorer::new(store, Arc::new(LexicalProvider::new()), fast_config())
            .spawn()
            .unwrap();
        assert!(handle.stop(Duration::from_secs(5)).await.is_ok());
    }
}
