//! Per-dataset recording of pipeline invocations.
//!
//! Each invocation runs inside a [`RecordingScope`]: opened right before the
//! pipeline is called and closed right after. Closing persists the record and
//! queues its feedback computations; a scope dropped without being closed
//! persists a failed record so nothing is left half-submitted.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

use crate::error::{HarnessError, Result};
use crate::pipeline::{PipelineOutput, QueryPipeline};
use crate::scoring::FeedbackKind;
use crate::store::{FeedbackStatus, MetricsStore, NewRecord};

/// A query whose invocation did not produce a scorable record.
#[derive(Debug)]
pub struct FailureRecord {
    pub record_id: Option<String>,
    pub error: HarnessError,
}

pub struct Recorder {
    store: Arc<MetricsStore>,
    app_id: String,
    run_id: String,
    feedbacks: Vec<FeedbackKind>,
}

impl Recorder {
    pub fn new(
        store: Arc<MetricsStore>,
        recipe: &str,
        app_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Result<Self> {
        let app_id = app_id.into();
        let run_id = run_id.into();
        store.register_app(&app_id, recipe, &run_id)?;

        Ok(Self {
            store,
            app_id,
            run_id,
            feedbacks: FeedbackKind::ALL.to_vec(),
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Open a scope for `query`; `expected` is its golden answer, if any.
    pub fn open(&self, query: &str, expected: Option<&str>) -> RecordingScope<'_> {
        RecordingScope {
            recorder: self,
            query: query.to_string(),
            expected: expected.map(str::to_string),
            started: Instant::now(),
            closed: false,
        }
    }

    /// Invoke `pipeline` on `query` inside a recording scope. Pipeline errors
    /// and panics come back as a [`FailureRecord`]; they never escape.
    pub async fn invoke(
        &self,
        pipeline: &Arc<dyn QueryPipeline>,
        query: &str,
        expected: Option<&str>,
    ) -> std::result::Result<String, FailureRecord> {
        let scope = self.open(query, expected);

        let task_pipeline = Arc::clone(pipeline);
        let task_query = query.to_string();
        let joined = tokio::spawn(async move { task_pipeline.invoke(&task_query).await }).await;

        match joined {
            Ok(Ok(output)) => scope.succeed(&output),
            Ok(Err(e)) => Err(scope.fail(format!("{:#}", e))),
            Err(e) => Err(scope.fail(format!("pipeline task panicked: {}", e))),
        }
    }

    fn persist(
        &self,
        query: &str,
        expected: Option<&str>,
        output: Option<&PipelineOutput>,
        error: Option<&str>,
        latency_ms: u64,
    ) -> Result<String> {
        let contexts = output.map(|o| o.contexts.as_slice()).unwrap_or(&[]);
        let status = if error.is_some() {
            FeedbackStatus::Failed
        } else {
            FeedbackStatus::Waiting
        };
        let record = NewRecord {
            app_id: &self.app_id,
            run_id: &self.run_id,
            input: query,
            output: output.map(|o| o.answer.as_str()),
            contexts,
            expected,
            error,
            latency_ms,
        };
        self.store.insert_record(&record, &self.feedbacks, status)
    }
}

pub struct RecordingScope<'a> {
    recorder: &'a Recorder,
    query: String,
    expected: Option<String>,
    started: Instant,
    closed: bool,
}

impl RecordingScope<'_> {
    fn latency_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Persist the output and queue its feedbacks for deferred scoring.
    pub fn succeed(
        mut self,
        output: &PipelineOutput,
    ) -> std::result::Result<String, FailureRecord> {
        self.closed = true;
        let latency = self.latency_ms();
        let expected = self.expected.as_deref();
        match self
            .recorder
            .persist(&self.query, expected, Some(output), None, latency)
        {
            Ok(record_id) => {
                debug!(
                    app_id = %self.recorder.app_id,
                    record_id = %record_id,
                    latency_ms = %latency,
                    "Recorded query"
                );
                Ok(record_id)
            }
            Err(e) => {
                error!(
                    app_id = %self.recorder.app_id,
                    query = %self.query,
                    error = %e,
                    "Failed to record query"
                );
                Err(FailureRecord {
                    record_id: None,
                    error: e,
                })
            }
        }
    }

    /// Persist a failed invocation; its feedbacks are marked failed.
    pub fn fail(mut self, message: String) -> FailureRecord {
        self.closed = true;
        let latency = self.latency_ms();
        let expected = self.expected.as_deref();
        let record_id = match self
            .recorder
            .persist(&self.query, expected, None, Some(&message), latency)
        {
            Ok(id) => Some(id),
            Err(e) => {
                error!(app_id = %self.recorder.app_id, error = %e, "Failed to record query failure");
                None
            }
        };
        FailureRecord {
            record_id,
            error: HarnessError::QueryInvocation {
                query: self.query.clone(),
                message,
            },
        }
    }
}

impl Drop for RecordingScope<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let latency = self.latency_ms();
        if let Err(e) = self.recorder.persist(
            &self.query,
            self.expected.as_deref(),
            None,
            Some("invocation abandoned before completion"),
            latency,
        ) {
            error!(app_id = %self.recorder.app_id, error = %e, "Failed to record abandoned query");
        }
    }
}
