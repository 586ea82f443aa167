//! Evaluation lifecycle controller.
//!
//! Drives a query pipeline over every dataset batch in sequence while the
//! background scorer works through the deferred feedbacks, then drains until
//! every submitted feedback has finished or the run is interrupted.
//!
//! `Idle -> Evaluating -> Draining -> Stopped`

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::progress::{
    Lifecycle, LifecycleState, ProgressDisplay, ProgressState, StatusTransition, PROGRESS_LEGEND,
};
use super::recorder::Recorder;
use super::scorer::{Scorer, ScorerConfig, ScorerHandle};
use crate::dataset::{Dataset, GoldenAnswer};
use crate::error::Result;
use crate::pipeline::QueryPipeline;
use crate::sampling::{self, SampleSpec};
use crate::scoring::{ScoringProvider, FEEDBACKS_PER_QUERY};
use crate::signal::Shutdown;
use crate::store::{MetricsStore, StatusCounts};

/// The queries selected for one dataset in this run.
#[derive(Debug, Clone)]
pub struct QueryBatch {
    pub dataset: String,
    pub app_id: String,
    pub queries: Vec<String>,
    pub golden_set: Vec<GoldenAnswer>,
}

impl QueryBatch {
    /// Load each dataset, narrow it with `sample` when given, and assign
    /// application ids. Ids are dataset names, suffixed when a dataset
    /// appears more than once.
    pub fn prepare(
        datasets: &[Box<dyn Dataset>],
        sample: Option<SampleSpec>,
        seed: u64,
    ) -> Result<Vec<QueryBatch>> {
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut batches = Vec::with_capacity(datasets.len());

        for dataset in datasets {
            let (queries, golden_set) = dataset.queries_and_golden_set()?;
            let available = queries.len();
            let (queries, golden_set) = match sample {
                Some(spec) => sampling::sample(&queries, &golden_set, spec, seed)?,
                None => (queries, golden_set),
            };

            let app_id = unique_app_id(dataset.name(), &mut seen);
            info!(
                dataset = %dataset.name(),
                kind = %dataset.kind(),
                subsets = ?dataset.subsets(),
                app_id = %app_id,
                selected = %queries.len(),
                available = %available,
                "Prepared query batch"
            );
            batches.push(QueryBatch {
                dataset: dataset.name().to_string(),
                app_id,
                queries,
                golden_set,
            });
        }
        Ok(batches)
    }
}

fn unique_app_id(name: &str, seen: &mut HashMap<String, usize>) -> String {
    let count = seen.entry(name.to_string()).or_insert(0);
    *count += 1;
    if *count == 1 {
        name.to_string()
    } else {
        format!("{}-{}", name, count)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub recipe: String,
    pub run_id: String,
    pub total_queries: u64,
    pub finished_queries: u64,
    pub failed_queries: u64,
    pub total_feedbacks: u64,
    pub counts: StatusCounts,
    pub interrupted: bool,
    pub elapsed_ms: u64,
    pub transitions: Vec<StatusTransition>,
}

pub struct EvaluationController {
    recipe: String,
    run_id: String,
    store_path: PathBuf,
    provider: Arc<dyn ScoringProvider>,
    scorer_config: ScorerConfig,
    shutdown: Shutdown,
    poll_interval: Duration,
    shutdown_grace: Duration,
    show_progress: bool,

    store: Option<Arc<MetricsStore>>,
    scorer: Option<ScorerHandle>,
    evaluation_running: bool,
    lifecycle: Lifecycle,
    progress: ProgressState,
    display: ProgressDisplay,
}

impl EvaluationController {
    pub fn new(
        recipe: impl Into<String>,
        store_path: impl Into<PathBuf>,
        provider: Arc<dyn ScoringProvider>,
        shutdown: Shutdown,
    ) -> Self {
        let recipe = recipe.into();
        Self {
            lifecycle: Lifecycle::new(recipe.clone()),
            recipe,
            run_id: uuid::Uuid::new_v4().to_string(),
            store_path: store_path.into(),
            provider,
            scorer_config: ScorerConfig::default(),
            shutdown,
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
            show_progress: true,
            store: None,
            scorer: None,
            evaluation_running: false,
            progress: ProgressState::default(),
            display: ProgressDisplay::hidden(),
        }
    }

    pub fn with_scorer_config(mut self, config: ScorerConfig) -> Self {
        self.scorer_config = config;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_progress(mut self, visible: bool) -> Self {
        self.show_progress = visible;
        self
    }

    /// Reset the run's metrics store and launch the background scorer.
    pub fn start_evaluation(&mut self) -> Result<()> {
        if self.evaluation_running {
            warn!(recipe = %self.recipe, "Evaluation already running");
            return Ok(());
        }

        let store = Arc::new(MetricsStore::open(&self.store_path)?);
        store.reset()?;
        let scorer = Scorer::new(
            Arc::clone(&store),
            Arc::clone(&self.provider),
            self.scorer_config.clone(),
        )
        .spawn()?;

        self.store = Some(store);
        self.scorer = Some(scorer);
        self.evaluation_running = true;
        self.lifecycle.transition_to(LifecycleState::Evaluating);

        info!(
            recipe = %self.recipe,
            run_id = %self.run_id,
            store = %self.store_path.display(),
            "Evaluation started"
        );
        Ok(())
    }

    /// Fold `query_change` newly finished queries and a fresh status
    /// snapshot into the progress counters.
    pub fn update_progress(&mut self, query_change: u64) {
        let counts = match self.store.as_ref().map(|s| s.status_counts()) {
            Some(Ok(counts)) => counts,
            Some(Err(e)) => {
                warn!(recipe = %self.recipe, error = %e, "Failed to read feedback status");
                self.progress.counts
            }
            None => self.progress.counts,
        };
        let steps = self.progress.observe(query_change, counts);
        self.display.advance(steps, self.progress.postfix());
    }

    /// Run every batch through `pipeline`, drain the scorer, and stop.
    pub async fn run(
        &mut self,
        pipeline: Arc<dyn QueryPipeline>,
        batches: &[QueryBatch],
    ) -> Result<RunSummary> {
        let total_queries: u64 = batches.iter().map(|b| b.queries.len() as u64).sum();
        self.progress = ProgressState::new(total_queries, FEEDBACKS_PER_QUERY as u64);
        self.display = ProgressDisplay::new(self.progress.total_steps(), self.show_progress);
        info!("{}", PROGRESS_LEGEND);

        self.start_evaluation()?;

        let submitted = match self.query_loop(&pipeline, batches).await {
            Ok(submitted) => submitted,
            Err(e) => {
                self.stop_evaluation("error").await;
                return Err(e);
            }
        };

        let interrupted_during_queries = self.shutdown.is_interrupted();
        self.lifecycle.transition_to(LifecycleState::Draining);

        // An interrupt during the query loop still lets submitted work
        // finish; only an abort ends the drain early.
        let stop_token = if interrupted_during_queries {
            self.shutdown.abort_token().clone()
        } else {
            self.shutdown.interrupt_token().clone()
        };
        let drained = self
            .drain(submitted * FEEDBACKS_PER_QUERY as u64, &stop_token)
            .await;

        self.update_progress(0);
        let interrupted = interrupted_during_queries || !drained;
        let summary = RunSummary {
            recipe: self.recipe.clone(),
            run_id: self.run_id.clone(),
            total_queries,
            finished_queries: self.progress.finished_queries,
            failed_queries: self.progress.failed_queries,
            total_feedbacks: self.progress.total_feedbacks,
            counts: self.progress.counts,
            interrupted,
            elapsed_ms: self.lifecycle.elapsed_ms(),
            transitions: Vec::new(),
        };

        self.stop_evaluation(if interrupted { "interrupt" } else { "complete" })
            .await;

        Ok(RunSummary {
            transitions: self.lifecycle.transitions().to_vec(),
            ..summary
        })
    }

    /// Returns how many queries left a record in the store.
    async fn query_loop(
        &mut self,
        pipeline: &Arc<dyn QueryPipeline>,
        batches: &[QueryBatch],
    ) -> Result<u64> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };
        let mut submitted = 0u64;

        for batch in batches {
            if self.shutdown.is_interrupted() {
                break;
            }
            let recorder = Recorder::new(
                Arc::clone(&store),
                &self.recipe,
                batch.app_id.clone(),
                self.run_id.clone(),
            )?;
            info!(
                recipe = %self.recipe,
                dataset = %batch.dataset,
                app_id = %recorder.app_id(),
                queries = %batch.queries.len(),
                "Evaluating dataset"
            );

            for (index, query) in batch.queries.iter().enumerate() {
                if self.shutdown.is_interrupted() {
                    warn!(
                        recipe = %self.recipe,
                        app_id = %batch.app_id,
                        remaining = %(batch.queries.len() - index),
                        "Interrupted, no further queries will be run"
                    );
                    return Ok(submitted);
                }

                let expected = batch.golden_set.get(index).map(|g| g.response.as_str());
                match recorder.invoke(pipeline, query, expected).await {
                    Ok(_) => submitted += 1,
                    Err(failure) => {
                        if failure.record_id.is_some() {
                            submitted += 1;
                        }
                        self.progress.failed_queries += 1;
                        error!(
                            recipe = %self.recipe,
                            app_id = %batch.app_id,
                            query_index = %index,
                            error = %failure.error,
                            "Query failed"
                        );
                    }
                }
                self.update_progress(1);
            }
        }
        Ok(submitted)
    }

    /// Poll until `expected` feedbacks have finished. Returns false if
    /// `stop` fired first.
    async fn drain(&mut self, expected: u64, stop: &CancellationToken) -> bool {
        debug!(recipe = %self.recipe, expected = %expected, "Draining feedbacks");
        self.update_progress(0);

        while self.progress.finished_feedbacks < expected {
            if stop.is_cancelled() {
                warn!(
                    recipe = %self.recipe,
                    finished = %self.progress.finished_feedbacks,
                    expected = %expected,
                    "Drain interrupted"
                );
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = stop.cancelled() => {}
            }
            self.update_progress(0);
        }
        true
    }

    /// Stop the scorer and release the store. Calling this again once
    /// stopped does nothing.
    pub async fn stop_evaluation(&mut self, loc: &str) {
        if !self.evaluation_running {
            debug!(recipe = %self.recipe, loc = %loc, "Evaluation already stopped");
            return;
        }
        info!(recipe = %self.recipe, loc = %loc, "Stopping evaluation");

        if let Some(scorer) = self.scorer.take() {
            if let Err(e) = scorer.stop(self.shutdown_grace).await {
                error!(recipe = %self.recipe, loc = %loc, error = %e, "Failed to stop scorer");
            }
        }
        self.evaluation_running = false;
        self.store = None;
        self.lifecycle.transition_to(LifecycleState::Stopped);
        self.display.close();
    }
}

impl Drop for EvaluationController {
    fn drop(&mut self) {
        if let Some(scorer) = self.scorer.as_ref() {
            scorer.cancel();
        }
        self.display.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineOutput;
    use crate::scoring::LexicalProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        calls: AtomicUsize,
        fail_on_call: Option<usize>,
        interrupt_after_call: Option<(usize, Shutdown)>,
    }

    impl Scripted {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on_call: None,
                interrupt_after_call: None,
            }
        }
    }

    #[async_trait]
    impl QueryPipeline for Scripted {
        async fn invoke(&self, query: &str) -> anyhow::Result<PipelineOutput> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((after, shutdown)) = &self.interrupt_after_call {
                if call == *after {
                    shutdown.interrupt();
                }
            }
            if self.fail_on_call == Some(call) {
                anyhow::bail!("vector store unreachable");
            }
            Ok(PipelineOutput::new(
                format!("the answer to {} is in the archive", query),
                vec![format!("archive notes about {}", query)],
            ))
        }
    }

    fn batch(name: &str, n: usize) -> QueryBatch {
        let queries: Vec<String> = (1..=n).map(|i| format!("question {}", i)).collect();
        let golden_set = queries
            .iter()
            .map(|q| GoldenAnswer {
                query: q.clone(),
                response: "the archive".into(),
            })
            .collect();
        QueryBatch {
            dataset: name.into(),
            app_id: name.into(),
            queries,
            golden_set,
        }
    }

    fn controller(dir: &tempfile::TempDir, shutdown: Shutdown) -> EvaluationController {
        EvaluationController::new(
            "recipe",
            dir.path().join("recipe.sqlite"),
            Arc::new(LexicalProvider::new()),
            shutdown,
        )
        .with_scorer_config(
            ScorerConfig::default()
                .with_workers(2)
                .with_idle_poll(Duration::from_millis(5)),
        )
        .with_poll_interval(Duration::from_millis(10))
        .with_progress(false)
    }

    #[tokio::test]
    async fn test_run_completes_all_feedbacks() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(&dir, Shutdown::new());
        let summary = ctl
            .run(Arc::new(Scripted::new()), &[batch("Essays", 3), batch("Blog", 2)])
            .await
            .unwrap();

        assert_eq!(summary.total_queries, 5);
        assert_eq!(summary.total_feedbacks, 20);
        assert_eq!(summary.finished_queries, 5);
        assert_eq!(summary.counts.finished(), 20);
        assert!(!summary.interrupted);
        assert_eq!(ctl.lifecycle.state(), LifecycleState::Stopped);
        assert!(!ctl.evaluation_running);

        let store = MetricsStore::open(&dir.path().join("recipe.sqlite")).unwrap();
        assert_eq!(store.apps().unwrap().len(), 2);
        assert_eq!(store.record_count().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_failed_query_does_not_abort_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(&dir, Shutdown::new());
        let pipeline = Scripted {
            fail_on_call: Some(3),
            ..Scripted::new()
        };
        let summary = ctl
            .run(Arc::new(pipeline), &[batch("Essays", 5)])
            .await
            .unwrap();

        assert_eq!(summary.finished_queries, 5);
        assert_eq!(summary.failed_queries, 1);
        assert_eq!(summary.counts.failed, 4);
        assert_eq!(summary.counts.finished(), 20);
    }

    #[tokio::test]
    async fn test_interrupt_stops_queries_but_drains() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = Shutdown::new();
        let mut ctl = controller(&dir, shutdown.clone());
        let pipeline = Scripted {
            interrupt_after_call: Some((2, shutdown.clone())),
            ..Scripted::new()
        };
        let summary = ctl
            .run(Arc::new(pipeline), &[batch("Essays", 5)])
            .await
            .unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.finished_queries, 2);
        assert_eq!(summary.total_feedbacks, 20);
        assert_eq!(summary.counts.finished(), 8);
        assert_eq!(summary.counts.waiting, 0);
        assert_eq!(ctl.lifecycle.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_abort_ends_drain() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = Shutdown::new();
        shutdown.abort();
        let mut ctl = controller(&dir, shutdown);
        let summary = ctl
            .run(Arc::new(Scripted::new()), &[batch("Essays", 3)])
            .await
            .unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.finished_queries, 0);
        assert!(!ctl.evaluation_running);
    }

    #[tokio::test]
    async fn test_stop_evaluation_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(&dir, Shutdown::new());
        ctl.start_evaluation().unwrap();
        assert!(ctl.evaluation_running);

        ctl.stop_evaluation("interrupt").await;
        let transitions = ctl.lifecycle.transitions().len();
        ctl.stop_evaluation("complete").await;

        assert!(!ctl.evaluation_running);
        assert_eq!(ctl.lifecycle.transitions().len(), transitions);
        assert_eq!(ctl.lifecycle.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_scorer_stop_failure_still_stops() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(&dir, Shutdown::new()).with_shutdown_grace(Duration::ZERO);
        ctl.start_evaluation().unwrap();

        ctl.stop_evaluation("complete").await;
        assert!(!ctl.evaluation_running);
        assert!(ctl.scorer.is_none());
        assert!(ctl.display.is_closed());
        assert_eq!(ctl.lifecycle.state(), LifecycleState::Stopped);

        let transitions = ctl.lifecycle.transitions().len();
        ctl.stop_evaluation("interrupt").await;
        assert_eq!(ctl.lifecycle.transitions().len(), transitions);
        assert!(ctl.display.is_closed());
    }

    #[tokio::test]
    async fn test_progress_never_moves_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(&dir, Shutdown::new());
        ctl.progress = ProgressState::new(2, FEEDBACKS_PER_QUERY as u64);
        ctl.start_evaluation().unwrap();

        let mut last = 0;
        for _ in 0..5 {
            ctl.update_progress(0);
            assert!(ctl.progress.finished_feedbacks >= last);
            last = ctl.progress.finished_feedbacks;
        }
        ctl.stop_evaluation("complete").await;
    }

    struct Named(&'static str);

    impl Dataset for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn kind(&self) -> crate::dataset::DatasetKind {
            crate::dataset::DatasetKind::Llama
        }

        fn subsets(&self) -> &[String] {
            &[]
        }

        fn set_subsets(&mut self, _: Vec<String>) -> Result<()> {
            Ok(())
        }

        fn storage_path(&self) -> PathBuf {
            PathBuf::from(self.0)
        }

        fn queries_and_golden_set(&self) -> Result<(Vec<String>, Vec<GoldenAnswer>)> {
            let b = batch(self.0, 10);
            Ok((b.queries, b.golden_set))
        }
    }

    #[test]
    fn test_prepare_samples_per_dataset() {
        let datasets: Vec<Box<dyn Dataset>> =
            vec![Box::new(Named("Essays")), Box::new(Named("Essays"))];
        let batches =
            QueryBatch::prepare(&datasets, Some(SampleSpec::Fraction(0.5)), 42).unwrap();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].app_id, "Essays");
        assert_eq!(batches[1].app_id, "Essays-2");
        assert_eq!(batches[0].queries.len(), 5);
        assert_eq!(batches[0].queries, batches[1].queries);
        for (q, g) in batches[0].queries.iter().zip(&batches[0].golden_set) {
            assert_eq!(q, &g.query);
        }
    }

    #[test]
    fn test_prepare_rejects_oversized_sample() {
        let datasets: Vec<Box<dyn Dataset>> = vec![Box::new(Named("Essays"))];
        let err = QueryBatch::prepare(&datasets, Some(SampleSpec::Count(11)), 1).unwrap_err();
        assert!(matches!(err, crate::error::HarnessError::InvalidSample(_)));
    }
}
