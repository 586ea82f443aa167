use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

use crate::store::StatusCounts;

pub const PROGRESS_LEGEND: &str =
    "Progress postfix legend: (q)ueries completed; feedbacks (d)one, (r)unning, (w)aiting, (f)ailed, (s)kipped";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Idle,
    Evaluating,
    Draining,
    Stopped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub elapsed_ms: u64,
}

/// Controller state machine with its transition history.
pub struct Lifecycle {
    recipe: String,
    state: LifecycleState,
    started_at: Instant,
    last_transition: Instant,
    transitions: Vec<StatusTransition>,
}

impl Lifecycle {
    pub fn new(recipe: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            recipe: recipe.into(),
            state: LifecycleState::Idle,
            started_at: now,
            last_transition: now,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn transitions(&self) -> &[StatusTransition] {
        &self.transitions
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn transition_to(&mut self, new_state: LifecycleState) {
        if new_state == self.state {
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_transition).as_millis() as u64;

        debug!(
            recipe = %self.recipe,
            from = ?self.state,
            to = ?new_state,
            elapsed_ms = %elapsed,
            "Lifecycle transition"
        );

        self.transitions.push(StatusTransition {
            from: self.state,
            to: new_state,
            elapsed_ms: elapsed,
        });
        self.state = new_state;
        self.last_transition = now;
    }
}

/// Counters behind the progress bar. Owned by the evaluation loop.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProgressState {
    pub total_queries: u64,
    pub total_feedbacks: u64,
    pub finished_queries: u64,
    pub failed_queries: u64,
    pub finished_feedbacks: u64,
    pub counts: StatusCounts,
}

impl ProgressState {
    pub fn new(total_queries: u64, feedbacks_per_query: u64) -> Self {
        Self {
            total_queries,
            total_feedbacks: total_queries * feedbacks_per_query,
            ..Self::default()
        }
    }

    /// Bar length: every query plus every feedback computation.
    pub fn total_steps(&self) -> u64 {
        self.total_queries + self.total_feedbacks
    }

    /// Fold in finished queries and a fresh status snapshot. Returns how far
    /// the bar should advance. Finished feedbacks only ever grow, so a stale
    /// snapshot never moves the bar backwards or counts twice.
    pub fn observe(&mut self, query_change: u64, counts: StatusCounts) -> u64 {
        self.finished_queries += query_change;
        self.counts = counts;

        let finished = counts.finished();
        let feedback_delta = finished.saturating_sub(self.finished_feedbacks);
        self.finished_feedbacks = self.finished_feedbacks.max(finished);
        query_change + feedback_delta
    }

    pub fn postfix(&self) -> String {
        format!(
            "q={} d={} r={} w={} f={} s={}",
            self.finished_queries,
            self.counts.done,
            self.counts.running,
            self.counts.waiting,
            self.counts.failed,
            self.counts.skipped
        )
    }
}

/// Terminal progress bar. Closing is idempotent.
pub struct ProgressDisplay {
    bar: ProgressBar,
    closed: bool,
}

impl ProgressDisplay {
    pub fn new(total: u64, visible: bool) -> Self {
        let bar = if visible {
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                    .unwrap_or_else(|e| {
                        tracing::warn!("Progress template error: {}, using default", e);
                        ProgressStyle::default_bar()
                    }),
            );
            pb
        } else {
            ProgressBar::hidden()
        };
        Self { bar, closed: false }
    }

    pub fn hidden() -> Self {
        Self::new(0, false)
    }

    pub fn advance(&self, steps: u64, postfix: String) {
        if self.closed {
            return;
        }
        self.bar.set_message(postfix);
        if steps > 0 {
            self.bar.inc(steps);
        }
    }

    #[cfg(test)]
    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.bar.finish();
        info!(position = %self.bar.position(), "Progress closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(done: u64, running: u64, waiting: u64, failed: u64, skipped: u64) -> StatusCounts {
        StatusCounts {
            done,
            running,
            waiting,
            failed,
            skipped,
        }
    }

    #[test]
    fn test_new_progress_totals() {
        let p = ProgressState::new(5, 4);
        assert_eq!(p.total_feedbacks, 20);
        assert_eq!(p.total_steps(), 25);
    }

    #[test]
    fn test_observe_deltas() {
        let mut p = ProgressState::new(3, 4);
        assert_eq!(p.observe(1, counts(0, 0, 4, 0, 0)), 1);
        assert_eq!(p.observe(1, counts(2, 1, 5, 0, 0)), 3);
        assert_eq!(p.observe(0, counts(3, 0, 4, 1, 0)), 2);
        assert_eq!(p.finished_queries, 2);
        assert_eq!(p.finished_feedbacks, 4);
    }

    #[test]
    fn test_finished_never_decreases() {
        let mut p = ProgressState::new(2, 4);
        p.observe(0, counts(6, 0, 0, 0, 0));
        assert_eq!(p.observe(0, counts(4, 0, 0, 0, 0)), 0);
        assert_eq!(p.finished_feedbacks, 6);
        assert_eq!(p.observe(0, counts(7, 0, 0, 0, 0)), 1);
    }

    #[test]
    fn test_postfix() {
        let mut p = ProgressState::new(2, 4);
        p.observe(1, counts(1, 2, 3, 4, 5));
        assert_eq!(p.postfix(), "q=1 d=1 r=2 w=3 f=4 s=5");
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut lc = Lifecycle::new("recipe");
        assert_eq!(lc.state(), LifecycleState::Idle);
        lc.transition_to(LifecycleState::Evaluating);
        lc.transition_to(LifecycleState::Draining);
        lc.transition_to(LifecycleState::Draining);
        lc.transition_to(LifecycleState::Stopped);
        let t = lc.transitions();
        assert_eq!(t.len(), 3);
        assert_eq!(t[0].from, LifecycleState::Idle);
        assert_eq!(t[2].to, LifecycleState::Stopped);
    }

    #[test]
    fn test_display_close_idempotent() {
        let mut d = ProgressDisplay::new(10, false);
        d.advance(3, "q=3".into());
        assert_eq!(d.position(), 3);
        d.close();
        d.close();
        assert!(d.is_closed());
        d.advance(2, "late".into());
        assert_eq!(d.position(), 3);
    }
}
