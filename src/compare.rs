//! Cross-recipe comparison of recorded feedback scores.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::{HarnessError, Result};
use crate::recipe;
use crate::store::MetricsStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

/// Score distribution of one metric for one dataset of one recipe.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub recipe: String,
    pub dataset: String,
    pub metric: String,
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub mean_latency_ms: f64,
}

pub struct Analysis {
    results_dir: PathBuf,
}

impl Analysis {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }

    fn open_store(&self, recipe_name: &str) -> Result<MetricsStore> {
        recipe::validate_name(recipe_name)?;
        let path = recipe::store_path(&self.results_dir, recipe_name);
        if !path.is_file() {
            return Err(HarnessError::configuration(format!(
                "no results for recipe '{}' (expected {})",
                recipe_name,
                path.display()
            )));
        }
        MetricsStore::open(&path)
    }

    /// Gather every finished score of `recipes`, sorted by recipe, dataset
    /// and metric (case-insensitive).
    pub fn collect(&self, recipes: &[String]) -> Result<Vec<MetricSummary>> {
        let mut summaries = Vec::new();

        for recipe_name in recipes {
            let store = self.open_store(recipe_name)?;
            for app_id in store.apps()? {
                let mut by_metric: BTreeMap<String, Vec<f64>> = BTreeMap::new();
                let mut latencies: HashMap<String, u64> = HashMap::new();

                for row in store.feedback_scores(&app_id)? {
                    latencies.insert(row.record_id, row.latency_ms);
                    if row.score < 0.0 {
                        continue;
                    }
                    by_metric.entry(row.name).or_default().push(row.score);
                }

                let mean_latency_ms = if latencies.is_empty() {
                    0.0
                } else {
                    latencies.values().sum::<u64>() as f64 / latencies.len() as f64
                };
                debug!(
                    recipe = %recipe_name,
                    app_id = %app_id,
                    metrics = %by_metric.len(),
                    "Collected scores"
                );

                for (metric, scores) in by_metric {
                    let summary = summarize(recipe_name, &app_id, metric, scores, mean_latency_ms);
                    summaries.extend(summary);
                }
            }
        }

        summaries.sort_by(|a, b| {
            a.recipe
                .to_lowercase()
                .cmp(&b.recipe.to_lowercase())
                .then_with(|| a.dataset.to_lowercase().cmp(&b.dataset.to_lowercase()))
                .then_with(|| a.metric.cmp(&b.metric))
        });
        info!(recipes = %recipes.len(), rows = %summaries.len(), "Comparison ready");
        Ok(summaries)
    }

    pub fn compare(&self, recipes: &[String], format: OutputFormat) -> Result<String> {
        let summaries = self.collect(recipes)?;
        Ok(match format {
            OutputFormat::Table => render_table(&summaries),
            OutputFormat::Json => serde_json::to_string_pretty(&summaries)
                .map_err(|e| HarnessError::configuration(e.to_string()))?,
        })
    }
}

fn summarize(
    recipe: &str,
    dataset: &str,
    metric: String,
    mut scores: Vec<f64>,
    mean_latency_ms: f64,
) -> Option<MetricSummary> {
    if scores.is_empty() {
        return None;
    }
    scores.sort_by(|a, b| a.total_cmp(b));
    let count = scores.len();
    let mean = scores.iter().sum::<f64>() / count as f64;
    let median = if count % 2 == 0 {
        (scores[count / 2 - 1] + scores[count / 2]) / 2.0
    } else {
        scores[count / 2]
    };
    Some(MetricSummary {
        recipe: recipe.to_string(),
        dataset: dataset.to_string(),
        metric,
        count,
        mean,
        median,
        min: scores[0],
        max: scores[count - 1],
        mean_latency_ms,
    })
}

pub fn render_table(summaries: &[MetricSummary]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<20} {:<20} {:<20} {:>6} {:>7} {:>7} {:>7} {:>7} {:>10}",
        "recipe", "dataset", "metric", "n", "mean", "median", "min", "max", "latency_ms"
    );
    for s in summaries {
        let _ = writeln!(
            out,
            "{:<20} {:<20} {:<20} {:>6} {:>7.3} {:>7.3} {:>7.3} {:>7.3} {:>10.1}",
            s.recipe,
            s.dataset,
            s.metric,
            s.count,
            s.mean,
            s.median,
            s.min,
            s.max,
            s.mean_latency_ms
        );
    }
    out
}
