use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::dataset::Dataset;
use crate::pipeline::PipelineLoader;
use crate::recipe::Recipe;

/// Feeds every source document of a recipe's datasets through its ingest
/// entry point.
pub struct IngestRunner<'a> {
    loader: &'a PipelineLoader,
    show_progress: bool,
}

impl<'a> IngestRunner<'a> {
    pub fn new(loader: &'a PipelineLoader) -> Self {
        Self {
            loader,
            show_progress: true,
        }
    }

    pub fn with_progress(mut self, visible: bool) -> Self {
        self.show_progress = visible;
        self
    }

    /// Returns the number of files ingested.
    pub fn run(&self, recipe: &Recipe, datasets: &[Box<dyn Dataset>]) -> anyhow::Result<usize> {
        let ingest = self.loader.load_ingest(&recipe.script, &recipe.method)?;

        let mut files: Vec<PathBuf> = Vec::new();
        for dataset in datasets {
            let found = dataset
                .source_file_paths()
                .with_context(|| format!("Failed to list source files of {}", dataset.name()))?;
            if found.is_empty() {
                warn!(dataset = %dataset.name(), "Dataset has no source files");
            }
            files.extend(found);
        }

        info!(
            recipe = %recipe.name,
            files = %files.len(),
            ingredients = %recipe.ingredients,
            "Starting ingest"
        );

        let bar = if self.show_progress {
            let pb = ProgressBar::new(files.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40.green/white} {pos}/{len} {wide_msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        for path in &files {
            bar.set_message(path.display().to_string());
            ingest(path, &recipe.ingredients)
                .with_context(|| format!("Ingest failed for {}", path.display()))?;
            bar.inc(1);
        }
        bar.finish_with_message("done");

        info!(recipe = %recipe.name, files = %files.len(), "Ingest complete");
        Ok(files.len())
    }
}
