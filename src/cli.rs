use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::time::Duration;
use tracing::{info, warn};

use crate::compare::{Analysis, OutputFormat};
use crate::config::Config;
use crate::dataset::download::{download_dataset, DownloadOptions};
use crate::dataset::{load_datasets, DatasetKind};
use crate::error::{HarnessError, Result};
use crate::evaluation::{EvaluationController, QueryBatch, ScorerConfig};
use crate::ingest::IngestRunner;
use crate::ingredients::Ingredients;
use crate::pipeline::PipelineLoader;
use crate::recipe::Recipe;
use crate::sampling::SampleSpec;
use crate::scoring::build_provider;
use crate::signal::{listen_for_interrupts, Shutdown};

#[derive(Parser, Debug)]
#[command(name = "rag-harness", version)]
#[command(about = "Run RAG recipes against benchmark datasets and compare their feedback scores")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download and unpack a dataset
    Download(DownloadArgs),
    /// Run an ingest pipeline over dataset source files
    Ingest(IngestArgs),
    /// Run a query pipeline and score every answer
    Query(QueryArgs),
    /// Compare results from two or more recipes
    Compare(CompareArgs),
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// LlamaHub dataset name, e.g. PaulGrahamEssayDataset
    pub dataset_name: String,

    /// Dataset kind (only `llama` can be downloaded)
    #[arg(short, long)]
    pub kind: String,
}

#[derive(Args, Debug)]
pub struct RecipeArgs {
    /// A unique name for this recipe
    #[arg(short, long)]
    pub name: String,

    /// Pipeline script: a registered builtin (e.g. builtin/keyword) or a plugin library
    #[arg(short, long = "script-path")]
    pub script: String,

    /// Entry point in the script
    #[arg(short, long = "method-name")]
    pub method: String,

    /// Ingredient name, paired in order with --var-value
    #[arg(long = "var-name")]
    pub var_names: Vec<String>,

    /// Ingredient value, paired in order with --var-name
    #[arg(long = "var-value")]
    pub var_values: Vec<String>,

    /// Dataset to use; can be passed multiple times
    #[arg(long = "dataset")]
    pub datasets: Vec<String>,
}

impl RecipeArgs {
    pub fn recipe(&self) -> Result<Recipe> {
        if self.datasets.is_empty() {
            return Err(HarnessError::configuration(
                "at least one --dataset is required",
            ));
        }
        let ingredients = Ingredients::from_pairs(&self.var_names, &self.var_values)?;
        Recipe::new(
            &self.name,
            &self.script,
            &self.method,
            ingredients,
            self.datasets.clone(),
        )
    }
}

#[derive(Args, Debug)]
pub struct IngestArgs {
    #[command(flatten)]
    pub recipe: RecipeArgs,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    #[command(flatten)]
    pub recipe: RecipeArgs,

    /// Subset of the dataset to query; only valid with a single dataset
    #[arg(long = "subset")]
    pub subsets: Vec<String>,

    /// Fraction of queries to sample, in (0, 1]
    #[arg(long, default_value_t = 1.0)]
    pub sample: f64,

    /// Absolute number of queries to sample per dataset
    #[arg(long, conflicts_with = "sample")]
    pub sample_size: Option<usize>,

    /// Seed for query sampling; random when omitted
    #[arg(long)]
    pub seed: Option<u64>,

    /// Scoring provider (lexical or openai)
    #[arg(long)]
    pub provider: Option<String>,

    /// Model used by the scoring provider
    #[arg(long)]
    pub model: Option<String>,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

impl QueryArgs {
    /// Check every argument combination before any work is started.
    pub fn validate(&self) -> Result<(Recipe, Option<SampleSpec>)> {
        let spec = match self.sample_size {
            Some(k) => SampleSpec::Count(k),
            None => SampleSpec::Fraction(self.sample),
        };
        spec.validate()?;

        let recipe = self.recipe.recipe()?;
        if !self.subsets.is_empty() && recipe.datasets.len() > 1 {
            return Err(HarnessError::configuration(
                "--subset can only be used with a single --dataset",
            ));
        }

        let sample = (spec != SampleSpec::full()).then_some(spec);
        Ok((recipe, sample))
    }
}

#[derive(Args, Debug)]
pub struct CompareArgs {
    /// A recipe to compare; can be passed multiple times
    #[arg(short, long = "recipe", required = true)]
    pub recipes: Vec<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

pub async fn run(cli: Cli, config: &Config) -> anyhow::Result<()> {
    match cli.command {
        Command::Download(args) => download(args, config).await,
        Command::Ingest(args) => ingest(args, config).await,
        Command::Query(args) => query(args, config).await,
        Command::Compare(args) => compare(args, config),
    }
}

async fn download(args: DownloadArgs, config: &Config) -> anyhow::Result<()> {
    if args.kind != "llama" {
        return Err(HarnessError::configuration(format!(
            "dataset kind '{}' cannot be downloaded (expected llama)",
            args.kind
        ))
        .into());
    }
    let opts = DownloadOptions {
        lfs_url: config.llama_lfs_url.clone(),
        tree_url: config.llama_tree_url.clone(),
        max_bytes: config.max_download_bytes,
    };
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.download_timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;
    let path = download_dataset(
        &client,
        DatasetKind::Llama,
        &args.dataset_name,
        &config.datasets_dir,
        &opts,
    )
    .await?;
    info!(dataset = %args.dataset_name, path = %path.display(), "Download complete");
    Ok(())
}

async fn ingest(args: IngestArgs, config: &Config) -> anyhow::Result<()> {
    let recipe = args.recipe.recipe()?;
    let datasets = load_datasets(&config.datasets_dir, &recipe.datasets)?;
    let show_progress = !args.no_progress;

    tokio::task::spawn_blocking(move || {
        let loader = PipelineLoader::default();
        IngestRunner::new(&loader)
            .with_progress(show_progress)
            .run(&recipe, &datasets)
    })
    .await
    .context("Ingest task panicked")??;
    Ok(())
}

async fn query(args: QueryArgs, config: &Config) -> anyhow::Result<()> {
    let (recipe, sample) = args.validate()?;

    let mut datasets = load_datasets(&config.datasets_dir, &recipe.datasets)?;
    if let Some(dataset) = datasets.first_mut() {
        if !args.subsets.is_empty() {
            dataset.set_subsets(args.subsets.clone())?;
        }
    }

    let seed = args.seed.unwrap_or_else(rand::random);
    if sample.is_some() {
        info!(seed = %seed, "Sampling queries");
    }
    let batches = QueryBatch::prepare(&datasets, sample, seed)?;

    let loader = PipelineLoader::default();
    let pipeline = loader.load_query(&recipe.script, &recipe.method, &recipe.ingredients)?;
    let provider = build_provider(config, args.provider.as_deref(), args.model.as_deref())?;

    let shutdown = Shutdown::new();
    let listener = listen_for_interrupts(shutdown.clone());

    let mut controller = EvaluationController::new(
        recipe.name.clone(),
        recipe.store_path(&config.results_dir),
        provider,
        shutdown,
    )
    .with_scorer_config(ScorerConfig::from_config(config))
    .with_poll_interval(config.poll_interval())
    .with_shutdown_grace(config.shutdown_grace())
    .with_progress(!args.no_progress);

    let summary = controller.run(pipeline, &batches).await?;
    listener.abort();

    if summary.interrupted {
        warn!(
            recipe = %summary.recipe,
            finished_queries = %summary.finished_queries,
            total_queries = %summary.total_queries,
            "Run interrupted; recorded results were kept"
        );
    }
    info!(
        recipe = %summary.recipe,
        run_id = %summary.run_id,
        queries = %summary.finished_queries,
        failed_queries = %summary.failed_queries,
        feedbacks_done = %summary.counts.done,
        feedbacks_failed = %summary.counts.failed,
        feedbacks_skipped = %summary.counts.skipped,
        elapsed_ms = %summary.elapsed_ms,
        "Query run finished"
    );
    Ok(())
}

fn compare(args: CompareArgs, config: &Config) -> anyhow::Result<()> {
    let report = Analysis::new(&config.results_dir).compare(&args.recipes, args.format)?;
    print!("{}", report);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("rag-harness").chain(args.iter().copied()))
    }

    fn query_args(args: &[&str]) -> QueryArgs {
        match parse(args).unwrap().command {
            Command::Query(q) => q,
            other => panic!("expected query, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_query() {
        let q = query_args(&[
            "query", "-n", "kw", "-s", "builtin/keyword", "-m", "query_pipeline",
            "--var-name", "top_k", "--var-value", "5",
            "--dataset", "Essays", "--sample", "0.5", "--seed", "42",
        ]);
        let (recipe, sample) = q.validate().unwrap();
        assert_eq!(recipe.name, "kw");
        assert_eq!(recipe.ingredients.get_int_or("top_k", 0), 5);
        assert_eq!(sample, Some(SampleSpec::Fraction(0.5)));
        assert_eq!(q.seed, Some(42));
    }

    #[test]
    fn test_full_sample_means_no_sampling() {
        let q = query_args(&["query", "-n", "kw", "-s", "x", "-m", "y", "--dataset", "Essays"]);
        let (_, sample) = q.validate().unwrap();
        assert!(sample.is_none());
    }

    #[test]
    fn test_sample_out_of_range() {
        for bad in ["0", "1.5", "0.0"] {
            let q = query_args(&[
                "query", "-n", "kw", "-s", "x", "-m", "y", "--dataset", "Essays",
                "--sample", bad,
            ]);
            assert!(matches!(q.validate(), Err(HarnessError::InvalidSample(_))));
        }
    }

    #[test]
    fn test_subset_with_many_datasets() {
        let q = query_args(&[
            "query", "-n", "kw", "-s", "x", "-m", "y",
            "--dataset", "a", "--dataset", "b", "--subset", "simple",
        ]);
        assert!(matches!(q.validate(), Err(HarnessError::Configuration(_))));
    }

    #[test]
    fn test_missing_dataset() {
        let q = query_args(&["query", "-n", "kw", "-s", "x", "-m", "y"]);
        assert!(matches!(q.validate(), Err(HarnessError::Configuration(_))));
    }

    #[test]
    fn test_sample_size_conflicts_with_sample() {
        let err = parse(&[
            "query", "-n", "kw", "-s", "x", "-m", "y", "--dataset", "a",
            "--sample", "0.5", "--sample-size", "3",
        ]);
        assert!(err.is_err());

        let q = query_args(&[
            "query", "-n", "kw", "-s", "x", "-m", "y", "--dataset", "a", "--sample-size", "3",
        ]);
        assert_eq!(q.validate().unwrap().1, Some(SampleSpec::Count(3)));
    }

    #[test]
    fn test_mismatched_vars() {
        let q = query_args(&[
            "query", "-n", "kw", "-s", "x", "-m", "y", "--dataset", "a", "--var-name", "top_k",
        ]);
        assert!(matches!(q.validate(), Err(HarnessError::Configuration(_))));
    }

    #[test]
    fn test_parse_compare() {
        let cli = parse(&["compare", "-r", "a", "-r", "b", "--format", "json"]).unwrap();
        match cli.command {
            Command::Compare(c) => {
                assert_eq!(c.recipes, vec!["a", "b"]);
                assert_eq!(c.format, OutputFormat::Json);
            }
            other => panic!("expected compare, got {:?}", other),
        }
        assert!(parse(&["compare"]).is_err());
    }

    #[test]
    fn test_parse_download() {
        let cli = parse(&["download", "BraintrustCodaHelpDesk", "-k", "llama"]).unwrap();
        assert!(matches!(cli.command, Command::Download(ref d) if d.kind == "llama"));
    }
}
