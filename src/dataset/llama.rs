use anyhow::Context;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::{Dataset, DatasetKind, GoldenAnswer};
use crate::error::{HarnessError, Result};

pub const RAG_DATASET_FILE: &str = "rag_dataset.json";
pub const SOURCE_FILES_DIR: &str = "source_files";

/// Local and remote folder for a LlamaHub dataset: the snake_case name with
/// any `_dataset` suffix removed, so `PaulGrahamEssayDataset` and
/// `PaulGrahamEssay` both map to `paul_graham_essay`.
pub fn llama_folder(name: &str) -> String {
    static ACRONYM: OnceLock<Regex> = OnceLock::new();
    static WORD: OnceLock<Regex> = OnceLock::new();
    let acronym =
        ACRONYM.get_or_init(|| Regex::new(r"([A-Z]+)([A-Z][a-z])").expect("valid acronym pattern"));
    let word = WORD.get_or_init(|| Regex::new(r"([a-z\d])([A-Z])").expect("valid word pattern"));

    let snake = acronym.replace_all(name.trim(), "${1}_${2}");
    let snake = word
        .replace_all(&snake, "${1}_${2}")
        .replace('-', "_")
        .to_lowercase();
    match snake.strip_suffix("_dataset") {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => snake,
    }
}

#[derive(Debug, Deserialize)]
struct RagDatasetFile {
    examples: Vec<RagExample>,
}

#[derive(Debug, Deserialize)]
struct RagExample {
    query: String,
    #[serde(default)]
    reference_answer: Option<String>,
}

/// A LlamaHub-style dataset: `rag_dataset.json` plus a `source_files/` dir,
/// stored under `<root>/llama/<folder>`.
pub struct LlamaDataset {
    name: String,
    root: PathBuf,
}

impl LlamaDataset {
    pub fn new(name: impl Into<String>, root: &Path) -> Self {
        Self {
            name: name.into(),
            root: root.to_path_buf(),
        }
    }

    fn read_examples(&self) -> anyhow::Result<RagDatasetFile> {
        let path = self.storage_path().join(RAG_DATASET_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid {}", path.display()))
    }
}

impl Dataset for LlamaDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DatasetKind {
        DatasetKind::Llama
    }

    fn subsets(&self) -> &[String] {
        &[]
    }

    fn set_subsets(&mut self, subsets: Vec<String>) -> Result<()> {
        if subsets.is_empty() {
            return Ok(());
        }
        Err(HarnessError::configuration(format!(
            "dataset '{}' has no subsets",
            self.name
        )))
    }

    fn storage_path(&self) -> PathBuf {
        self.root
            .join(DatasetKind::Llama.dir_name())
            .join(llama_folder(&self.name))
    }

    fn queries_and_golden_set(&self) -> Result<(Vec<String>, Vec<GoldenAnswer>)> {
        let file = self
            .read_examples()
            .map_err(|e| HarnessError::dataset(format!("{:#}", e)))?;

        let mut queries = Vec::with_capacity(file.examples.len());
        let mut golden_set = Vec::with_capacity(file.examples.len());
        for example in file.examples {
            golden_set.push(GoldenAnswer {
                query: example.query.clone(),
                response: example.reference_answer.unwrap_or_default(),
            });
            queries.push(example.query);
        }
        Ok((queries, golden_set))
    }
}
