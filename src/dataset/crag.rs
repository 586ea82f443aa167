use serde::Deserialize;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{Dataset, DatasetKind, GoldenAnswer};
use crate::error::{HarnessError, Result};

pub const SUBSET_KINDS: &[&str] = &[
    "aggregation",
    "comparison",
    "false_premise",
    "multi-hop",
    "post-processing",
    "set",
    "simple_w_condition",
    "simple",
];

#[derive(Debug, Deserialize)]
struct CragLine {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    answer: Option<String>,
}

/// CRAG benchmark split into one JSONL file per question type.
pub struct CragDataset {
    name: String,
    root: PathBuf,
    subsets: Vec<String>,
}

impl CragDataset {
    pub fn new(name: impl Into<String>, root: &Path) -> Self {
        Self {
            name: name.into(),
            root: root.to_path_buf(),
            subsets: Vec::new(),
        }
    }

    fn active_subsets(&self) -> Vec<&str> {
        if self.subsets.is_empty() {
            SUBSET_KINDS.to_vec()
        } else {
            self.subsets.iter().map(String::as_str).collect()
        }
    }
}

impl Dataset for CragDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DatasetKind {
        DatasetKind::Crag
    }

    fn subsets(&self) -> &[String] {
        &self.subsets
    }

    fn set_subsets(&mut self, subsets: Vec<String>) -> Result<()> {
        if let Some(bad) = subsets.iter().find(|s| !SUBSET_KINDS.contains(&s.as_str())) {
            return Err(HarnessError::dataset(format!(
                "subset '{}' doesn't exist in dataset {}; choices are {}",
                bad,
                self.name,
                SUBSET_KINDS.join(", ")
            )));
        }
        self.subsets = subsets;
        Ok(())
    }

    fn storage_path(&self) -> PathBuf {
        self.root.join(DatasetKind::Crag.dir_name()).join(&self.name)
    }

    fn source_file_paths(&self) -> Result<Vec<PathBuf>> {
        Err(HarnessError::dataset(
            "CRAG source documents are not supported for ingest",
        ))
    }

    fn queries_and_golden_set(&self) -> Result<(Vec<String>, Vec<GoldenAnswer>)> {
        let mut queries = Vec::new();
        let mut golden_set = Vec::new();

        for subset in self.active_subsets() {
            let path = self.storage_path().join(format!("{}.jsonl", subset));
            let file = std::fs::File::open(&path).map_err(|e| {
                HarnessError::dataset(format!("cannot open {}: {}", path.display(), e))
            })?;

            for (lineno, line) in std::io::BufReader::new(file).lines().enumerate() {
                let line = line?;
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let parsed: CragLine = serde_json::from_str(line).map_err(|e| {
                    HarnessError::dataset(format!(
                        "{}:{}: invalid JSON: {}",
                        path.display(),
                        lineno + 1,
                        e
                    ))
                })?;
                let Some(query) = parsed.query else {
                    continue;
                };
                golden_set.push(GoldenAnswer {
                    query: query.clone(),
                    response: parsed.answer.unwrap_or_default(),
                });
                queries.push(query);
            }
            debug!(dataset = %self.name, subset = %subset, total = queries.len(), "Loaded CRAG subset");
        }

        Ok((queries, golden_set))
    }
}
