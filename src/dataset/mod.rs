pub mod crag;
pub mod download;
pub mod llama;

pub use crag::CragDataset;
pub use llama::LlamaDataset;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{HarnessError, Result};

/// Ground-truth answer for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenAnswer {
    pub query: String,
    pub response: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Llama,
    Crag,
}

impl DatasetKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Llama => "llama",
            Self::Crag => "crag",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

pub trait Dataset: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> DatasetKind;

    fn subsets(&self) -> &[String];

    fn set_subsets(&mut self, subsets: Vec<String>) -> Result<()>;

    /// Directory holding this dataset's files.
    fn storage_path(&self) -> PathBuf;

    /// Documents to feed through an ingest pipeline.
    fn source_file_paths(&self) -> Result<Vec<PathBuf>> {
        list_files_at_path(&self.storage_path().join(llama::SOURCE_FILES_DIR))
    }

    /// Queries and their index-aligned golden answers.
    fn queries_and_golden_set(&self) -> Result<(Vec<String>, Vec<GoldenAnswer>)>;
}

/// Regular files directly under `dir`, skipping dot files, sorted by name.
pub fn list_files_at_path(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        HarnessError::dataset(format!("cannot list {}: {}", dir.display(), e))
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if path.is_file() && !hidden {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Locate a downloaded dataset by name under `root`.
pub fn find_dataset(root: &Path, name: &str) -> Result<Box<dyn Dataset>> {
    let llama = LlamaDataset::new(name, root);
    if llama.storage_path().is_dir() {
        return Ok(Box::new(llama));
    }
    let crag = CragDataset::new(name, root);
    if crag.storage_path().is_dir() {
        return Ok(Box::new(crag));
    }
    Err(HarnessError::dataset(format!(
        "dataset '{}' not found under {}; run `download {} -k llama` first",
        name,
        root.display(),
        name
    )))
}

pub fn load_datasets(root: &Path, names: &[String]) -> Result<Vec<Box<dyn Dataset>>> {
    names.iter().map(|name| find_dataset(root, name)).collect()
}
