use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::{HarnessError, Result};
use crate::ingredients::Ingredients;

pub const STORE_EXTENSION: &str = "sqlite";

/// One named evaluation run: a pipeline entry point, its parameters and the
/// datasets it targets.
#[derive(Debug, Clone, Serialize)]
pub struct Recipe {
    pub name: String,
    pub script: String,
    pub method: String,
    pub ingredients: Ingredients,
    pub datasets: Vec<String>,
}

impl Recipe {
    pub fn new(
        name: impl Into<String>,
        script: impl Into<String>,
        method: impl Into<String>,
        ingredients: Ingredients,
        datasets: Vec<String>,
    ) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            script: script.into(),
            method: method.into(),
            ingredients,
            datasets,
        })
    }

    pub fn store_path(&self, results_dir: &Path) -> PathBuf {
        store_path(results_dir, &self.name)
    }
}

pub fn store_path(results_dir: &Path, recipe_name: &str) -> PathBuf {
    results_dir.join(format!("{}.{}", recipe_name, STORE_EXTENSION))
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(HarnessError::configuration("recipe name must not be empty"));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(HarnessError::configuration(format!(
            "recipe name '{}' must not contain path separators",
            name
        )));
    }
    Ok(())
}
