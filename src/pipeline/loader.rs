//! Resolves `(script, function)` pairs from the command line to pipeline
//! entry points.
//!
//! Scripts are either registered in-process (see [`PipelineRegistry`]) or
//! native plugin libraries exporting a Rust-ABI function with the entry
//! point's name.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{keyword, IngestFn, QueryFactory, QueryPipeline};
use crate::error::{HarnessError, Result};
use crate::ingredients::Ingredients;

#[derive(Clone, Copy)]
pub enum EntryPoint {
    Query(QueryFactory),
    Ingest(IngestFn),
}

impl EntryPoint {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Query(_) => "query",
            Self::Ingest(_) => "ingest",
        }
    }
}

#[derive(Default)]
pub struct PipelineRegistry {
    scripts: HashMap<String, HashMap<String, EntryPoint>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the pipelines shipped in this binary.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        keyword::register(&mut registry);
        registry
    }

    pub fn register(&mut self, script: &str, name: &str, entry: EntryPoint) {
        self.scripts
            .entry(script.to_string())
            .or_default()
            .insert(name.to_string(), entry);
    }

    pub fn has_script(&self, script: &str) -> bool {
        self.scripts.contains_key(script)
    }

    pub fn resolve(&self, script: &str, name: &str) -> Result<EntryPoint> {
        let functions = self.scripts.get(script).ok_or_else(|| HarnessError::PipelineLoad {
            script: script.to_string(),
            reason: "no such registered script".into(),
        })?;
        functions
            .get(name)
            .copied()
            .ok_or_else(|| HarnessError::PipelineNotFound {
                script: script.to_string(),
                name: name.to_string(),
            })
    }

    pub fn scripts(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.scripts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

pub struct PipelineLoader {
    registry: PipelineRegistry,
}

impl PipelineLoader {
    pub fn new(registry: PipelineRegistry) -> Self {
        Self { registry }
    }

    /// Resolve a query entry point and build the pipeline with `ingredients`.
    pub fn load_query(
        &self,
        script: &str,
        name: &str,
        ingredients: &Ingredients,
    ) -> Result<Arc<dyn QueryPipeline>> {
        let factory = match self.resolve(script, name, "query")? {
            EntryPoint::Query(factory) => factory,
            EntryPoint::Ingest(_) => {
                return Err(HarnessError::EntryPointMismatch {
                    script: script.to_string(),
                    name: name.to_string(),
                    expected: "query",
                })
            }
        };

        info!(script = %script, method = %name, ingredients = %ingredients, "Building query pipeline");
        factory(ingredients).map_err(|e| HarnessError::PipelineLoad {
            script: script.to_string(),
            reason: format!("{}: {:#}", name, e),
        })
    }

    pub fn load_ingest(&self, script: &str, name: &str) -> Result<IngestFn> {
        match self.resolve(script, name, "ingest")? {
            EntryPoint::Ingest(f) => Ok(f),
            EntryPoint::Query(_) => Err(HarnessError::EntryPointMismatch {
                script: script.to_string(),
                name: name.to_string(),
                expected: "ingest",
            }),
        }
    }

    fn resolve(&self, script: &str, name: &str, kind: &'static str) -> Result<EntryPoint> {
        if self.registry.has_script(script) {
            return self.registry.resolve(script, name);
        }

        let path = Path::new(script);
        if is_plugin_library(path) {
            // SAFETY: plugin libraries run arbitrary code; only trusted paths
            // are passed on the command line.
            return unsafe { load_native(path, name, kind) };
        }

        Err(HarnessError::PipelineLoad {
            script: script.to_string(),
            reason: format!(
                "not a registered script or plugin library (registered: {})",
                self.registry.scripts().join(", ")
            ),
        })
    }
}

impl Default for PipelineLoader {
    fn default() -> Self {
        Self::new(PipelineRegistry::with_builtins())
    }
}

/// Open a plugin library and look up `name` as an entry point of `kind`.
///
/// # Safety
///
/// The exported symbol must have exactly the Rust signature of the
/// requested entry point and the plugin must be built with the same
/// compiler as this binary.
unsafe fn load_native(path: &Path, name: &str, kind: &'static str) -> Result<EntryPoint> {
    let lib = libloading::Library::new(path).map_err(|e| HarnessError::PipelineLoad {
        script: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let not_found = |e: libloading::Error| {
        debug!("Symbol lookup failed: {}", e);
        HarnessError::PipelineNotFound {
            script: path.display().to_string(),
            name: name.to_string(),
        }
    };

    let entry = if kind == "query" {
        let symbol: libloading::Symbol<QueryFactory> =
            lib.get(name.as_bytes()).map_err(not_found)?;
        EntryPoint::Query(*symbol)
    } else {
        let symbol: libloading::Symbol<IngestFn> = lib.get(name.as_bytes()).map_err(not_found)?;
        EntryPoint::Ingest(*symbol)
    };

    // The entry point's code lives in the library for the rest of the run.
    std::mem::forget(lib);

    info!(library = %path.display(), symbol = %name, kind = %entry.kind(), "Loaded native pipeline plugin");
    Ok(entry)
}

fn is_plugin_library(path: &Path) -> bool {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    matches!(ext, "so" | "dll" | "dylib")
}
