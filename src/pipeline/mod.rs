pub mod keyword;
pub mod loader;

pub use loader::PipelineLoader;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::ingredients::Ingredients;

/// What a pipeline produced for one query: the answer and the retrieved
/// context passages it was grounded on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub answer: String,
    pub contexts: Vec<String>,
}

impl PipelineOutput {
    pub fn new(answer: impl Into<String>, contexts: Vec<String>) -> Self {
        Self {
            answer: answer.into(),
            contexts,
        }
    }
}

/// A runnable query pipeline. Instances are invoked one query at a time.
#[async_trait]
pub trait QueryPipeline: Send + Sync {
    async fn invoke(&self, query: &str) -> anyhow::Result<PipelineOutput>;
}

/// Builds a query pipeline from the recipe's ingredients.
pub type QueryFactory = fn(&Ingredients) -> anyhow::Result<Arc<dyn QueryPipeline>>;

/// Ingests one source document.
pub type IngestFn = fn(&Path, &Ingredients) -> anyhow::Result<()>;
