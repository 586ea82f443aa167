//! Built-in keyword retrieval pipeline.
//!
//! Ingest splits documents into fixed-size word chunks stored as JSON lines;
//! query ranks chunks by query-term overlap and answers with the best
//! matching sentence.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use super::loader::{EntryPoint, PipelineRegistry};
use super::{PipelineOutput, QueryPipeline};
use crate::ingredients::Ingredients;
use crate::scoring::lexical::terms;

pub const SCRIPT: &str = "builtin/keyword";
const DEFAULT_INDEX_PATH: &str = "keyword-index.jsonl";
const DEFAULT_CHUNK_SIZE: i64 = 200;
const DEFAULT_TOP_K: i64 = 3;

pub fn register(registry: &mut PipelineRegistry) {
    registry.register(SCRIPT, "ingest", EntryPoint::Ingest(ingest));
    registry.register(SCRIPT, "query_pipeline", EntryPoint::Query(query_pipeline));
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Chunk {
    source: String,
    text: String,
}

fn ingest(file_path: &Path, ingredients: &Ingredients) -> anyhow::Result<()> {
    let index_path = ingredients.get_str_or("index_path", DEFAULT_INDEX_PATH);
    let chunk_size = ingredients.get_int_or("chunk_size", DEFAULT_CHUNK_SIZE).max(1) as usize;

    let raw = std::fs::read(file_path)
        .with_context(|| format!("Failed to read {}", file_path.display()))?;
    let text = String::from_utf8_lossy(&raw);
    let words: Vec<&str> = text.split_whitespace().collect();

    let mut out = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&index_path)
        .with_context(|| format!("Failed to open index {}", index_path))?;

    for window in words.chunks(chunk_size) {
        let chunk = Chunk {
            source: file_path.display().to_string(),
            text: window.join(" "),
        };
        serde_json::to_writer(&mut out, &chunk)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

fn query_pipeline(ingredients: &Ingredients) -> anyhow::Result<Arc<dyn QueryPipeline>> {
    let index_path = ingredients.get_str_or("index_path", DEFAULT_INDEX_PATH);
    let top_k = ingredients.get_int_or("top_k", DEFAULT_TOP_K).max(1) as usize;

    let file = std::fs::File::open(&index_path)
        .with_context(|| format!("Failed to open index {} (run ingest first)", index_path))?;
    let mut chunks = Vec::new();
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let chunk: Chunk = serde_json::from_str(&line).context("Corrupt index line")?;
        let chunk_terms = terms(&chunk.text).into_iter().collect();
        chunks.push((chunk, chunk_terms));
    }

    Ok(Arc::new(KeywordPipeline { chunks, top_k }))
}

pub struct KeywordPipeline {
    chunks: Vec<(Chunk, HashSet<String>)>,
    top_k: usize,
}

impl KeywordPipeline {
    fn retrieve(&self, query_terms: &HashSet<String>) -> Vec<&Chunk> {
        let mut scored: Vec<(usize, usize)> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(i, (_, t))| (i, t.intersection(query_terms).count()))
            .filter(|(_, score)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        scored
            .into_iter()
            .take(self.top_k)
            .map(|(i, _)| &self.chunks[i].0)
            .collect()
    }
}

#[async_trait]
impl QueryPipeline for KeywordPipeline {
    async fn invoke(&self, query: &str) -> anyhow::Result<PipelineOutput> {
        let query_terms: HashSet<String> = terms(query).into_iter().collect();
        let hits = self.retrieve(&query_terms);

        let Some(best) = hits.first() else {
            return Ok(PipelineOutput::new("I don't know.", Vec::new()));
        };

        let answer = best
            .text
            .split_inclusive(['.', '?', '!'])
            .max_by_key(|sentence| {
                terms(sentence)
                    .into_iter()
                    .filter(|t| query_terms.contains(t))
                    .count()
            })
            .unwrap_or(best.text.as_str())
            .trim()
            .to_string();

        Ok(PipelineOutput::new(
            answer,
            hits.iter().map(|c| c.text.clone()).collect(),
        ))
    }
}
