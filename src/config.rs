use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_DATASETS_DIR: &str = "datasets";
const DEFAULT_RESULTS_DIR: &str = ".";
const DEFAULT_LLAMA_LFS_URL: &str =
    "https://media.githubusercontent.com/media/run-llama/llama-datasets/main";
const DEFAULT_LLAMA_TREE_URL: &str = "https://github.com/run-llama/llama-datasets/tree/main";
const DEFAULT_DOWNLOAD_TIMEOUT: u64 = 120;
const DEFAULT_MAX_DOWNLOAD_BYTES: usize = 512 * 1024 * 1024;
const DEFAULT_SCORER_WORKERS: usize = 4;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_SCORER_IDLE_POLL_MS: u64 = 250;
const DEFAULT_SCORING_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_SCORING_RETRY_BACKOFF_MS: u64 = 2000;
const DEFAULT_SCORING_TIMEOUT: u64 = 120;
const DEFAULT_SHUTDOWN_GRACE: u64 = 10;
const DEFAULT_SCORING_PROVIDER: &str = "lexical";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct Config {
    pub datasets_dir: PathBuf,
    pub results_dir: PathBuf,
    pub llama_lfs_url: String,
    pub llama_tree_url: String,
    pub download_timeout_secs: u64,
    pub max_download_bytes: usize,
    pub scorer_workers: usize,
    pub poll_interval_ms: u64,
    pub scorer_idle_poll_ms: u64,
    pub scoring_max_attempts: u32,
    pub scoring_retry_backoff_ms: u64,
    pub scoring_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub scoring_provider: String,
    pub scoring_model: Option<String>,
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            datasets_dir: PathBuf::from(
                std::env::var("RAG_DATASETS_DIR").unwrap_or_else(|_| DEFAULT_DATASETS_DIR.into()),
            ),
            results_dir: PathBuf::from(
                std::env::var("RAG_RESULTS_DIR").unwrap_or_else(|_| DEFAULT_RESULTS_DIR.into()),
            ),
            llama_lfs_url: std::env::var("RAG_LLAMA_LFS_URL")
                .unwrap_or_else(|_| DEFAULT_LLAMA_LFS_URL.into()),
            llama_tree_url: std::env::var("RAG_LLAMA_TREE_URL")
                .unwrap_or_else(|_| DEFAULT_LLAMA_TREE_URL.into()),
            download_timeout_secs: env_parse("RAG_DOWNLOAD_TIMEOUT_SECS", DEFAULT_DOWNLOAD_TIMEOUT),
            max_download_bytes: env_parse("RAG_MAX_DOWNLOAD_BYTES", DEFAULT_MAX_DOWNLOAD_BYTES),
            scorer_workers: env_parse("RAG_SCORER_WORKERS", DEFAULT_SCORER_WORKERS).max(1),
            poll_interval_ms: env_parse("RAG_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS),
            scorer_idle_poll_ms: env_parse("RAG_SCORER_IDLE_POLL_MS", DEFAULT_SCORER_IDLE_POLL_MS),
            scoring_max_attempts: env_parse("RAG_SCORING_MAX_ATTEMPTS", DEFAULT_SCORING_MAX_ATTEMPTS)
                .max(1),
            scoring_retry_backoff_ms: env_parse(
                "RAG_SCORING_RETRY_BACKOFF_MS",
                DEFAULT_SCORING_RETRY_BACKOFF_MS,
            ),
            scoring_timeout_secs: env_parse("RAG_SCORING_TIMEOUT_SECS", DEFAULT_SCORING_TIMEOUT),
            shutdown_grace_secs: env_parse("RAG_SHUTDOWN_GRACE_SECS", DEFAULT_SHUTDOWN_GRACE),
            scoring_provider: std::env::var("RAG_SCORING_PROVIDER")
                .unwrap_or_else(|_| DEFAULT_SCORING_PROVIDER.into()),
            scoring_model: std::env::var("RAG_SCORING_MODEL").ok(),
            openai_base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_OPENAI_BASE_URL.into()),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn print_banner(&self) {
        tracing::info!("╔══════════════════════════════════════════════════╗");
        tracing::info!("║           rag-harness v{}                    ║", env!("CARGO_PKG_VERSION"));
        tracing::info!("╠══════════════════════════════════════════════════╣");
        tracing::info!("║  Datasets:          {:<28}║", self.datasets_dir.display());
        tracing::info!("║  Results:           {:<28}║", self.results_dir.display());
        tracing::info!("║  Scoring provider:  {:<28}║", self.scoring_provider);
        tracing::info!("║  Scoring model:     {:<28}║", self.scoring_model.as_deref().unwrap_or("default"));
        tracing::info!("║  Scorer workers:    {:<28}║", self.scorer_workers);
        tracing::info!("║  Max attempts:      {:<28}║", self.scoring_max_attempts);
        tracing::info!("║  Scoring timeout:   {:<25}s ║", self.scoring_timeout_secs);
        tracing::info!("║  Poll interval:     {:<24}ms ║", self.poll_interval_ms);
        tracing::info!("║  OpenAI key:        {:<28}║", if self.openai_api_key.is_some() { "set" } else { "unset" });
        tracing::info!("╚══════════════════════════════════════════════════╝");
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::from_env();
        assert_eq!(cfg.scorer_workers, DEFAULT_SCORER_WORKERS);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(DEFAULT_POLL_INTERVAL_MS));
        assert_eq!(cfg.scoring_max_attempts, DEFAULT_SCORING_MAX_ATTEMPTS);
    }

    #[test]
    fn test_env_parse_fallback() {
        assert_eq!(env_parse::<u16>("NONEXISTENT_VAR_XYZ", 42), 42);
    }
}
