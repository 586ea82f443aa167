//! LlamaHub dataset download.
//!
//! A LlamaHub dataset lives at `llama_datasets/<folder>` in the
//! llama-datasets repository: `rag_dataset.json` plus a `source_files/`
//! directory. File contents come from the LFS media mirror; the directory
//! listing comes from the GitHub tree page's JSON payload.

use anyhow::{Context, Result};
use futures::StreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::llama::{llama_folder, RAG_DATASET_FILE, SOURCE_FILES_DIR};
use super::DatasetKind;

const REPO_DATASETS_DIR: &str = "llama_datasets";

pub struct DownloadOptions {
    pub lfs_url: String,
    pub tree_url: String,
    /// Cap on the total bytes fetched for one dataset.
    pub max_bytes: usize,
}

#[derive(Debug, Deserialize)]
struct TreePage {
    payload: TreePayload,
}

#[derive(Debug, Deserialize)]
struct TreePayload {
    tree: Tree,
}

#[derive(Debug, Deserialize)]
struct Tree {
    items: Vec<TreeItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TreeItem {
    name: String,
    #[serde(default)]
    content_type: Option<String>,
}

/// File names listed in a GitHub tree page payload. Directories and names
/// that would escape the target directory are dropped.
fn parse_tree_listing(body: &str) -> Result<Vec<String>> {
    let page: TreePage = serde_json::from_str(body).context("Unexpected tree listing format")?;
    Ok(page
        .payload
        .tree
        .items
        .into_iter()
        .filter(|item| item.content_type.as_deref().unwrap_or("file") == "file")
        .map(|item| item.name)
        .filter(|name| is_plain_file_name(name))
        .collect())
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Fetch a LlamaHub dataset into `<root>/llama/<folder>`, where `folder` is
/// the snake_case dataset name without its `Dataset` suffix.
pub async fn download_dataset(
    client: &reqwest::Client,
    kind: DatasetKind,
    name: &str,
    root: &Path,
    opts: &DownloadOptions,
) -> Result<PathBuf> {
    let folder = llama_folder(name);
    let dest = root.join(kind.dir_name()).join(&folder);
    let remote = format!("{}/{}", REPO_DATASETS_DIR, folder);
    let mut budget = opts.max_bytes;

    info!(dataset = %name, remote = %remote, "Downloading LlamaHub dataset");
    tokio::fs::create_dir_all(dest.join(SOURCE_FILES_DIR))
        .await
        .context("Failed to create dataset directory")?;

    let lfs = opts.lfs_url.trim_end_matches('/');
    let url = format!("{}/{}/{}", lfs, remote, RAG_DATASET_FILE);
    budget -= fetch_to_file(client, &url, &dest.join(RAG_DATASET_FILE), budget).await?;

    let listing_url = format!(
        "{}/{}/{}",
        opts.tree_url.trim_end_matches('/'),
        remote,
        SOURCE_FILES_DIR
    );
    let files = list_source_files(client, &listing_url).await?;
    info!(dataset = %name, files = %files.len(), "Fetching source files");

    for file in &files {
        let url = format!("{}/{}/{}/{}", lfs, remote, SOURCE_FILES_DIR, file);
        let target = dest.join(SOURCE_FILES_DIR).join(file);
        budget -= fetch_to_file(client, &url, &target, budget).await?;
    }

    info!(
        dataset = %name,
        path = %dest.display(),
        bytes = %(opts.max_bytes - budget),
        "Dataset ready"
    );
    Ok(dest)
}

async fn list_source_files(client: &reqwest::Client, url: &str) -> Result<Vec<String>> {
    debug!("Listing source files at {}", url);
    let resp = client
        .get(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .context("Failed to list source files")?;
    if !resp.status().is_success() {
        anyhow::bail!("Source file listing failed: HTTP {}", resp.status().as_u16());
    }
    let body = resp.text().await.context("Failed to read source file listing")?;
    parse_tree_listing(&body)
}

/// Stream `url` into `target`, giving up once more than `max_bytes` have
/// arrived. Returns the number of bytes written.
async fn fetch_to_file(
    client: &reqwest::Client,
    url: &str,
    target: &Path,
    max_bytes: usize,
) -> Result<usize> {
    debug!("Downloading {}", url);
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to download {}", url))?;
    if !resp.status().is_success() {
        anyhow::bail!("Download of {} failed: HTTP {}", url, resp.status().as_u16());
    }

    let mut file = tokio::fs::File::create(target)
        .await
        .with_context(|| format!("Failed to create {}", target.display()))?;
    let mut written = 0usize;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Failed to read response body")?;
        written += chunk.len();
        if written > max_bytes {
            drop(file);
            let _ = tokio::fs::remove_file(target).await;
            anyhow::bail!("Dataset too large: more than {} bytes", max_bytes);
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serve `routes` (path -> body) over plain HTTP; anything else is a 404.
    async fn serve(routes: HashMap<String, Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes = Arc::new(routes);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let routes = Arc::clone(&routes);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        let n = socket.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }
                    let request = String::from_utf8_lossy(&buf);
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let (status, body) = match routes.get(&path) {
                        Some(body) => ("200 OK", body.clone()),
                        None => ("404 Not Found", Vec::new()),
                    };
                    let head = format!(
                        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        status,
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    fn tree_page(names: &[(&str, &str)]) -> Vec<u8> {
        let items: Vec<serde_json::Value> = names
            .iter()
            .map(|(name, kind)| serde_json::json!({"name": name, "contentType": kind}))
            .collect();
        serde_json::json!({"payload": {"tree": {"items": items}}})
            .to_string()
            .into_bytes()
    }

    fn options(base: &str, max_bytes: usize) -> DownloadOptions {
        DownloadOptions {
            lfs_url: format!("{}/lfs", base),
            tree_url: format!("{}/tree", base),
            max_bytes,
        }
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    fn essay_routes() -> HashMap<String, Vec<u8>> {
        let mut routes = HashMap::new();
        routes.insert(
            "/lfs/llama_datasets/paul_graham_essay/rag_dataset.json".to_string(),
            br#"{"examples": [{"query": "Who?", "reference_answer": "Paul"}]}"#.to_vec(),
        );
        routes.insert(
            "/tree/llama_datasets/paul_graham_essay/source_files".to_string(),
            tree_page(&[("essay.txt", "file"), ("nested", "directory")]),
        );
        routes.insert(
            "/lfs/llama_datasets/paul_graham_essay/source_files/essay.txt".to_string(),
            b"What I worked on.".to_vec(),
        );
        routes
    }

    #[tokio::test]
    async fn test_download_lfs_layout() {
        let base = serve(essay_routes()).await;
        let tmp = tempfile::tempdir().unwrap();

        let dest = download_dataset(
            &client(),
            DatasetKind::Llama,
            "PaulGrahamEssayDataset",
            tmp.path(),
            &options(&base, 1 << 20),
        )
        .await
        .unwrap();

        assert_eq!(dest, tmp.path().join("llama/paul_graham_essay"));
        let examples = std::fs::read_to_string(dest.join(RAG_DATASET_FILE)).unwrap();
        assert!(examples.contains("Paul"));
        assert_eq!(
            std::fs::read_to_string(dest.join("source_files/essay.txt")).unwrap(),
            "What I worked on."
        );
        assert!(!dest.join("source_files/nested").exists());
    }

    #[tokio::test]
    async fn test_download_rejects_oversized_body() {
        let base = serve(essay_routes()).await;
        let tmp = tempfile::tempdir().unwrap();

        let err = download_dataset(
            &client(),
            DatasetKind::Llama,
            "PaulGrahamEssay",
            tmp.path(),
            &options(&base, 16),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("too large"));
        assert!(!tmp
            .path()
            .join("llama/paul_graham_essay")
            .join(RAG_DATASET_FILE)
            .exists());
    }

    #[tokio::test]
    async fn test_download_unknown_dataset() {
        let base = serve(HashMap::new()).await;
        let tmp = tempfile::tempdir().unwrap();
        let err = download_dataset(
            &client(),
            DatasetKind::Llama,
            "NoSuchDataset",
            tmp.path(),
            &options(&base, 1 << 20),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("HTTP 404"));
    }

    #[test]
    fn test_parse_tree_listing_drops_unsafe_names() {
        let body = tree_page(&[
            ("a.txt", "file"),
            ("../escape.txt", "file"),
            ("sub", "directory"),
            ("b.md", "file"),
        ]);
        let names = parse_tree_listing(std::str::from_utf8(&body).unwrap()).unwrap();
        assert_eq!(names, vec!["a.txt", "b.md"]);
        assert!(parse_tree_listing("<html></html>").is_err());
    }
}
