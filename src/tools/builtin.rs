//! Built-in tools: workspace file access plus web fetching.
//!
//! File tools resolve every path relative to the workspace root and reject
//! traversal. Web tools share one HTTP client and the result cache.

use super::batch::{DEFAULT_CONCURRENCY, run_bounded};
use super::cache::ToolCache;
use super::{Tool, ToolCategory};
use crate::http::HttpClient;
use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

/// Max chars returned from any single tool invocation.
const MAX_RESULT_CHARS: usize = 5000;
const MAX_SEARCH_MATCHES: usize = 50;
const MAX_BATCH_URLS: usize = 20;
const WEB_TIMEOUT_MS: u64 = 30_000;

/// Shared state handed to the built-in tools.
#[derive(Clone)]
pub struct ToolContext {
    pub workspace: PathBuf,
    pub http: HttpClient,
    pub cache: Arc<ToolCache>,
    pub batch_concurrency: usize,
}

impl ToolContext {
    pub fn new(workspace: impl Into<PathBuf>, cache: Arc<ToolCache>) -> crate::error::Result<Self> {
        Ok(Self {
            workspace: workspace.into(),
            http: HttpClient::new("web", WEB_TIMEOUT_MS)?,
            cache,
            batch_concurrency: DEFAULT_CONCURRENCY,
        })
    }

    pub fn with_batch_concurrency(mut self, limit: usize) -> Self {
        self.batch_concurrency = limit;
        self
    }
}

/// The default tool set, fed to `ToolRegistry::initialize`.
pub fn default_tools(ctx: &ToolContext) -> Vec<Arc<dyn Tool>> {
    let root = ctx.workspace.clone();
    vec![
        Arc::new(ListFiles { root: root.clone() }),
        Arc::new(ReadFile { root: root.clone() }),
        Arc::new(SearchCode { root: root.clone() }),
        Arc::new(WriteFile { root }),
        Arc::new(FetchUrl {
            http: ctx.http.clone(),
            cache: ctx.cache.clone(),
        }),
        Arc::new(BatchFetch {
            http: ctx.http.clone(),
            cache: ctx.cache.clone(),
            limit: ctx.batch_concurrency,
        }),
    ]
}

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn has_str(params: &Value, key: &str) -> bool {
    str_param(params, key).is_some_and(|s| !s.trim().is_empty())
}

fn optional_is<F: Fn(&Value) -> bool>(params: &Value, key: &str, check: F) -> bool {
    params.get(key).is_none_or(|v| v.is_null() || check(v))
}

fn clean_relative(user_path: &str) -> anyhow::Result<String> {
    let cleaned = user_path.replace('\\', "/");
    let cleaned = cleaned.trim_start_matches('/');
    if cleaned.split('/').any(|part| part == "..") {
        bail!("Path traversal (..) is not allowed");
    }
    Ok(cleaned.to_string())
}

/// Resolve an existing path under `root`, rejecting traversal.
fn safe_resolve(root: &Path, user_path: &str) -> anyhow::Result<PathBuf> {
    let cleaned = clean_relative(user_path)?;
    let canonical_root = root
        .canonicalize()
        .with_context(|| format!("Cannot resolve workspace root {}", root.display()))?;
    let canonical = root
        .join(&cleaned)
        .canonicalize()
        .with_context(|| format!("Cannot resolve path '{user_path}'"))?;
    if !canonical.starts_with(&canonical_root) {
        bail!("Path resolves outside workspace");
    }
    Ok(canonical)
}

/// Resolve a possibly new file under `root`. Missing parent directories are
/// created once the parent is known to stay inside the workspace.
fn safe_resolve_for_write(root: &Path, user_path: &str) -> anyhow::Result<PathBuf> {
    let cleaned = clean_relative(user_path)?;
    if cleaned.is_empty() || cleaned.ends_with('/') {
        bail!("'{user_path}' is not a file path");
    }
    let canonical_root = root
        .canonicalize()
        .with_context(|| format!("Cannot resolve workspace root {}", root.display()))?;
    let target = canonical_root.join(&cleaned);
    let parent = target
        .parent()
        .ok_or_else(|| anyhow!("'{user_path}' has no parent directory"))?;

    // Check the deepest existing ancestor before creating anything, so a
    // symlink pointing out of the workspace never gets directories made
    // behind it.
    let existing = parent
        .ancestors()
        .find(|p| std::fs::symlink_metadata(p).is_ok())
        .unwrap_or(&canonical_root);
    let canonical_existing = existing
        .canonicalize()
        .with_context(|| format!("Cannot resolve path '{user_path}'"))?;
    if !canonical_existing.starts_with(&canonical_root) {
        bail!("Path resolves outside workspace");
    }

    std::fs::create_dir_all(parent)
        .with_context(|| format!("Cannot create directory {}", parent.display()))?;
    let canonical_parent = parent.canonicalize()?;
    if !canonical_parent.starts_with(&canonical_root) {
        bail!("Path resolves outside workspace");
    }
    let file_name = target
        .file_name()
        .ok_or_else(|| anyhow!("'{user_path}' has no file name"))?;
    Ok(canonical_parent.join(file_name))
}

fn truncate(s: String) -> String {
    if s.len() <= MAX_RESULT_CHARS {
        return s;
    }
    let mut cut = MAX_RESULT_CHARS;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = s[..cut].to_string();
    out.push_str("\n... [truncated]");
    out
}

fn is_skipped_dir(name: &str) -> bool {
    name.starts_with('.') || name == "target" || name == "node_modules"
}

async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow!("worker failed: {e}"))?
}

pub struct ListFiles {
    root: PathBuf,
}

#[async_trait]
impl Tool for ListFiles {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files in a workspace directory, two levels deep. Returns paths relative to the \
         workspace root. Use to discover structure before reading specific files."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FileSystem
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path relative to the workspace root. Use '.' for the root."
                },
                "pattern": {
                    "type": "string",
                    "description": "Optional suffix filter such as '*.md'. Omit to list all."
                }
            }
        })
    }

    fn validate(&self, params: &Value) -> bool {
        params.is_object()
            && optional_is(params, "path", Value::is_string)
            && optional_is(params, "pattern", Value::is_string)
    }

    async fn execute(&self, params: Value, _cancel: &CancellationToken) -> anyhow::Result<Value> {
        let path = str_param(&params, "path").unwrap_or(".").to_string();
        let pattern = str_param(&params, "pattern").map(str::to_string);
        let root = self.root.clone();

        let listing = blocking(move || {
            let dir = safe_resolve(&root, &path)?;
            if !dir.is_dir() {
                bail!("Not a directory: {path}");
            }
            let canonical_root = root.canonicalize()?;
            debug!(dir = %dir.display(), "list_files");

            let mut entries = Vec::new();
            for entry in WalkDir::new(&dir)
                .max_depth(2)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| {
                    e.path() == dir
                        || !e.file_name().to_str().is_some_and(is_skipped_dir)
                })
                .filter_map(|e| e.ok())
            {
                let ep = entry.path();
                if ep == dir {
                    continue;
                }
                let Ok(rel) = ep.strip_prefix(&canonical_root) else {
                    continue;
                };
                let rel_str = rel.to_string_lossy();
                if let Some(pat) = &pattern
                    && !rel_str.ends_with(pat.trim_start_matches('*'))
                {
                    continue;
                }
                let suffix = if ep.is_dir() { "/" } else { "" };
                entries.push(format!("{rel_str}{suffix}"));
            }
            entries.sort();
            Ok(entries)
        })
        .await?;

        if listing.is_empty() {
            Ok(Value::String("No files found".into()))
        } else {
            Ok(Value::String(truncate(listing.join("\n"))))
        }
    }
}

pub struct ReadFile {
    root: PathBuf,
}

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a workspace file with line numbers. Optionally restrict to a line range. \
         Large files are truncated."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FileSystem
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path relative to the workspace root."},
                "start_line": {"type": "integer", "description": "Start line (1-indexed)."},
                "end_line": {"type": "integer", "description": "End line (inclusive)."}
            },
            "required": ["path"]
        })
    }

    fn validate(&self, params: &Value) -> bool {
        has_str(params, "path")
            && optional_is(params, "start_line", Value::is_u64)
            && optional_is(params, "end_line", Value::is_u64)
    }

    async fn execute(&self, params: Value, _cancel: &CancellationToken) -> anyhow::Result<Value> {
        let path = str_param(&params, "path").unwrap_or_default();
        let start = params["start_line"].as_u64().map(|n| n as usize);
        let end = params["end_line"].as_u64().map(|n| n as usize);

        let (root, rel) = (self.root.clone(), path.to_string());
        let file = blocking(move || {
            let file = safe_resolve(&root, &rel)?;
            if !file.is_file() {
                bail!("Not a file: {rel}");
            }
            Ok(file)
        })
        .await?;
        debug!(file = %file.display(), "read_file");

        let content = tokio::fs::read_to_string(&file)
            .await
            .with_context(|| format!("Cannot read file '{path}'"))?;
        let lines: Vec<&str> = content.lines().collect();
        if lines.is_empty() {
            return Ok(Value::String(String::new()));
        }

        let start_idx = start.unwrap_or(1).saturating_sub(1);
        let end_idx = end.unwrap_or(lines.len()).min(lines.len());
        if start_idx >= lines.len() {
            bail!("Start line {} exceeds file length {}", start_idx + 1, lines.len());
        }
        if end_idx <= start_idx {
            bail!("End line {end_idx} is before start line {}", start_idx + 1);
        }

        let numbered = lines[start_idx..end_idx]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>4} | {}", start_idx + i + 1, line))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(Value::String(truncate(numbered)))
    }
}

pub struct SearchCode {
    root: PathBuf,
}

#[async_trait]
impl Tool for SearchCode {
    fn name(&self) -> &str {
        "search_code"
    }

    fn description(&self) -> &str {
        "Search workspace files for a case-sensitive substring. Returns matching lines with \
         file paths and line numbers."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FileSystem
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Text to search for."},
                "file_pattern": {
                    "type": "string",
                    "description": "Optional file extension filter such as 'rs' or 'md'."
                }
            },
            "required": ["pattern"]
        })
    }

    fn validate(&self, params: &Value) -> bool {
        has_str(params, "pattern") && optional_is(params, "file_pattern", Value::is_string)
    }

    async fn execute(&self, params: Value, cancel: &CancellationToken) -> anyhow::Result<Value> {
        let pattern = str_param(&params, "pattern").unwrap_or_default().to_string();
        let file_ext = str_param(&params, "file_pattern")
            .map(|e| e.trim_start_matches("*.").trim_start_matches('.').to_string());
        let root = self.root.clone();
        let cancel = cancel.clone();
        debug!(pattern = %pattern, "search_code");

        let text = blocking(move || {
            let canonical_root = root.canonicalize()?;
            let mut results = Vec::new();
            let mut total = 0usize;

            for entry in WalkDir::new(&canonical_root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| {
                    e.depth() == 0 || !e.file_name().to_str().is_some_and(is_skipped_dir)
                })
                .filter_map(|e| e.ok())
            {
                if cancel.is_cancelled() {
                    bail!("Operation cancelled");
                }
                let ep = entry.path();
                if !ep.is_file() {
                    continue;
                }
                if let Some(ext) = &file_ext
                    && ep.extension().is_none_or(|e| e != ext.as_str())
                {
                    continue;
                }
                // Non-UTF-8 files are skipped.
                let Ok(content) = std::fs::read_to_string(ep) else {
                    continue;
                };
                let rel = ep.strip_prefix(&canonical_root).unwrap_or(ep);
                for (line_num, line) in content.lines().enumerate() {
                    if line.contains(pattern.as_str()) {
                        total += 1;
                        if results.len() < MAX_SEARCH_MATCHES {
                            results.push(format!(
                                "{}:{}: {}",
                                rel.display(),
                                line_num + 1,
                                line.trim()
                            ));
                        }
                    }
                }
            }

            if results.is_empty() {
                return Ok(format!("No matches for '{pattern}'"));
            }
            let header = if total > MAX_SEARCH_MATCHES {
                format!("Found {total} matches (showing first {MAX_SEARCH_MATCHES}):\n")
            } else {
                format!("Found {total} matches:\n")
            };
            Ok(truncate(format!("{header}{}", results.join("\n"))))
        })
        .await?;

        Ok(Value::String(text))
    }
}

pub struct WriteFile {
    root: PathBuf,
}

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text to a workspace file, creating it (and parent directories) if needed. \
         Set append=true to add to the end instead of replacing."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::FileSystem
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path relative to the workspace root."},
                "content": {"type": "string", "description": "Text to write."},
                "append": {"type": "boolean", "description": "Append instead of overwrite."}
            },
            "required": ["path", "content"]
        })
    }

    fn validate(&self, params: &Value) -> bool {
        has_str(params, "path")
            && params.get("content").is_some_and(Value::is_string)
            && optional_is(params, "append", Value::is_boolean)
    }

    async fn execute(&self, params: Value, _cancel: &CancellationToken) -> anyhow::Result<Value> {
        let path = str_param(&params, "path").unwrap_or_default();
        let content = str_param(&params, "content").unwrap_or_default();
        let append = params["append"].as_bool().unwrap_or(false);

        let (root, rel) = (self.root.clone(), path.to_string());
        let file = blocking(move || {
            let file = safe_resolve_for_write(&root, &rel)?;
            if file.is_dir() {
                bail!("'{rel}' is a directory");
            }
            Ok(file)
        })
        .await?;
        debug!(file = %file.display(), append, "write_file");

        if append {
            use tokio::io::AsyncWriteExt;
            let mut handle = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file)
                .await
                .with_context(|| format!("Cannot open '{path}'"))?;
            handle.write_all(content.as_bytes()).await?;
            handle.flush().await?;
        } else {
            tokio::fs::write(&file, content)
                .await
                .with_context(|| format!("Cannot write '{path}'"))?;
        }

        Ok(json!({"path": path, "bytes": content.len(), "append": append}))
    }
}

fn valid_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// GET `url` as text, consulting the cache first.
async fn fetch_cached(
    http: &HttpClient,
    cache: &ToolCache,
    url: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<String> {
    if let Some(hit) = cache.get(url) {
        debug!(url, "fetch cache hit");
        return Ok(hit);
    }
    debug!(url, "fetching");
    let body = http.get_text(url, &[], cancel).await?;
    cache.insert(url, body.clone());
    Ok(body)
}

pub struct FetchUrl {
    http: HttpClient,
    cache: Arc<ToolCache>,
}

#[async_trait]
impl Tool for FetchUrl {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch a web page or API endpoint over HTTP(S) and return its body as text. \
         Responses are cached for a few minutes."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Web
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "Absolute http:// or https:// URL."}
            },
            "required": ["url"]
        })
    }

    fn validate(&self, params: &Value) -> bool {
        str_param(params, "url").is_some_and(valid_url)
    }

    async fn execute(&self, params: Value, cancel: &CancellationToken) -> anyhow::Result<Value> {
        let url = str_param(&params, "url").unwrap_or_default();
        let body = fetch_cached(&self.http, &self.cache, url, cancel).await?;
        Ok(Value::String(truncate(body)))
    }
}

pub struct BatchFetch {
    http: HttpClient,
    cache: Arc<ToolCache>,
    limit: usize,
}

#[async_trait]
impl Tool for BatchFetch {
    fn name(&self) -> &str {
        "batch_fetch"
    }

    fn description(&self) -> &str {
        "Fetch several URLs with bounded concurrency. Returns one entry per URL in input \
         order; a failing URL does not affect the others."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Web
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "urls": {
                    "type": "array",
                    "items": {"type": "string"},
                    "maxItems": MAX_BATCH_URLS
                }
            },
            "required": ["urls"]
        })
    }

    fn validate(&self, params: &Value) -> bool {
        params
            .get("urls")
            .and_then(Value::as_array)
            .is_some_and(|urls| {
                !urls.is_empty()
                    && urls.len() <= MAX_BATCH_URLS
                    && urls.iter().all(|u| u.as_str().is_some_and(valid_url))
            })
    }

    async fn execute(&self, params: Value, cancel: &CancellationToken) -> anyhow::Result<Value> {
        let urls: Vec<String> = params["urls"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|u| u.as_str().map(str::to_string))
            .collect();
        debug!(count = urls.len(), limit = self.limit, "batch_fetch");

        let http = &self.http;
        let cache = self.cache.as_ref();
        let results = run_bounded(urls, self.limit, move |url| async move {
            match fetch_cached(http, cache, &url, cancel).await {
                Ok(body) => json!({"url": url, "success": true, "body": truncate(body)}),
                Err(e) => json!({"url": url, "success": false, "error": e.to_string()}),
            }
        })
        .await;

        Ok(Value::Array(results))
    }
}
