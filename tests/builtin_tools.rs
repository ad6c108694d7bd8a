use research_agent::tools::builtin::{ToolContext, default_tools};
use research_agent::tools::cache::ToolCache;
use research_agent::tools::{ToolCall, ToolCategory, ToolDispatcher, ToolRegistry};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn dispatcher_for(root: &Path) -> ToolDispatcher {
    let ctx = ToolContext::new(root, Arc::new(ToolCache::default())).unwrap();
    let registry = ToolRegistry::new();
    registry.initialize(default_tools(&ctx)).unwrap();
    ToolDispatcher::new(Arc::new(registry))
}

fn fixture() -> ToolDispatcher {
    dispatcher_for(Path::new("tests/fixtures/research_workspace"))
}

async fn run(dispatcher: &ToolDispatcher, tool: &str, arguments: Value) -> (String, bool) {
    let call = ToolCall {
        tool: tool.into(),
        arguments,
    };
    dispatcher.dispatch(&call, &CancellationToken::new()).await
}

#[test]
fn default_tools_are_registered_by_category() {
    let dispatcher = fixture();
    let registry = dispatcher.registry();
    assert_eq!(
        registry.list_tools(),
        vec!["batch_fetch", "fetch_url", "list_files", "read_file", "search_code", "write_file"]
    );
    assert_eq!(registry.tools_by_category(ToolCategory::FileSystem).len(), 4);
    assert_eq!(registry.tools_by_category(ToolCategory::Web).len(), 2);
}

#[tokio::test]
async fn list_files_root() {
    let (result, is_error) = run(&fixture(), "list_files", json!({"path": "."})).await;
    assert!(!is_error, "list_files root failed: {result}");
    assert!(result.starts_with("[list_files] result:"));
    assert!(result.contains("notes/"), "should list notes/ directory");
    assert!(result.contains("README.md"));
}

#[tokio::test]
async fn list_files_with_pattern() {
    let (result, is_error) =
        run(&fixture(), "list_files", json!({"path": "notes", "pattern": "*.md"})).await;
    assert!(!is_error, "list_files pattern failed: {result}");
    assert!(result.contains("notes/station_a.md"));
    assert!(!result.contains("drift.rs"));
}

#[tokio::test]
async fn read_file_full() {
    let (result, is_error) =
        run(&fixture(), "read_file", json!({"path": "notes/station_a.md"})).await;
    assert!(!is_error, "read_file failed: {result}");
    assert!(result.contains("   1 | # Station A"));
    assert!(result.contains("recalibrated"));
}

#[tokio::test]
async fn read_file_line_range() {
    let (result, is_error) = run(
        &fixture(),
        "read_file",
        json!({"path": "notes/station_b.md", "start_line": 3, "end_line": 4}),
    )
    .await;
    assert!(!is_error, "read_file line range failed: {result}");
    let numbered: Vec<&str> = result.lines().filter(|l| l.contains(" | ")).collect();
    assert_eq!(numbered.len(), 2);
    assert!(numbered[0].trim_start().starts_with("3 |"));
}

#[tokio::test]
async fn search_code_finds_matches() {
    let (result, is_error) = run(&fixture(), "search_code", json!({"pattern": "drift"})).await;
    assert!(!is_error, "search_code failed: {result}");
    assert!(result.contains("notes/station_a.md:5"));
    assert!(result.contains("src/drift.rs"));
}

#[tokio::test]
async fn search_code_extension_filter() {
    let (result, is_error) = run(
        &fixture(),
        "search_code",
        json!({"pattern": "drift", "file_pattern": "rs"}),
    )
    .await;
    assert!(!is_error);
    assert!(result.contains("src/drift.rs"));
    assert!(!result.contains("station_a"));
}

#[tokio::test]
async fn search_code_no_matches_is_not_an_error() {
    let (result, is_error) =
        run(&fixture(), "search_code", json!({"pattern": "zzzz_nothing"})).await;
    assert!(!is_error);
    assert!(result.contains("No matches"));
}

#[tokio::test]
async fn path_traversal_blocked() {
    let (result, is_error) =
        run(&fixture(), "read_file", json!({"path": "../../Cargo.toml"})).await;
    assert!(is_error, "path traversal should be blocked");
    assert!(result.starts_with("Tool 'read_file' failed:"));
    assert!(result.contains("traversal"));
}

#[tokio::test]
async fn missing_required_param_is_invalid() {
    let (result, is_error) = run(&fixture(), "read_file", json!({})).await;
    assert!(is_error);
    assert!(result.contains("Invalid parameters"));
}

#[tokio::test]
async fn unknown_tool_names_the_tool() {
    let (result, is_error) = run(&fixture(), "get_weather", json!({})).await;
    assert!(is_error);
    assert!(result.contains("'get_weather'"));
    assert!(result.contains("not found"));
}

#[tokio::test]
async fn write_then_read_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = dispatcher_for(dir.path());

    let (result, is_error) = run(
        &dispatcher,
        "write_file",
        json!({"path": "out/summary.md", "content": "line one\n"}),
    )
    .await;
    assert!(!is_error, "write_file failed: {result}");

    let (_, is_error) = run(
        &dispatcher,
        "write_file",
        json!({"path": "out/summary.md", "content": "line two\n", "append": true}),
    )
    .await;
    assert!(!is_error);

    let written = std::fs::read_to_string(dir.path().join("out/summary.md")).unwrap();
    assert_eq!(written, "line one\nline two\n");

    let (result, _) = run(&dispatcher, "read_file", json!({"path": "out/summary.md"})).await;
    assert!(result.contains("   2 | line two"));
}

#[tokio::test]
async fn write_outside_workspace_blocked() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = dispatcher_for(dir.path());
    let (result, is_error) = run(
        &dispatcher,
        "write_file",
        json!({"path": "../escape.txt", "content": "x"}),
    )
    .await;
    assert!(is_error, "{result}");
    assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
}

#[tokio::test]
async fn fetch_url_rejects_non_http_schemes() {
    let (result, is_error) =
        run(&fixture(), "fetch_url", json!({"url": "file:///etc/passwd"})).await;
    assert!(is_error);
    assert!(result.contains("Invalid parameters"));
}

#[cfg(unix)]
#[tokio::test]
async fn write_through_outward_symlink_creates_nothing_outside() {
    let workspace = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    std::os::unix::fs::symlink(outside.path(), workspace.path().join("link")).unwrap();
    let dispatcher = dispatcher_for(workspace.path());

    let (result, is_error) = run(
        &dispatcher,
        "write_file",
        json!({"path": "link/planted/deep/f.txt", "content": "x"}),
    )
    .await;
    assert!(is_error, "{result}");
    assert!(result.contains("outside workspace"), "{result}");
    assert!(!outside.path().join("planted").exists());
}
