//! End-to-end API tests over the in-memory router.

use axum::http::StatusCode;
use axum::Router;
use quarry_core::config::AppConfig;
use quarry_query::cursor::{ColumnMeta, ColumnType, SqlValue};
use quarry_query::providers::{ConnectionProvider, MemoryProvider, ProviderRegistry};
use quarry_query::{QueryService, StoreLockService};
use quarry_server::{create_router, AppState};
use quarry_storage::{FilesystemBackend, ObjectStore};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct TestServer {
    router: Router,
    provider: Arc<MemoryProvider>,
    _dir: tempfile::TempDir,
}

async fn test_server(metrics_enabled: bool) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(FilesystemBackend::new(dir.path()).await.unwrap());

    let provider = Arc::new(MemoryProvider::new());
    provider.seed(
        "select id, name from things",
        vec![
            ColumnMeta::new("id", ColumnType::I64, false),
            ColumnMeta::new("name", ColumnType::Text, true),
        ],
        (0..10)
            .map(|i| vec![SqlValue::I64(i), SqlValue::Text(format!("thing-{i}"))])
            .collect(),
    );
    let registry = ProviderRegistry::new(vec![provider.clone() as Arc<dyn ConnectionProvider>]);

    let config: AppConfig = serde_json::from_value(json!({
        "server": {"metrics_enabled": metrics_enabled},
        "query_cache": {"bucket": "results", "compress": false},
        "storage": {"type": "filesystem", "path": dir.path()},
    }))
    .unwrap();

    let lock = Arc::new(StoreLockService::new(store.clone()));
    let service = Arc::new(
        QueryService::new(
            config.query_cache.clone(),
            config.datasources.clone(),
            store.clone(),
            lock,
            registry,
        )
        .unwrap(),
    );

    quarry_server::metrics::register_metrics();
    let router = create_router(AppState::new(config, store, service));

    TestServer {
        router,
        provider,
        _dir: dir,
    }
}

async fn request(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Vec<u8>) {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };

    let response = router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

async fn json_request(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let (status, bytes) = request(router, method, uri, body).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn submit_body() -> Value {
    json!({
        "datasource": {"url": "memory://fixtures"},
        "sql": "select id, name from things",
        "format": {"gzip": false},
    })
}

async fn submit_and_wait(router: &Router) -> String {
    let (status, body) = json_request(router, "POST", "/v1/query", Some(submit_body())).await;
    assert!(
        status == StatusCode::ACCEPTED || status == StatusCode::OK,
        "unexpected submit status {status}"
    );
    let query_id = body["queryId"].as_str().unwrap().to_string();

    for _ in 0..250 {
        let (status, body) =
            json_request(router, "GET", &format!("/v1/query/{query_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        match body["status"].as_str().unwrap() {
            "DONE" | "HIT" => return query_id,
            "FAILED" => panic!("materialization failed: {body}"),
            _ => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    panic!("query {query_id} never finished");
}

#[tokio::test]
async fn test_submit_poll_and_hit() {
    let server = test_server(true).await;

    let (status, body) =
        json_request(&server.router, "POST", "/v1/query", Some(submit_body())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "RUNNING");
    let query_id = body["queryId"].as_str().unwrap().to_string();

    let finished = submit_and_wait(&server.router).await;
    assert_eq!(finished, query_id);
    assert_eq!(server.provider.open_count(), 1);

    // Resubmit: immediate HIT with the result pointer.
    let (status, body) =
        json_request(&server.router, "POST", "/v1/query", Some(submit_body())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "HIT");
    assert_eq!(body["result"]["rowCount"], 10);
    assert_eq!(server.provider.open_count(), 1);
}

#[tokio::test]
async fn test_manifest_and_chunk_download() {
    let server = test_server(true).await;
    let query_id = submit_and_wait(&server.router).await;

    let (status, manifest) = json_request(
        &server.router,
        "GET",
        &format!("/v1/query/{query_id}/manifest"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(manifest["totalRows"], 10);
    assert!(!manifest["compressed"].as_bool().unwrap());
    let chunks = manifest["chunks"].as_array().unwrap();
    assert!(!chunks.is_empty());
    assert_eq!(chunks[0]["part"], 1);

    let (status, bytes) = request(
        &server.router,
        "GET",
        &format!("/v1/query/{query_id}/chunk/1"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(bytes).unwrap();
    let first: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(first["id"], 0);
    assert_eq!(first["name"], "thing-0");

    // A part the manifest does not know.
    let (status, _) = json_request(
        &server.router,
        "GET",
        &format!("/v1/query/{query_id}/chunk/99"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stream_concatenates_all_chunks() {
    let server = test_server(true).await;
    let query_id = submit_and_wait(&server.router).await;

    let (status, bytes) = request(
        &server.router,
        "GET",
        &format!("/v1/query/{query_id}/stream"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(bytes).unwrap();
    assert_eq!(text.lines().count(), 10);
}

#[tokio::test]
async fn test_unknown_query_is_404() {
    let server = test_server(true).await;

    let absent = "0".repeat(64);
    let (status, body) =
        json_request(&server.router, "GET", &format!("/v1/query/{absent}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, _) =
        json_request(&server.router, "GET", "/v1/query/not-a-key/manifest", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_chunk_size_is_400() {
    let server = test_server(true).await;

    let mut body = submit_body();
    body["chunking"] = json!({"targetChunkBytes": "1KiB"});
    let (status, body) = json_request(&server.router, "POST", "/v1/query", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = test_server(true).await;

    let (status, body) = json_request(&server.router, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "filesystem");
}

#[tokio::test]
async fn test_metrics_endpoint_is_gated_by_config() {
    let enabled = test_server(true).await;
    let (status, bytes) = request(&enabled.router, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(bytes)
        .unwrap()
        .contains("quarry_queries_submitted_total"));

    let disabled = test_server(false).await;
    let (status, _) = request(&disabled.router, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
