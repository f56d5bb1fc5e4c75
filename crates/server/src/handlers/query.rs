//! Query cache endpoints: submit, status, manifest, and chunk download.

use crate::error::ApiResult;
use crate::metrics;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use quarry_core::manifest::Manifest;
use quarry_core::request::CacheRequest;
use quarry_core::status::QueryStatus;
use quarry_query::service::StatusResponse;

/// Content type of a chunk object, derived from its key extension.
fn chunk_content_type(key: &str) -> &'static str {
    if key.ends_with(".ndjson.gz") {
        "application/x-ndjson+gzip"
    } else if key.ends_with(".ndjson") {
        "application/x-ndjson"
    } else if key.ends_with(".arrow.gz") {
        "application/vnd.apache.arrow.stream+gzip"
    } else if key.ends_with(".arrow") {
        "application/vnd.apache.arrow.stream"
    } else {
        "application/octet-stream"
    }
}

/// POST /v1/query - submit a request.
///
/// Answers 200 with a HIT when the result already exists, 202 when a
/// materialization is running (here or elsewhere).
pub async fn submit_query(
    State(state): State<AppState>,
    Json(request): Json<CacheRequest>,
) -> ApiResult<Response> {
    let timer = metrics::SUBMIT_DURATION.start_timer();
    metrics::QUERIES_SUBMITTED.inc();

    let response = state.service.submit(request).await?;
    timer.observe_duration();

    let status = match response.status {
        QueryStatus::Hit => {
            metrics::QUERY_CACHE_HITS.inc();
            StatusCode::OK
        }
        _ => {
            metrics::MATERIALIZATIONS_STARTED.inc();
            StatusCode::ACCEPTED
        }
    };
    Ok((status, Json(response)).into_response())
}

/// GET /v1/query/{query_id} - current state of a query.
pub async fn get_query_status(
    State(state): State<AppState>,
    Path(query_id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    Ok(Json(state.service.status(&query_id).await?))
}

/// GET /v1/query/{query_id}/manifest - the manifest of a completed query.
pub async fn get_manifest(
    State(state): State<AppState>,
    Path(query_id): Path<String>,
) -> ApiResult<Json<Manifest>> {
    Ok(Json(state.service.manifest(&query_id).await?))
}

/// GET /v1/query/{query_id}/chunk/{part} - one chunk, streamed as stored.
pub async fn get_chunk(
    State(state): State<AppState>,
    Path((query_id, part)): Path<(String, u32)>,
) -> ApiResult<Response> {
    let (descriptor, stream) = state.service.chunk(&query_id, part).await?;

    metrics::CHUNKS_SERVED.inc();
    metrics::BYTES_SERVED.inc_by(descriptor.bytes);

    let body = Body::from_stream(
        stream.map(|result| result.map_err(|e| std::io::Error::other(e.to_string()))),
    );
    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, chunk_content_type(&descriptor.key)),
            (CONTENT_LENGTH, &descriptor.bytes.to_string()),
        ],
        body,
    )
        .into_response())
}

/// GET /v1/query/{query_id}/stream - all chunks concatenated in part order.
///
/// Gzip chunks are self-contained members, so the concatenation is itself a
/// valid gzip stream; the same holds for ndjson and for Arrow IPC streams
/// decoded chunk by chunk.
pub async fn stream_query(
    State(state): State<AppState>,
    Path(query_id): Path<String>,
) -> ApiResult<Response> {
    let manifest = state.service.manifest(&query_id).await?;

    let content_type = manifest
        .chunks
        .first()
        .map(|c| chunk_content_type(&c.key))
        .unwrap_or("application/octet-stream");
    let total_bytes: u64 = manifest.chunks.iter().map(|c| c.bytes).sum();

    metrics::CHUNKS_SERVED.inc_by(manifest.chunks.len() as u64);
    metrics::BYTES_SERVED.inc_by(total_bytes);

    let storage = state.storage.clone();
    let stream = futures::stream::iter(manifest.chunks)
        .then(move |chunk| {
            let storage = storage.clone();
            async move {
                match storage.get(&chunk.key).await {
                    Ok(data) => Ok(data),
                    Err(e) => {
                        tracing::error!(
                            key = %chunk.key,
                            error = %e,
                            "result streaming failed mid-transfer"
                        );
                        Err(e)
                    }
                }
            }
        })
        .map(|result| result.map_err(|e| std::io::Error::other(e.to_string())));

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, content_type),
            (CONTENT_LENGTH, &total_bytes.to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}
