//! Backpressured chunk writer.
//!
//! A single producer drains the row cursor through a row encoder, sealing a
//! chunk whenever the encoded payload reaches the target size. Sealed chunks
//! go through a bounded queue to a pool of upload workers; a byte-budget
//! semaphore additionally caps the bytes held by sealed-but-not-uploaded
//! chunks, so a slow store backpressures the producer by both count and
//! volume.
//!
//! Failure semantics: the first error (producer or worker) is recorded,
//! everyone drains and stops, and the manifest is never written. Readers
//! treat the manifest as the completion signal, so a failed run leaves at
//! most unreferenced chunk objects behind. On success the manifest is
//! published last.

use crate::cursor::{ColumnMeta, RowCursor};
use crate::encode::{NdjsonEncoder, RowEncoder};
use crate::error::{QueryError, QueryResult};
use bytes::Bytes;
use quarry_core::manifest::{ChunkDescriptor, Manifest, ResultRef, WritePlan};
use quarry_core::request::RowEncoding;
use quarry_storage::{ObjectStore, PutOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument};

/// Tunables for one materialization run.
#[derive(Clone, Debug)]
pub struct ChunkWriteOptions {
    /// Seal a chunk once its encoded payload reaches this size.
    pub target_chunk_bytes: usize,
    /// Sealed chunks the queue may hold.
    pub max_inflight_chunks: usize,
    /// Bytes sealed-but-not-uploaded chunks may hold together.
    pub max_inflight_bytes: usize,
    /// Upload worker count.
    pub upload_workers: usize,
    /// Gzip chunk payloads.
    pub compress: bool,
    pub encoding: RowEncoding,
    /// Rows per Arrow record batch; ignored by the ndjson encoder.
    pub batch_rows: usize,
}

impl ChunkWriteOptions {
    pub fn validate(&self) -> QueryResult<()> {
        if self.target_chunk_bytes == 0
            || self.max_inflight_chunks == 0
            || self.max_inflight_bytes == 0
            || self.upload_workers == 0
            || self.batch_rows == 0
        {
            return Err(QueryError::InvalidOptions(
                "chunk writer sizes and worker counts must be > 0".to_string(),
            ));
        }
        if self.max_inflight_bytes < self.target_chunk_bytes {
            return Err(QueryError::InvalidOptions(format!(
                "max_inflight_bytes ({}) must be >= target_chunk_bytes ({})",
                self.max_inflight_bytes, self.target_chunk_bytes
            )));
        }
        Ok(())
    }

    fn encoder(&self) -> Box<dyn RowEncoder> {
        match self.encoding {
            RowEncoding::Ndjson => Box::new(NdjsonEncoder),
            RowEncoding::Arrow => Box::new(crate::arrow::ArrowChunkEncoder::new(self.batch_rows)),
        }
    }
}

/// A sealed chunk waiting for upload. Holds its byte-budget permit so the
/// budget is released when the chunk is uploaded or dropped on abort.
struct SealedChunk {
    part: u32,
    key: String,
    payload: Bytes,
    uncompressed_bytes: u64,
    _budget: OwnedSemaphorePermit,
}

enum UploadMsg {
    Chunk(SealedChunk),
    /// One per worker; tells it to exit after the queue drained.
    Shutdown,
}

fn record_error(slot: &Mutex<Option<QueryError>>, err: QueryError) {
    let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if guard.is_none() {
        *guard = Some(err);
    }
}

fn has_error(slot: &Mutex<Option<QueryError>>) -> bool {
    slot.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .is_some()
}

/// Materialize a cursor into chunk objects plus a manifest under `plan`.
///
/// Returns the published result pointer. On any failure no manifest is
/// written and the error is returned; the cancel flag aborts the run the
/// same way.
#[instrument(skip_all, fields(run_id = %plan.run_id))]
pub async fn write_result(
    store: Arc<dyn ObjectStore>,
    plan: WritePlan,
    mut cursor: Box<dyn RowCursor>,
    options: ChunkWriteOptions,
    cancel: Arc<AtomicBool>,
) -> QueryResult<ResultRef> {
    options.validate()?;

    let mut encoder = options.encoder();
    let content_type = encoder.content_type(options.compress).to_string();
    let extension = encoder.file_extension(options.compress).to_string();
    let columns = cursor.columns().to_vec();

    let (tx, rx) = flume::bounded::<UploadMsg>(options.max_inflight_chunks);
    let byte_budget = Arc::new(Semaphore::new(options.max_inflight_bytes));
    let first_error = Arc::new(Mutex::new(None::<QueryError>));
    let chunks = Arc::new(Mutex::new(Vec::<ChunkDescriptor>::new()));

    let mut workers = Vec::with_capacity(options.upload_workers);
    for worker_id in 0..options.upload_workers {
        let rx = rx.clone();
        let store = store.clone();
        let chunks = chunks.clone();
        let first_error = first_error.clone();
        let content_type = content_type.clone();

        workers.push(tokio::spawn(async move {
            while let Ok(message) = rx.recv_async().await {
                let chunk = match message {
                    UploadMsg::Shutdown => break,
                    UploadMsg::Chunk(chunk) => chunk,
                };
                // After a failure we keep draining so the producer never
                // blocks, but stop uploading. Dropping the chunk releases
                // its byte-budget permit.
                if has_error(&first_error) {
                    continue;
                }
                debug!(
                    worker_id,
                    part = chunk.part,
                    bytes = chunk.payload.len(),
                    "uploading chunk"
                );
                match store
                    .put(
                        &chunk.key,
                        chunk.payload.clone(),
                        PutOptions::content_type(content_type.clone()),
                    )
                    .await
                {
                    Ok(etag) => {
                        let descriptor = ChunkDescriptor {
                            part: chunk.part,
                            key: chunk.key,
                            bytes: chunk.payload.len() as u64,
                            uncompressed_bytes: chunk.uncompressed_bytes,
                            etag,
                        };
                        chunks
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .push(descriptor);
                    }
                    Err(e) => record_error(&first_error, e.into()),
                }
            }
        }));
    }

    let produced = produce(
        cursor.as_mut(),
        encoder.as_mut(),
        &columns,
        &plan,
        &options,
        &extension,
        &tx,
        &byte_budget,
        &cancel,
        &first_error,
    )
    .await;

    let total_rows = match produced {
        Ok(rows) => Some(rows),
        Err(e) => {
            record_error(&first_error, e);
            None
        }
    };

    for _ in 0..options.upload_workers {
        let _ = tx.send_async(UploadMsg::Shutdown).await;
    }
    drop(tx);

    for worker in workers {
        worker
            .await
            .map_err(|e| QueryError::Internal(format!("upload worker panicked: {e}")))?;
    }

    if let Some(err) = first_error
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
    {
        return Err(err);
    }
    let total_rows = total_rows
        .ok_or_else(|| QueryError::Internal("producer finished without a row count".to_string()))?;

    let mut chunk_list = std::mem::take(
        &mut *chunks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()),
    );
    chunk_list.sort_by_key(|c| c.part);

    let manifest = Manifest {
        run_id: plan.run_id.clone(),
        bucket: plan.bucket.clone(),
        prefix: plan.prefix.clone(),
        compressed: options.compress,
        total_rows,
        total_uncompressed_bytes: chunk_list.iter().map(|c| c.uncompressed_bytes).sum(),
        chunks: chunk_list,
        created_at: OffsetDateTime::now_utc(),
    };
    manifest.validate()?;

    // Publish the manifest last: its existence is the completion signal.
    let manifest_key = plan.manifest_key();
    store
        .put(
            &manifest_key,
            Bytes::from(manifest.to_json()?),
            PutOptions::content_type("application/json"),
        )
        .await?;

    info!(
        rows = total_rows,
        chunks = manifest.chunks.len(),
        manifest_key = %manifest_key,
        "result published"
    );

    Ok(ResultRef {
        bucket: plan.bucket,
        prefix: plan.prefix,
        run_id: plan.run_id,
        manifest_key,
        row_count: total_rows,
        chunk_count: manifest.chunks.len() as u32,
    })
}

#[allow(clippy::too_many_arguments)]
async fn produce(
    cursor: &mut dyn RowCursor,
    encoder: &mut dyn RowEncoder,
    columns: &[ColumnMeta],
    plan: &WritePlan,
    options: &ChunkWriteOptions,
    extension: &str,
    tx: &flume::Sender<UploadMsg>,
    byte_budget: &Arc<Semaphore>,
    cancel: &AtomicBool,
    first_error: &Mutex<Option<QueryError>>,
) -> QueryResult<u64> {
    let mut buf = Vec::with_capacity(options.target_chunk_bytes);
    encoder.begin_chunk(columns, &mut buf)?;

    let mut part = 0u32;
    let mut rows_in_chunk = 0u64;
    let mut total_rows = 0u64;

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(QueryError::Canceled);
        }
        // A worker already failed: stop reading, the run is lost anyway.
        if has_error(first_error) {
            return Ok(total_rows);
        }

        let Some(row) = cursor.next_row().await? else {
            break;
        };
        encoder.encode_row(columns, &row, &mut buf)?;
        rows_in_chunk += 1;
        total_rows += 1;

        if buf.len() >= options.target_chunk_bytes {
            part += 1;
            seal_chunk(
                encoder,
                columns,
                &mut buf,
                part,
                plan,
                options,
                extension,
                tx,
                byte_budget,
            )
            .await?;
            rows_in_chunk = 0;
        }
    }

    // Trailing partial chunk.
    if rows_in_chunk > 0 {
        part += 1;
        seal_chunk(
            encoder,
            columns,
            &mut buf,
            part,
            plan,
            options,
            extension,
            tx,
            byte_budget,
        )
        .await?;
    }

    Ok(total_rows)
}

#[allow(clippy::too_many_arguments)]
async fn seal_chunk(
    encoder: &mut dyn RowEncoder,
    columns: &[ColumnMeta],
    buf: &mut Vec<u8>,
    part: u32,
    plan: &WritePlan,
    options: &ChunkWriteOptions,
    extension: &str,
    tx: &flume::Sender<UploadMsg>,
    byte_budget: &Arc<Semaphore>,
) -> QueryResult<()> {
    encoder.finish_chunk(buf)?;
    let uncompressed_bytes = buf.len() as u64;

    let raw = std::mem::take(buf);
    let payload = if options.compress {
        Bytes::from(gzip(raw).await?)
    } else {
        Bytes::from(raw)
    };

    // Clamp to the budget so one oversized chunk still makes progress alone
    // instead of deadlocking the acquire.
    let wanted = payload.len().min(options.max_inflight_bytes) as u32;
    let permit = byte_budget
        .clone()
        .acquire_many_owned(wanted)
        .await
        .map_err(|_| QueryError::Internal("byte budget semaphore closed".to_string()))?;

    let chunk = SealedChunk {
        part,
        key: plan.chunk_key(part, extension),
        payload,
        uncompressed_bytes,
        _budget: permit,
    };
    tx.send_async(UploadMsg::Chunk(chunk))
        .await
        .map_err(|_| QueryError::Internal("upload queue closed".to_string()))?;

    // Start the next chunk in the drained buffer.
    buf.reserve(options.target_chunk_bytes);
    encoder.begin_chunk(columns, buf)?;
    Ok(())
}

async fn gzip(data: Vec<u8>) -> QueryResult<Vec<u8>> {
    use async_compression::tokio::write::GzipEncoder;
    use tokio::io::AsyncWriteExt;

    let mut encoder = GzipEncoder::new(Vec::with_capacity(data.len() / 2 + 64));
    encoder.write_all(&data).await?;
    encoder.shutdown().await?;
    Ok(encoder.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ChunkWriteOptions {
        ChunkWriteOptions {
            target_chunk_bytes: 1024,
            max_inflight_chunks: 4,
            max_inflight_bytes: 4096,
            upload_workers: 2,
            compress: false,
            encoding: RowEncoding::Ndjson,
            batch_rows: 64,
        }
    }

    #[test]
    fn test_validate_accepts_defaults() {
        options().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_small_byte_budget() {
        let mut opts = options();
        opts.max_inflight_bytes = 512;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut opts = options();
        opts.upload_workers = 0;
        assert!(opts.validate().is_err());
    }
}
