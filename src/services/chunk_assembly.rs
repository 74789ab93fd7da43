use crate::models::{ChunkOutcome, ChunkSubmission, UploadSession};
use crate::services::kv_store::KeyValueStore;
use crate::utils::keyed_mutex::KeyedMutex;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("upload session expired")]
    SessionExpired,

    #[error("chunk {0} is missing from the upload session")]
    MissingChunk(u32),

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("assembled size {actual} does not match declared size {declared}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("session store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct ChunkLimits {
    pub max_file_size: u64,
    pub max_chunk_size: u64,
    pub session_ttl: Duration,
}

/// Collects out-of-order chunks per (owner, file id) and hands back the
/// assembled buffer once every index has arrived.
pub struct ChunkAssemblyManager {
    store: Arc<dyn KeyValueStore>,
    locks: KeyedMutex,
    limits: ChunkLimits,
}

fn session_key(owner_id: &str, file_id: &str) -> String {
    format!("upload:{}:{}", owner_id, file_id)
}

fn chunk_key(session_key: &str, index: u32) -> String {
    format!("{}:chunk:{}", session_key, index)
}

impl ChunkAssemblyManager {
    pub fn new(store: Arc<dyn KeyValueStore>, limits: ChunkLimits) -> Self {
        Self {
            store,
            locks: KeyedMutex::new(),
            limits,
        }
    }

    pub fn limits(&self) -> &ChunkLimits {
        &self.limits
    }

    /// Entries outlive the session deadline so an expired session is reported
    /// as expired rather than silently restarted.
    fn storage_ttl(&self) -> Duration {
        self.limits.session_ttl * 2
    }

    fn check_limits(&self, sub: &ChunkSubmission) -> Result<(), ChunkError> {
        if sub.declared_size > self.limits.max_file_size {
            return Err(ChunkError::PayloadTooLarge(format!(
                "declared size {} exceeds maximum {}",
                sub.declared_size, self.limits.max_file_size
            )));
        }
        if sub.payload.len() as u64 > self.limits.max_chunk_size {
            return Err(ChunkError::PayloadTooLarge(format!(
                "chunk of {} bytes exceeds maximum {}",
                sub.payload.len(),
                self.limits.max_chunk_size
            )));
        }
        if sub.file_id.trim().is_empty() {
            return Err(ChunkError::InvalidChunk("missing file id".to_string()));
        }
        if sub.total_chunks == 0 {
            return Err(ChunkError::InvalidChunk(
                "total chunk count must be positive".to_string(),
            ));
        }
        // Every chunk but an empty file's single one carries at least a byte,
        // and together they must be able to hold the declared size.
        if u64::from(sub.total_chunks) > sub.declared_size.max(1) {
            return Err(ChunkError::InvalidChunk(format!(
                "{} chunks cannot make up {} bytes",
                sub.total_chunks, sub.declared_size
            )));
        }
        let capacity = u64::from(sub.total_chunks).saturating_mul(self.limits.max_chunk_size);
        if capacity < sub.declared_size {
            return Err(ChunkError::InvalidChunk(format!(
                "{} chunks of at most {} bytes cannot hold {} bytes",
                sub.total_chunks, self.limits.max_chunk_size, sub.declared_size
            )));
        }
        if sub.payload.is_empty() && sub.declared_size > 0 {
            return Err(ChunkError::InvalidChunk("empty chunk".to_string()));
        }
        if sub.chunk_index >= sub.total_chunks {
            return Err(ChunkError::InvalidChunk(format!(
                "chunk index {} out of range for {} chunks",
                sub.chunk_index, sub.total_chunks
            )));
        }
        Ok(())
    }

    async fn load_session(&self, key: &str) -> Result<Option<UploadSession>, ChunkError> {
        match self.store.get(key).await? {
            Some(raw) => {
                let session = serde_json::from_slice(&raw)
                    .map_err(|e| ChunkError::Store(anyhow::anyhow!("corrupt session: {}", e)))?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn save_session(&self, key: &str, session: &UploadSession) -> Result<(), ChunkError> {
        let raw = serde_json::to_vec(session)
            .map_err(|e| ChunkError::Store(anyhow::anyhow!("encode session: {}", e)))?;
        self.store
            .set(key, Bytes::from(raw), self.storage_ttl())
            .await?;
        Ok(())
    }

    async fn discard(&self, key: &str, indices: &BTreeSet<u32>) -> Result<(), ChunkError> {
        for index in indices {
            self.store.delete(&chunk_key(key, *index)).await?;
        }
        self.store.delete(key).await?;
        Ok(())
    }

    /// Records one chunk. Re-sending an index replaces the earlier payload.
    #[tracing::instrument(skip(self, sub), fields(owner = %sub.owner_id, file_id = %sub.file_id, index = sub.chunk_index))]
    pub async fn submit_chunk(&self, sub: ChunkSubmission) -> Result<ChunkOutcome, ChunkError> {
        self.check_limits(&sub)?;

        let key = session_key(&sub.owner_id, &sub.file_id);
        let _guard = self.locks.lock(&key).await;
        let now = Utc::now();

        let mut session = match self.load_session(&key).await? {
            Some(existing) => {
                if existing.is_expired(now) {
                    warn!("Upload session expired, discarding received chunks");
                    self.discard(&key, &existing.received_chunk_indices).await?;
                    return Err(ChunkError::SessionExpired);
                }
                if existing.total_chunks != sub.total_chunks
                    || existing.declared_size != sub.declared_size
                {
                    return Err(ChunkError::InvalidChunk(format!(
                        "chunk metadata disagrees with session ({} chunks, {} bytes)",
                        existing.total_chunks, existing.declared_size
                    )));
                }
                existing
            }
            None => {
                debug!(total = sub.total_chunks, "Opening upload session");
                UploadSession {
                    file_id: sub.file_id.clone(),
                    owner_id: sub.owner_id.clone(),
                    file_name: sub.file_name.clone(),
                    mime_type: sub.mime_type.clone(),
                    declared_size: sub.declared_size,
                    total_chunks: sub.total_chunks,
                    received_chunk_indices: BTreeSet::new(),
                    received_bytes: 0,
                    created_at: now,
                    expires_at: now
                        + chrono::Duration::from_std(self.limits.session_ttl)
                            .unwrap_or_else(|_| chrono::Duration::hours(1)),
                }
            }
        };

        let chunk_bytes = sub.payload.len() as u64;
        let slot = chunk_key(&key, sub.chunk_index);
        let replaced = if session.received_chunk_indices.contains(&sub.chunk_index) {
            self.store
                .get(&slot)
                .await?
                .map_or(0, |old| old.len() as u64)
        } else {
            0
        };
        let buffered = session.received_bytes.saturating_sub(replaced) + chunk_bytes;
        if buffered > session.declared_size {
            warn!(
                buffered,
                declared = session.declared_size,
                "Chunk would overflow the declared size"
            );
            return Err(ChunkError::PayloadTooLarge(format!(
                "received {} bytes for a {} byte upload",
                buffered, session.declared_size
            )));
        }

        self.store
            .set(&slot, sub.payload, self.storage_ttl())
            .await?;
        session.received_chunk_indices.insert(sub.chunk_index);
        session.received_bytes = buffered;

        if !session.is_complete() {
            self.save_session(&key, &session).await?;
            debug!(
                received = session.received_chunk_indices.len(),
                bytes = chunk_bytes,
                "Chunk stored"
            );
            return Ok(ChunkOutcome::Pending {
                received: session.received_chunk_indices.len() as u32,
                total: session.total_chunks,
                progress: session.progress_percent(),
            });
        }

        let buffer = self.assemble(&key, &session).await;
        // The session is spent whether or not assembly succeeded.
        self.discard(&key, &session.received_chunk_indices).await?;
        let buffer = buffer?;

        info!(
            size = buffer.len(),
            chunks = session.total_chunks,
            "Upload assembled"
        );
        Ok(ChunkOutcome::Assembled { session, buffer })
    }

    async fn assemble(&self, key: &str, session: &UploadSession) -> Result<Bytes, ChunkError> {
        let mut buffer = BytesMut::with_capacity(session.declared_size as usize);
        for index in 0..session.total_chunks {
            let chunk = self
                .store
                .get(&chunk_key(key, index))
                .await?
                .ok_or(ChunkError::MissingChunk(index))?;
            buffer.extend_from_slice(&chunk);
        }

        let actual = buffer.len() as u64;
        if actual != session.declared_size {
            return Err(ChunkError::SizeMismatch {
                declared: session.declared_size,
                actual,
            });
        }
        Ok(buffer.freeze())
    }

    /// Drops a session and its chunks. Returns false when none existed.
    pub async fn abort(&self, owner_id: &str, file_id: &str) -> Result<bool, ChunkError> {
        let key = session_key(owner_id, file_id);
        let _guard = self.locks.lock(&key).await;
        match self.load_session(&key).await? {
            Some(session) => {
                self.discard(&key, &session.received_chunk_indices).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Current state of an in-flight upload.
    pub async fn session(
        &self,
        owner_id: &str,
        file_id: &str,
    ) -> Result<Option<UploadSession>, ChunkError> {
        self.load_session(&session_key(owner_id, file_id)).await
    }

    /// Releases lock entries for sessions nobody is touching.
    pub fn cleanup_locks(&self) -> usize {
        self.locks.cleanup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::kv_store::MemoryKvStore;

    fn manager(ttl: Duration) -> ChunkAssemblyManager {
        ChunkAssemblyManager::new(
            Arc::new(MemoryKvStore::new()),
            ChunkLimits {
                max_file_size: 1024,
                max_chunk_size: 256,
                session_ttl: ttl,
            },
        )
    }

    fn chunk(index: u32, total: u32, size: u64, data: &'static [u8]) -> ChunkSubmission {
        ChunkSubmission {
            owner_id: "alice".into(),
            file_id: "f1".into(),
            file_name: "book.xlsx".into(),
            mime_type: "application/octet-stream".into(),
            declared_size: size,
            chunk_index: index,
            total_chunks: total,
            payload: Bytes::from_static(data),
        }
    }

    #[tokio::test]
    async fn duplicate_chunk_overwrites() {
        let m = manager(Duration::from_secs(60));
        m.submit_chunk(chunk(1, 2, 4, b"zz")).await.unwrap();
        m.submit_chunk(chunk(1, 2, 4, b"cd")).await.unwrap();
        let session = m.session("alice", "f1").await.unwrap().unwrap();
        assert_eq!(session.received_chunk_indices.len(), 1);

        match m.submit_chunk(chunk(0, 2, 4, b"ab")).await.unwrap() {
            ChunkOutcome::Assembled { buffer, .. } => assert_eq!(&buffer[..], b"abcd"),
            other => panic!("expected assembly, got {:?}", other),
        }
        assert!(m.session("alice", "f1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn size_mismatch_is_reported() {
        let m = manager(Duration::from_secs(60));
        m.submit_chunk(chunk(0, 2, 10, b"ab")).await.unwrap();
        let err = m.submit_chunk(chunk(1, 2, 10, b"cd")).await.unwrap_err();
        assert!(matches!(
            err,
            ChunkError::SizeMismatch {
                declared: 10,
                actual: 4
            }
        ));
    }

    #[tokio::test]
    async fn rejects_out_of_range_index() {
        let m = manager(Duration::from_secs(60));
        let err = m.submit_chunk(chunk(3, 3, 6, b"ab")).await.unwrap_err();
        assert!(matches!(err, ChunkError::InvalidChunk(_)));
    }

    #[tokio::test]
    async fn rejects_oversized_declared_file() {
        let m = manager(Duration::from_secs(60));
        let err = m.submit_chunk(chunk(0, 2, 4096, b"ab")).await.unwrap_err();
        assert!(matches!(err, ChunkError::PayloadTooLarge(_)));
    }

    #[tokio::test]
    async fn expired_session_is_not_resumed() {
        let m = manager(Duration::from_millis(40));
        m.submit_chunk(chunk(0, 2, 4, b"ab")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let err = m.submit_chunk(chunk(1, 2, 4, b"cd")).await.unwrap_err();
        assert!(matches!(err, ChunkError::SessionExpired));
        // The expired session was cleared, so the next chunk starts fresh.
        assert!(m.session("alice", "f1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn abort_discards_session() {
        let m = manager(Duration::from_secs(60));
        m.submit_chunk(chunk(0, 3, 6, b"ab")).await.unwrap();
        assert!(m.abort("alice", "f1").await.unwrap());
        assert!(!m.abort("alice", "f1").await.unwrap());
    }

    #[tokio::test]
    async fn chunk_count_is_bounded_by_declared_size() {
        let m = manager(Duration::from_secs(60));
        let err = m.submit_chunk(chunk(0, 100_000, 1024, b"ab")).await.unwrap_err();
        assert!(matches!(err, ChunkError::InvalidChunk(_)));

        // Two chunks of at most 256 bytes cannot carry 1024.
        let err = m.submit_chunk(chunk(0, 2, 1024, b"ab")).await.unwrap_err();
        assert!(matches!(err, ChunkError::InvalidChunk(_)));
        assert!(m.session("alice", "f1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn buffered_bytes_never_exceed_declared_size() {
        let m = manager(Duration::from_secs(60));
        m.submit_chunk(chunk(0, 3, 5, b"ab")).await.unwrap();
        m.submit_chunk(chunk(1, 3, 5, b"cd")).await.unwrap();

        let err = m.submit_chunk(chunk(2, 3, 5, b"efg")).await.unwrap_err();
        assert!(matches!(err, ChunkError::PayloadTooLarge(_)));
        let session = m.session("alice", "f1").await.unwrap().unwrap();
        assert_eq!(session.received_bytes, 4);
        assert_eq!(session.received_chunk_indices.len(), 2);

        // A re-sent index replaces its earlier bytes rather than adding to them.
        m.submit_chunk(chunk(1, 3, 5, b"c")).await.unwrap();
        assert_eq!(
            m.session("alice", "f1").await.unwrap().unwrap().received_bytes,
            3
        );
        match m.submit_chunk(chunk(2, 3, 5, b"de")).await.unwrap() {
            ChunkOutcome::Assembled { buffer, .. } => assert_eq!(&buffer[..], b"abcde"),
            other => panic!("expected assembly, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_chunks_are_rejected() {
        let m = manager(Duration::from_secs(60));
        let err = m.submit_chunk(chunk(0, 2, 4, b"")).await.unwrap_err();
        assert!(matches!(err, ChunkError::InvalidChunk(_)));
    }
}
