use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Server-side state of a chunked upload, kept in the key-value store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub file_id: String,
    pub owner_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub declared_size: u64,
    pub total_chunks: u32,
    pub received_chunk_indices: BTreeSet<u32>,
    /// Bytes buffered so far; never exceeds `declared_size`.
    #[serde(default)]
    pub received_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_complete(&self) -> bool {
        self.received_chunk_indices.len() as u32 == self.total_chunks
    }

    pub fn progress_percent(&self) -> f32 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.received_chunk_indices.len() as f32 * 100.0 / self.total_chunks as f32
    }
}

/// One chunk as delivered by the client.
#[derive(Debug, Clone)]
pub struct ChunkSubmission {
    pub owner_id: String,
    /// Client-chosen identifier grouping the chunks of one upload.
    pub file_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub declared_size: u64,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    /// More chunks are expected.
    Pending {
        received: u32,
        total: u32,
        progress: f32,
    },
    /// Every chunk arrived; the session has been removed.
    Assembled {
        session: UploadSession,
        buffer: Bytes,
    },
}
