mod common;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use common::*;
use sheet_ingest::models::{
    EncryptionMetadata, JobState, JobSummary, ProcessingJob, ProcessingStatus, SecureFileRecord,
    ValidationVerdict,
};
use sheet_ingest::services::chunk_assembly::{ChunkAssemblyManager, ChunkLimits};
use sheet_ingest::services::job_queue::{
    JobCompletion, JobContext, JobFailure, JobHandler, JobQueue, JobQueueConfig,
};
use sheet_ingest::services::kv_store::{KeyValueStore, MemoryKvStore};
use sheet_ingest::services::metadata_store::{MetadataStore, SeaOrmMetadataStore};
use sheet_ingest::services::storage::{MemoryStorage, StorageService};
use sheet_ingest::services::worker::BackgroundWorker;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

struct Immediate;

#[async_trait]
impl JobHandler for Immediate {
    async fn run(&self, _job: &ProcessingJob, ctx: JobContext) -> Result<JobCompletion, JobFailure> {
        ctx.progress.report(50.0);
        Ok(JobCompletion {
            summary: JobSummary::default(),
            finalize: None,
        })
    }
}

fn start_queue(
    metadata: Arc<dyn MetadataStore>,
    shutdown: watch::Receiver<bool>,
) -> JobQueue {
    JobQueue::start(
        metadata,
        Arc::new(Immediate),
        JobQueueConfig {
            concurrency: 2,
            max_attempts: 1,
            retry_base_delay: Duration::from_millis(10),
            stall_threshold: Duration::from_secs(60),
            stall_check_interval: Duration::from_secs(1),
        },
        shutdown,
    )
}

fn record(owner: &str) -> SecureFileRecord {
    let id = Uuid::new_v4();
    let now = Utc::now();
    SecureFileRecord {
        id,
        owner_id: owner.to_string(),
        original_name: "book.xlsx".to_string(),
        sanitized_name: "book.xlsx".to_string(),
        size_bytes: 4,
        content_hash: "00".repeat(32),
        mime_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            .to_string(),
        storage_key: format!("files/{}", id),
        encryption: EncryptionMetadata {
            key_id: "test".to_string(),
            iv: "00".repeat(16),
            auth_tag: "00".repeat(16),
        },
        verdict: ValidationVerdict::aggregate(Vec::new(), "00".repeat(32)),
        processing_status: ProcessingStatus::Pending,
        access_count: 0,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

#[tokio::test]
async fn test_cleanup_purges_expired_entries_and_old_deleted_files() {
    let db = setup_test_db().await;
    let metadata: Arc<dyn MetadataStore> = Arc::new(SeaOrmMetadataStore::new(db));
    let storage: Arc<dyn StorageService> = Arc::new(MemoryStorage::new());
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
    let chunks = Arc::new(ChunkAssemblyManager::new(
        kv.clone(),
        ChunkLimits {
            max_file_size: 1024,
            max_chunk_size: 1024,
            session_ttl: Duration::from_secs(60),
        },
    ));

    let old = record("alice");
    let recent = record("alice");
    let live = record("alice");
    for file in [&old, &recent, &live] {
        metadata.insert_file(file).await.unwrap();
        storage
            .upload_file(&file.storage_key, b"ciphertext".to_vec())
            .await
            .unwrap();
    }
    let ten_days_ago = Utc::now() - chrono::Duration::days(10);
    assert!(metadata.soft_delete_file(old.id, ten_days_ago).await.unwrap());
    assert!(metadata.soft_delete_file(recent.id, Utc::now()).await.unwrap());

    kv.set("stale", Bytes::from_static(b"x"), Duration::from_millis(1))
        .await
        .unwrap();
    kv.set("fresh", Bytes::from_static(b"y"), Duration::from_secs(60))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (_tx, rx) = watch::channel(false);
    let queue = start_queue(metadata.clone(), rx.clone());
    let worker = BackgroundWorker::new(
        kv.clone(),
        chunks,
        queue,
        metadata.clone(),
        storage.clone(),
        Duration::from_secs(3600),
        Duration::from_secs(7 * 24 * 3600),
        rx,
    );

    let report = worker.perform_cleanup().await;
    assert_eq!(report.expired_entries, 1);
    assert_eq!(report.purged_files, 1);

    assert!(metadata.get_file(old.id).await.unwrap().is_none());
    assert!(!storage.file_exists(&old.storage_key).await.unwrap());
    assert!(storage.file_exists(&recent.storage_key).await.unwrap());
    assert!(storage.file_exists(&live.storage_key).await.unwrap());
    assert!(kv.get("fresh").await.unwrap().is_some());

    // Nothing left to do on a second pass.
    let again = worker.perform_cleanup().await;
    assert_eq!(again.expired_entries, 0);
    assert_eq!(again.purged_files, 0);
}

#[tokio::test]
async fn test_worker_stops_on_shutdown() {
    let db = setup_test_db().await;
    let metadata: Arc<dyn MetadataStore> = Arc::new(SeaOrmMetadataStore::new(db));
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
    let chunks = Arc::new(ChunkAssemblyManager::new(
        kv.clone(),
        ChunkLimits {
            max_file_size: 1024,
            max_chunk_size: 1024,
            session_ttl: Duration::from_secs(60),
        },
    ));
    let (tx, rx) = watch::channel(false);
    let queue = start_queue(metadata.clone(), rx.clone());
    let worker = BackgroundWorker::new(
        kv,
        chunks,
        queue,
        metadata,
        Arc::new(MemoryStorage::new()),
        Duration::from_millis(10),
        Duration::from_secs(60),
        rx,
    );

    let handle = tokio::spawn(worker.run());
    tokio::time::sleep(Duration::from_millis(30)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_cleanup_releases_locks_of_finished_jobs() {
    let db = setup_test_db().await;
    let metadata: Arc<dyn MetadataStore> = Arc::new(SeaOrmMetadataStore::new(db));
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
    let chunks = Arc::new(ChunkAssemblyManager::new(
        kv.clone(),
        ChunkLimits {
            max_file_size: 1024,
            max_chunk_size: 1024,
            session_ttl: Duration::from_secs(60),
        },
    ));
    let (_tx, rx) = watch::channel(false);
    let queue = start_queue(metadata.clone(), rx.clone());

    for _ in 0..5 {
        let file = record("alice");
        metadata.insert_file(&file).await.unwrap();
        let job = queue.submit(file.id, "alice").await.unwrap();
        let job = wait_for_job(&queue, job.id, "alice").await;
        assert_eq!(job.state, JobState::Completed);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.lock_count(), 5);

    let worker = BackgroundWorker::new(
        kv,
        chunks,
        queue.clone(),
        metadata,
        Arc::new(MemoryStorage::new()),
        Duration::from_secs(3600),
        Duration::from_secs(60),
        rx,
    );
    let report = worker.perform_cleanup().await;
    assert_eq!(report.idle_locks, 5);
    assert_eq!(queue.lock_count(), 0);
}
