use crate::services::chunk_assembly::ChunkAssemblyManager;
use crate::services::job_queue::JobQueue;
use crate::services::kv_store::KeyValueStore;
use crate::services::metadata_store::MetadataStore;
use crate::services::storage::StorageService;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

/// Counts from one maintenance pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired_entries: usize,
    pub idle_locks: usize,
    pub purged_files: usize,
}

pub struct BackgroundWorker {
    kv: Arc<dyn KeyValueStore>,
    chunks: Arc<ChunkAssemblyManager>,
    jobs: JobQueue,
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn StorageService>,
    interval: Duration,
    retention: Duration,
    shutdown: watch::Receiver<bool>,
}

impl BackgroundWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        chunks: Arc<ChunkAssemblyManager>,
        jobs: JobQueue,
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageService>,
        interval: Duration,
        retention: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            kv,
            chunks,
            jobs,
            metadata,
            storage,
            interval,
            retention,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("🚀 Background worker started");

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        tracing::info!("🛑 Background worker shutting down");
                        break;
                    }
                }
                _ = sleep(self.interval) => {
                    self.perform_cleanup().await;
                }
            }
        }
    }

    pub async fn perform_cleanup(&self) -> CleanupReport {
        tracing::debug!("🧹 Running background cleanup tasks...");
        let mut report = CleanupReport::default();

        // 1. Expired chunk sessions and cached workbooks
        match self.kv.purge_expired().await {
            Ok(n) => report.expired_entries = n,
            Err(e) => tracing::error!("Failed to purge expired entries: {:#}", e),
        }

        // 2. Locks nobody holds any more
        report.idle_locks = self.chunks.cleanup_locks() + self.jobs.cleanup_locks();

        // 3. Ciphertext of files deleted longer ago than the retention window
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::days(7));
        match self.metadata.deleted_files_before(cutoff).await {
            Ok(files) => {
                for file in files {
                    if let Err(e) = self.storage.delete_file(&file.storage_key).await {
                        tracing::error!("Failed to remove ciphertext of {}: {:#}", file.id, e);
                        continue;
                    }
                    match self.metadata.purge_file(file.id).await {
                        Ok(()) => report.purged_files += 1,
                        Err(e) => tracing::error!("Failed to purge file {}: {:#}", file.id, e),
                    }
                }
            }
            Err(e) => tracing::error!("Failed to list deleted files: {:#}", e),
        }

        if report != CleanupReport::default() {
            tracing::info!(
                expired = report.expired_entries,
                locks = report.idle_locks,
                purged = report.purged_files,
                "✅ Background cleanup completed"
            );
        }
        report
    }
}
