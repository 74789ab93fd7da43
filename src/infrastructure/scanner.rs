use crate::config::IngestConfig;
use crate::services::scanner::VirusScanner;
use std::sync::Arc;
use tracing::info;

pub async fn setup_scanner(config: &IngestConfig) -> Arc<dyn VirusScanner> {
    let scanner_service = crate::services::scanner::create_scanner(config);

    // Warm up scanner connection
    if config.enable_virus_scan {
        if scanner_service.health_check().await {
            info!("🦠 Virus scanner connected successfully");
        } else {
            tracing::warn!(
                "⚠️  Virus scanner unreachable! Uploads will fail the malware check until it recovers."
            );
        }
    } else {
        tracing::warn!("⚠️  Virus scanning disabled");
    }

    scanner_service.into()
}
