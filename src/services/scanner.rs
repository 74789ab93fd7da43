use crate::config::IngestConfig;
use anyhow::{Result, anyhow};
use bytes::Bytes;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Result of a virus scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResult {
    /// File is clean (no threats detected)
    Clean,
    /// File is infected with malware
    Infected { threat_name: String },
    /// Scan could not be completed
    Error { reason: String },
}

/// Why a scan produced no usable answer. Callers treat both as a failed
/// check, never as clean.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("malware scan timed out after {0:?}")]
    Timeout(Duration),

    #[error("malware scanner unavailable: {0}")]
    Unavailable(String),
}

/// Trait for virus scanning implementations
#[async_trait::async_trait]
pub trait VirusScanner: Send + Sync {
    /// Scan file content for malware using a stream
    async fn scan(&self, reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanResult>;

    /// Check if the scanner is available/healthy
    async fn health_check(&self) -> bool;
}

/// Scans an in-memory buffer with a hard deadline. Scanner errors, error
/// verdicts and timeouts all come back as [`ScanError`].
pub async fn scan_buffer(
    scanner: &dyn VirusScanner,
    data: Bytes,
    timeout: Duration,
) -> Result<ScanResult, ScanError> {
    let reader: Pin<Box<dyn AsyncRead + Send>> = Box::pin(std::io::Cursor::new(data));
    match tokio::time::timeout(timeout, scanner.scan(reader)).await {
        Err(_) => Err(ScanError::Timeout(timeout)),
        Ok(Err(e)) => Err(ScanError::Unavailable(e.to_string())),
        Ok(Ok(ScanResult::Error { reason })) => Err(ScanError::Unavailable(reason)),
        Ok(Ok(result)) => Ok(result),
    }
}

/// ClamAV scanner using TCP socket (clamd)
///
/// Docker command to run ClamAV:
/// ```bash
/// docker run -d --name clamav -p 3310:3310 clamav/clamav:latest
/// ```
pub struct ClamAvScanner {
    host: String,
    port: u16,
}

impl ClamAvScanner {
    /// clamd's default StreamMaxLength is 25 MB; chunks stay well below it.
    const CHUNK_SIZE: usize = 1024 * 1024;

    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        TcpStream::connect(&addr)
            .await
            .map_err(|e| anyhow!("Failed to connect to ClamAV at {}: {}", addr, e))
    }
}

/// Interprets a clamd INSTREAM reply such as `stream: Eicar-Signature FOUND`.
pub fn parse_clamd_response(raw: &str) -> ScanResult {
    let response = raw.trim_end_matches('\0').trim();

    if response.ends_with("OK") {
        ScanResult::Clean
    } else if let Some(body) = response.strip_suffix("FOUND") {
        let threat = body
            .split_once(':')
            .map(|(_, name)| name.trim())
            .filter(|name| !name.is_empty())
            .unwrap_or("Unknown threat");
        ScanResult::Infected {
            threat_name: threat.to_string(),
        }
    } else if response.contains("ERROR") {
        ScanResult::Error {
            reason: response.to_string(),
        }
    } else {
        ScanResult::Error {
            reason: format!("Unexpected ClamAV response: {}", response),
        }
    }
}

#[async_trait::async_trait]
impl VirusScanner for ClamAvScanner {
    async fn scan(&self, mut reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanResult> {
        let mut stream = self.connect().await?;

        // Format: zINSTREAM\0 <length:u32 big-endian> <data> ... <0:u32>
        stream.write_all(b"zINSTREAM\0").await?;

        let mut buffer = vec![0u8; Self::CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            stream.write_all(&(n as u32).to_be_bytes()).await?;
            stream.write_all(&buffer[..n]).await?;
        }

        stream.write_all(&0u32.to_be_bytes()).await?;
        stream.flush().await?;

        // The caller bounds the whole scan with its own deadline.
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;

        let response = String::from_utf8_lossy(&response);
        tracing::debug!("ClamAV response: {}", response.trim());
        Ok(parse_clamd_response(&response))
    }

    async fn health_check(&self) -> bool {
        let Ok(mut stream) = self.connect().await else {
            return false;
        };
        if stream.write_all(b"zPING\0").await.is_err() || stream.flush().await.is_err() {
            return false;
        }

        let mut response = [0u8; 16];
        match stream.read(&mut response).await {
            Ok(n) => String::from_utf8_lossy(&response[..n]).contains("PONG"),
            Err(_) => false,
        }
    }
}

/// No-op scanner for development/testing
pub struct NoOpScanner;

#[async_trait::async_trait]
impl VirusScanner for NoOpScanner {
    async fn scan(&self, _reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanResult> {
        tracing::warn!("NoOpScanner: Skipping virus scan (development mode)");
        Ok(ScanResult::Clean)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Scanner that always returns infected (for testing)
#[cfg(test)]
pub struct AlwaysInfectedScanner;

#[cfg(test)]
#[async_trait::async_trait]
impl VirusScanner for AlwaysInfectedScanner {
    async fn scan(&self, _reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanResult> {
        Ok(ScanResult::Infected {
            threat_name: "Test.Virus.EICAR".to_string(),
        })
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Factory function to create appropriate scanner based on config
pub fn create_scanner(config: &IngestConfig) -> Box<dyn VirusScanner> {
    match config.virus_scanner_type.to_lowercase().as_str() {
        "clamav" => Box::new(ClamAvScanner::new(
            config.clamav_host.clone(),
            config.clamav_port,
        )),
        "noop" | "none" | "disabled" => Box::new(NoOpScanner),
        other => {
            tracing::warn!("Unknown scanner type '{}', using NoOpScanner", other);
            Box::new(NoOpScanner)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct HangingScanner;

    #[async_trait::async_trait]
    impl VirusScanner for HangingScanner {
        async fn scan(&self, _reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanResult> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ScanResult::Clean)
        }

        async fn health_check(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_parse_clamd_response() {
        assert_eq!(parse_clamd_response("stream: OK\0"), ScanResult::Clean);
        assert_eq!(
            parse_clamd_response("stream: Win.Test.EICAR_HDB-1 FOUND\0"),
            ScanResult::Infected {
                threat_name: "Win.Test.EICAR_HDB-1".to_string()
            }
        );
        assert!(matches!(
            parse_clamd_response("INSTREAM size limit exceeded. ERROR"),
            ScanResult::Error { .. }
        ));
        assert!(matches!(
            parse_clamd_response("garbage"),
            ScanResult::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_noop_scanner() {
        let result = scan_buffer(&NoOpScanner, Bytes::from_static(b"x"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, ScanResult::Clean);
    }

    #[tokio::test]
    async fn test_always_infected_scanner() {
        let result = scan_buffer(
            &AlwaysInfectedScanner,
            Bytes::from_static(b"x"),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(matches!(result, ScanResult::Infected { .. }));
    }

    #[tokio::test]
    async fn test_scan_timeout() {
        let err = scan_buffer(
            &HangingScanner,
            Bytes::from_static(b"x"),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert_eq!(err, ScanError::Timeout(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_create_scanner() {
        let config = IngestConfig::development();
        assert!(create_scanner(&config).health_check().await);
    }
}
