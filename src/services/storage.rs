use anyhow::{Result, anyhow};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use dashmap::DashMap;

/// Object storage for encrypted payloads. Only ciphertext ever reaches it.
#[async_trait]
pub trait StorageService: Send + Sync {
    async fn upload_file(&self, key: &str, data: Vec<u8>) -> Result<()>;
    async fn get_file(&self, key: &str) -> Result<Vec<u8>>;
    async fn delete_file(&self, key: &str) -> Result<()>;
    async fn file_exists(&self, key: &str) -> Result<bool>;
}

pub struct S3StorageService {
    client: Client,
    bucket: String,
}

impl S3StorageService {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl StorageService for S3StorageService {
    async fn upload_file(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await?;
        Ok(())
    }

    async fn get_file(&self, key: &str) -> Result<Vec<u8>> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        let data = object.body.collect().await?;
        Ok(data.into_bytes().to_vec())
    }

    async fn delete_file(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        Ok(())
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        let res = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match res {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(anyhow!(service_error))
                }
            }
        }
    }
}

/// Process-local storage for development and tests.
#[derive(Default)]
pub struct MemoryStorage {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Overwrites a stored object in place; used to simulate tampering.
    pub fn replace(&self, key: &str, data: Vec<u8>) -> bool {
        match self.objects.get_mut(key) {
            Some(mut entry) => {
                *entry = data;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl StorageService for MemoryStorage {
    async fn upload_file(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn get_file(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .get(key)
            .map(|v| v.clone())
            .ok_or_else(|| anyhow!("object '{}' not found", key))
    }

    async fn delete_file(&self, key: &str) -> Result<()> {
        self.objects.remove(key);
        Ok(())
    }

    async fn file_exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.contains_key(key))
    }
}
