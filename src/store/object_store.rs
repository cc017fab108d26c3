// Blob-store contract plus the in-process implementation used for
// development and tests. Production deployments plug an S3-compatible
// backend in behind the same trait.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Duration;

use crate::error::{ApiError, ApiResult};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, data: Vec<u8>, object_name: &str) -> ApiResult<()>;
    async fn download(&self, object_name: &str) -> ApiResult<Vec<u8>>;
    async fn exists(&self, object_name: &str) -> ApiResult<bool>;
    async fn delete(&self, object_name: &str) -> ApiResult<()>;
    async fn object_size_bytes(&self, object_name: &str) -> ApiResult<i64>;
    /// Returns false when the object is gone (the reuse path then
    /// falls back to a fresh build).
    async fn update_tag(&self, object_name: &str, key: &str, value: &str) -> ApiResult<bool>;
    async fn presigned_download_url(
        &self,
        object_name: &str,
        expires_in: Duration,
    ) -> ApiResult<String>;
    /// Presigned URLs only work against AWS-like backends.
    fn is_aws_like(&self) -> bool;
}

struct StoredObject {
    data: Vec<u8>,
    tags: HashMap<String, String>,
}

/// In-memory object store. `aws_like` controls whether presigned URLs
/// are advertised.
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, StoredObject>>,
    aws_like: bool,
}

impl InMemoryObjectStore {
    pub fn new(aws_like: bool) -> Arc<Self> {
        Arc::new(InMemoryObjectStore {
            objects: RwLock::new(HashMap::new()),
            aws_like,
        })
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn upload(&self, data: Vec<u8>, object_name: &str) -> ApiResult<()> {
        let mut objects = self.objects.write().unwrap();
        objects.insert(
            object_name.to_string(),
            StoredObject {
                data,
                tags: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn download(&self, object_name: &str) -> ApiResult<Vec<u8>> {
        let objects = self.objects.read().unwrap();
        objects
            .get(object_name)
            .map(|o| o.data.clone())
            .ok_or_else(|| ApiError::not_found("object", object_name))
    }

    async fn exists(&self, object_name: &str) -> ApiResult<bool> {
        let objects = self.objects.read().unwrap();
        Ok(objects.contains_key(object_name))
    }

    async fn delete(&self, object_name: &str) -> ApiResult<()> {
        let mut objects = self.objects.write().unwrap();
        objects.remove(object_name);
        Ok(())
    }

    async fn object_size_bytes(&self, object_name: &str) -> ApiResult<i64> {
        let objects = self.objects.read().unwrap();
        objects
            .get(object_name)
            .map(|o| o.data.len() as i64)
            .ok_or_else(|| ApiError::not_found("object", object_name))
    }

    async fn update_tag(&self, object_name: &str, key: &str, value: &str) -> ApiResult<bool> {
        let mut objects = self.objects.write().unwrap();
        match objects.get_mut(object_name) {
            Some(o) => {
                o.tags.insert(key.to_string(), value.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn presigned_download_url(
        &self,
        object_name: &str,
        expires_in: Duration,
    ) -> ApiResult<String> {
        if !self.is_aws_like() {
            return Err(ApiError::BadInput(
                "Failed to generate presigned URL: invalid backend".to_string(),
            ));
        }
        let objects = self.objects.read().unwrap();
        if !objects.contains_key(object_name) {
            return Err(ApiError::not_found("object", object_name));
        }
        Ok(format!(
            "https://objects.local/{}?expires={}s",
            object_name,
            expires_in.num_seconds()
        ))
    }

    fn is_aws_like(&self) -> bool {
        self.aws_like
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tag_update_reports_missing_objects() {
        let store = InMemoryObjectStore::new(true);
        assert!(!store.update_tag("missing", "k", "v").await.unwrap());
        store.upload(b"iso".to_vec(), "img").await.unwrap();
        assert!(store.update_tag("img", "k", "v").await.unwrap());
    }

    #[tokio::test]
    async fn presign_requires_aws_like_backend() {
        let plain = InMemoryObjectStore::new(false);
        plain.upload(b"x".to_vec(), "obj").await.unwrap();
        assert!(plain
            .presigned_download_url("obj", Duration::minutes(10))
            .await
            .is_err());

        let aws = InMemoryObjectStore::new(true);
        aws.upload(b"x".to_vec(), "obj").await.unwrap();
        let url = aws
            .presigned_download_url("obj", Duration::minutes(10))
            .await
            .unwrap();
        assert!(url.contains("obj"));
    }
}
