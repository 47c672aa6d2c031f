//! Local filesystem blob store.
//!
//! Files land under `<root>/<sha256[0:3]>/<sha256>`. Concurrent writers to
//! the same address are tolerated since the bytes are identical.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::models::content::{ContentMetadata, ContentSpec};
use crate::storage::{BlobStore, ContentChunks};

/// Blob store keeping bytes on the local filesystem and metadata in
/// memory.
pub struct LocalBlobStore {
    storage_root: PathBuf,
    meta: DashMap<String, ContentMetadata>,
}

impl LocalBlobStore {
    /// Create a store rooted at the given directory.
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            meta: DashMap::new(),
        }
    }

    /// The path used to store content with the given sha256.
    pub fn file_path(&self, sha256: &str) -> PathBuf {
        self.storage_root.join(&sha256[0..3]).join(sha256)
    }

    async fn initialize_file_path(&self, sha256: &str) -> CoreResult<PathBuf> {
        let sub_dir = self.storage_root.join(&sha256[0..3]);
        tokio::fs::create_dir_all(&sub_dir).await?;
        Ok(sub_dir.join(sha256))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn store_content(&self, data: &[u8], spec: ContentSpec) -> CoreResult<ContentMetadata> {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let sha256 = hex::encode(hasher.finalize());

        let file_path = self.initialize_file_path(&sha256).await?;
        if tokio::fs::try_exists(&file_path).await? {
            log::warn!("{} already exists", file_path.display());
        }
        tokio::fs::write(&file_path, data).await?;

        // re-storing known content keeps its root pins
        let roots = self
            .meta
            .get(&sha256)
            .map(|existing| existing.roots.clone())
            .unwrap_or_default();

        let meta = ContentMetadata {
            sha256: sha256.clone(),
            name: spec.name,
            size: data.len() as u64,
            location: file_path.clone(),
            insert_date: Utc::now(),
            expiration_date: spec.expiration_date,
            custom: spec.custom,
            roots,
        };

        log::info!(
            "stored file content {} {} at {}",
            meta.name,
            sha256,
            file_path.display()
        );

        self.meta.insert(sha256, meta.clone());
        Ok(meta)
    }

    async fn save_file(&self, path: &Path, mut spec: ContentSpec) -> CoreResult<String> {
        if spec.name.is_empty() {
            spec.name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
        }

        let data = tokio::fs::read(path).await?;
        let meta = self.store_content(&data, spec).await?;
        Ok(meta.sha256)
    }

    async fn get_content_meta(&self, sha256: &str) -> CoreResult<Option<ContentMetadata>> {
        Ok(self.meta.get(sha256).map(|entry| entry.clone()))
    }

    async fn get_content_bytes(&self, sha256: &str) -> CoreResult<Option<Vec<u8>>> {
        if !self.meta.contains_key(sha256) {
            return Ok(None);
        }

        match tokio::fs::read(self.file_path(sha256)).await {
            Ok(data) => Ok(Some(data)),
            Err(error) => {
                log::debug!("unable to get content bytes for {}: {}", sha256, error);
                Ok(None)
            }
        }
    }

    async fn iter_content(
        &self,
        sha256: &str,
        buffer_size: usize,
    ) -> CoreResult<Option<ContentChunks>> {
        if !self.meta.contains_key(sha256) {
            return Ok(None);
        }

        match tokio::fs::File::open(self.file_path(sha256)).await {
            Ok(file) => Ok(Some(ContentChunks::new(file, buffer_size))),
            Err(error) => {
                log::warn!("unable to get content stream for {}: {}", sha256, error);
                Ok(None)
            }
        }
    }

    async fn load_file(&self, sha256: &str, dest: &Path) -> CoreResult<Option<ContentMetadata>> {
        let meta = match self.get_content_meta(sha256).await? {
            Some(meta) => meta,
            None => return Ok(None),
        };

        // a new link is the fastest way to copy the data
        if tokio::fs::hard_link(&meta.location, dest).await.is_err() {
            tokio::fs::copy(&meta.location, dest).await?;
        }

        Ok(Some(meta))
    }

    async fn delete_content(&self, sha256: &str) -> CoreResult<bool> {
        if self.meta.remove(sha256).is_none() {
            return Ok(false);
        }

        let file_path = self.file_path(sha256);
        if tokio::fs::try_exists(&file_path).await? {
            tokio::fs::remove_file(&file_path).await?;
        }

        Ok(true)
    }

    async fn expired_content(&self) -> CoreResult<Vec<ContentMetadata>> {
        let now = Utc::now();
        Ok(self
            .meta
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.clone())
            .collect())
    }

    async fn track_content_root(&self, sha256: &str, root_uuid: Uuid) -> CoreResult<()> {
        match self.meta.get_mut(sha256) {
            Some(mut entry) => {
                if !entry.roots.contains(&root_uuid) {
                    entry.roots.push(root_uuid);
                }
            }
            None => log::warn!("cannot track root {} for unknown content {}", root_uuid, sha256),
        }
        Ok(())
    }

    async fn clear_root_tracking(&self, root_uuid: Uuid) -> CoreResult<()> {
        for mut entry in self.meta.iter_mut() {
            entry.roots.retain(|root| *root != root_uuid);
        }
        Ok(())
    }

    async fn reset(&self) -> CoreResult<()> {
        let stored: Vec<String> = self.meta.iter().map(|entry| entry.key().clone()).collect();
        for sha256 in stored {
            self.delete_content(&sha256).await?;
        }
        Ok(())
    }
}
