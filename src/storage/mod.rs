//! Content-addressed blob storage.
//!
//! Content is addressed by its sha256. Roots pin blobs through reference
//! tracking; garbage collection only removes blobs whose expiration has
//! passed and whose referring-root set is empty.

pub mod local;

use async_trait::async_trait;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::models::content::{ContentMetadata, ContentSpec};

/// Lazy reader yielding stored content in fixed-size chunks.
pub struct ContentChunks {
    file: File,
    buffer_size: usize,
}

impl ContentChunks {
    pub(crate) fn new(file: File, buffer_size: usize) -> Self {
        Self { file, buffer_size }
    }

    /// Read the next chunk. Chunks are `buffer_size` bytes except the last.
    /// Returns `None` at end of content.
    pub async fn next_chunk(&mut self) -> CoreResult<Option<Vec<u8>>> {
        let mut buffer = vec![0u8; self.buffer_size];
        let mut filled = 0;

        while filled < self.buffer_size {
            let count = self.file.read(&mut buffer[filled..]).await?;
            if count == 0 {
                break;
            }
            filled += count;
        }

        if filled == 0 {
            return Ok(None);
        }

        buffer.truncate(filled);
        Ok(Some(buffer))
    }
}

/// Contract for content-addressed blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store content, returning its metadata. Storing the same bytes twice
    /// is tolerated; the content address is identical.
    async fn store_content(&self, data: &[u8], spec: ContentSpec) -> CoreResult<ContentMetadata>;

    /// Store a file from the local filesystem, returning its sha256.
    async fn save_file(&self, path: &Path, spec: ContentSpec) -> CoreResult<String>;

    /// Fetch content metadata.
    async fn get_content_meta(&self, sha256: &str) -> CoreResult<Option<ContentMetadata>>;

    /// Fetch content bytes. Absent when the content is unknown or its
    /// backing file is unreadable.
    async fn get_content_bytes(&self, sha256: &str) -> CoreResult<Option<Vec<u8>>>;

    /// Open a lazy chunk reader over stored content.
    async fn iter_content(
        &self,
        sha256: &str,
        buffer_size: usize,
    ) -> CoreResult<Option<ContentChunks>>;

    /// Materialize stored content at `dest`, preferring a hardlink and
    /// falling back to a copy. Returns the metadata, absent when unknown.
    async fn load_file(&self, sha256: &str, dest: &Path) -> CoreResult<Option<ContentMetadata>>;

    /// Delete content and its backing file. Returns false when unknown.
    async fn delete_content(&self, sha256: &str) -> CoreResult<bool>;

    /// Every blob whose expiration has passed with no referring roots.
    async fn expired_content(&self) -> CoreResult<Vec<ContentMetadata>>;

    /// Pin a blob to a root.
    async fn track_content_root(&self, sha256: &str, root_uuid: Uuid) -> CoreResult<()>;

    /// Remove every pin held by the given root.
    async fn clear_root_tracking(&self, root_uuid: Uuid) -> CoreResult<()>;

    /// Remove every stored blob and its backing bytes.
    async fn reset(&self) -> CoreResult<()>;
}
