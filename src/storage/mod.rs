//! Object-store abstraction.
//!
//! Provides a unified interface for the object stores this engine reads data
//! files and DDL from and writes manifests and column mappings to: S3, local
//! filesystem, and an in-memory store for tests.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use regex::Regex;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, S3ConfigSnafu, StorageError};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const FILE_URI: &str = r"^file://(?P<path>/.*)$";
const FILE_PATH: &str = r"^(?P<path>/.*)$";
const MEM_URL: &str = r"^mem://(?P<key>.*)$";

fn s3_matcher() -> &'static Regex {
    static MATCHER: OnceLock<Regex> = OnceLock::new();
    MATCHER.get_or_init(|| Regex::new(S3_URL).expect("valid regex"))
}

fn file_matchers() -> &'static [Regex; 2] {
    static MATCHERS: OnceLock<[Regex; 2]> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        [
            Regex::new(FILE_URI).expect("valid regex"),
            Regex::new(FILE_PATH).expect("valid regex"),
        ]
    })
}

/// One listed object, keyed relative to the provider root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object key relative to the provider's root.
    pub key: String,
    /// Last-modified time reported by the store.
    pub last_modified: DateTime<Utc>,
}

/// Storage provider rooted at a URL.
///
/// All paths passed to methods are relative to the root; [`Self::url_for`]
/// turns a relative path back into the canonical URL bulk-copy manifests need.
#[derive(Clone)]
pub struct StorageProvider {
    object_store: Arc<dyn ObjectStore>,
    root: Path,
    canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

impl StorageProvider {
    /// Create a provider for a URL with no extra options.
    pub fn for_url(url: &str) -> Result<Self, StorageError> {
        Self::for_url_with_options(url, HashMap::new())
    }

    /// Create a provider for a URL with storage options (credentials, region).
    pub fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        if let Some(caps) = s3_matcher().captures(url) {
            return Self::construct_s3(&caps, options);
        }
        if let Some(caps) = Regex::new(MEM_URL).expect("valid regex").captures(url) {
            let key = caps.name("key").map(|m| m.as_str()).unwrap_or("");
            return Ok(Self::in_memory_at(key));
        }
        for matcher in file_matchers() {
            if let Some(caps) = matcher.captures(url) {
                let path = caps.name("path").expect("path group").as_str();
                let store = object_store::local::LocalFileSystem::new_with_prefix(path)
                    .context(ObjectStoreSnafu)?;
                return Ok(Self {
                    object_store: Arc::new(store),
                    root: Path::default(),
                    canonical_url: format!("file://{path}"),
                });
            }
        }
        InvalidUrlSnafu { url }.fail()
    }

    /// Create a fresh in-memory provider (for tests and dry runs).
    pub fn in_memory() -> Self {
        Self::in_memory_at("")
    }

    fn in_memory_at(key: &str) -> Self {
        Self {
            object_store: Arc::new(InMemory::new()),
            root: Path::from(key),
            canonical_url: format!("mem://{key}"),
        }
    }

    fn construct_s3(
        caps: &regex::Captures,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let bucket = caps.name("bucket").expect("bucket group").as_str();
        let key = caps.name("key").map(|m| m.as_str()).unwrap_or("");

        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
        if std::env::var("AWS_REGION").is_err()
            && std::env::var("AWS_DEFAULT_REGION").is_err()
            && !options.contains_key("region")
        {
            builder = builder.with_region("us-east-1");
        }
        for (option, value) in &options {
            builder = builder.with_config(option.parse().context(S3ConfigSnafu)?, value.clone());
        }

        let canonical_url = if key.is_empty() {
            format!("s3://{bucket}")
        } else {
            format!("s3://{bucket}/{key}")
        };

        Ok(Self {
            object_store: Arc::new(builder.build().context(S3ConfigSnafu)?),
            root: Path::from(key),
            canonical_url,
        })
    }

    /// The canonical URL of this provider's root.
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// The canonical URL for a path relative to the root.
    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.canonical_url, path)
    }

    fn absolute(&self, path: &str) -> Path {
        if self.root.as_ref().is_empty() {
            Path::from(path)
        } else {
            Path::from(format!("{}/{}", self.root.as_ref(), path))
        }
    }

    fn relative(&self, location: &Path) -> String {
        let location = location.as_ref();
        match location.strip_prefix(self.root.as_ref()) {
            Some(stripped) => stripped.trim_start_matches('/').to_string(),
            None => location.to_string(),
        }
    }

    /// List all objects under a prefix relative to the root, sorted by key.
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<StoredObject>, StorageError> {
        let full_prefix = self.absolute(prefix);
        let mut stream = self.object_store.list(Some(&full_prefix));

        let mut objects = Vec::new();
        while let Some(result) = stream.next().await {
            let meta = result.context(ObjectStoreSnafu)?;
            objects.push(StoredObject {
                key: self.relative(&meta.location),
                last_modified: meta.last_modified,
            });
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    /// Read an object fully into memory.
    pub async fn get(&self, path: &str) -> Result<Bytes, StorageError> {
        let result = self
            .object_store
            .get(&self.absolute(path))
            .await
            .context(ObjectStoreSnafu)?;
        result.bytes().await.context(ObjectStoreSnafu)
    }

    /// Write an object, replacing any existing one.
    pub async fn put(&self, path: &str, bytes: Bytes) -> Result<(), StorageError> {
        self.object_store
            .put(&self.absolute(path), PutPayload::from(bytes))
            .await
            .context(ObjectStoreSnafu)?;
        Ok(())
    }

}
