//! Read interfaces consumed from the metadata stores
//!
//! The core never writes media or rule records. Stores only have to answer
//! lookups; a miss is reported as `StreamError::NotFound`.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::{Result, StreamError};
use crate::types::{MediaFile, Transcoding};

/// Media metadata lookup
pub trait MediaFileRepository: Send + Sync {
    fn get(&self, id: &str) -> Result<MediaFile>;
}

/// Transcoding rule lookup
pub trait TranscodingRepository: Send + Sync {
    fn find_by_format(&self, format: &str) -> Result<Transcoding>;
}

/// In-memory media store, keyed by id
#[derive(Debug, Default)]
pub struct MemoryMediaRepository {
    files: RwLock<HashMap<String, MediaFile>>,
}

impl MemoryMediaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of media files
    pub fn from_json(json: &str) -> Result<Self> {
        let files: Vec<MediaFile> = serde_json::from_str(json)
            .map_err(|e| StreamError::Config(format!("invalid media index: {}", e)))?;
        let repo = Self::new();
        for mf in files {
            repo.insert(mf);
        }
        Ok(repo)
    }

    pub fn insert(&self, mf: MediaFile) {
        self.files.write().insert(mf.id.clone(), mf);
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl MediaFileRepository for MemoryMediaRepository {
    fn get(&self, id: &str) -> Result<MediaFile> {
        self.files
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StreamError::NotFound(format!("media file {}", id)))
    }
}

/// In-memory rule store, keyed by target format
#[derive(Debug, Default)]
pub struct MemoryTranscodingRepository {
    rules: RwLock<HashMap<String, Transcoding>>,
}

impl MemoryTranscodingRepository {
    pub fn new(rules: impl IntoIterator<Item = Transcoding>) -> Self {
        let repo = Self::default();
        for rule in rules {
            repo.insert(rule);
        }
        repo
    }

    pub fn insert(&self, rule: Transcoding) {
        self.rules.write().insert(rule.target_format.clone(), rule);
    }
}

impl TranscodingRepository for MemoryTranscodingRepository {
    fn find_by_format(&self, format: &str) -> Result<Transcoding> {
        self.rules
            .read()
            .get(format)
            .cloned()
            .ok_or_else(|| StreamError::NotFound(format!("transcoding for format '{}'", format)))
    }
}
