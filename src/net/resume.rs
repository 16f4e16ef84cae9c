//! Last-acknowledged offsets of interrupted downloads.
//!
//! Entries live for the lifetime of the transfer manager only. A receiver
//! records its offset after every acknowledged chunk; a later session for the
//! same peer and content picks it up and asks the sender to skip ahead.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

/// Identity of a download: which peer, which content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResumeKey {
    pub peer_id: Arc<str>,
    pub file_id: Arc<str>,
}

impl ResumeKey {
    pub fn new(peer_id: impl Into<Arc<str>>, file_id: impl Into<Arc<str>>) -> Self {
        Self {
            peer_id: peer_id.into(),
            file_id: file_id.into(),
        }
    }
}

/// Where a partial download lives and how far it got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    pub path: PathBuf,
    /// Bytes acknowledged, always a chunk boundary.
    pub offset: u64,
    pub chunk_size: u32,
}

#[derive(Debug, Default)]
pub struct ResumeLedger {
    entries: DashMap<ResumeKey, ResumePoint>,
}

impl ResumeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ResumeKey) -> Option<ResumePoint> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, key: ResumeKey, point: ResumePoint) {
        self.entries.insert(key, point);
    }

    /// Advances the offset of an existing entry.
    pub fn advance(&self, key: &ResumeKey, offset: u64) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.offset = offset;
        }
    }

    pub fn remove(&self, key: &ResumeKey) -> Option<ResumePoint> {
        self.entries.remove(key).map(|(_, point)| point)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
