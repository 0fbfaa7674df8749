//! Conversation memory for the chat path.
//!
//! Short-term memory is a bounded ring of the latest utterances, warmed from
//! the store at startup. Long-term retrieval is keyword matching over every
//! stored utterance.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use alphred_core::MemoryEntry;
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::storage::{Storage, StorageError};

/// Speaker labels stored with each utterance.
pub const USER_ROLE: &str = "User";
pub const AI_ROLE: &str = "AI";

/// Upper bound on keywords taken from one query.
const MAX_TERMS: usize = 8;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "you", "are", "was", "what", "how", "this", "that", "have",
    "can", "about", "from", "your", "please",
];

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Long-term context relevant to `query`; empty when nothing matches.
    async fn retrieve_context(&self, query: &str) -> Result<String, MemoryError>;

    /// Remember one utterance.
    async fn store(&self, role: &str, content: &str) -> Result<(), MemoryError>;

    /// The latest `limit` utterances, oldest first.
    async fn recent(&self, limit: usize) -> Vec<MemoryEntry>;
}

#[derive(Debug)]
pub struct SqliteMemory {
    storage: Arc<Storage>,
    ring: Mutex<VecDeque<MemoryEntry>>,
    capacity: usize,
    top_k: usize,
}

impl SqliteMemory {
    /// Build the store and warm the short-term ring from the newest rows.
    pub async fn load(storage: Arc<Storage>, capacity: usize, top_k: usize) -> Result<Self, MemoryError> {
        let warm = storage.recent_memories(capacity).await?;
        debug!(entries = warm.len(), capacity, "short-term memory warmed");
        Ok(Self {
            storage,
            ring: Mutex::new(warm.into()),
            capacity,
            top_k,
        })
    }

    fn push(&self, entry: MemoryEntry) {
        if self.capacity == 0 {
            return;
        }
        let mut ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        while ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }
}

#[async_trait]
impl MemoryStore for SqliteMemory {
    async fn retrieve_context(&self, query: &str) -> Result<String, MemoryError> {
        let terms = keywords(query);
        if terms.is_empty() {
            return Ok(String::new());
        }
        let hits = self.storage.search_memories(&terms, self.top_k).await?;
        debug!(terms = terms.len(), hits = hits.len(), "long-term memory search");
        Ok(format_context(&hits))
    }

    async fn store(&self, role: &str, content: &str) -> Result<(), MemoryError> {
        let entry = self.storage.insert_memory(role, content).await?;
        self.push(entry);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Vec<MemoryEntry> {
        let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }
}

/// Distinct lowercase search terms from `query`.
fn keywords(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|word| {
            let min_len = if word.is_ascii() { 3 } else { 2 };
            word.chars().count() >= min_len && !STOPWORDS.contains(&word.as_str())
        })
        .filter(|word| seen.insert(word.clone()))
        .take(MAX_TERMS)
        .collect()
}

fn format_context(entries: &[MemoryEntry]) -> String {
    if entries.is_empty() {
        return String::new();
    }
    let mut context = String::from("[Related long-term memories]\n");
    for entry in entries {
        context.push_str(&format!(
            "- ({}) {}: {}\n",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.role,
            entry.content
        ));
    }
    context
}
