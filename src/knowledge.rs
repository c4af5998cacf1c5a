//! Lightweight user-knowledge store
//!
//! Remembers durable facts the user shares in conversation (name, contact
//! details, preferences) in a small JSON file, and surfaces them as a context
//! block for the session instructions. Extraction is regex-based and
//! deliberately conservative: a missed fact is harmless, a wrong one is not.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// A single remembered fact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    /// Fact category, e.g. "name", "email", "preference"
    pub kind: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

impl Document {
    #[must_use]
    pub fn new(kind: &str, value: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            value: value.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// JSON-file-backed document store
pub struct KnowledgeStore {
    path: Option<PathBuf>,
    documents: Vec<Document>,
    extractors: Vec<(String, Regex)>,
}

impl KnowledgeStore {
    /// Open the store at `path`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: &Path) -> Result<Self> {
        let documents = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw).map_err(|e| {
                Error::Knowledge(format!("invalid knowledge file {}: {e}", path.display()))
            })?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Vec::new()
        };

        tracing::debug!(path = %path.display(), count = documents.len(), "knowledge store opened");
        Ok(Self {
            path: Some(path.to_path_buf()),
            documents,
            extractors: Self::build_extractors(),
        })
    }

    /// Create an unpersisted store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            documents: Vec::new(),
            extractors: Self::build_extractors(),
        }
    }

    fn build_extractors() -> Vec<(String, Regex)> {
        // Patterns are anchored to first-person statements so that quoted or
        // hypothetical text does not get recorded as fact.
        let specs = [
            ("name", r"(?i)\bmy name is ([A-Z][a-zA-Z'-]+(?: [A-Z][a-zA-Z'-]+)?)"),
            ("email", r"\b([a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,})\b"),
            ("phone", r"\b(\+?\d{1,3}[ .-]?\(?\d{3}\)?[ .-]?\d{3}[ .-]?\d{4})\b"),
            ("preference", r"(?i)\bi (?:really )?(?:like|love|prefer|enjoy) ([a-z][a-z0-9 '-]{2,40})"),
        ];
        specs
            .iter()
            .filter_map(|(kind, pattern)| {
                match Regex::new(pattern) {
                    Ok(re) => Some(((*kind).to_string(), re)),
                    Err(e) => {
                        tracing::warn!(kind, error = %e, "skipping invalid extractor pattern");
                        None
                    }
                }
            })
            .collect()
    }

    /// Insert a fact, skipping exact duplicates of kind and value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file cannot be written.
    pub fn insert(&mut self, kind: &str, value: &str) -> Result<bool> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(false);
        }
        let duplicate = self
            .documents
            .iter()
            .any(|d| d.kind == kind && d.value.eq_ignore_ascii_case(value));
        if duplicate {
            return Ok(false);
        }

        tracing::info!(kind, value, "remembering new fact");
        self.documents.push(Document::new(kind, value));
        self.persist()?;
        Ok(true)
    }

    /// Scan a user utterance for durable facts and store any found.
    pub fn observe(&mut self, text: &str) {
        let mut found = Vec::new();
        for (kind, re) in &self.extractors {
            for caps in re.captures_iter(text) {
                if let Some(m) = caps.get(1) {
                    found.push((kind.clone(), m.as_str().to_string()));
                }
            }
        }
        for (kind, value) in found {
            if let Err(e) = self.insert(&kind, &value) {
                tracing::warn!(error = %e, "failed to persist observed fact");
            }
        }
    }

    /// All documents of a given kind, newest first.
    #[must_use]
    pub fn filter(&self, kind: &str) -> Vec<&Document> {
        let mut docs: Vec<&Document> = self.documents.iter().filter(|d| d.kind == kind).collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        docs
    }

    /// Render the most recent facts as a context block, or an empty string
    /// when nothing is known yet.
    #[must_use]
    pub fn context_summary(&self, limit: usize) -> String {
        let mut docs: Vec<&Document> = self.documents.iter().collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        docs.iter()
            .take(limit)
            .map(|d| format!("- {}: {}", d.kind, d.value))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn persist(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let raw = serde_json::to_string_pretty(&self.documents)?;
            std::fs::write(path, raw)?;
        }
        Ok(())
    }
}

/// Supplies remembered context to a session and records new observations
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Render remembered facts for the session instructions.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying store is unreadable.
    async fn context(&self) -> Result<String>;

    /// Record a finished user utterance for fact extraction.
    async fn observe(&self, text: &str);
}

/// Shareable [`ContextProvider`] over a [`KnowledgeStore`]
#[derive(Clone)]
pub struct SharedKnowledge {
    store: Arc<tokio::sync::Mutex<KnowledgeStore>>,
}

impl SharedKnowledge {
    #[must_use]
    pub fn new(store: KnowledgeStore) -> Self {
        Self {
            store: Arc::new(tokio::sync::Mutex::new(store)),
        }
    }
}

#[async_trait]
impl ContextProvider for SharedKnowledge {
    async fn context(&self) -> Result<String> {
        Ok(self.store.lock().await.context_summary(20))
    }

    async fn observe(&self, text: &str) {
        self.store.lock().await.observe(text);
    }
}
