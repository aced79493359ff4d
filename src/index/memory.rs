//! In-process search index.
//!
//! Submissions and deletions are staged and only become visible on
//! [`SearchIndex::commit`], mirroring a Solr core without soft commits.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;

use super::query;
use super::{IndexDocument, SearchIndex};

#[derive(Default)]
pub struct MemoryIndex {
    /// `None` marks a staged deletion.
    staged: RwLock<BTreeMap<String, Option<IndexDocument>>>,
    committed: RwLock<BTreeMap<String, IndexDocument>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed documents.
    pub fn len(&self) -> usize {
        self.committed.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Committed document by id.
    pub fn document(&self, id: &str) -> Option<IndexDocument> {
        self.committed.read().ok()?.get(id).cloned()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("memory index lock poisoned")
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn submit(&self, doc: IndexDocument) -> Result<()> {
        let mut staged = self.staged.write().map_err(poisoned)?;
        staged.insert(doc.id.clone(), Some(doc));
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut staged = self.staged.write().map_err(poisoned)?;
        staged.insert(id.to_string(), None);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.staged.write().map_err(poisoned)?);
        let mut committed = self.committed.write().map_err(poisoned)?;
        for (id, doc) in pending {
            match doc {
                Some(doc) => {
                    committed.insert(id, doc);
                }
                None => {
                    committed.remove(&id);
                }
            }
        }
        Ok(())
    }

    async fn query(&self, q: &str, limit: usize) -> Result<Vec<String>> {
        let parsed = query::parse(q)?;
        let committed = self.committed.read().map_err(poisoned)?;
        Ok(committed
            .values()
            .filter(|doc| parsed.matches(doc))
            .map(|doc| doc.id.clone())
            .take(limit)
            .collect())
    }
}
