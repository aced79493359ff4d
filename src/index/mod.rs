//! Search index abstraction.
//!
//! The harvester pushes one [`IndexDocument`] per ingested item and
//! commits once per `ListRecords` page. Queries only see committed
//! documents. Two backends:
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`MemoryIndex`] | tests, and CLI runs that rebuild it from the store |
//! | [`SolrIndex`] | an external Solr core over HTTP |
//!
//! The memory backend holds nothing across processes; see
//! [`crate::exposure::open_index`] for how commands repopulate it.

pub mod memory;
pub mod query;
pub mod solr;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Config;
use crate::filter::LAST_MODIFIED_FIELD;
use crate::models::{format_ts, Item};

pub use memory::MemoryIndex;
pub use solr::SolrIndex;

/// Index field holding the owning collection id.
pub const COLLECTION_FIELD: &str = "collection";

/// A flattened item as the search index sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexDocument {
    pub id: String,
    pub fields: BTreeMap<String, Vec<String>>,
}

impl IndexDocument {
    pub fn from_item(item: &Item) -> Self {
        let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for mv in &item.metadata {
            fields
                .entry(mv.field.clone())
                .or_default()
                .push(mv.value.clone());
        }
        fields.insert(
            LAST_MODIFIED_FIELD.to_string(),
            vec![format_ts(&item.last_modified)],
        );
        fields.insert(
            COLLECTION_FIELD.to_string(),
            vec![item.collection_id.clone()],
        );
        Self {
            id: item.id.clone(),
            fields,
        }
    }

    pub fn values<'a>(&'a self, field: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .get(field)
            .into_iter()
            .flat_map(|vs| vs.iter().map(String::as_str))
    }
}

/// Submit/commit/query collaborator for the search engine.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Stage a document for the next commit, replacing any with the same id.
    async fn submit(&self, doc: IndexDocument) -> Result<()>;

    /// Stage removal of a document.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Make staged changes visible to queries.
    async fn commit(&self) -> Result<()>;

    /// Ids of committed documents matching `query`, sorted ascending.
    async fn query(&self, query: &str, limit: usize) -> Result<Vec<String>>;
}

/// Build the configured index backend. Solr requests share the
/// harvester's request timeout.
pub fn create_index(config: &Config) -> Result<Arc<dyn SearchIndex>> {
    let index = &config.index;
    match index.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryIndex::new())),
        "solr" => {
            let url = index
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("index.url must be set when backend is 'solr'"))?;
            Ok(Arc::new(SolrIndex::new(
                url,
                config.harvester.request_timeout(),
            )?))
        }
        other => anyhow::bail!("Unknown index backend: '{}'", other),
    }
}
