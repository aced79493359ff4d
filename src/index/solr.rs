//! Solr backend over the JSON update and select handlers.
//!
//! `base_url` is the core URL, e.g. `http://localhost:8983/solr/oai`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;

use super::{IndexDocument, SearchIndex};

pub struct SolrIndex {
    client: reqwest::Client,
    base_url: String,
}

impl SolrIndex {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn update(&self, body: Value, commit: bool) -> Result<()> {
        let url = format!("{}/update", self.base_url);
        let mut request = self.client.post(&url).query(&[("wt", "json")]);
        if commit {
            request = request.query(&[("commit", "true")]);
        }
        let response = request.json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Solr update failed ({}): {}", status, text);
        }
        Ok(())
    }
}

fn to_solr_doc(doc: &IndexDocument) -> Value {
    let mut map = Map::new();
    map.insert("id".to_string(), Value::String(doc.id.clone()));
    for (field, values) in &doc.fields {
        map.insert(field.clone(), json!(values));
    }
    Value::Object(map)
}

/// Extract `response.docs[].id` from a select response.
fn parse_select_response(json: &Value) -> Result<Vec<String>> {
    let docs = json
        .pointer("/response/docs")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Solr response: missing response.docs"))?;
    Ok(docs
        .iter()
        .filter_map(|d| d.get("id").and_then(|id| id.as_str()))
        .map(str::to_string)
        .collect())
}

#[async_trait]
impl SearchIndex for SolrIndex {
    async fn submit(&self, doc: IndexDocument) -> Result<()> {
        self.update(json!([to_solr_doc(&doc)]), false).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.update(json!({ "delete": { "id": id } }), false).await
    }

    async fn commit(&self) -> Result<()> {
        self.update(json!({ "commit": {} }), true).await
    }

    async fn query(&self, q: &str, limit: usize) -> Result<Vec<String>> {
        let url = format!("{}/select", self.base_url);
        let rows = limit.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[
                ("q", q),
                ("fl", "id"),
                ("sort", "id asc"),
                ("rows", rows.as_str()),
                ("wt", "json"),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Solr query failed ({}): {}", status, text);
        }
        let json: Value = response.json().await?;
        parse_select_response(&json)
    }
}
