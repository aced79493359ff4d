//! OAI-PMH client seam.
//!
//! The harvester talks to remote repositories only through [`OaiClient`],
//! so tests can substitute canned responses for a live endpoint.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::error::HarvestError;

use super::response::{
    parse_get_record, parse_identify, parse_list_records, parse_metadata_formats, parse_sets,
    Identify, MetadataFormat, OaiSet, Record, RecordPage,
};

/// Arguments for one `ListRecords` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListRecordsRequest {
    Initial {
        prefix: String,
        from: Option<String>,
        until: Option<String>,
        set: Option<String>,
    },
    /// Follow-up page; the token carries all other arguments.
    Resume(String),
}

impl ListRecordsRequest {
    fn query(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("verb", "ListRecords".to_string())];
        match self {
            ListRecordsRequest::Initial {
                prefix,
                from,
                until,
                set,
            } => {
                params.push(("metadataPrefix", prefix.clone()));
                if let Some(from) = from {
                    params.push(("from", from.clone()));
                }
                if let Some(until) = until {
                    params.push(("until", until.clone()));
                }
                if let Some(set) = set {
                    params.push(("set", set.clone()));
                }
            }
            ListRecordsRequest::Resume(token) => params.push(("resumptionToken", token.clone())),
        }
        params
    }
}

#[async_trait]
pub trait OaiClient: Send + Sync {
    async fn identify(&self, base_url: &str) -> Result<Identify, HarvestError>;

    async fn list_metadata_formats(&self, base_url: &str)
        -> Result<Vec<MetadataFormat>, HarvestError>;

    /// Every set, following resumption tokens.
    async fn list_sets(&self, base_url: &str) -> Result<Vec<OaiSet>, HarvestError>;

    async fn list_records(
        &self,
        base_url: &str,
        request: &ListRecordsRequest,
    ) -> Result<RecordPage, HarvestError>;

    async fn get_record(
        &self,
        base_url: &str,
        identifier: &str,
        prefix: &str,
    ) -> Result<Record, HarvestError>;

    /// Raw bytes at `url`, used for aggregated resources.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, HarvestError>;
}

/// [`OaiClient`] over HTTP GET.
pub struct HttpOaiClient {
    client: reqwest::Client,
}

impl HttpOaiClient {
    pub fn new(timeout: Duration) -> Result<Self, HarvestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("oai-harvest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str, params: &[(&str, String)]) -> Result<Vec<u8>, HarvestError> {
        debug!(url, ?params, "OAI-PMH request");
        let response = self.client.get(url).query(params).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = format!("HTTP {} from {}", status, url);
            // 5xx and 429 are worth retrying next pass; other 4xx are not.
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                HarvestError::Transient(message)
            } else {
                HarvestError::Permanent(message)
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl OaiClient for HttpOaiClient {
    async fn identify(&self, base_url: &str) -> Result<Identify, HarvestError> {
        let body = self.get(base_url, &[("verb", "Identify".into())]).await?;
        parse_identify(&body)
    }

    async fn list_metadata_formats(
        &self,
        base_url: &str,
    ) -> Result<Vec<MetadataFormat>, HarvestError> {
        let body = self
            .get(base_url, &[("verb", "ListMetadataFormats".into())])
            .await?;
        parse_metadata_formats(&body)
    }

    async fn list_sets(&self, base_url: &str) -> Result<Vec<OaiSet>, HarvestError> {
        let mut sets = Vec::new();
        let mut params = vec![("verb", "ListSets".to_string())];
        loop {
            let body = self.get(base_url, &params).await?;
            let (page, resumption) = parse_sets(&body)?;
            sets.extend(page);
            match resumption.token.filter(|t| !t.trim().is_empty()) {
                Some(token) => {
                    params = vec![
                        ("verb", "ListSets".to_string()),
                        ("resumptionToken", token),
                    ]
                }
                None => return Ok(sets),
            }
        }
    }

    async fn list_records(
        &self,
        base_url: &str,
        request: &ListRecordsRequest,
    ) -> Result<RecordPage, HarvestError> {
        let body = self.get(base_url, &request.query()).await?;
        parse_list_records(&body)
    }

    async fn get_record(
        &self,
        base_url: &str,
        identifier: &str,
        prefix: &str,
    ) -> Result<Record, HarvestError> {
        let params = [
            ("verb", "GetRecord".to_string()),
            ("identifier", identifier.to_string()),
            ("metadataPrefix", prefix.to_string()),
        ];
        let body = self.get(base_url, &params).await?;
        parse_get_record(&body)
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, HarvestError> {
        self.get(url, &[]).await
    }
}
