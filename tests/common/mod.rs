//! Shared fixtures for the integration tests: a scripted OAI-PMH client,
//! canned response documents, and a temp-dir harvest context.

#![allow(dead_code)]

use async_trait::async_trait;
use oai_harvest::config::Config;
use oai_harvest::error::HarvestError;
use oai_harvest::harvest::HarvestContext;
use oai_harvest::index::{MemoryIndex, SearchIndex};
use oai_harvest::models::{HarvestType, HarvestedCollection};
use oai_harvest::oai::{
    parse_get_record, parse_identify, parse_list_records, parse_metadata_formats, parse_sets,
    Identify, ListRecordsRequest, MetadataFormat, OaiClient, OaiSet, Record, RecordPage,
};
use oai_harvest::status::HarvestStatus;
use oai_harvest::{db, migrate, store};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const SOURCE: &str = "http://remote.example.org/oai";
pub const ORE_PREFIX: &str = "ore";

// ─── Canned documents ───────────────────────────────────────────────

fn envelope(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2024-05-01T00:00:00Z</responseDate>
  <request>{}</request>
  {}
</OAI-PMH>"#,
        SOURCE, body
    )
}

pub fn identify_xml() -> String {
    envelope(&format!(
        r#"<Identify>
    <repositoryName>Remote Test Repository</repositoryName>
    <baseURL>{}</baseURL>
    <protocolVersion>2.0</protocolVersion>
    <earliestDatestamp>2001-01-01T00:00:00Z</earliestDatestamp>
    <granularity>YYYY-MM-DDThh:mm:ssZ</granularity>
  </Identify>"#,
        SOURCE
    ))
}

pub fn formats_xml() -> String {
    envelope(
        r#"<ListMetadataFormats>
    <metadataFormat>
      <metadataPrefix>oai_dc</metadataPrefix>
      <schema>http://www.openarchives.org/OAI/2.0/oai_dc.xsd</schema>
      <metadataNamespace>http://www.openarchives.org/OAI/2.0/oai_dc/</metadataNamespace>
    </metadataFormat>
    <metadataFormat>
      <metadataPrefix>ore</metadataPrefix>
      <schema>http://tweety.lanl.gov/public/schemas/2008-06/atom-tron.sch</schema>
      <metadataNamespace>http://www.w3.org/2005/Atom</metadataNamespace>
    </metadataFormat>
  </ListMetadataFormats>"#,
    )
}

pub fn sets_xml(sets: &[(&str, &str)]) -> String {
    let body: String = sets
        .iter()
        .map(|(spec, name)| {
            format!(
                "<set><setSpec>{}</setSpec><setName>{}</setName></set>",
                spec, name
            )
        })
        .collect();
    envelope(&format!("<ListSets>{}</ListSets>", body))
}

pub fn oai_error_xml(code: &str, message: &str) -> String {
    envelope(&format!(r#"<error code="{}">{}</error>"#, code, message))
}

/// One `<record>` with Dublin Core metadata.
pub fn dc_record(id: &str, datestamp: &str, set: &str, fields: &[(&str, &str)]) -> String {
    let dc: String = fields
        .iter()
        .map(|(element, value)| format!("<dc:{0}>{1}</dc:{0}>", element, value))
        .collect();
    format!(
        r#"<record>
      <header>
        <identifier>{}</identifier>
        <datestamp>{}</datestamp>
        <setSpec>{}</setSpec>
      </header>
      <metadata>
        <oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/" xmlns:dc="http://purl.org/dc/elements/1.1/">{}</oai_dc:dc>
      </metadata>
    </record>"#,
        id, datestamp, set, dc
    )
}

pub fn deleted_record(id: &str, datestamp: &str) -> String {
    format!(
        r#"<record>
      <header status="deleted">
        <identifier>{}</identifier>
        <datestamp>{}</datestamp>
      </header>
    </record>"#,
        id, datestamp
    )
}

/// A `ListRecords` page, optionally continued by `token`.
pub fn list_records_xml(records: &[String], token: Option<&str>, complete_size: usize) -> String {
    let resumption = match token {
        Some(t) => format!(
            r#"<resumptionToken completeListSize="{}" cursor="0">{}</resumptionToken>"#,
            complete_size, t
        ),
        None => String::new(),
    };
    envelope(&format!(
        "<ListRecords>{}{}</ListRecords>",
        records.concat(),
        resumption
    ))
}

/// A `GetRecord` response carrying an Atom ORE resource map.
pub fn ore_record_xml(id: &str, files: &[(&str, &str)]) -> String {
    let links: String = files
        .iter()
        .map(|(href, title)| {
            format!(
                r#"<atom:link rel="http://www.openarchives.org/ore/terms/aggregates" href="{}" title="{}" type="application/pdf"/>"#,
                href, title
            )
        })
        .collect();
    envelope(&format!(
        r#"<GetRecord><record>
      <header>
        <identifier>{}</identifier>
        <datestamp>2024-04-01T10:00:00Z</datestamp>
      </header>
      <metadata>
        <atom:entry xmlns:atom="http://www.w3.org/2005/Atom">
          <atom:id>{}/ore</atom:id>
          {}
        </atom:entry>
      </metadata>
    </record></GetRecord>"#,
        id, id, links
    ))
}

// ─── Scripted client ────────────────────────────────────────────────

/// How the scripted client misbehaves on `Identify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Timeout,
    BadResponse,
    /// Never answers.
    Hang,
    /// Panics inside the worker.
    Panic,
}

/// An [`OaiClient`] answering from canned documents.
///
/// `ListRecords` with no token serves the page registered under `None`;
/// a resumption token serves the page registered under that token. With
/// no initial page the client answers `noRecordsMatch`.
#[derive(Default)]
pub struct ScriptedClient {
    pages: Mutex<HashMap<Option<String>, String>>,
    records: HashMap<(String, String), String>,
    files: HashMap<String, Vec<u8>>,
    sets: Vec<(String, String)>,
    failure: Mutex<Option<Failure>>,
    requests: Mutex<Vec<ListRecordsRequest>>,
    identify_calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, token: Option<&str>, xml: String) -> Self {
        self.set_page(token, xml);
        self
    }

    /// Replace what the endpoint serves for `token` between cycles.
    pub fn set_page(&self, token: Option<&str>, xml: String) {
        self.pages
            .lock()
            .unwrap()
            .insert(token.map(str::to_string), xml);
    }

    pub fn with_record(mut self, id: &str, prefix: &str, xml: String) -> Self {
        self.records
            .insert((id.to_string(), prefix.to_string()), xml);
        self
    }

    pub fn with_file(mut self, url: &str, content: &[u8]) -> Self {
        self.files.insert(url.to_string(), content.to_vec());
        self
    }

    pub fn with_sets(mut self, sets: &[(&str, &str)]) -> Self {
        self.sets = sets
            .iter()
            .map(|(s, n)| (s.to_string(), n.to_string()))
            .collect();
        self
    }

    pub fn failing(self, failure: Failure) -> Self {
        self.set_failure(Some(failure));
        self
    }

    pub fn set_failure(&self, failure: Option<Failure>) {
        *self.failure.lock().unwrap() = failure;
    }

    pub fn list_requests(&self) -> Vec<ListRecordsRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn identify_calls(&self) -> usize {
        self.identify_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OaiClient for ScriptedClient {
    async fn identify(&self, _base_url: &str) -> Result<Identify, HarvestError> {
        self.identify_calls.fetch_add(1, Ordering::SeqCst);
        let failure = *self.failure.lock().unwrap();
        match failure {
            Some(Failure::Timeout) => Err(HarvestError::Transient(
                "error sending request: operation timed out".to_string(),
            )),
            Some(Failure::BadResponse) => Err(HarvestError::Permanent(
                "not an OAI-PMH response (root element 'html')".to_string(),
            )),
            Some(Failure::Hang) => std::future::pending().await,
            Some(Failure::Panic) => panic!("scripted identify panic"),
            None => parse_identify(identify_xml().as_bytes()),
        }
    }

    async fn list_metadata_formats(
        &self,
        _base_url: &str,
    ) -> Result<Vec<MetadataFormat>, HarvestError> {
        parse_metadata_formats(formats_xml().as_bytes())
    }

    async fn list_sets(&self, _base_url: &str) -> Result<Vec<OaiSet>, HarvestError> {
        let sets: Vec<(&str, &str)> = self
            .sets
            .iter()
            .map(|(s, n)| (s.as_str(), n.as_str()))
            .collect();
        Ok(parse_sets(sets_xml(&sets).as_bytes())?.0)
    }

    async fn list_records(
        &self,
        _base_url: &str,
        request: &ListRecordsRequest,
    ) -> Result<RecordPage, HarvestError> {
        self.requests.lock().unwrap().push(request.clone());
        let key = match request {
            ListRecordsRequest::Initial { .. } => None,
            ListRecordsRequest::Resume(token) => Some(token.clone()),
        };
        let page = self.pages.lock().unwrap().get(&key).cloned();
        match page {
            Some(xml) => parse_list_records(xml.as_bytes()),
            None if key.is_none() => parse_list_records(
                oai_error_xml("noRecordsMatch", "No matching records").as_bytes(),
            ),
            None => parse_list_records(
                oai_error_xml("badResumptionToken", "Unknown token").as_bytes(),
            ),
        }
    }

    async fn get_record(
        &self,
        _base_url: &str,
        identifier: &str,
        prefix: &str,
    ) -> Result<Record, HarvestError> {
        match self
            .records
            .get(&(identifier.to_string(), prefix.to_string()))
        {
            Some(xml) => parse_get_record(xml.as_bytes()),
            None => parse_get_record(oai_error_xml("idDoesNotExist", identifier).as_bytes()),
        }
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, HarvestError> {
        self.files
            .get(url)
            .cloned()
            .ok_or_else(|| HarvestError::Permanent(format!("HTTP 404 Not Found from {}", url)))
    }
}

// ─── Environment ────────────────────────────────────────────────────

pub struct TestEnv {
    pub _tmp: TempDir,
    pub ctx: Arc<HarvestContext>,
    pub client: Arc<ScriptedClient>,
    pub index: Arc<MemoryIndex>,
}

pub async fn setup(client: ScriptedClient) -> TestEnv {
    setup_with(client, |_| {}).await
}

pub async fn setup_with(client: ScriptedClient, tweak: impl FnOnce(&mut Config)) -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::minimal(tmp.path().join("data").join("oaih.sqlite"));
    config.harvester.workers = 2;
    tweak(&mut config);

    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();

    let client = Arc::new(client);
    let index = Arc::new(MemoryIndex::new());
    let dyn_client: Arc<dyn OaiClient> = client.clone();
    let dyn_index: Arc<dyn SearchIndex> = index.clone();
    let ctx = HarvestContext::new(Arc::new(config), pool, dyn_client, dyn_index).unwrap();

    TestEnv {
        _tmp: tmp,
        ctx: Arc::new(ctx),
        client,
        index,
    }
}

pub async fn add_collection(env: &TestEnv, id: &str, set: &str, harvest_type: HarvestType) {
    store::insert_collection(
        &env.ctx.pool,
        &HarvestedCollection {
            collection_id: id.to_string(),
            oai_source: SOURCE.to_string(),
            oai_set_id: set.to_string(),
            metadata_format: "oai_dc".to_string(),
            harvest_type,
            status: HarvestStatus::Ready,
            last_harvested: None,
            harvest_start_time: None,
            message: None,
            consecutive_failures: 0,
        },
    )
    .await
    .unwrap();
}

pub async fn collection(env: &TestEnv, id: &str) -> HarvestedCollection {
    store::get_collection(&env.ctx.pool, id)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("collection {} missing", id))
}
