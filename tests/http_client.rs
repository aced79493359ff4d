//! `HttpOaiClient` against a local axum endpoint: request arguments,
//! paging, and how HTTP and protocol failures are classified.

mod common;

use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use common::*;
use oai_harvest::config::Config;
use oai_harvest::error::HarvestError;
use oai_harvest::index::{self, SearchIndex};
use oai_harvest::oai::{Granularity, HttpOaiClient, ListRecordsRequest, OaiClient};
use std::collections::HashMap;
use std::time::{Duration, Instant};

async fn oai_endpoint(Query(params): Query<HashMap<String, String>>) -> String {
    let arg = |name: &str| params.get(name).map(String::as_str);
    match arg("verb") {
        Some("Identify") => identify_xml(),
        Some("ListMetadataFormats") => formats_xml(),
        Some("ListSets") => match arg("resumptionToken") {
            None => {
                let first = sets_xml(&[("journal", "Journals"), ("journal:physics", "Physics")]);
                first.replace(
                    "</ListSets>",
                    r#"<resumptionToken completeListSize="3">sets-2</resumptionToken></ListSets>"#,
                )
            }
            Some("sets-2") => sets_xml(&[("theses", "Theses")]),
            Some(_) => oai_error_xml("badResumptionToken", "unknown token"),
        },
        Some("ListRecords") => match (arg("resumptionToken"), arg("metadataPrefix"), arg("set")) {
            (Some("rec-2"), None, None) => list_records_xml(
                &[dc_record("oai:local:2", "2024-04-02T00:00:00Z", "journal:physics", &[("title", "Second")])],
                None,
                2,
            ),
            (None, Some("oai_dc"), Some("journal:physics")) if arg("until").is_some() => {
                list_records_xml(
                    &[dc_record("oai:local:1", "2024-04-01T00:00:00Z", "journal:physics", &[("title", "First")])],
                    Some("rec-2"),
                    2,
                )
            }
            (None, Some("oai_dc"), _) => oai_error_xml("noRecordsMatch", "empty window"),
            _ => oai_error_xml("badArgument", "unexpected arguments"),
        },
        Some("GetRecord") => match arg("identifier") {
            Some(id) => ore_record_xml(id, &[("http://files.example.org/a.pdf", "a.pdf")]),
            None => oai_error_xml("badArgument", "identifier required"),
        },
        _ => oai_error_xml("badVerb", "Illegal OAI verb"),
    }
}

async fn start_server() -> String {
    let app = Router::new()
        .route("/oai", get(oai_endpoint))
        .route(
            "/unavailable",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
        )
        .route(
            "/throttled",
            get(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        )
        .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "no such page") }))
        .route("/html", get(|| async { "<html><body>Welcome</body></html>" }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        )
        .route("/files/a.pdf", get(|| async { "%PDF-1.4 test" }))
        .route(
            "/solr/slow/select",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "{}"
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn client() -> HttpOaiClient {
    HttpOaiClient::new(Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn test_identify_and_formats() {
    let base = start_server().await;
    let oai = format!("{}/oai", base);
    let client = client();

    let identify = client.identify(&oai).await.unwrap();
    assert_eq!(identify.repository_name, "Remote Test Repository");
    assert_eq!(identify.protocol_version, "2.0");
    assert_eq!(identify.granularity, Granularity::Seconds);

    let formats = client.list_metadata_formats(&oai).await.unwrap();
    let prefixes: Vec<&str> = formats.iter().map(|f| f.prefix.as_str()).collect();
    assert_eq!(prefixes, vec!["oai_dc", "ore"]);
}

#[tokio::test]
async fn test_list_sets_follows_tokens() {
    let base = start_server().await;
    let sets = client().list_sets(&format!("{}/oai", base)).await.unwrap();
    let specs: Vec<&str> = sets.iter().map(|s| s.spec.as_str()).collect();
    assert_eq!(specs, vec!["journal", "journal:physics", "theses"]);
}

#[tokio::test]
async fn test_list_records_sends_arguments_and_resumes() {
    let base = start_server().await;
    let oai = format!("{}/oai", base);
    let client = client();

    let first = client
        .list_records(
            &oai,
            &ListRecordsRequest::Initial {
                prefix: "oai_dc".to_string(),
                from: Some("2024-01-01T00:00:00Z".to_string()),
                until: Some("2024-05-01T00:00:00Z".to_string()),
                set: Some("journal:physics".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(first.records.len(), 1);
    assert_eq!(first.records[0].header.identifier, "oai:local:1");
    assert_eq!(first.next_token(), Some("rec-2"));
    assert_eq!(first.resumption.complete_list_size, Some(2));

    let second = client
        .list_records(&oai, &ListRecordsRequest::Resume("rec-2".to_string()))
        .await
        .unwrap();
    assert_eq!(second.records[0].header.identifier, "oai:local:2");
    assert_eq!(second.next_token(), None);
}

#[tokio::test]
async fn test_protocol_errors_carry_their_code() {
    let base = start_server().await;
    let oai = format!("{}/oai", base);
    let client = client();

    let err = client
        .list_records(
            &oai,
            &ListRecordsRequest::Initial {
                prefix: "oai_dc".to_string(),
                from: None,
                until: None,
                set: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.protocol_code(), Some("noRecordsMatch"));

    let err = client
        .list_records(&oai, &ListRecordsRequest::Resume("bogus".to_string()))
        .await
        .unwrap_err();
    assert_eq!(err.protocol_code(), Some("badArgument"));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_get_record_returns_resource_map() {
    let base = start_server().await;
    let record = client()
        .get_record(&format!("{}/oai", base), "oai:local:1", "ore")
        .await
        .unwrap();
    assert_eq!(record.header.identifier, "oai:local:1");
    let xml = record.metadata_xml.unwrap();
    assert!(xml.starts_with("<atom:entry"));
    assert!(xml.contains("a.pdf"));
}

#[tokio::test]
async fn test_fetch_returns_raw_bytes() {
    let base = start_server().await;
    let bytes = client()
        .fetch(&format!("{}/files/a.pdf", base))
        .await
        .unwrap();
    assert_eq!(bytes, b"%PDF-1.4 test");
}

#[tokio::test]
async fn test_http_failures_are_classified() {
    let base = start_server().await;
    let client = client();

    let err = client
        .identify(&format!("{}/unavailable", base))
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::Transient(_)), "{:?}", err);

    let err = client
        .identify(&format!("{}/throttled", base))
        .await
        .unwrap_err();
    assert!(err.is_transient(), "{:?}", err);

    let err = client
        .identify(&format!("{}/missing", base))
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::Permanent(_)), "{:?}", err);

    // A 200 that is not OAI-PMH at all
    let err = client.identify(&format!("{}/html", base)).await.unwrap_err();
    assert!(matches!(err, HarvestError::Permanent(_)), "{:?}", err);
}

#[tokio::test]
async fn test_timeout_is_transient() {
    let base = start_server().await;
    let client = HttpOaiClient::new(Duration::from_millis(200)).unwrap();
    let err = client
        .identify(&format!("{}/slow", base))
        .await
        .unwrap_err();
    assert!(err.is_transient(), "{:?}", err);
}

#[tokio::test]
async fn test_unreachable_host_is_transient() {
    // Bind then drop, so nothing listens on the port.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client()
        .identify(&format!("http://{}/oai", addr))
        .await
        .unwrap_err();
    assert!(err.is_transient(), "{:?}", err);
}

#[tokio::test]
async fn test_solr_index_uses_configured_timeout() {
    let base = start_server().await;
    let mut config = Config::minimal("/tmp/unused.sqlite".into());
    config.index.backend = "solr".to_string();
    config.index.url = Some(format!("{}/solr/slow", base));
    config.harvester.request_timeout_secs = 1;

    let index = index::create_index(&config).unwrap();
    let started = Instant::now();
    assert!(index.query("*:*", 10).await.is_err());
    assert!(started.elapsed() < Duration::from_secs(4));
}
