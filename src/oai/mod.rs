//! OAI-PMH 2.0 harvesting protocol: client, response parsing, and the
//! small XML tree both are built on.

pub mod client;
pub mod response;
pub mod xml;

pub use client::{HttpOaiClient, ListRecordsRequest, OaiClient};
pub use response::{
    parse_get_record, parse_identify, parse_list_records, parse_metadata_formats, parse_sets,
    Granularity, Identify, MetadataFormat, OaiSet, Record, RecordHeader, RecordPage,
    ResumptionToken,
};
pub use xml::Element;
