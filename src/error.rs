//! Error kinds shared by the filter engine and the harvester.
//!
//! Configuration problems are fatal and surface before any item is
//! processed. Harvest failures are classified so the scheduler can tell a
//! retryable network hiccup from a broken remote endpoint.

use thiserror::Error;

/// Invalid filter, schema, or harvester configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("filter '{filter}' has an empty parameter list")]
    EmptyParameters { filter: String },

    #[error("filter '{filter}' has unknown kind '{kind}'")]
    UnknownKind { filter: String, kind: String },

    #[error("filter '{filter}' references unknown filter '{reference}'")]
    UnknownFilter { filter: String, reference: String },

    #[error("filter '{filter}' is part of a reference cycle")]
    Cycle { filter: String },

    #[error("filter '{filter}' expects {expected} parameter(s), got {actual}")]
    Arity {
        filter: String,
        expected: String,
        actual: usize,
    },

    #[error("filter '{filter}' references metadata field '{field}' which is not in the schema")]
    UnknownField { filter: String, field: String },

    #[error("filter '{filter}' has an invalid date '{value}': {reason}")]
    InvalidDate {
        filter: String,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Invalid(String),
}

/// A failed harvest cycle.
#[derive(Error, Debug)]
pub enum HarvestError {
    /// Timeouts, connection failures and HTTP 5xx. Retried next pass.
    #[error("transient harvest failure: {0}")]
    Transient(String),

    /// Malformed XML, OAI protocol errors, HTTP 4xx and mapping failures.
    #[error("harvest failed: {0}")]
    Permanent(String),

    /// The remote endpoint answered with an OAI-PMH `<error>` element.
    #[error("OAI-PMH error {code}: {message}")]
    Protocol { code: String, message: String },

    /// The process is shutting down.
    #[error("harvest interrupted: {0}")]
    Interrupted(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HarvestError {
    /// OAI-PMH error code, if the remote side reported one.
    pub fn protocol_code(&self) -> Option<&str> {
        match self {
            HarvestError::Protocol { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether the failure should be retried without counting toward the
    /// consecutive-failure hold.
    pub fn is_transient(&self) -> bool {
        matches!(self, HarvestError::Transient(_) | HarvestError::Interrupted(_))
    }
}

impl From<quick_xml::Error> for HarvestError {
    fn from(e: quick_xml::Error) -> Self {
        HarvestError::Permanent(format!("malformed OAI-PMH response: {}", e))
    }
}

impl From<reqwest::Error> for HarvestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            return HarvestError::Transient(e.to_string());
        }
        match e.status() {
            Some(status) if status.is_server_error() => HarvestError::Transient(e.to_string()),
            Some(_) => HarvestError::Permanent(e.to_string()),
            None if e.is_request() || e.is_body() => HarvestError::Transient(e.to_string()),
            None => HarvestError::Permanent(e.to_string()),
        }
    }
}
