//! Item filters.
//!
//! A [`Filter`] is a named predicate over item metadata. Its body is a
//! closed [`FilterExpr`] tree: leaves test for a metadata field, a literal
//! value, or a last-modified date range; `And` / `Or` / `Not` compose them.
//!
//! Every filter has three equivalent renditions:
//!
//! | Operation | Output |
//! |-----------|--------|
//! | [`Filter::evaluate`] | in-memory `bool` for one [`Item`] |
//! | [`Filter::to_storage_predicate`] | SQL `WHERE` fragment + ordered bindings |
//! | [`Filter::to_search_query`] | Solr query string |
//!
//! Construction validates parameters eagerly, so a misconfigured filter
//! fails when the registry is built, never while items are evaluated.

pub mod registry;
pub mod translate;

use chrono::{DateTime, Utc};

use crate::error::ConfigError;
use crate::models::{parse_ts, Item};

pub use registry::{FilterRegistry, FilterSet};
pub use translate::{escape_query_chars, Schema, StoragePredicate, LAST_MODIFIED_FIELD};

/// Filter expression tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterExpr {
    /// The item has at least one value for the field.
    Exists(String),
    /// `from <= last_modified < until`; no `until` means "from date onward".
    DateRange {
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    },
    /// The item has a value for the field exactly equal to `value`.
    ValueMatch { field: String, value: String },
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    /// Evaluate against one item. `And` stops at the first false child,
    /// `Or` at the first true one.
    pub fn evaluate(&self, item: &Item) -> bool {
        match self {
            FilterExpr::Exists(field) => item.has_field(field),
            FilterExpr::DateRange { from, until } => {
                item.last_modified >= *from && until.map_or(true, |u| item.last_modified < u)
            }
            FilterExpr::ValueMatch { field, value } => item.values(field).any(|v| v == value),
            FilterExpr::And(children) => children.iter().all(|c| c.evaluate(item)),
            FilterExpr::Or(children) => children.iter().any(|c| c.evaluate(item)),
            FilterExpr::Not(child) => !child.evaluate(item),
        }
    }

    /// Metadata fields referenced anywhere in the tree.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            FilterExpr::Exists(field) | FilterExpr::ValueMatch { field, .. } => {
                out.push(field.as_str())
            }
            FilterExpr::DateRange { .. } => {}
            FilterExpr::And(children) | FilterExpr::Or(children) => {
                for c in children {
                    c.collect_fields(out);
                }
            }
            FilterExpr::Not(child) => child.collect_fields(out),
        }
    }
}

/// A configured, validated filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    id: String,
    params: Vec<String>,
    expr: FilterExpr,
}

impl Filter {
    /// Wrap an already-built expression. Parameters are recorded as given.
    pub fn from_expr(id: impl Into<String>, params: Vec<String>, expr: FilterExpr) -> Self {
        Self {
            id: id.into(),
            params,
            expr,
        }
    }

    /// `exists`: true when any of the listed fields has a value.
    pub fn exists(id: &str, params: &[String]) -> Result<Filter, ConfigError> {
        require_params(id, params)?;
        let mut leaves: Vec<FilterExpr> = params
            .iter()
            .map(|field| FilterExpr::Exists(field.trim().to_string()))
            .collect();
        let expr = if leaves.len() == 1 {
            leaves.remove(0)
        } else {
            FilterExpr::Or(leaves)
        };
        Ok(Self::from_expr(id, params.to_vec(), expr))
    }

    /// `value`: `[field, value, ...]`, true when the field equals any value.
    pub fn value_match(id: &str, params: &[String]) -> Result<Filter, ConfigError> {
        require_params(id, params)?;
        if params.len() < 2 {
            return Err(ConfigError::Arity {
                filter: id.to_string(),
                expected: "at least 2".to_string(),
                actual: params.len(),
            });
        }
        let field = params[0].trim().to_string();
        let mut leaves = Vec::with_capacity(params.len() - 1);
        for value in &params[1..] {
            if value.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "filter '{}' matches an empty value",
                    id
                )));
            }
            leaves.push(FilterExpr::ValueMatch {
                field: field.clone(),
                value: value.clone(),
            });
        }
        let expr = if leaves.len() == 1 {
            leaves.remove(0)
        } else {
            FilterExpr::Or(leaves)
        };
        Ok(Self::from_expr(id, params.to_vec(), expr))
    }

    /// `date-range`: `[from]` or `[from, until]`.
    pub fn date_range(id: &str, params: &[String]) -> Result<Filter, ConfigError> {
        require_params(id, params)?;
        if params.len() > 2 {
            return Err(ConfigError::Arity {
                filter: id.to_string(),
                expected: "1 or 2".to_string(),
                actual: params.len(),
            });
        }
        let from = parse_bound(id, &params[0])?;
        let until = match params.get(1) {
            Some(raw) => Some(parse_bound(id, raw)?),
            None => None,
        };
        if let Some(u) = until {
            if u <= from {
                return Err(ConfigError::InvalidDate {
                    filter: id.to_string(),
                    value: params[1].clone(),
                    reason: "upper bound must be after the lower bound".to_string(),
                });
            }
        }
        Ok(Self::from_expr(
            id,
            params.to_vec(),
            FilterExpr::DateRange { from, until },
        ))
    }

    /// `and`: every referenced filter must accept.
    pub fn and(id: &str, params: &[String], children: Vec<Filter>) -> Result<Filter, ConfigError> {
        require_children(id, params, &children)?;
        let exprs = children.into_iter().map(|c| c.expr).collect();
        Ok(Self::from_expr(id, params.to_vec(), FilterExpr::And(exprs)))
    }

    /// `or`: any referenced filter must accept.
    pub fn or(id: &str, params: &[String], children: Vec<Filter>) -> Result<Filter, ConfigError> {
        require_children(id, params, &children)?;
        let exprs = children.into_iter().map(|c| c.expr).collect();
        Ok(Self::from_expr(id, params.to_vec(), FilterExpr::Or(exprs)))
    }

    /// `not`: exactly one referenced filter, negated.
    pub fn not(id: &str, params: &[String], children: Vec<Filter>) -> Result<Filter, ConfigError> {
        require_children(id, params, &children)?;
        if children.len() != 1 {
            return Err(ConfigError::Arity {
                filter: id.to_string(),
                expected: "1".to_string(),
                actual: children.len(),
            });
        }
        let child = children.into_iter().next().map(|c| c.expr);
        match child {
            Some(expr) => Ok(Self::from_expr(
                id,
                params.to_vec(),
                FilterExpr::Not(Box::new(expr)),
            )),
            None => Err(ConfigError::EmptyParameters {
                filter: id.to_string(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn expr(&self) -> &FilterExpr {
        &self.expr
    }

    pub fn evaluate(&self, item: &Item) -> bool {
        self.expr.evaluate(item)
    }

    /// SQL rendition over the `items` table alias.
    pub fn to_storage_predicate(&self, schema: &Schema) -> Result<StoragePredicate, ConfigError> {
        translate::to_storage_predicate(&self.id, &self.expr, schema)
    }

    /// Solr query rendition.
    pub fn to_search_query(&self, schema: &Schema) -> Result<String, ConfigError> {
        translate::to_search_query(&self.id, &self.expr, schema)
    }
}

fn require_params(id: &str, params: &[String]) -> Result<(), ConfigError> {
    if params.is_empty() || params.iter().all(|p| p.trim().is_empty()) {
        return Err(ConfigError::EmptyParameters {
            filter: id.to_string(),
        });
    }
    Ok(())
}

fn require_children(id: &str, params: &[String], children: &[Filter]) -> Result<(), ConfigError> {
    require_params(id, params)?;
    if children.is_empty() {
        return Err(ConfigError::EmptyParameters {
            filter: id.to_string(),
        });
    }
    if children.len() != params.len() {
        return Err(ConfigError::Arity {
            filter: id.to_string(),
            expected: params.len().to_string(),
            actual: children.len(),
        });
    }
    Ok(())
}

fn parse_bound(id: &str, raw: &str) -> Result<DateTime<Utc>, ConfigError> {
    parse_ts(raw).ok_or_else(|| ConfigError::InvalidDate {
        filter: id.to_string(),
        value: raw.to_string(),
        reason: "expected YYYY-MM-DD or an RFC 3339 timestamp".to_string(),
    })
}
