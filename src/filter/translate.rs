//! Translation of filter trees into storage and search-index queries.
//!
//! Storage predicates target the `items` table and use `?` placeholders.
//! The bound values are pushed in the same left-to-right walk that emits
//! the placeholders, so their order always matches.
//!
//! Search queries use Solr's standard query syntax. Combinators are
//! always parenthesized, so operator precedence never comes into play.

use std::collections::BTreeSet;

use crate::error::ConfigError;
use crate::models::format_ts;

use super::FilterExpr;

/// Index field holding an item's last-modified timestamp.
pub const LAST_MODIFIED_FIELD: &str = "lastModified";

/// Known metadata fields. Filters referencing anything else are rejected.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: BTreeSet<String>,
}

impl Schema {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }

    fn resolve(&self, filter: &str, field: &str) -> Result<(), ConfigError> {
        if self.contains(field) {
            Ok(())
        } else {
            Err(ConfigError::UnknownField {
                filter: filter.to_string(),
                field: field.to_string(),
            })
        }
    }
}

/// A parameterized `WHERE` fragment plus its bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePredicate {
    pub template: String,
    pub params: Vec<String>,
}

impl StoragePredicate {
    /// Number of `?` placeholders in the template.
    pub fn placeholder_count(&self) -> usize {
        self.template.matches('?').count()
    }
}

pub fn to_storage_predicate(
    filter: &str,
    expr: &FilterExpr,
    schema: &Schema,
) -> Result<StoragePredicate, ConfigError> {
    let mut template = String::new();
    let mut params = Vec::new();
    write_sql(filter, expr, schema, &mut template, &mut params)?;
    Ok(StoragePredicate { template, params })
}

fn write_sql(
    filter: &str,
    expr: &FilterExpr,
    schema: &Schema,
    out: &mut String,
    params: &mut Vec<String>,
) -> Result<(), ConfigError> {
    match expr {
        FilterExpr::Exists(field) => {
            schema.resolve(filter, field)?;
            out.push_str(
                "EXISTS (SELECT 1 FROM metadata_values mv WHERE mv.item_id = items.id AND mv.field = ?)",
            );
            params.push(field.clone());
        }
        FilterExpr::ValueMatch { field, value } => {
            schema.resolve(filter, field)?;
            out.push_str(
                "EXISTS (SELECT 1 FROM metadata_values mv WHERE mv.item_id = items.id AND mv.field = ? AND mv.value = ?)",
            );
            params.push(field.clone());
            params.push(value.clone());
        }
        FilterExpr::DateRange { from, until } => match until {
            Some(until) => {
                out.push_str("(items.last_modified >= ? AND items.last_modified < ?)");
                params.push(format_ts(from));
                params.push(format_ts(until));
            }
            None => {
                out.push_str("items.last_modified >= ?");
                params.push(format_ts(from));
            }
        },
        FilterExpr::And(children) => write_sql_group(filter, children, " AND ", schema, out, params)?,
        FilterExpr::Or(children) => write_sql_group(filter, children, " OR ", schema, out, params)?,
        FilterExpr::Not(child) => {
            out.push_str("NOT (");
            write_sql(filter, child, schema, out, params)?;
            out.push(')');
        }
    }
    Ok(())
}

fn write_sql_group(
    filter: &str,
    children: &[FilterExpr],
    op: &str,
    schema: &Schema,
    out: &mut String,
    params: &mut Vec<String>,
) -> Result<(), ConfigError> {
    if children.is_empty() {
        return Err(ConfigError::EmptyParameters {
            filter: filter.to_string(),
        });
    }
    out.push('(');
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            out.push_str(op);
        }
        write_sql(filter, child, schema, out, params)?;
    }
    out.push(')');
    Ok(())
}

pub fn to_search_query(
    filter: &str,
    expr: &FilterExpr,
    schema: &Schema,
) -> Result<String, ConfigError> {
    let mut out = String::new();
    write_query(filter, expr, schema, &mut out)?;
    Ok(out)
}

fn write_query(
    filter: &str,
    expr: &FilterExpr,
    schema: &Schema,
    out: &mut String,
) -> Result<(), ConfigError> {
    match expr {
        FilterExpr::Exists(field) => {
            schema.resolve(filter, field)?;
            out.push_str(&escape_query_chars(field));
            out.push_str(":[* TO *]");
        }
        FilterExpr::ValueMatch { field, value } => {
            schema.resolve(filter, field)?;
            out.push_str(&escape_query_chars(field));
            out.push(':');
            out.push_str(&escape_query_chars(value));
        }
        FilterExpr::DateRange { from, until } => {
            out.push_str(LAST_MODIFIED_FIELD);
            out.push_str(":[");
            out.push_str(&format_ts(from));
            out.push_str(" TO ");
            match until {
                // Exclusive upper bound
                Some(until) => {
                    out.push_str(&format_ts(until));
                    out.push('}');
                }
                None => out.push_str("*]"),
            }
        }
        FilterExpr::And(children) => write_query_group(filter, children, " AND ", schema, out)?,
        FilterExpr::Or(children) => write_query_group(filter, children, " OR ", schema, out)?,
        FilterExpr::Not(child) => {
            // A purely negative clause matches nothing in Solr; anchor it.
            out.push_str("(*:* AND NOT ");
            write_query(filter, child, schema, out)?;
            out.push(')');
        }
    }
    Ok(())
}

fn write_query_group(
    filter: &str,
    children: &[FilterExpr],
    op: &str,
    schema: &Schema,
    out: &mut String,
) -> Result<(), ConfigError> {
    if children.is_empty() {
        return Err(ConfigError::EmptyParameters {
            filter: filter.to_string(),
        });
    }
    out.push('(');
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            out.push_str(op);
        }
        write_query(filter, child, schema, out)?;
    }
    out.push(')');
    Ok(())
}

/// Backslash-escape Solr query syntax characters and whitespace.
pub fn escape_query_chars(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if is_reserved(c) || c.is_whitespace() {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub(crate) fn is_reserved(c: char) -> bool {
    matches!(
        c,
        '\\' | '+'
            | '-'
            | '!'
            | '('
            | ')'
            | ':'
            | '^'
            | '['
            | ']'
            | '"'
            | '{'
            | '}'
            | '~'
            | '*'
            | '?'
            | '|'
            | '&'
            | ';'
            | '/'
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;

    fn p(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn schema() -> Schema {
        Schema::new(["dc.title", "dc.type", "dc.subject"])
    }

    #[test]
    fn exists_translations() {
        let f = Filter::exists("t", &p(&["dc.title"])).unwrap();
        let pred = f.to_storage_predicate(&schema()).unwrap();
        assert_eq!(
            pred.template,
            "EXISTS (SELECT 1 FROM metadata_values mv WHERE mv.item_id = items.id AND mv.field = ?)"
        );
        assert_eq!(pred.params, vec!["dc.title"]);
        assert_eq!(f.to_search_query(&schema()).unwrap(), "dc.title:[* TO *]");
    }

    #[test]
    fn placeholders_match_bindings_in_order() {
        let a = Filter::value_match("a", &p(&["dc.type", "Article"])).unwrap();
        let b = Filter::date_range("b", &p(&["2024-01-01", "2024-06-01"])).unwrap();
        let c = Filter::exists("c", &p(&["dc.subject"])).unwrap();
        let nc = Filter::not("nc", &p(&["c"]), vec![c]).unwrap();
        let all = Filter::and("all", &p(&["a", "b", "nc"]), vec![a, b, nc]).unwrap();

        let pred = all.to_storage_predicate(&schema()).unwrap();
        assert_eq!(pred.placeholder_count(), pred.params.len());
        assert_eq!(
            pred.params,
            vec![
                "dc.type",
                "Article",
                "2024-01-01T00:00:00Z",
                "2024-06-01T00:00:00Z",
                "dc.subject"
            ]
        );
        assert!(pred.template.starts_with("(EXISTS"));
        assert!(pred.template.contains(" AND NOT (EXISTS"));
    }

    #[test]
    fn storage_predicate_is_idempotent() {
        let a = Filter::exists("a", &p(&["dc.title", "dc.subject"])).unwrap();
        let first = a.to_storage_predicate(&schema()).unwrap();
        let second = a.to_storage_predicate(&schema()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn search_query_escapes_literals() {
        let f = Filter::value_match("v", &p(&["dc.subject", "physics: \"quantum\" [x]"])).unwrap();
        assert_eq!(
            f.to_search_query(&schema()).unwrap(),
            r#"dc.subject:physics\:\ \"quantum\"\ \[x\]"#
        );
    }

    #[test]
    fn search_query_date_ranges() {
        let open = Filter::date_range("d", &p(&["2024-01-01T10:00:00+02:00"])).unwrap();
        assert_eq!(
            open.to_search_query(&schema()).unwrap(),
            "lastModified:[2024-01-01T08:00:00Z TO *]"
        );
        let closed = Filter::date_range("d", &p(&["2024-01-01", "2024-02-01"])).unwrap();
        assert_eq!(
            closed.to_search_query(&schema()).unwrap(),
            "lastModified:[2024-01-01T00:00:00Z TO 2024-02-01T00:00:00Z}"
        );
    }

    #[test]
    fn search_query_combinators() {
        let a = Filter::exists("a", &p(&["dc.title"])).unwrap();
        let b = Filter::value_match("b", &p(&["dc.type", "Book"])).unwrap();
        let nb = Filter::not("nb", &p(&["b"]), vec![b]).unwrap();
        let f = Filter::or("f", &p(&["a", "nb"]), vec![a, nb]).unwrap();
        assert_eq!(
            f.to_search_query(&schema()).unwrap(),
            "(dc.title:[* TO *] OR (*:* AND NOT dc.type:Book))"
        );
    }

    #[test]
    fn unknown_field_fails_translation() {
        let f = Filter::exists("f", &p(&["dc.nonexistent"])).unwrap();
        assert_eq!(
            f.to_storage_predicate(&schema()),
            Err(ConfigError::UnknownField {
                filter: "f".into(),
                field: "dc.nonexistent".into()
            })
        );
        assert!(f.to_search_query(&schema()).is_err());
    }

    #[test]
    fn escape_covers_reserved_set() {
        assert_eq!(escape_query_chars("a+b-c"), r"a\+b\-c");
        assert_eq!(escape_query_chars("x/y?z*"), r"x\/y\?z\*");
        assert_eq!(escape_query_chars("plain"), "plain");
    }
}
