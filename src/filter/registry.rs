//! Filter kind registry.
//!
//! Filter kinds are registered at startup as `kind -> constructor`
//! entries. [`FilterRegistry::build`] then turns the `[filters.<name>]`
//! tables from the config into a [`FilterSet`], resolving references
//! between composite filters and checking every metadata field against
//! the schema. Any problem is reported before a single item is looked at.
//!
//! ```toml
//! [filters.has_title]
//! kind = "exists"
//! params = ["dc.title"]
//!
//! [filters.recent]
//! kind = "date-range"
//! params = ["2020-01-01"]
//!
//! [filters.exposed]
//! kind = "and"
//! params = ["has_title", "recent"]
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::config::FilterConfig;
use crate::error::ConfigError;

use super::{Filter, Schema};

/// Builds a filter from its id, parameters and (for composites) the
/// already-resolved filters its parameters name.
pub type Constructor = fn(&str, &[String], Vec<Filter>) -> Result<Filter, ConfigError>;

#[derive(Clone, Copy)]
struct KindEntry {
    constructor: Constructor,
    /// Parameters are names of other filters rather than literals.
    composite: bool,
}

pub struct FilterRegistry {
    kinds: HashMap<String, KindEntry>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    /// Registry with every built-in kind.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("exists", false, |id, params, _| Filter::exists(id, params));
        registry.register("value", false, |id, params, _| Filter::value_match(id, params));
        registry.register("date-range", false, |id, params, _| {
            Filter::date_range(id, params)
        });
        registry.register("and", true, Filter::and);
        registry.register("or", true, Filter::or);
        registry.register("not", true, Filter::not);
        registry
    }

    /// Register a kind. Later registrations replace earlier ones.
    pub fn register(&mut self, kind: &str, composite: bool, constructor: Constructor) {
        self.kinds.insert(
            kind.to_string(),
            KindEntry {
                constructor,
                composite,
            },
        );
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Construct every configured filter and validate it against `schema`.
    pub fn build(
        &self,
        defs: &BTreeMap<String, FilterConfig>,
        schema: &Schema,
    ) -> Result<FilterSet, ConfigError> {
        let mut resolver = Resolver {
            registry: self,
            defs,
            built: HashMap::new(),
            visiting: HashSet::new(),
        };
        for name in defs.keys() {
            resolver.resolve(name)?;
        }

        let mut filters = BTreeMap::new();
        for name in defs.keys() {
            let Some(filter) = resolver.built.remove(name) else {
                continue;
            };
            // Translating up front surfaces unknown fields now.
            filter.to_storage_predicate(schema)?;
            filter.to_search_query(schema)?;
            filters.insert(name.clone(), Arc::new(filter));
        }
        Ok(FilterSet { filters })
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

struct Resolver<'a> {
    registry: &'a FilterRegistry,
    defs: &'a BTreeMap<String, FilterConfig>,
    built: HashMap<String, Filter>,
    visiting: HashSet<String>,
}

impl Resolver<'_> {
    fn resolve(&mut self, name: &str) -> Result<Filter, ConfigError> {
        if let Some(filter) = self.built.get(name) {
            return Ok(filter.clone());
        }
        if !self.visiting.insert(name.to_string()) {
            return Err(ConfigError::Cycle {
                filter: name.to_string(),
            });
        }

        let defs = self.defs;
        let def = &defs[name];
        let entry = *self
            .registry
            .kinds
            .get(&def.kind)
            .ok_or_else(|| ConfigError::UnknownKind {
                filter: name.to_string(),
                kind: def.kind.clone(),
            })?;

        let mut children = Vec::new();
        if entry.composite {
            for reference in &def.params {
                if !defs.contains_key(reference) {
                    return Err(ConfigError::UnknownFilter {
                        filter: name.to_string(),
                        reference: reference.clone(),
                    });
                }
                children.push(self.resolve(reference)?);
            }
        }

        let filter = (entry.constructor)(name, &def.params, children)?;
        self.visiting.remove(name);
        self.built.insert(name.to_string(), filter.clone());
        Ok(filter)
    }
}

/// The validated filters from the config, by name.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    filters: BTreeMap<String, Arc<Filter>>,
}

impl FilterSet {
    pub fn get(&self, name: &str) -> Option<Arc<Filter>> {
        self.filters.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(kind: &str, params: &[&str]) -> FilterConfig {
        FilterConfig {
            kind: kind.to_string(),
            params: params.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn schema() -> Schema {
        Schema::new(["dc.title", "dc.type"])
    }

    #[test]
    fn builds_composites_in_any_order() {
        let mut defs = BTreeMap::new();
        defs.insert("a_exposed".to_string(), def("and", &["z_title", "m_recent"]));
        defs.insert("z_title".to_string(), def("exists", &["dc.title"]));
        defs.insert("m_recent".to_string(), def("date-range", &["2024-01-01"]));

        let set = FilterRegistry::builtin().build(&defs, &schema()).unwrap();
        assert_eq!(set.len(), 3);
        let exposed = set.get("a_exposed").unwrap();
        assert_eq!(exposed.id(), "a_exposed");
        assert_eq!(exposed.params(), &["z_title", "m_recent"]);
    }

    #[test]
    fn unknown_kind() {
        let mut defs = BTreeMap::new();
        defs.insert("x".to_string(), def("regex", &["dc.title"]));
        assert!(matches!(
            FilterRegistry::builtin().build(&defs, &schema()),
            Err(ConfigError::UnknownKind { .. })
        ));
    }

    #[test]
    fn unknown_reference() {
        let mut defs = BTreeMap::new();
        defs.insert("x".to_string(), def("or", &["missing"]));
        assert!(matches!(
            FilterRegistry::builtin().build(&defs, &schema()),
            Err(ConfigError::UnknownFilter { .. })
        ));
    }

    #[test]
    fn reference_cycle() {
        let mut defs = BTreeMap::new();
        defs.insert("a".to_string(), def("not", &["b"]));
        defs.insert("b".to_string(), def("not", &["a"]));
        assert!(matches!(
            FilterRegistry::builtin().build(&defs, &schema()),
            Err(ConfigError::Cycle { .. })
        ));
    }

    #[test]
    fn empty_params_fail_at_build() {
        let mut defs = BTreeMap::new();
        defs.insert("a".to_string(), def("exists", &[]));
        assert!(matches!(
            FilterRegistry::builtin().build(&defs, &schema()),
            Err(ConfigError::EmptyParameters { .. })
        ));
    }

    #[test]
    fn unknown_field_fails_at_build() {
        let mut defs = BTreeMap::new();
        defs.insert("a".to_string(), def("exists", &["dc.nope"]));
        assert!(matches!(
            FilterRegistry::builtin().build(&defs, &schema()),
            Err(ConfigError::UnknownField { .. })
        ));
    }

    #[test]
    fn first_broken_filter_by_name_is_reported() {
        let mut defs = BTreeMap::new();
        defs.insert("b_bad".to_string(), def("exists", &["dc.aaa"]));
        defs.insert("a_bad".to_string(), def("exists", &["dc.zzz"]));
        defs.insert("c_bad".to_string(), def("value", &["dc.mmm", "x"]));
        for _ in 0..20 {
            let err = FilterRegistry::builtin()
                .build(&defs, &schema())
                .unwrap_err();
            assert_eq!(
                err,
                ConfigError::UnknownField {
                    filter: "a_bad".to_string(),
                    field: "dc.zzz".to_string(),
                }
            );
        }
    }

    #[test]
    fn custom_kind_registration() {
        let mut registry = FilterRegistry::builtin();
        registry.register("has-title", false, |id, _, _| {
            Filter::exists(id, &["dc.title".to_string()])
        });
        assert!(registry.kinds().contains(&"has-title"));

        let mut defs = BTreeMap::new();
        defs.insert("t".to_string(), def("has-title", &["unused"]));
        let set = registry.build(&defs, &schema()).unwrap();
        assert!(set.get("t").is_some());
    }
}
