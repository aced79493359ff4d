//! The three renditions of every filter (in-memory evaluation, SQL
//! predicate, search query) must select exactly the same items.

use chrono::{DateTime, TimeZone, Utc};
use oai_harvest::config::{Config, FilterConfig};
use oai_harvest::exposure;
use oai_harvest::index::{IndexDocument, MemoryIndex, SearchIndex};
use oai_harvest::models::{Item, MetadataValue};
use oai_harvest::{db, migrate, store};
use tempfile::TempDir;

fn ts(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 9, 30, 0).unwrap()
}

fn item(id: &str, modified: DateTime<Utc>, values: &[(&str, &str)]) -> Item {
    Item {
        id: id.to_string(),
        collection_id: "col".to_string(),
        handle: None,
        last_modified: modified,
        metadata: values
            .iter()
            .map(|(f, v)| MetadataValue::new(*f, *v))
            .collect(),
    }
}

fn corpus() -> Vec<Item> {
    vec![
        item(
            "item-01",
            ts(2024, 1, 15),
            &[("dc.title", "Quantum Widgets"), ("dc.type", "Article")],
        ),
        item(
            "item-02",
            ts(2024, 2, 29),
            &[("dc.title", "Dark Matter"), ("dc.type", "Book"), ("dc.creator", "Rubin, V.")],
        ),
        item("item-03", ts(2024, 3, 1), &[("dc.type", "Thesis")]),
        item(
            "item-04",
            ts(2024, 4, 1),
            &[("dc.title", "C++: (a) [b] \"quoted\" AND/OR"), ("dc.subject", "syntax")],
        ),
        item("item-05", ts(2023, 12, 31), &[]),
        item(
            "item-06",
            ts(2024, 6, 1),
            &[
                ("dc.title", "Two Types"),
                ("dc.type", "Article"),
                ("dc.type", "Book"),
            ],
        ),
        item(
            "item-07",
            ts(2024, 3, 31),
            &[("dc.title", "article"), ("dc.type", "article")],
        ),
        item(
            "item-08",
            ts(2025, 1, 1),
            &[("dc.subject", "Quantum Widgets"), ("dc.type", "Other")],
        ),
        // An empty value still counts as having the field.
        item("item-09", ts(2023, 6, 1), &[("dc.title", ""), ("dc.subject", "")]),
    ]
}

fn filter(kind: &str, params: &[&str]) -> FilterConfig {
    FilterConfig {
        kind: kind.to_string(),
        params: params.iter().map(|p| p.to_string()).collect(),
    }
}

fn config(tmp: &TempDir) -> Config {
    let mut config = Config::minimal(tmp.path().join("oaih.sqlite"));
    let filters = [
        ("has_title", filter("exists", &["dc.title"])),
        ("has_author_or_subject", filter("exists", &["dc.creator", "dc.subject"])),
        ("is_article", filter("value", &["dc.type", "Article"])),
        ("is_book_or_thesis", filter("value", &["dc.type", "Book", "Thesis"])),
        ("spaced_title", filter("value", &["dc.title", "Quantum Widgets"])),
        (
            "reserved_title",
            filter("value", &["dc.title", "C++: (a) [b] \"quoted\" AND/OR"]),
        ),
        ("since_march", filter("date-range", &["2024-03-01"])),
        ("first_quarter", filter("date-range", &["2024-01-01", "2024-04-01"])),
        ("not_article", filter("not", &["is_article"])),
        ("titled_articles", filter("and", &["has_title", "is_article"])),
        ("recent_or_long", filter("or", &["since_march", "is_book_or_thesis"])),
        (
            "nested",
            filter("and", &["has_title", "not_article", "recent_or_long"]),
        ),
        ("nothing_recent", filter("not", &["since_march"])),
    ];
    for (name, def) in filters {
        config.filters.insert(name.to_string(), def);
    }
    config
}

#[tokio::test]
async fn test_all_renditions_agree() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);
    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();

    let items = corpus();
    let index = MemoryIndex::new();
    {
        let mut conn = pool.acquire().await.unwrap();
        for item in &items {
            store::insert_item(&mut conn, item).await.unwrap();
            index.submit(IndexDocument::from_item(item)).await.unwrap();
        }
    }
    index.commit().await.unwrap();

    let filters = exposure::load_filters(&config).unwrap();
    let schema = exposure::schema(&config);
    assert_eq!(filters.len(), config.filters.len());

    for name in filters.names() {
        let f = filters.get(name).unwrap();
        let evaluated: Vec<String> = items
            .iter()
            .filter(|i| f.evaluate(i))
            .map(|i| i.id.clone())
            .collect();
        let stored = exposure::matching_item_ids(&pool, &f, &schema).await.unwrap();
        let searched = exposure::search_item_ids(&index, &f, &schema, 100)
            .await
            .unwrap();

        assert_eq!(stored, evaluated, "storage predicate disagrees for {}", name);
        assert_eq!(searched, evaluated, "search query disagrees for {}", name);
    }
}

#[tokio::test]
async fn test_expected_selections() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);
    let filters = exposure::load_filters(&config).unwrap();
    let items = corpus();

    let select = |name: &str| -> Vec<&str> {
        let f = filters.get(name).unwrap();
        items
            .iter()
            .filter(|i| f.evaluate(i))
            .map(|i| i.id.as_str())
            .collect()
    };

    assert_eq!(
        select("has_title"),
        vec!["item-01", "item-02", "item-04", "item-06", "item-07", "item-09"]
    );
    // Exact, case-sensitive match on any value of the field
    assert_eq!(select("is_article"), vec!["item-01", "item-06"]);
    assert_eq!(select("spaced_title"), vec!["item-01"]);
    assert_eq!(select("reserved_title"), vec!["item-04"]);
    // Lower bound inclusive, upper bound exclusive
    assert_eq!(
        select("first_quarter"),
        vec!["item-01", "item-02", "item-03", "item-07"]
    );
    assert_eq!(
        select("since_march"),
        vec!["item-03", "item-04", "item-06", "item-07", "item-08"]
    );
    // Items without the field pass a negated value match
    assert_eq!(
        select("not_article"),
        vec!["item-02", "item-03", "item-04", "item-05", "item-07", "item-08", "item-09"]
    );
    assert_eq!(select("nested"), vec!["item-02", "item-04", "item-07"]);
}

#[test]
fn test_translation_is_deterministic() {
    let tmp = TempDir::new().unwrap();
    let config = config(&tmp);
    let filters = exposure::load_filters(&config).unwrap();
    let schema = exposure::schema(&config);

    for name in filters.names() {
        let f = filters.get(name).unwrap();
        let first = f.to_storage_predicate(&schema).unwrap();
        let second = f.to_storage_predicate(&schema).unwrap();
        assert_eq!(first, second, "{}", name);
        assert_eq!(first.placeholder_count(), first.params.len(), "{}", name);
        assert_eq!(
            f.to_search_query(&schema).unwrap(),
            f.to_search_query(&schema).unwrap(),
            "{}",
            name
        );
    }
}

#[test]
fn test_unknown_field_is_rejected_at_load() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(&tmp);
    config
        .filters
        .insert("bogus".to_string(), filter("exists", &["dc.nonsense"]));
    let err = exposure::load_filters(&config).unwrap_err();
    assert!(format!("{:#}", err).contains("dc.nonsense"));
}

#[test]
fn test_reference_cycle_is_rejected_at_load() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::minimal(tmp.path().join("oaih.sqlite"));
    config.filters.insert("a".to_string(), filter("not", &["b"]));
    config.filters.insert("b".to_string(), filter("not", &["a"]));
    let err = exposure::load_filters(&config).unwrap_err();
    assert!(format!("{:#}", err).contains("cycle"));
}
