use std::collections::BTreeMap;
use std::path::Path;
use std::thread;

use roaring::RoaringTreemap;

use docshred::backend::Backend;
use docshred::config::{DialectKind, StoreConfig};
use docshred::datatype::FieldType;
use docshred::document::{Document, Value};
use docshred::error::DocShredError;
use docshred::meta::{IndexOrdering, MetaIndexField};
use docshred::reference::TableRef;
use docshred::rid::RidBlock;

fn doc(json: &str) -> Document {
    Document::from_json_str(json).expect("json")
}

fn dids(values: &[u64]) -> RoaringTreemap {
    values.iter().copied().collect()
}

fn people() -> Vec<(u64, Document)> {
    vec![
        (1, doc(r#"{"name": "Alice", "age": 31, "tags": ["a", "b"], "address": {"city": "Oslo"}}"#)),
        (2, doc(r#"{"name": "Bob", "tags": [], "pets": [{"kind": "cat", "names": [["Tom"], []]}]}"#)),
        (3, doc(r#"{"name": "Carol", "age": 5000000000, "address": {"city": "Bergen", "zip": null}}"#)),
    ]
}

fn index_names(path: &Path) -> Vec<String> {
    let connection = rusqlite::Connection::open(path).expect("open");
    let mut statement = connection
        .prepare("SELECT name FROM sqlite_schema WHERE type = 'index'")
        .expect("prepare");
    statement
        .query_map([], |row| row.get::<_, String>(0))
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("rows")
}

#[test]
fn inserted_documents_read_back_equal() {
    let backend = Backend::open_in_memory().expect("db");
    let documents = people();
    let rows = backend.insert_documents("shop", "people", &documents).expect("insert");
    // 3 root rows, 2 tags, 2 addresses, 1 pet, 2 name arrays, 1 name
    assert_eq!(rows, 11);
    let read = backend.read_documents("shop", "people", &dids(&[1, 2, 3, 4])).expect("read");
    let expected: BTreeMap<u64, Document> = documents.into_iter().collect();
    assert_eq!(read, expected);
}

#[test]
fn non_finite_doubles_survive_storage() {
    let backend = Backend::open_in_memory().expect("db");
    let document = Document::new()
        .with("x", Value::Double(f64::NAN))
        .with("up", Value::Double(f64::INFINITY))
        .with("down", Value::Array(vec![Value::Double(f64::NEG_INFINITY), Value::Double(f64::NAN)]))
        .with("y", Value::Integer(1));
    backend.insert_documents("shop", "odd", &[(1, document.clone())]).expect("insert");
    let read = backend.read_documents("shop", "odd", &dids(&[1])).expect("read");
    let stored = read.get(&1).expect("document");
    assert!(matches!(stored.get("x"), Some(Value::Double(d)) if d.is_nan()));
    assert_eq!(stored, &document);
    let found = backend
        .with_read_retry(|transaction| {
            transaction.find_dids_by_field_eq("shop", "odd", &TableRef::root(), "x", &Value::Double(f64::NAN))
        })
        .expect("lookup");
    assert_eq!(found, dids(&[1]));
    // printed as extended JSON and parsed back
    assert_eq!(Document::from_json_str(&stored.to_json().to_string()).expect("json"), document);
}

#[test]
fn unknown_collections_read_as_empty() {
    let backend = Backend::open_in_memory().expect("db");
    let read = backend.read_documents("nowhere", "nothing", &dids(&[1])).expect("read");
    assert!(read.is_empty());
    let count = backend
        .with_read_retry(|transaction| transaction.count_documents("nowhere", "nothing"))
        .expect("count");
    assert_eq!(count, 0);
}

#[test]
fn metadata_grows_with_new_fields() {
    let backend = Backend::open_in_memory().expect("db");
    backend.insert_documents("shop", "c", &[(1, doc(r#"{"a": 1}"#))]).expect("insert");
    backend
        .insert_documents("shop", "c", &[(2, doc(r#"{"a": "one", "b": [true]}"#))])
        .expect("insert");
    let snapshot = backend.snapshot().expect("snapshot");
    let collection = snapshot.collection("shop", "c").expect("collection");
    let root = collection.doc_part(&TableRef::root()).expect("root");
    assert_eq!(root.field("a", FieldType::Integer).map(|f| f.identifier()), Some("a_i"));
    assert_eq!(root.field("a", FieldType::String).map(|f| f.identifier()), Some("a_s"));
    let b = collection.doc_part(&TableRef::root().child("b")).expect("b");
    assert_eq!(b.scalar(FieldType::Boolean).map(|s| s.identifier()), Some("v_b"));
    let read = backend.read_documents("shop", "c", &dids(&[1, 2])).expect("read");
    assert_eq!(read.get(&1), Some(&doc(r#"{"a": 1}"#)));
    assert_eq!(read.get(&2), Some(&doc(r#"{"a": "one", "b": [true]}"#)));
}

#[test]
fn deleting_leaves_other_documents_intact() {
    let backend = Backend::open_in_memory().expect("db");
    let documents = people();
    backend.insert_documents("shop", "people", &documents).expect("insert");
    let deleted = backend.delete_documents("shop", "people", &dids(&[2, 9])).expect("delete");
    assert_eq!(deleted, 1);
    let read = backend.read_documents("shop", "people", &dids(&[1, 2, 3])).expect("read");
    assert_eq!(read.keys().copied().collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(read.get(&1), Some(&documents[0].1));
    let (count, listed) = backend
        .with_read_retry(|transaction| {
            Ok((
                transaction.count_documents("shop", "people")?,
                transaction.list_dids("shop", "people")?,
            ))
        })
        .expect("count");
    assert_eq!(count, 2);
    assert_eq!(listed, dids(&[1, 3]));
    // the did can be used again once its rows are gone
    backend
        .insert_documents("shop", "people", &[(2, doc(r#"{"name": "Bea", "pets": []}"#))])
        .expect("insert again");
    let read = backend.read_documents("shop", "people", &dids(&[2])).expect("read");
    assert_eq!(read.get(&2), Some(&doc(r#"{"name": "Bea", "pets": []}"#)));
}

#[test]
fn duplicate_dids_are_rejected() {
    let backend = Backend::open_in_memory().expect("db");
    backend.insert_documents("shop", "c", &[(1, doc(r#"{"a": 1}"#))]).expect("insert");
    let failure = backend.insert_documents("shop", "c", &[(1, doc(r#"{"a": 2}"#))]);
    match failure {
        Err(e) => {
            assert!(!e.is_rollback());
            assert_eq!(e.code(), Some("SQLITE_CONSTRAINT_PRIMARYKEY"));
        }
        Ok(_) => panic!("a second root row for did 1 was accepted"),
    }
    let read = backend.read_documents("shop", "c", &dids(&[1])).expect("read");
    assert_eq!(read.get(&1), Some(&doc(r#"{"a": 1}"#)));
}

#[test]
fn lookups_find_matching_documents() {
    let backend = Backend::open_in_memory().expect("db");
    backend.insert_documents("shop", "people", &people()).expect("insert");
    let (by_name, by_city, by_age, missing) = backend
        .with_read_retry(|transaction| {
            let root = TableRef::root();
            let by_name = transaction.find_dids_by_field_eq(
                "shop",
                "people",
                &root,
                "name",
                &Value::String(String::from("Bob")),
            )?;
            let by_city = transaction.find_dids_by_field_in(
                "shop",
                "people",
                &root.child("address"),
                "city",
                &[Value::String(String::from("Oslo")), Value::String(String::from("Bergen"))],
            )?;
            // each type lives in its own column
            let by_age = transaction.find_dids_by_field_in(
                "shop",
                "people",
                &root,
                "age",
                &[Value::Integer(31), Value::Long(5_000_000_000)],
            )?;
            let missing = transaction.find_dids_by_field_eq("shop", "people", &root, "nope", &Value::Integer(1))?;
            Ok((by_name, by_city, by_age, missing))
        })
        .expect("lookup");
    assert_eq!(by_name, dids(&[2]));
    assert_eq!(by_city, dids(&[1, 3]));
    assert_eq!(by_age, dids(&[1, 3]));
    assert!(missing.is_empty());
}

#[test]
fn renaming_keeps_counters_and_drops_the_old_name() {
    let backend = Backend::open_in_memory().expect("db");
    let documents = people();
    backend.insert_documents("a", "x", &documents).expect("insert");
    let tags = TableRef::root().child("tags");
    let before = backend
        .snapshot()
        .expect("snapshot")
        .collection("a", "x")
        .and_then(|collection| collection.doc_part(&tags))
        .map(|doc_part| doc_part.last_rid())
        .expect("tags");
    assert_eq!(before, 2);

    backend.rename_collection("a", "x", "b", "y").expect("rename");
    let snapshot = backend.snapshot().expect("snapshot");
    assert!(snapshot.collection("a", "x").is_none());
    let renamed = snapshot.collection("b", "y").expect("renamed");
    assert_eq!(renamed.doc_part(&tags).map(|doc_part| doc_part.last_rid()), Some(before));
    assert_eq!(renamed.doc_part(&TableRef::root()).map(|doc_part| doc_part.identifier()), Some("y"));

    let read = backend.read_documents("b", "y", &dids(&[1, 2, 3])).expect("read");
    let expected: BTreeMap<u64, Document> = documents.into_iter().collect();
    assert_eq!(read, expected);
    assert!(backend.read_documents("a", "x", &dids(&[1])).expect("read").is_empty());

    // new rows continue after the moved counter
    backend
        .insert_documents("b", "y", &[(4, doc(r#"{"tags": ["c"]}"#))])
        .expect("insert");
    let snapshot = backend.snapshot().expect("snapshot");
    let after = snapshot
        .collection("b", "y")
        .and_then(|collection| collection.doc_part(&tags))
        .map(|doc_part| doc_part.last_rid());
    assert_eq!(after, Some(before + 1));
    // the old name is free again
    backend.insert_documents("a", "x", &[(1, doc(r#"{"tags": ["z"]}"#))]).expect("reuse");
}

#[test]
fn indexes_follow_new_fields() {
    let backend = Backend::open_in_memory().expect("db");
    backend.insert_documents("shop", "people", &people()).expect("insert");
    let field = MetaIndexField::new(TableRef::root(), "name", IndexOrdering::Ascending);
    backend
        .create_index("shop", "people", "by_name", false, &[field])
        .expect("create index");
    let count_indexes = || {
        backend
            .snapshot()
            .expect("snapshot")
            .collection("shop", "people")
            .and_then(|collection| collection.doc_part(&TableRef::root()))
            .map(|root| root.indexes().len())
            .unwrap_or_default()
    };
    assert_eq!(count_indexes(), 1);
    // an integer name adds a column and an index over it
    backend
        .insert_documents("shop", "people", &[(4, doc(r#"{"name": 4}"#))])
        .expect("insert");
    assert_eq!(count_indexes(), 2);

    backend.drop_index("shop", "people", "by_name").expect("drop index");
    assert_eq!(count_indexes(), 0);
    let snapshot = backend.snapshot().expect("snapshot");
    assert!(snapshot.collection("shop", "people").and_then(|c| c.index("by_name")).is_none());
}

#[test]
fn unique_indexes_reject_duplicates() {
    let backend = Backend::open_in_memory().expect("db");
    let field = MetaIndexField::new(TableRef::root(), "email", IndexOrdering::Ascending);
    // created before any document has the field
    backend
        .create_index("shop", "users", "by_email", true, &[field])
        .expect("create index");
    backend
        .insert_documents("shop", "users", &[(1, doc(r#"{"email": "a@example.org"}"#))])
        .expect("insert");
    let failure = backend.insert_documents("shop", "users", &[(2, doc(r#"{"email": "a@example.org"}"#))]);
    match failure {
        Err(e) => assert_eq!(e.code(), Some("SQLITE_CONSTRAINT_UNIQUE")),
        Ok(_) => panic!("duplicate email accepted"),
    }
    let count = backend
        .with_read_retry(|transaction| transaction.count_documents("shop", "users"))
        .expect("count");
    assert_eq!(count, 1);
}

#[test]
fn dropping_removes_metadata_and_data() {
    let backend = Backend::open_in_memory().expect("db");
    backend.insert_documents("shop", "people", &people()).expect("insert");
    backend.insert_documents("shop", "orders", &[(1, doc(r#"{"n": 1}"#))]).expect("insert");
    backend.drop_collection("shop", "people").expect("drop collection");
    let snapshot = backend.snapshot().expect("snapshot");
    assert!(snapshot.collection("shop", "people").is_none());
    assert!(snapshot.collection("shop", "orders").is_some());

    backend.drop_database("shop").expect("drop database");
    assert!(backend.snapshot().expect("snapshot").database("shop").is_none());
    assert!(matches!(
        backend.drop_database("shop"),
        Err(DocShredError::UnknownDatabase(_))
    ));
    // everything can be created again under the same names
    backend.insert_documents("shop", "people", &people()).expect("insert again");
    let read = backend.read_documents("shop", "people", &dids(&[1])).expect("read");
    assert_eq!(read.len(), 1);
}

#[test]
fn consumed_rids_never_repeat() {
    let backend = Backend::open_in_memory().expect("db");
    backend.insert_documents("shop", "people", &people()).expect("insert");
    let tags = TableRef::root().child("tags");
    let (first, second) = backend
        .with_write_retry(|transaction| {
            let first = transaction.consume_rids("shop", "people", &tags, 5)?;
            let second = transaction.consume_rids("shop", "people", &tags, 3)?;
            Ok((first, second))
        })
        .expect("consume");
    assert_eq!(first.first(), 2);
    assert_eq!(second.first(), first.end());
    let last_rid = backend
        .snapshot()
        .expect("snapshot")
        .collection("shop", "people")
        .and_then(|collection| collection.doc_part(&tags))
        .map(|doc_part| doc_part.last_rid());
    assert_eq!(last_rid, Some(second.end()));
}

#[test]
fn concurrent_writers_get_disjoint_rids() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("store.db");
    Backend::open_path(&path)
        .expect("db")
        .insert_documents("shop", "people", &people())
        .expect("insert");
    let tags = TableRef::root().child("tags");
    let blocks: Vec<RidBlock> = thread::scope(|scope| {
        let writers: Vec<_> = (0..4u64)
            .map(|writer| {
                let path = &path;
                let tags = &tags;
                scope.spawn(move || {
                    let backend = Backend::open_path(path).expect("db");
                    (0..30u64)
                        .map(|round| {
                            let count = 1 + (writer + round) % 5;
                            backend
                                .with_write_retry(|transaction| transaction.consume_rids("shop", "people", tags, count))
                                .expect("consume")
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        writers
            .into_iter()
            .flat_map(|writer| writer.join().expect("writer"))
            .collect()
    });
    let issued: u64 = blocks.iter().map(|block| block.len()).sum();
    let mut seen = RoaringTreemap::new();
    for block in &blocks {
        for rid in block.iter() {
            assert!(seen.insert(rid), "rid {} handed out twice", rid);
        }
    }
    assert_eq!(seen.len(), issued);
    // the two tags of the first insert came before every block
    assert_eq!(seen.min(), Some(2));
}

#[test]
fn renaming_picks_up_rids_consumed_by_other_stores() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("store.db");
    let first = Backend::open_path(&path).expect("db");
    let second = Backend::open_path(&path).expect("db");
    first.insert_documents("d", "c1", &[(1, doc(r#"{"t": [1, 2]}"#))]).expect("insert");
    assert_eq!(second.read_documents("d", "c1", &dids(&[1])).expect("read").len(), 1);
    // consuming rids leaves the metadata version alone
    first.insert_documents("d", "c1", &[(2, doc(r#"{"t": [3, 4]}"#))]).expect("insert");

    second.rename_collection("d", "c1", "d", "c2").expect("rename");
    second.insert_documents("d", "c2", &[(3, doc(r#"{"t": [5, 6]}"#))]).expect("insert after rename");
    let read = second.read_documents("d", "c2", &dids(&[1, 2, 3])).expect("read");
    assert_eq!(read.len(), 3);
    assert_eq!(read.get(&3), Some(&doc(r#"{"t": [5, 6]}"#)));
    let last_rid = second
        .snapshot()
        .expect("snapshot")
        .collection("d", "c2")
        .and_then(|collection| collection.doc_part(&TableRef::root().child("t")))
        .map(|doc_part| doc_part.last_rid());
    assert_eq!(last_rid, Some(6));
}

#[test]
fn rolled_back_transactions_leave_no_trace() {
    let backend = Backend::open_in_memory().expect("db");
    let mut transaction = backend.begin_write().expect("begin");
    let document = doc(r#"{"a": {"b": 1}}"#);
    transaction.insert("shop", "c", [(1, &document)]).expect("insert");
    transaction.rollback().expect("rollback");
    assert!(backend.snapshot().expect("snapshot").database("shop").is_none());
    // the same names can be created afterwards
    backend.insert_documents("shop", "c", &[(1, document.clone())]).expect("insert");
    let read = backend.read_documents("shop", "c", &dids(&[1])).expect("read");
    assert_eq!(read.get(&1), Some(&document));
}

#[test]
fn file_store_survives_reopening() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("store.db");
    let documents = people();
    {
        let backend = Backend::open_path(&path).expect("db");
        assert!(!backend.is_in_memory());
        backend.insert_documents("shop", "people", &documents).expect("insert");
    }
    let backend = Backend::open_path(&path).expect("reopen");
    let snapshot = backend.snapshot().expect("snapshot");
    let collection = snapshot.collection("shop", "people").expect("collection");
    assert_eq!(
        collection.doc_part(&TableRef::root().child("tags")).map(|doc_part| doc_part.last_rid()),
        Some(2)
    );
    let read = backend.read_documents("shop", "people", &dids(&[1, 2, 3])).expect("read");
    let expected: BTreeMap<u64, Document> = documents.into_iter().collect();
    assert_eq!(read, expected);
    backend
        .insert_documents("shop", "people", &[(4, doc(r#"{"tags": ["d"]}"#))])
        .expect("insert");
}

#[test]
fn import_mode_defers_internal_indexes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("import.db");
    let config = StoreConfig {
        data_import_mode: true,
        worker_threads: 2,
        ..StoreConfig::with_path(&path)
    };
    let backend = Backend::open(config).expect("db");
    assert!(backend.is_data_import_mode());
    backend.insert_documents("shop", "people", &people()).expect("insert");
    assert!(!index_names(&path).iter().any(|name| name.ends_with("_did_idx")));

    backend.set_data_import_mode(false).expect("finish import");
    assert!(!backend.is_data_import_mode());
    let names = index_names(&path);
    for table in ["people_tags", "people_address", "people_pets", "people_pets_names"] {
        assert!(names.contains(&format!("shop.{}_did_idx", table)), "{} in {:?}", table, names);
        assert!(names.contains(&format!("shop.{}_pid_idx", table)), "{} in {:?}", table, names);
    }
    // new document parts get their indexes right away again
    backend
        .insert_documents("shop", "people", &[(4, doc(r#"{"extra": {"x": 1}}"#))])
        .expect("insert");
    assert!(index_names(&path).contains(&String::from("shop.people_extra_did_idx")));
}

#[test]
fn sizes_of_unknown_names_are_zero() {
    let backend = Backend::open_in_memory().expect("db");
    let (database, collection) = backend
        .with_read_retry(|transaction| {
            Ok((transaction.database_size("none")?, transaction.collection_size("none", "c")?))
        })
        .expect("sizes");
    assert_eq!(database, Some(0));
    assert_eq!(collection, Some(0));
}

#[test]
fn rendering_only_dialects_cannot_be_opened() {
    let config = StoreConfig {
        dialect: DialectKind::Postgres,
        ..StoreConfig::in_memory()
    };
    assert!(matches!(Backend::open(config), Err(DocShredError::Unsupported(_))));
}
