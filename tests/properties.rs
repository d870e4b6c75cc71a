use proptest::prelude::*;

use docshred::collection_data::{CollectionData, D2RTranslator};
use docshred::dialect::SqlDialect;
use docshred::document::{Document, Value};
use docshred::identifier::IdentifierFactory;
use docshred::meta::MetaSnapshot;
use docshred::mutable::MutableMetaSnapshot;
use docshred::r2d::{R2DTranslator, stored_parts};
use docshred::rid::InMemoryRidGenerator;
use docshred::sqlite::SqliteDialect;

fn translate(documents: &[(u64, Document)]) -> CollectionData {
    let dialect = SqliteDialect::new().expect("dialect");
    let factory = IdentifierFactory::new(dialect.identifier_constraints());
    let base = MetaSnapshot::new();
    let mut overlay = MutableMetaSnapshot::new(&base);
    let mut db = overlay.get_or_create_database("db", &factory).expect("database");
    let mut collection = db.get_or_create_collection("things", &factory).expect("collection");
    let mut data = D2RTranslator::new(&factory)
        .translate(&mut collection, documents.iter().map(|(did, document)| (*did, document)))
        .expect("translate");
    data.assign_rids(&InMemoryRidGenerator::new()).expect("rids");
    data
}

fn document_of(entries: Vec<(String, Value)>) -> Document {
    let mut document = Document::new();
    for (key, value) in entries {
        document.insert(key, value);
    }
    document
}

// few distinct keys, so that fields meet values of several types
fn key() -> impl Strategy<Value = String> {
    prop_oneof![Just("a"), Just("b"), Just("Big Key"), Just("v"), Just("did")].prop_map(String::from)
}

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Boolean),
        any::<i32>().prop_map(Value::Integer),
        any::<i64>().prop_map(Value::Long),
        (-1.0e9f64..1.0e9).prop_map(Value::Double),
        prop_oneof![Just(f64::NAN), Just(f64::INFINITY), Just(f64::NEG_INFINITY), Just(-0.0)].prop_map(Value::Double),
        "[a-z ]{0,8}".prop_map(Value::String),
        prop::collection::vec(any::<u8>(), 0..6).prop_map(Value::Binary),
    ]
}

fn value() -> impl Strategy<Value = Value> {
    scalar().prop_recursive(4, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::vec((key(), inner), 0..4).prop_map(|entries| Value::Document(document_of(entries))),
        ]
    })
}

fn document() -> impl Strategy<Value = Document> {
    prop::collection::vec((key(), value()), 0..5).prop_map(document_of)
}

fn documents() -> impl Strategy<Value = Vec<(u64, Document)>> {
    prop::collection::vec(document(), 1..6).prop_map(|documents| {
        documents
            .into_iter()
            .enumerate()
            .map(|(position, document)| (position as u64 + 1, document))
            .collect()
    })
}

proptest! {
    #[test]
    fn reassembly_returns_the_stored_documents(documents in documents()) {
        let data = translate(&documents);
        let parts = stored_parts(&data).expect("stored");
        let rebuilt = R2DTranslator::new(&parts).translate().expect("reassemble");
        prop_assert_eq!(rebuilt.len(), documents.len());
        for (did, document) in &documents {
            prop_assert_eq!(rebuilt.get(did), Some(document));
        }
    }

    #[test]
    fn translation_is_deterministic(documents in documents()) {
        let shape = |data: &CollectionData| -> Vec<(String, String, usize, Vec<String>)> {
            data.doc_parts()
                .iter()
                .map(|part| {
                    (
                        part.table_ref().to_string(),
                        part.identifier().to_string(),
                        part.len(),
                        part.columns().iter().map(|column| column.identifier().to_string()).collect(),
                    )
                })
                .collect()
        };
        prop_assert_eq!(shape(&translate(&documents)), shape(&translate(&documents)));
    }

    #[test]
    fn identifiers_are_unique_and_well_formed(documents in documents()) {
        let data = translate(&documents);
        let mut tables: Vec<&str> = data.doc_parts().iter().map(|part| part.identifier()).collect();
        tables.sort();
        tables.dedup();
        prop_assert_eq!(tables.len(), data.doc_parts().len());
        for part in data.doc_parts() {
            let mut columns: Vec<&str> = part.columns().iter().map(|column| column.identifier()).collect();
            for column in &columns {
                prop_assert!(column.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$'));
            }
            columns.sort();
            columns.dedup();
            prop_assert_eq!(columns.len(), part.columns().len());
        }
    }
}
