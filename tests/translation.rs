use docshred::collection_data::{CollectionData, ColumnKey, D2RTranslator, DocPartData};
use docshred::datatype::FieldType;
use docshred::dialect::SqlDialect;
use docshred::document::{Document, Value};
use docshred::identifier::IdentifierFactory;
use docshred::meta::MetaSnapshot;
use docshred::mutable::MutableMetaSnapshot;
use docshred::r2d::{R2DTranslator, stored_parts};
use docshred::reference::TableRef;
use docshred::rid::{InMemoryRidGenerator, RidGenerator};
use docshred::sqlite::SqliteDialect;

fn factory() -> IdentifierFactory {
    let dialect = SqliteDialect::new().expect("dialect");
    IdentifierFactory::new(dialect.identifier_constraints())
}

fn translate(collection: &str, documents: &[(u64, Document)]) -> (MutableMetaSnapshot, CollectionData) {
    let factory = factory();
    let base = MetaSnapshot::new();
    let mut overlay = MutableMetaSnapshot::new(&base);
    let mut data = {
        let mut db = overlay.get_or_create_database("shop", &factory).expect("database");
        let mut target = db.get_or_create_collection(collection, &factory).expect("collection");
        D2RTranslator::new(&factory)
            .translate(&mut target, documents.iter().map(|(did, document)| (*did, document)))
            .expect("translate")
    };
    data.assign_rids(&InMemoryRidGenerator::new()).expect("rids");
    (overlay, data)
}

fn doc(json: &str) -> Document {
    Document::from_json_str(json).expect("json")
}

fn column_identifier(part: &DocPartData, key: &ColumnKey, field_type: FieldType) -> String {
    let position = part.position(key, field_type).expect("column");
    part.columns()[position].identifier().to_string()
}

fn field(name: &str) -> ColumnKey {
    ColumnKey::Field(name.to_string())
}

#[test]
fn flat_document_becomes_one_root_row() {
    let (_, data) = translate("people", &[(1, doc(r#"{"a": 1}"#))]);
    assert_eq!(data.doc_parts().len(), 1);
    let root = data.doc_part(&TableRef::root()).expect("root");
    assert!(root.is_root());
    assert_eq!(root.identifier(), "people");
    assert_eq!(root.len(), 1);
    assert_eq!(column_identifier(root, &field("a"), FieldType::Integer), "a_i");
    let position = root.position(&field("a"), FieldType::Integer).expect("column");
    let row = &root.rows()[0];
    assert_eq!(row.did(), 1);
    assert_eq!(row.rid(), Some(1));
    assert_eq!(row.pid(), None);
    assert_eq!(row.seq(), None);
    assert_eq!(row.value(position), Some(&Value::Integer(1)));
}

#[test]
fn scalar_array_goes_to_a_child_part() {
    let (_, data) = translate("people", &[(1, doc(r#"{"a": [1, 2]}"#))]);
    let root = data.doc_part(&TableRef::root()).expect("root");
    assert_eq!(column_identifier(root, &field("a"), FieldType::Child), "a_e");
    let marker = root.position(&field("a"), FieldType::Child).expect("marker");
    assert_eq!(root.rows()[0].value(marker), Some(&Value::Boolean(true)));

    let part = data.doc_part(&TableRef::root().child("a")).expect("array part");
    assert_eq!(part.identifier(), "people_a");
    assert_eq!(column_identifier(part, &ColumnKey::Scalar, FieldType::Integer), "v_i");
    let scalar = part.position(&ColumnKey::Scalar, FieldType::Integer).expect("scalar");
    let rows: Vec<(Option<u32>, Option<u64>, Option<&Value>)> = part
        .rows()
        .iter()
        .map(|row| (row.seq(), row.pid(), row.value(scalar)))
        .collect();
    assert_eq!(
        rows,
        vec![
            (Some(0), Some(1), Some(&Value::Integer(1))),
            (Some(1), Some(1), Some(&Value::Integer(2))),
        ]
    );
}

#[test]
fn nested_document_is_a_row_without_seq() {
    let (_, data) = translate("people", &[(7, doc(r#"{"address": {"city": "Oslo"}}"#))]);
    let root = data.doc_part(&TableRef::root()).expect("root");
    let marker = root.position(&field("address"), FieldType::Child).expect("marker");
    assert_eq!(root.rows()[0].value(marker), Some(&Value::Boolean(false)));
    let part = data.doc_part(&TableRef::root().child("address")).expect("object part");
    assert_eq!(part.identifier(), "people_address");
    assert_eq!(part.len(), 1);
    assert_eq!(part.rows()[0].seq(), None);
    assert_eq!(part.rows()[0].pid(), Some(7));
    assert_eq!(column_identifier(part, &field("city"), FieldType::String), "city_s");
}

#[test]
fn arrays_of_arrays_collapse_into_dimensions() {
    let (_, data) = translate("c", &[(1, doc(r#"{"m": [[1, 2], [3]]}"#))]);
    let outer = data.doc_part(&TableRef::root().child("m")).expect("outer");
    assert_eq!(outer.len(), 2);
    let marker = outer.position(&ColumnKey::Scalar, FieldType::Child).expect("marker");
    assert!(outer.rows().iter().all(|row| row.value(marker) == Some(&Value::Boolean(true))));

    let inner_ref = TableRef::root().child("m").array_child();
    let inner = data.doc_part(&inner_ref).expect("inner");
    assert_eq!(inner.identifier(), "c_m$2");
    assert_eq!(inner.len(), 3);
    let outer_rids: Vec<Option<u64>> = outer.rows().iter().map(|row| row.rid()).collect();
    let inner_pids: Vec<Option<u64>> = inner.rows().iter().map(|row| row.pid()).collect();
    assert_eq!(inner_pids, vec![outer_rids[0], outer_rids[0], outer_rids[1]]);
    let seqs: Vec<Option<u32>> = inner.rows().iter().map(|row| row.seq()).collect();
    assert_eq!(seqs, vec![Some(0), Some(1), Some(0)]);
    // deeper nesting keeps counting dimensions instead of nesting tables
    let (_, deeper) = translate("c", &[(1, doc(r#"{"m": [[[1]]]}"#))]);
    let third = deeper.doc_part(&inner_ref.array_child()).expect("third dimension");
    assert_eq!(third.identifier(), "c_m$3");
}

#[test]
fn empty_array_creates_no_part() {
    let (overlay, data) = translate("c", &[(1, doc(r#"{"a": [], "b": 1}"#))]);
    assert_eq!(data.doc_parts().len(), 1);
    let root = data.doc_part(&TableRef::root()).expect("root");
    let marker = root.position(&field("a"), FieldType::Child).expect("marker");
    assert_eq!(root.rows()[0].value(marker), Some(&Value::Boolean(true)));
    let collection = overlay.snapshot().collection("shop", "c").expect("collection");
    assert!(collection.doc_part(&TableRef::root().child("a")).is_none());
}

#[test]
fn null_is_stored_as_a_marker() {
    let (_, data) = translate("c", &[(1, doc(r#"{"gone": null}"#))]);
    let root = data.doc_part(&TableRef::root()).expect("root");
    assert_eq!(column_identifier(root, &field("gone"), FieldType::Null), "gone_n");
    let parts = stored_parts(&data).expect("stored");
    let documents = R2DTranslator::new(&parts).translate().expect("reassemble");
    assert_eq!(documents.get(&1).and_then(|d| d.get("gone")), Some(&Value::Null));
}

#[test]
fn one_field_with_two_types_gets_two_columns() {
    let (overlay, _) = translate("c", &[(1, doc(r#"{"k": 1}"#)), (2, doc(r#"{"k": "one"}"#))]);
    let collection = overlay.snapshot().collection("shop", "c").expect("collection");
    let root = collection.doc_part(&TableRef::root()).expect("root");
    let mut identifiers: Vec<&str> = root.fields_named("k").map(|field| field.identifier()).collect();
    identifiers.sort();
    assert_eq!(identifiers, vec!["k_i", "k_s"]);
}

#[test]
fn reserved_and_colliding_names_are_escaped() {
    // "v_i" is the integer scalar column
    let (_, data) = translate("c", &[(1, doc(r#"{"v": 1, "Name": "x", "na me": "y"}"#))]);
    let root = data.doc_part(&TableRef::root()).expect("root");
    assert_eq!(column_identifier(root, &field("v"), FieldType::Integer), "_v_i");
    assert_eq!(column_identifier(root, &field("Name"), FieldType::String), "name_s");
    let second = column_identifier(root, &field("na me"), FieldType::String);
    assert_eq!(second, "na_me_s");

    let (overlay, _) = translate("c", &[(1, doc(r#"{"a_b": {"x": 1}, "a": {"b": {"y": 1}}}"#))]);
    let collection = overlay.snapshot().collection("shop", "c").expect("collection");
    let flat = collection.doc_part(&TableRef::root().child("a_b")).expect("a_b");
    let nested = collection.doc_part(&TableRef::root().child("a").child("b")).expect("a.b");
    assert_eq!(flat.identifier(), "c_a_b");
    assert_ne!(nested.identifier(), flat.identifier());
    assert!(nested.identifier().starts_with("c_a_b_"));
}

#[test]
fn rows_of_many_documents_share_parts() {
    let documents = vec![
        (1, doc(r#"{"tags": ["x"]}"#)),
        (2, doc(r#"{"tags": ["y", "z"]}"#)),
        (3, doc(r#"{"other": true}"#)),
    ];
    let (_, data) = translate("c", &documents);
    let tags = data.doc_part(&TableRef::root().child("tags")).expect("tags");
    let rids: Vec<Option<u64>> = tags.rows().iter().map(|row| row.rid()).collect();
    assert_eq!(rids, vec![Some(0), Some(1), Some(2)]);
    let pids: Vec<Option<u64>> = tags.rows().iter().map(|row| row.pid()).collect();
    assert_eq!(pids, vec![Some(1), Some(2), Some(2)]);
    assert_eq!(data.row_count(), 6);
}

#[test]
fn documents_survive_the_trip_through_rows() {
    let documents = vec![
        (1, doc(r#"{"name": "Alice", "tags": ["a", "b"], "address": {"city": "Oslo", "zip": [1, [2, 3]]}}"#)),
        (2, doc(r#"{"items": [{"sku": "x", "qty": 2}, [], [[true]], null, {}], "empty": {}}"#)),
        (3, doc(r#"{"when": {"$date": "2024-01-02T03:04:05Z"}, "big": {"$long": "9000000000"}}"#)),
    ];
    let (_, data) = translate("orders", &documents);
    let parts = stored_parts(&data).expect("stored");
    let rebuilt = R2DTranslator::new(&parts).translate().expect("reassemble");
    assert_eq!(rebuilt.len(), documents.len());
    for (did, document) in &documents {
        assert_eq!(rebuilt.get(did), Some(document), "document {}", did);
    }
}

#[test]
fn renamed_counters_keep_the_larger_value() {
    let generator = InMemoryRidGenerator::new();
    let tags = TableRef::root().child("tags");
    assert_eq!(generator.consume_rids("a", "x", &tags, 5).expect("rids").first(), 0);
    generator.seed("b", "y", &tags, 3).expect("seed");
    generator.rebase(("a", "x"), ("b", "y")).expect("rebase");
    assert_eq!(generator.last_rid("a", "x", &tags).expect("last"), 0);
    assert_eq!(generator.last_rid("b", "y", &tags).expect("last"), 5);
    // a target already past the source stays where it is
    generator.seed("c", "z", &tags, 9).expect("seed");
    generator.seed("a", "x", &tags, 2).expect("seed");
    generator.rebase(("a", "x"), ("c", "z")).expect("rebase");
    assert_eq!(generator.consume_rids("c", "z", &tags, 1).expect("rids").first(), 9);
    assert_eq!(generator.consume_rids("b", "y", &tags, 1).expect("rids").first(), 5);
}
