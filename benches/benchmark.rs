use std::hint::black_box;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};

// used for the did sets handed to reads
use roaring::RoaringTreemap;

use docshred::backend::Backend;
use docshred::collection_data::{CollectionData, D2RTranslator};
use docshred::dialect::SqlDialect;
use docshred::document::{Document, Value};
use docshred::identifier::IdentifierFactory;
use docshred::meta::MetaSnapshot;
use docshred::mutable::MutableMetaSnapshot;
use docshred::r2d::{R2DTranslator, stored_parts};
use docshred::rid::InMemoryRidGenerator;
use docshred::sqlite::SqliteDialect;

fn order(did: u64) -> Document {
    let lines: Vec<Value> = (0..5)
        .map(|line| {
            Value::Document(
                Document::new()
                    .with("sku", Value::String(format!("sku-{}", line)))
                    .with("qty", Value::Integer(line + 1))
                    .with("tags", Value::Array(vec![Value::String(String::from("x")), Value::Null])),
            )
        })
        .collect();
    Document::new()
        .with("customer", Value::String(format!("customer-{}", did % 97)))
        .with("total", Value::Double(did as f64 * 1.5))
        .with("address", Value::Document(Document::new().with("city", Value::String(String::from("Oslo")))))
        .with("lines", Value::Array(lines))
        .with("matrix", Value::Array(vec![Value::Array(vec![Value::Integer(1), Value::Integer(2)])]))
}

fn translate(factory: &IdentifierFactory, documents: &[(u64, Document)]) -> CollectionData {
    let base = MetaSnapshot::new();
    let mut overlay = MutableMetaSnapshot::new(&base);
    let mut db = overlay.get_or_create_database("shop", factory).expect("database");
    let mut collection = db.get_or_create_collection("orders", factory).expect("collection");
    let mut data = D2RTranslator::new(factory)
        .translate(&mut collection, documents.iter().map(|(did, document)| (*did, document)))
        .expect("translate");
    data.assign_rids(&InMemoryRidGenerator::new()).expect("rids");
    data
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let dialect = SqliteDialect::new().expect("dialect");
    let factory = IdentifierFactory::new(dialect.identifier_constraints());
    for count in [1u64, 100, 1000] {
        let documents: Vec<(u64, Document)> = (1..=count).map(|did| (did, order(did))).collect();
        c.bench_function(&format!("translate {}", count), |b| {
            b.iter(|| translate(&factory, black_box(&documents)))
        });
        let parts = stored_parts(&translate(&factory, &documents)).expect("stored");
        c.bench_function(&format!("reassemble {}", count), |b| {
            b.iter(|| R2DTranslator::new(black_box(&parts)).translate().expect("reassemble"))
        });
    }

    let documents: Vec<(u64, Document)> = (1..=100).map(|did| (did, order(did))).collect();
    c.bench_function("insert 100", |b| {
        b.iter_batched(
            || Backend::open_in_memory().expect("db"),
            |backend| backend.insert_documents("shop", "orders", &documents).expect("insert"),
            BatchSize::PerIteration,
        )
    });
    let backend = Backend::open_in_memory().expect("db");
    backend.insert_documents("shop", "orders", &documents).expect("insert");
    let dids: RoaringTreemap = (1..=100).collect();
    c.bench_function("read 100", |b| {
        b.iter(|| backend.read_documents("shop", "orders", black_box(&dids)).expect("read"))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
