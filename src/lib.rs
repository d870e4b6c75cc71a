//! Docshred – stores schemaless documents in SQL tables derived from their shape.
//!
//! A document is an ordered set of named values where a value may itself be
//! a document or an array. Docshred shreds every document into rows:
//! * The top level of a collection becomes the *root* table, keyed by the
//!   caller-supplied document identifier (`did`).
//! * Every nested object or array path becomes a *document part* (a
//!   [`reference::TableRef`]) with its own table. Rows of a document part carry
//!   `did`, their own row identifier `rid`, the `rid` of their parent row
//!   (`pid`) and, for array elements, their position (`seq`).
//! * A field becomes a column per type it was seen with, named after the field
//!   and suffixed with a one-letter type code. A field holding an object or an
//!   array gets a `Child` column whose value tells which of the two it was.
//! * Arrays of arrays collapse into array dimensions (`$2`, `$3`, ...) of the
//!   same document part instead of ever deeper table nesting.
//!
//! The shape of what has been stored is kept as metadata, a tree of
//! databases, collections, document parts, fields, scalars and indexes (see
//! [`meta`]). Metadata grows on demand: inserting a document with an unseen
//! field adds the column within the same transaction.
//!
//! ## Modules
//! * [`document`] – documents and their values.
//! * [`reference`], [`translate`], [`identifier`] – paths, table names and
//!   identifiers accepted by the backend.
//! * [`d2r`], [`collection_data`] – the document visitor and the rows it produces.
//! * [`r2d`] – reassembly of documents from rows.
//! * [`meta`], [`mutable`], [`repository`] – the committed metadata, the
//!   per-transaction overlay and the shared repository they merge into.
//! * [`rid`] – blocks of row identifiers.
//! * [`dialect`], [`sqlite`], [`postgres`] – what each SQL backend renders.
//! * [`handler`] – classification of backend failures and retries.
//! * [`persist`] – the metadata tables.
//! * [`backend`], [`transaction`], [`pool`] – the SQLite store itself.
//! * [`plan`] – statements rendered without executing them.
//!
//! ## Quick Start
//! ```
//! use docshred::backend::Backend;
//! use docshred::document::{Document, Value};
//! use roaring::RoaringTreemap;
//!
//! let backend = Backend::open_in_memory().unwrap();
//! let document = Document::from_json_str(r#"{"name": "Alice", "tags": ["a", "b"]}"#).unwrap();
//! backend.insert_documents("shop", "people", &[(1, document.clone())]).unwrap();
//! let dids: RoaringTreemap = [1u64].into_iter().collect();
//! let read = backend.read_documents("shop", "people", &dids).unwrap();
//! assert_eq!(read.get(&1), Some(&document));
//! ```

pub mod backend;
pub mod collection_data;
pub mod config;
pub mod d2r;
pub mod datatype;
pub mod dialect;
pub mod document;
pub mod error;
pub mod handler;
pub mod identifier;
pub mod meta;
pub mod mutable;
pub mod persist;
pub mod plan;
pub mod pool;
pub mod postgres;
pub mod r2d;
pub mod reference;
pub mod repository;
pub mod rid;
pub mod sqlite;
pub mod transaction;
pub mod translate;
